//! Columnar stream decoder
//!
//! `StreamDecoder` owns the raw byte payload of one query result and
//! materializes a logical schema followed by record batches. Metadata
//! headers are parsed through the interchange format's generated
//! FlatBuffers readers, whose structural verifier runs before any field
//! access; body buffers are sliced out of the refcounted payload, so
//! decoded columns stay valid after the decoder is dropped.

use arrow_ipc as ipc;
use bytes::Bytes;
use cubesql_common::{
    Bitmap, Column, CubeError, Field, LogicalType, RecordBatch, Result, Schema,
};
use tracing::{debug, trace};

use crate::ipc::convert::convert_field;
use crate::ipc::CONTINUATION_MARKER;

#[derive(Debug)]
pub struct StreamDecoder {
    buffer: Bytes,
    offset: usize,
    schema: Schema,
    finished: bool,
    failed: bool,
}

impl StreamDecoder {
    /// Parse the stream's leading schema message and position the cursor on
    /// the first record batch.
    pub fn new(buffer: Bytes) -> Result<Self> {
        if buffer.len() < 8 {
            return Err(CubeError::InvalidData(
                "columnar stream too short for a message header".into(),
            ));
        }

        let continuation = read_u32_le(&buffer, 0);
        if continuation != CONTINUATION_MARKER {
            return Err(CubeError::InvalidData(format!(
                "invalid continuation marker 0x{continuation:08X}"
            )));
        }
        let metadata_len = read_u32_le(&buffer, 4) as usize;
        if metadata_len == 0 {
            return Err(CubeError::InvalidData(
                "columnar stream begins with an end-of-stream marker".into(),
            ));
        }
        if 8 + metadata_len > buffer.len() {
            return Err(CubeError::InvalidData(
                "schema metadata extends past end of stream".into(),
            ));
        }

        let message = ipc::root_as_message(&buffer[8..8 + metadata_len])
            .map_err(|e| CubeError::InvalidData(format!("metadata verification failed: {e}")))?;
        if message.header_type() != ipc::MessageHeader::Schema {
            return Err(CubeError::InvalidData(format!(
                "first stream message must be a schema, got {:?}",
                message.header_type()
            )));
        }
        let fb_schema = message
            .header_as_schema()
            .ok_or_else(|| CubeError::InvalidData("schema message has no schema header".into()))?;
        let fb_fields = fb_schema
            .fields()
            .ok_or_else(|| CubeError::InvalidData("schema message has no field list".into()))?;

        let fields: Vec<Field> = fb_fields.iter().map(|f| convert_field(&f)).collect();
        let schema = Schema::new(fields);
        debug!(fields = schema.len(), "columnar schema initialized");

        Ok(Self {
            buffer,
            offset: align8(8 + metadata_len),
            schema,
            finished: false,
            failed: false,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Decode the next record batch, or `None` at end of stream.
    ///
    /// End of stream is reached at end of buffer or at an explicit marker
    /// (continuation followed by a zero metadata length) and is sticky:
    /// every later call returns `None`. A decode error is terminal the
    /// other way: the decoder answers all further pulls with the failure.
    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        if self.failed {
            return Err(CubeError::InvalidData(
                "stream decoder is in a failed state".into(),
            ));
        }
        if self.finished {
            return Ok(None);
        }
        if self.offset + 8 > self.buffer.len() {
            self.finished = true;
            return Ok(None);
        }

        let result = self.next_batch_inner();
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn next_batch_inner(&mut self) -> Result<Option<RecordBatch>> {
        let continuation = read_u32_le(&self.buffer, self.offset);
        if continuation != CONTINUATION_MARKER {
            return Err(CubeError::InvalidData(format!(
                "invalid continuation marker 0x{continuation:08X}"
            )));
        }
        let metadata_len = read_u32_le(&self.buffer, self.offset + 4) as usize;
        if metadata_len == 0 {
            trace!("end-of-stream marker");
            self.finished = true;
            return Ok(None);
        }

        let metadata_start = self.offset + 8;
        if metadata_start + metadata_len > self.buffer.len() {
            return Err(CubeError::InvalidData(
                "record batch metadata extends past end of stream".into(),
            ));
        }

        let message = ipc::root_as_message(&self.buffer[metadata_start..metadata_start + metadata_len])
            .map_err(|e| CubeError::InvalidData(format!("metadata verification failed: {e}")))?;
        if message.header_type() != ipc::MessageHeader::RecordBatch {
            return Err(CubeError::InvalidData(format!(
                "expected a record batch message, got {:?}",
                message.header_type()
            )));
        }
        let batch = message.header_as_record_batch().ok_or_else(|| {
            CubeError::InvalidData("record batch message has no batch header".into())
        })?;
        if batch.compression().is_some() {
            return Err(CubeError::InvalidData(
                "compressed record batches are not supported".into(),
            ));
        }

        let rows = usize::try_from(batch.length())
            .map_err(|_| CubeError::InvalidData("negative record batch length".into()))?;
        let body_len = usize::try_from(message.bodyLength())
            .map_err(|_| CubeError::InvalidData("negative record batch body length".into()))?;
        let body_start = align8(metadata_start + metadata_len);
        if body_start + body_len > self.buffer.len() {
            return Err(CubeError::InvalidData(
                "record batch body extends past end of stream".into(),
            ));
        }

        let descriptors: Vec<(i64, i64)> = batch
            .buffers()
            .map(|buffers| buffers.iter().map(|b| (b.offset(), b.length())).collect())
            .unwrap_or_default();

        let mut next_descriptor = 0usize;
        let mut columns = Vec::with_capacity(self.schema.len());
        for field in self.schema.fields() {
            columns.push(self.build_column(
                field,
                rows,
                &descriptors,
                &mut next_descriptor,
                body_start,
                body_len,
            )?);
        }
        if next_descriptor != descriptors.len() {
            return Err(CubeError::InvalidData(format!(
                "buffer descriptor count mismatch: schema consumes {next_descriptor}, batch declares {}",
                descriptors.len()
            )));
        }

        self.offset = body_start + align8(body_len);
        trace!(rows, "record batch decoded");
        Ok(Some(RecordBatch::new(rows, columns)))
    }

    fn build_column(
        &self,
        field: &Field,
        rows: usize,
        descriptors: &[(i64, i64)],
        next_descriptor: &mut usize,
        body_start: usize,
        body_len: usize,
    ) -> Result<Column> {
        let ty = &field.logical_type;
        let Some(buffer_count) = ty.buffer_count() else {
            return Err(CubeError::InvalidData(format!(
                "column '{}' has unsupported type {ty:?}",
                field.name
            )));
        };
        if *next_descriptor + buffer_count > descriptors.len() {
            return Err(CubeError::InvalidData(format!(
                "record batch declares too few buffers for column '{}'",
                field.name
            )));
        }
        let mut take = || {
            let descriptor = descriptors[*next_descriptor];
            *next_descriptor += 1;
            descriptor
        };

        // Validity comes first for every layout; a zero-length descriptor
        // means the column has no nulls.
        let validity_descriptor = take();
        let validity = if validity_descriptor.1 == 0 {
            None
        } else {
            let bits = self.body_slice(validity_descriptor, body_start, body_len)?;
            if bits.len() * 8 < rows {
                return Err(CubeError::InvalidData(format!(
                    "validity bitmap too short for column '{}'",
                    field.name
                )));
            }
            Some(Bitmap::new(bits, rows))
        };

        if ty.is_variable() {
            let offsets = self.body_slice(take(), body_start, body_len)?;
            let values = self.body_slice(take(), body_start, body_len)?;
            let column = build_variable_column(field, rows, validity, offsets, values)?;
            return Ok(column);
        }

        if *ty == LogicalType::Bool {
            let values = self.body_slice(take(), body_start, body_len)?;
            if values.len() * 8 < rows {
                return Err(CubeError::InvalidData(format!(
                    "value bitmap too short for bool column '{}'",
                    field.name
                )));
            }
            return Ok(Column::new(ty.clone(), rows, validity, vec![values]));
        }

        let width = ty.fixed_width().ok_or_else(|| {
            CubeError::InvalidData(format!(
                "column '{}' has no fixed-width layout: {ty:?}",
                field.name
            ))
        })?;
        let values = self.body_slice(take(), body_start, body_len)?;
        let needed = rows.checked_mul(width).ok_or_else(|| {
            CubeError::InvalidData(format!("row count overflow for column '{}'", field.name))
        })?;
        if values.len() < needed {
            return Err(CubeError::InvalidData(format!(
                "values buffer too short for column '{}': {} bytes for {rows} rows of width {width}",
                field.name,
                values.len()
            )));
        }
        Ok(Column::new(ty.clone(), rows, validity, vec![values]))
    }

    fn body_slice(
        &self,
        (offset, length): (i64, i64),
        body_start: usize,
        body_len: usize,
    ) -> Result<Bytes> {
        if offset < 0 || length < 0 {
            return Err(CubeError::InvalidData(
                "negative buffer descriptor bounds".into(),
            ));
        }
        let (offset, length) = (offset as usize, length as usize);
        if offset + length > body_len {
            return Err(CubeError::InvalidData(format!(
                "buffer descriptor out of range: offset {offset} length {length} in body of {body_len}"
            )));
        }
        Ok(self
            .buffer
            .slice(body_start + offset..body_start + offset + length))
    }
}

fn build_variable_column(
    field: &Field,
    rows: usize,
    validity: Option<Bitmap>,
    offsets: Bytes,
    values: Bytes,
) -> Result<Column> {
    let needed = rows
        .checked_add(1)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| {
            CubeError::InvalidData(format!("row count overflow for column '{}'", field.name))
        })?;
    if offsets.len() < needed {
        return Err(CubeError::InvalidData(format!(
            "offsets buffer too short for column '{}'",
            field.name
        )));
    }

    let offset_at = |i: usize| read_u32_le(&offsets, i * 4) as i32;
    let mut previous = offset_at(0);
    if previous != 0 {
        return Err(CubeError::InvalidData(format!(
            "offsets for column '{}' must start at zero",
            field.name
        )));
    }
    for row in 1..=rows {
        let current = offset_at(row);
        if current < previous {
            return Err(CubeError::InvalidData(format!(
                "offsets for column '{}' are not monotonically non-decreasing at row {row}",
                field.name
            )));
        }
        previous = current;
    }
    if previous as usize > values.len() {
        return Err(CubeError::InvalidData(format!(
            "offsets for column '{}' exceed the values buffer ({previous} > {})",
            field.name,
            values.len()
        )));
    }

    let column = Column::new(
        field.logical_type.clone(),
        rows,
        validity,
        vec![offsets, values],
    );

    if field.logical_type == LogicalType::Utf8 {
        for row in 0..rows {
            if column.is_valid(row) && column.str_at(row).is_none() {
                return Err(CubeError::InvalidData(format!(
                    "invalid utf-8 in string column '{}' at row {row}",
                    field.name
                )));
            }
        }
    }

    Ok(column)
}

#[inline]
fn align8(offset: usize) -> usize {
    (offset + 7) & !7
}

#[inline]
fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
