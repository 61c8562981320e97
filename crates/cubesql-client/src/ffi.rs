//! Columnar-interchange C ABI export
//!
//! Exposes a `BatchStream` through the standard C data interface: a
//! `get_schema`/`get_next`/`release` callback triple over `repr(C)` structs.
//! Exported schemas are deep copies; exported arrays hand ownership of
//! their backing buffers to the consumer through `private_data`, freed by
//! the release callback. End of stream is signalled by clearing the out
//! array's `release` pointer and returning 0, repeatably.
//!
//! Buffer pointers in exported arrays point into the refcounted query
//! payload and stay valid until the owning array's release callback runs.

use std::ffi::{c_char, c_int, c_void, CString};
use std::ptr;

use cubesql_common::{Column, CubeError, Field, LogicalType, RecordBatch, Result, Schema, TimeUnit};

use crate::stream::BatchStream;

/// `ArrowSchema.flags` bit marking a nullable field.
pub const ARROW_FLAG_NULLABLE: i64 = 2;

const EIO: c_int = 5;
const EINVAL: c_int = 22;

#[repr(C)]
pub struct ArrowSchema {
    pub format: *const c_char,
    pub name: *const c_char,
    pub metadata: *const c_char,
    pub flags: i64,
    pub n_children: i64,
    pub children: *mut *mut ArrowSchema,
    pub dictionary: *mut ArrowSchema,
    pub release: Option<unsafe extern "C" fn(*mut ArrowSchema)>,
    pub private_data: *mut c_void,
}

#[repr(C)]
pub struct ArrowArray {
    pub length: i64,
    pub null_count: i64,
    pub offset: i64,
    pub n_buffers: i64,
    pub n_children: i64,
    pub buffers: *mut *const c_void,
    pub children: *mut *mut ArrowArray,
    pub dictionary: *mut ArrowArray,
    pub release: Option<unsafe extern "C" fn(*mut ArrowArray)>,
    pub private_data: *mut c_void,
}

#[repr(C)]
pub struct ArrowArrayStream {
    pub get_schema:
        Option<unsafe extern "C" fn(*mut ArrowArrayStream, *mut ArrowSchema) -> c_int>,
    pub get_next: Option<unsafe extern "C" fn(*mut ArrowArrayStream, *mut ArrowArray) -> c_int>,
    pub get_last_error: Option<unsafe extern "C" fn(*mut ArrowArrayStream) -> *const c_char>,
    pub release: Option<unsafe extern "C" fn(*mut ArrowArrayStream)>,
    pub private_data: *mut c_void,
}

impl ArrowSchema {
    /// A zeroed struct ready to be filled by a producer.
    pub fn empty() -> Self {
        Self {
            format: ptr::null(),
            name: ptr::null(),
            metadata: ptr::null(),
            flags: 0,
            n_children: 0,
            children: ptr::null_mut(),
            dictionary: ptr::null_mut(),
            release: None,
            private_data: ptr::null_mut(),
        }
    }
}

impl ArrowArray {
    pub fn empty() -> Self {
        Self {
            length: 0,
            null_count: 0,
            offset: 0,
            n_buffers: 0,
            n_children: 0,
            buffers: ptr::null_mut(),
            children: ptr::null_mut(),
            dictionary: ptr::null_mut(),
            release: None,
            private_data: ptr::null_mut(),
        }
    }
}

impl ArrowArrayStream {
    pub fn empty() -> Self {
        Self {
            get_schema: None,
            get_next: None,
            get_last_error: None,
            release: None,
            private_data: ptr::null_mut(),
        }
    }
}

/// Hand a `BatchStream` to a C consumer. The stream is owned by the
/// exported struct and freed by its release callback.
pub fn export_stream(stream: BatchStream, out: &mut ArrowArrayStream) {
    let private = Box::new(StreamPrivate {
        stream,
        last_error: None,
    });
    out.get_schema = Some(stream_get_schema);
    out.get_next = Some(stream_get_next);
    out.get_last_error = Some(stream_get_last_error);
    out.release = Some(stream_release);
    out.private_data = Box::into_raw(private) as *mut c_void;
}

/// C format string for a logical type, per the interchange standard.
pub fn format_string(logical_type: &LogicalType) -> Result<String> {
    let fixed = |s: &str| Ok(s.to_string());
    match logical_type {
        LogicalType::Bool => fixed("b"),
        LogicalType::Int8 => fixed("c"),
        LogicalType::Int16 => fixed("s"),
        LogicalType::Int32 => fixed("i"),
        LogicalType::Int64 => fixed("l"),
        LogicalType::UInt8 => fixed("C"),
        LogicalType::UInt16 => fixed("S"),
        LogicalType::UInt32 => fixed("I"),
        LogicalType::UInt64 => fixed("L"),
        LogicalType::Float32 => fixed("f"),
        LogicalType::Float64 => fixed("g"),
        LogicalType::Utf8 => fixed("u"),
        LogicalType::Binary => fixed("z"),
        LogicalType::Date32 => fixed("tdD"),
        LogicalType::Date64 => fixed("tdm"),
        LogicalType::Time64(unit) => fixed(match unit {
            TimeUnit::Second => "tts",
            TimeUnit::Millisecond => "ttm",
            TimeUnit::Microsecond => "ttu",
            TimeUnit::Nanosecond => "ttn",
        }),
        LogicalType::Timestamp(unit, timezone) => {
            let unit = match unit {
                TimeUnit::Second => 's',
                TimeUnit::Millisecond => 'm',
                TimeUnit::Microsecond => 'u',
                TimeUnit::Nanosecond => 'n',
            };
            Ok(format!("ts{unit}:{}", timezone.as_deref().unwrap_or("")))
        }
        LogicalType::Unsupported(tag) => Err(CubeError::InvalidData(format!(
            "cannot export unsupported column type {tag}"
        ))),
    }
}

// Schema export

struct SchemaPrivate {
    format: CString,
    name: CString,
    children: Vec<*mut ArrowSchema>,
}

unsafe extern "C" fn release_schema(schema: *mut ArrowSchema) {
    if schema.is_null() {
        return;
    }
    let s = &mut *schema;
    if s.release.is_none() {
        return;
    }
    let private = Box::from_raw(s.private_data as *mut SchemaPrivate);
    for &child in &private.children {
        if !child.is_null() {
            if let Some(release) = (*child).release {
                release(child);
            }
            drop(Box::from_raw(child));
        }
    }
    drop(private);
    s.release = None;
    s.private_data = ptr::null_mut();
}

/// Populate `out` with a deep copy of the schema as a struct-typed root
/// whose children are the result columns.
pub fn export_schema(schema: &Schema, out: &mut ArrowSchema) -> Result<()> {
    let mut children = Vec::with_capacity(schema.len());
    for field in schema.fields() {
        match export_field(field) {
            Ok(child) => children.push(child),
            Err(e) => {
                // Free the children built so far before bailing out.
                for child in children {
                    unsafe {
                        if let Some(release) = (*child).release {
                            release(child);
                        }
                        drop(Box::from_raw(child));
                    }
                }
                return Err(e);
            }
        }
    }

    let mut private = Box::new(SchemaPrivate {
        format: new_cstring("+s")?,
        name: new_cstring("")?,
        children,
    });

    out.format = private.format.as_ptr();
    out.name = private.name.as_ptr();
    out.metadata = ptr::null();
    out.flags = 0;
    out.n_children = private.children.len() as i64;
    out.children = private.children.as_mut_ptr();
    out.dictionary = ptr::null_mut();
    out.release = Some(release_schema);
    out.private_data = Box::into_raw(private) as *mut c_void;
    Ok(())
}

fn export_field(field: &Field) -> Result<*mut ArrowSchema> {
    let mut private = Box::new(SchemaPrivate {
        format: new_cstring(&format_string(&field.logical_type)?)?,
        name: new_cstring(&field.name)?,
        children: Vec::new(),
    });

    let mut child = ArrowSchema::empty();
    child.format = private.format.as_ptr();
    child.name = private.name.as_ptr();
    child.flags = if field.nullable { ARROW_FLAG_NULLABLE } else { 0 };
    child.release = Some(release_schema);
    child.private_data = Box::into_raw(private) as *mut c_void;
    Ok(Box::into_raw(Box::new(child)))
}

fn new_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| {
        CubeError::InvalidData("interior nul byte in exported schema string".into())
    })
}

// Array export

struct ArrayPrivate {
    _column: Option<Column>,
    buffers: Vec<*const c_void>,
    children: Vec<*mut ArrowArray>,
}

unsafe extern "C" fn release_array(array: *mut ArrowArray) {
    if array.is_null() {
        return;
    }
    let a = &mut *array;
    if a.release.is_none() {
        return;
    }
    let private = Box::from_raw(a.private_data as *mut ArrayPrivate);
    for &child in &private.children {
        if !child.is_null() {
            if let Some(release) = (*child).release {
                release(child);
            }
            drop(Box::from_raw(child));
        }
    }
    drop(private);
    a.release = None;
    a.private_data = ptr::null_mut();
}

/// Move a record batch into `out` as a struct-typed root array.
pub fn export_batch(batch: RecordBatch, out: &mut ArrowArray) {
    let length = batch.num_rows() as i64;
    let children: Vec<*mut ArrowArray> = batch
        .columns()
        .iter()
        .cloned()
        .map(export_column)
        .collect();

    let mut private = Box::new(ArrayPrivate {
        _column: None,
        // The struct root carries a single absent validity buffer.
        buffers: vec![ptr::null()],
        children,
    });

    out.length = length;
    out.null_count = 0;
    out.offset = 0;
    out.n_buffers = 1;
    out.n_children = private.children.len() as i64;
    out.buffers = private.buffers.as_mut_ptr();
    out.children = private.children.as_mut_ptr();
    out.dictionary = ptr::null_mut();
    out.release = Some(release_array);
    out.private_data = Box::into_raw(private) as *mut c_void;
}

fn export_column(column: Column) -> *mut ArrowArray {
    let mut buffers: Vec<*const c_void> = Vec::with_capacity(1 + column.buffers().len());
    buffers.push(match column.validity() {
        Some(bitmap) => bitmap.as_bytes().as_ptr() as *const c_void,
        None => ptr::null(),
    });
    for buffer in column.buffers() {
        buffers.push(buffer.as_ptr() as *const c_void);
    }

    let length = column.len() as i64;
    let null_count = column.null_count() as i64;
    let mut private = Box::new(ArrayPrivate {
        _column: Some(column),
        buffers,
        children: Vec::new(),
    });

    let mut array = ArrowArray::empty();
    array.length = length;
    array.null_count = null_count;
    array.n_buffers = private.buffers.len() as i64;
    array.buffers = private.buffers.as_mut_ptr();
    array.release = Some(release_array);
    array.private_data = Box::into_raw(private) as *mut c_void;
    Box::into_raw(Box::new(array))
}

// Stream callbacks

struct StreamPrivate {
    stream: BatchStream,
    last_error: Option<CString>,
}

impl StreamPrivate {
    fn record_error(&mut self, err: &CubeError) -> c_int {
        let code = match err {
            CubeError::Io(_) => EIO,
            _ => EINVAL,
        };
        self.last_error = CString::new(err.to_string()).ok();
        code
    }
}

unsafe fn stream_private<'a>(stream: *mut ArrowArrayStream) -> &'a mut StreamPrivate {
    &mut *((*stream).private_data as *mut StreamPrivate)
}

unsafe extern "C" fn stream_get_schema(
    stream: *mut ArrowArrayStream,
    out: *mut ArrowSchema,
) -> c_int {
    let private = stream_private(stream);
    let schema = match private.stream.schema() {
        Ok(schema) => schema.clone(),
        Err(e) => return private.record_error(&e),
    };
    match export_schema(&schema, &mut *out) {
        Ok(()) => 0,
        Err(e) => private.record_error(&e),
    }
}

unsafe extern "C" fn stream_get_next(
    stream: *mut ArrowArrayStream,
    out: *mut ArrowArray,
) -> c_int {
    let private = stream_private(stream);
    match private.stream.next_batch() {
        Ok(Some(batch)) => {
            export_batch(batch, &mut *out);
            0
        }
        Ok(None) => {
            // End-of-stream convention: a released-out array and success.
            *out = ArrowArray::empty();
            0
        }
        Err(e) => private.record_error(&e),
    }
}

unsafe extern "C" fn stream_get_last_error(stream: *mut ArrowArrayStream) -> *const c_char {
    match &stream_private(stream).last_error {
        Some(message) => message.as_ptr(),
        None => ptr::null(),
    }
}

unsafe extern "C" fn stream_release(stream: *mut ArrowArrayStream) {
    if stream.is_null() {
        return;
    }
    let s = &mut *stream;
    if s.release.is_none() {
        return;
    }
    drop(Box::from_raw(s.private_data as *mut StreamPrivate));
    s.release = None;
    s.private_data = ptr::null_mut();
}

#[cfg(test)]
mod tests {
    use std::ffi::CStr;
    use std::sync::Arc;

    use arrow_array::{ArrayRef, Decimal128Array, Int64Array, RecordBatch as ArrowRecordBatch, StringArray};
    use arrow_ipc::writer::StreamWriter;
    use arrow_schema::{DataType, Field as ArrowField, Schema as ArrowSchema2};
    use bytes::Bytes;

    use super::*;

    fn encode(schema: Arc<ArrowSchema2>, batch: ArrowRecordBatch) -> Bytes {
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut buf, &schema).unwrap();
            writer.write(&batch).unwrap();
            writer.finish().unwrap();
        }
        Bytes::from(buf)
    }

    fn sample_stream() -> BatchStream {
        let schema = Arc::new(ArrowSchema2::new(vec![
            ArrowField::new("x", DataType::Int64, true),
            ArrowField::new("s", DataType::Utf8, false),
        ]));
        let batch = ArrowRecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(Int64Array::from(vec![Some(1), None])) as ArrayRef,
                Arc::new(StringArray::from(vec!["ab", "cde"])),
            ],
        )
        .unwrap();
        BatchStream::from_payload(encode(schema, batch)).unwrap()
    }

    unsafe fn cstr<'a>(ptr: *const c_char) -> &'a str {
        CStr::from_ptr(ptr).to_str().unwrap()
    }

    #[test]
    fn exported_schema_carries_formats_and_flags() {
        let mut stream = ArrowArrayStream::empty();
        export_stream(sample_stream(), &mut stream);

        unsafe {
            let mut schema = ArrowSchema::empty();
            assert_eq!((stream.get_schema.unwrap())(&mut stream, &mut schema), 0);

            assert_eq!(cstr(schema.format), "+s");
            assert_eq!(schema.n_children, 2);

            let first = &*(*schema.children);
            assert_eq!(cstr(first.format), "l");
            assert_eq!(cstr(first.name), "x");
            assert_eq!(first.flags & ARROW_FLAG_NULLABLE, ARROW_FLAG_NULLABLE);

            let second = &*(*schema.children.add(1));
            assert_eq!(cstr(second.format), "u");
            assert_eq!(cstr(second.name), "s");
            assert_eq!(second.flags & ARROW_FLAG_NULLABLE, 0);

            (schema.release.unwrap())(&mut schema);
            assert!(schema.release.is_none());

            (stream.release.unwrap())(&mut stream);
            assert!(stream.release.is_none());
        }
    }

    #[test]
    fn exported_arrays_expose_buffers_and_end_of_stream() {
        let mut stream = ArrowArrayStream::empty();
        export_stream(sample_stream(), &mut stream);

        unsafe {
            let get_next = stream.get_next.unwrap();

            let mut array = ArrowArray::empty();
            assert_eq!(get_next(&mut stream, &mut array), 0);
            assert!(array.release.is_some());
            assert_eq!(array.length, 2);
            assert_eq!(array.n_children, 2);

            let ints = &*(*array.children);
            assert_eq!(ints.length, 2);
            assert_eq!(ints.null_count, 1);
            assert_eq!(ints.n_buffers, 2);
            // Row 0 of the int64 values buffer.
            let values = *ints.buffers.add(1) as *const u8;
            let mut le = [0u8; 8];
            ptr::copy_nonoverlapping(values, le.as_mut_ptr(), 8);
            assert_eq!(i64::from_le_bytes(le), 1);
            // Validity bitmap marks row 1 null.
            let validity = *ints.buffers as *const u8;
            assert!(!validity.is_null());
            assert_eq!(*validity & 0b11, 0b01);

            let strings = &*(*array.children.add(1));
            assert_eq!(strings.n_buffers, 3);
            assert!((*strings.buffers).is_null());

            (array.release.unwrap())(&mut array);
            assert!(array.release.is_none());

            // End of stream: success with a cleared release, repeatedly.
            let mut end = ArrowArray::empty();
            assert_eq!(get_next(&mut stream, &mut end), 0);
            assert!(end.release.is_none());
            assert_eq!(get_next(&mut stream, &mut end), 0);
            assert!(end.release.is_none());

            (stream.release.unwrap())(&mut stream);
        }
    }

    #[test]
    fn batches_survive_stream_release() {
        let mut stream = ArrowArrayStream::empty();
        export_stream(sample_stream(), &mut stream);

        unsafe {
            let mut array = ArrowArray::empty();
            assert_eq!((stream.get_next.unwrap())(&mut stream, &mut array), 0);
            (stream.release.unwrap())(&mut stream);

            // The array's buffers are still owned and readable.
            let ints = &*(*array.children);
            let values = *ints.buffers.add(1) as *const u8;
            let mut le = [0u8; 8];
            ptr::copy_nonoverlapping(values, le.as_mut_ptr(), 8);
            assert_eq!(i64::from_le_bytes(le), 1);

            (array.release.unwrap())(&mut array);
        }
    }

    #[test]
    fn unsupported_type_fails_schema_export_with_last_error() {
        let schema = Arc::new(ArrowSchema2::new(vec![ArrowField::new(
            "dec",
            DataType::Decimal128(10, 2),
            false,
        )]));
        let array = Decimal128Array::from(vec![1i128])
            .with_precision_and_scale(10, 2)
            .unwrap();
        let batch =
            ArrowRecordBatch::try_new(Arc::clone(&schema), vec![Arc::new(array) as ArrayRef])
                .unwrap();
        let payload = encode(schema, batch);

        let mut stream = ArrowArrayStream::empty();
        export_stream(BatchStream::from_payload(payload).unwrap(), &mut stream);

        unsafe {
            let mut out = ArrowSchema::empty();
            let code = (stream.get_schema.unwrap())(&mut stream, &mut out);
            assert_eq!(code, EINVAL);
            assert!(out.release.is_none());

            let message = (stream.get_last_error.unwrap())(&mut stream);
            assert!(!message.is_null());
            assert!(cstr(message).contains("unsupported"));

            (stream.release.unwrap())(&mut stream);
        }
    }

    #[test]
    fn timestamp_format_strings() {
        assert_eq!(
            format_string(&LogicalType::Timestamp(TimeUnit::Microsecond, None)).unwrap(),
            "tsu:"
        );
        assert_eq!(
            format_string(&LogicalType::Timestamp(
                TimeUnit::Millisecond,
                Some("UTC".into())
            ))
            .unwrap(),
            "tsm:UTC"
        );
        assert_eq!(
            format_string(&LogicalType::Time64(TimeUnit::Microsecond)).unwrap(),
            "ttu"
        );
        assert_eq!(format_string(&LogicalType::Date32).unwrap(), "tdD");
        assert!(format_string(&LogicalType::Unsupported(21)).is_err());
    }
}
