//! Interchange metadata type mapping
//!
//! Maps FlatBuffers field declarations from the stream's schema message to
//! the driver's `LogicalType`. Integer and floating-point widths are
//! preserved. Everything the decoder cannot materialize maps to
//! `Unsupported` carrying the original type discriminant; the schema still
//! initializes, and the error is raised only if such a column is decoded.

use arrow_ipc as ipc;
use cubesql_common::{Field, LogicalType, TimeUnit};

pub(crate) fn convert_field(field: &ipc::Field<'_>) -> Field {
    let name = field.name().unwrap_or_default().to_string();
    Field::new(name, convert_type(field), field.nullable())
}

fn convert_type(field: &ipc::Field<'_>) -> LogicalType {
    let tag = field.type_type().0;

    // Dictionary-encoded columns use an index/value buffer layout the
    // decoder does not handle.
    if field.dictionary().is_some() {
        return LogicalType::Unsupported(tag);
    }

    match field.type_type() {
        ipc::Type::Int => match field.type_as_int() {
            Some(int) => match (int.bitWidth(), int.is_signed()) {
                // width unspecified on the wire
                (0, _) => LogicalType::Int64,
                (8, true) => LogicalType::Int8,
                (16, true) => LogicalType::Int16,
                (32, true) => LogicalType::Int32,
                (64, true) => LogicalType::Int64,
                (8, false) => LogicalType::UInt8,
                (16, false) => LogicalType::UInt16,
                (32, false) => LogicalType::UInt32,
                (64, false) => LogicalType::UInt64,
                _ => LogicalType::Unsupported(tag),
            },
            None => LogicalType::Int64,
        },
        ipc::Type::FloatingPoint => match field.type_as_floating_point() {
            Some(fp) if fp.precision() == ipc::Precision::SINGLE => LogicalType::Float32,
            Some(fp) if fp.precision() == ipc::Precision::DOUBLE => LogicalType::Float64,
            _ => LogicalType::Unsupported(tag),
        },
        ipc::Type::Bool => LogicalType::Bool,
        ipc::Type::Utf8 => LogicalType::Utf8,
        ipc::Type::Binary => LogicalType::Binary,
        ipc::Type::Date => match field.type_as_date() {
            Some(date) if date.unit() == ipc::DateUnit::DAY => LogicalType::Date32,
            Some(date) if date.unit() == ipc::DateUnit::MILLISECOND => LogicalType::Date64,
            _ => LogicalType::Unsupported(tag),
        },
        ipc::Type::Time => match field.type_as_time() {
            // 32-bit times would need a 4-byte layout; not carried.
            Some(time) if time.bitWidth() == 64 => LogicalType::Time64(convert_unit(time.unit())),
            _ => LogicalType::Unsupported(tag),
        },
        ipc::Type::Timestamp => match field.type_as_timestamp() {
            Some(ts) => LogicalType::Timestamp(
                convert_unit(ts.unit()),
                ts.timezone().map(str::to_string),
            ),
            None => LogicalType::Unsupported(tag),
        },
        _ => LogicalType::Unsupported(tag),
    }
}

fn convert_unit(unit: ipc::TimeUnit) -> TimeUnit {
    match unit {
        ipc::TimeUnit::SECOND => TimeUnit::Second,
        ipc::TimeUnit::MILLISECOND => TimeUnit::Millisecond,
        ipc::TimeUnit::MICROSECOND => TimeUnit::Microsecond,
        _ => TimeUnit::Nanosecond,
    }
}
