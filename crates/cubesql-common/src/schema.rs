//! Logical schema of a query result
//!
//! A `Schema` is an ordered list of `Field`s, each carrying a name, a
//! `LogicalType`, and a nullability flag. It is produced once per query
//! result by the columnar stream decoder and is immutable afterwards.

/// Granularity of temporal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Second,
    Millisecond,
    Microsecond,
    Nanosecond,
}

/// The closed set of column types the driver decodes.
///
/// Types the interchange format can express but the decoder does not handle
/// (nested, union, dictionary-encoded, decimal, ...) are carried as
/// `Unsupported` with the original type discriminant. A schema may contain
/// unsupported fields; materializing one is a decode-time error.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Utf8,
    Binary,
    /// Days since the UNIX epoch.
    Date32,
    /// Milliseconds since the UNIX epoch.
    Date64,
    /// Time of day as a 64-bit count of `TimeUnit`s since midnight.
    Time64(TimeUnit),
    /// Instant as a 64-bit count of `TimeUnit`s since the epoch, with an
    /// optional timezone.
    Timestamp(TimeUnit, Option<String>),
    /// A type the decoder does not handle; carries the interchange format's
    /// type discriminant.
    Unsupported(u8),
}

impl LogicalType {
    /// Number of body buffers a column of this type consumes, validity
    /// included. `None` for unsupported types.
    pub fn buffer_count(&self) -> Option<usize> {
        match self {
            LogicalType::Utf8 | LogicalType::Binary => Some(3),
            LogicalType::Unsupported(_) => None,
            _ => Some(2),
        }
    }

    /// Width in bytes of one element, for fixed-width types. Bool is
    /// bit-packed and variable-width types have no fixed width.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            LogicalType::Int8 | LogicalType::UInt8 => Some(1),
            LogicalType::Int16 | LogicalType::UInt16 => Some(2),
            LogicalType::Int32 | LogicalType::UInt32 | LogicalType::Float32 => Some(4),
            LogicalType::Date32 => Some(4),
            LogicalType::Int64 | LogicalType::UInt64 | LogicalType::Float64 => Some(8),
            LogicalType::Date64 | LogicalType::Time64(_) | LogicalType::Timestamp(_, _) => Some(8),
            _ => None,
        }
    }

    /// Whether values are addressed through an offsets buffer.
    pub fn is_variable(&self) -> bool {
        matches!(self, LogicalType::Utf8 | LogicalType::Binary)
    }
}

/// One column of the result schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, logical_type: LogicalType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            logical_type,
            nullable,
        }
    }
}

/// Ordered list of result columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Field at position `index`. Panics if out of range.
    pub fn field(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
