//! Typed parameter values and their binary encoding.
//!
//! The protocol recognizes a fixed set of scalar types plus `TableData`,
//! a rows-by-typed-columns container whose column layout comes from the
//! worker's metadata rather than from the wire. Optional numeric scalars
//! carry a presence byte; `null` means absent.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::frame::FrameError;

/// An absolute instant, nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timer(pub i64);

/// A signed span, nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(pub i64);

/// Type tags as they appear on the wire (one byte per tagged entry).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Bool = 0,
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,
    Uint8 = 5,
    Uint16 = 6,
    Uint32 = 7,
    Uint64 = 8,
    Float = 9,
    Double = 10,
    String = 11,
    Timer = 12,
    Duration = 13,
    TableData = 14,
    OptionalInt8 = 15,
    OptionalInt16 = 16,
    OptionalInt32 = 17,
    OptionalInt64 = 18,
    OptionalUint8 = 19,
    OptionalUint16 = 20,
    OptionalUint32 = 21,
    OptionalUint64 = 22,
    OptionalFloat = 23,
    OptionalDouble = 24,
}

impl ScalarType {
    pub fn from_tag(tag: u8) -> Result<Self, FrameError> {
        Ok(match tag {
            0 => Self::Bool,
            1 => Self::Int8,
            2 => Self::Int16,
            3 => Self::Int32,
            4 => Self::Int64,
            5 => Self::Uint8,
            6 => Self::Uint16,
            7 => Self::Uint32,
            8 => Self::Uint64,
            9 => Self::Float,
            10 => Self::Double,
            11 => Self::String,
            12 => Self::Timer,
            13 => Self::Duration,
            14 => Self::TableData,
            15 => Self::OptionalInt8,
            16 => Self::OptionalInt16,
            17 => Self::OptionalInt32,
            18 => Self::OptionalInt64,
            19 => Self::OptionalUint8,
            20 => Self::OptionalUint16,
            21 => Self::OptionalUint32,
            22 => Self::OptionalUint64,
            23 => Self::OptionalFloat,
            24 => Self::OptionalDouble,
            other => return Err(FrameError::UnknownTag(other)),
        })
    }

    /// Parse a declared type name from metadata JSON. Unknown names yield
    /// `None`; callers log and skip the parameter.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Bool" => Self::Bool,
            "Int8" => Self::Int8,
            "Int16" => Self::Int16,
            "Int32" => Self::Int32,
            "Int64" => Self::Int64,
            "Uint8" => Self::Uint8,
            "Uint16" => Self::Uint16,
            "Uint32" => Self::Uint32,
            "Uint64" => Self::Uint64,
            "Float" => Self::Float,
            "Double" => Self::Double,
            "String" => Self::String,
            "Timer" => Self::Timer,
            "Duration" => Self::Duration,
            "TableData" => Self::TableData,
            "OptionalInt8" => Self::OptionalInt8,
            "OptionalInt16" => Self::OptionalInt16,
            "OptionalInt32" => Self::OptionalInt32,
            "OptionalInt64" => Self::OptionalInt64,
            "OptionalUint8" => Self::OptionalUint8,
            "OptionalUint16" => Self::OptionalUint16,
            "OptionalUint32" => Self::OptionalUint32,
            "OptionalUint64" => Self::OptionalUint64,
            "OptionalFloat" => Self::OptionalFloat,
            "OptionalDouble" => Self::OptionalDouble,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bool => "Bool",
            Self::Int8 => "Int8",
            Self::Int16 => "Int16",
            Self::Int32 => "Int32",
            Self::Int64 => "Int64",
            Self::Uint8 => "Uint8",
            Self::Uint16 => "Uint16",
            Self::Uint32 => "Uint32",
            Self::Uint64 => "Uint64",
            Self::Float => "Float",
            Self::Double => "Double",
            Self::String => "String",
            Self::Timer => "Timer",
            Self::Duration => "Duration",
            Self::TableData => "TableData",
            Self::OptionalInt8 => "OptionalInt8",
            Self::OptionalInt16 => "OptionalInt16",
            Self::OptionalInt32 => "OptionalInt32",
            Self::OptionalInt64 => "OptionalInt64",
            Self::OptionalUint8 => "OptionalUint8",
            Self::OptionalUint16 => "OptionalUint16",
            Self::OptionalUint32 => "OptionalUint32",
            Self::OptionalUint64 => "OptionalUint64",
            Self::OptionalFloat => "OptionalFloat",
            Self::OptionalDouble => "OptionalDouble",
        }
    }
}

/// Ordered scalar layout of one table's columns, extracted from metadata.
pub type ColumnSchema = Vec<ScalarType>;

/// Rows of bare scalars. The column layout lives outside the wire payload,
/// so a table can only be decoded (or rendered) against its schema.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableData {
    pub rows: Vec<Vec<Value>>,
}

impl TableData {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Encoded payload size in bytes, the leading size marker excluded.
    fn payload_len(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| row.iter())
            .map(Value::scalar_len)
            .sum()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.payload_len() as u64);
        for row in &self.rows {
            for cell in row {
                cell.write_scalar(buf);
            }
        }
    }

    fn decode(
        buf: &mut Bytes,
        schema_lookup: impl Fn() -> Option<ColumnSchema>,
    ) -> Result<Option<Self>, FrameError> {
        if buf.remaining() < 8 {
            return Err(FrameError::Truncated {
                needed: 8 - buf.remaining(),
            });
        }
        let size = buf.get_u64_le() as usize;
        if buf.remaining() < size {
            return Err(FrameError::Truncated {
                needed: size - buf.remaining(),
            });
        }
        let mut payload = buf.split_to(size);
        if size == 0 {
            return Ok(Some(TableData::default()));
        }
        let Some(schema) = schema_lookup() else {
            // No schema known for this table; the payload is consumed so the
            // enclosing frame stays aligned, and the parameter is dropped.
            return Ok(None);
        };
        let mut rows = Vec::new();
        while payload.has_remaining() {
            let mut row = Vec::with_capacity(schema.len());
            for column in &schema {
                row.push(Value::read_scalar(*column, &mut payload)?);
            }
            rows.push(row);
        }
        Ok(Some(TableData { rows }))
    }

    /// Render rows as a JSON array of arrays in schema column order.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.rows
                .iter()
                .map(|row| serde_json::Value::Array(row.iter().map(Value::to_json).collect()))
                .collect(),
        )
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Timer(Timer),
    Duration(Duration),
    Table(TableData),
    OptionalInt8(Option<i8>),
    OptionalInt16(Option<i16>),
    OptionalInt32(Option<i32>),
    OptionalInt64(Option<i64>),
    OptionalUint8(Option<u8>),
    OptionalUint16(Option<u16>),
    OptionalUint32(Option<u32>),
    OptionalUint64(Option<u64>),
    OptionalFloat(Option<f32>),
    OptionalDouble(Option<f64>),
}

impl Value {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Bool(_) => ScalarType::Bool,
            Self::Int8(_) => ScalarType::Int8,
            Self::Int16(_) => ScalarType::Int16,
            Self::Int32(_) => ScalarType::Int32,
            Self::Int64(_) => ScalarType::Int64,
            Self::Uint8(_) => ScalarType::Uint8,
            Self::Uint16(_) => ScalarType::Uint16,
            Self::Uint32(_) => ScalarType::Uint32,
            Self::Uint64(_) => ScalarType::Uint64,
            Self::Float(_) => ScalarType::Float,
            Self::Double(_) => ScalarType::Double,
            Self::String(_) => ScalarType::String,
            Self::Timer(_) => ScalarType::Timer,
            Self::Duration(_) => ScalarType::Duration,
            Self::Table(_) => ScalarType::TableData,
            Self::OptionalInt8(_) => ScalarType::OptionalInt8,
            Self::OptionalInt16(_) => ScalarType::OptionalInt16,
            Self::OptionalInt32(_) => ScalarType::OptionalInt32,
            Self::OptionalInt64(_) => ScalarType::OptionalInt64,
            Self::OptionalUint8(_) => ScalarType::OptionalUint8,
            Self::OptionalUint16(_) => ScalarType::OptionalUint16,
            Self::OptionalUint32(_) => ScalarType::OptionalUint32,
            Self::OptionalUint64(_) => ScalarType::OptionalUint64,
            Self::OptionalFloat(_) => ScalarType::OptionalFloat,
            Self::OptionalDouble(_) => ScalarType::OptionalDouble,
        }
    }

    /// On-wire size of the bare scalar (no id, no tag).
    pub fn scalar_len(&self) -> usize {
        match self {
            Self::Bool(_) | Self::Int8(_) | Self::Uint8(_) => 1,
            Self::Int16(_) | Self::Uint16(_) => 2,
            Self::Int32(_) | Self::Uint32(_) | Self::Float(_) => 4,
            Self::Int64(_)
            | Self::Uint64(_)
            | Self::Double(_)
            | Self::Timer(_)
            | Self::Duration(_) => 8,
            Self::String(s) => 4 + s.len(),
            Self::Table(t) => 8 + t.payload_len(),
            Self::OptionalInt8(o) => 1 + o.map_or(0, |_| 1),
            Self::OptionalInt16(o) => 1 + o.map_or(0, |_| 2),
            Self::OptionalInt32(o) => 1 + o.map_or(0, |_| 4),
            Self::OptionalInt64(o) => 1 + o.map_or(0, |_| 8),
            Self::OptionalUint8(o) => 1 + o.map_or(0, |_| 1),
            Self::OptionalUint16(o) => 1 + o.map_or(0, |_| 2),
            Self::OptionalUint32(o) => 1 + o.map_or(0, |_| 4),
            Self::OptionalUint64(o) => 1 + o.map_or(0, |_| 8),
            Self::OptionalFloat(o) => 1 + o.map_or(0, |_| 4),
            Self::OptionalDouble(o) => 1 + o.map_or(0, |_| 8),
        }
    }

    /// Write the bare scalar (no id, no tag).
    pub fn write_scalar(&self, buf: &mut BytesMut) {
        fn opt<T: Copy>(buf: &mut BytesMut, o: &Option<T>, put: impl Fn(&mut BytesMut, T)) {
            match o {
                Some(v) => {
                    buf.put_u8(1);
                    put(buf, *v);
                }
                None => buf.put_u8(0),
            }
        }
        match self {
            Self::Bool(v) => buf.put_u8(*v as u8),
            Self::Int8(v) => buf.put_i8(*v),
            Self::Int16(v) => buf.put_i16_le(*v),
            Self::Int32(v) => buf.put_i32_le(*v),
            Self::Int64(v) => buf.put_i64_le(*v),
            Self::Uint8(v) => buf.put_u8(*v),
            Self::Uint16(v) => buf.put_u16_le(*v),
            Self::Uint32(v) => buf.put_u32_le(*v),
            Self::Uint64(v) => buf.put_u64_le(*v),
            Self::Float(v) => buf.put_f32_le(*v),
            Self::Double(v) => buf.put_f64_le(*v),
            Self::String(s) => {
                buf.put_u32_le(s.len() as u32);
                buf.extend_from_slice(s.as_bytes());
            }
            Self::Timer(t) => buf.put_i64_le(t.0),
            Self::Duration(d) => buf.put_i64_le(d.0),
            Self::Table(t) => t.encode(buf),
            Self::OptionalInt8(o) => opt(buf, o, |b, v| b.put_i8(v)),
            Self::OptionalInt16(o) => opt(buf, o, |b, v| b.put_i16_le(v)),
            Self::OptionalInt32(o) => opt(buf, o, |b, v| b.put_i32_le(v)),
            Self::OptionalInt64(o) => opt(buf, o, |b, v| b.put_i64_le(v)),
            Self::OptionalUint8(o) => opt(buf, o, |b, v| b.put_u8(v)),
            Self::OptionalUint16(o) => opt(buf, o, |b, v| b.put_u16_le(v)),
            Self::OptionalUint32(o) => opt(buf, o, |b, v| b.put_u32_le(v)),
            Self::OptionalUint64(o) => opt(buf, o, |b, v| b.put_u64_le(v)),
            Self::OptionalFloat(o) => opt(buf, o, |b, v| b.put_f32_le(v)),
            Self::OptionalDouble(o) => opt(buf, o, |b, v| b.put_f64_le(v)),
        }
    }

    /// Read a bare scalar of a known type. `TableData` is rejected here;
    /// tables are only decoded through [`Value::read_tagged`] where the
    /// schema lookup is available.
    pub fn read_scalar(ty: ScalarType, buf: &mut Bytes) -> Result<Self, FrameError> {
        macro_rules! need {
            ($n:expr) => {
                if buf.remaining() < $n {
                    return Err(FrameError::Truncated {
                        needed: $n - buf.remaining(),
                    });
                }
            };
        }
        macro_rules! optional {
            ($variant:ident, $n:expr, $get:ident) => {{
                need!(1);
                if buf.get_u8() == 0 {
                    Self::$variant(None)
                } else {
                    need!($n);
                    Self::$variant(Some(buf.$get()))
                }
            }};
        }
        Ok(match ty {
            ScalarType::Bool => {
                need!(1);
                Self::Bool(buf.get_u8() != 0)
            }
            ScalarType::Int8 => {
                need!(1);
                Self::Int8(buf.get_i8())
            }
            ScalarType::Int16 => {
                need!(2);
                Self::Int16(buf.get_i16_le())
            }
            ScalarType::Int32 => {
                need!(4);
                Self::Int32(buf.get_i32_le())
            }
            ScalarType::Int64 => {
                need!(8);
                Self::Int64(buf.get_i64_le())
            }
            ScalarType::Uint8 => {
                need!(1);
                Self::Uint8(buf.get_u8())
            }
            ScalarType::Uint16 => {
                need!(2);
                Self::Uint16(buf.get_u16_le())
            }
            ScalarType::Uint32 => {
                need!(4);
                Self::Uint32(buf.get_u32_le())
            }
            ScalarType::Uint64 => {
                need!(8);
                Self::Uint64(buf.get_u64_le())
            }
            ScalarType::Float => {
                need!(4);
                Self::Float(buf.get_f32_le())
            }
            ScalarType::Double => {
                need!(8);
                Self::Double(buf.get_f64_le())
            }
            ScalarType::String => {
                need!(4);
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return Err(FrameError::StringOverrun(len));
                }
                let raw = buf.split_to(len);
                let s = std::str::from_utf8(&raw)
                    .map_err(|_| FrameError::InvalidUtf8("string parameter"))?;
                Self::String(s.to_string())
            }
            ScalarType::Timer => {
                need!(8);
                Self::Timer(Timer(buf.get_i64_le()))
            }
            ScalarType::Duration => {
                need!(8);
                Self::Duration(Duration(buf.get_i64_le()))
            }
            ScalarType::TableData => return Err(FrameError::UnknownTag(ScalarType::TableData as u8)),
            ScalarType::OptionalInt8 => optional!(OptionalInt8, 1, get_i8),
            ScalarType::OptionalInt16 => optional!(OptionalInt16, 2, get_i16_le),
            ScalarType::OptionalInt32 => optional!(OptionalInt32, 4, get_i32_le),
            ScalarType::OptionalInt64 => optional!(OptionalInt64, 8, get_i64_le),
            ScalarType::OptionalUint8 => optional!(OptionalUint8, 1, get_u8),
            ScalarType::OptionalUint16 => optional!(OptionalUint16, 2, get_u16_le),
            ScalarType::OptionalUint32 => optional!(OptionalUint32, 4, get_u32_le),
            ScalarType::OptionalUint64 => optional!(OptionalUint64, 8, get_u64_le),
            ScalarType::OptionalFloat => optional!(OptionalFloat, 4, get_f32_le),
            ScalarType::OptionalDouble => optional!(OptionalDouble, 8, get_f64_le),
        })
    }

    /// Read a tagged value: type tag byte, then the scalar. Tables consult
    /// `schema_lookup`; a table with no known schema decodes to `None` so
    /// the caller can drop that parameter without losing frame alignment.
    pub fn read_tagged(
        buf: &mut Bytes,
        schema_lookup: impl Fn() -> Option<ColumnSchema>,
    ) -> Result<Option<Self>, FrameError> {
        if buf.remaining() < 1 {
            return Err(FrameError::Truncated { needed: 1 });
        }
        let ty = ScalarType::from_tag(buf.get_u8())?;
        if ty == ScalarType::TableData {
            return Ok(TableData::decode(buf, schema_lookup)?.map(Self::Table));
        }
        Self::read_scalar(ty, buf).map(Some)
    }

    /// Render as the JSON the control plane exposes: numbers stay numbers,
    /// absent optionals become `null`, instants and spans are nanosecond
    /// counts.
    pub fn to_json(&self) -> serde_json::Value {
        fn float(v: f64) -> serde_json::Value {
            serde_json::Number::from_f64(v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null)
        }
        match self {
            Self::Bool(v) => serde_json::json!(v),
            Self::Int8(v) => serde_json::json!(v),
            Self::Int16(v) => serde_json::json!(v),
            Self::Int32(v) => serde_json::json!(v),
            Self::Int64(v) => serde_json::json!(v),
            Self::Uint8(v) => serde_json::json!(v),
            Self::Uint16(v) => serde_json::json!(v),
            Self::Uint32(v) => serde_json::json!(v),
            Self::Uint64(v) => serde_json::json!(v),
            Self::Float(v) => float(f64::from(*v)),
            Self::Double(v) => float(*v),
            Self::String(s) => serde_json::json!(s),
            Self::Timer(t) => serde_json::json!(t.0),
            Self::Duration(d) => serde_json::json!(d.0),
            Self::Table(t) => t.to_json(),
            Self::OptionalInt8(o) => serde_json::json!(o),
            Self::OptionalInt16(o) => serde_json::json!(o),
            Self::OptionalInt32(o) => serde_json::json!(o),
            Self::OptionalInt64(o) => serde_json::json!(o),
            Self::OptionalUint8(o) => serde_json::json!(o),
            Self::OptionalUint16(o) => serde_json::json!(o),
            Self::OptionalUint32(o) => serde_json::json!(o),
            Self::OptionalUint64(o) => serde_json::json!(o),
            Self::OptionalFloat(o) => o.map_or(serde_json::Value::Null, |v| float(f64::from(v))),
            Self::OptionalDouble(o) => o.map_or(serde_json::Value::Null, |v| float(v)),
        }
    }
}
