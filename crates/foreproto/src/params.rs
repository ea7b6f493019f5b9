//! Parameter-set frames: the `parameter-id -> typed value` mapping that
//! workers publish and the manager reads, plus the reserved ids both sides
//! agree on.

use std::collections::BTreeMap;

use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

use crate::frame::{Frame, FrameError, CIPHER_PARAMETERS};
use crate::value::{ColumnSchema, Value};

/// Reserved id: the publishing side's own listening port (`Uint16`).
pub const PARAM_LISTEN_PORT: u64 = 1_000_009;

/// Reserved id: lifecycle state of the publishing side (`Int16`).
pub const PARAM_LIFECYCLE_STATE: u64 = 2_000_002;

/// Lifecycle states carried in parameter [`PARAM_LIFECYCLE_STATE`].
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running = 1,
    Paused = 2,
}

impl WorkerState {
    pub fn from_wire(raw: i16) -> Option<Self> {
        match raw {
            1 => Some(Self::Running),
            2 => Some(Self::Paused),
            _ => None,
        }
    }
}

/// An ordered `id -> value` mapping with frame encode/decode.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterSet {
    entries: BTreeMap<u64, Value>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: u64, value: Value) -> &mut Self {
        self.entries.insert(id, value);
        self
    }

    pub fn get(&self, id: u64) -> Option<&Value> {
        self.entries.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Value)> {
        self.entries.iter()
    }

    /// The publisher's listening port, when present and well-typed.
    pub fn listen_port(&self) -> Option<u16> {
        match self.entries.get(&PARAM_LISTEN_PORT) {
            Some(Value::Uint16(port)) => Some(*port),
            Some(other) => {
                warn!(got = other.scalar_type().name(), "listen port parameter has unexpected type");
                None
            }
            None => None,
        }
    }

    /// The publisher's lifecycle state, when present and well-typed.
    pub fn lifecycle_state(&self) -> Option<WorkerState> {
        match self.entries.get(&PARAM_LIFECYCLE_STATE) {
            Some(Value::Int16(raw)) => WorkerState::from_wire(*raw),
            _ => None,
        }
    }

    /// Serialize the entries as a body (no header).
    pub fn encode_body(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write_entries(&mut buf);
        buf.freeze()
    }

    pub(crate) fn write_entries(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        for (id, value) in &self.entries {
            buf.put_u64_le(*id);
            buf.put_u8(value.scalar_type() as u8);
            value.write_scalar(buf);
        }
    }

    /// Wrap the entries in a parameters frame.
    pub fn to_frame(&self) -> Frame {
        Frame::new(CIPHER_PARAMETERS, self.encode_body())
    }

    /// Decode a body of tagged entries. Table parameters resolve their
    /// column layout through `schema_lookup(id)`; a table without a schema
    /// is dropped from the set with a warning rather than failing the
    /// frame.
    pub fn decode_body(
        mut body: Bytes,
        schema_lookup: impl Fn(u64) -> Option<ColumnSchema>,
    ) -> Result<Self, FrameError> {
        let mut entries = BTreeMap::new();
        while body.has_remaining() {
            if body.remaining() < 8 {
                return Err(FrameError::Truncated {
                    needed: 8 - body.remaining(),
                });
            }
            let id = body.get_u64_le();
            match Value::read_tagged(&mut body, || schema_lookup(id)) {
                Ok(Some(value)) => {
                    entries.insert(id, value);
                }
                Ok(None) => {
                    warn!(id, "dropping table parameter without a column schema");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Self { entries })
    }

    /// Render the full mapping as a JSON object keyed by decimal id.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(id, value)| (id.to_string(), value.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl FromIterator<(u64, Value)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (u64, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ScalarType, TableData, Timer};
    use pretty_assertions::assert_eq;

    fn sample_set() -> ParameterSet {
        let mut set = ParameterSet::new();
        set.set(PARAM_LISTEN_PORT, Value::Uint16(3500))
            .set(42, Value::Int32(7))
            .set(43, Value::String("worker".into()))
            .set(44, Value::OptionalDouble(None))
            .set(45, Value::Timer(Timer(99)));
        set
    }

    #[test]
    fn body_roundtrip() {
        let set = sample_set();
        let body = set.encode_body();
        let decoded = ParameterSet::decode_body(body, |_| None).unwrap();
        assert_eq!(decoded, set);
        assert_eq!(decoded.listen_port(), Some(3500));
    }

    #[test]
    fn frame_roundtrip() {
        let set = sample_set();
        let frame = set.to_frame();
        assert_eq!(frame.cipher, CIPHER_PARAMETERS);
        let decoded = ParameterSet::decode_body(frame.body, |_| None).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn table_parameter_uses_per_id_schema() {
        let mut set = ParameterSet::new();
        set.set(
            70,
            Value::Table(TableData {
                rows: vec![vec![Value::Uint16(1), Value::Bool(true)]],
            }),
        );
        let body = set.encode_body();
        let decoded = ParameterSet::decode_body(body, |id| {
            (id == 70).then(|| vec![ScalarType::Uint16, ScalarType::Bool])
        })
        .unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn lifecycle_state_extraction() {
        let mut set = ParameterSet::new();
        set.set(PARAM_LIFECYCLE_STATE, Value::Int16(2));
        assert_eq!(set.lifecycle_state(), Some(WorkerState::Paused));
        set.set(PARAM_LIFECYCLE_STATE, Value::Int16(1));
        assert_eq!(set.lifecycle_state(), Some(WorkerState::Running));
        set.set(PARAM_LIFECYCLE_STATE, Value::Int16(9));
        assert_eq!(set.lifecycle_state(), None);
    }

    #[test]
    fn empty_set_has_empty_body() {
        let set = ParameterSet::new();
        assert!(set.encode_body().is_empty());
        let decoded = ParameterSet::decode_body(Bytes::new(), |_| None).unwrap();
        assert!(decoded.is_empty());
    }
}
