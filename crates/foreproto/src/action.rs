//! Action frames: the RPC vocabulary between manager and worker.
//!
//! An action frame is the action cipher, a 4-byte action code, and (for
//! `Modify` only) a parameter-entry payload in the standard encoding. The
//! codes are the only RPC vocabulary between the two sides and must stay
//! stable.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::frame::{Frame, FrameError, CIPHER_ACTION};
use crate::params::ParameterSet;
use crate::value::ColumnSchema;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Handshake announcement, sent by whichever side just connected.
    Hello,
    /// Ask the peer for a one-shot parameters snapshot.
    ParametersRequest,
    /// Ask the peer for its metadata document.
    MetadataRequest,
    Pause,
    Run,
    Delete,
    /// Parameter update; carries the new values.
    Modify(ParameterSet),
}

const CODE_HELLO: u32 = 1;
const CODE_PARAMETERS_REQUEST: u32 = 2;
const CODE_METADATA_REQUEST: u32 = 3;
const CODE_PAUSE: u32 = 4;
const CODE_RUN: u32 = 5;
const CODE_DELETE: u32 = 6;
const CODE_MODIFY: u32 = 7;

impl Action {
    pub fn code(&self) -> u32 {
        match self {
            Self::Hello => CODE_HELLO,
            Self::ParametersRequest => CODE_PARAMETERS_REQUEST,
            Self::MetadataRequest => CODE_METADATA_REQUEST,
            Self::Pause => CODE_PAUSE,
            Self::Run => CODE_RUN,
            Self::Delete => CODE_DELETE,
            Self::Modify(_) => CODE_MODIFY,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32_le(self.code());
        if let Self::Modify(params) = self {
            params.write_entries(&mut buf);
        }
        Frame::new(CIPHER_ACTION, buf.freeze())
    }

    /// Decode an action body. `schema_lookup` serves table parameters
    /// inside a `Modify` payload.
    pub fn decode_body(
        mut body: Bytes,
        schema_lookup: impl Fn(u64) -> Option<ColumnSchema>,
    ) -> Result<Self, FrameError> {
        if body.remaining() < 4 {
            return Err(FrameError::Truncated {
                needed: 4 - body.remaining(),
            });
        }
        let code = body.get_u32_le();
        Ok(match code {
            CODE_HELLO => Self::Hello,
            CODE_PARAMETERS_REQUEST => Self::ParametersRequest,
            CODE_METADATA_REQUEST => Self::MetadataRequest,
            CODE_PAUSE => Self::Pause,
            CODE_RUN => Self::Run,
            CODE_DELETE => Self::Delete,
            CODE_MODIFY => Self::Modify(ParameterSet::decode_body(body, schema_lookup)?),
            other => return Err(FrameError::UnknownAction(other)),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::ParametersRequest => "parameters request",
            Self::MetadataRequest => "metadata request",
            Self::Pause => "pause",
            Self::Run => "run",
            Self::Delete => "delete",
            Self::Modify(_) => "modify",
        }
    }
}
