//! Wire types shared by the sanitizer front-end and the privileged helper.
//!
//! Every message is one JSON object per line. Requests carry a client id and a
//! message id; every response echoes both so the caller can correlate it with
//! the request that produced it.

pub mod codec;
pub mod envelope;
pub mod message_id;

pub use codec::{ProtocolError, decode_request, decode_response, encode_line};
pub use envelope::{
    ControlAction, ControlPayload, MsgType, RequestEnvelope, ResponseEnvelope, ResultCode,
    SanitizeRequest,
};
pub use message_id::MessageIdGen;
