use serde::{Deserialize, Serialize};

/// Kind of payload carried in a request's `msgData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    Control,
    Sanitize,
    #[serde(other)]
    Unknown,
}

/// Request envelope written by the client, one per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "clientID", default)]
    pub client_id: String,
    #[serde(rename = "messageID")]
    pub message_id: i64,
    #[serde(rename = "msgType")]
    pub msg_type: MsgType,
    /// Opaque payload bytes, base64 in JSON.
    #[serde(rename = "msgData", with = "b64", default)]
    pub msg_data: Vec<u8>,
}

impl RequestEnvelope {
    pub fn control(
        client_id: &str,
        message_id: i64,
        action: ControlAction,
    ) -> Result<Self, serde_json::Error> {
        let payload = ControlPayload { control_action: action };
        Ok(Self {
            client_id: client_id.to_string(),
            message_id,
            msg_type: MsgType::Control,
            msg_data: serde_json::to_vec(&payload)?,
        })
    }

    pub fn sanitize(
        client_id: &str,
        message_id: i64,
        req: &SanitizeRequest,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            client_id: client_id.to_string(),
            message_id,
            msg_type: MsgType::Sanitize,
            msg_data: serde_json::to_vec(req)?,
        })
    }

    pub fn control_payload(&self) -> Result<ControlPayload, serde_json::Error> {
        serde_json::from_slice(&self.msg_data)
    }

    pub fn sanitize_payload(&self) -> Result<SanitizeRequest, serde_json::Error> {
        serde_json::from_slice(&self.msg_data)
    }
}

/// Response envelope written by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "messageID")]
    pub message_id: i64,
    #[serde(rename = "resultCode")]
    pub result_code: u32,
    #[serde(rename = "additionalMsg", default)]
    pub additional_msg: String,
}

impl ResponseEnvelope {
    /// Build a response correlated with `req`.
    pub fn reply(req: &RequestEnvelope, code: u32, msg: impl Into<String>) -> Self {
        Self {
            client_id: req.client_id.clone(),
            message_id: req.message_id,
            result_code: code,
            additional_msg: msg.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.result_code)
    }

    /// `202` means the server accepted the work and a final message follows.
    pub fn is_interim(&self) -> bool {
        self.result_code == ResultCode::ACCEPTED
    }
}

/// HTTP-like result codes used on the wire.
pub struct ResultCode;

impl ResultCode {
    pub const OK: u32 = 200;
    pub const ACCEPTED: u32 = 202;
    pub const BAD_REQUEST: u32 = 400;
    pub const FAILED: u32 = 500;
    pub const UNAVAILABLE: u32 = 503;
    pub const DEADLINE_EXCEEDED: u32 = 504;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Ping,
    Quit,
    Disconn,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPayload {
    #[serde(rename = "controlAction")]
    pub control_action: ControlAction,
}

/// One document to sanitize, produced by joining a detection with its
/// catalog solution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizeRequest {
    pub path: String,
    pub action: String,
    #[serde(rename = "module")]
    pub destination_module: String,
    #[serde(rename = "detectionName")]
    pub detection_name: String,
}

mod b64 {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = Option::<String>::deserialize(d)?.unwrap_or_default();
        BASE64_STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
