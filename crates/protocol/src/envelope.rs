use serde::{Deserialize, Serialize};

use crate::constants::{MessageType, StatusCode};

/// Final outcome of a call, sent by the server as the last frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Status {
    /// A successful status with no message.
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    /// A status with the given code and message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns `true` for [`StatusCode::Ok`].
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// Envelope for every frame on the wire.
///
/// The `payload` field uses `serde_json::value::RawValue` so the receiver
/// decides which payload type to parse based on the call state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl Message {
    /// Creates a new message with the given type and payload.
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => {
                let json = serde_json::to_string(p)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            id: id.into(),
            msg_type,
            payload: raw,
            status: None,
        })
    }

    /// Creates a `data` frame.
    pub fn data<T: Serialize>(id: impl Into<String>, payload: &T) -> Result<Self, serde_json::Error> {
        Message::new(id, MessageType::Data, Some(payload))
    }

    /// Creates a `close_send` frame.
    pub fn close_send(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::CloseSend,
            payload: None,
            status: None,
        }
    }

    /// Creates a terminating `status` frame.
    pub fn status(id: impl Into<String>, status: Status) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Status,
            payload: None,
            status: Some(status),
        }
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }
}
