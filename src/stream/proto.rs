use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default inbound envelope pushed by the dashboard stream server.
///
/// `kind` identifies the event (eg, `match_update`, `player_stats`); `data`
/// carries the event body and is left untyped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl StreamMessage {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: None,
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decodes one inbound frame into a message.
pub fn decode_frame<M>(frame: &[u8]) -> Result<M, serde_json::Error>
where
    M: DeserializeOwned,
{
    serde_json::from_slice(frame)
}

/// Encodes an outbound payload as a text frame.
pub fn encode_payload<T>(payload: &T) -> Result<String, serde_json::Error>
where
    T: Serialize + ?Sized,
{
    serde_json::to_string(payload)
}
