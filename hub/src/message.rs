use crate::error::Result;
use serde::{Deserialize, Serialize};

/// The unit of work flowing from clients through the broadcast engine and the relay bus.
///
/// `origin_id` and `hub_id` are fixed at creation. `sender_id` names the immediate source
/// of this copy and is rewritten once, when the message crosses the relay bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    origin_id: String,
    hub_id: String,
    sender_id: String,
    #[serde(rename = "message", with = "base64_payload")]
    payload: Vec<u8>,
}

impl Message {
    fn new(
        origin_id: impl Into<String>,
        hub_id: impl Into<String>,
        sender_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            origin_id: origin_id.into(),
            hub_id: hub_id.into(),
            sender_id: sender_id.into(),
            payload,
        }
    }

    /// A message authored by a locally attached client.
    pub fn from_client(connection_id: &str, hub_id: &str, payload: Vec<u8>) -> Self {
        Self::new(connection_id, hub_id, connection_id, payload)
    }

    /// Marks this copy as received from the relay bus.
    pub fn relayed_from(mut self, topic: &str) -> Self {
        self.sender_id = topic.to_string();
        self
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub fn hub_id(&self) -> &str {
        &self.hub_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_from_relay(&self, topic: &str) -> bool {
        self.sender_id == topic
    }

    /// Encodes the message as the JSON object published on the relay bus.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

// The payload travels as a standard base64 string, the way a byte slice is written
// by the JSON encoders of the other hub implementations sharing the topic.
mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(D::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
