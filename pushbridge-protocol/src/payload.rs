//! Wire Payloads
//!
//! Schema structs for every JSON shape the bridge receives, from the HTTP API
//! and from the event stream. Decoding fails closed: text that is not JSON
//! becomes [`ProtocolError::MalformedPayload`], and a top-level key that is
//! absent becomes [`ProtocolError::MissingField`] through [`require`].
//!
//! ## Shapes
//!
//! - `{"devices": [{"iden", "model", ...}]}`
//! - `{"threads": [{"id", "recipients": [{"name", "address", "number"}]}]}`
//! - `{"thread": [{"direction", "body", "timestamp"}]}` (newest first)
//! - `{"pushes": [{"title", "body", "created"}]}` (newest first)
//! - `{"type": "push", "push": {"source_device_iden", "notifications": [...]}}`

use crate::{ProtocolError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stream frame type carrying a push
pub const FRAME_TYPE_PUSH: &str = "push";

/// Stream keep-alive frame type
pub const FRAME_TYPE_NOP: &str = "nop";

/// Stream frame type announcing that some collection changed
pub const FRAME_TYPE_TICKLE: &str = "tickle";

/// Decode a raw payload into a schema struct
///
/// # Examples
///
/// ```rust
/// use pushbridge_protocol::payload::{decode, DevicesPayload};
///
/// let payload: DevicesPayload = decode(r#"{"devices": []}"#).unwrap();
/// assert_eq!(payload.devices.map(|d| d.len()), Some(0));
///
/// assert!(decode::<DevicesPayload>("<html>502</html>").is_err());
/// ```
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

/// Turn an absent top-level key into [`ProtocolError::MissingField`]
pub fn require<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| ProtocolError::MissingField(field.to_string()))
}

/// Direction of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    /// Map the service's `direction` field; anything but "outgoing" is incoming
    pub fn from_wire(direction: Option<&str>) -> Self {
        match direction {
            Some("outgoing") => Self::Outgoing,
            _ => Self::Incoming,
        }
    }

    /// Line prefix used when rendering
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Incoming => "<",
            Self::Outgoing => ">",
        }
    }
}

/// A rendered conversation message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub direction: Direction,
    pub body: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn incoming(body: impl Into<String>) -> Self {
        Self {
            direction: Direction::Incoming,
            body: body.into(),
            timestamp: None,
        }
    }

    pub fn outgoing(body: impl Into<String>) -> Self {
        Self {
            direction: Direction::Outgoing,
            body: body.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Render as a host line: `<prefix>\t<body>`
    pub fn render(&self) -> String {
        format!("{}\t{}", self.direction.prefix(), self.body)
    }
}

/// Convert the service's fractional epoch seconds into a UTC timestamp
pub fn timestamp_from_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let millis = (secs * 1000.0) as i64;
    Utc.timestamp_millis_opt(millis).single()
}

/// Accept ids sent either as strings or as numbers
fn deserialize_iden<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(Error::custom("id must be a string or number")),
    }
}

/// `GET /v2/devices` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevicesPayload {
    #[serde(default)]
    pub devices: Option<Vec<Device>>,
}

/// One device registered on the account
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub iden: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub has_sms: bool,
    #[serde(default)]
    pub active: Option<bool>,
}

impl Device {
    /// `iden : model` line printed by the device listing
    pub fn summary(&self) -> String {
        format!(
            "{} : {}",
            self.iden,
            self.model
                .as_deref()
                .or(self.nickname.as_deref())
                .unwrap_or("unknown")
        )
    }
}

/// `GET /v2/permanents/<device>_threads` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadsPayload {
    #[serde(default)]
    pub threads: Option<Vec<ThreadEntry>>,
}

/// One SMS thread on a device
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadEntry {
    #[serde(deserialize_with = "deserialize_iden")]
    pub id: String,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
}

/// A participant of an SMS thread
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Recipient {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
}

/// `GET /v2/permanents/<device>_thread_<id>` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadPayload {
    #[serde(default)]
    pub thread: Option<Vec<ThreadMessage>>,
}

/// One message of a thread history
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadMessage {
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl ThreadMessage {
    pub fn to_message(&self) -> Message {
        Message {
            direction: Direction::from_wire(self.direction.as_deref()),
            body: self.body.clone(),
            timestamp: self.timestamp.and_then(timestamp_from_secs),
        }
    }
}

/// `GET /v2/pushes` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushesPayload {
    #[serde(default)]
    pub pushes: Option<Vec<PushEntry>>,
}

/// One push of the aggregate feed
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushEntry {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub created: Option<f64>,
}

impl PushEntry {
    /// Line shown in the push feed, `None` for pushes with nothing to show
    pub fn display_line(&self) -> Option<String> {
        self.body
            .as_deref()
            .or(self.title.as_deref())
            .or(self.url.as_deref())
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }
}

/// A frame received on the event stream
#[derive(Debug, Clone, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub push: Option<StreamPush>,
}

/// The `push` object of a push frame
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamPush {
    #[serde(rename = "type", default)]
    pub push_type: Option<String>,
    #[serde(default)]
    pub source_device_iden: Option<String>,
    #[serde(default)]
    pub notifications: Option<Vec<Notification>>,
}

/// One SMS notification inside a push frame
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    #[serde(deserialize_with = "deserialize_iden")]
    pub thread_id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl Notification {
    pub fn to_message(&self) -> Message {
        Message::incoming(self.body.clone()).with_timestamp(self.timestamp.and_then(timestamp_from_secs))
    }
}
