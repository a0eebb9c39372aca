//! Remote API Client
//!
//! Builds [`RequestDescriptor`]s for every logical operation the bridge
//! performs against the service. Building a descriptor never touches the
//! network; the [`Dispatcher`](crate::dispatcher::Dispatcher) issues it.
//!
//! ## Endpoints
//!
//! - `GET  /v2/devices` - device list
//! - `GET  /v2/permanents/<device>_threads` - SMS threads of a device
//! - `GET  /v2/permanents/<device>_thread_<id>` - history of one thread
//! - `GET  /v2/pushes` - aggregate push feed
//! - `POST /v2/texts` - send an SMS through a device
//! - `POST /v2/pushes` - push a note
//! - `wss://stream.pushbullet.com/websocket/<token>` - event stream

use crate::payload::ThreadEntry;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Default HTTP API base URL
pub const DEFAULT_API_BASE_URL: &str = "https://api.pushbullet.com";

/// Default event stream base URL
pub const DEFAULT_STREAM_BASE_URL: &str = "wss://stream.pushbullet.com/websocket";

const ACCESS_TOKEN_HEADER: &str = "Access-Token";

/// HTTP method of a request descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// Everything needed to issue one request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl RequestDescriptor {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: &Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers,
            body: Some(body.to_string()),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether this descriptor targets a websocket endpoint
    pub fn is_websocket(&self) -> bool {
        self.url.starts_with("ws://") || self.url.starts_with("wss://")
    }

    /// Parse the body back into JSON (used by tests and logging)
    pub fn json_body(&self) -> Option<Value> {
        self.body
            .as_deref()
            .and_then(|body| serde_json::from_str(body).ok())
    }
}

impl fmt::Display for RequestDescriptor {
    /// Loggable form; the stream URL embeds the access token, so its last
    /// path segment is masked.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_websocket() {
            let base = self
                .url
                .rsplit_once('/')
                .map(|(base, _)| base)
                .unwrap_or(&self.url);
            write!(f, "{} {}/***", self.method.as_str(), base)
        } else {
            write!(f, "{} {}", self.method.as_str(), self.url)
        }
    }
}

/// A thread entry reduced to what a conversation channel needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSummary {
    /// Remote thread key, used as the registry address
    pub address: String,
    /// Channel display name
    pub name: String,
    /// Phone number outbound SMS go to, when the thread lists one
    pub recipient: Option<String>,
}

/// Logical operations of the remote service
pub trait ApiClient: Send {
    fn get_devices(&self) -> RequestDescriptor;

    fn get_threads(&self, device_id: &str) -> RequestDescriptor;

    fn get_thread_history(&self, device_id: &str, address: &str) -> RequestDescriptor;

    fn get_pushes(&self) -> RequestDescriptor;

    fn build_send_sms_request(&self, device_id: &str, address: &str, text: &str)
        -> RequestDescriptor;

    fn build_push_request(&self, text: &str) -> RequestDescriptor;

    fn build_stream_request(&self) -> RequestDescriptor;

    /// Derive `(address, name, recipient)` from a thread list entry
    fn parse_thread(&self, thread: &ThreadEntry) -> Option<ThreadSummary> {
        parse_thread(thread)
    }
}

/// Default thread parsing: the thread id is the address, recipient names
/// joined with ", " form the display name.
pub fn parse_thread(thread: &ThreadEntry) -> Option<ThreadSummary> {
    if thread.id.is_empty() {
        return None;
    }

    let names: Vec<&str> = thread
        .recipients
        .iter()
        .filter_map(|r| {
            r.name
                .as_deref()
                .or(r.address.as_deref())
                .or(r.number.as_deref())
        })
        .filter(|name| !name.is_empty())
        .collect();

    let name = if names.is_empty() {
        format!("thread #{}", thread.id)
    } else {
        names.join(", ")
    };

    let recipient = thread
        .recipients
        .iter()
        .find_map(|r| r.address.clone().or_else(|| r.number.clone()))
        .filter(|address| !address.is_empty());

    Some(ThreadSummary {
        address: thread.id.clone(),
        name,
        recipient,
    })
}

/// Pushbullet v2 API client
#[derive(Debug, Clone)]
pub struct PushbulletApi {
    access_token: String,
    api_base_url: String,
    stream_base_url: String,
}

impl PushbulletApi {
    /// Create a client against the public service
    pub fn new(access_token: impl Into<String>) -> Self {
        Self::with_base_urls(access_token, DEFAULT_API_BASE_URL, DEFAULT_STREAM_BASE_URL)
    }

    /// Create a client with custom base URLs (for testing)
    pub fn with_base_urls(
        access_token: impl Into<String>,
        api_base_url: &str,
        stream_base_url: &str,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            stream_base_url: stream_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn v2(&self, path: &str) -> String {
        format!("{}/v2/{}", self.api_base_url, path)
    }

    fn authed(&self, descriptor: RequestDescriptor) -> RequestDescriptor {
        descriptor.with_header(ACCESS_TOKEN_HEADER, self.access_token.clone())
    }
}

impl ApiClient for PushbulletApi {
    fn get_devices(&self) -> RequestDescriptor {
        self.authed(RequestDescriptor::get(self.v2("devices")))
    }

    fn get_threads(&self, device_id: &str) -> RequestDescriptor {
        self.authed(RequestDescriptor::get(
            self.v2(&format!("permanents/{}_threads", device_id)),
        ))
    }

    fn get_thread_history(&self, device_id: &str, address: &str) -> RequestDescriptor {
        self.authed(RequestDescriptor::get(
            self.v2(&format!("permanents/{}_thread_{}", device_id, address)),
        ))
    }

    fn get_pushes(&self) -> RequestDescriptor {
        self.authed(RequestDescriptor::get(self.v2("pushes?active=true")))
    }

    fn build_send_sms_request(
        &self,
        device_id: &str,
        address: &str,
        text: &str,
    ) -> RequestDescriptor {
        let body = json!({
            "data": {
                "target_device_iden": device_id,
                "addresses": [address],
                "message": text,
            }
        });
        self.authed(RequestDescriptor::post_json(self.v2("texts"), &body))
    }

    fn build_push_request(&self, text: &str) -> RequestDescriptor {
        let body = json!({
            "type": "note",
            "body": text,
            "guid": uuid::Uuid::new_v4().to_string(),
        });
        self.authed(RequestDescriptor::post_json(self.v2("pushes"), &body))
    }

    fn build_stream_request(&self) -> RequestDescriptor {
        RequestDescriptor::get(format!("{}/{}", self.stream_base_url, self.access_token))
    }
}
