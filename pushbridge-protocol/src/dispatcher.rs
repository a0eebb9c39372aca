//! Asynchronous Dispatcher
//!
//! Issues one [`RequestDescriptor`] as a non-blocking operation and reports
//! back through the bridge's completion channel. Every dispatch ends with
//! exactly one terminal [`Completion`]; success, failure and timeout all use
//! the same shape, with failure encoded as a non-zero exit code.
//!
//! The long-lived event stream additionally produces
//! [`DispatchStatus::Running`] completions, one per received frame, before
//! its terminal completion.
//!
//! ## Exit codes
//!
//! | code | meaning |
//! |------|---------|
//! | 0    | success, or stream closed by the server |
//! | 7    | could not connect, or connection dropped |
//! | 22   | service answered with a non-success HTTP status |
//! | 28   | operation timed out, or the stream went silent |

use crate::api::{HttpMethod, RequestDescriptor};
use crate::host::ChannelHandle;
use crate::ProtocolError;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

/// Successful completion
pub const EXIT_OK: i32 = 0;

/// Connection failed or dropped
pub const EXIT_COULDNT_CONNECT: i32 = 7;

/// Service answered with an error status
pub const EXIT_HTTP_ERROR: i32 = 22;

/// Operation timed out
pub const EXIT_TIMEOUT: i32 = 28;

/// Timeout used for every HTTP operation
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest silence tolerated on the event stream; the service sends a `nop`
/// frame every 30 seconds
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Kind of an in-flight operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    DeviceList,
    ThreadList,
    ThreadHistory,
    Pushes,
    Push,
    SendSms,
    StreamConnect,
}

/// Operation plus the context its completion handler needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    DeviceList,
    ThreadList {
        device_id: String,
    },
    ThreadHistory {
        handle: ChannelHandle,
        address: String,
    },
    Pushes,
    Push {
        handle: ChannelHandle,
        text: String,
    },
    SendSms {
        handle: ChannelHandle,
        text: String,
    },
    StreamConnect,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::DeviceList => OperationKind::DeviceList,
            Self::ThreadList { .. } => OperationKind::ThreadList,
            Self::ThreadHistory { .. } => OperationKind::ThreadHistory,
            Self::Pushes => OperationKind::Pushes,
            Self::Push { .. } => OperationKind::Push,
            Self::SendSms { .. } => OperationKind::SendSms,
            Self::StreamConnect => OperationKind::StreamConnect,
        }
    }
}

/// An in-flight operation record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: u64,
    pub operation: Operation,
    /// `Duration::ZERO` means the operation never times out
    pub timeout: Duration,
}

impl PendingRequest {
    pub fn new(id: u64, operation: Operation, timeout: Duration) -> Self {
        Self {
            id,
            operation,
            timeout,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }
}

/// Status reported with a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Partial output; the operation is still running
    Running,
    /// The operation ended with this exit code
    Exited(i32),
}

impl DispatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Exited(code) if *code > 0)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Running => None,
            Self::Exited(code) => Some(*code),
        }
    }
}

/// Result of a dispatched operation, delivered to the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub request: PendingRequest,
    pub status: DispatchStatus,
    /// Response body or stream frame, possibly empty
    pub payload: String,
    /// Transport diagnostic, empty when there is nothing to report
    pub diagnostic: String,
}

impl Completion {
    pub fn new(request: PendingRequest, status: DispatchStatus) -> Self {
        Self {
            request,
            status,
            payload: String::new(),
            diagnostic: String::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = diagnostic.into();
        self
    }

    /// HTTP status of an [`EXIT_HTTP_ERROR`] completion, from its diagnostic
    pub fn http_status(&self) -> Option<u16> {
        self.diagnostic
            .strip_prefix("HTTP ")
            .and_then(|status| status.trim().parse().ok())
    }
}

/// Issues request descriptors without blocking the caller
pub trait Dispatcher: Send {
    fn dispatch(&self, descriptor: RequestDescriptor, request: PendingRequest);
}

/// Dispatcher backed by reqwest (HTTP) and tokio-tungstenite (event stream)
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct NetDispatcher {
    client: reqwest::Client,
    completions: mpsc::UnboundedSender<Completion>,
    stream_idle_timeout: Duration,
}

impl NetDispatcher {
    pub fn new(completions: mpsc::UnboundedSender<Completion>) -> Self {
        Self::with_client(reqwest::Client::new(), completions)
    }

    pub fn with_client(
        client: reqwest::Client,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        Self {
            client,
            completions,
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
        }
    }

    /// Drop the event stream after this long without any frame
    /// (`Duration::ZERO` waits forever)
    pub fn with_stream_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.stream_idle_timeout = idle_timeout;
        self
    }
}

impl Dispatcher for NetDispatcher {
    fn dispatch(&self, descriptor: RequestDescriptor, request: PendingRequest) {
        debug!(
            "Dispatching request {} ({:?}): {}",
            request.id,
            request.kind(),
            descriptor
        );

        let completions = self.completions.clone();
        if descriptor.is_websocket() {
            tokio::spawn(run_stream(
                descriptor,
                request,
                self.stream_idle_timeout,
                completions,
            ));
        } else {
            let client = self.client.clone();
            tokio::spawn(async move {
                let completion = run_http(&client, &descriptor, request).await;
                if completions.send(completion).is_err() {
                    debug!("Completion channel closed, dropping result");
                }
            });
        }
    }
}

async fn execute_http(
    client: &reqwest::Client,
    descriptor: &RequestDescriptor,
) -> crate::Result<String> {
    let mut builder = match descriptor.method {
        HttpMethod::Get => client.get(&descriptor.url),
        HttpMethod::Post => client.post(&descriptor.url),
    };
    for (name, value) in &descriptor.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &descriptor.body {
        builder = builder.body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        Ok(body)
    } else {
        Err(ProtocolError::HttpStatus {
            status: status.as_u16(),
            body,
        })
    }
}

async fn run_http(
    client: &reqwest::Client,
    descriptor: &RequestDescriptor,
    request: PendingRequest,
) -> Completion {
    let result = if request.timeout.is_zero() {
        execute_http(client, descriptor).await
    } else {
        match tokio::time::timeout(request.timeout, execute_http(client, descriptor)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(format!(
                "{} after {:?}",
                descriptor, request.timeout
            ))),
        }
    };

    match result {
        Ok(body) => Completion::new(request, DispatchStatus::Exited(EXIT_OK)).with_payload(body),
        Err(ProtocolError::HttpStatus { status, body }) => {
            warn!("{} answered HTTP {}", descriptor, status);
            Completion::new(request, DispatchStatus::Exited(EXIT_HTTP_ERROR))
                .with_payload(body)
                .with_diagnostic(format!("HTTP {}", status))
        }
        Err(e @ ProtocolError::Timeout(_)) => {
            warn!("{}", e);
            Completion::new(request, DispatchStatus::Exited(EXIT_TIMEOUT))
                .with_diagnostic(e.to_string())
        }
        Err(e) => {
            warn!("{} failed: {}", descriptor, e);
            Completion::new(request, DispatchStatus::Exited(EXIT_COULDNT_CONNECT))
                .with_diagnostic(e.to_string())
        }
    }
}

async fn run_stream(
    descriptor: RequestDescriptor,
    request: PendingRequest,
    idle_timeout: Duration,
    completions: mpsc::UnboundedSender<Completion>,
) {
    let connect = connect_async(descriptor.url.as_str());
    let connected = if request.timeout.is_zero() {
        connect
            .await
            .map_err(|e| ProtocolError::WebSocket(e.to_string()))
    } else {
        match tokio::time::timeout(request.timeout, connect).await {
            Ok(result) => result.map_err(|e| ProtocolError::WebSocket(e.to_string())),
            Err(_) => Err(ProtocolError::Timeout(descriptor.to_string())),
        }
    };

    let mut stream = match connected {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!("Stream connection failed: {}", e);
            let _ = completions.send(
                Completion::new(request, DispatchStatus::Exited(EXIT_COULDNT_CONNECT))
                    .with_diagnostic(e.to_string()),
            );
            return;
        }
    };

    debug!("Stream connected: {}", descriptor);
    if completions
        .send(Completion::new(request.clone(), DispatchStatus::Running))
        .is_err()
    {
        return;
    }

    let terminal = loop {
        let next = if idle_timeout.is_zero() {
            stream.next().await
        } else {
            match tokio::time::timeout(idle_timeout, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!("No stream frame for {:?}, dropping connection", idle_timeout);
                    break Completion::new(request, DispatchStatus::Exited(EXIT_TIMEOUT))
                        .with_diagnostic(format!("stream idle for {:?}", idle_timeout));
                }
            }
        };

        match next {
            Some(Ok(WsMessage::Text(text))) => {
                let frame = Completion::new(request.clone(), DispatchStatus::Running)
                    .with_payload(text.as_str().to_owned());
                if completions.send(frame).is_err() {
                    debug!("Completion channel closed, dropping stream");
                    return;
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                let reason = frame
                    .map(|f| format!("stream closed by server (code {})", u16::from(f.code)))
                    .unwrap_or_else(|| "stream closed by server".to_string());
                break Completion::new(request, DispatchStatus::Exited(EXIT_OK))
                    .with_diagnostic(reason);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                break Completion::new(request, DispatchStatus::Exited(EXIT_COULDNT_CONNECT))
                    .with_diagnostic(e.to_string());
            }
            None => {
                break Completion::new(request, DispatchStatus::Exited(EXIT_OK))
                    .with_diagnostic("stream ended");
            }
        }
    };

    let _ = completions.send(terminal);
}
