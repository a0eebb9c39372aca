//! Error handling for the bridge core
//!
//! Errors never escape the event loop: every completion handler logs what it
//! detects and carries on. The enum still matters because the decode helpers,
//! the dispatcher and the daemon's startup path all return `Result`.
//!
//! ## Error Categories
//!
//! ### Transport failures
//! Non-zero dispatch status, HTTP errors, websocket errors and timeouts.
//! Outbound sends annotate the channel; other failures a retry cannot fix
//! are shown in the core channel via [`ProtocolError::user_message`].
//!
//! ### Malformed payloads
//! JSON that does not parse. Logged together with the raw payload, the
//! operation is then treated as a no-op.
//!
//! ### Missing fields
//! Valid JSON that lacks the expected key. Treated as "no data".

use thiserror::Error;

/// Result type for bridge operations
///
/// # Examples
///
/// ```rust
/// use pushbridge_protocol::Result;
///
/// fn example() -> Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur while talking to the remote service
///
/// # Examples
///
/// ```rust
/// use pushbridge_protocol::ProtocolError;
///
/// let error = ProtocolError::MissingField("threads".to_string());
/// assert_eq!(error.to_string(), "Missing field: threads");
///
/// let error = ProtocolError::Timeout("GET /v2/devices".to_string());
/// assert_eq!(error.to_string(), "Request timed out: GET /v2/devices");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON that failed to parse
    ///
    /// Automatically converted from `serde_json::Error`.
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// Expected key absent from otherwise valid JSON
    #[error("Missing field: {0}")]
    MissingField(String),

    /// HTTP client error
    ///
    /// Automatically converted from `reqwest::Error`.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status
    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Websocket error on the event stream
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Generic transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request exceeded its timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Operation attempted in an invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl ProtocolError {
    /// Check if this error is transient and the operation could succeed on retry
    ///
    /// # Examples
    ///
    /// ```rust
    /// use pushbridge_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::Timeout("stream".to_string()).is_recoverable());
    /// assert!(!ProtocolError::MissingField("thread".to_string()).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProtocolError::Timeout(_)
            | ProtocolError::Transport(_)
            | ProtocolError::WebSocket(_)
            | ProtocolError::Http(_) => true,
            ProtocolError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Get a short message suitable for printing into a channel
    ///
    /// # Examples
    ///
    /// ```rust
    /// use pushbridge_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::HttpStatus { status: 401, body: String::new() };
    /// assert_eq!(
    ///     error.user_message(),
    ///     "Access token rejected (HTTP 401). Check the account configuration."
    /// );
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::HttpStatus { status, .. } if *status == 401 || *status == 403 => {
                format!(
                    "Access token rejected (HTTP {}). Check the account configuration.",
                    status
                )
            }
            ProtocolError::HttpStatus { status, .. } => {
                format!("Service answered HTTP {}.", status)
            }
            ProtocolError::Timeout(msg) => {
                format!("Request timed out: {}. Check network connection.", msg)
            }
            ProtocolError::MalformedPayload(_) => {
                "Received data the bridge could not understand.".to_string()
            }
            ProtocolError::MissingField(field) => format!("No {} in response.", field),
            other => other.to_string(),
        }
    }
}
