//! Event Stream Monitor
//!
//! Keeps the long-lived event stream alive and routes SMS notifications to
//! conversation channels.
//!
//! ## States
//!
//! ```text
//! Disconnected --start--> Connecting --frame--> Streaming
//!      ^                       |                    |
//!      +-------- terminal completion (any code) ----+
//! ```
//!
//! Every termination, clean or not, schedules exactly one reconnect after an
//! exponential backoff delay. The delay resets once a connection delivers
//! frames again.

use crate::dispatcher::{Completion, DispatchStatus};
use crate::host::Host;
use crate::payload::{self, StreamFrame, FRAME_TYPE_NOP, FRAME_TYPE_PUSH, FRAME_TYPE_TICKLE};
use crate::registry::ConversationRegistry;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Initial reconnection delay
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Maximum reconnection delay
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Reconnection strategy with exponential backoff
///
/// There is no attempt limit: the stream is retried for as long as the
/// bridge runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionStrategy {
    /// Reconnection attempts since the last healthy connection
    pub attempt: u32,
    pub initial_delay: Duration,
    pub current_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectionStrategy {
    fn default() -> Self {
        Self::new(INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY)
    }
}

impl ReconnectionStrategy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            initial_delay,
            current_delay: initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.initial_delay;
    }

    /// Get next delay, doubling the following one up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt = self.attempt.saturating_add(1);
        self.current_delay = std::cmp::min(self.current_delay.saturating_mul(2), self.max_delay);
        delay
    }

    pub fn status(&self) -> String {
        format!(
            "Attempt {}, next delay: {:?}",
            self.attempt, self.current_delay
        )
    }
}

/// Connection phase of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Disconnected,
    Connecting,
    Streaming,
}

/// Process-wide stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamState {
    pub phase: StreamPhase,
    pub retry_pending: bool,
}

impl StreamState {
    pub fn active(&self) -> bool {
        self.phase != StreamPhase::Disconnected
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            phase: StreamPhase::Disconnected,
            retry_pending: false,
        }
    }
}

/// What the owner must do after a stream completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Nothing to schedule
    Continue,
    /// Schedule one reconnect after this delay
    Reconnect(Duration),
}

/// Stream state machine and push router
#[derive(Debug)]
pub struct StreamMonitor {
    state: StreamState,
    backoff: ReconnectionStrategy,
    default_device: Option<String>,
    connection: Option<u64>,
}

impl StreamMonitor {
    pub fn new(default_device: Option<String>, backoff: ReconnectionStrategy) -> Self {
        Self {
            state: StreamState::default(),
            backoff,
            default_device,
            connection: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn default_device(&self) -> Option<&str> {
        self.default_device.as_deref()
    }

    /// Whether a stream request may be dispatched now
    pub fn can_connect(&self) -> bool {
        self.default_device.is_some() && !self.state.active() && !self.state.retry_pending
    }

    /// Enter `Connecting` for the stream request `request_id`
    ///
    /// Returns `false` (and changes nothing) if no default device is
    /// configured, a connection is already live, or a retry is pending.
    pub fn begin_connect(&mut self, request_id: u64) -> bool {
        if !self.can_connect() {
            debug!("Stream connect skipped in state {:?}", self.state);
            return false;
        }

        info!("Connecting event stream (request {})", request_id);
        self.state.phase = StreamPhase::Connecting;
        self.connection = Some(request_id);
        true
    }

    /// The reconnect timer fired; clears the pending retry
    ///
    /// Returns `true` when a retry was actually pending.
    pub fn take_retry(&mut self) -> bool {
        std::mem::replace(&mut self.state.retry_pending, false)
    }

    /// Handle one completion of the stream request
    pub fn handle_completion(
        &mut self,
        completion: &Completion,
        registry: &mut ConversationRegistry,
        host: &mut dyn Host,
    ) -> StreamOutcome {
        if self.connection != Some(completion.request.id) {
            debug!(
                "Ignoring completion from stale stream request {}",
                completion.request.id
            );
            return StreamOutcome::Continue;
        }

        if self.state.phase == StreamPhase::Connecting && completion.status == DispatchStatus::Running
        {
            info!("Event stream connected");
            self.state.phase = StreamPhase::Streaming;
            self.backoff.reset();
        }

        if !completion.payload.is_empty() {
            self.route_frame(&completion.payload, registry, host);
        }

        if !completion.diagnostic.is_empty() {
            warn!("Stream diagnostic: {}", completion.diagnostic);
        }

        match completion.status {
            DispatchStatus::Running => StreamOutcome::Continue,
            DispatchStatus::Exited(code) => self.on_terminated(code),
        }
    }

    fn on_terminated(&mut self, code: i32) -> StreamOutcome {
        self.state.phase = StreamPhase::Disconnected;
        self.connection = None;

        if self.state.retry_pending {
            return StreamOutcome::Continue;
        }

        let delay = self.backoff.next_delay();
        info!(
            "Event stream ended with {}, reconnecting in {:?} ({})",
            code,
            delay,
            self.backoff.status()
        );
        self.state.retry_pending = true;
        StreamOutcome::Reconnect(delay)
    }

    /// Parse one stream frame and route its notifications
    ///
    /// Returns the number of messages appended to channels. Frames that do
    /// not parse are logged and dropped; the connection is left alone.
    pub fn route_frame(
        &mut self,
        raw: &str,
        registry: &mut ConversationRegistry,
        host: &mut dyn Host,
    ) -> usize {
        let frame: StreamFrame = match payload::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to decode stream frame '{}': {}", raw, e);
                return 0;
            }
        };

        match frame.frame_type.as_str() {
            FRAME_TYPE_PUSH => {}
            FRAME_TYPE_NOP => return 0,
            FRAME_TYPE_TICKLE => {
                debug!("Stream tickle: {:?}", frame.subtype);
                return 0;
            }
            other => {
                debug!("Ignoring stream frame of type {}", other);
                return 0;
            }
        }

        let Some(push) = frame.push else {
            debug!("Push frame without push object");
            return 0;
        };
        let Some(notifications) = push.notifications else {
            debug!("Push frame of type {:?} carries no notifications", push.push_type);
            return 0;
        };

        let Some(device_id) = push
            .source_device_iden
            .as_deref()
            .or(self.default_device.as_deref())
        else {
            warn!(
                "Push with {} notifications has no source device, dropping",
                notifications.len()
            );
            return 0;
        };

        let mut routed = 0;
        for notification in &notifications {
            let handle = match registry.lookup(device_id, &notification.thread_id) {
                Some(channel) => channel.handle,
                None => {
                    let name = format!("unknown #{}", notification.thread_id);
                    registry
                        .register(host, device_id, &notification.thread_id, &name, None)
                        .channel
                        .handle
                }
            };

            debug!(
                "Routing push for thread {} on {} to {}",
                notification.thread_id, device_id, handle
            );
            host.print_message(handle, &notification.to_message());
            routed += 1;
        }

        routed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Operation, PendingRequest, EXIT_COULDNT_CONNECT};
    use crate::test_utils::MemoryHost;

    fn stream_request(id: u64) -> PendingRequest {
        PendingRequest::new(id, Operation::StreamConnect, Duration::ZERO)
    }

    fn push_frame(thread_id: &str, body: &str) -> String {
        serde_json::json!({
            "type": "push",
            "push": {
                "type": "sms_changed",
                "source_device_iden": "dev1",
                "notifications": [{"thread_id": thread_id, "body": body}]
            }
        })
        .to_string()
    }

    fn monitor() -> StreamMonitor {
        StreamMonitor::new(Some("dev1".to_string()), ReconnectionStrategy::default())
    }

    #[test]
    fn test_exponential_backoff() {
        let mut strategy = ReconnectionStrategy::new(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(strategy.next_delay(), Duration::from_secs(1));
        assert_eq!(strategy.next_delay(), Duration::from_secs(2));
        assert_eq!(strategy.next_delay(), Duration::from_secs(4));
        assert_eq!(strategy.next_delay(), Duration::from_secs(5));
        assert_eq!(strategy.next_delay(), Duration::from_secs(5));

        strategy.reset();
        assert_eq!(strategy.attempt, 0);
        assert_eq!(strategy.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_huge_delays_saturate() {
        let initial = Duration::from_secs(u64::MAX / 2 + 1);
        let mut strategy = ReconnectionStrategy::new(initial, Duration::MAX);

        assert_eq!(strategy.next_delay(), initial);
        assert_eq!(strategy.next_delay(), Duration::MAX);
        assert_eq!(strategy.next_delay(), Duration::MAX);
        assert_eq!(strategy.attempt, 3);
    }

    #[test]
    fn test_no_default_device_never_connects() {
        let mut monitor = StreamMonitor::new(None, ReconnectionStrategy::default());
        assert!(!monitor.begin_connect(1));
        assert_eq!(monitor.state().phase, StreamPhase::Disconnected);
    }

    #[test]
    fn test_state_transitions() {
        let mut host = MemoryHost::new();
        let mut registry = ConversationRegistry::new();
        let mut monitor = monitor();

        assert!(monitor.begin_connect(1));
        assert_eq!(monitor.state().phase, StreamPhase::Connecting);
        assert!(!monitor.begin_connect(2));

        let connected = Completion::new(stream_request(1), DispatchStatus::Running);
        assert_eq!(
            monitor.handle_completion(&connected, &mut registry, &mut host),
            StreamOutcome::Continue
        );
        assert_eq!(monitor.state().phase, StreamPhase::Streaming);

        let ended = Completion::new(stream_request(1), DispatchStatus::Exited(0))
            .with_diagnostic("stream ended");
        assert_eq!(
            monitor.handle_completion(&ended, &mut registry, &mut host),
            StreamOutcome::Reconnect(INITIAL_RECONNECT_DELAY)
        );
        assert_eq!(monitor.state().phase, StreamPhase::Disconnected);
        assert!(monitor.state().retry_pending);
        assert!(!monitor.begin_connect(3));

        assert!(monitor.take_retry());
        assert!(!monitor.take_retry());
        assert!(monitor.begin_connect(3));
    }

    #[test]
    fn test_backoff_grows_until_stream_is_healthy() {
        let mut host = MemoryHost::new();
        let mut registry = ConversationRegistry::new();
        let mut monitor = monitor();

        let mut delays = Vec::new();
        for id in 1..=3 {
            assert!(monitor.begin_connect(id));
            let failed = Completion::new(stream_request(id), DispatchStatus::Exited(EXIT_COULDNT_CONNECT));
            match monitor.handle_completion(&failed, &mut registry, &mut host) {
                StreamOutcome::Reconnect(delay) => delays.push(delay),
                other => panic!("unexpected outcome {:?}", other),
            }
            monitor.take_retry();
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );

        assert!(monitor.begin_connect(4));
        let connected = Completion::new(stream_request(4), DispatchStatus::Running);
        monitor.handle_completion(&connected, &mut registry, &mut host);
        let dropped = Completion::new(stream_request(4), DispatchStatus::Exited(0));
        assert_eq!(
            monitor.handle_completion(&dropped, &mut registry, &mut host),
            StreamOutcome::Reconnect(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut host = MemoryHost::new();
        let mut registry = ConversationRegistry::new();
        let mut monitor = monitor();

        assert!(monitor.begin_connect(5));
        let stale = Completion::new(stream_request(4), DispatchStatus::Exited(0));
        assert_eq!(
            monitor.handle_completion(&stale, &mut registry, &mut host),
            StreamOutcome::Continue
        );
        assert_eq!(monitor.state().phase, StreamPhase::Connecting);
    }

    #[test]
    fn test_push_routes_to_known_thread() {
        let mut host = MemoryHost::new();
        let mut registry = ConversationRegistry::new();
        let mut monitor = monitor();

        let known = registry.register(&mut host, "dev1", "12", "Alice", None).channel;
        let routed = monitor.route_frame(&push_frame("12", "hello"), &mut registry, &mut host);

        assert_eq!(routed, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(host.lines(known.handle), vec!["<\thello".to_string()]);
    }

    #[test]
    fn test_push_for_unknown_thread_creates_one_channel() {
        let mut host = MemoryHost::new();
        let mut registry = ConversationRegistry::new();
        let mut monitor = monitor();

        monitor.route_frame(&push_frame("77", "first"), &mut registry, &mut host);
        monitor.route_frame(&push_frame("77", "second"), &mut registry, &mut host);

        assert_eq!(registry.len(), 1);
        let channel = registry.lookup("dev1", "77").unwrap();
        assert_eq!(channel.display_name, "unknown #77");
        assert_eq!(channel.device_id, "dev1");
        assert_eq!(
            host.lines(channel.handle),
            vec!["<\tfirst".to_string(), "<\tsecond".to_string()]
        );
    }

    #[test]
    fn test_notifications_keep_arrival_order() {
        let mut host = MemoryHost::new();
        let mut registry = ConversationRegistry::new();
        let mut monitor = monitor();

        let frame = serde_json::json!({
            "type": "push",
            "push": {
                "source_device_iden": "dev1",
                "notifications": [
                    {"thread_id": "1", "body": "a"},
                    {"thread_id": "1", "body": "b"},
                    {"thread_id": "2", "body": "c"}
                ]
            }
        })
        .to_string();

        assert_eq!(monitor.route_frame(&frame, &mut registry, &mut host), 3);
        let one = registry.lookup("dev1", "1").unwrap().handle;
        assert_eq!(host.lines(one), vec!["<\ta".to_string(), "<\tb".to_string()]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_malformed_frame_leaves_state_unchanged() {
        let mut host = MemoryHost::new();
        let mut registry = ConversationRegistry::new();
        let mut monitor = monitor();

        assert!(monitor.begin_connect(1));
        let garbage = Completion::new(stream_request(1), DispatchStatus::Running)
            .with_payload("{not json");
        assert_eq!(
            monitor.handle_completion(&garbage, &mut registry, &mut host),
            StreamOutcome::Continue
        );
        assert!(registry.is_empty());
        assert_eq!(host.channel_count(), 0);
        assert!(monitor.state().active());
    }

    #[test]
    fn test_keepalive_and_other_frames_are_ignored() {
        let mut host = MemoryHost::new();
        let mut registry = ConversationRegistry::new();
        let mut monitor = monitor();

        assert_eq!(monitor.route_frame(r#"{"type":"nop"}"#, &mut registry, &mut host), 0);
        assert_eq!(
            monitor.route_frame(r#"{"type":"tickle","subtype":"push"}"#, &mut registry, &mut host),
            0
        );
        assert_eq!(
            monitor.route_frame(
                r#"{"type":"push","push":{"type":"mirror","title":"x"}}"#,
                &mut registry,
                &mut host
            ),
            0
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_push_routes_by_source_device() {
        let mut host = MemoryHost::new();
        let mut registry = ConversationRegistry::new();
        let mut monitor = monitor();

        let alice = registry.register(&mut host, "dev1", "1", "Alice", None).channel;
        let bob = registry.register(&mut host, "dev2", "1", "Bob", None).channel;

        let frame = serde_json::json!({
            "type": "push",
            "push": {
                "source_device_iden": "dev2",
                "notifications": [{"thread_id": "1", "body": "from the other phone"}]
            }
        })
        .to_string();
        assert_eq!(monitor.route_frame(&frame, &mut registry, &mut host), 1);

        assert!(host.lines(alice.handle).is_empty());
        assert_eq!(
            host.lines(bob.handle),
            vec!["<\tfrom the other phone".to_string()]
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_push_without_any_device_is_dropped() {
        let mut host = MemoryHost::new();
        let mut registry = ConversationRegistry::new();
        let mut monitor = StreamMonitor::new(None, ReconnectionStrategy::default());

        let frame = serde_json::json!({
            "type": "push",
            "push": {"notifications": [{"thread_id": "1", "body": "orphan"}]}
        })
        .to_string();
        assert_eq!(monitor.route_frame(&frame, &mut registry, &mut host), 0);
        assert!(registry.is_empty());
    }
}
