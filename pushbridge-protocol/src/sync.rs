//! Sync Coordinator
//!
//! Drives the catch-up chain `devices -> threads -> history` and the one-shot
//! fetch of the aggregate push feed. Each step dispatches a request and the
//! next step runs from that request's completion handler.
//!
//! Failures are local: a missing key or an undecodable payload turns the
//! step into a no-op, while every other device and thread keeps loading.

use crate::dispatcher::{Completion, Operation, EXIT_HTTP_ERROR, EXIT_TIMEOUT};
use crate::host::{ChannelHandle, LOCAL_VAR_ADDRESS, LOCAL_VAR_DEVICE};
use crate::payload::{self, DevicesPayload, PushesPayload, ThreadPayload, ThreadsPayload};
use crate::registry::AGGREGATE_KEY;
use crate::session::Session;
use crate::{ProtocolError, Result};
use tracing::{debug, info, warn};

/// Catch-up chain driver
#[derive(Debug, Default, Clone)]
pub struct SyncCoordinator {
    default_device: Option<String>,
}

impl SyncCoordinator {
    pub fn new(default_device: Option<String>) -> Self {
        Self { default_device }
    }

    pub fn default_device(&self) -> Option<&str> {
        self.default_device.as_deref()
    }

    /// Startup sequence: device list, push feed, then the default device
    pub fn start(&self, session: &mut Session) {
        self.get_devices(session);
        self.open_push_feed(session);
        session
            .host
            .print_core("launch '/pb_d <device_id>' to load device");

        if let Some(device_id) = self.default_device.clone() {
            self.load_device(session, &device_id);
        }
    }

    /// Fetch the device list; the result is printed to the core channel
    pub fn get_devices(&self, session: &mut Session) -> u64 {
        let descriptor = session.api.get_devices();
        session.submit(descriptor, Operation::DeviceList)
    }

    /// Fetch the thread list of a device
    pub fn load_device(&self, session: &mut Session, device_id: &str) -> u64 {
        info!("Loading threads for device {}", device_id);
        session
            .host
            .print_core(&format!("loading threads for device {}", device_id));

        let descriptor = session.api.get_threads(device_id);
        session.submit(
            descriptor,
            Operation::ThreadList {
                device_id: device_id.to_string(),
            },
        )
    }

    /// Fetch (again) the history of the thread shown in `handle`
    ///
    /// Returns `None` when the channel has no address or device attached.
    pub fn reload_thread(&self, session: &mut Session, handle: ChannelHandle) -> Option<u64> {
        let address = session.host.get_local_var(handle, LOCAL_VAR_ADDRESS);
        let device = session.host.get_local_var(handle, LOCAL_VAR_DEVICE);

        let (Some(address), Some(device)) = (address, device) else {
            warn!("Channel {} is not a conversation, not reloading", handle);
            session
                .host
                .print(handle, "this channel has no thread to reload");
            return None;
        };

        let descriptor = session.api.get_thread_history(&device, &address);
        Some(session.submit(descriptor, Operation::ThreadHistory { handle, address }))
    }

    /// Create the aggregate feed channel and fetch its content once
    pub fn open_push_feed(&self, session: &mut Session) -> u64 {
        let handle = match session.registry.aggregate() {
            Some(handle) => handle,
            None => {
                let handle = session.host.create_channel(AGGREGATE_KEY);
                session.registry.register_aggregate(AGGREGATE_KEY, handle);
                handle
            }
        };
        debug!("Push feed channel is {}", handle);

        let descriptor = session.api.get_pushes();
        session.submit(descriptor, Operation::Pushes)
    }

    /// Print `iden : model` per device
    pub fn on_device_list(&self, session: &mut Session, completion: &Completion) {
        let devices = match successful_payload(completion)
            .and_then(|raw| payload::decode::<DevicesPayload>(raw))
            .and_then(|p| payload::require(p.devices, "devices"))
        {
            Ok(devices) => devices,
            Err(e) => return no_data(session, "device list", completion, e),
        };

        session.host.print_core("devices:");
        for device in &devices {
            session.host.print_core(&device.summary());
        }
        info!("Listed {} devices", devices.len());
    }

    /// Register every thread of a device and request its history
    pub fn on_thread_list(&self, session: &mut Session, device_id: &str, completion: &Completion) {
        let threads = match successful_payload(completion)
            .and_then(|raw| payload::decode::<ThreadsPayload>(raw))
            .and_then(|p| payload::require(p.threads, "threads"))
        {
            Ok(threads) => threads,
            Err(e) => return no_data(session, "thread list", completion, e),
        };

        info!("Device {} has {} threads", device_id, threads.len());
        for thread in &threads {
            let Some(summary) = session.api.parse_thread(thread) else {
                debug!("Skipping thread entry without id");
                continue;
            };

            session.host.print_core(&format!(
                "loading device {}, {}, {}",
                device_id, summary.address, summary.name
            ));

            let registration = session.registry.register(
                session.host.as_mut(),
                device_id,
                &summary.address,
                &summary.name,
                summary.recipient.as_deref(),
            );
            self.reload_thread(session, registration.channel.handle);
        }
    }

    /// Append a thread's history, oldest first
    pub fn on_thread_history(
        &self,
        session: &mut Session,
        handle: ChannelHandle,
        address: &str,
        completion: &Completion,
    ) {
        let messages = match successful_payload(completion)
            .and_then(|raw| payload::decode::<ThreadPayload>(raw))
            .and_then(|p| payload::require(p.thread, "thread"))
        {
            Ok(messages) => messages,
            Err(e) => return no_data(session, "thread history", completion, e),
        };

        if session.registry.lookup_handle(handle).is_none() {
            debug!("Channel {} for thread {} is gone, dropping history", handle, address);
            return;
        }

        debug!("Thread {}: {} messages", address, messages.len());
        for message in messages.iter().rev() {
            session.host.print_message(handle, &message.to_message());
        }
    }

    /// Append the push feed, oldest first
    pub fn on_pushes(&self, session: &mut Session, completion: &Completion) {
        let pushes = match successful_payload(completion)
            .and_then(|raw| payload::decode::<PushesPayload>(raw))
            .and_then(|p| payload::require(p.pushes, "pushes"))
        {
            Ok(pushes) => pushes,
            Err(e) => return no_data(session, "push feed", completion, e),
        };

        let Some(handle) = session.registry.aggregate() else {
            debug!("Push feed channel is closed, dropping pushes");
            return;
        };

        for line in pushes.iter().rev().filter_map(|push| push.display_line()) {
            session.host.print(handle, &line);
        }
    }
}

fn successful_payload(completion: &Completion) -> Result<&str> {
    match completion.status.code() {
        Some(0) => Ok(completion.payload.as_str()),
        Some(EXIT_HTTP_ERROR) => Err(ProtocolError::HttpStatus {
            status: completion.http_status().unwrap_or_default(),
            body: completion.payload.clone(),
        }),
        Some(EXIT_TIMEOUT) => Err(ProtocolError::Timeout(completion.diagnostic.clone())),
        Some(code) => Err(ProtocolError::Transport(format!(
            "exit code {}: {}",
            code, completion.diagnostic
        ))),
        None => Err(ProtocolError::InvalidState(
            "partial completion for a one-shot request".to_string(),
        )),
    }
}

/// Treat a failed step as "no data"; failures a retry cannot fix are also
/// shown in the core channel
fn no_data(session: &mut Session, what: &str, completion: &Completion, error: ProtocolError) {
    match error {
        ProtocolError::MissingField(field) => {
            debug!("No {} in response: missing '{}'", what, field);
        }
        ProtocolError::MalformedPayload(e) => {
            warn!("Failed to decode {}: {} ('{}')", what, e, completion.payload);
        }
        ProtocolError::InvalidState(reason) => {
            debug!("Ignoring {} completion: {}", what, reason);
        }
        other => {
            warn!("Request {} for {} failed: {}", completion.request.id, what, other);
            if !other.is_recoverable() {
                session
                    .host
                    .print_core(&format!("{}: {}", what, other.user_message()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DispatchStatus, OperationKind};
    use crate::test_utils::{complete, session_with, MemoryHost, RecordingDispatcher};
    use serde_json::json;

    #[test]
    fn test_start_requests_devices_pushes_and_threads() {
        let host = MemoryHost::new();
        let dispatcher = RecordingDispatcher::new();
        let mut session = session_with(host.clone(), dispatcher.clone());

        SyncCoordinator::new(Some("dev1".to_string())).start(&mut session);

        let kinds: Vec<_> = dispatcher.take().iter().map(|(_, r)| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![OperationKind::DeviceList, OperationKind::Pushes, OperationKind::ThreadList]
        );
        assert!(session.registry.aggregate().is_some());
        assert!(host.core_lines().iter().any(|l| l.contains("/pb_d")));
    }

    #[test]
    fn test_device_list_goes_to_core() {
        let host = MemoryHost::new();
        let mut session = session_with(host.clone(), RecordingDispatcher::new());
        let sync = SyncCoordinator::default();

        let body = json!({"devices": [
            {"iden": "dev1", "model": "Pixel 7"},
            {"iden": "dev2", "model": "Moto G"}
        ]});
        sync.on_device_list(&mut session, &complete(Operation::DeviceList, 0, &body.to_string()));

        let core = host.core_lines();
        assert!(core.contains(&"dev1 : Pixel 7".to_string()));
        assert!(core.contains(&"dev2 : Moto G".to_string()));
    }

    #[test]
    fn test_thread_list_registers_and_reloads_each_thread() {
        let host = MemoryHost::new();
        let dispatcher = RecordingDispatcher::new();
        let mut session = session_with(host.clone(), dispatcher.clone());
        let sync = SyncCoordinator::default();

        let body = json!({"threads": [
            {"id": "1", "recipients": [{"name": "Alice", "address": "+15550101"}]},
            {"id": "2", "recipients": [{"name": "Bob", "number": "+15550102"}]}
        ]});
        let operation = Operation::ThreadList {
            device_id: "dev1".to_string(),
        };
        sync.on_thread_list(&mut session, "dev1", &complete(operation, 0, &body.to_string()));

        assert_eq!(session.registry.len(), 2);
        let alice = session.registry.lookup("dev1", "1").unwrap();
        assert_eq!(alice.display_name, "Alice");
        assert_eq!(alice.recipient.as_deref(), Some("+15550101"));

        let sent = dispatcher.take();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].0.url.ends_with("/v2/permanents/dev1_thread_1"));
        assert!(sent[1].0.url.ends_with("/v2/permanents/dev1_thread_2"));
    }

    #[test]
    fn test_two_devices_with_the_same_thread_id() {
        let host = MemoryHost::new();
        let dispatcher = RecordingDispatcher::new();
        let mut session = session_with(host.clone(), dispatcher.clone());
        let sync = SyncCoordinator::default();

        let threads_a = json!({"threads": [
            {"id": "1", "recipients": [{"name": "Alice", "address": "+15550101"}]}
        ]});
        let threads_b = json!({"threads": [
            {"id": "1", "recipients": [{"name": "Bob", "address": "+15550202"}]}
        ]});
        for (device, body) in [("devA", threads_a), ("devB", threads_b)] {
            let operation = Operation::ThreadList {
                device_id: device.to_string(),
            };
            sync.on_thread_list(&mut session, device, &complete(operation, 0, &body.to_string()));
        }

        assert_eq!(session.registry.len(), 2);
        assert_eq!(host.channel_count(), 2);
        let alice = session.registry.lookup("devA", "1").unwrap().clone();
        let bob = session.registry.lookup("devB", "1").unwrap().clone();
        assert_ne!(alice.handle, bob.handle);
        assert_eq!(bob.recipient.as_deref(), Some("+15550202"));

        let urls: Vec<String> = dispatcher.take().into_iter().map(|(d, _)| d.url).collect();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].ends_with("/v2/permanents/devA_thread_1"));
        assert!(urls[1].ends_with("/v2/permanents/devB_thread_1"));

        let history = json!({"thread": [{"direction": "incoming", "body": "hi from B"}]});
        let operation = Operation::ThreadHistory {
            handle: bob.handle,
            address: "1".to_string(),
        };
        sync.on_thread_history(
            &mut session,
            bob.handle,
            "1",
            &complete(operation, 0, &history.to_string()),
        );
        assert_eq!(host.lines(bob.handle), vec!["<\thi from B".to_string()]);
        assert!(host.lines(alice.handle).is_empty());
    }

    #[test]
    fn test_rejected_token_is_reported_in_core() {
        let host = MemoryHost::new();
        let mut session = session_with(host.clone(), RecordingDispatcher::new());

        let completion = complete(Operation::DeviceList, EXIT_HTTP_ERROR, "")
            .with_diagnostic("HTTP 401");
        SyncCoordinator::default().on_device_list(&mut session, &completion);

        assert_eq!(
            host.core_lines(),
            vec![
                "device list: Access token rejected (HTTP 401). Check the account configuration."
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_transient_failure_stays_in_the_log() {
        let host = MemoryHost::new();
        let mut session = session_with(host.clone(), RecordingDispatcher::new());
        let sync = SyncCoordinator::default();

        sync.on_pushes(
            &mut session,
            &complete(Operation::Pushes, EXIT_HTTP_ERROR, "").with_diagnostic("HTTP 503"),
        );
        sync.on_pushes(
            &mut session,
            &complete(Operation::Pushes, EXIT_TIMEOUT, "").with_diagnostic("timed out"),
        );
        sync.on_pushes(&mut session, &complete(Operation::Pushes, 7, ""));

        assert!(host.core_lines().is_empty());
    }

    #[test]
    fn test_history_is_appended_oldest_first() {
        let host = MemoryHost::new();
        let mut session = session_with(host.clone(), RecordingDispatcher::new());
        let sync = SyncCoordinator::default();
        let channel = session
            .registry
            .register(session.host.as_mut(), "dev1", "1", "Alice", None)
            .channel;

        let body = json!({"thread": [
            {"direction": "incoming", "body": "newest"},
            {"direction": "outgoing", "body": "middle"},
            {"direction": "incoming", "body": "oldest"}
        ]});
        let operation = Operation::ThreadHistory {
            handle: channel.handle,
            address: "1".to_string(),
        };
        sync.on_thread_history(
            &mut session,
            channel.handle,
            "1",
            &complete(operation, 0, &body.to_string()),
        );

        assert_eq!(
            host.lines(channel.handle),
            vec![
                "<\toldest".to_string(),
                ">\tmiddle".to_string(),
                "<\tnewest".to_string()
            ]
        );
    }

    #[test]
    fn test_pushes_are_appended_oldest_first() {
        let host = MemoryHost::new();
        let mut session = session_with(host.clone(), RecordingDispatcher::new());
        let sync = SyncCoordinator::default();
        sync.open_push_feed(&mut session);
        let feed = session.registry.aggregate().unwrap();

        let body = json!({"pushes": [{"body": "second"}, {"title": "only a title"}, {"body": "first"}]});
        sync.on_pushes(&mut session, &complete(Operation::Pushes, 0, &body.to_string()));

        assert_eq!(
            host.lines(feed),
            vec!["first".to_string(), "only a title".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn test_failures_and_garbage_are_no_data() {
        let host = MemoryHost::new();
        let dispatcher = RecordingDispatcher::new();
        let mut session = session_with(host.clone(), dispatcher.clone());
        let sync = SyncCoordinator::default();
        let operation = Operation::ThreadList {
            device_id: "dev1".to_string(),
        };

        sync.on_thread_list(&mut session, "dev1", &complete(operation.clone(), 0, "<html>"));
        sync.on_thread_list(&mut session, "dev1", &complete(operation.clone(), 0, "{}"));
        sync.on_thread_list(&mut session, "dev1", &complete(operation.clone(), 0, ""));
        sync.on_thread_list(
            &mut session,
            "dev1",
            &complete(operation, EXIT_HTTP_ERROR, r#"{"threads":[{"id":"1"}]}"#),
        );
        sync.on_device_list(&mut session, &complete(Operation::DeviceList, 0, "[1, 2"));

        assert!(session.registry.is_empty());
        assert!(dispatcher.take().is_empty());
        assert_eq!(host.channel_count(), 0);
    }

    #[test]
    fn test_reload_without_thread_vars_reports_inline() {
        let host = MemoryHost::new();
        let dispatcher = RecordingDispatcher::new();
        let mut session = session_with(host.clone(), dispatcher.clone());
        let sync = SyncCoordinator::default();

        sync.open_push_feed(&mut session);
        dispatcher.take();
        let feed = session.registry.aggregate().unwrap();

        assert!(sync.reload_thread(&mut session, feed).is_none());
        assert!(dispatcher.take().is_empty());
        assert_eq!(host.lines(feed).len(), 1);
    }

    #[test]
    fn test_partial_completion_is_ignored() {
        let host = MemoryHost::new();
        let mut session = session_with(host.clone(), RecordingDispatcher::new());
        let mut completion = complete(Operation::DeviceList, 0, r#"{"devices":[]}"#);
        completion.status = DispatchStatus::Running;

        SyncCoordinator::default().on_device_list(&mut session, &completion);
        assert!(host.core_lines().is_empty());
    }
}
