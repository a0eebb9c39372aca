//! Outbound Relay
//!
//! Turns text typed into a channel into an API call. The line is echoed into
//! the channel before the request is dispatched; a failed completion appends
//! a second line naming the text and the exit code. Nothing is retried.

use crate::dispatcher::{Completion, Operation};
use crate::host::{ChannelHandle, LOCAL_VAR_DEVICE, LOCAL_VAR_RECIPIENT};
use crate::payload::Message;
use crate::session::Session;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct OutboundRelay;

impl OutboundRelay {
    pub fn new() -> Self {
        Self
    }

    /// Send `text` as an SMS to the thread shown in `handle`
    ///
    /// The SMS goes to the thread's phone number. Channels created from a
    /// push for an unknown thread have none until their device's thread list
    /// is loaded again, so nothing is sent from them.
    ///
    /// Returns the request id, or `None` when the channel has no device or
    /// phone number attached and nothing was dispatched.
    pub fn send_sms(&self, session: &mut Session, handle: ChannelHandle, text: &str) -> Option<u64> {
        let Some(device_id) = session.host.get_local_var(handle, LOCAL_VAR_DEVICE) else {
            warn!("Channel {} has no device, cannot send", handle);
            session
                .host
                .print(handle, "cannot send: no device attached to this channel");
            return None;
        };

        let Some(recipient) = session.host.get_local_var(handle, LOCAL_VAR_RECIPIENT) else {
            warn!("Channel {} has no phone number, cannot send", handle);
            session
                .host
                .print(handle, "cannot send: no phone number known for this thread");
            return None;
        };

        let descriptor = session
            .api
            .build_send_sms_request(&device_id, &recipient, text);
        session.host.print_message(handle, &Message::outgoing(text));

        let id = session.submit(
            descriptor,
            Operation::SendSms {
                handle,
                text: text.to_string(),
            },
        );
        debug!("SMS to {} via {} is request {}", recipient, device_id, id);
        Some(id)
    }

    /// Push `text` as a note
    pub fn push_note(&self, session: &mut Session, handle: ChannelHandle, text: &str) -> u64 {
        let descriptor = session.api.build_push_request(text);
        session.host.print_message(handle, &Message::outgoing(text));

        session.submit(
            descriptor,
            Operation::Push {
                handle,
                text: text.to_string(),
            },
        )
    }

    /// Annotate the channel when a send or push failed
    pub fn on_send_completion(
        &self,
        session: &mut Session,
        handle: ChannelHandle,
        text: &str,
        completion: &Completion,
    ) {
        let Some(code) = completion.status.code() else {
            return;
        };

        if code == 0 {
            info!("Request {} delivered", completion.request.id);
            return;
        }

        warn!(
            "Request {} failed with {}: {}",
            completion.request.id, code, completion.diagnostic
        );
        if session.registry.lookup_handle(handle).is_none() {
            debug!("Channel {} closed before the send failed", handle);
            return;
        }

        session.host.print_message(
            handle,
            &Message::outgoing(format!("failed sending {} (rc: {})", text, code)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{OperationKind, EXIT_COULDNT_CONNECT};
    use crate::test_utils::{complete, session_with, MemoryHost, RecordingDispatcher};

    fn thread_session() -> (MemoryHost, RecordingDispatcher, Session, ChannelHandle) {
        let host = MemoryHost::new();
        let dispatcher = RecordingDispatcher::new();
        let mut session = session_with(host.clone(), dispatcher.clone());
        let handle = session
            .registry
            .register(session.host.as_mut(), "dev1", "12", "Alice", Some("+15550101"))
            .channel
            .handle;
        (host, dispatcher, session, handle)
    }

    #[test]
    fn test_send_echoes_before_dispatch() {
        let (host, dispatcher, mut session, handle) = thread_session();

        let id = OutboundRelay::new().send_sms(&mut session, handle, "hi there");
        assert!(id.is_some());
        assert_eq!(host.lines(handle), vec![">\thi there".to_string()]);

        let sent = dispatcher.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.kind(), OperationKind::SendSms);
        let body = sent[0].0.json_body().unwrap();
        assert_eq!(body["data"]["target_device_iden"], "dev1");
        assert_eq!(body["data"]["addresses"][0], "+15550101");
        assert_eq!(body["data"]["message"], "hi there");
    }

    #[test]
    fn test_failed_send_is_annotated() {
        let (host, _dispatcher, mut session, handle) = thread_session();
        let relay = OutboundRelay::new();
        relay.send_sms(&mut session, handle, "hi");

        let operation = Operation::SendSms {
            handle,
            text: "hi".to_string(),
        };
        relay.on_send_completion(
            &mut session,
            handle,
            "hi",
            &complete(operation, EXIT_COULDNT_CONNECT, ""),
        );

        assert_eq!(
            host.lines(handle),
            vec![">\thi".to_string(), ">\tfailed sending hi (rc: 7)".to_string()]
        );
    }

    #[test]
    fn test_successful_send_adds_nothing() {
        let (host, _dispatcher, mut session, handle) = thread_session();
        let relay = OutboundRelay::new();
        relay.send_sms(&mut session, handle, "hi");

        let operation = Operation::SendSms {
            handle,
            text: "hi".to_string(),
        };
        relay.on_send_completion(&mut session, handle, "hi", &complete(operation, 0, "{}"));
        assert_eq!(host.lines(handle).len(), 1);
    }

    #[test]
    fn test_send_without_device_dispatches_nothing() {
        let host = MemoryHost::new();
        let dispatcher = RecordingDispatcher::new();
        let mut session = session_with(host.clone(), dispatcher.clone());
        let handle = session.host.create_channel("scratch");

        assert!(OutboundRelay::new().send_sms(&mut session, handle, "hi").is_none());
        assert!(dispatcher.take().is_empty());
        assert_eq!(
            host.lines(handle),
            vec!["cannot send: no device attached to this channel".to_string()]
        );
    }

    #[test]
    fn test_send_from_unknown_thread_dispatches_nothing() {
        let host = MemoryHost::new();
        let dispatcher = RecordingDispatcher::new();
        let mut session = session_with(host.clone(), dispatcher.clone());
        let handle = session
            .registry
            .register(session.host.as_mut(), "dev1", "42", "unknown #42", None)
            .channel
            .handle;

        assert!(OutboundRelay::new().send_sms(&mut session, handle, "who is this?").is_none());
        assert!(dispatcher.take().is_empty());
        assert_eq!(
            host.lines(handle),
            vec!["cannot send: no phone number known for this thread".to_string()]
        );
    }

    #[test]
    fn test_push_note() {
        let host = MemoryHost::new();
        let dispatcher = RecordingDispatcher::new();
        let mut session = session_with(host.clone(), dispatcher.clone());
        let feed = session.host.create_channel("pushes");

        OutboundRelay::new().push_note(&mut session, feed, "buy milk");
        assert_eq!(host.lines(feed), vec![">\tbuy milk".to_string()]);

        let sent = dispatcher.take();
        assert_eq!(sent[0].1.kind(), OperationKind::Push);
        assert_eq!(sent[0].0.json_body().unwrap()["body"], "buy milk");
    }
}
