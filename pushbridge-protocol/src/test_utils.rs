//! Shared fakes for unit tests

use crate::api::{PushbulletApi, RequestDescriptor};
use crate::dispatcher::{
    Completion, DispatchStatus, Dispatcher, Operation, PendingRequest, DEFAULT_REQUEST_TIMEOUT,
};
use crate::host::{ChannelHandle, Host};
use crate::session::Session;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct HostState {
    next_handle: u64,
    names: HashMap<ChannelHandle, String>,
    lines: HashMap<ChannelHandle, Vec<String>>,
    core: Vec<String>,
    vars: HashMap<(ChannelHandle, String), String>,
}

/// In-memory host; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct MemoryHost {
    state: Arc<Mutex<HostState>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().unwrap().names.len()
    }

    pub fn lines(&self, handle: ChannelHandle) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .lines
            .get(&handle)
            .cloned()
            .unwrap_or_default()
    }

    pub fn core_lines(&self) -> Vec<String> {
        self.state.lock().unwrap().core.clone()
    }
}

impl Host for MemoryHost {
    fn create_channel(&mut self, name: &str) -> ChannelHandle {
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let handle = ChannelHandle::new(state.next_handle);
        state.names.insert(handle, name.to_string());
        handle
    }

    fn print(&mut self, handle: ChannelHandle, line: &str) {
        self.state
            .lock()
            .unwrap()
            .lines
            .entry(handle)
            .or_default()
            .push(line.to_string());
    }

    fn print_core(&mut self, line: &str) {
        self.state.lock().unwrap().core.push(line.to_string());
    }

    fn set_local_var(&mut self, handle: ChannelHandle, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .vars
            .insert((handle, key.to_string()), value.to_string());
    }

    fn get_local_var(&self, handle: ChannelHandle, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .vars
            .get(&(handle, key.to_string()))
            .cloned()
    }
}

/// Dispatcher that records requests instead of sending them
#[derive(Debug, Clone, Default)]
pub struct RecordingDispatcher {
    sent: Arc<Mutex<Vec<(RequestDescriptor, PendingRequest)>>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything dispatched so far
    pub fn take(&self) -> Vec<(RequestDescriptor, PendingRequest)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(&self, descriptor: RequestDescriptor, request: PendingRequest) {
        self.sent.lock().unwrap().push((descriptor, request));
    }
}

/// API client pointed at unroutable test URLs
pub fn test_api() -> PushbulletApi {
    PushbulletApi::with_base_urls("test-token", "http://api.test", "ws://stream.test/websocket")
}

pub fn session_with(host: MemoryHost, dispatcher: RecordingDispatcher) -> Session {
    Session::new(
        Box::new(host),
        Box::new(test_api()),
        Box::new(dispatcher),
        DEFAULT_REQUEST_TIMEOUT,
    )
}

/// Terminal completion for `operation` with the given exit code and body
pub fn complete(operation: Operation, code: i32, payload: &str) -> Completion {
    Completion::new(
        PendingRequest::new(0, operation, DEFAULT_REQUEST_TIMEOUT),
        DispatchStatus::Exited(code),
    )
    .with_payload(payload)
}
