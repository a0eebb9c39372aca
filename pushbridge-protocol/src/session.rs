//! Bridge session state
//!
//! Everything a completion handler may touch: the host, the API client, the
//! dispatcher and the conversation registry. A session is owned by exactly one
//! [`Bridge`](crate::bridge::Bridge) and is never shared across tasks.

use crate::api::{ApiClient, RequestDescriptor};
use crate::dispatcher::{Dispatcher, Operation, PendingRequest};
use crate::host::Host;
use crate::registry::ConversationRegistry;
use std::time::Duration;

pub struct Session {
    pub host: Box<dyn Host>,
    pub api: Box<dyn ApiClient>,
    pub registry: ConversationRegistry,
    dispatcher: Box<dyn Dispatcher>,
    next_request_id: u64,
    request_timeout: Duration,
}

impl Session {
    pub fn new(
        host: Box<dyn Host>,
        api: Box<dyn ApiClient>,
        dispatcher: Box<dyn Dispatcher>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            host,
            api,
            registry: ConversationRegistry::new(),
            dispatcher,
            next_request_id: 1,
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Dispatch with the default request timeout, returning the request id
    pub fn submit(&mut self, descriptor: RequestDescriptor, operation: Operation) -> u64 {
        let timeout = self.request_timeout;
        self.submit_with_timeout(descriptor, operation, timeout)
    }

    /// Dispatch with an explicit timeout (`Duration::ZERO` for none)
    pub fn submit_with_timeout(
        &mut self,
        descriptor: RequestDescriptor,
        operation: Operation,
        timeout: Duration,
    ) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.dispatcher
            .dispatch(descriptor, PendingRequest::new(id, operation, timeout));
        id
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("registry", &self.registry)
            .field("next_request_id", &self.next_request_id)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
