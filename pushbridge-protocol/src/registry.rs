//! Conversation Registry
//!
//! Maps remote threads to local conversation channels and back. Thread ids
//! are only unique per device, so a thread is keyed by `(device, address)`.
//! There is exactly one channel per key; lookups never create anything,
//! creation only happens through [`ConversationRegistry::register`].

use crate::host::{
    ChannelHandle, Host, LOCAL_VAR_ADDRESS, LOCAL_VAR_DEVICE, LOCAL_VAR_RECIPIENT,
};
use std::collections::HashMap;
use tracing::{debug, info};

/// Registry key of the aggregate push feed
pub const AGGREGATE_KEY: &str = "pushes";

/// Registry key of a device thread, the same `<device>_<thread>` form the
/// permanents endpoint uses
pub fn thread_key(device_id: &str, address: &str) -> String {
    format!("{}_{}", device_id, address)
}

/// One addressable conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationChannel {
    pub remote_address: String,
    pub device_id: String,
    pub display_name: String,
    pub handle: ChannelHandle,
    pub recipient: Option<String>,
}

impl ConversationChannel {
    pub fn is_aggregate(&self) -> bool {
        self.device_id.is_empty() && self.remote_address == AGGREGATE_KEY
    }
}

/// Result of a [`ConversationRegistry::register`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub channel: ConversationChannel,
    /// `false` when the thread was already registered
    pub created: bool,
}

/// Bidirectional thread <-> channel mapping
#[derive(Debug, Default)]
pub struct ConversationRegistry {
    by_key: HashMap<String, ConversationChannel>,
    by_handle: HashMap<ChannelHandle, String>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the channel of thread `address` on `device_id`
    pub fn lookup(&self, device_id: &str, address: &str) -> Option<&ConversationChannel> {
        self.by_key.get(&thread_key(device_id, address))
    }

    /// Look up a channel by host handle
    pub fn lookup_handle(&self, handle: ChannelHandle) -> Option<&ConversationChannel> {
        self.by_handle
            .get(&handle)
            .and_then(|key| self.by_key.get(key))
    }

    /// Register a conversation, creating its host channel on first sight
    ///
    /// Registering a `(device, address)` pair that is already known returns
    /// the existing channel. The only thing it may change is a missing phone
    /// number, which is filled in from `recipient`.
    pub fn register(
        &mut self,
        host: &mut dyn Host,
        device_id: &str,
        address: &str,
        display_name: &str,
        recipient: Option<&str>,
    ) -> Registration {
        let key = thread_key(device_id, address);
        if let Some(existing) = self.by_key.get_mut(&key) {
            debug!(
                "Thread {} on {} already registered as {}",
                address, device_id, existing.display_name
            );
            if let Some(recipient) = recipient.filter(|_| existing.recipient.is_none()) {
                info!("Thread {} on {} now sends to {}", address, device_id, recipient);
                host.set_local_var(existing.handle, LOCAL_VAR_RECIPIENT, recipient);
                existing.recipient = Some(recipient.to_string());
            }
            return Registration {
                channel: existing.clone(),
                created: false,
            };
        }

        let handle = host.create_channel(display_name);
        host.set_local_var(handle, LOCAL_VAR_ADDRESS, address);
        host.set_local_var(handle, LOCAL_VAR_DEVICE, device_id);
        if let Some(recipient) = recipient {
            host.set_local_var(handle, LOCAL_VAR_RECIPIENT, recipient);
        }

        let channel = ConversationChannel {
            remote_address: address.to_string(),
            device_id: device_id.to_string(),
            display_name: display_name.to_string(),
            handle,
            recipient: recipient.map(str::to_string),
        };

        info!(
            "Registered thread {} ({}) on device {} as channel {}",
            address, display_name, device_id, handle
        );

        self.by_handle.insert(handle, key.clone());
        self.by_key.insert(key, channel.clone());

        Registration {
            channel,
            created: true,
        }
    }

    /// Register the non-addressed aggregate feed under `key`
    pub fn register_aggregate(&mut self, key: &str, handle: ChannelHandle) {
        let channel = ConversationChannel {
            remote_address: key.to_string(),
            device_id: String::new(),
            display_name: key.to_string(),
            handle,
            recipient: None,
        };
        if let Some(previous) = self.by_key.insert(key.to_string(), channel) {
            self.by_handle.remove(&previous.handle);
        }
        self.by_handle.insert(handle, key.to_string());
    }

    /// Handle of the aggregate push feed, if registered
    pub fn aggregate(&self) -> Option<ChannelHandle> {
        self.by_key.get(AGGREGATE_KEY).map(|c| c.handle)
    }

    /// Forget a channel the host has closed
    pub fn remove_handle(&mut self, handle: ChannelHandle) -> Option<ConversationChannel> {
        let key = self.by_handle.remove(&handle)?;
        self.by_key.remove(&key)
    }

    /// Registered keys, sorted
    pub fn addresses(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.by_key.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn channels(&self) -> impl Iterator<Item = &ConversationChannel> {
        self.by_key.values()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
