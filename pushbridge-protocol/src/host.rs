//! Host Channel Interface
//!
//! The bridge never draws anything itself. It talks to a host chat client
//! through the [`Host`] trait (create channels, print lines, keep per-channel
//! variables) and receives user activity back as [`HostEvent`]s on the
//! bridge's event channel.

use crate::payload::Message;
use std::fmt;

/// Local variable holding a channel's remote thread address
pub const LOCAL_VAR_ADDRESS: &str = "address";

/// Local variable holding the device that owns a channel's thread
pub const LOCAL_VAR_DEVICE: &str = "device";

/// Local variable holding the phone number outbound SMS are sent to
pub const LOCAL_VAR_RECIPIENT: &str = "recipient";

/// Opaque reference to a host-side channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(u64);

impl ChannelHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Channel primitives provided by the host chat client
pub trait Host: Send {
    /// Create a new channel and return its handle
    fn create_channel(&mut self, name: &str) -> ChannelHandle;

    /// Print one line into a channel
    fn print(&mut self, handle: ChannelHandle, line: &str);

    /// Print a conversation message into a channel
    ///
    /// Hosts that can show the message's timestamp override this; the
    /// default prints the rendered line only.
    fn print_message(&mut self, handle: ChannelHandle, message: &Message) {
        self.print(handle, &message.render());
    }

    /// Print one line into the host's core/log channel
    fn print_core(&mut self, line: &str);

    /// Set a channel-local variable
    fn set_local_var(&mut self, handle: ChannelHandle, key: &str, value: &str);

    /// Read a channel-local variable
    fn get_local_var(&self, handle: ChannelHandle, key: &str) -> Option<String>;
}

/// User-facing commands the bridge registers with the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCommand {
    /// Force-reload the history of the channel the command was issued in
    ReloadThread,
    /// Load (attach) a device's threads by ID
    LoadDevice(String),
    /// Print the device list again
    ListDevices,
    /// Print the known conversation channels
    ListChannels,
}

/// Activity reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// The user typed a line into a channel
    Input { handle: ChannelHandle, text: String },
    /// The user closed a channel
    Closed { handle: ChannelHandle },
    /// The user ran a bridge command from a channel
    Command {
        handle: Option<ChannelHandle>,
        command: BridgeCommand,
    },
}
