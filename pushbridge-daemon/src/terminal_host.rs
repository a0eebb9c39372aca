//! Terminal host
//!
//! Channels are plain prefixes on stdout: `[name] line`, with the local
//! `HH:MM` in front of messages that carry a timestamp. The core channel is
//! `[core]`. Channel names live in a [`ChannelDirectory`] shared with the
//! stdin reader so typed lines can be resolved to handles.

use chrono::TimeZone;
use pushbridge_protocol::{ChannelHandle, Host, Message};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Handle <-> name table of open channels
#[derive(Debug, Default)]
pub struct ChannelDirectory {
    names: BTreeMap<ChannelHandle, String>,
}

impl ChannelDirectory {
    pub fn insert(&mut self, handle: ChannelHandle, name: &str) {
        self.names.insert(handle, name.to_string());
    }

    pub fn remove(&mut self, handle: ChannelHandle) -> Option<String> {
        self.names.remove(&handle)
    }

    pub fn name(&self, handle: ChannelHandle) -> Option<&str> {
        self.names.get(&handle).map(String::as_str)
    }

    /// Resolve `#<n>` or an exact channel name
    pub fn resolve(&self, reference: &str) -> Option<ChannelHandle> {
        let reference = reference.trim();
        if let Some(raw) = reference.strip_prefix('#') {
            if let Ok(raw) = raw.parse::<u64>() {
                let handle = ChannelHandle::new(raw);
                if self.names.contains_key(&handle) {
                    return Some(handle);
                }
            }
        }

        self.names
            .iter()
            .find(|(_, name)| name.as_str() == reference)
            .map(|(handle, _)| *handle)
    }
}

/// Directory shared between the host and the stdin reader
pub type SharedDirectory = Arc<Mutex<ChannelDirectory>>;

/// Lock the directory, recovering from a poisoned lock
pub fn lock(directory: &SharedDirectory) -> MutexGuard<'_, ChannelDirectory> {
    directory
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Render a channel line for the terminal
pub fn format_line(name: &str, line: &str) -> String {
    format!("[{}] {}", name, line.replace('\t', " "))
}

/// Render a conversation message, its timestamp shown in `zone`
pub fn format_message<Tz>(name: &str, message: &Message, zone: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    match message.timestamp {
        Some(timestamp) => format_line(
            name,
            &format!(
                "{} {}",
                timestamp.with_timezone(zone).format("%H:%M"),
                message.render()
            ),
        ),
        None => format_line(name, &message.render()),
    }
}

/// Host writing channel lines to stdout
#[derive(Debug, Default)]
pub struct TerminalHost {
    directory: SharedDirectory,
    next_handle: u64,
    local_vars: HashMap<(ChannelHandle, String), String>,
}

impl TerminalHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn directory(&self) -> SharedDirectory {
        Arc::clone(&self.directory)
    }

    fn emit(&self, rendered: &str) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", rendered) {
            warn!("Failed to write to stdout: {}", e);
        }
    }

    fn channel_name(&self, handle: ChannelHandle) -> String {
        lock(&self.directory)
            .name(handle)
            .map(str::to_string)
            .unwrap_or_else(|| handle.to_string())
    }
}

impl Host for TerminalHost {
    fn create_channel(&mut self, name: &str) -> ChannelHandle {
        self.next_handle += 1;
        let handle = ChannelHandle::new(self.next_handle);
        lock(&self.directory).insert(handle, name);
        self.emit(&format_line("core", &format!("opened {} {}", handle, name)));
        handle
    }

    fn print(&mut self, handle: ChannelHandle, line: &str) {
        let name = self.channel_name(handle);
        self.emit(&format_line(&name, line));
    }

    fn print_message(&mut self, handle: ChannelHandle, message: &Message) {
        let name = self.channel_name(handle);
        self.emit(&format_message(&name, message, &chrono::Local));
    }

    fn print_core(&mut self, line: &str) {
        self.emit(&format_line("core", line));
    }

    fn set_local_var(&mut self, handle: ChannelHandle, key: &str, value: &str) {
        self.local_vars
            .insert((handle, key.to_string()), value.to_string());
    }

    fn get_local_var(&self, handle: ChannelHandle, key: &str) -> Option<String> {
        self.local_vars.get(&(handle, key.to_string())).cloned()
    }
}
