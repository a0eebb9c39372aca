//! Stdin command parsing
//!
//! | line | effect |
//! |------|--------|
//! | `<channel>: text` | send `text` from that channel |
//! | `/pb_r <channel>` | reload the channel's thread history |
//! | `/pb_d <device_id>` | load a device's threads |
//! | `/pb_devices` | list devices |
//! | `/channels` | list channels |
//! | `/close <channel>` | close a channel |
//! | `/quit` | stop the daemon |
//!
//! `<channel>` is either the channel name or its `#<n>` handle.

use crate::terminal_host::{format_line, lock, ChannelDirectory, SharedDirectory};
use pushbridge_protocol::{BridgeCommand, HostEvent};
use std::io::BufRead;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Outcome of one stdin line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Event(HostEvent),
    Quit,
    /// Line that could not be understood; the message is shown to the user
    Invalid(String),
}

/// Parse one line typed by the user; blank lines yield `None`
pub fn parse_line(line: &str, directory: &ChannelDirectory) -> Option<Input> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    let Some(command) = line.strip_prefix('/') else {
        return Some(parse_message(line, directory));
    };

    let (name, argument) = match command.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (command, ""),
    };

    let input = match name {
        "quit" => Input::Quit,
        "pb_devices" => Input::Event(HostEvent::Command {
            handle: None,
            command: BridgeCommand::ListDevices,
        }),
        "channels" => Input::Event(HostEvent::Command {
            handle: None,
            command: BridgeCommand::ListChannels,
        }),
        "pb_d" if argument.is_empty() => Input::Invalid("usage: /pb_d <device_id>".to_string()),
        "pb_d" => Input::Event(HostEvent::Command {
            handle: None,
            command: BridgeCommand::LoadDevice(argument.to_string()),
        }),
        "pb_r" => match resolve(argument, directory, "/pb_r <channel>") {
            Ok(handle) => Input::Event(HostEvent::Command {
                handle: Some(handle),
                command: BridgeCommand::ReloadThread,
            }),
            Err(message) => Input::Invalid(message),
        },
        "close" => match resolve(argument, directory, "/close <channel>") {
            Ok(handle) => Input::Event(HostEvent::Closed { handle }),
            Err(message) => Input::Invalid(message),
        },
        other => Input::Invalid(format!("unknown command /{}", other)),
    };

    Some(input)
}

fn parse_message(line: &str, directory: &ChannelDirectory) -> Input {
    let Some((reference, text)) = line.split_once(':') else {
        return Input::Invalid("expected '<channel>: <text>'".to_string());
    };

    let text = text.strip_prefix(' ').unwrap_or(text);
    if text.is_empty() {
        return Input::Invalid("nothing to send".to_string());
    }

    match directory.resolve(reference) {
        Some(handle) => Input::Event(HostEvent::Input {
            handle,
            text: text.to_string(),
        }),
        None => Input::Invalid(format!("no channel named '{}'", reference.trim())),
    }
}

fn resolve(
    argument: &str,
    directory: &ChannelDirectory,
    usage: &str,
) -> Result<pushbridge_protocol::ChannelHandle, String> {
    if argument.is_empty() {
        return Err(format!("usage: {}", usage));
    }
    directory
        .resolve(argument)
        .ok_or_else(|| format!("no channel named '{}'", argument))
}

/// Why the stdin reader stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// The user typed `/quit`
    Quit,
    /// End of input, a read error, or the bridge went away
    Closed,
}

/// Read stdin until EOF or `/quit`, forwarding events to the bridge
///
/// Blocking; run it on its own thread.
pub fn read_stdin(
    directory: SharedDirectory,
    events: mpsc::UnboundedSender<HostEvent>,
) -> ReaderExit {
    let stdin = std::io::stdin();
    read_lines(stdin.lock(), &directory, &events)
}

/// Forward every line of `reader` as a host event
pub fn read_lines<R: BufRead>(
    reader: R,
    directory: &SharedDirectory,
    events: &mpsc::UnboundedSender<HostEvent>,
) -> ReaderExit {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                info!("Stopped reading stdin: {}", e);
                return ReaderExit::Closed;
            }
        };

        let parsed = {
            let directory = lock(directory);
            parse_line(&line, &directory)
        };

        match parsed {
            None => {}
            Some(Input::Quit) => {
                info!("Quit requested");
                return ReaderExit::Quit;
            }
            Some(Input::Invalid(message)) => println!("{}", format_line("core", &message)),
            Some(Input::Event(event)) => {
                if let HostEvent::Closed { handle } = &event {
                    lock(directory).remove(*handle);
                }
                debug!("Host event: {:?}", event);
                if events.send(event).is_err() {
                    return ReaderExit::Closed;
                }
            }
        }
    }

    info!("End of input, stdin commands are no longer read");
    ReaderExit::Closed
}
