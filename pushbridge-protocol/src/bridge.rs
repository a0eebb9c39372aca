//! Bridge Event Loop
//!
//! The [`Bridge`] owns the session, the stream monitor and the reconnect
//! timer. All mutation happens on the single task running [`Bridge::run`],
//! which waits on:
//!
//! - dispatch completions
//! - host events (input, close, commands)
//! - the reconnect timer
//! - the shutdown future
//!
//! Handlers never block; anything that needs the network is dispatched and
//! resumes when its completion arrives.

use crate::api::ApiClient;
use crate::dispatcher::{Completion, Dispatcher, Operation, DEFAULT_REQUEST_TIMEOUT};
use crate::host::{BridgeCommand, ChannelHandle, Host, HostEvent};
use crate::relay::OutboundRelay;
use crate::session::Session;
use crate::stream::{
    ReconnectionStrategy, StreamMonitor, StreamOutcome, StreamState, INITIAL_RECONNECT_DELAY,
    MAX_RECONNECT_DELAY,
};
use crate::sync::SyncCoordinator;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Bridge settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Device loaded at startup; the event stream only runs when set
    pub default_device: Option<String>,
    pub request_timeout: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_device: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_initial_delay: INITIAL_RECONNECT_DELAY,
            reconnect_max_delay: MAX_RECONNECT_DELAY,
        }
    }
}

pub struct Bridge {
    session: Session,
    sync: SyncCoordinator,
    relay: OutboundRelay,
    stream: StreamMonitor,
    reconnect_at: Option<Instant>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        host: Box<dyn Host>,
        api: Box<dyn ApiClient>,
        dispatcher: Box<dyn Dispatcher>,
    ) -> Self {
        let backoff =
            ReconnectionStrategy::new(config.reconnect_initial_delay, config.reconnect_max_delay);

        Self {
            session: Session::new(host, api, dispatcher, config.request_timeout),
            sync: SyncCoordinator::new(config.default_device.clone()),
            relay: OutboundRelay::new(),
            stream: StreamMonitor::new(config.default_device, backoff),
            reconnect_at: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream.state()
    }

    /// Deadline of the scheduled reconnect, if any
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Kick off the catch-up chain and the event stream
    pub fn startup(&mut self) {
        info!("Starting bridge");
        self.sync.start(&mut self.session);
        if self.start_stream().is_none() {
            info!("No default device configured, event stream disabled");
        }
    }

    /// Dispatch the stream request if the monitor allows it
    pub fn start_stream(&mut self) -> Option<u64> {
        if !self.stream.can_connect() {
            return None;
        }

        let descriptor = self.session.api.build_stream_request();
        let id = self
            .session
            .submit_with_timeout(descriptor, Operation::StreamConnect, Duration::ZERO);
        self.stream.begin_connect(id);
        Some(id)
    }

    /// The reconnect deadline passed
    pub fn on_reconnect_timer(&mut self) {
        self.reconnect_at = None;
        if self.stream.take_retry() {
            info!("Reconnecting event stream");
            self.start_stream();
        }
    }

    /// Route a completion to the handler of its operation
    pub fn handle_completion(&mut self, completion: Completion) {
        debug!(
            "Completion for request {} ({:?}): {:?}",
            completion.request.id,
            completion.request.kind(),
            completion.status
        );

        let session = &mut self.session;
        match &completion.request.operation {
            Operation::DeviceList => self.sync.on_device_list(session, &completion),
            Operation::ThreadList { device_id } => {
                self.sync.on_thread_list(session, device_id, &completion)
            }
            Operation::ThreadHistory { handle, address } => {
                self.sync
                    .on_thread_history(session, *handle, address, &completion)
            }
            Operation::Pushes => self.sync.on_pushes(session, &completion),
            Operation::Push { handle, text } | Operation::SendSms { handle, text } => {
                self.relay
                    .on_send_completion(session, *handle, text, &completion)
            }
            Operation::StreamConnect => {
                let outcome = self.stream.handle_completion(
                    &completion,
                    &mut session.registry,
                    session.host.as_mut(),
                );
                if let StreamOutcome::Reconnect(delay) = outcome {
                    let now = Instant::now();
                    let deadline = now.checked_add(delay).unwrap_or_else(|| {
                        warn!(
                            "Reconnect delay {:?} out of range, using {:?}",
                            delay, MAX_RECONNECT_DELAY
                        );
                        now + MAX_RECONNECT_DELAY
                    });
                    self.reconnect_at = Some(deadline);
                }
            }
        }
    }

    /// React to user activity in the host
    pub fn handle_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Input { handle, text } => {
                if self.session.registry.aggregate() == Some(handle) {
                    self.relay.push_note(&mut self.session, handle, &text);
                } else {
                    self.relay.send_sms(&mut self.session, handle, &text);
                }
            }
            HostEvent::Closed { handle } => match self.session.registry.remove_handle(handle) {
                Some(channel) => info!(
                    "Channel {} ({}) closed",
                    handle, channel.display_name
                ),
                None => debug!("Unknown channel {} closed", handle),
            },
            HostEvent::Command { handle, command } => self.handle_command(handle, command),
        }
    }

    fn handle_command(&mut self, handle: Option<ChannelHandle>, command: BridgeCommand) {
        match command {
            BridgeCommand::ReloadThread => match handle {
                Some(handle) => {
                    self.sync.reload_thread(&mut self.session, handle);
                }
                None => self.session.host.print_core("no channel to reload"),
            },
            BridgeCommand::LoadDevice(device_id) => {
                if device_id.is_empty() {
                    self.session.host.print_core("usage: /pb_d <device_id>");
                } else {
                    self.sync.load_device(&mut self.session, &device_id);
                }
            }
            BridgeCommand::ListDevices => {
                self.sync.get_devices(&mut self.session);
            }
            BridgeCommand::ListChannels => {
                let mut lines: Vec<String> = self
                    .session
                    .registry
                    .channels()
                    .map(|c| {
                        if c.is_aggregate() {
                            format!("{} {}", c.handle, c.display_name)
                        } else {
                            format!(
                                "{} {} (thread {} on {})",
                                c.handle, c.display_name, c.remote_address, c.device_id
                            )
                        }
                    })
                    .collect();
                lines.sort();

                self.session.host.print_core("channels:");
                for line in &lines {
                    self.session.host.print_core(line);
                }
            }
        }
    }

    /// Run until `shutdown` resolves or the host event channel closes
    ///
    /// Returns the bridge so callers can inspect its final state.
    pub async fn run<F>(
        mut self,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut events: mpsc::UnboundedReceiver<HostEvent>,
        shutdown: F,
    ) -> Self
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.startup();

        loop {
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                Some(completion) = completions.recv() => {
                    self.handle_completion(completion);
                }

                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_host_event(event),
                        None => {
                            info!("Host event channel closed");
                            break;
                        }
                    }
                }

                _ = async {
                    match reconnect_at {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.on_reconnect_timer();
                }
            }
        }

        if self.stream.state().active() {
            warn!("Leaving with the event stream still open");
        }
        self
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("session", &self.session)
            .field("stream", &self.stream)
            .field("reconnect_at", &self.reconnect_at)
            .finish()
    }
}
