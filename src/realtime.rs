use crate::completion::CompletionTracker;
use crate::endpoint::EndpointResolver;
use crate::errors::{MonitorError, Result};
use crate::notifier::{Notification, Notifier};
use crate::projector::{project, PrinterDisplayState, StatusSnapshot};
use crate::protocol::{self, Frame};
use crate::registry::{PrinterId, PrinterRecord, RegistryEvent};
use crate::sink::{ConnectionState, Connectivity, RenderSink};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

/// Flat delay between a channel loss and the next connect attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Everything a connector needs to open one printer's channel
#[derive(Debug, Clone)]
pub struct ChannelTarget {
    pub printer_id: PrinterId,
    pub generation: u64,
    pub address: String,
    /// Subscribe frame to send once the channel is open
    pub subscribe: String,
}

/// Why a channel ended
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelLoss {
    OpenFailed(String),
    ClosedByPeer,
    Error(String),
}

impl From<ChannelLoss> for MonitorError {
    fn from(loss: ChannelLoss) -> Self {
        match loss {
            ChannelLoss::OpenFailed(e) => MonitorError::ChannelOpenFailure(e),
            ChannelLoss::ClosedByPeer => MonitorError::ChannelClosedByPeer,
            ChannelLoss::Error(e) => MonitorError::Network(e),
        }
    }
}

#[derive(Debug)]
enum ChannelEventKind {
    Opened,
    Frame(String),
    Lost(ChannelLoss),
}

#[derive(Debug)]
enum ManagerEvent {
    Channel {
        printer_id: PrinterId,
        generation: u64,
        kind: ChannelEventKind,
    },
    ReconnectDue {
        printer_id: PrinterId,
        generation: u64,
    },
}

/// Event sender handed to a connector for one channel; every event is
/// tagged with the channel's generation so late events from a closed
/// channel are ignored
#[derive(Clone)]
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<ManagerEvent>,
    printer_id: PrinterId,
    generation: u64,
}

impl ChannelEvents {
    pub fn printer_id(&self) -> PrinterId {
        self.printer_id
    }

    /// Channel is up and the subscription has been sent
    pub fn opened(&self) {
        self.send(ChannelEventKind::Opened);
    }

    /// Inbound text frame, parsed by the manager
    pub fn frame(&self, text: impl Into<String>) {
        self.send(ChannelEventKind::Frame(text.into()));
    }

    pub fn lost(&self, loss: ChannelLoss) {
        self.send(ChannelEventKind::Lost(loss));
    }

    fn send(&self, kind: ChannelEventKind) {
        // Manager gone means shutdown; nothing left to tell
        let _ = self.tx.send(ManagerEvent::Channel {
            printer_id: self.printer_id,
            generation: self.generation,
            kind,
        });
    }
}

/// Owner side of an open channel. Closing (or dropping) it tells the
/// channel task to shut down.
pub struct ChannelHandle {
    close: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn new(close: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            close: Some(close),
            task: Some(task),
        }
    }

    /// Handle without a task, for connectors that drive the channel
    /// elsewhere; the receiver resolves on close
    pub fn detached() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                close: Some(tx),
                task: None,
            },
            rx,
        )
    }

    pub fn close(mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
        // The task exits on its own after the close signal
        self.task.take();
    }
}

/// Opens status channels
pub trait Connector: Send + Sync + 'static {
    fn open(&self, target: ChannelTarget, events: ChannelEvents) -> ChannelHandle;

    /// Refresh interval preference changed
    fn refresh_interval_changed(&self, _secs: u64) {}
}

/// Push channel over the Moonraker WebSocket
pub struct WsConnector {
    resolver: EndpointResolver,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(resolver: EndpointResolver, connect_timeout: Duration) -> Self {
        Self {
            resolver,
            connect_timeout,
        }
    }
}

impl Connector for WsConnector {
    fn open(&self, target: ChannelTarget, events: ChannelEvents) -> ChannelHandle {
        let url = self.resolver.resolve_status_channel(&target.address);
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_ws_channel(
            url,
            target.subscribe,
            self.connect_timeout,
            events,
            close_rx,
        ));
        ChannelHandle::new(close_tx, task)
    }
}

async fn run_ws_channel(
    url: String,
    subscribe: String,
    connect_timeout: Duration,
    events: ChannelEvents,
    mut close_rx: oneshot::Receiver<()>,
) {
    debug!("Printer {} connecting to {}", events.printer_id(), url);

    let ws_stream = tokio::select! {
        _ = &mut close_rx => return,
        result = tokio::time::timeout(connect_timeout, connect_async(url.as_str())) => match result {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                events.lost(ChannelLoss::OpenFailed(e.to_string()));
                return;
            }
            Err(_) => {
                events.lost(ChannelLoss::OpenFailed("connect timeout".to_string()));
                return;
            }
        },
    };

    let (mut write, mut read) = ws_stream.split();

    if let Err(e) = write.send(Message::Text(subscribe)).await {
        events.lost(ChannelLoss::Error(format!("subscribe failed: {}", e)));
        return;
    }
    events.opened();

    loop {
        tokio::select! {
            _ = &mut close_rx => {
                let _ = write.send(Message::Close(None)).await;
                let _ = write.close().await;
                debug!("Printer {} channel closed locally", events.printer_id());
                break;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => events.frame(text),
                Some(Ok(Message::Close(_))) | None => {
                    events.lost(ChannelLoss::ClosedByPeer);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    events.lost(ChannelLoss::Error(e.to_string()));
                    break;
                }
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub reconnect_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Observed per-printer state, for the API and tests
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub printer_id: PrinterId,
    pub state: ConnectionState,
    pub disabled: bool,
    pub reconnect_pending: bool,
}

enum Command {
    StartAll,
    StopAll,
    Snapshot(oneshot::Sender<Vec<SessionInfo>>),
    Shutdown,
}

/// Cheap handle for driving a running manager
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ManagerHandle {
    pub fn start_all(&self) {
        let _ = self.tx.send(Command::StartAll);
    }

    pub fn stop_all(&self) {
        let _ = self.tx.send(Command::StopAll);
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot(tx))
            .map_err(|_| anyhow::anyhow!("connection manager stopped"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("connection manager stopped").into())
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// One printer's live bookkeeping; channel and timer live together so
/// they cannot drift apart
struct Session {
    record: PrinterRecord,
    state: ConnectionState,
    generation: u64,
    channel: Option<ChannelHandle>,
    reconnect: Option<JoinHandle<()>>,
    snapshot: StatusSnapshot,
}

impl Session {
    fn new(record: PrinterRecord) -> Self {
        Self {
            record,
            state: ConnectionState::Disconnected,
            generation: 0,
            channel: None,
            reconnect: None,
            snapshot: StatusSnapshot::default(),
        }
    }

    /// Close the channel and cancel the timer; bumps the generation so
    /// anything still in flight is ignored
    fn teardown(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        if let Some(timer) = self.reconnect.take() {
            timer.abort();
        }
        self.generation += 1;
        self.snapshot.clear();
        self.state = ConnectionState::Disconnected;
    }
}

/// Owns one live status channel per enabled printer.
///
/// Runs as a single task: channel events, reconnect timers, registry
/// changes and commands are handled one at a time.
pub struct ConnectionManager {
    sessions: HashMap<PrinterId, Session>,
    order: Vec<PrinterId>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn RenderSink>,
    notifier: Notifier,
    tracker: CompletionTracker,
    config: ManagerConfig,
    paused: bool,
    next_request_id: u64,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl ConnectionManager {
    /// Spawn the manager for `records`. It starts paused; call
    /// `start_all` on the handle to open channels.
    pub fn spawn(
        records: Vec<PrinterRecord>,
        registry_events: mpsc::UnboundedReceiver<RegistryEvent>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn RenderSink>,
        notifier: Notifier,
        config: ManagerConfig,
    ) -> (ManagerHandle, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let mut manager = Self {
            sessions: HashMap::new(),
            order: Vec::new(),
            connector,
            sink,
            notifier,
            tracker: CompletionTracker::new(),
            config,
            paused: true,
            next_request_id: 0,
            events_tx,
        };
        for record in records {
            manager.insert_session(record);
        }

        let task = tokio::spawn(manager.run(cmd_rx, registry_events, events_rx));
        (ManagerHandle { tx: cmd_tx }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut registry_events: mpsc::UnboundedReceiver<RegistryEvent>,
        mut events: mpsc::UnboundedReceiver<ManagerEvent>,
    ) {
        info!("Connection manager started ({} printers)", self.sessions.len());
        let mut registry_open = true;

        loop {
            // Channel traffic first, then registry changes, then commands,
            // so a command observes every event queued before it
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.handle_event(event),
                event = registry_events.recv(), if registry_open => match event {
                    Some(event) => self.handle_registry_event(event),
                    None => registry_open = false,
                },
                command = commands.recv() => match command {
                    Some(Command::StartAll) => self.start_all(),
                    Some(Command::StopAll) => self.stop_all(),
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.session_infos());
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        for session in self.sessions.values_mut() {
            session.teardown();
        }
        info!("Connection manager stopped");
    }

    fn insert_session(&mut self, record: PrinterRecord) {
        let id = record.id;
        if record.disabled {
            self.render_disabled(id);
        } else {
            self.render_offline(id, ConnectionState::Disconnected);
        }
        if self.sessions.insert(id, Session::new(record)).is_none() {
            self.order.push(id);
        }
    }

    fn start_all(&mut self) {
        self.paused = false;
        let ids: Vec<PrinterId> = self.order.clone();
        for id in ids {
            self.connect(id);
        }
    }

    fn stop_all(&mut self) {
        self.paused = true;
        let ids: Vec<PrinterId> = self.order.clone();
        for id in ids {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            let was_idle = session.channel.is_none() && session.reconnect.is_none();
            session.teardown();
            if !session.record.disabled && !was_idle {
                self.render_offline(id, ConnectionState::Disconnected);
            }
        }
        debug!("All status channels stopped");
    }

    /// Open a channel unless one is already open or pending
    fn connect(&mut self, id: PrinterId) {
        if self.paused {
            return;
        }
        let request_id = self.next_request_id + 1;
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.record.disabled || session.channel.is_some() || session.reconnect.is_some() {
            return;
        }

        self.next_request_id = request_id;
        session.generation += 1;
        session.state = ConnectionState::Connecting;
        session.snapshot.clear();

        let target = ChannelTarget {
            printer_id: id,
            generation: session.generation,
            address: session.record.address.clone(),
            subscribe: protocol::subscribe_request(request_id),
        };
        let events = ChannelEvents {
            tx: self.events_tx.clone(),
            printer_id: id,
            generation: session.generation,
        };
        debug!("Opening status channel for printer {} (generation {})", id, target.generation);
        session.channel = Some(self.connector.open(target, events));

        self.sink
            .set_connectivity(id, Connectivity::Live(ConnectionState::Connecting));
    }

    /// Cancel any pending timer and schedule a single reconnect
    fn arm_reconnect(&mut self, id: PrinterId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if let Some(previous) = session.reconnect.take() {
            previous.abort();
        }

        let tx = self.events_tx.clone();
        let delay = self.config.reconnect_delay;
        let generation = session.generation;
        session.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ManagerEvent::ReconnectDue {
                printer_id: id,
                generation,
            });
        }));
        session.state = ConnectionState::Reconnecting;
        debug!("Printer {} reconnect in {:?}", id, delay);
    }

    fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Channel {
                printer_id,
                generation,
                kind,
            } => {
                let current = self
                    .sessions
                    .get(&printer_id)
                    .map(|s| s.generation == generation && s.channel.is_some())
                    .unwrap_or(false);
                if !current {
                    debug!("Ignoring stale channel event for printer {}", printer_id);
                    return;
                }
                match kind {
                    ChannelEventKind::Opened => self.on_opened(printer_id),
                    ChannelEventKind::Frame(text) => self.on_frame(printer_id, &text),
                    ChannelEventKind::Lost(loss) => self.on_lost(printer_id, loss),
                }
            }
            ManagerEvent::ReconnectDue {
                printer_id,
                generation,
            } => {
                let Some(session) = self.sessions.get_mut(&printer_id) else {
                    return;
                };
                if session.generation != generation || session.reconnect.is_none() {
                    return;
                }
                session.reconnect = None;
                if session.record.disabled || self.paused {
                    session.state = ConnectionState::Disconnected;
                    return;
                }
                self.connect(printer_id);
            }
        }
    }

    fn on_opened(&mut self, id: PrinterId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.state != ConnectionState::Connecting {
            return;
        }
        session.state = ConnectionState::Subscribed;
        info!("Printer {} ({}) subscribed", session.record.name, id);

        // No status yet; the card reads Ready until the first payload
        self.sink
            .set_connectivity(id, Connectivity::Live(ConnectionState::Subscribed));
        self.sink.update(id, &PrinterDisplayState::idle());
    }

    fn on_frame(&mut self, id: PrinterId, text: &str) {
        let delta = match protocol::parse_frame(text) {
            Ok(Frame::Status(delta)) => delta,
            Ok(Frame::Ignored) => return,
            Err(e) => {
                debug!("Printer {}: dropping frame: {}", id, e);
                return;
            }
        };

        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.record.disabled {
            return;
        }

        session.snapshot.apply(&delta);
        let display = project(&session.snapshot, chrono::Utc::now());
        self.sink.update(id, &display);

        // A defaulted lifecycle must not overwrite the recorded history
        if session.snapshot.has_state() && self.tracker.observe(id, display.lifecycle) {
            info!("Printer {} ({}) finished a print", session.record.name, id);
            self.notifier
                .notify(Notification::print_complete(&session.record));
        }
    }

    fn on_lost(&mut self, id: PrinterId, loss: ChannelLoss) {
        let paused = self.paused;
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        debug!("Printer {} channel lost: {}", id, MonitorError::from(loss));

        if let Some(channel) = session.channel.take() {
            channel.close();
        }
        session.snapshot.clear();
        let disabled = session.record.disabled;

        if disabled || paused {
            session.state = ConnectionState::Disconnected;
            return;
        }

        self.render_offline(id, ConnectionState::Reconnecting);
        self.arm_reconnect(id);
    }

    fn handle_registry_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Added(record) => {
                let id = record.id;
                if self.sessions.contains_key(&id) {
                    warn!("Printer {} already has a session", id);
                    return;
                }
                self.insert_session(record);
                self.connect(id);
            }
            RegistryEvent::Removed(id) => {
                if let Some(mut session) = self.sessions.remove(&id) {
                    session.teardown();
                }
                self.order.retain(|p| *p != id);
                self.tracker.forget(id);
                self.sink.remove(id);
                debug!("Printer {} session removed", id);
            }
            RegistryEvent::Updated(record) => self.on_record_updated(record),
            RegistryEvent::RefreshIntervalChanged(secs) => {
                self.connector.refresh_interval_changed(secs);
            }
        }
    }

    fn on_record_updated(&mut self, record: PrinterRecord) {
        let id = record.id;
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let previous = std::mem::replace(&mut session.record, record.clone());

        if record.disabled && !previous.disabled {
            session.teardown();
            self.render_disabled(id);
        } else if !record.disabled && previous.disabled {
            self.render_offline(id, ConnectionState::Disconnected);
            self.connect(id);
        } else if !record.disabled && record.address != previous.address {
            session.teardown();
            self.render_offline(id, ConnectionState::Disconnected);
            self.connect(id);
        }
    }

    fn render_disabled(&self, id: PrinterId) {
        self.sink.update(id, &PrinterDisplayState::disabled());
        self.sink.set_connectivity(id, Connectivity::Disabled);
    }

    fn render_offline(&self, id: PrinterId, state: ConnectionState) {
        self.sink.update(id, &PrinterDisplayState::offline());
        self.sink.set_connectivity(id, Connectivity::Live(state));
    }

    fn session_infos(&self) -> Vec<SessionInfo> {
        self.order
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .map(|s| SessionInfo {
                printer_id: s.record.id,
                state: s.state,
                disabled: s.record.disabled,
                reconnect_pending: s.reconnect.is_some(),
            })
            .collect()
    }
}
