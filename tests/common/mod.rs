// Common test utilities and fixtures

use fleet_monitor::notifier::{Notification, NotificationBackend, Notifier, Permission};
use fleet_monitor::projector::{LifecycleState, PrinterDisplayState};
use fleet_monitor::realtime::{
    ChannelEvents, ChannelHandle, ChannelTarget, ConnectionManager, Connector, ManagerConfig,
    ManagerHandle,
};
use fleet_monitor::registry::{PrinterId, PrinterRecord, Registry, PRINTERS_KEY};
use fleet_monitor::sink::{Connectivity, RenderSink};
use fleet_monitor::store::MemoryStore;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// One channel the manager asked the mock connector to open
#[allow(dead_code)]
pub struct OpenedChannel {
    pub target: ChannelTarget,
    pub events: ChannelEvents,
    closed: oneshot::Receiver<()>,
}

/// Connector that records open requests and lets the test drive events
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct MockConnector {
    opened: Arc<Mutex<Vec<OpenedChannel>>>,
    intervals: Arc<Mutex<Vec<u64>>>,
}

#[allow(dead_code)]
impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn opens_for(&self, printer_id: PrinterId) -> usize {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.target.printer_id == printer_id)
            .count()
    }

    /// Events sender of the most recent channel for `printer_id`
    pub fn events(&self, printer_id: PrinterId) -> ChannelEvents {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.target.printer_id == printer_id)
            .map(|c| c.events.clone())
            .expect("printer never connected")
    }

    pub fn target(&self, printer_id: PrinterId) -> ChannelTarget {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.target.printer_id == printer_id)
            .map(|c| c.target.clone())
            .expect("printer never connected")
    }

    /// Whether the most recent channel for `printer_id` was closed locally
    pub fn was_closed(&self, printer_id: PrinterId) -> bool {
        let mut opened = self.opened.lock().unwrap();
        let channel = opened
            .iter_mut()
            .rev()
            .find(|c| c.target.printer_id == printer_id)
            .expect("printer never connected");
        !matches!(
            channel.closed.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }

    pub fn intervals(&self) -> Vec<u64> {
        self.intervals.lock().unwrap().clone()
    }
}

impl Connector for MockConnector {
    fn open(&self, target: ChannelTarget, events: ChannelEvents) -> ChannelHandle {
        let (handle, closed) = ChannelHandle::detached();
        self.opened.lock().unwrap().push(OpenedChannel {
            target,
            events,
            closed,
        });
        handle
    }

    fn refresh_interval_changed(&self, secs: u64) {
        self.intervals.lock().unwrap().push(secs);
    }
}

/// Sink that keeps every update for inspection
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct RecordingSink {
    updates: Arc<Mutex<HashMap<PrinterId, Vec<PrinterDisplayState>>>>,
    connectivity: Arc<Mutex<HashMap<PrinterId, Connectivity>>>,
    removed: Arc<Mutex<Vec<PrinterId>>>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, printer_id: PrinterId) -> Option<PrinterDisplayState> {
        self.updates
            .lock()
            .unwrap()
            .get(&printer_id)
            .and_then(|u| u.last().cloned())
    }

    pub fn lifecycles(&self, printer_id: PrinterId) -> Vec<LifecycleState> {
        self.updates
            .lock()
            .unwrap()
            .get(&printer_id)
            .map(|u| u.iter().map(|s| s.lifecycle).collect())
            .unwrap_or_default()
    }

    pub fn connectivity(&self, printer_id: PrinterId) -> Option<Connectivity> {
        self.connectivity.lock().unwrap().get(&printer_id).copied()
    }

    pub fn removed(&self) -> Vec<PrinterId> {
        self.removed.lock().unwrap().clone()
    }
}

impl RenderSink for RecordingSink {
    fn update(&self, printer_id: PrinterId, state: &PrinterDisplayState) {
        self.updates
            .lock()
            .unwrap()
            .entry(printer_id)
            .or_default()
            .push(state.clone());
    }

    fn set_connectivity(&self, printer_id: PrinterId, connectivity: Connectivity) {
        self.connectivity
            .lock()
            .unwrap()
            .insert(printer_id, connectivity);
    }

    fn remove(&self, printer_id: PrinterId) {
        self.removed.lock().unwrap().push(printer_id);
    }
}

/// Notification backend that forwards every shown notification to a channel
#[allow(dead_code)]
pub struct ChannelBackend {
    tx: mpsc::UnboundedSender<Notification>,
}

#[allow(dead_code)]
impl ChannelBackend {
    pub fn notifier() -> (Notifier, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Notifier::new(Arc::new(Self { tx })), rx)
    }
}

impl NotificationBackend for ChannelBackend {
    fn is_supported(&self) -> bool {
        true
    }

    fn permission(&self) -> Permission {
        Permission::Granted
    }

    fn request_permission(&self) -> Permission {
        Permission::Granted
    }

    fn show(&self, notification: &Notification) -> fleet_monitor::Result<()> {
        let _ = self.tx.send(notification.clone());
        Ok(())
    }

    fn alert(&self, _title: &str, _body: &str) {}
}

#[allow(dead_code)]
pub fn printer(id: PrinterId, address: &str) -> PrinterRecord {
    PrinterRecord {
        id,
        name: format!("Printer {}", id),
        address: address.to_string(),
        webcam_address: None,
        disabled: false,
    }
}

/// Registry backed by memory, holding exactly `printers`
#[allow(dead_code)]
pub fn registry_with(printers: &[PrinterRecord]) -> Registry {
    let raw = serde_json::to_string(printers).unwrap();
    Registry::load(MemoryStore::new().with_entry(PRINTERS_KEY, &raw))
}

/// Running manager plus the registry that feeds it
#[allow(dead_code)]
pub struct Harness {
    pub registry: Registry,
    pub manager: ManagerHandle,
    pub connector: MockConnector,
    pub sink: RecordingSink,
}

#[allow(dead_code)]
impl Harness {
    pub fn start(printers: &[PrinterRecord], notifier: Notifier) -> Self {
        let mut registry = registry_with(printers);
        let events = registry.subscribe();
        let connector = MockConnector::new();
        let sink = RecordingSink::new();
        let (manager, _task) = ConnectionManager::spawn(
            registry.records().to_vec(),
            events,
            Arc::new(connector.clone()),
            Arc::new(sink.clone()),
            notifier,
            ManagerConfig {
                reconnect_delay: Duration::from_secs(5),
            },
        );
        Self {
            registry,
            manager,
            connector,
            sink,
        }
    }

    /// Wait until the manager has handled everything queued so far
    pub async fn settle(&self) {
        self.manager.sessions().await.unwrap();
    }
}

#[allow(dead_code)]
pub fn status_update(status: serde_json::Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": "notify_status_update",
        "params": [status, 1234.5],
    })
    .to_string()
}

#[allow(dead_code)]
pub fn printing_frame(filename: &str, progress: f64) -> String {
    status_update(json!({
        "print_stats": {
            "state": "printing",
            "filename": filename,
            "print_duration": 600.0,
            "estimated_time": 3600.0,
        },
        "virtual_sdcard": { "progress": progress },
        "heater_bed": { "temperature": 60.2, "target": 60.0 },
        "extruder": { "temperature": 214.6, "target": 215.0 },
    }))
}

#[allow(dead_code)]
pub fn state_frame(state: &str) -> String {
    status_update(json!({ "print_stats": { "state": state } }))
}
