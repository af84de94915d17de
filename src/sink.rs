use crate::projector::{DisplayCard, PrinterDisplayState};
use crate::registry::PrinterId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Per-printer connection state, owned by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Reconnecting,
}

/// What the card shows for connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Live(ConnectionState),
    Disabled,
}

/// Consumer of derived display state (the on-screen cards)
pub trait RenderSink: Send + Sync {
    fn update(&self, printer_id: PrinterId, state: &PrinterDisplayState);
    fn set_connectivity(&self, printer_id: PrinterId, connectivity: Connectivity);
    /// Printer record removed, drop its card
    fn remove(&self, _printer_id: PrinterId) {}
}

/// Writes card changes to the log
#[derive(Default)]
pub struct ConsoleSink {
    last: RwLock<HashMap<PrinterId, DisplayCard>>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RenderSink for ConsoleSink {
    fn update(&self, printer_id: PrinterId, state: &PrinterDisplayState) {
        let card = DisplayCard::from(state);
        if let Ok(mut last) = self.last.write() {
            // Only log when something visible changed
            if last.get(&printer_id) == Some(&card) {
                return;
            }
            last.insert(printer_id, card.clone());
        }
        info!(
            printer_id,
            "[{}] file={} progress={} bed={} extruder={} time={} eta={}",
            card.status_text,
            card.filename,
            card.progress_text,
            card.bed_temp,
            card.extruder_temp,
            card.print_time,
            card.eta
        );
    }

    fn set_connectivity(&self, printer_id: PrinterId, connectivity: Connectivity) {
        debug!(printer_id, "Connectivity: {:?}", connectivity);
    }

    fn remove(&self, printer_id: PrinterId) {
        if let Ok(mut last) = self.last.write() {
            last.remove(&printer_id);
        }
    }
}

/// Latest card and connectivity for one printer
#[derive(Debug, Clone, Serialize)]
pub struct CardSnapshot {
    pub state: PrinterDisplayState,
    pub card: DisplayCard,
    pub connectivity: Connectivity,
}

/// Keeps the latest card per printer so the API can serve it
#[derive(Clone, Default)]
pub struct SnapshotSink {
    cards: Arc<RwLock<HashMap<PrinterId, CardSnapshot>>>,
}

impl SnapshotSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, printer_id: PrinterId) -> Option<CardSnapshot> {
        self.cards.read().ok()?.get(&printer_id).cloned()
    }
}

impl RenderSink for SnapshotSink {
    fn update(&self, printer_id: PrinterId, state: &PrinterDisplayState) {
        if let Ok(mut cards) = self.cards.write() {
            let card = DisplayCard::from(state);
            cards
                .entry(printer_id)
                .and_modify(|c| {
                    c.state = state.clone();
                    c.card = card.clone();
                })
                .or_insert_with(|| CardSnapshot {
                    state: state.clone(),
                    card,
                    connectivity: Connectivity::Live(ConnectionState::Disconnected),
                });
        }
    }

    fn set_connectivity(&self, printer_id: PrinterId, connectivity: Connectivity) {
        if let Ok(mut cards) = self.cards.write() {
            let offline = PrinterDisplayState::offline();
            cards
                .entry(printer_id)
                .and_modify(|c| c.connectivity = connectivity)
                .or_insert_with(|| CardSnapshot {
                    card: DisplayCard::from(&offline),
                    state: offline,
                    connectivity,
                });
        }
    }

    fn remove(&self, printer_id: PrinterId) {
        if let Ok(mut cards) = self.cards.write() {
            cards.remove(&printer_id);
        }
    }
}

/// Forwards to several sinks in order
pub struct FanoutSink {
    sinks: Vec<Arc<dyn RenderSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn RenderSink>>) -> Self {
        Self { sinks }
    }
}

impl RenderSink for FanoutSink {
    fn update(&self, printer_id: PrinterId, state: &PrinterDisplayState) {
        for sink in &self.sinks {
            sink.update(printer_id, state);
        }
    }

    fn set_connectivity(&self, printer_id: PrinterId, connectivity: Connectivity) {
        for sink in &self.sinks {
            sink.set_connectivity(printer_id, connectivity);
        }
    }

    fn remove(&self, printer_id: PrinterId) {
        for sink in &self.sinks {
            sink.remove(printer_id);
        }
    }
}
