use crate::endpoint::strip_scheme;
use crate::errors::{MonitorError, Result};
use crate::store::RegistryStore;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type PrinterId = i64;

/// Store key holding the serialized printer list
pub const PRINTERS_KEY: &str = "printers";
/// Store key holding the refresh interval in seconds
pub const POLL_INTERVAL_KEY: &str = "pollInterval";

pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 1;

/// Webcam streams served by the old standalone streamer on :8080
static LEGACY_WEBCAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r":8080(/stream|/\?action=stream)").expect("Invalid legacy webcam regex pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterRecord {
    pub id: PrinterId,
    pub name: String,
    /// `host[:port]`, usually the web UI address; may carry a scheme
    #[serde(rename = "ip", alias = "address")]
    pub address: String,
    #[serde(rename = "webcamUrl", alias = "webcam_address", default)]
    pub webcam_address: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// User input for a new printer
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NewPrinter {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub webcam_address: Option<String>,
}

/// Change notification broadcast after every successful mutation
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Added(PrinterRecord),
    Removed(PrinterId),
    Updated(PrinterRecord),
    RefreshIntervalChanged(u64),
}

/// Ordered printer list plus the refresh interval, persisted on every change
pub struct Registry {
    printers: Vec<PrinterRecord>,
    refresh_interval_secs: u64,
    store: Box<dyn RegistryStore>,
    subscribers: Vec<mpsc::UnboundedSender<RegistryEvent>>,
}

impl Registry {
    /// Load the registry from `store`, migrating legacy data and seeding
    /// defaults when nothing usable is stored. Never fails: a corrupt entry
    /// is logged and treated as absent.
    pub fn load(store: impl RegistryStore + 'static) -> Self {
        let mut printers = match store.get(PRINTERS_KEY) {
            Some(raw) => match parse_printers(&raw) {
                Ok(list) => list,
                Err(e) => {
                    warn!("{}; reseeding defaults", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let refresh_interval_secs = store
            .get(POLL_INTERVAL_KEY)
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);

        let deduped = dedupe_ids(&mut printers);
        let migrated = migrate_legacy_webcams(&mut printers);
        let seeded = printers.is_empty();
        if seeded {
            printers = default_printers();
        }

        let mut registry = Self {
            printers,
            refresh_interval_secs,
            store: Box::new(store),
            subscribers: Vec::new(),
        };

        if deduped || migrated || seeded {
            if seeded {
                info!("Seeded registry with {} default printers", registry.printers.len());
            }
            if migrated {
                info!("Migrated legacy webcam addresses");
            }
            if let Err(e) = registry.persist() {
                warn!("Failed to persist registry after load: {}", e);
            }
        }

        info!(
            "Registry loaded: {} printers, refresh every {}s",
            registry.printers.len(),
            registry.refresh_interval_secs
        );
        registry
    }

    pub fn records(&self) -> &[PrinterRecord] {
        &self.printers
    }

    pub fn get(&self, id: PrinterId) -> Option<&PrinterRecord> {
        self.printers.iter().find(|p| p.id == id)
    }

    pub fn refresh_interval_secs(&self) -> u64 {
        self.refresh_interval_secs
    }

    /// Receive every future `RegistryEvent`
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn add_printer(&mut self, input: NewPrinter) -> Result<PrinterRecord> {
        let name = input.name.trim();
        let address = input.address.trim();
        if name.is_empty() || address.is_empty() {
            return Err(MonitorError::Validation(
                "Please fill in printer name and IP address".to_string(),
            ));
        }

        let address = if address.starts_with("http") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        let webcam_address = input
            .webcam_address
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty());

        let record = PrinterRecord {
            id: self.next_id(),
            name: name.to_string(),
            address,
            webcam_address,
            disabled: false,
        };

        info!("Adding printer: {} ({})", record.name, record.id);
        self.printers.push(record.clone());
        self.publish(RegistryEvent::Added(record.clone()));
        self.persist()?;
        Ok(record)
    }

    pub fn remove_printer(&mut self, id: PrinterId) -> Result<PrinterRecord> {
        let idx = self.index_of(id)?;
        let record = self.printers.remove(idx);

        info!("Removing printer: {} ({})", record.name, id);
        self.publish(RegistryEvent::Removed(id));
        self.persist()?;
        Ok(record)
    }

    /// Flip the disabled flag; returns the new value
    pub fn toggle_disabled(&mut self, id: PrinterId) -> Result<bool> {
        let idx = self.index_of(id)?;
        let record = &mut self.printers[idx];
        record.disabled = !record.disabled;
        let record = record.clone();

        info!(
            "Printer {} ({}) {}",
            record.name,
            id,
            if record.disabled { "disabled" } else { "enabled" }
        );
        self.publish(RegistryEvent::Updated(record.clone()));
        self.persist()?;
        Ok(record.disabled)
    }

    pub fn rename_printer(&mut self, id: PrinterId, name: &str) -> Result<PrinterRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MonitorError::Validation("Printer name is required".to_string()));
        }
        let idx = self.index_of(id)?;
        self.printers[idx].name = name.to_string();
        let record = self.printers[idx].clone();

        info!("Renamed printer {} to {}", id, record.name);
        self.publish(RegistryEvent::Updated(record.clone()));
        self.persist()?;
        Ok(record)
    }

    pub fn set_refresh_interval(&mut self, secs: u64) -> Result<()> {
        if secs == 0 {
            return Err(MonitorError::Validation(
                "Refresh interval must be at least one second".to_string(),
            ));
        }
        self.refresh_interval_secs = secs;

        info!("Refresh interval set to {}s", secs);
        self.publish(RegistryEvent::RefreshIntervalChanged(secs));
        self.persist()
    }

    fn index_of(&self, id: PrinterId) -> Result<usize> {
        self.printers
            .iter()
            .position(|p| p.id == id)
            .ok_or(MonitorError::PrinterNotFound(id))
    }

    /// Millisecond timestamp ids, bumped past the largest id ever seen here
    fn next_id(&self) -> PrinterId {
        let now = chrono::Utc::now().timestamp_millis();
        let max = self.printers.iter().map(|p| p.id).max().unwrap_or(0);
        now.max(max + 1)
    }

    fn publish(&mut self, event: RegistryEvent) {
        debug!("Registry event: {:?}", event);
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Rewrite both store entries
    fn persist(&mut self) -> Result<()> {
        let printers = serde_json::to_string(&self.printers)?;
        self.store.write(&[
            (PRINTERS_KEY, printers),
            (POLL_INTERVAL_KEY, self.refresh_interval_secs.to_string()),
        ])
    }
}

fn parse_printers(raw: &str) -> Result<Vec<PrinterRecord>> {
    serde_json::from_str(raw).map_err(|e| MonitorError::PersistenceCorrupt(e.to_string()))
}

/// Keep the first record for each id
fn dedupe_ids(printers: &mut Vec<PrinterRecord>) -> bool {
    let before = printers.len();
    let mut seen = HashSet::new();
    printers.retain(|p| seen.insert(p.id));
    if printers.len() != before {
        warn!("Dropped {} printer records with duplicate ids", before - printers.len());
        return true;
    }
    false
}

/// Rewrite webcam addresses that point at the legacy :8080 streamer to the
/// `/webcam/` path served by the printer's web UI. Returns whether anything
/// changed.
pub fn migrate_legacy_webcams(printers: &mut [PrinterRecord]) -> bool {
    let mut updated = false;

    for printer in printers.iter_mut() {
        let Some(webcam) = printer.webcam_address.as_deref() else {
            continue;
        };
        if !LEGACY_WEBCAM.is_match(webcam) {
            continue;
        }

        let mut ip_port = strip_scheme(&printer.address).to_string();
        if ip_port.is_empty() {
            ip_port = url::Url::parse(webcam)
                .ok()
                .and_then(|u| {
                    let host = u.host_str()?.to_string();
                    Some(match u.port() {
                        Some(port) => format!("{}:{}", host, port),
                        None => host,
                    })
                })
                .unwrap_or_default();
        }

        if !ip_port.is_empty() {
            debug!("Migrating webcam for printer {}: {}", printer.id, webcam);
            printer.webcam_address = Some(format!("http://{}/webcam/?action=stream", ip_port));
            updated = true;
        }
    }

    updated
}

pub fn default_printers() -> Vec<PrinterRecord> {
    [(1, "10.0.68.108:4408"), (2, "10.0.68.121:4408"), (3, "10.0.68.130:4408")]
        .into_iter()
        .map(|(id, ip)| PrinterRecord {
            id,
            name: format!("Printer {}", id),
            address: ip.to_string(),
            webcam_address: Some(format!("http://{}/webcam/?action=stream", ip)),
            disabled: false,
        })
        .collect()
}
