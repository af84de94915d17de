//! Moonraker JSON-RPC frames used by the status channel and pull queries.

use crate::errors::{MonitorError, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Printer object groups the monitor subscribes to
pub const STATUS_GROUPS: [&str; 5] = [
    "print_stats",
    "heater_bed",
    "extruder",
    "display_status",
    "virtual_sdcard",
];

const SUBSCRIBE_METHOD: &str = "printer.objects.subscribe";
const STATUS_UPDATE_METHOD: &str = "notify_status_update";

/// Build the `printer.objects.subscribe` request with caller-chosen id
pub fn subscribe_request(id: u64) -> String {
    let objects: Map<String, Value> = STATUS_GROUPS
        .iter()
        .map(|group| (group.to_string(), Value::Null))
        .collect();

    json!({
        "jsonrpc": "2.0",
        "method": SUBSCRIBE_METHOD,
        "params": { "objects": objects },
        "id": id,
    })
    .to_string()
}

/// Per-group status fields; every field is optional because pushes only
/// carry what changed
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusDelta {
    #[serde(default)]
    pub print_stats: Option<PrintStatsDelta>,
    #[serde(default)]
    pub heater_bed: Option<HeaterDelta>,
    #[serde(default)]
    pub extruder: Option<HeaterDelta>,
    #[serde(default)]
    pub display_status: Option<ProgressDelta>,
    #[serde(default)]
    pub virtual_sdcard: Option<ProgressDelta>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PrintStatsDelta {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub print_duration: Option<f64>,
    #[serde(default)]
    pub total_duration: Option<f64>,
    #[serde(default)]
    pub estimated_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HeaterDelta {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub target: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProgressDelta {
    #[serde(default)]
    pub progress: Option<f64>,
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Status(StatusDelta),
    /// Valid JSON that carries no status (other notifications, RPC errors)
    Ignored,
}

/// Classify an inbound text frame.
///
/// Accepts `notify_status_update` notifications as well as subscribe
/// replies and `objects/query` responses (`result.status`).
pub fn parse_frame(text: &str) -> Result<Frame> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| MonitorError::MalformedPayload(e.to_string()))?;

    let status = if value.get("method").and_then(Value::as_str) == Some(STATUS_UPDATE_METHOD) {
        value.get("params").and_then(|p| p.get(0))
    } else {
        value.get("result").and_then(|r| r.get("status"))
    };

    match status {
        Some(status) => StatusDelta::deserialize(status)
            .map(Frame::Status)
            .map_err(|e| MonitorError::MalformedPayload(e.to_string())),
        None => Ok(Frame::Ignored),
    }
}
