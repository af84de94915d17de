use crate::protocol::StatusDelta;
use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};

/// Coarse activity bucket shown on a printer card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Channel is live but no status has arrived yet
    Idle,
    Printing,
    Paused,
    Complete,
    Ready,
    Offline,
    Disabled,
}

/// Rounded actual/target pair in °C
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Temperature {
    pub actual: i64,
    pub target: i64,
}

/// Normalized per-printer display data. `None` means unknown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrinterDisplayState {
    pub lifecycle: LifecycleState,
    pub progress_fraction: Option<f64>,
    pub filename: Option<String>,
    pub bed_temp: Option<Temperature>,
    pub extruder_temp: Option<Temperature>,
    pub print_duration_secs: Option<u64>,
    pub eta: Option<DateTime<Utc>>,
}

impl PrinterDisplayState {
    fn unknown(lifecycle: LifecycleState) -> Self {
        Self {
            lifecycle,
            progress_fraction: None,
            filename: None,
            bed_temp: None,
            extruder_temp: None,
            print_duration_secs: None,
            eta: None,
        }
    }

    pub fn idle() -> Self {
        Self::unknown(LifecycleState::Idle)
    }

    pub fn offline() -> Self {
        Self::unknown(LifecycleState::Offline)
    }

    pub fn disabled() -> Self {
        Self::unknown(LifecycleState::Disabled)
    }

    /// True when every data field is unknown
    pub fn is_blank(&self) -> bool {
        self.progress_fraction.is_none()
            && self.filename.is_none()
            && self.bed_temp.is_none()
            && self.extruder_temp.is_none()
            && self.print_duration_secs.is_none()
            && self.eta.is_none()
    }
}

/// Last known value of every status field for one printer, built by
/// merging deltas in receipt order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    received: bool,
    state: Option<String>,
    filename: Option<String>,
    print_duration: Option<f64>,
    total_duration: Option<f64>,
    estimated_time: Option<f64>,
    bed_temperature: Option<f64>,
    bed_target: Option<f64>,
    extruder_temperature: Option<f64>,
    extruder_target: Option<f64>,
    display_progress: Option<f64>,
    sdcard_progress: Option<f64>,
}

fn merge<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if let Some(v) = incoming {
        *slot = Some(v.clone());
    }
}

impl StatusSnapshot {
    /// Overwrite only the fields present in `delta`
    pub fn apply(&mut self, delta: &StatusDelta) {
        self.received = true;

        if let Some(ps) = &delta.print_stats {
            merge(&mut self.state, &ps.state);
            merge(&mut self.filename, &ps.filename);
            merge(&mut self.print_duration, &ps.print_duration);
            merge(&mut self.total_duration, &ps.total_duration);
            merge(&mut self.estimated_time, &ps.estimated_time);
        }
        if let Some(bed) = &delta.heater_bed {
            merge(&mut self.bed_temperature, &bed.temperature);
            merge(&mut self.bed_target, &bed.target);
        }
        if let Some(ext) = &delta.extruder {
            merge(&mut self.extruder_temperature, &ext.temperature);
            merge(&mut self.extruder_target, &ext.target);
        }
        if let Some(ds) = &delta.display_status {
            merge(&mut self.display_progress, &ds.progress);
        }
        if let Some(sd) = &delta.virtual_sdcard {
            merge(&mut self.sdcard_progress, &sd.progress);
        }
    }

    /// Whether a `print_stats.state` has been received since the last clear
    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    /// Forget everything; used when the channel drops
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Map a raw `print_stats.state` tag to its display bucket
pub fn lifecycle_from_tag(tag: Option<&str>) -> LifecycleState {
    match tag {
        Some("printing") => LifecycleState::Printing,
        Some("paused") => LifecycleState::Paused,
        Some("complete") => LifecycleState::Complete,
        _ => LifecycleState::Ready,
    }
}

/// Derive the display state of a live printer from its merged status
pub fn project(snapshot: &StatusSnapshot, now: DateTime<Utc>) -> PrinterDisplayState {
    if !snapshot.received {
        return PrinterDisplayState::idle();
    }

    // Storage-card progress is authoritative over the display status
    let progress_fraction = snapshot
        .sdcard_progress
        .or(snapshot.display_progress)
        .filter(|p| p.is_finite())
        .map(|p| p.clamp(0.0, 1.0));

    let eta = match (
        snapshot.estimated_time.or(snapshot.total_duration),
        progress_fraction,
    ) {
        (Some(duration), Some(progress)) if duration > 0.0 && progress > 0.0 => {
            eta_from(now, duration * (1.0 - progress) * 1000.0)
        }
        _ => None,
    };

    PrinterDisplayState {
        lifecycle: lifecycle_from_tag(snapshot.state.as_deref()),
        progress_fraction,
        filename: snapshot.filename.clone().filter(|f| !f.is_empty()),
        bed_temp: temperature(snapshot.bed_temperature, snapshot.bed_target),
        extruder_temp: temperature(snapshot.extruder_temperature, snapshot.extruder_target),
        print_duration_secs: snapshot
            .print_duration
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(|d| d.floor() as u64),
        eta,
    }
}

/// `now + remaining_ms`, or `None` when the sum is not representable
fn eta_from(now: DateTime<Utc>, remaining_ms: f64) -> Option<DateTime<Utc>> {
    let remaining_ms = remaining_ms.round();
    if !remaining_ms.is_finite() || remaining_ms < 0.0 || remaining_ms >= i64::MAX as f64 {
        return None;
    }
    now.checked_add_signed(Duration::try_milliseconds(remaining_ms as i64)?)
}

fn temperature(actual: Option<f64>, target: Option<f64>) -> Option<Temperature> {
    let actual = actual.filter(|t| t.is_finite())?;
    Some(Temperature {
        actual: actual.round() as i64,
        target: target.filter(|t| t.is_finite()).unwrap_or(0.0).round() as i64,
    })
}

/// `45s`, `3m 5s`, `1h 2m 3s`
pub fn format_time(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Strings for one printer card, `-` for unknown values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayCard {
    pub status_text: String,
    pub indicator: String,
    pub filename: String,
    pub progress_text: String,
    pub progress_width: f64,
    pub bed_temp: String,
    pub extruder_temp: String,
    pub print_time: String,
    pub eta: String,
}

impl From<&PrinterDisplayState> for DisplayCard {
    fn from(state: &PrinterDisplayState) -> Self {
        let (status_text, indicator) = match state.lifecycle {
            LifecycleState::Idle | LifecycleState::Ready => ("Ready", "status-online"),
            LifecycleState::Printing => ("Printing", "status-printing"),
            LifecycleState::Paused => ("Paused", "status-printing"),
            LifecycleState::Complete => ("Complete", "status-complete"),
            LifecycleState::Offline => ("Offline", "status-offline"),
            LifecycleState::Disabled => ("Disabled", "status-disabled"),
        };

        let dash = || "-".to_string();
        let temp = |t: &Option<Temperature>| {
            t.map(|t| format!("{}°C / {}°C", t.actual, t.target))
                .unwrap_or_else(dash)
        };

        Self {
            status_text: status_text.to_string(),
            indicator: indicator.to_string(),
            filename: state.filename.clone().unwrap_or_else(dash),
            progress_text: state
                .progress_fraction
                .map(|p| format!("{}%", (p * 100.0).round() as i64))
                .unwrap_or_else(dash),
            progress_width: state.progress_fraction.map(|p| p * 100.0).unwrap_or(0.0),
            bed_temp: temp(&state.bed_temp),
            extruder_temp: temp(&state.extruder_temp),
            print_time: state.print_duration_secs.map(format_time).unwrap_or_else(dash),
            eta: state
                .eta
                .map(|eta| eta.with_timezone(&Local).format("%H:%M:%S").to_string())
                .unwrap_or_else(dash),
        }
    }
}
