//! Live status monitor for a fleet of Klipper/Moonraker printers.

pub mod api;
pub mod completion;
pub mod config;
pub mod endpoint;
pub mod errors;
pub mod logging;
pub mod notifier;
pub mod poller;
pub mod projector;
pub mod protocol;
pub mod realtime;
pub mod registry;
pub mod sentry_init;
pub mod sink;
pub mod store;

pub use errors::{MonitorError, Result};
