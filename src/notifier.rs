use crate::errors::{MonitorError, Result};
use crate::registry::PrinterRecord;
use once_cell::sync::OnceCell;
use std::io::Write;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

const APP_NAME: &str = "Moonraker Fleet Monitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    /// Not asked yet
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Notifications sharing a tag replace each other
    pub tag: Option<String>,
    /// Stay on screen until dismissed
    pub require_interaction: bool,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            tag: None,
            require_interaction: false,
        }
    }

    pub fn print_complete(printer: &PrinterRecord) -> Self {
        Self {
            title: format!("Print Complete - {}", printer.name),
            body: "Your 3D print has finished!".to_string(),
            tag: Some(format!("printer-{}", printer.id)),
            require_interaction: true,
        }
    }
}

/// Host notification facility
#[cfg_attr(test, mockall::automock)]
pub trait NotificationBackend: Send + Sync {
    fn is_supported(&self) -> bool;
    fn permission(&self) -> Permission;
    /// Ask the user once; resolves to the resulting permission
    fn request_permission(&self) -> Permission;
    fn show(&self, notification: &Notification) -> Result<()>;
    /// Synchronous last-resort message
    fn alert(&self, title: &str, body: &str);
}

/// How a notification ended up being delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Native,
    Alert,
    Logged,
}

#[derive(Clone)]
pub struct Notifier {
    backend: Option<Arc<dyn NotificationBackend>>,
}

impl Notifier {
    pub fn new(backend: Arc<dyn NotificationBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Notifier that only logs
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    /// Deliver now, degrading to the blocking alert on any failure
    pub fn deliver(&self, notification: &Notification) -> Delivery {
        let Some(backend) = &self.backend else {
            info!("{}: {}", notification.title, notification.body);
            return Delivery::Logged;
        };

        if !backend.is_supported() {
            debug!("Desktop notifications not supported, using alert");
            backend.alert(&notification.title, &notification.body);
            return Delivery::Alert;
        }

        if backend.permission() != Permission::Granted
            && backend.request_permission() != Permission::Granted
        {
            debug!("Notification permission not granted, using alert");
            backend.alert(&notification.title, &notification.body);
            return Delivery::Alert;
        }

        match backend.show(notification) {
            Ok(()) => Delivery::Native,
            Err(e) => {
                warn!("Notification failed, falling back to alert: {}", e);
                backend.alert(&notification.title, &notification.body);
                Delivery::Alert
            }
        }
    }

    /// Fire-and-forget delivery off the reactor thread
    pub fn notify(&self, notification: Notification) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let notifier = self.clone();
                handle.spawn_blocking(move || notifier.deliver(&notification));
            }
            Err(_) => {
                self.deliver(&notification);
            }
        }
    }
}

/// freedesktop notifications through `notify-send`
#[derive(Default)]
pub struct DesktopBackend {
    supported: OnceCell<bool>,
}

impl DesktopBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationBackend for DesktopBackend {
    fn is_supported(&self) -> bool {
        *self.supported.get_or_init(|| {
            Command::new("notify-send")
                .arg("--version")
                .output()
                .map(|out| out.status.success())
                .unwrap_or(false)
        })
    }

    fn permission(&self) -> Permission {
        if self.is_supported() {
            Permission::Granted
        } else {
            Permission::Denied
        }
    }

    fn request_permission(&self) -> Permission {
        self.permission()
    }

    fn show(&self, notification: &Notification) -> Result<()> {
        let mut cmd = Command::new("notify-send");
        cmd.arg("--app-name").arg(APP_NAME);
        if notification.require_interaction {
            cmd.arg("--urgency=critical");
        }
        if let Some(tag) = &notification.tag {
            cmd.arg("--hint").arg(format!("string:x-dunst-stack-tag:{}", tag));
        }
        cmd.arg(&notification.title).arg(&notification.body);

        let status = cmd
            .status()
            .map_err(|e| MonitorError::NotificationUnavailable(e.to_string()))?;
        if !status.success() {
            return Err(MonitorError::NotificationUnavailable(format!(
                "notify-send exited with {}",
                status
            )));
        }
        Ok(())
    }

    fn alert(&self, title: &str, body: &str) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "\x07{}: {}", title, body);
        let _ = stderr.flush();
    }
}
