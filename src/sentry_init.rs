use once_cell::sync::Lazy;
use regex::Regex;
use sentry::{ClientInitGuard, ClientOptions};
use std::env;
use std::sync::Arc;
use tracing::info;

// Printer addresses identify the user's LAN; strip them from every report
static URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(https?|wss?)://[^\s/]+")
        .expect("Invalid URL regex pattern")
});
static IPV4_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}(?::\d{1,5})?\b")
        .expect("Invalid IPv4 regex pattern")
});

/// Initialize Sentry crash reporting
///
/// # Environment Variables
/// - `SENTRY_DSN`: Sentry Data Source Name (required)
/// - `SENTRY_ENVIRONMENT`: Environment name (default: "development")
/// - `SENTRY_RELEASE`: Release version (default: from Cargo.toml)
///
/// Returns `None` when no DSN is configured. The guard must be kept alive
/// for the lifetime of the process.
pub fn init() -> Option<ClientInitGuard> {
    let dsn = match env::var("SENTRY_DSN").ok() {
        Some(d) if !d.is_empty() => d,
        _ => {
            info!("Sentry DSN not configured - crash reporting disabled");
            return None;
        }
    };

    let environment = env::var("SENTRY_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    let release = env::var("SENTRY_RELEASE").unwrap_or_else(|_| {
        format!("{}@{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    });

    let guard = sentry::init((
        dsn,
        ClientOptions {
            release: Some(release.into()),
            environment: Some(environment.into()),
            attach_stacktrace: true,
            send_default_pii: false,
            before_send: Some(Arc::new(before_send_filter)),
            ..Default::default()
        },
    ));

    info!(
        "Sentry crash reporting initialized (environment: {})",
        guard.options().environment.as_deref().unwrap_or("unknown")
    );

    Some(guard)
}

fn before_send_filter(
    mut event: sentry::protocol::Event<'static>,
) -> Option<sentry::protocol::Event<'static>> {
    if let Some(message) = event.message.as_mut() {
        *message = redact_addresses(message);
    }

    for exception in &mut event.exception.values {
        if let Some(value) = exception.value.as_mut() {
            *value = redact_addresses(value);
        }
    }

    for breadcrumb in &mut event.breadcrumbs.values {
        if let Some(message) = breadcrumb.message.as_mut() {
            *message = redact_addresses(message);
        }
    }

    event
        .tags
        .insert("monitor_version".into(), env!("CARGO_PKG_VERSION").into());
    event.tags.insert("platform".into(), std::env::consts::OS.into());

    Some(event)
}

/// Replace URLs and IPv4 host:port pairs with placeholders
fn redact_addresses(message: &str) -> String {
    // URLs first, so the host inside is removed along with the scheme
    let cleaned = URL_REGEX.replace_all(message, "[URL_REDACTED]");
    IPV4_REGEX
        .replace_all(&cleaned, "[ADDRESS_REDACTED]")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_channel_url() {
        let cleaned =
            redact_addresses("Status channel open failed: ws://10.0.68.108:7125/websocket refused");
        assert!(!cleaned.contains("10.0.68.108"));
        assert!(cleaned.contains("[URL_REDACTED]/websocket"));
    }

    #[test]
    fn test_redacts_bare_address() {
        let cleaned = redact_addresses("Printer at 192.168.1.20:4408 went away");
        assert_eq!(cleaned, "Printer at [ADDRESS_REDACTED] went away");
    }

    #[test]
    fn test_leaves_plain_text_alone() {
        let message = "Printer 3 channel lost: closed by peer";
        assert_eq!(redact_addresses(message), message);
    }
}
