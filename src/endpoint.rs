use crate::config::{AppConfig, DEFAULT_STATUS_PORT};
use crate::protocol::STATUS_GROUPS;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static SCHEME_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)(https?|wss?)://").expect("Invalid scheme regex pattern"));

/// Remove a leading `http://`, `https://`, `ws://` or `wss://`
pub fn strip_scheme(address: &str) -> &str {
    match SCHEME_PREFIX.find(address) {
        Some(m) => &address[m.end()..],
        None => address,
    }
}

/// Host part of a configured printer address.
///
/// The address usually carries the web UI port (e.g. `:4408`), which is
/// dropped; the status API listens on its own port.
pub fn host_of(address: &str) -> &str {
    let clean = strip_scheme(address.trim());
    let authority = clean.split('/').next().unwrap_or(clean);

    let host = if let Some(rest) = authority.strip_prefix('[') {
        // [ipv6]:port
        rest.split(']').next().unwrap_or(rest)
    } else {
        authority.split(':').next().unwrap_or(authority)
    };

    if host.is_empty() {
        clean
    } else {
        host
    }
}

/// Maps printer addresses to the Moonraker endpoints the monitor talks to
#[derive(Debug, Clone)]
pub struct EndpointResolver {
    status_port: u16,
    template: String,
    overrides: HashMap<String, String>,
}

impl Default for EndpointResolver {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_PORT, "http://{host}:{port}", HashMap::new())
    }
}

impl EndpointResolver {
    pub fn new(
        status_port: u16,
        template: impl Into<String>,
        overrides: HashMap<String, String>,
    ) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(host, base)| (host, base.trim_end_matches('/').to_string()))
            .collect();
        Self {
            status_port,
            template: template.into(),
            overrides,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.status_port,
            config.channel_template.clone(),
            config.endpoint_overrides.clone(),
        )
    }

    /// HTTP base URL of the printer's status API
    pub fn api_base(&self, address: &str) -> String {
        let host = host_of(address);
        if let Some(base) = self.overrides.get(host) {
            return base.clone();
        }
        self.template
            .replace("{host}", &bracket_ipv6(host))
            .replace("{port}", &self.status_port.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    /// WebSocket address of the printer's push status channel
    pub fn resolve_status_channel(&self, address: &str) -> String {
        let base = self.api_base(address);
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base
        } else {
            format!("ws://{}", base)
        };
        format!("{}/websocket", ws_base)
    }

    /// HTTP query endpoint for pull mode, asking for the same groups the
    /// push channel subscribes to
    pub fn resolve_query_endpoint(&self, address: &str) -> String {
        format!(
            "{}/printer/objects/query?{}",
            self.api_base(address),
            STATUS_GROUPS.join("&")
        )
    }
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_extraction() {
        assert_eq!(host_of("http://10.0.68.108:4408"), "10.0.68.108");
        assert_eq!(host_of("10.0.68.108:4408"), "10.0.68.108");
        assert_eq!(host_of("https://voron.local/"), "voron.local");
        assert_eq!(host_of("voron.local"), "voron.local");
        assert_eq!(host_of("[fe80::1]:4408"), "fe80::1");
        assert_eq!(host_of("  10.0.0.1:80/fluidd  "), "10.0.0.1");
    }

    #[test]
    fn test_malformed_address_is_treated_as_host() {
        assert_eq!(host_of(":4408"), ":4408");
        assert_eq!(host_of("http://"), "");
    }

    #[test]
    fn test_generic_template() {
        let resolver = EndpointResolver::default();
        assert_eq!(
            resolver.resolve_status_channel("http://10.0.68.108:4408"),
            "ws://10.0.68.108:7125/websocket"
        );
        assert_eq!(
            resolver.resolve_status_channel("[fe80::1]:4408"),
            "ws://[fe80::1]:7125/websocket"
        );
        assert_eq!(
            resolver.resolve_query_endpoint("10.0.0.2"),
            "http://10.0.0.2:7125/printer/objects/query?print_stats&heater_bed&extruder&display_status&virtual_sdcard"
        );
    }

    #[test]
    fn test_override_table() {
        let overrides = HashMap::from([(
            "10.0.68.108".to_string(),
            "https://gateway.lan/api/printer1-7125/".to_string(),
        )]);
        let resolver = EndpointResolver::new(7125, "http://{host}:{port}", overrides);

        assert_eq!(
            resolver.resolve_status_channel("10.0.68.108:4408"),
            "wss://gateway.lan/api/printer1-7125/websocket"
        );
        // Other hosts fall through to the template
        assert_eq!(
            resolver.resolve_status_channel("10.0.68.121:4408"),
            "ws://10.0.68.121:7125/websocket"
        );
    }

    #[test]
    fn test_proxy_template() {
        let resolver =
            EndpointResolver::new(7125, "http://proxy.lan/api/proxy7125/{host}:{port}", HashMap::new());
        assert_eq!(
            resolver.resolve_status_channel("http://10.0.0.9:4408"),
            "ws://proxy.lan/api/proxy7125/10.0.0.9:7125/websocket"
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = EndpointResolver::default();
        let a = resolver.resolve_status_channel("http://10.0.0.4:4408");
        let b = resolver.resolve_status_channel("http://10.0.0.4:4408");
        assert_eq!(a, b);
    }
}
