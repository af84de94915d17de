use crate::endpoint::EndpointResolver;
use crate::errors::{MonitorError, Result};
use crate::realtime::{ChannelEvents, ChannelHandle, ChannelLoss, ChannelTarget, Connector};
use reqwest::Client;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info};

/// Polling stand-in for the push channel.
///
/// Each printer gets its own loop that queries the status endpoint at
/// the user's refresh interval. First successful response counts as the
/// channel opening; the first failure ends the channel so the manager's
/// reconnect policy applies unchanged.
pub struct PollConnector {
    client: Client,
    resolver: EndpointResolver,
    interval: watch::Sender<Duration>,
}

impl PollConnector {
    pub fn new(resolver: EndpointResolver, refresh_interval_secs: u64, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to create HTTP client with custom config: {}. Using defaults.", e);
                Client::new()
            });
        let (interval, _) = watch::channel(interval_from_secs(refresh_interval_secs));

        info!("Status poller ready (every {}s)", refresh_interval_secs.max(1));

        Self {
            client,
            resolver,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        *self.interval.borrow()
    }
}

impl Connector for PollConnector {
    fn open(&self, target: ChannelTarget, events: ChannelEvents) -> ChannelHandle {
        let url = self.resolver.resolve_query_endpoint(&target.address);
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_poll_loop(
            self.client.clone(),
            url,
            self.interval.subscribe(),
            events,
            close_rx,
        ));
        ChannelHandle::new(close_tx, task)
    }

    fn refresh_interval_changed(&self, secs: u64) {
        debug!("Poll interval now {}s", secs.max(1));
        self.interval.send_replace(interval_from_secs(secs));
    }
}

fn interval_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

async fn run_poll_loop(
    client: Client,
    url: String,
    interval: watch::Receiver<Duration>,
    events: ChannelEvents,
    mut close_rx: oneshot::Receiver<()>,
) {
    let mut opened = false;

    loop {
        let body = tokio::select! {
            _ = &mut close_rx => return,
            body = fetch_status(&client, &url) => body,
        };

        match body {
            Ok(text) => {
                if !opened {
                    opened = true;
                    events.opened();
                }
                events.frame(text);
            }
            Err(e) => {
                debug!("Printer {} poll failed: {}", events.printer_id(), e);
                let reason = e.to_string();
                events.lost(if opened {
                    ChannelLoss::Error(reason)
                } else {
                    ChannelLoss::OpenFailed(reason)
                });
                return;
            }
        }

        // Re-read each round so interval changes apply to running loops
        let delay = *interval.borrow();
        tokio::select! {
            _ = &mut close_rx => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn fetch_status(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| MonitorError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(MonitorError::Network(format!("Status query failed: {}", status)));
    }

    response
        .text()
        .await
        .map_err(|e| MonitorError::Network(format!("Read error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interval_has_one_second_floor() {
        let connector = PollConnector::new(EndpointResolver::default(), 0, Duration::from_secs(1));
        assert_eq!(connector.interval(), Duration::from_secs(1));

        connector.refresh_interval_changed(15);
        assert_eq!(connector.interval(), Duration::from_secs(15));
    }
}
