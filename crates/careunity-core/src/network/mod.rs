//! Network status monitor
//!
//! The device counts as online only while the platform reports a link AND
//! the last reachability probe against the API origin succeeded. State is
//! published on a `watch` channel so subscribers see every transition.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Connectivity as seen by the sync core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Online,
    Offline,
}

impl NetworkState {
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct Signals {
    link_up: bool,
    reachable: bool,
}

impl Signals {
    const fn state(self) -> NetworkState {
        if self.link_up && self.reachable {
            NetworkState::Online
        } else {
            NetworkState::Offline
        }
    }
}

/// Shared connectivity tracker. Clones observe and feed the same state.
#[derive(Clone)]
pub struct NetworkMonitor {
    signals: Arc<Mutex<Signals>>,
    sender: Arc<watch::Sender<NetworkState>>,
}

impl NetworkMonitor {
    /// Start with both signals set to `online`.
    pub fn new(online: bool) -> Self {
        let signals = Signals {
            link_up: online,
            reachable: online,
        };
        let (sender, _) = watch::channel(signals.state());
        Self {
            signals: Arc::new(Mutex::new(signals)),
            sender: Arc::new(sender),
        }
    }

    pub fn current(&self) -> NetworkState {
        *self.sender.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Receiver of connectivity transitions.
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.sender.subscribe()
    }

    /// Feed the platform link-layer signal.
    pub fn set_link_up(&self, link_up: bool) {
        self.update(|signals| signals.link_up = link_up);
    }

    /// Feed the outcome of a reachability probe.
    pub fn record_probe(&self, reachable: bool) {
        self.update(|signals| signals.reachable = reachable);
    }

    fn update(&self, change: impl FnOnce(&mut Signals)) {
        let state = {
            let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
            change(&mut signals);
            signals.state()
        };

        let changed = self.sender.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::info!("Network is now {state}");
        }
    }
}

/// Reachability check against the API origin
pub trait Probe: Send + Sync {
    fn probe(&self) -> impl Future<Output = bool> + Send;
}

/// `HEAD <api>/health` with a bounded timeout.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(api_base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(format!("Failed to construct HTTP client: {error}")))?;
        Ok(Self {
            url: health_url(api_base_url),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Probe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.head(&self.url).send().await {
            // Any HTTP answer proves a route to the origin.
            Ok(response) => !response.status().is_server_error(),
            Err(error) => {
                tracing::debug!("Reachability probe to {} failed: {error}", self.url);
                false
            }
        }
    }
}

fn health_url(api_base_url: &str) -> String {
    format!("{}/health", api_base_url.trim().trim_end_matches('/'))
}

/// Probe on every tick until `shutdown` flips to `true` or its sender drops.
pub async fn run_probe_loop<P: Probe>(
    monitor: NetworkMonitor,
    probe: P,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reachable = probe.probe().await;
                monitor.record_probe(reachable);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Reachability probe loop stopped");
}
