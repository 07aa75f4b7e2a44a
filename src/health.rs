use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::metrics::UsageRecorder;
use crate::providers::{ProviderRegistry, FALLBACK_PROVIDER};

const PROBE_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Healthy,
    Warning,
    Critical,
    Down,
}

impl ProviderStatus {
    /// Sort rank: healthy providers are tried first.
    fn severity(&self) -> u8 {
        match self {
            ProviderStatus::Healthy => 0,
            ProviderStatus::Warning => 1,
            ProviderStatus::Critical => 2,
            ProviderStatus::Down => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthStatus {
    pub name: String,
    /// Priority rank; 1 is tried first. The fallback provider always holds
    /// the maximum tier.
    pub tier: usize,
    pub status: ProviderStatus,
    pub response_time_ms: f64,
    pub success_rate: f64,
    pub last_check: Option<DateTime<Utc>>,
    pub enabled: bool,
}

#[derive(Default)]
struct MonitorState {
    statuses: HashMap<String, ProviderHealthStatus>,
    probe_samples: HashMap<String, VecDeque<(bool, u64)>>,
    order: Vec<String>,
}

/// Periodically scores each provider and reorders the cascade's priority
/// list. Providers with a probe endpoint get a lightweight timed request;
/// the rest are scored from real usage aggregates.
pub struct ProviderHealthMonitor {
    registry: ProviderRegistry,
    usage: Arc<UsageRecorder>,
    config: HealthConfig,
    http: reqwest::Client,
    state: Mutex<MonitorState>,
}

impl ProviderHealthMonitor {
    pub fn new(
        registry: ProviderRegistry,
        usage: Arc<UsageRecorder>,
        config: HealthConfig,
        priority_override: &[String],
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.probe_timeout_ms))
            .build()
            .expect("health probe http client");

        let mut order: Vec<String> = if priority_override.is_empty() {
            registry.names().iter().map(|n| n.to_string()).collect()
        } else {
            let known: Vec<String> = registry.names().iter().map(|n| n.to_string()).collect();
            let mut picked: Vec<String> = priority_override
                .iter()
                .filter(|name| known.contains(name))
                .cloned()
                .collect();
            for name in known {
                if !picked.contains(&name) {
                    picked.push(name);
                }
            }
            picked
        };
        pin_fallback_last(&mut order);

        let statuses = order
            .iter()
            .enumerate()
            .map(|(index, name)| {
                (
                    name.clone(),
                    ProviderHealthStatus {
                        name: name.clone(),
                        tier: index + 1,
                        status: ProviderStatus::Healthy,
                        response_time_ms: 0.0,
                        success_rate: 1.0,
                        last_check: None,
                        enabled: true,
                    },
                )
            })
            .collect();

        Self {
            registry,
            usage,
            config,
            http,
            state: Mutex::new(MonitorState {
                statuses,
                probe_samples: HashMap::new(),
                order,
            }),
        }
    }

    /// Current cascade order, lowest tier first. Disabled providers are
    /// excluded entirely.
    pub fn tier_order(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter(|name| {
                state
                    .statuses
                    .get(*name)
                    .map(|s| s.enabled)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn statuses(&self) -> Vec<ProviderHealthStatus> {
        let state = self.state.lock();
        let mut all: Vec<_> = state.statuses.values().cloned().collect();
        all.sort_by_key(|s| s.tier);
        all
    }

    pub fn set_enabled(&self, provider: &str, enabled: bool) {
        let mut state = self.state.lock();
        if let Some(status) = state.statuses.get_mut(provider) {
            status.enabled = enabled;
        }
    }

    /// One monitoring cycle: probe or derive metrics for every provider,
    /// reclassify, and reorder tiers if the computed order changed.
    pub async fn check_round(&self) -> bool {
        let now = Utc::now();
        for provider in self.registry.iter() {
            let name = provider.name().to_string();
            let (success_rate, response_time) = match provider.probe_url() {
                Some(url) => {
                    let outcome = self.probe(&name, &url).await;
                    self.record_probe(&name, outcome);
                    self.probe_aggregates(&name)
                }
                None => {
                    let summary = self.usage.summary(&name);
                    if summary.samples == 0 {
                        // no signal yet; leave the provider where it is
                        (1.0, 0.0)
                    } else {
                        (summary.success_rate, summary.avg_latency_ms)
                    }
                }
            };

            let status = self.classify(success_rate, response_time);
            let mut state = self.state.lock();
            if let Some(entry) = state.statuses.get_mut(&name) {
                entry.status = status;
                entry.success_rate = success_rate;
                entry.response_time_ms = response_time;
                entry.last_check = Some(now);
            }
        }
        self.reorder_tiers()
    }

    async fn probe(&self, name: &str, url: &str) -> (bool, u64) {
        let started = Instant::now();
        // the probe client carries probe_timeout_ms, so a hung endpoint
        // surfaces here as a timeout error
        match self.http.get(url).send().await {
            Ok(response) => {
                // any HTTP answer proves the endpoint is up; 4xx from a probe
                // without credentials still counts
                let up = !response.status().is_server_error();
                if !up {
                    warn!(provider = name, status = %response.status(), "probe got server error");
                }
                (up, started.elapsed().as_millis() as u64)
            }
            Err(err) if err.is_timeout() => {
                warn!(provider = name, "probe timed out");
                (false, self.config.probe_timeout_ms)
            }
            Err(err) => {
                warn!(provider = name, ?err, "probe request failed");
                (false, started.elapsed().as_millis() as u64)
            }
        }
    }

    fn record_probe(&self, name: &str, outcome: (bool, u64)) {
        let mut state = self.state.lock();
        let window = state.probe_samples.entry(name.to_string()).or_default();
        window.push_back(outcome);
        while window.len() > PROBE_WINDOW {
            window.pop_front();
        }
    }

    fn probe_aggregates(&self, name: &str) -> (f64, f64) {
        let state = self.state.lock();
        let Some(window) = state.probe_samples.get(name) else {
            return (1.0, 0.0);
        };
        if window.is_empty() {
            return (1.0, 0.0);
        }
        let successes = window.iter().filter(|(ok, _)| *ok).count();
        let total_latency: u64 = window.iter().map(|(_, ms)| *ms).sum();
        (
            successes as f64 / window.len() as f64,
            total_latency as f64 / window.len() as f64,
        )
    }

    fn classify(&self, success_rate: f64, response_time_ms: f64) -> ProviderStatus {
        if success_rate == 0.0 {
            return ProviderStatus::Down;
        }
        if success_rate < self.config.critical_success_rate
            || response_time_ms > self.config.critical_response_time_ms
        {
            return ProviderStatus::Critical;
        }
        if success_rate < self.config.warning_success_rate
            || response_time_ms > self.config.warning_response_time_ms
        {
            return ProviderStatus::Warning;
        }
        ProviderStatus::Healthy
    }

    /// Recompute the cascade order. Returns true when tiers actually moved.
    fn reorder_tiers(&self) -> bool {
        let mut state = self.state.lock();

        let mut movable: Vec<ProviderHealthStatus> = state
            .order
            .iter()
            .filter(|name| name.as_str() != FALLBACK_PROVIDER)
            .filter_map(|name| state.statuses.get(name).cloned())
            .collect();

        movable.sort_by(|a, b| {
            b.enabled
                .cmp(&a.enabled)
                .then_with(|| a.status.severity().cmp(&b.status.severity()))
                .then_with(|| {
                    performance_score(b)
                        .partial_cmp(&performance_score(a))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        let mut computed: Vec<String> = movable.into_iter().map(|s| s.name).collect();
        if state.statuses.contains_key(FALLBACK_PROVIDER) {
            computed.push(FALLBACK_PROVIDER.to_string());
        }

        if computed == state.order {
            debug!("provider order unchanged");
            return false;
        }

        info!(?computed, previous = ?state.order, "provider tier order changed");
        state.order = computed;
        let order_snapshot = state.order.clone();
        for (index, name) in order_snapshot.iter().enumerate() {
            if let Some(status) = state.statuses.get_mut(name) {
                status.tier = index + 1;
            }
        }
        true
    }

    /// Background loop; exits when `shutdown` resolves.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reordered = self.check_round().await;
                    debug!(reordered, "health round complete");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health monitor shutting down");
                        return;
                    }
                }
            }
        }
    }
}

fn performance_score(status: &ProviderHealthStatus) -> f64 {
    status.success_rate * 100.0 - status.response_time_ms / 100.0
}

fn pin_fallback_last(order: &mut Vec<String>) {
    if let Some(index) = order.iter().position(|name| name == FALLBACK_PROVIDER) {
        let fallback = order.remove(index);
        order.push(fallback);
    }
}
