//! Per-provider plugin health.
//!
//! Each provider has its own probe. Probes run concurrently, either from a
//! periodic task per provider or on demand, and store their latest result.
//! Readers only ever see the stored result and never wait on a probe.

use crate::config::HealthConfig;
use crate::plugin::{new_uid, with_timeout, KmsService};
use futures::future::join_all;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("ok"),
            Self::Unhealthy(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Result of the most recent probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub checked_at: Instant,
    /// Key id the plugin reported, when it answered at all.
    pub key_id: Option<String>,
}

struct Probe {
    name: String,
    provider: String,
    service: Arc<dyn KmsService>,
    last: RwLock<Option<HealthRecord>>,
}

impl Probe {
    async fn run(&self, config: &HealthConfig) -> HealthRecord {
        let uid = new_uid();
        let result = with_timeout(config.timeout, "status", self.service.status(&uid)).await;
        let (status, key_id) = match result {
            Ok(reply) if reply.is_healthy() => (HealthStatus::Healthy, Some(reply.key_id)),
            Ok(reply) if !reply.is_compatible() => (
                HealthStatus::Unhealthy(format!(
                    "plugin reports incompatible api version `{}`",
                    reply.version
                )),
                Some(reply.key_id),
            ),
            Ok(reply) => (
                HealthStatus::Unhealthy(format!("plugin reports healthz `{}`", reply.healthz)),
                Some(reply.key_id),
            ),
            Err(err) => (HealthStatus::Unhealthy(err.to_string()), None),
        };

        let record = HealthRecord {
            status,
            checked_at: Instant::now(),
            key_id,
        };
        let previous = self.last.write().replace(record.clone());
        self.log_transition(previous.as_ref(), &record, &uid);
        record
    }

    fn log_transition(&self, previous: Option<&HealthRecord>, current: &HealthRecord, uid: &str) {
        let was_healthy = previous.map(|p| p.status.is_healthy());
        match (&current.status, was_healthy) {
            (HealthStatus::Healthy, Some(true)) => {}
            (HealthStatus::Healthy, _) => {
                info!(check = %self.name, provider = %self.provider, %uid, "kms plugin healthy");
            }
            (HealthStatus::Unhealthy(reason), Some(false)) => {
                debug!(check = %self.name, provider = %self.provider, %uid, %reason, "kms plugin still unhealthy");
            }
            (HealthStatus::Unhealthy(reason), _) => {
                warn!(check = %self.name, provider = %self.provider, %uid, %reason, "kms plugin unhealthy");
            }
        }

        if let (Some(before), Some(after)) = (
            previous.and_then(|p| p.key_id.as_deref()),
            current.key_id.as_deref(),
        ) {
            if before != after {
                info!(provider = %self.provider, from = %before, to = %after, "kms key id changed");
            }
        }
    }
}

/// Named health signals, one per provider, in configuration order.
pub struct HealthAggregator {
    probes: Vec<Arc<Probe>>,
    config: HealthConfig,
}

impl HealthAggregator {
    /// `targets` yields `(check name, provider name, service)`.
    pub fn new<I>(targets: I, config: HealthConfig) -> Self
    where
        I: IntoIterator<Item = (String, String, Arc<dyn KmsService>)>,
    {
        let probes = targets
            .into_iter()
            .map(|(name, provider, service)| {
                Arc::new(Probe {
                    name,
                    provider,
                    service,
                    last: RwLock::new(None),
                })
            })
            .collect();
        Self { probes, config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.probes.iter().map(|p| p.name.as_str())
    }

    /// Latest stored result; `None` until the first probe completes.
    pub fn status(&self, name: &str) -> Option<HealthRecord> {
        self.probe(name).and_then(|p| p.last.read().clone())
    }

    /// Probe one provider now and store the result.
    pub async fn check(&self, name: &str) -> Option<HealthRecord> {
        let probe = self.probe(name)?;
        Some(probe.run(&self.config).await)
    }

    /// Probe every provider concurrently.
    pub async fn check_all(&self) -> AggregateHealth {
        let config = self.config;
        join_all(self.probes.iter().map(|p| p.run(&config))).await;
        self.aggregate()
    }

    /// Stored results for every provider. Never-probed providers count as unhealthy.
    pub fn aggregate(&self) -> AggregateHealth {
        let checks = self
            .probes
            .iter()
            .map(|p| NamedHealth {
                name: p.name.clone(),
                provider: p.provider.clone(),
                status: p
                    .last
                    .read()
                    .as_ref()
                    .map(|r| r.status.clone())
                    .unwrap_or_else(|| HealthStatus::Unhealthy("not yet checked".into())),
            })
            .collect();
        AggregateHealth { checks }
    }

    /// Start one periodic probe task per provider; they stop when the guard drops.
    pub fn spawn(&self) -> HealthTasks {
        let handles = self
            .probes
            .iter()
            .map(|probe| {
                let probe = probe.clone();
                let config = self.config;
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(config.interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        probe.run(&config).await;
                    }
                })
            })
            .collect();
        HealthTasks { handles }
    }

    fn probe(&self, name: &str) -> Option<&Arc<Probe>> {
        self.probes.iter().find(|p| p.name == name)
    }
}

/// Running probe tasks.
pub struct HealthTasks {
    handles: Vec<JoinHandle<()>>,
}

impl HealthTasks {
    /// Stop probing; same as dropping the guard.
    pub fn shutdown(self) {}
}

impl Drop for HealthTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedHealth {
    pub name: String,
    pub provider: String,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateHealth {
    pub checks: Vec<NamedHealth>,
}

impl AggregateHealth {
    pub fn is_healthy(&self) -> bool {
        self.checks.iter().all(|c| c.status.is_healthy())
    }

    pub fn get(&self, name: &str) -> Option<&HealthStatus> {
        self.checks.iter().find(|c| c.name == name).map(|c| &c.status)
    }
}

impl fmt::Display for AggregateHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            let mark = if check.status.is_healthy() { '+' } else { '-' };
            writeln!(f, "[{mark}]{} {}", check.name, check.status)?;
        }
        if self.is_healthy() {
            write!(f, "healthz check passed")
        } else {
            write!(f, "healthz check failed")
        }
    }
}
