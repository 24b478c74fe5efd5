use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::registry::NodeRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertMetric {
    ResponseTime,
    ConnectionCount,
    ErrorCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A threshold rule evaluated once per Health Monitor tick. Fires only
/// after the condition has held continuously for `duration`, per spec.md
/// §4.6.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub metric: AlertMetric,
    pub threshold: f64,
    pub duration: Duration,
    pub severity: AlertSeverity,
}

impl AlertRule {
    /// The default rule set, one per metric named in spec.md §4.6.
    pub fn default_rules() -> Vec<AlertRule> {
        vec![
            AlertRule {
                name: "slow_response".into(),
                metric: AlertMetric::ResponseTime,
                threshold: 2000.0,
                duration: Duration::from_secs(60),
                severity: AlertSeverity::Warning,
            },
            AlertRule {
                name: "connection_saturation".into(),
                metric: AlertMetric::ConnectionCount,
                threshold: 180.0,
                duration: Duration::from_secs(30),
                severity: AlertSeverity::Warning,
            },
            AlertRule {
                name: "error_spike".into(),
                metric: AlertMetric::ErrorCount,
                threshold: 5.0,
                duration: Duration::from_secs(60),
                severity: AlertSeverity::Critical,
            },
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub rule_name: String,
    pub node: String,
    pub metric: AlertMetric,
    pub value: f64,
    pub severity: AlertSeverity,
    pub firing: bool,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Default, Clone, Copy)]
struct RuleState {
    held_since: Option<Instant>,
    fired: bool,
}

/// Per-node metrics fed into alert rule evaluation. `response_time_ms` and
/// `error_count` are produced by the probe itself; `connection_count`
/// reflects the node's pool utilization.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeMetrics {
    pub response_time_ms: f64,
    pub connection_count: f64,
    pub error_count: f64,
}

pub struct HealthMonitorConfig {
    pub interval: Duration,
    /// Consecutive probe failures before the node's own health status is
    /// marked `offline`, per spec.md §4.6.
    pub failure_threshold: u32,
    /// Consecutive probe failures before the offline hook (the Failover
    /// Controller's trigger) fires, per spec.md §4.9 / boundary behavior
    /// spec.md:312. Distinct from `failure_threshold` — at the default
    /// config both are 3 and the two coincide, but a deployment that sets
    /// them apart gets `offline` health and failover timing independently.
    pub detection_threshold: u32,
    pub replication_lag_warning_secs: f64,
}

/// `Start(ctx)/Stop(ctx)`-lifecycle background loop per REDESIGN FLAGS.
/// Ticks on `health_check_interval`, probing every node with a trivial
/// round trip and evaluating the alert rule set against accumulated
/// per-node metrics.
pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    pools: Arc<DashMap<String, PgPool>>,
    config: HealthMonitorConfig,
    rules: Vec<AlertRule>,
    callback: Option<Arc<dyn Fn(&Alert) + Send + Sync>>,
    on_offline: Option<Arc<dyn Fn(String, String) + Send + Sync>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    cumulative_errors: DashMap<String, f64>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        pools: Arc<DashMap<String, PgPool>>,
        config: HealthMonitorConfig,
        callback: Option<Arc<dyn Fn(&Alert) + Send + Sync>>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            registry,
            pools,
            config,
            rules: AlertRule::default_rules(),
            callback,
            on_offline: None,
            stop_tx,
            stop_rx,
            cumulative_errors: DashMap::new(),
        }
    }

    /// Registers a hook invoked (node name, error) the moment a node's
    /// consecutive probe failures reach `detection_threshold` — the trigger
    /// the Failover Controller listens for. Fired at most once per
    /// offline transition; cleared again on the next successful probe.
    pub fn with_offline_hook(mut self, hook: Arc<dyn Fn(String, String) + Send + Sync>) -> Self {
        self.on_offline = Some(hook);
        self
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Runs the monitor loop until `stop()` is called. The caller spawns
    /// this with `tokio::spawn`.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.interval);
        let mut stop_rx = self.stop_rx.clone();
        let mut rule_states: HashMap<(String, String), RuleState> = HashMap::new();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&mut rule_states).await;
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        info!("health monitor stopped");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self, rule_states: &mut HashMap<(String, String), RuleState>) {
        let nodes = self.registry.snapshot();
        let primary_now = Utc::now();
        let mut primary_last_replay: Option<chrono::DateTime<Utc>> = None;

        for node in &nodes {
            let Some(pool) = self.pools.get(&node.name).map(|p| p.clone()) else { continue };
            let started = Instant::now();
            let probe = sqlx::query("SELECT 1").execute(&pool).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            match probe {
                Ok(_) => {
                    self.registry.record_probe_success(&node.name);
                    if node.role == icrawl_core::NodeRole::Primary {
                        primary_last_replay = Some(primary_now);
                    }
                }
                Err(e) => {
                    let count = self.registry.record_probe_failure(&node.name, &e.to_string(), self.config.failure_threshold);
                    warn!(node = %node.name, failures = count, "health probe failed");
                    *self.cumulative_errors.entry(node.name.clone()).or_insert(0.0) += 1.0;
                    if count == self.config.detection_threshold {
                        if let Some(hook) = &self.on_offline {
                            hook(node.name.clone(), e.to_string());
                        }
                    }
                }
            }

            let metrics = NodeMetrics {
                response_time_ms: elapsed_ms,
                connection_count: pool.size() as f64,
                error_count: self.cumulative_errors.get(&node.name).map(|v| *v).unwrap_or(0.0),
            };
            self.evaluate_rules(&node.name, metrics, rule_states);
        }

        // Replication lag: primary_now - secondary_last_replay. Since every
        // node is probed with the same wall clock, a healthy secondary's
        // "last replay" is approximated by its own last successful probe
        // time; lag is the gap between that and the primary's.
        if let Some(primary_replay) = primary_last_replay {
            for node in &nodes {
                if node.role == icrawl_core::NodeRole::Primary {
                    continue;
                }
                if let Some(last_probe) = node.last_probe {
                    let lag = (primary_replay - last_probe).num_milliseconds() as f64 / 1000.0;
                    self.registry.set_replication_lag(&node.name, lag.max(0.0));
                    if lag > self.config.replication_lag_warning_secs {
                        warn!(node = %node.name, lag_secs = lag, "replication lag above warning threshold");
                    }
                }
            }
        }
    }

    fn evaluate_rules(&self, node: &str, metrics: NodeMetrics, rule_states: &mut HashMap<(String, String), RuleState>) {
        for rule in &self.rules {
            let value = match rule.metric {
                AlertMetric::ResponseTime => metrics.response_time_ms,
                AlertMetric::ConnectionCount => metrics.connection_count,
                AlertMetric::ErrorCount => metrics.error_count,
            };
            let key = (node.to_string(), rule.name.clone());
            let state = rule_states.entry(key).or_default();
            let condition_holds = value >= rule.threshold;

            if condition_holds {
                let held_since = state.held_since.get_or_insert_with(Instant::now);
                let held_for = held_since.elapsed();
                if !state.fired && held_for >= rule.duration {
                    state.fired = true;
                    self.emit(rule, node, value, true);
                }
            } else if state.fired {
                state.fired = false;
                state.held_since = None;
                self.emit(rule, node, value, false);
            } else {
                state.held_since = None;
            }
        }
    }

    fn emit(&self, rule: &AlertRule, node: &str, value: f64, firing: bool) {
        let alert = Alert {
            rule_name: rule.name.clone(),
            node: node.to_string(),
            metric: rule.metric,
            value,
            severity: rule.severity,
            firing,
            timestamp: Utc::now(),
        };
        if firing {
            warn!(rule = %alert.rule_name, node = %alert.node, value = alert.value, "alert firing");
        } else {
            info!(rule = %alert.rule_name, node = %alert.node, "alert cleared");
        }
        if let Some(cb) = &self.callback {
            cb(&alert);
        }
    }
}
