//! Range Monitor - target-range watcher with corrective actions
//!
//! Tracks per-component metric snapshots against configured
//! {min, ideal, max} bands:
//! - Signals record measurements as they arrive; high-intensity hunger
//!   or pain regulates immediately
//! - `check_balance` sweeps every tracked component periodically and
//!   regulates anything past a 20% deviation, whether or not a signal
//!   ever crossed the high-intensity shortcut
//! - Corrective broadcasts are fire-and-forget; regulation never fails

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vagus_core::{intensity, Component, ComponentError, Dispatcher, Signal, SignalPayload, Vital};

/// Sweep regulation threshold: normalized deviation past this corrects.
pub const SWEEP_DEVIATION: f64 = 0.2;

/// A {min, ideal, max} band a measurement is compared against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TargetRange {
    pub min: f64,
    pub ideal: f64,
    pub max: f64,
}

/// Where a value sits relative to its target range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBand {
    Low,
    High,
    /// Within ±10% of ideal.
    Ideal,
    Acceptable,
}

/// Classification plus normalized deviation magnitude (zero unless
/// low/high).
#[derive(Debug, Clone, Copy)]
pub struct RangeCheck {
    pub band: RangeBand,
    pub deviation: f64,
}

/// Classify `value` against `range`.
pub fn check_range(value: f64, range: &TargetRange) -> RangeCheck {
    if value < range.min {
        RangeCheck {
            band: RangeBand::Low,
            deviation: (range.min - value) / range.min,
        }
    } else if value > range.max {
        RangeCheck {
            band: RangeBand::High,
            deviation: (value - range.max) / range.max,
        }
    } else if (value - range.ideal).abs() <= 0.1 * range.ideal.abs() {
        RangeCheck {
            band: RangeBand::Ideal,
            deviation: 0.0,
        }
    } else {
        RangeCheck {
            band: RangeBand::Acceptable,
            deviation: 0.0,
        }
    }
}

/// One metric snapshot for a component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    pub metrics: HashMap<String, f64>,
    pub recorded_at: DateTime<Utc>,
}

/// What kind of imbalance a correction addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deviation {
    Hunger,
    Pain,
    Backlog,
}

/// An active corrective action.
#[derive(Debug, Clone)]
pub struct Correction {
    pub component: String,
    pub action: String,
    pub started_at: DateTime<Utc>,
}

/// Snapshot exposed through vitals
#[derive(Debug, Clone, serde::Serialize)]
pub struct RangeMonitorSnapshot {
    pub tracked: usize,
    pub corrections: usize,
    pub history: usize,
}

/// Target-range watcher and corrective-action engine
pub struct RangeMonitor {
    vital: Vital,
    latest: DashMap<String, Measurement>,
    history: Mutex<VecDeque<(String, Measurement)>>,
    targets: RwLock<HashMap<String, HashMap<String, TargetRange>>>,
    corrections: Mutex<VecDeque<Correction>>,
    max_history: usize,
}

impl RangeMonitor {
    pub fn new(hub: Arc<Dispatcher>) -> Self {
        Self {
            vital: Vital::new("range-monitor", hub),
            latest: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            targets: RwLock::new(HashMap::new()),
            corrections: Mutex::new(VecDeque::new()),
            max_history: 1000,
        }
    }

    /// Configure a target range for one metric of one component.
    pub fn set_target(&self, component: &str, metric: &str, range: TargetRange) {
        self.targets
            .write()
            .entry(component.to_string())
            .or_default()
            .insert(metric.to_string(), range);
    }

    /// Overwrite the latest snapshot for `component` and append it to
    /// the bounded history.
    pub fn record_measurement(&self, component: &str, metrics: HashMap<String, f64>) {
        let measurement = Measurement {
            metrics,
            recorded_at: Utc::now(),
        };

        {
            let mut history = self.history.lock();
            if history.len() >= self.max_history {
                history.pop_front();
            }
            history.push_back((component.to_string(), measurement.clone()));
        }
        self.latest.insert(component.to_string(), measurement);
    }

    pub fn latest_measurement(&self, component: &str) -> Option<Measurement> {
        self.latest.get(component).map(|m| m.clone())
    }

    /// Consult the action table and broadcast the corrective signal.
    /// Never fails: a dropped broadcast is logged and forgotten.
    pub async fn regulate(&self, component: &str, deviation: Deviation, level: f64) {
        let name = self.vital.name().to_string();
        let (action, signal) = match deviation {
            Deviation::Hunger if component.contains("inventory") => (
                "check reorders",
                Some(Signal::hunger(
                    "inventory",
                    Some("check reorders"),
                    level.max(intensity::MEDIUM),
                    &name,
                )),
            ),
            Deviation::Pain if level >= intensity::URGENT => (
                "reduce activity",
                Some(Signal::pain(
                    &name,
                    &format!("{component} overloaded, reduce activity"),
                    intensity::HIGH,
                    &name,
                )),
            ),
            Deviation::Backlog => (
                "increase processing rate",
                Some(Signal::hunger(
                    "throughput",
                    Some("increase processing rate"),
                    intensity::HIGH,
                    &name,
                )),
            ),
            _ => {
                debug!(component, ?deviation, level, "no corrective action configured");
                ("", None)
            }
        };

        let Some(signal) = signal else { return };

        info!(component, ?deviation, action, "regulating");
        if let Err(e) = self.vital.hub().broadcast(signal).await {
            warn!(component, error = %e, "corrective broadcast dropped");
        }

        let mut corrections = self.corrections.lock();
        if corrections.len() >= 100 {
            corrections.pop_front();
        }
        corrections.push_back(Correction {
            component: component.to_string(),
            action: action.to_string(),
            started_at: Utc::now(),
        });
    }

    /// Periodic sweep: evaluate every tracked metric of every component
    /// with configured targets and regulate anything past the deviation
    /// threshold. Returns the number of corrections triggered.
    pub async fn check_balance(&self) -> usize {
        let targets = self.targets.read().clone();
        let mut corrected = 0;

        for (component, metric_targets) in targets {
            let Some(measurement) = self.latest_measurement(&component) else {
                continue;
            };

            for (metric, range) in metric_targets {
                let Some(&value) = measurement.metrics.get(&metric) else {
                    continue;
                };

                let check = check_range(value, &range);
                if check.deviation <= SWEEP_DEVIATION {
                    continue;
                }

                let deviation = match check.band {
                    RangeBand::High if metric == "backlog" => Deviation::Backlog,
                    RangeBand::High => Deviation::Pain,
                    RangeBand::Low => Deviation::Hunger,
                    _ => continue,
                };

                self.regulate(&component, deviation, check.deviation.min(1.0))
                    .await;
                corrected += 1;
            }
        }

        corrected
    }

    pub fn active_corrections(&self) -> Vec<Correction> {
        self.corrections.lock().iter().cloned().collect()
    }

    pub fn snapshot(&self) -> RangeMonitorSnapshot {
        RangeMonitorSnapshot {
            tracked: self.latest.len(),
            corrections: self.corrections.lock().len(),
            history: self.history.lock().len(),
        }
    }
}

#[async_trait]
impl Component for RangeMonitor {
    fn name(&self) -> &str {
        self.vital.name()
    }

    async fn feel(&self, signal: &Signal) -> Result<Option<String>, ComponentError> {
        match &signal.payload {
            SignalPayload::Heartbeat { health, .. } => {
                self.record_measurement(
                    "organism",
                    HashMap::from([("health".to_string(), *health)]),
                );
                Ok(Some("health recorded".to_string()))
            }
            SignalPayload::Hunger { .. } => {
                self.record_measurement(
                    &signal.origin,
                    HashMap::from([("hunger".to_string(), signal.intensity)]),
                );
                if signal.intensity >= intensity::HIGH {
                    self.regulate(&signal.origin, Deviation::Hunger, signal.intensity)
                        .await;
                }
                Ok(Some("deviation recorded".to_string()))
            }
            SignalPayload::Pain { .. } => {
                self.record_measurement(
                    &signal.origin,
                    HashMap::from([("pain".to_string(), signal.intensity)]),
                );
                if signal.intensity >= intensity::HIGH {
                    self.regulate(&signal.origin, Deviation::Pain, signal.intensity)
                        .await;
                }
                Ok(Some("deviation recorded".to_string()))
            }
            _ => Ok(None),
        }
    }

    async fn pulse(&self) -> f64 {
        let pressure = self.corrections.lock().len() as f64;
        (100.0 - 5.0 * pressure).clamp(0.0, 100.0)
    }
}
