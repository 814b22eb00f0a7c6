//! Coordinator - the root of the organism
//!
//! Owns the dispatcher and the three controllers, keeps the registry of
//! health-voting components and runs the periodic heartbeat:
//! - `awaken` wires everything onto the bus and starts the loops
//! - `heartbeat` polls every component's pulse in isolation, blends the
//!   average into overall health and broadcasts the result
//! - urgent pain or critical signals stress the organism; a healthy
//!   heartbeat recovers it
//! - `ingest` gates incoming domain data through the anomaly engine;
//!   quarantined data is rejected, never silently processed

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vagus_core::{
    intensity, Component, ComponentError, Dispatcher, DispatcherConfig, DispatcherStats, Signal,
    SignalPayload,
};
use vagus_reflex::{
    AnomalyEngine, AnomalySnapshot, RangeMonitor, RangeMonitorSnapshot, RateConfig,
    RateController, RateSnapshot, ThreatReport,
};

/// Health below this while Alive starts Healing.
const HEALING_THRESHOLD: f64 = 30.0;

/// Health at or above this while Healing returns to Alive.
const RECOVERED_THRESHOLD: f64 = 50.0;

/// Health at or above this while Stressed returns to Alive.
const CALM_THRESHOLD: f64 = 70.0;

/// Lifecycle states of the organism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifeState {
    Dormant,
    Awakening,
    Alive,
    Stressed,
    Healing,
    Dying,
    Dead,
}

impl LifeState {
    pub fn label(&self) -> &'static str {
        match self {
            LifeState::Dormant => "dormant",
            LifeState::Awakening => "awakening",
            LifeState::Alive => "alive",
            LifeState::Stressed => "stressed",
            LifeState::Healing => "healing",
            LifeState::Dying => "dying",
            LifeState::Dead => "dead",
        }
    }

    fn is_shutdown(&self) -> bool {
        matches!(self, LifeState::Dying | LifeState::Dead)
    }
}

/// Events observable by embedding code.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Heartbeat { health: f64 },
    StateChange { from: LifeState, to: LifeState },
    HealthChange { from: f64, to: f64 },
    Alert { signal: Signal },
}

/// Event classes for filtered callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Heartbeat,
    StateChange,
    HealthChange,
    Alert,
}

impl CoordinatorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CoordinatorEvent::Heartbeat { .. } => EventKind::Heartbeat,
            CoordinatorEvent::StateChange { .. } => EventKind::StateChange,
            CoordinatorEvent::HealthChange { .. } => EventKind::HealthChange,
            CoordinatorEvent::Alert { .. } => EventKind::Alert,
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Heartbeat cadence while calm.
    pub heartbeat_interval: Duration,
    /// Faster cadence while Stressed.
    pub stressed_heartbeat_interval: Duration,
    /// Balance-sweep cadence for the range monitor.
    pub sweep_interval: Duration,
    /// Upper bound on a single pulse poll.
    pub pulse_timeout: Duration,
    pub dispatcher: DispatcherConfig,
    pub rate: RateConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            stressed_heartbeat_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
            pulse_timeout: Duration::from_secs(2),
            dispatcher: DispatcherConfig::default(),
            rate: RateConfig::default(),
        }
    }
}

/// Outcome of gating domain data through the anomaly engine.
#[derive(Debug)]
pub struct IngestReport {
    pub accepted: bool,
    pub quarantined: bool,
    pub healed_count: usize,
    pub threats: Vec<ThreatReport>,
    /// The (possibly healed) entity; `None` when rejected.
    pub data: Option<Value>,
}

/// On-demand aggregate snapshot; assembled fresh, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Vitals {
    pub state: LifeState,
    pub health: f64,
    pub uptime_secs: i64,
    pub dispatcher: DispatcherStats,
    pub rate: RateSnapshot,
    pub range: RangeMonitorSnapshot,
    pub anomaly: AnomalySnapshot,
    pub captured_at: DateTime<Utc>,
}

/// The root coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    dispatcher: Arc<Dispatcher>,
    rate: Arc<RateController>,
    range: Arc<RangeMonitor>,
    anomaly: Arc<AnomalyEngine>,
    /// Components whose pulses aggregate into overall health. The
    /// controllers sit on the bus but do not vote here.
    registry: RwLock<Vec<(String, Arc<dyn Component>)>>,
    state: Mutex<LifeState>,
    health: Mutex<f64>,
    started_at: DateTime<Utc>,
    events: broadcast::Sender<CoordinatorEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    weak: Weak<Coordinator>,
}

impl Coordinator {
    /// Build the four subsystems once and wire them together. No global
    /// state: everything hangs off the returned handle.
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher::new(config.dispatcher.clone()));
        let rate = RateController::new(dispatcher.clone(), config.rate.clone());
        let range = Arc::new(RangeMonitor::new(dispatcher.clone()));
        let anomaly = Arc::new(AnomalyEngine::new(dispatcher.clone()));
        let (events, _) = broadcast::channel(256);

        Arc::new_cyclic(|weak| Self {
            config,
            dispatcher,
            rate,
            range,
            anomaly,
            registry: RwLock::new(Vec::new()),
            state: Mutex::new(LifeState::Dormant),
            health: Mutex::new(100.0),
            started_at: Utc::now(),
            events,
            tasks: Mutex::new(Vec::new()),
            weak: weak.clone(),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn rate(&self) -> &Arc<RateController> {
        &self.rate
    }

    pub fn range(&self) -> &Arc<RangeMonitor> {
        &self.range
    }

    pub fn anomaly(&self) -> &Arc<AnomalyEngine> {
        &self.anomaly
    }

    pub fn state(&self) -> LifeState {
        *self.state.lock()
    }

    pub fn health(&self) -> f64 {
        *self.health.lock()
    }

    /// Wire the controllers onto the bus, start the heartbeat and sweep
    /// loops, run one immediate heartbeat.
    pub async fn awaken(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.state().is_shutdown() {
            anyhow::bail!("cannot awaken a {} coordinator", self.state().label());
        }
        self.set_state(LifeState::Awakening);

        self.dispatcher
            .register("rate-controller", self.rate.clone());
        self.dispatcher
            .register("range-monitor", self.range.clone());
        self.dispatcher
            .register("anomaly-engine", self.anomaly.clone());
        self.dispatcher
            .register("coordinator", self.clone() as Arc<dyn Component>);

        let events = self.events.clone();
        self.dispatcher.set_escalation_hook(Arc::new(move |signal| {
            warn!(signal = %signal.id, origin = %signal.origin, "escalation");
            let _ = events.send(CoordinatorEvent::Alert {
                signal: signal.clone(),
            });
        }));

        // heartbeat loop; cadence tightens while Stressed
        let beat = self.weak.clone();
        let heartbeat_task = tokio::spawn(async move {
            loop {
                let Some(this) = beat.upgrade() else { break };
                let interval = if this.state() == LifeState::Stressed {
                    this.config.stressed_heartbeat_interval
                } else {
                    this.config.heartbeat_interval
                };
                drop(this);
                tokio::time::sleep(interval).await;

                let Some(this) = beat.upgrade() else { break };
                if this.state().is_shutdown() {
                    break;
                }
                this.heartbeat().await;
            }
        });

        // balance-sweep loop
        let sweep = self.weak.clone();
        let sweep_interval = self.config.sweep_interval;
        let sweep_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_interval).await;
                let Some(this) = sweep.upgrade() else { break };
                if this.state().is_shutdown() {
                    break;
                }
                let corrected = this.range.check_balance().await;
                if corrected > 0 {
                    debug!(corrected, "balance sweep regulated");
                }
            }
        });

        self.tasks.lock().extend([heartbeat_task, sweep_task]);

        self.heartbeat().await;
        self.set_state(LifeState::Alive);
        info!("coordinator awake");
        Ok(())
    }

    /// Register a health-voting component on the bus and in the
    /// registry. Re-registering a name swaps the entry in place.
    pub fn register(&self, name: &str, component: Arc<dyn Component>) {
        self.dispatcher.register(name, component.clone());
        let mut registry = self.registry.write();
        if let Some(slot) = registry.iter_mut().find(|(n, _)| n == name) {
            slot.1 = component;
        } else {
            registry.push((name.to_string(), component));
        }
    }

    pub fn unregister(&self, name: &str) {
        self.dispatcher.unregister(name);
        self.registry.write().retain(|(n, _)| n != name);
    }

    /// Poll every registered component's pulse in isolation and blend
    /// the average into overall health: 30% previous, 70% current.
    pub async fn heartbeat(&self) -> f64 {
        let components = self.registry.read().clone();
        let prev = self.health();

        let avg = if components.is_empty() {
            prev
        } else {
            let timeout = self.config.pulse_timeout;
            let polls = components.into_iter().map(|(name, component)| {
                // spawned so a panicking or hanging pulse scores 0
                // instead of sinking the heartbeat
                let poll = tokio::spawn(async move {
                    tokio::time::timeout(timeout, component.pulse()).await
                });
                async move {
                    match poll.await {
                        Ok(Ok(health)) => health.clamp(0.0, 100.0),
                        Ok(Err(_)) => {
                            warn!(component = %name, "pulse timed out");
                            0.0
                        }
                        Err(_) => {
                            warn!(component = %name, "pulse failed");
                            0.0
                        }
                    }
                }
            });
            let pulses = join_all(polls).await;
            pulses.iter().sum::<f64>() / pulses.len() as f64
        };

        let health = (prev * 0.3 + avg * 0.7).round();
        *self.health.lock() = health;

        if (health - prev).abs() > f64::EPSILON {
            let _ = self.events.send(CoordinatorEvent::HealthChange {
                from: prev,
                to: health,
            });
        }

        match self.state() {
            LifeState::Alive if health < HEALING_THRESHOLD => {
                self.set_state(LifeState::Healing);
            }
            LifeState::Healing if health >= RECOVERED_THRESHOLD => {
                self.set_state(LifeState::Alive);
            }
            LifeState::Stressed if health >= CALM_THRESHOLD => {
                self.set_state(LifeState::Alive);
            }
            _ => {}
        }

        let beat = Signal::heartbeat(health, self.state().label(), "coordinator");
        if let Err(e) = self.dispatcher.broadcast(beat).await {
            warn!(error = %e, "heartbeat broadcast dropped");
        }
        let _ = self.events.send(CoordinatorEvent::Heartbeat { health });

        health
    }

    fn set_state(&self, to: LifeState) {
        let from = {
            let mut state = self.state.lock();
            if *state == to {
                return;
            }
            let from = *state;
            *state = to;
            from
        };
        info!(from = from.label(), to = to.label(), "state change");
        let _ = self.events.send(CoordinatorEvent::StateChange { from, to });
    }

    /// Raw event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Callback-shaped listener for one event class.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> JoinHandle<()>
    where
        F: Fn(&CoordinatorEvent) + Send + 'static,
    {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind() == kind => callback(&event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event listener lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Gate domain data through scan + heal before accepting it.
    /// Quarantined data is rejected, never silently processed.
    pub async fn ingest(&self, mut data: Value, kind: &str) -> IngestReport {
        let report = self.anomaly.heal(&mut data, kind).await;

        if report.quarantined {
            warn!(kind, "ingest rejected, entity quarantined");
            return IngestReport {
                accepted: false,
                quarantined: true,
                healed_count: report.healed_count,
                threats: report.threats,
                data: None,
            };
        }

        IngestReport {
            accepted: true,
            quarantined: false,
            healed_count: report.healed_count,
            threats: report.threats,
            data: Some(data),
        }
    }

    /// Stop the loops, drain in-flight work without admitting more,
    /// disconnect everything.
    pub async fn shutdown(&self) {
        if self.state().is_shutdown() {
            return;
        }
        self.set_state(LifeState::Dying);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        self.rate.close();
        self.rate.wait_idle().await;

        self.dispatcher.unregister_all();
        self.registry.write().clear();

        self.set_state(LifeState::Dead);
        info!("coordinator shut down");
    }

    /// Assemble the on-demand vitals snapshot.
    pub fn vitals(&self) -> Vitals {
        Vitals {
            state: self.state(),
            health: self.health(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            dispatcher: self.dispatcher.stats(),
            rate: self.rate.snapshot(),
            range: self.range.snapshot(),
            anomaly: self.anomaly.snapshot(),
            captured_at: Utc::now(),
        }
    }
}

#[async_trait]
impl Component for Coordinator {
    fn name(&self) -> &str {
        "coordinator"
    }

    async fn feel(&self, signal: &Signal) -> Result<Option<String>, ComponentError> {
        match &signal.payload {
            SignalPayload::Pain { source, .. } if signal.intensity >= intensity::URGENT => {
                self.set_state(LifeState::Stressed);
                Ok(Some(format!("stressed by {source}")))
            }
            SignalPayload::Critical { reason } => {
                self.set_state(LifeState::Stressed);
                Ok(Some(format!("stressed: {reason}")))
            }
            SignalPayload::Heartbeat { .. } => Ok(Some("beat".to_string())),
            _ => Ok(None),
        }
    }

    async fn pulse(&self) -> f64 {
        self.health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vagus_core::SignalKind;
    use vagus_reflex::{HealOutcome, Rule, Severity};

    /// Component with a fixed pulse.
    struct Steady {
        name: String,
        health: f64,
    }

    #[async_trait]
    impl Component for Steady {
        fn name(&self) -> &str {
            &self.name
        }

        async fn feel(&self, _signal: &Signal) -> Result<Option<String>, ComponentError> {
            Ok(None)
        }

        async fn pulse(&self) -> f64 {
            self.health
        }
    }

    fn steady(name: &str, health: f64) -> Arc<Steady> {
        Arc::new(Steady {
            name: name.to_string(),
            health,
        })
    }

    #[tokio::test]
    async fn test_heartbeat_blends_previous_and_average() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.register("oven", steady("oven", 80.0));
        coordinator.register("larder", steady("larder", 60.0));

        // previous health 100, component average 70
        let health = coordinator.heartbeat().await;
        assert_eq!(health, 79.0);
    }

    #[tokio::test]
    async fn test_heartbeat_without_components_carries_forward() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let health = coordinator.heartbeat().await;
        assert_eq!(health, 100.0);
    }

    #[tokio::test]
    async fn test_awaken_wires_and_beats() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.awaken().await.unwrap();

        assert_eq!(coordinator.state(), LifeState::Alive);
        let registered = coordinator.dispatcher().registered();
        assert!(registered.contains(&"rate-controller".to_string()));
        assert!(registered.contains(&"range-monitor".to_string()));
        assert!(registered.contains(&"anomaly-engine".to_string()));
        assert!(registered.contains(&"coordinator".to_string()));

        // the immediate heartbeat reached the bus
        let beats = coordinator
            .dispatcher()
            .recent(SignalKind::Heartbeat, chrono::Duration::seconds(5));
        assert_eq!(beats.len(), 1);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_urgent_pain_stresses_then_recovers() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.awaken().await.unwrap();

        let pain = Signal::pain("oven", "grease fire", 0.95, "oven");
        coordinator.dispatcher().broadcast(pain).await.unwrap();
        assert_eq!(coordinator.state(), LifeState::Stressed);

        // healthy heartbeat calms the organism
        coordinator.heartbeat().await;
        assert_eq!(coordinator.state(), LifeState::Alive);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_low_health_heals_then_recovers() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.awaken().await.unwrap();
        coordinator.register("sick", steady("sick", 0.0));

        let mut health = coordinator.health();
        for _ in 0..12 {
            health = coordinator.heartbeat().await;
            if health < HEALING_THRESHOLD {
                break;
            }
        }
        assert!(health < HEALING_THRESHOLD);
        assert_eq!(coordinator.state(), LifeState::Healing);

        coordinator.unregister("sick");
        coordinator.register("well", steady("well", 100.0));
        for _ in 0..12 {
            health = coordinator.heartbeat().await;
            if health >= RECOVERED_THRESHOLD {
                break;
            }
        }
        assert_eq!(coordinator.state(), LifeState::Alive);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_ingest_heals_and_accepts() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.anomaly().add_rule(
            Rule::new(
                "recipe-name",
                "recipe must have a name",
                "recipe",
                Severity::Medium,
                |entity| entity.get("name").is_none(),
            )
            .with_heal(|entity| {
                entity["name"] = json!("untitled");
                HealOutcome::healed()
            }),
        );

        let report = coordinator.ingest(json!({ "servings": 2 }), "recipe").await;
        assert!(report.accepted);
        assert_eq!(report.healed_count, 1);
        assert_eq!(report.data.unwrap()["name"], json!("untitled"));
    }

    #[tokio::test]
    async fn test_ingest_rejects_quarantined() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.anomaly().add_rule(Rule::new(
            "stock-negative",
            "stock cannot be negative",
            "inventory",
            Severity::High,
            |entity| entity["stock"].as_f64().is_some_and(|s| s < 0.0),
        ));

        let report = coordinator
            .ingest(json!({ "stock": -4.0 }), "inventory")
            .await;
        assert!(!report.accepted);
        assert!(report.quarantined);
        assert!(report.data.is_none());
        assert_eq!(coordinator.anomaly().quarantine_len(), 1);
    }

    #[tokio::test]
    async fn test_events_are_observable() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let mut rx = coordinator.subscribe();

        coordinator.awaken().await.unwrap();

        let mut saw_state_change = false;
        let mut saw_heartbeat = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                CoordinatorEvent::StateChange { .. } => saw_state_change = true,
                CoordinatorEvent::Heartbeat { .. } => saw_heartbeat = true,
                _ => {}
            }
        }
        assert!(saw_state_change);
        assert!(saw_heartbeat);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.awaken().await.unwrap();
        coordinator.shutdown().await;

        assert_eq!(coordinator.state(), LifeState::Dead);
        assert!(coordinator.dispatcher().registered().is_empty());
        assert!(coordinator.awaken().await.is_err());
    }

    #[tokio::test]
    async fn test_vitals_snapshot() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.awaken().await.unwrap();

        let vitals = coordinator.vitals();
        assert_eq!(vitals.state, LifeState::Alive);
        assert!(vitals.dispatcher.registered >= 4);
        assert_eq!(vitals.rate.state, "resting");

        // serializes for operators
        let json = serde_json::to_string(&vitals).unwrap();
        assert!(json.contains("\"state\":\"alive\""));

        coordinator.shutdown().await;
    }
}
