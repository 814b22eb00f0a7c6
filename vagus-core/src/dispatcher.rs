//! Dispatcher - the broadcast bus
//!
//! Delivery semantics:
//! - `broadcast` enqueues and, unless a drain is already running, runs
//!   the queue to empty before returning - including signals enqueued by
//!   handlers while the drain is in progress
//! - signals propagate in FIFO order; within one signal, components are
//!   visited in registration order
//! - the origin component is skipped, except heartbeats which loop back
//! - a failing or slow handler produces exactly one pain signal
//!   attributed to it and never blocks delivery to the rest
//! - maximum-intensity signals fire the escalation hook after
//!   propagation, off the queue path

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::component::Component;
use crate::signals::{intensity, Signal, SignalKind};

/// Hook invoked for signals at maximum intensity.
pub type EscalationHook = Arc<dyn Fn(&Signal) + Send + Sync>;

/// Errors from broadcast admission
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("signal rejected: {0}")]
    Rejected(String),
}

/// Dispatcher tuning knobs
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on a single handler invocation.
    pub handler_timeout: Duration,
    /// Signals retained for `recent` queries.
    pub max_history: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(5),
            max_history: 1000,
        }
    }
}

struct Registration {
    name: String,
    component: Arc<dyn Component>,
}

/// Queue state; `draining` lives under the same lock so enqueue and
/// drain-ownership decisions are atomic.
struct QueueState {
    queue: VecDeque<Signal>,
    draining: bool,
}

/// Counters exposed through vitals
#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatcherStats {
    pub registered: usize,
    pub queued: usize,
    pub history: usize,
    pub delivered: u64,
    pub failures: u64,
}

/// The broadcast bus
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: RwLock<Vec<Registration>>,
    state: Mutex<QueueState>,
    history: Mutex<VecDeque<Signal>>,
    delivered: AtomicU64,
    failures: AtomicU64,
    escalation: RwLock<Option<EscalationHook>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(Vec::new()),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                draining: false,
            }),
            history: Mutex::new(VecDeque::new()),
            delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            escalation: RwLock::new(None),
        }
    }

    /// Register a component under `name`. Re-registering an existing name
    /// swaps the component in place, keeping its registration-order slot;
    /// any in-flight delivery finishes against the old instance because
    /// propagation works on a snapshot of this table.
    pub fn register(&self, name: &str, component: Arc<dyn Component>) {
        let mut registry = self.registry.write();
        if let Some(slot) = registry.iter_mut().find(|r| r.name == name) {
            debug!(component = name, "re-registering, replacing prior entry");
            slot.component = component;
        } else {
            registry.push(Registration {
                name: name.to_string(),
                component,
            });
        }
    }

    pub fn unregister(&self, name: &str) {
        self.registry.write().retain(|r| r.name != name);
    }

    pub fn unregister_all(&self) {
        self.registry.write().clear();
    }

    pub fn registered(&self) -> Vec<String> {
        self.registry.read().iter().map(|r| r.name.clone()).collect()
    }

    /// Install the hook fired for maximum-intensity signals.
    pub fn set_escalation_hook(&self, hook: EscalationHook) {
        *self.escalation.write() = Some(hook);
    }

    /// Enqueue a signal and drain the queue to empty, unless another
    /// drain is already running - then the signal is left for it.
    pub async fn broadcast(&self, signal: Signal) -> Result<(), DispatchError> {
        if !signal.intensity.is_finite() {
            warn!(signal = %signal.id, "rejected signal with non-finite intensity");
            return Err(DispatchError::Rejected(
                "non-finite intensity".to_string(),
            ));
        }

        {
            let mut state = self.state.lock();
            state.queue.push_back(signal);
            if state.draining {
                return Ok(());
            }
            state.draining = true;
        }

        loop {
            let next = {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    Some(signal) => signal,
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            self.propagate(next).await;
        }

        Ok(())
    }

    /// Deliver one signal to every registered component except its
    /// origin (heartbeats loop back), isolating per-component failures.
    async fn propagate(&self, mut signal: Signal) {
        let targets: Vec<(String, Arc<dyn Component>)> = self
            .registry
            .read()
            .iter()
            .map(|r| (r.name.clone(), r.component.clone()))
            .collect();

        let loops_back = signal.kind() == SignalKind::Heartbeat;

        for (name, component) in targets {
            if name == signal.origin && !loops_back {
                continue;
            }

            let outcome =
                tokio::time::timeout(self.config.handler_timeout, component.feel(&signal)).await;

            match outcome {
                Ok(Ok(note)) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    signal.record_response(&name, note);
                }
                Ok(Err(e)) => {
                    self.deliver_failed(&mut signal, &name, &e.to_string());
                }
                Err(_) => {
                    self.deliver_failed(&mut signal, &name, "handler timed out");
                }
            }
        }

        signal.mark_propagated();

        if signal.intensity >= intensity::MAX {
            if let Some(hook) = self.escalation.read().clone() {
                let escalated = signal.clone();
                tokio::spawn(async move { hook(&escalated) });
            }
        }

        self.archive(signal);
    }

    /// One pain signal per failed delivery, attributed to the component
    /// that failed; queued behind whatever the drain is working through.
    fn deliver_failed(&self, signal: &mut Signal, component: &str, reason: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        warn!(component, reason, signal = %signal.id, "delivery failed");
        signal.record_response(component, Some(format!("error: {reason}")));

        let pain = Signal::pain(
            component,
            &format!("failed handling {:?} signal: {reason}", signal.kind()),
            intensity::HIGH,
            component,
        );
        self.state.lock().queue.push_back(pain);
    }

    fn archive(&self, signal: Signal) {
        let mut history = self.history.lock();
        if history.len() >= self.config.max_history {
            history.pop_front();
        }
        history.push_back(signal);
    }

    /// Propagated signals of `kind` no older than `max_age`, oldest first.
    pub fn recent(&self, kind: SignalKind, max_age: chrono::Duration) -> Vec<Signal> {
        let cutoff = Utc::now() - max_age;
        self.history
            .lock()
            .iter()
            .filter(|s| s.kind() == kind && s.created_at >= cutoff)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            registered: self.registry.read().len(),
            queued: self.state.lock().queue.len(),
            history: self.history.lock().len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Records every signal kind it sees; optionally fails on pain.
    struct Probe {
        name: String,
        seen: Mutex<Vec<(SignalKind, String)>>,
        fail: bool,
    }

    impl Probe {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn seen(&self) -> Vec<(SignalKind, String)> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl Component for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        async fn feel(&self, signal: &Signal) -> Result<Option<String>, ComponentError> {
            if self.fail {
                return Err(ComponentError::Handler("probe exploded".to_string()));
            }
            self.seen
                .lock()
                .push((signal.kind(), signal.origin.clone()));
            Ok(Some("seen".to_string()))
        }

        async fn pulse(&self) -> f64 {
            100.0
        }
    }

    /// Broadcasts one follow-up signal the first time it feels anything.
    struct ChainEmitter {
        name: String,
        hub: Arc<Dispatcher>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl Component for ChainEmitter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn feel(&self, _signal: &Signal) -> Result<Option<String>, ComponentError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                let follow_up = Signal::flow_start("follow-up", &self.name);
                // drain is in progress, so this only enqueues
                let _ = self.hub.broadcast(follow_up).await;
            }
            Ok(None)
        }

        async fn pulse(&self) -> f64 {
            100.0
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(DispatcherConfig::default()))
    }

    #[tokio::test]
    async fn test_origin_is_skipped() {
        let bus = dispatcher();
        let a = Probe::new("a");
        let b = Probe::new("b");
        let c = Probe::new("c");
        bus.register("a", a.clone());
        bus.register("b", b.clone());
        bus.register("c", c.clone());

        let pain = Signal::pain("a", "burned the roux", 0.95, "a");
        bus.broadcast(pain).await.unwrap();

        assert!(a.seen().is_empty());
        assert_eq!(b.seen().len(), 1);
        assert_eq!(c.seen().len(), 1);
        assert_eq!(b.seen()[0], (SignalKind::Pain, "a".to_string()));
    }

    #[tokio::test]
    async fn test_heartbeat_loops_back_to_origin() {
        let bus = dispatcher();
        let a = Probe::new("a");
        bus.register("a", a.clone());

        let beat = Signal::heartbeat(90.0, "alive", "a");
        bus.broadcast(beat).await.unwrap();

        assert_eq!(a.seen().len(), 1);
        assert_eq!(a.seen()[0].0, SignalKind::Heartbeat);
    }

    #[tokio::test]
    async fn test_failing_handler_is_isolated() {
        let bus = dispatcher();
        let bad = Probe::failing("bad");
        let after = Probe::new("after");
        bus.register("bad", bad.clone());
        bus.register("after", after.clone());

        bus.broadcast(Signal::flow_start("service", "kitchen"))
            .await
            .unwrap();

        // the later registration still got the original signal
        let kinds: Vec<SignalKind> = after.seen().iter().map(|(k, _)| *k).collect();
        assert!(kinds.contains(&SignalKind::FlowStart));

        // exactly one pain signal attributed to the failing component
        let pains = bus.recent(SignalKind::Pain, chrono::Duration::seconds(5));
        assert_eq!(pains.len(), 1);
        assert_eq!(pains[0].origin, "bad");
        assert_eq!(bus.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_broadcast_drains_handler_enqueued_signals() {
        let bus = dispatcher();
        let chain = Arc::new(ChainEmitter {
            name: "chain".to_string(),
            hub: bus.clone(),
            armed: AtomicBool::new(true),
        });
        let witness = Probe::new("witness");
        bus.register("chain", chain);
        bus.register("witness", witness.clone());

        bus.broadcast(Signal::flow_start("opening", "kitchen"))
            .await
            .unwrap();

        // one broadcast call, but the witness saw the follow-up too
        let kinds: Vec<SignalKind> = witness.seen().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds.len(), 2);
        assert_eq!(bus.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_non_finite_intensity_rejected() {
        let bus = dispatcher();
        let mut signal = Signal::flow_start("x", "y");
        signal.intensity = f64::INFINITY;

        let result = bus.broadcast(signal).await;
        assert!(matches!(result, Err(DispatchError::Rejected(_))));
        assert_eq!(bus.stats().history, 0);
    }

    #[tokio::test]
    async fn test_reregistration_replaces_in_place() {
        let bus = dispatcher();
        let first = Probe::new("slot");
        let second = Probe::new("slot");
        bus.register("slot", first.clone());
        bus.register("other", Probe::new("other"));
        bus.register("slot", second.clone());

        assert_eq!(bus.registered(), vec!["slot", "other"]);

        bus.broadcast(Signal::flow_start("x", "kitchen")).await.unwrap();
        assert!(first.seen().is_empty());
        assert_eq!(second.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_escalation_hook_fires_at_max() {
        let bus = dispatcher();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        bus.set_escalation_hook(Arc::new(move |_signal| {
            flag.store(true, Ordering::SeqCst);
        }));

        bus.broadcast(Signal::critical("walk-in freezer down", "freezer"))
            .await
            .unwrap();

        // hook runs off the queue path
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_recent_filters_by_kind() {
        let bus = dispatcher();
        bus.broadcast(Signal::hunger("flour", None, 0.6, "larder"))
            .await
            .unwrap();
        bus.broadcast(Signal::flow_start("prep", "kitchen"))
            .await
            .unwrap();

        let hungers = bus.recent(SignalKind::Hunger, chrono::Duration::minutes(5));
        assert_eq!(hungers.len(), 1);
        assert!(hungers[0].propagated);
    }
}
