//! Rate Controller - adaptive throughput governor
//!
//! Holds a rate state with an associated multiplier and an energy budget:
//! - Hunger signals raise the rate, satiation steps it down one level
//! - High pain enters a timed Recovering state that reverts to Resting
//! - Critical forces Urgent immediately
//! - Queued work drains through a paced loop; the pace is the work
//!   kind's base interval divided by the current multiplier, read at
//!   sleep time so rate changes apply to the next wait only

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vagus_core::{intensity, Component, ComponentError, Dispatcher, Signal, SignalPayload, Vital};

/// Energy drained per processed work item.
pub const ENERGY_PER_ITEM: f64 = 2.0;

/// Below this the controller downgrades one level toward Resting.
pub const LOW_ENERGY: f64 = 20.0;

/// Below this the controller goes Dormant.
pub const CRITICAL_ENERGY: f64 = 5.0;

/// Restoring past this lifts Dormant back to Resting.
pub const WAKE_ENERGY: f64 = 50.0;

/// Throughput states with their rate multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateState {
    Dormant,
    Resting,
    Active,
    Elevated,
    Urgent,
    Recovering,
}

impl RateState {
    /// Scalar applied to work-queue wait intervals.
    pub fn multiplier(&self) -> f64 {
        match self {
            RateState::Dormant => 0.0,
            RateState::Resting => 0.5,
            RateState::Active => 1.0,
            RateState::Elevated => 1.5,
            RateState::Urgent => 2.0,
            RateState::Recovering => 0.25,
        }
    }

    /// Position on the Resting..Urgent ladder; Dormant and Recovering
    /// sit outside it.
    fn level(&self) -> u8 {
        match self {
            RateState::Dormant => 0,
            RateState::Recovering => 0,
            RateState::Resting => 1,
            RateState::Active => 2,
            RateState::Elevated => 3,
            RateState::Urgent => 4,
        }
    }

    fn step_down(&self) -> RateState {
        match self {
            RateState::Urgent => RateState::Elevated,
            RateState::Elevated => RateState::Active,
            RateState::Active => RateState::Resting,
            RateState::Recovering => RateState::Resting,
            RateState::Resting => RateState::Resting,
            RateState::Dormant => RateState::Dormant,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RateState::Dormant => "dormant",
            RateState::Resting => "resting",
            RateState::Active => "active",
            RateState::Elevated => "elevated",
            RateState::Urgent => "urgent",
            RateState::Recovering => "recovering",
        }
    }
}

/// Classes of queued work with their base pacing intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Quick,
    Standard,
    Bulk,
}

impl WorkKind {
    pub fn base_interval(&self) -> Duration {
        match self {
            WorkKind::Quick => Duration::from_millis(50),
            WorkKind::Standard => Duration::from_millis(200),
            WorkKind::Bulk => Duration::from_millis(500),
        }
    }
}

/// Errors from the work queue
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("work failed: {0}")]
    Failed(String),

    #[error("queue closed")]
    Closed,
}

type WorkFuture = Pin<Box<dyn Future<Output = Result<(), WorkError>> + Send>>;
type WorkFn = Box<dyn FnOnce() -> WorkFuture + Send>;

struct QueuedWork {
    id: Uuid,
    label: String,
    kind: WorkKind,
    task: WorkFn,
}

/// Record of one drained work item.
#[derive(Debug, Clone)]
pub struct ProcessedWork {
    pub label: String,
    pub kind: WorkKind,
    pub elapsed: Duration,
    pub ok: bool,
}

/// Per-item outcome of a caller-driven batch.
#[derive(Debug, Clone)]
pub struct BatchItemResult {
    pub index: usize,
    pub ok: bool,
    pub error: Option<String>,
}

/// Controller tuning knobs
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// How long Recovering lasts before reverting to Resting.
    pub recovery_window: Duration,
    /// Processed-work records retained.
    pub max_processed: usize,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            recovery_window: Duration::from_secs(30),
            max_processed: 500,
        }
    }
}

struct StateCell {
    state: RateState,
    /// Bumped on every transition; a Recovering revert only lands if the
    /// generation still matches.
    generation: u64,
}

struct QueueCell {
    queue: VecDeque<QueuedWork>,
    draining: bool,
    closed: bool,
}

/// Snapshot exposed through vitals
#[derive(Debug, Clone, serde::Serialize)]
pub struct RateSnapshot {
    pub state: &'static str,
    pub multiplier: f64,
    pub energy: f64,
    pub queued: usize,
    pub processed: usize,
}

/// Adaptive throughput governor
pub struct RateController {
    vital: Vital,
    config: RateConfig,
    cell: Mutex<StateCell>,
    energy: Mutex<f64>,
    work: Mutex<QueueCell>,
    processed: Mutex<VecDeque<ProcessedWork>>,
    idle: Notify,
    weak: Weak<RateController>,
}

impl RateController {
    pub fn new(hub: Arc<Dispatcher>, config: RateConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            vital: Vital::new("rate-controller", hub),
            config,
            cell: Mutex::new(StateCell {
                state: RateState::Resting,
                generation: 0,
            }),
            energy: Mutex::new(100.0),
            work: Mutex::new(QueueCell {
                queue: VecDeque::new(),
                draining: false,
                closed: false,
            }),
            processed: Mutex::new(VecDeque::new()),
            idle: Notify::new(),
            weak: weak.clone(),
        })
    }

    pub fn state(&self) -> RateState {
        self.cell.lock().state
    }

    pub fn multiplier(&self) -> f64 {
        self.state().multiplier()
    }

    pub fn energy(&self) -> f64 {
        *self.energy.lock()
    }

    /// Raise the rate to `target`; never lowers the current state.
    /// Recovering and Dormant are sticky: only the recovery window,
    /// restored energy or a critical signal move the controller out.
    pub fn elevate_rate(&self, target: RateState) {
        let current = self.state();
        if target.level() > current.level()
            && current != RateState::Recovering
            && current != RateState::Dormant
        {
            self.set_state(target, "elevated");
        }
    }

    /// Step the rate down exactly one level; never drops below Resting.
    pub fn reduce_rate(&self) {
        let next = self.state().step_down();
        self.set_state(next, "reduced");
    }

    /// Enter the timed Recovering state; auto-reverts to Resting after
    /// the configured window unless a newer transition happened.
    pub fn enter_recovery(&self) {
        let generation = {
            let mut cell = self.cell.lock();
            if cell.state == RateState::Recovering {
                return;
            }
            cell.state = RateState::Recovering;
            cell.generation += 1;
            cell.generation
        };
        info!(window = ?self.config.recovery_window, "entering recovery");

        if let Some(this) = self.weak.upgrade() {
            let window = this.config.recovery_window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let mut cell = this.cell.lock();
                if cell.state == RateState::Recovering && cell.generation == generation {
                    cell.state = RateState::Resting;
                    cell.generation += 1;
                    debug!("recovery window elapsed, resting");
                }
            });
        }
    }

    fn set_state(&self, next: RateState, reason: &str) {
        let prior = {
            let mut cell = self.cell.lock();
            if cell.state == next {
                return;
            }
            let prior = cell.state;
            cell.state = next;
            cell.generation += 1;
            prior
        };
        debug!(from = prior.label(), to = next.label(), reason, "rate transition");

        // leaving Dormant resumes a frozen queue
        if prior == RateState::Dormant && next != RateState::Dormant {
            self.resume_drain();
        }
    }

    /// Drain energy; low reserves force the rate down, empty reserves
    /// force Dormant.
    pub fn consume_energy(&self, amount: f64) {
        let remaining = {
            let mut energy = self.energy.lock();
            *energy = (*energy - amount).clamp(0.0, 100.0);
            *energy
        };

        if remaining < CRITICAL_ENERGY {
            self.set_state(RateState::Dormant, "energy exhausted");
        } else if remaining < LOW_ENERGY {
            let state = self.state();
            if state.level() > RateState::Resting.level() && state != RateState::Recovering {
                self.set_state(state.step_down(), "low energy");
            }
        }
    }

    /// Restore energy; crossing the wake threshold lifts Dormant back to
    /// Resting and resumes the drain if work is queued.
    pub fn restore_energy(&self, amount: f64) {
        let level = {
            let mut energy = self.energy.lock();
            *energy = (*energy + amount).clamp(0.0, 100.0);
            *energy
        };

        if level > WAKE_ENERGY && self.state() == RateState::Dormant {
            self.set_state(RateState::Resting, "energy restored");
        }
    }

    /// Append work to the FIFO and start the drain loop if none runs.
    /// While Dormant the item stays queued, frozen, until the controller
    /// wakes.
    pub fn enqueue<F, Fut>(&self, label: &str, kind: WorkKind, task: F) -> Result<Uuid, WorkError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        {
            let mut work = self.work.lock();
            if work.closed {
                return Err(WorkError::Closed);
            }
            work.queue.push_back(QueuedWork {
                id,
                label: label.to_string(),
                kind,
                task: Box::new(move || Box::pin(task())),
            });
        }
        self.resume_drain();
        Ok(id)
    }

    fn resume_drain(&self) {
        {
            let mut work = self.work.lock();
            if work.draining || work.queue.is_empty() {
                return;
            }
            work.draining = true;
        }
        if let Some(this) = self.weak.upgrade() {
            tokio::spawn(async move { this.drain().await });
        } else {
            self.work.lock().draining = false;
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            if self.state() == RateState::Dormant {
                debug!("dormant, freezing queue");
                self.work.lock().draining = false;
                self.idle.notify_waiters();
                // the controller may have woken between the state check
                // and the flag clear; hand ownership back if so
                if self.state() != RateState::Dormant {
                    self.resume_drain();
                }
                return;
            }

            // empty-check and flag-clear under one lock so an enqueue
            // racing the exit cannot strand an item
            let item = {
                let mut work = self.work.lock();
                match work.queue.pop_front() {
                    Some(item) => item,
                    None => {
                        work.draining = false;
                        drop(work);
                        self.idle.notify_waiters();
                        return;
                    }
                }
            };

            let started = tokio::time::Instant::now();
            let result = (item.task)().await;
            let elapsed = started.elapsed();

            if let Err(e) = &result {
                warn!(work = %item.label, id = %item.id, error = %e, "work item failed");
            }
            self.record(ProcessedWork {
                label: item.label,
                kind: item.kind,
                elapsed,
                ok: result.is_ok(),
            });
            self.consume_energy(ENERGY_PER_ITEM);

            // multiplier read here, not when the item was queued
            let multiplier = self.multiplier();
            if multiplier > 0.0 {
                tokio::time::sleep(item.kind.base_interval().div_f64(multiplier)).await;
            }
        }
    }

    fn record(&self, entry: ProcessedWork) {
        let mut processed = self.processed.lock();
        if processed.len() >= self.config.max_processed {
            processed.pop_front();
        }
        processed.push_back(entry);
    }

    /// Run a caller-driven batch with the same per-item pacing,
    /// collecting per-item outcomes without aborting on failure. If the
    /// controller goes Dormant mid-batch the remaining items are
    /// reported as frozen.
    pub async fn process_batch<T, F, Fut>(
        &self,
        items: Vec<T>,
        kind: WorkKind,
        mut processor: F,
    ) -> Vec<BatchItemResult>
    where
        F: FnMut(&T) -> Fut,
        Fut: Future<Output = Result<(), WorkError>>,
    {
        let total = items.len();
        let mut results = Vec::with_capacity(total);

        for (index, item) in items.iter().enumerate() {
            if self.state() == RateState::Dormant {
                for frozen in index..total {
                    results.push(BatchItemResult {
                        index: frozen,
                        ok: false,
                        error: Some("controller dormant".to_string()),
                    });
                }
                break;
            }

            let started = tokio::time::Instant::now();
            let result = processor(item).await;
            self.record(ProcessedWork {
                label: format!("batch[{index}]"),
                kind,
                elapsed: started.elapsed(),
                ok: result.is_ok(),
            });
            self.consume_energy(ENERGY_PER_ITEM);

            results.push(BatchItemResult {
                index,
                ok: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            });

            if index + 1 < total {
                let multiplier = self.multiplier();
                if multiplier > 0.0 {
                    tokio::time::sleep(kind.base_interval().div_f64(multiplier)).await;
                }
            }
        }

        results
    }

    /// Stop admitting new work; the running drain finishes what is
    /// already queued.
    pub fn close(&self) {
        self.work.lock().closed = true;
    }

    /// Wait until the drain loop has stopped.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.work.lock().draining {
                return;
            }
            notified.await;
        }
    }

    pub fn snapshot(&self) -> RateSnapshot {
        let state = self.state();
        RateSnapshot {
            state: state.label(),
            multiplier: state.multiplier(),
            energy: self.energy(),
            queued: self.work.lock().queue.len(),
            processed: self.processed.lock().len(),
        }
    }
}

#[async_trait]
impl Component for RateController {
    fn name(&self) -> &str {
        self.vital.name()
    }

    async fn feel(&self, signal: &Signal) -> Result<Option<String>, ComponentError> {
        match &signal.payload {
            SignalPayload::Hunger { resource, .. } => {
                let target = if signal.intensity >= intensity::URGENT {
                    Some(RateState::Urgent)
                } else if signal.intensity >= intensity::HIGH {
                    Some(RateState::Elevated)
                } else if signal.intensity >= intensity::MEDIUM {
                    Some(RateState::Active)
                } else {
                    None
                };
                if let Some(target) = target {
                    self.elevate_rate(target);
                    return Ok(Some(format!("rate raised for {resource}")));
                }
                Ok(None)
            }
            SignalPayload::Satiation { resource } => {
                self.reduce_rate();
                Ok(Some(format!("rate eased after {resource}")))
            }
            SignalPayload::Pain { .. } if signal.intensity >= intensity::HIGH => {
                self.enter_recovery();
                Ok(Some("recovering".to_string()))
            }
            SignalPayload::Critical { reason } => {
                self.set_state(RateState::Urgent, "critical signal");
                Ok(Some(format!("urgent: {reason}")))
            }
            _ => Ok(self.vital.absorb(signal)),
        }
    }

    async fn pulse(&self) -> f64 {
        self.energy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vagus_core::DispatcherConfig;

    fn controller() -> Arc<RateController> {
        let hub = Arc::new(Dispatcher::new(DispatcherConfig::default()));
        RateController::new(hub, RateConfig::default())
    }

    #[tokio::test]
    async fn test_elevate_and_reduce_ladder() {
        let rate = controller();
        rate.elevate_rate(RateState::Urgent);
        assert_eq!(rate.state(), RateState::Urgent);
        assert_eq!(rate.multiplier(), 2.0);

        rate.reduce_rate();
        rate.reduce_rate();
        rate.reduce_rate();
        assert_eq!(rate.state(), RateState::Resting);

        // never drops below Resting via reduce alone
        rate.reduce_rate();
        assert_eq!(rate.state(), RateState::Resting);
    }

    #[tokio::test]
    async fn test_elevate_never_lowers() {
        let rate = controller();
        rate.elevate_rate(RateState::Urgent);
        rate.elevate_rate(RateState::Active);
        assert_eq!(rate.state(), RateState::Urgent);
    }

    #[tokio::test]
    async fn test_hunger_intensity_mapping() {
        let rate = controller();

        let mild = Signal::hunger("flour", None, 0.3, "larder");
        rate.feel(&mild).await.unwrap();
        assert_eq!(rate.state(), RateState::Resting);

        let medium = Signal::hunger("flour", None, 0.5, "larder");
        rate.feel(&medium).await.unwrap();
        assert_eq!(rate.state(), RateState::Active);

        let high = Signal::hunger("flour", None, 0.8, "larder");
        rate.feel(&high).await.unwrap();
        assert_eq!(rate.state(), RateState::Elevated);

        let urgent = Signal::hunger("flour", None, 0.95, "larder");
        rate.feel(&urgent).await.unwrap();
        assert_eq!(rate.state(), RateState::Urgent);
    }

    #[tokio::test]
    async fn test_satiation_steps_down_one() {
        let rate = controller();
        rate.elevate_rate(RateState::Urgent);
        rate.feel(&Signal::satiation("flour", "larder")).await.unwrap();
        assert_eq!(rate.state(), RateState::Elevated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_reverts_after_window() {
        let rate = controller();
        let pain = Signal::pain("oven", "door jammed", 0.8, "oven");
        rate.feel(&pain).await.unwrap();
        assert_eq!(rate.state(), RateState::Recovering);
        assert_eq!(rate.multiplier(), 0.25);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(rate.state(), RateState::Resting);
    }

    #[tokio::test]
    async fn test_critical_forces_urgent() {
        let rate = controller();
        rate.feel(&Signal::critical("freezer down", "freezer"))
            .await
            .unwrap();
        assert_eq!(rate.state(), RateState::Urgent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_drains_in_order() {
        let rate = controller();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            rate.enqueue(&format!("item-{i}"), WorkKind::Quick, move || async move {
                order.lock().push(i);
                Ok(())
            })
            .unwrap();
        }

        rate.wait_idle().await;
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(rate.snapshot().processed, 3);
        assert_eq!(rate.energy(), 100.0 - 3.0 * ENERGY_PER_ITEM);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dormant_freezes_and_restore_resumes() {
        let rate = controller();
        rate.consume_energy(98.0); // below CRITICAL_ENERGY -> Dormant
        assert_eq!(rate.state(), RateState::Dormant);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        rate.enqueue("frozen", WorkKind::Quick, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        rate.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(rate.snapshot().queued, 1);

        // restoring past the wake threshold resumes the drain
        rate.restore_energy(60.0);
        assert_eq!(rate.state(), RateState::Resting);
        tokio::time::sleep(Duration::from_millis(200)).await;
        rate.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_low_energy_downgrades() {
        let rate = controller();
        rate.elevate_rate(RateState::Urgent);
        rate.consume_energy(85.0); // 15 left, below LOW_ENERGY
        assert_eq!(rate.state(), RateState::Elevated);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let rate = controller();
        rate.close();
        let result = rate.enqueue("late", WorkKind::Quick, || async { Ok(()) });
        assert!(matches!(result, Err(WorkError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_collects_failures() {
        let rate = controller();
        let items = vec![1, 2, 3, 4];

        let results = rate
            .process_batch(items, WorkKind::Quick, |n| {
                let n = *n;
                async move {
                    if n % 2 == 0 {
                        Err(WorkError::Failed(format!("item {n}")))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(results.len(), 4);
        assert!(results[0].ok);
        assert!(!results[1].ok);
        assert!(results[2].ok);
        assert!(!results[3].ok);
        assert_eq!(results[1].error.as_deref(), Some("work failed: item 2"));
    }
}
