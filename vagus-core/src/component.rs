//! Component trait and shared vital state
//!
//! Every unit on the bus implements [`Component`]: a name, a `feel`
//! handler for incoming signals, and a `pulse` health probe. [`Vital`]
//! carries the state most components share - a health score, a hub
//! handle for emitting, and the default handling for heartbeat and pain.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::signals::{intensity, Signal, SignalPayload};

/// Health lost when a high-intensity pain signal lands on a component.
pub const PAIN_HEALTH_PENALTY: f64 = 10.0;

/// A single-update health drop this large broadcasts a pain signal.
pub const VISIBLE_HEALTH_DROP: f64 = 10.0;

/// Errors from component signal handlers
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("component unavailable: {0}")]
    Unavailable(String),
}

/// Common interface for everything registered on the bus.
///
/// `feel` returns an optional response note that the dispatcher records
/// on the signal's delivery log. New signals are emitted through the
/// dispatcher handle, never returned.
#[async_trait]
pub trait Component: Send + Sync {
    /// Unique component name; doubles as the signal origin.
    fn name(&self) -> &str;

    /// React to a signal delivered by the dispatcher.
    async fn feel(&self, signal: &Signal) -> Result<Option<String>, ComponentError>;

    /// Current health score in [0, 100].
    async fn pulse(&self) -> f64;
}

/// Shared vital state embedded by concrete components: health score,
/// hub handle and emit helpers.
pub struct Vital {
    name: String,
    hub: Arc<Dispatcher>,
    health: Mutex<f64>,
}

impl Vital {
    pub fn new(name: &str, hub: Arc<Dispatcher>) -> Self {
        Self {
            name: name.to_string(),
            hub,
            health: Mutex::new(100.0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hub(&self) -> &Arc<Dispatcher> {
        &self.hub
    }

    pub fn health(&self) -> f64 {
        *self.health.lock()
    }

    /// Default handling for the signals every component understands.
    /// Pain at HIGH intensity or above costs a fixed amount of health;
    /// the reduction is silent so a pain storm cannot feed itself.
    pub fn absorb(&self, signal: &Signal) -> Option<String> {
        match &signal.payload {
            SignalPayload::Heartbeat { health, .. } => {
                debug!(component = %self.name, organism_health = health, "heartbeat");
                Some("pulse-ack".to_string())
            }
            SignalPayload::Pain { source, .. } if signal.intensity >= intensity::HIGH => {
                let mut health = self.health.lock();
                *health = (*health - PAIN_HEALTH_PENALTY).clamp(0.0, 100.0);
                Some(format!("pain from {source} absorbed"))
            }
            _ => None,
        }
    }

    /// Apply a health delta, clamped to [0, 100]. A visible drop in one
    /// update broadcasts a pain signal attributed to this component.
    pub async fn update_health(&self, delta: f64) -> f64 {
        let (old, new) = {
            let mut health = self.health.lock();
            let old = *health;
            *health = (old + delta).clamp(0.0, 100.0);
            (old, *health)
        };

        if old - new >= VISIBLE_HEALTH_DROP {
            let pain_intensity = ((100.0 - new) / 100.0).clamp(0.3, 1.0);
            let detail = format!("health dropped from {old:.0} to {new:.0}");
            self.emit_pain(&detail, pain_intensity).await;
        }

        new
    }

    pub async fn emit_hunger(&self, resource: &str, request: Option<&str>, level: f64) {
        let signal = Signal::hunger(resource, request, level, &self.name);
        self.emit(signal).await;
    }

    pub async fn emit_pain(&self, detail: &str, level: f64) {
        let signal = Signal::pain(&self.name, detail, level, &self.name);
        self.emit(signal).await;
    }

    pub async fn emit_growth(&self, aspect: &str, delta: f64) {
        let signal = Signal::growth(aspect, delta, &self.name);
        self.emit(signal).await;
    }

    async fn emit(&self, signal: Signal) {
        if let Err(e) = self.hub.broadcast(signal).await {
            warn!(component = %self.name, error = %e, "emit dropped");
        }
    }
}
