//! Signals - immutable broadcast messages
//!
//! Signals are the only way components talk to each other:
//! - Each carries a typed payload and a normalized intensity in [0, 1]
//! - Intensity is clamped at every entry point (the clamping law)
//! - Only the bookkeeping fields (`propagated`, `responses`) ever mutate
//! - Signals serialize to JSON for logging and audit trails

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Named intensity bands used by the controllers.
pub mod intensity {
    /// Background-level signal, informational.
    pub const LOW: f64 = 0.25;
    /// Worth reacting to.
    pub const MEDIUM: f64 = 0.5;
    /// Triggers immediate regulation.
    pub const HIGH: f64 = 0.75;
    /// Forces state escalation.
    pub const URGENT: f64 = 0.9;
    /// Maximum; fires the escalation hook.
    pub const MAX: f64 = 1.0;
}

/// Discriminant of a signal, used for filtering and history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Hunger,
    Satiation,
    Pain,
    Heartbeat,
    FlowStart,
    FlowComplete,
    Critical,
    Growth,
}

/// Typed payload, one variant per signal kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    /// A resource is running low or work is starving.
    Hunger {
        resource: String,
        /// Optional concrete request for whoever reacts.
        request: Option<String>,
    },

    /// A previously hungry resource has been fed.
    Satiation { resource: String },

    /// Something failed or degraded.
    Pain {
        source: String,
        detail: String,
    },

    /// Periodic liveness pulse carrying aggregated health.
    Heartbeat {
        health: f64,
        state: String,
    },

    /// A unit of work began.
    FlowStart { flow: String },

    /// A unit of work finished.
    FlowComplete {
        flow: String,
        duration_ms: u64,
    },

    /// The system must react immediately.
    Critical { reason: String },

    /// A capability or metric improved.
    Growth {
        aspect: String,
        delta: f64,
    },
}

impl SignalPayload {
    /// Kind discriminant for this payload.
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Hunger { .. } => SignalKind::Hunger,
            SignalPayload::Satiation { .. } => SignalKind::Satiation,
            SignalPayload::Pain { .. } => SignalKind::Pain,
            SignalPayload::Heartbeat { .. } => SignalKind::Heartbeat,
            SignalPayload::FlowStart { .. } => SignalKind::FlowStart,
            SignalPayload::FlowComplete { .. } => SignalKind::FlowComplete,
            SignalPayload::Critical { .. } => SignalKind::Critical,
            SignalPayload::Growth { .. } => SignalKind::Growth,
        }
    }
}

/// Delivery bookkeeping appended by the dispatcher, one entry per
/// component that handled the signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalResponse {
    pub component: String,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// An immutable broadcast message.
///
/// Only `propagated` and `responses` change after construction; the
/// dispatcher owns those updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Unique signal instance ID
    pub id: Uuid,

    /// The typed payload
    pub payload: SignalPayload,

    /// Normalized severity (0.0 - 1.0)
    pub intensity: f64,

    /// Name of the originating component
    pub origin: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Set once the dispatcher has delivered this signal
    pub propagated: bool,

    /// Append-only delivery log
    pub responses: Vec<SignalResponse>,
}

fn clamp_intensity(intensity: f64) -> f64 {
    if intensity.is_nan() {
        0.0
    } else {
        intensity.clamp(0.0, 1.0)
    }
}

impl Signal {
    /// Create a new signal builder
    pub fn builder(payload: SignalPayload) -> SignalBuilder {
        SignalBuilder::new(payload)
    }

    /// Kind discriminant of the payload.
    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    /// Age relative to wall clock at call time.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// JSON form for logging and audit trails.
    pub fn audit_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("signal {}", self.id))
    }

    /// Record a component's response. Called by the dispatcher during
    /// propagation; the list is append-only.
    pub fn record_response(&mut self, component: &str, note: Option<String>) {
        self.responses.push(SignalResponse {
            component: component.to_string(),
            note,
            at: Utc::now(),
        });
    }

    /// Mark the signal as delivered.
    pub fn mark_propagated(&mut self) {
        self.propagated = true;
    }

    // --- factory helpers for the common kinds ---

    /// Hunger signal: `resource` is starving, optional concrete request.
    pub fn hunger(resource: &str, request: Option<&str>, intensity: f64, origin: &str) -> Signal {
        Signal::builder(SignalPayload::Hunger {
            resource: resource.to_string(),
            request: request.map(str::to_string),
        })
        .intensity(intensity)
        .origin(origin)
        .build()
    }

    /// Satiation signal: `resource` has been fed, step activity down.
    pub fn satiation(resource: &str, origin: &str) -> Signal {
        Signal::builder(SignalPayload::Satiation {
            resource: resource.to_string(),
        })
        .intensity(intensity::MEDIUM)
        .origin(origin)
        .build()
    }

    /// Pain signal attributed to `source`.
    pub fn pain(source: &str, detail: &str, intensity: f64, origin: &str) -> Signal {
        Signal::builder(SignalPayload::Pain {
            source: source.to_string(),
            detail: detail.to_string(),
        })
        .intensity(intensity)
        .origin(origin)
        .build()
    }

    /// Heartbeat carrying aggregated health and the current life state.
    pub fn heartbeat(health: f64, state: &str, origin: &str) -> Signal {
        Signal::builder(SignalPayload::Heartbeat {
            health,
            state: state.to_string(),
        })
        .intensity(intensity::LOW)
        .origin(origin)
        .build()
    }

    /// Flow-start marker.
    pub fn flow_start(flow: &str, origin: &str) -> Signal {
        Signal::builder(SignalPayload::FlowStart {
            flow: flow.to_string(),
        })
        .intensity(intensity::LOW)
        .origin(origin)
        .build()
    }

    /// Flow-complete marker with elapsed time.
    pub fn flow_complete(flow: &str, duration_ms: u64, origin: &str) -> Signal {
        Signal::builder(SignalPayload::FlowComplete {
            flow: flow.to_string(),
            duration_ms,
        })
        .intensity(intensity::LOW)
        .origin(origin)
        .build()
    }

    /// Critical signal at maximum intensity; always escalates.
    pub fn critical(reason: &str, origin: &str) -> Signal {
        Signal::builder(SignalPayload::Critical {
            reason: reason.to_string(),
        })
        .intensity(intensity::MAX)
        .origin(origin)
        .build()
    }

    /// Growth signal: `aspect` improved by `delta`.
    pub fn growth(aspect: &str, delta: f64, origin: &str) -> Signal {
        Signal::builder(SignalPayload::Growth {
            aspect: aspect.to_string(),
            delta,
        })
        .intensity(intensity::LOW)
        .origin(origin)
        .build()
    }
}

/// Builder for signals
pub struct SignalBuilder {
    payload: SignalPayload,
    intensity: f64,
    origin: String,
}

impl SignalBuilder {
    pub fn new(payload: SignalPayload) -> Self {
        Self {
            payload,
            intensity: intensity::MEDIUM,
            origin: String::new(),
        }
    }

    pub fn intensity(mut self, intensity: f64) -> Self {
        self.intensity = clamp_intensity(intensity);
        self
    }

    pub fn origin(mut self, origin: &str) -> Self {
        self.origin = origin.to_string();
        self
    }

    pub fn build(self) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            payload: self.payload,
            intensity: clamp_intensity(self.intensity),
            origin: self.origin,
            created_at: Utc::now(),
            propagated: false,
            responses: Vec::new(),
        }
    }
}
