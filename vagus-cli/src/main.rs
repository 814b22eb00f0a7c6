//! Vagus CLI
//!
//! Drives the signal-broadcast coordination core from the terminal: a
//! scripted demo scenario and a one-shot vitals dump.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use vagus_core::{Component, ComponentError, Signal, SignalKind, SignalPayload, Vital};
use vagus_reflex::{HealOutcome, Rule, Severity, TargetRange, WorkKind};
use vagus_runtime::{Coordinator, CoordinatorConfig, EventKind};

#[derive(Parser)]
#[command(name = "vagus")]
#[command(author, version, about = "Vagus: in-process signal coordination core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (0-3)
    #[arg(short, long, default_value = "1")]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted demo scenario against a live coordinator
    Demo {
        /// How long to let the organism run, in seconds
        #[arg(long, default_value = "10")]
        duration: u64,

        /// Heartbeat interval in milliseconds
        #[arg(long, default_value = "1000")]
        heartbeat_ms: u64,
    },

    /// Construct a coordinator and dump its vitals as JSON
    Vitals,
}

/// Demo component: a prep station that absorbs signals through its
/// vital state and reports its health.
struct PrepStation {
    vital: Vital,
}

#[async_trait]
impl Component for PrepStation {
    fn name(&self) -> &str {
        self.vital.name()
    }

    async fn feel(&self, signal: &Signal) -> Result<Option<String>, ComponentError> {
        Ok(self.vital.absorb(signal))
    }

    async fn pulse(&self) -> f64 {
        self.vital.health()
    }
}

/// Demo component: an oven that fails on flow-start signals, to show
/// failure isolation turning into attributed pain.
struct FlakyOven {
    name: String,
}

#[async_trait]
impl Component for FlakyOven {
    fn name(&self) -> &str {
        &self.name
    }

    async fn feel(&self, signal: &Signal) -> Result<Option<String>, ComponentError> {
        if signal.kind() == SignalKind::FlowStart {
            return Err(ComponentError::Handler("igniter timed out".to_string()));
        }
        Ok(None)
    }

    async fn pulse(&self) -> f64 {
        55.0
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match cli.command {
        Commands::Demo {
            duration,
            heartbeat_ms,
        } => run_demo(duration, heartbeat_ms).await?,
        Commands::Vitals => dump_vitals().await?,
    }

    Ok(())
}

fn demo_coordinator(heartbeat_ms: u64) -> Arc<Coordinator> {
    let config = CoordinatorConfig {
        heartbeat_interval: Duration::from_millis(heartbeat_ms),
        stressed_heartbeat_interval: Duration::from_millis(heartbeat_ms / 2),
        sweep_interval: Duration::from_millis(heartbeat_ms * 3),
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::new(config);

    // domain rules plugged in from the outside, the way embedding
    // applications would
    coordinator.anomaly().add_rule(
        Rule::new(
            "recipe-name",
            "recipe must have a name",
            "recipe",
            Severity::Medium,
            |entity| entity.get("name").map_or(true, |n| n.is_null()),
        )
        .with_heal(|entity| {
            entity["name"] = serde_json::json!("untitled recipe");
            HealOutcome::healed()
        }),
    );
    coordinator.anomaly().add_rule(Rule::new(
        "stock-negative",
        "stock cannot be negative",
        "inventory",
        Severity::High,
        |entity| entity["stock"].as_f64().is_some_and(|s| s < 0.0),
    ));

    coordinator.range().set_target(
        "prep-queue",
        "backlog",
        TargetRange {
            min: 0.0,
            ideal: 4.0,
            max: 10.0,
        },
    );

    coordinator
}

async fn run_demo(duration: u64, heartbeat_ms: u64) -> Result<()> {
    println!("Vagus demo - signal coordination core\n");

    let coordinator = demo_coordinator(heartbeat_ms);

    let station = Arc::new(PrepStation {
        vital: Vital::new("prep-station", coordinator.dispatcher().clone()),
    });
    coordinator.register("prep-station", station);
    coordinator.register(
        "oven",
        Arc::new(FlakyOven {
            name: "oven".to_string(),
        }),
    );

    let _alert_listener = coordinator.on(EventKind::Alert, |event| {
        println!("ALERT: {event:?}");
    });

    coordinator.awaken().await?;
    println!(
        "Awake: state={}, health={:.0}\n",
        coordinator.state().label(),
        coordinator.health()
    );

    // a hunger ramp drives the rate governor up
    for intensity in [0.4, 0.6, 0.85] {
        let hunger = Signal::hunger("flour", None, intensity, "larder");
        coordinator.dispatcher().broadcast(hunger).await?;
    }
    println!(
        "After hunger ramp: rate state={}, multiplier={}",
        coordinator.rate().snapshot().state,
        coordinator.rate().multiplier()
    );

    // paced work through the governor
    for i in 0..5 {
        let label = format!("prep-ticket-{i}");
        coordinator.rate().enqueue(&label, WorkKind::Quick, move || async move {
            tracing::info!(ticket = i, "prepped");
            Ok(())
        })?;
    }

    // a flow-start makes the flaky oven fail, producing attributed pain
    let flow = Signal::flow_start("dinner-service", "coordinator");
    coordinator.dispatcher().broadcast(flow).await?;

    // ingest: one healable recipe, one unhealable inventory record
    let healed = coordinator
        .ingest(serde_json::json!({ "servings": 4 }), "recipe")
        .await;
    println!(
        "Ingest recipe: accepted={}, healed={}",
        healed.accepted, healed.healed_count
    );

    let rejected = coordinator
        .ingest(serde_json::json!({ "item": "saffron", "stock": -2.0 }), "inventory")
        .await;
    println!(
        "Ingest inventory: accepted={}, quarantined={}",
        rejected.accepted, rejected.quarantined
    );

    // overload the prep queue so the balance sweep reacts
    coordinator.range().record_measurement(
        "prep-queue",
        std::collections::HashMap::from([("backlog".to_string(), 18.0)]),
    );

    println!("\nRunning for {duration}s...\n");
    tokio::time::sleep(Duration::from_secs(duration)).await;

    let vitals = coordinator.vitals();
    println!("Final vitals:");
    println!("{}", serde_json::to_string_pretty(&vitals)?);

    let pains = coordinator
        .dispatcher()
        .recent(SignalKind::Pain, chrono::Duration::seconds(duration as i64 + 5));
    println!("\nPain signals observed: {}", pains.len());
    for pain in pains.iter().take(5) {
        if let SignalPayload::Pain { source, detail } = &pain.payload {
            println!("  - [{source}] {detail}");
        }
    }

    coordinator.shutdown().await;
    println!("\nShut down: state={}", coordinator.state().label());
    Ok(())
}

async fn dump_vitals() -> Result<()> {
    let coordinator = demo_coordinator(1000);
    coordinator.awaken().await?;

    let vitals = coordinator.vitals();
    println!("{}", serde_json::to_string_pretty(&vitals)?);

    coordinator.shutdown().await;
    Ok(())
}
