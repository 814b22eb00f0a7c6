//! Vagus Reflex - the self-regulating controllers
//!
//! Three units that register on the bus and react to signals:
//! - **RateController**: adaptive throughput governor with an energy budget
//! - **RangeMonitor**: target-range watcher with corrective actions
//! - **AnomalyEngine**: rule-based detection, healing and quarantine

pub mod anomaly;
pub mod range;
pub mod rate;

pub use anomaly::*;
pub use range::*;
pub use rate::*;
