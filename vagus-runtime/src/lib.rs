//! Vagus Runtime - the root coordinator
//!
//! Builds the dispatcher and the three controllers, owns the component
//! registry and the lifecycle state machine, and runs the periodic
//! heartbeat and balance-sweep loops.

pub mod coordinator;

pub use coordinator::*;
