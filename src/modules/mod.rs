//! Decision modules (spec §4 components D-N).
//!
//! Each submodule owns one component's state and pure decision logic and
//! implements [`crate::lifecycle::Module`] to wire itself onto the bus.

pub mod allocator;
pub mod anomaly;
pub mod balancer;
pub mod dialog;
pub mod drawdown;
pub mod explain;
pub mod failover;
pub mod guardrail;
pub mod log_router;
pub mod pacing;
pub mod pii;
