//! Admission, execution and lease upkeep
//!
//! This module provides:
//! - [`WorkerPool`] - Bounded pool that runs admitted work with pause/resume/drain/stop
//! - [`AdmissionPlanner`] - Computes idle capacity and per-request batch sizes
//! - [`LeaseRefresher`] - Per-delivery timers that keep leases alive
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Subscriber                            │
//! │  ┌──────────────────┐        ┌───────────────────────────┐  │
//! │  │ AdmissionPlanner │        │      LeaseRefresher       │  │
//! │  │ (ceil(p * 1.10)) │        │ (tick every 0.7 * lease)  │  │
//! │  └────────┬─────────┘        └─────────────▲─────────────┘  │
//! │           │ receive() x N                  │ finished /     │
//! │           ▼                                │ acknowledged   │
//! │  ┌─────────────────────────────────────────┴─────────────┐  │
//! │  │                      SignalBus                         │  │
//! │  └─────────────────────────────────────────▲─────────────┘  │
//! │           │                                │                │
//! │           ▼                                │                │
//! │  ┌─────────────────────────────────────────┴─────────────┐  │
//! │  │           WorkerPool (concurrency = p)                 │  │
//! │  │  [Delivery 1] [Delivery 2] ... [Delivery N]            │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod capacity;
mod pool;
mod refresh;

pub use capacity::{in_flight_ceiling, AdmissionPlanner, IN_FLIGHT_OVERSHOOT_PERCENT};
pub use pool::{WorkerPool, WorkerPoolError, DRAIN_GRACE_PERIOD};
pub use refresh::{refresh_period, LeaseRefresher, REFRESH_SAFETY_PERCENT};
