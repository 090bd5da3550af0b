//! Core library for steward - a single-household multi-agent operating
//! system (spec.md §1).
//!
//! # Architecture
//! - `store`: append-only State Store (C1) - entities, events, audit, idempotency.
//! - `bus`: typed pub/sub Event Bus (C2).
//! - `connectors`: Connector Registry and capability traits (C3).
//! - `scheduler`: cron/interval/frequency job scheduler (C4).
//! - `policy`: Policy / Approval Gate (C5).
//! - `safe_edit`: Safe-Edit Service (C6).
//! - `agent_runtime`: per-agent worker runtime (C7).
//! - `supervisor`: Supervisor / Manager (C8).
//! - `audit`: Audit / Cost Telemetry (C9).

#![deny(unsafe_code)]

pub mod agent_runtime;
pub mod audit;
pub mod bus;
pub mod config;
pub mod connectors;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod safe_edit;
pub mod scheduler;
pub mod store;
pub mod supervisor;

pub use error::{Result, StewardError};
