//! Suspicious sign-in alerting runs.
//!
//! This crate provides:
//! - Alert evaluation of a fetched sign-in batch
//! - The run orchestrator sequencing token, window, fetch, notify, and persist
//! - Cron scheduling for the long-running `watch` mode

pub mod evaluator;
pub mod orchestrator;
pub mod schedule;

pub use evaluator::{evaluate, AlertDecision, AlertFormat};
pub use orchestrator::{Orchestrator, RunError, RunReport, RunSettings, RunStage};
pub use schedule::{next_tick, normalize_cron, parse_schedule, watch, ScheduleError};
