//! Watermark persistence and query-window planning.
//!
//! This crate provides:
//! - `Watermark`, the persisted "considered up to" instant
//! - `WatermarkStore` trait with file-backed and in-memory implementations
//! - `RunLease`, an exclusive lock file guarding one run at a time
//! - `plan_window` / `next_watermark`, the pure windowing policy

pub mod error;
pub mod lease;
pub mod model;
pub mod planner;
pub mod store;

pub use error::StoreError;
pub use lease::{LeaseInfo, RunLease};
pub use model::{LoadedWatermark, Watermark, WatermarkOrigin};
pub use planner::{next_watermark, plan_window, QueryWindow, WindowPolicy};
pub use store::{FileWatermarkStore, MemoryWatermarkStore, WatermarkStore};
