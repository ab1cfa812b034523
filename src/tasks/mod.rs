//! Background Tasks Module
//!
//! # Tasks
//! - Volatile sweep: drops volatile entries older than the retention window

mod sweep;

pub use sweep::spawn_sweep_task;
