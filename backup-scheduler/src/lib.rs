//! Backup Scheduler Library
//!
//! Cron-driven scheduling of backup-engine runs with a persisted schedule
//! registry, plus the daemon's configuration, logging and shutdown plumbing.

pub mod config;
pub mod logger;
pub mod models;
pub mod runner;
pub mod services;
pub mod shutdown;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use models::schedule::{RunOutcome, Schedule, ScheduleView};
pub use runner::BackupRunner;
pub use services::backup_scheduler::Scheduler;
pub use store::StateStore;
