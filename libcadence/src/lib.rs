//! Cadence - scheduled publishing to social platforms
//!
//! This library holds the job queue, the scheduler that executes due jobs
//! through platform drivers, and the supporting stores (accounts, sessions,
//! sealed credentials, execution history) shared by the command line tools.

pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod lock;
pub mod logging;
pub mod platforms;
pub mod retry;
pub mod scheduler;
pub mod scheduling;
pub mod service;
pub mod session;
pub mod types;
pub mod vault;
pub mod watcher;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use db::{CancelOutcome, Database, RescheduleOutcome};
pub use error::{CadenceError, DriverError, ErrorKind, Result};
pub use scheduler::Scheduler;
pub use service::CadenceService;
pub use types::{
    Account, AttemptOutcome, ExecutionAttempt, Job, JobState, NewAccount, NewAttempt, NewJob,
    Platform,
};
