//! `gits-scheduler`: scheduling and lifecycle of one-shot git jobs.
//!
//! # Overview
//!
//! A request is normalized into a UTC minute and a one-shot trigger
//! expression, stored as a `pending` job, and bound to a rule in a
//! [`TriggerRegistry`]. When the rule fires, the [`ExecutionRelay`] decodes
//! the envelope and [`JobScheduler::on_fire`] runs the git action once,
//! writing `succeeded` or `failed`.
//!
//! | Component               | Local backend                          |
//! |-------------------------|----------------------------------------|
//! | [`JobStore`]            | [`SqliteJobStore`]                     |
//! | [`TriggerRegistry`]     | [`SqliteTriggerRegistry`] + [`TriggerClock`] |
//! | [`ContentStore`]        | [`FsContentStore`]                     |
//! | [`GitExecutor`]         | [`CommandGitExecutor`]                 |

pub mod content;
pub mod db;
pub mod error;
pub mod executor;
pub mod local_registry;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod store;
pub mod timespec;
pub mod types;

pub use content::{ContentStore, FsContentStore};
pub use error::{Result, SchedulerError};
pub use executor::{CommandGitExecutor, ExecutionReport, ExecutionRequest, ExecutorError, GitExecutor};
pub use local_registry::{SqliteTriggerRegistry, TriggerClock};
pub use registry::{FireEnvelope, TargetInput, TriggerRegistry, Unregistered};
pub use relay::ExecutionRelay;
pub use scheduler::JobScheduler;
pub use store::{JobStore, SqliteJobStore};
pub use timespec::{NormalizedTime, TimeError, TriggerExpression};
pub use types::{
    ContentUpload, DiscardReason, FireOutcome, FireRequest, Job, JobAction, JobStatus, JobSummary,
    Outcome, ScheduleRequest, ScheduledJob,
};
