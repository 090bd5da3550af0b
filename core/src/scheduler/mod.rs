pub mod daemon;
pub mod model;
pub mod store;

pub use daemon::SchedulerDaemon;
pub use model::{
    CronSchedule, DurationSpec, DelegateAction, Frequency, IntervalSchedule, JobAction, JobId,
    JobSchedule, ScheduledJob, ShellAction,
};

pub use store::{JobStore, JobsFile};
