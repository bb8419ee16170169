pub mod backoff;
pub mod cron;
pub mod handlers;
pub mod model;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod schedules;
pub mod service;
pub mod store;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use model::{EnqueueOptions, Job, JobFilter, JobState, JobStats, NewSchedule, Schedule, ScheduleUpdate};
pub use registry::{HandlerContext, HandlerRegistry};
pub use schedules::ScheduleStore;
pub use service::{JobService, ServiceHandle};
pub use store::JobStore;
