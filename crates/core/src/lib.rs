pub mod config;
pub mod envelope;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::{
    AppConfig, JobDefaults, LoggingSettings, PollerSettings, WorkerSettings, ENV_DEV_ARGS,
    ENV_LEVEL, ENV_QFARM_BIN, ENV_RECURSION_LIMIT,
};
pub use envelope::{pack, unpack, Envelope};
pub use errors::{QfarmError, RemoteError, Result};
pub use models::{
    JobDescriptor, JobStatus, ResultPackage, SubmittedJob, WorkItem, WorkPackage, WorkStatus,
};
pub use traits::Broker;
