pub mod job;
pub mod work;

pub use job::{JobDescriptor, JobStatus, SubmittedJob};
pub use work::{ResultPackage, WorkItem, WorkPackage, WorkStatus};
