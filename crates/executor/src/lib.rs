pub mod batch;
pub mod executor;
pub mod future;
pub mod poller;

pub use batch::Batch;
pub use executor::{Executor, MapOptions, ResultStream, SubmitExtra};
pub use future::{FutureId, WorkFuture};
pub use poller::{Poller, PollerConfig};
