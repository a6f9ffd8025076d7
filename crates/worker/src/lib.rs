pub mod child;
pub mod dispatch;
pub mod framing;
pub mod registry;
pub mod service;

pub use child::{child_main, run_child};
pub use dispatch::ChildDispatcher;
pub use registry::{FunctionRegistry, PreflightFn, WorkerFunction};
pub use service::WorkerLoop;
