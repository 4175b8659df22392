pub mod domain;
pub mod driver;
pub mod lease;
pub mod worker;

pub use driver::{DriverConfig, DriverError, SandboxDriver};
pub use lease::{Lease, LeaseSpec, SandboxCommand, SandboxState};
pub use worker::{Signal, SandboxWorker, WorkerError, WorkerHandle};
