pub mod adapters;
pub mod clock;
pub mod enrichment;
pub mod icp;
pub mod ingestion;
pub mod publisher;
pub mod queue;
pub mod rate_limit;
pub mod scheduling;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
pub mod views;
pub mod worker;

pub use worker::{DispatchReport, DispatchStatus, PipelineDeps, Worker, WorkerPool};
