pub mod config;
pub mod error;
pub mod policy;
pub mod types;

pub use config::Config;
pub use error::{PipelineError, PipelineResult};
pub use policy::{IcpPolicy, LeadPolicy, PipelinePolicy, RateLimits, RetryPolicy};
pub use types::*;
