pub mod config;
pub mod distributed;
pub mod gpu;
pub mod job;
pub mod launch;
pub mod logs;
pub mod platform;
pub mod reconcile;
pub mod store;
pub mod sweep;

pub use job::{Backend, Job, JobId, JobRequest, JobStatus};
pub use platform::{ComputePlatform, PlatformError, Platforms, Submission};
pub use reconcile::{Orchestrator, OrchestratorError, ReconcileReport};
pub use store::{JobStore, MemoryStore};
