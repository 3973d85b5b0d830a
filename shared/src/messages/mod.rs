//! Message types for the model station contracts
//!
//! - `inference`: client-facing submit/poll contract and pool statistics
//! - `admin`: supervisor, update and health reporting

pub mod admin;
pub mod inference;

pub use inference::{Admission, InferenceRequest, PoolStats, RequestOutcome, RequestState, RequestStatus};

pub use admin::{
    AdminResponse, AdminStatus, BackendHealth, BundleDescriptor, HealthReport, SupervisorState, UpdatePhase,
    UpdateStatus,
};
