//! Shared types for the model station
//!
//! Identifiers, descriptors and the wire messages of the client-facing and
//! administrative contracts. Everything here is plain data; behaviour lives in
//! the hypervisor crate.

pub mod errors;
pub mod logging;
pub mod messages;
pub mod types;

pub use errors::*;
pub use types::*;

pub use messages::{
    // Client-facing request contract
    Admission, InferenceRequest, PoolStats, RequestOutcome, RequestState, RequestStatus,

    // Administrative contract
    AdminResponse, AdminStatus, BackendHealth, BundleDescriptor, HealthReport, SupervisorState,
    UpdatePhase, UpdateStatus,
};
