//! Model station hypervisor
//!
//! Supervises the inference backend process, admits inference requests into a
//! bounded worker pool, binds the service port and updates the installed
//! station in place.

pub mod core;
pub mod error;
pub mod hypervisor;
pub mod server;
pub mod services;
pub mod traits;
pub mod update;

// Re-export commonly used types
pub use core::{RequestQueue, UpdateJob, WorkerPool, WorkerState};
pub use error::{HypervisorError, HypervisorResult};
pub use hypervisor::{Exit, Hypervisor, HypervisorHandle, InferenceReply};
pub use traits::{
    BackendLaunch, BackendSupervisor, ConfigAccessor, DrainReport, InferenceBackend, Installer, LaunchMethod,
    ProcessTerminator, SessionLauncher, TerminationOutcome, UpdateHost, Updater,
};
pub use update::{DetachedHost, UpdateOrchestrator};
