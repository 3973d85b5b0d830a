//! Service implementations
//!
//! Production implementations of the traits in [`crate::traits`]; everything
//! that touches sockets, processes or the filesystem lives here.

pub mod backend_client;
pub mod installer;
pub mod port_binder;
pub mod process_supervisor;
pub mod session_launcher;
pub mod settings;
pub mod terminator;

#[cfg(test)]
mod tests;

// Re-export all service implementations
pub use backend_client::HttpInferenceBackend;
pub use installer::RealInstaller;
pub use port_binder::{PortAllocation, PortBinder};
pub use process_supervisor::{start_with_retries, ProcessHandle, RealProcessSupervisor};
pub use session_launcher::RealSessionLauncher;
pub use settings::FileConfigAccessor;
pub use terminator::RealProcessTerminator;
