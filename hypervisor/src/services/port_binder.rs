//! Listening port selection
//!
//! Searches upward from a preferred port and keeps the first socket that binds.

use std::net::IpAddr;
use tokio::net::{lookup_host, TcpListener};

use crate::error::{HypervisorError, HypervisorResult};
use shared::{process_debug, ProcessId};

/// Outcome of a successful port search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocation {
    pub requested: u16,
    pub bound: u16,
    /// Number of ports tried, including the successful one
    pub attempts: u16,
}

/// Binds listeners on a fixed host
#[derive(Debug, Clone)]
pub struct PortBinder {
    host: String,
}

impl PortBinder {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// Bind `preferred`, then `preferred + 1`, … for at most `max_attempts` ports
    ///
    /// Failed attempts leave nothing behind; ports past 65535 count as exhausted.
    pub async fn bind(&self, preferred: u16, max_attempts: u16) -> HypervisorResult<(TcpListener, PortAllocation)> {
        if max_attempts == 0 {
            return Err(HypervisorError::NoPortAvailable { preferred, attempts: 0 });
        }

        let ip = self.resolve().await?;
        for attempt in 0..max_attempts {
            let Some(port) = preferred.checked_add(attempt) else {
                break;
            };

            match TcpListener::bind((ip, port)).await {
                Ok(listener) => {
                    // Port 0 asks the OS for any free port
                    let bound = listener.local_addr()?.port();
                    let allocation = PortAllocation {
                        requested: preferred,
                        bound,
                        attempts: attempt + 1,
                    };
                    process_debug!(
                        ProcessId::current(),
                        "🔌 Bound {}:{} after {} attempt(s)",
                        self.host,
                        bound,
                        allocation.attempts
                    );
                    return Ok((listener, allocation));
                }
                Err(e) => {
                    process_debug!(ProcessId::current(), "Port {} unavailable: {}", port, e);
                }
            }
        }

        Err(HypervisorError::NoPortAvailable {
            preferred,
            attempts: max_attempts,
        })
    }

    /// Find a free port without keeping it bound
    pub async fn find_free(&self, preferred: u16, max_attempts: u16) -> HypervisorResult<PortAllocation> {
        let (listener, allocation) = self.bind(preferred, max_attempts).await?;
        drop(listener);
        Ok(allocation)
    }

    /// Resolve the host once so names like `localhost` work
    async fn resolve(&self) -> HypervisorResult<IpAddr> {
        lookup_host((self.host.as_str(), 0))
            .await
            .map_err(|e| HypervisorError::config(format!("Invalid service host '{}': {}", self.host, e)))?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| HypervisorError::config(format!("Service host '{}' did not resolve", self.host)))
    }
}
