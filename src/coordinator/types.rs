// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the status engine coordinator.

use thiserror::Error;

use crate::config::ConfigError;
use crate::services::ServiceKind;
use crate::storage::StorageError;

/// Engine lifecycle state.
///
/// Use [`super::StatusEngine::state()`] to check current state or
/// [`super::StatusEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet connected
    Created,
    /// Building the cache backend (Redis connect, snapshot restore)
    Connecting,
    /// Components wired, accepting fetches and subscribers
    Ready,
    /// Refresh scheduler and hub maintenance running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// Everything closed
    Stopped,
}

impl EngineState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Connecting => "Connecting",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cache backend: {0}")]
    Storage(#[from] StorageError),
    #[error("engine is {0}")]
    InvalidState(EngineState),
}

/// Point-in-time view for `/health`-style endpoints. No I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Ready or Running
    pub ready: bool,
    /// Cache backend name (`memory`, `redis`, `read_through`)
    pub cache_backend: &'static str,
    pub subscribers: usize,
    pub monitored: usize,
    /// Services whose breaker is currently open
    pub open_circuits: Vec<ServiceKind>,
    /// Running with every breaker closed
    pub healthy: bool,
}
