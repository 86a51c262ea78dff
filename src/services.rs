// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Known upstream service kinds.
//!
//! Each monitored integration is one [`ServiceKind`]. String tags coming from
//! stored configuration are parsed through a static table, so an unknown tag
//! is a typed error instead of a silent fallthrough. Every kind owns one
//! circuit breaker in the [`BreakerRegistry`] and one orchestrator in the
//! [`OrchestratorRegistry`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::fetch::{FetchError, FetchOrchestrator, OrchestratorConfig};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::storage::CacheStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKind {
    Autobrr,
    Omegabrr,
    Radarr,
    Sonarr,
    Lidarr,
    Prowlarr,
    Overseerr,
    Plex,
    Tautulli,
    Sabnzbd,
    Nzbget,
    Qbittorrent,
    Deluge,
    Maintainerr,
    /// Generic HTTP health endpoint
    General,
}

/// (kind, tag, display name)
const SERVICE_TABLE: &[(ServiceKind, &str, &str)] = &[
    (ServiceKind::Autobrr, "autobrr", "Autobrr"),
    (ServiceKind::Omegabrr, "omegabrr", "Omegabrr"),
    (ServiceKind::Radarr, "radarr", "Radarr"),
    (ServiceKind::Sonarr, "sonarr", "Sonarr"),
    (ServiceKind::Lidarr, "lidarr", "Lidarr"),
    (ServiceKind::Prowlarr, "prowlarr", "Prowlarr"),
    (ServiceKind::Overseerr, "overseerr", "Overseerr"),
    (ServiceKind::Plex, "plex", "Plex"),
    (ServiceKind::Tautulli, "tautulli", "Tautulli"),
    (ServiceKind::Sabnzbd, "sabnzbd", "SABnzbd"),
    (ServiceKind::Nzbget, "nzbget", "NZBGet"),
    (ServiceKind::Qbittorrent, "qbittorrent", "qBittorrent"),
    (ServiceKind::Deluge, "deluge", "Deluge"),
    (ServiceKind::Maintainerr, "maintainerr", "Maintainerr"),
    (ServiceKind::General, "general", "General"),
];

impl ServiceKind {
    /// Every known kind, in table order.
    pub fn all() -> impl Iterator<Item = ServiceKind> {
        SERVICE_TABLE.iter().map(|(kind, _, _)| *kind)
    }

    /// Position in the lookup table. Exhaustive, so a new variant fails to
    /// compile until it gets a row.
    fn index(self) -> usize {
        match self {
            Self::Autobrr => 0,
            Self::Omegabrr => 1,
            Self::Radarr => 2,
            Self::Sonarr => 3,
            Self::Lidarr => 4,
            Self::Prowlarr => 5,
            Self::Overseerr => 6,
            Self::Plex => 7,
            Self::Tautulli => 8,
            Self::Sabnzbd => 9,
            Self::Nzbget => 10,
            Self::Qbittorrent => 11,
            Self::Deluge => 12,
            Self::Maintainerr => 13,
            Self::General => 14,
        }
    }

    fn row(self) -> &'static (ServiceKind, &'static str, &'static str) {
        &SERVICE_TABLE[self.index()]
    }

    /// Lower-case tag used in config and cache keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.row().1
    }

    #[must_use]
    pub fn display_name(self) -> &'static str {
        self.row().2
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown service type '{0}'")]
pub struct UnknownServiceKind(pub String);

impl FromStr for ServiceKind {
    type Err = UnknownServiceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        SERVICE_TABLE
            .iter()
            .find(|(_, name, _)| name.eq_ignore_ascii_case(tag))
            .map(|(kind, _, _)| *kind)
            .ok_or_else(|| UnknownServiceKind(s.to_string()))
    }
}

/// One circuit breaker per service kind, created up front.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: Vec<Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: &CircuitConfig) -> Self {
        let breakers = ServiceKind::all()
            .map(|kind| Arc::new(CircuitBreaker::new(kind.as_str(), config.clone())))
            .collect();
        Self { breakers }
    }

    /// The breaker guarding `kind`.
    #[must_use]
    pub fn get(&self, kind: ServiceKind) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breakers[kind.index()])
    }

    /// Kinds whose breaker is currently open.
    #[must_use]
    pub fn open(&self) -> Vec<ServiceKind> {
        ServiceKind::all()
            .zip(self.breakers.iter())
            .filter(|(_, breaker)| breaker.is_open())
            .map(|(kind, _)| kind)
            .collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(&CircuitConfig::default())
    }
}

/// One [`FetchOrchestrator`] per service kind over a shared cache, each
/// guarded by that kind's breaker.
#[derive(Debug, Clone)]
pub struct OrchestratorRegistry {
    orchestrators: Arc<[FetchOrchestrator]>,
}

impl OrchestratorRegistry {
    pub fn new(cache: Arc<dyn CacheStore>, breakers: &BreakerRegistry, config: &OrchestratorConfig) -> Self {
        let orchestrators = ServiceKind::all()
            .map(|kind| FetchOrchestrator::new(Arc::clone(&cache), breakers.get(kind), config.clone()))
            .collect();
        Self { orchestrators }
    }

    #[must_use]
    pub fn get(&self, kind: ServiceKind) -> &FetchOrchestrator {
        &self.orchestrators[kind.index()]
    }

    /// Close every orchestrator. Returns the first error after trying all.
    pub async fn close(&self) -> Result<(), FetchError> {
        let mut first = Ok(());
        for orchestrator in self.orchestrators.iter() {
            if let Err(e) = orchestrator.close().await {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }
}
