//! Provider catalog entries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a provider runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Cloud,
    Local,
    Generic,
}

/// Health status of a provider.
///
/// An unhealthy provider's models are never selected, even if active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl ProviderHealth {
    /// Whether models on this provider may receive traffic.
    #[must_use]
    pub fn is_selectable(self) -> bool {
        matches!(self, ProviderHealth::Healthy | ProviderHealth::Degraded)
    }
}

impl fmt::Display for ProviderHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderHealth::Healthy => "healthy",
            ProviderHealth::Degraded => "degraded",
            ProviderHealth::Unhealthy => "unhealthy",
            ProviderHealth::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A provider in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Unique name, referenced by models.
    pub name: String,
    /// Human-friendly display name.
    pub display_name: String,
    pub provider_type: ProviderType,
    pub enabled: bool,
    pub health: ProviderHealth,
}

impl ProviderEntry {
    /// Create an enabled provider with unknown health.
    #[must_use]
    pub fn new(name: impl Into<String>, provider_type: ProviderType) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            provider_type,
            enabled: true,
            health: ProviderHealth::Unknown,
        }
    }

    /// Set the health status.
    #[must_use]
    pub fn with_health(mut self, health: ProviderHealth) -> Self {
        self.health = health;
        self
    }

    /// Disable the provider.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
