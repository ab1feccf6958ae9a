//! Egress rotation policy.
//!
//! Maps an entry's retry count to the outbound endpoint its next attempt
//! should use. The mapping is a pure function of the configuration and the
//! retry count: a worker never mutates shared "current proxy" state, so
//! concurrent attempts cannot observe each other's selection.

use tracing::warn;

use crate::config::EgressConfig;

/// Key reported when egress is disabled and requests go out directly.
pub const DIRECT_KEY: &str = "direct";

/// The endpoint chosen for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressSelection {
    /// Named key of the endpoint, recorded on the queue entry as `last_proxy`
    pub key: String,
    /// Proxy URL; `None` means connect directly
    pub endpoint: Option<String>,
    /// 0 for the primary, `n` for the n-th configured tier
    pub tier_index: usize,
}

impl EgressSelection {
    pub fn direct() -> Self {
        Self {
            key: DIRECT_KEY.to_string(),
            endpoint: None,
            tier_index: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Tier {
    threshold: i32,
    key: String,
    endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EgressPolicy {
    enabled: bool,
    primary: Tier,
    tiers: Vec<Tier>,
}

impl EgressPolicy {
    pub fn from_config(config: &EgressConfig) -> Self {
        let endpoint_for = |key: &str| {
            config
                .endpoints
                .get(key)
                .map(|url| url.trim())
                .filter(|url| !url.is_empty())
                .map(str::to_string)
        };

        let mut tiers: Vec<Tier> = config
            .tiers
            .iter()
            .map(|tier| Tier {
                threshold: tier.threshold,
                key: tier.key.clone(),
                endpoint: endpoint_for(&tier.key),
            })
            .collect();
        tiers.sort_by_key(|tier| tier.threshold);

        Self {
            enabled: config.enabled,
            primary: Tier {
                threshold: 0,
                key: config.primary.clone(),
                endpoint: endpoint_for(&config.primary),
            },
            tiers,
        }
    }

    /// A policy that always connects directly.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            primary: Tier {
                threshold: 0,
                key: DIRECT_KEY.to_string(),
                endpoint: None,
            },
            tiers: Vec::new(),
        }
    }

    /// Selects the endpoint for an attempt made after `retry_count` failures.
    ///
    /// Walks the tiers in ascending threshold order. Each reached tier with a
    /// configured endpoint replaces the current selection; a reached tier
    /// without one is skipped with a warning. The tier index is therefore
    /// non-decreasing in `retry_count`.
    pub fn select_egress(&self, retry_count: i32) -> EgressSelection {
        if !self.enabled {
            return EgressSelection::direct();
        }

        let mut selection = EgressSelection {
            key: self.primary.key.clone(),
            endpoint: self.primary.endpoint.clone(),
            tier_index: 0,
        };

        for (index, tier) in self.tiers.iter().enumerate() {
            if tier.threshold > retry_count {
                break;
            }
            match &tier.endpoint {
                Some(endpoint) => {
                    selection = EgressSelection {
                        key: tier.key.clone(),
                        endpoint: Some(endpoint.clone()),
                        tier_index: index + 1,
                    };
                }
                None => {
                    warn!(
                        egress = %tier.key,
                        retry_count,
                        "egress tier reached but no endpoint configured; keeping {}",
                        selection.key
                    );
                }
            }
        }

        selection
    }
}
