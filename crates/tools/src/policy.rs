//! Capability policy — which registered tools a session may dispatch.
//!
//! Rules:
//! - If a whitelist is present, only whitelisted names are eligible.
//! - Of the eligible names, only those also enabled are dispatchable.
//! - `"*"` in `enabled` enables every eligible name.
//!
//! The policy is evaluated against the registry's current names each time a
//! control loop starts; nothing is cached.

use agentloom_config::ToolsConfig;
use std::collections::BTreeSet;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityPolicy {
    whitelist: Option<BTreeSet<String>>,
    enabled: BTreeSet<String>,
}

impl CapabilityPolicy {
    pub fn new<W, E, S>(whitelist: Option<W>, enabled: E) -> Self
    where
        W: IntoIterator<Item = S>,
        E: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            whitelist: whitelist.map(|w| w.into_iter().map(Into::into).collect()),
            enabled: enabled.into_iter().map(Into::into).collect(),
        }
    }

    /// Every registered tool is dispatchable.
    pub fn allow_all() -> Self {
        Self {
            whitelist: None,
            enabled: BTreeSet::from([WILDCARD.to_string()]),
        }
    }

    /// No tool is dispatchable.
    pub fn deny_all() -> Self {
        Self {
            whitelist: None,
            enabled: BTreeSet::new(),
        }
    }

    pub fn permits(&self, name: &str) -> bool {
        let whitelisted = self.whitelist.as_ref().is_none_or(|w| w.contains(name));
        whitelisted && (self.enabled.contains(WILDCARD) || self.enabled.contains(name))
    }

    /// The dispatchable subset of `known` names.
    pub fn effective<'a, I>(&self, known: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        known
            .into_iter()
            .filter(|n| self.permits(n))
            .cloned()
            .collect()
    }

    /// Combine a base policy with a session override. The result permits a
    /// name only if both policies do, so an override can narrow but never widen.
    pub fn merge(&self, other: &CapabilityPolicy) -> CapabilityPolicy {
        let whitelist = match (&self.whitelist, &other.whitelist) {
            (Some(a), Some(b)) => Some(a.intersection(b).cloned().collect()),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        let enabled = match (
            self.enabled.contains(WILDCARD),
            other.enabled.contains(WILDCARD),
        ) {
            (true, true) => BTreeSet::from([WILDCARD.to_string()]),
            (true, false) => other.enabled.clone(),
            (false, true) => self.enabled.clone(),
            (false, false) => self.enabled.intersection(&other.enabled).cloned().collect(),
        };
        CapabilityPolicy { whitelist, enabled }
    }
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl From<&ToolsConfig> for CapabilityPolicy {
    fn from(config: &ToolsConfig) -> Self {
        Self::new(config.whitelist.clone(), config.enabled.clone())
    }
}
