//! Allow/block policy gating flow creation.
//!
//! Rules are keyed on the originating process UID or an exact destination
//! domain. Evaluation happens once, when a flow is created; the default is
//! allow. The store is read-mostly: forwarders evaluate on every flow
//! creation while writes arrive rarely from the control plane.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allow,
    Block,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleSubject {
    Uid(u32),
    /// Exact domain match only: no wildcards, substrings, or suffixes.
    Domain(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub subject: RuleSubject,
    pub decision: Decision,
}

pub struct PolicyStore {
    uid_rules: RwLock<FxHashMap<u32, Decision>>,
    domain_rules: RwLock<FxHashMap<String, Decision>>,
}

impl PolicyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            uid_rules: RwLock::new(FxHashMap::default()),
            domain_rules: RwLock::new(FxHashMap::default()),
        })
    }

    /// Install or replace a rule.
    pub fn set_rule(&self, subject: RuleSubject, decision: Decision) {
        match subject {
            RuleSubject::Uid(uid) => {
                self.uid_rules.write().insert(uid, decision);
            }
            RuleSubject::Domain(domain) => {
                let Some(normalized) = normalize_domain(&domain) else {
                    return;
                };
                self.domain_rules.write().insert(normalized, decision);
            }
        }
    }

    pub fn remove_rule(&self, subject: &RuleSubject) -> bool {
        match subject {
            RuleSubject::Uid(uid) => self.uid_rules.write().remove(uid).is_some(),
            RuleSubject::Domain(domain) => match normalize_domain(domain) {
                Some(normalized) => self.domain_rules.write().remove(&normalized).is_some(),
                None => false,
            },
        }
    }

    /// Fixed evaluation order: UID rule, else exact domain rule, else allow.
    pub fn evaluate(&self, uid: Option<u32>, domain: Option<&str>) -> Decision {
        if let Some(uid) = uid {
            if let Some(decision) = self.uid_rules.read().get(&uid) {
                return *decision;
            }
        }
        if let Some(domain) = domain {
            if let Some(normalized) = normalize_domain(domain) {
                if let Some(decision) = self.domain_rules.read().get(&normalized) {
                    return *decision;
                }
            }
        }
        Decision::Allow
    }

    pub fn rules(&self) -> Vec<PolicyRule> {
        let mut rules: Vec<PolicyRule> = self
            .uid_rules
            .read()
            .iter()
            .map(|(uid, decision)| PolicyRule {
                subject: RuleSubject::Uid(*uid),
                decision: *decision,
            })
            .collect();
        rules.extend(self.domain_rules.read().iter().map(|(domain, decision)| {
            PolicyRule {
                subject: RuleSubject::Domain(domain.clone()),
                decision: *decision,
            }
        }));
        rules
    }

    pub fn clear(&self) {
        self.uid_rules.write().clear();
        self.domain_rules.write().clear();
    }

    pub fn len(&self) -> usize {
        self.uid_rules.read().len() + self.domain_rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize_domain(domain: &str) -> Option<String> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_ascii_lowercase())
    }
}

static ACTIVE: Lazy<RwLock<Option<Arc<PolicyStore>>>> = Lazy::new(|| RwLock::new(None));

/// Publish a store as the process-wide active policy. The gateway installs
/// its store on start and uninstalls on stop.
pub fn install(store: Arc<PolicyStore>) {
    *ACTIVE.write() = Some(store);
}

/// Clear the active policy, but only if `store` is still the one
/// installed. A later gateway's store is left untouched.
pub fn uninstall(store: &Arc<PolicyStore>) {
    let mut guard = ACTIVE.write();
    if guard
        .as_ref()
        .map(|active| Arc::ptr_eq(active, store))
        .unwrap_or(false)
    {
        *guard = None;
    }
}

/// The currently-installed store, if a gateway is running.
pub fn active() -> Option<Arc<PolicyStore>> {
    ACTIVE.read().clone()
}
