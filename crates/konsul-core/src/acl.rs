//! ACL engine: policy load/merge and capability checks (spec §4.6).
//!
//! Rules resolve by longest-prefix-match within each policy's domain,
//! extended here to the full capability set of spec §3 and to the `*`/`**`
//! segment wildcards shared with the change bus (`crate::pattern`), rather
//! than plain string-prefix matching. Per spec §5/§9 ("no global singleton
//! state leaks between tests"), `AclEngine` is a plain struct the
//! coordinator owns and constructs fresh per instance/test — no process
//! global.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use dashmap::DashMap;
use konsul_common::ConError;
use serde::{Deserialize, Serialize};

use crate::pattern;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
    List,
    Delete,
    Create,
    Update,
    Register,
    Deregister,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDomain {
    Kv,
    Service,
    Health,
    Backup,
    Admin,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
    pub pattern: String,
    pub capabilities: HashSet<Capability>,
    #[serde(default)]
    pub deny: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rules: HashMap<ResourceDomain, Vec<Rule>>,
}

pub struct AclEngine {
    policies: DashMap<String, Policy>,
    policy_dir: Option<std::path::PathBuf>,
}

impl AclEngine {
    pub fn new() -> Self {
        Self {
            policies: DashMap::new(),
            policy_dir: None,
        }
    }

    /// Loads every `*.json` policy file in `dir`. Called at startup and on
    /// explicit admin reload.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<(), ConError> {
        let dir = dir.as_ref();
        self.policy_dir = Some(dir.to_path_buf());
        self.policies.clear();
        if !dir.exists() {
            return Ok(());
        }
        let entries = std::fs::read_dir(dir)
            .map_err(|e| ConError::internal(format!("reading policy dir: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| ConError::internal(format!("reading dir entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConError::internal(format!("reading {path:?}: {e}")))?;
            let policy: Policy = serde_json::from_str(&contents)
                .map_err(|e| ConError::invalid_argument(format!("parsing {path:?}: {e}")))?;
            self.policies.insert(policy.name.clone(), policy);
        }
        Ok(())
    }

    pub fn reload(&mut self) -> Result<(), ConError> {
        if let Some(dir) = self.policy_dir.clone() {
            self.load_dir(dir)
        } else {
            Ok(())
        }
    }

    pub fn create_policy(&self, policy: Policy) {
        self.policies.insert(policy.name.clone(), policy);
    }

    pub fn get_policy(&self, name: &str) -> Option<Policy> {
        self.policies.get(name).map(|p| p.clone())
    }

    pub fn delete_policy(&self, name: &str) -> bool {
        self.policies.remove(name).is_some()
    }

    pub fn list_policies(&self) -> Vec<Policy> {
        self.policies.iter().map(|p| p.clone()).collect()
    }

    /// `test(policies, resource, path, capability) -> bool` (spec §4.6
    /// admin API, §8 ACL completeness invariant).
    ///
    /// Per policy (in policy-set order), the most specific matching rule in
    /// `domain` wins (longest literal prefix, via `pattern::specificity`).
    /// Across the winning rules of every named policy: any `deny` match
    /// dominates regardless of order or specificity; otherwise the
    /// capability must be granted by at least one winning rule. An unknown
    /// policy name is simply skipped (contributes nothing), so
    /// `test(&[], ...)` is always `false` — the empty-union default-deny
    /// case.
    pub fn test(
        &self,
        policy_names: &[String],
        domain: ResourceDomain,
        path: &str,
        capability: Capability,
    ) -> bool {
        let mut any_deny = false;
        let mut any_allow = false;

        for name in policy_names {
            let Some(policy) = self.policies.get(name) else {
                continue;
            };
            let Some(rules) = policy.rules.get(&domain) else {
                continue;
            };

            let winner = rules
                .iter()
                .filter(|r| pattern::matches(&r.pattern, path))
                .max_by_key(|r| pattern::specificity(&r.pattern));

            if let Some(rule) = winner {
                if !rule.capabilities.contains(&capability) {
                    continue;
                }
                if rule.deny {
                    any_deny = true;
                } else {
                    any_allow = true;
                }
            }
        }

        !any_deny && any_allow
    }
}

impl Default for AclEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_rule(pattern: &str, caps: &[Capability]) -> Rule {
        Rule {
            pattern: pattern.to_string(),
            capabilities: caps.iter().copied().collect(),
            deny: false,
        }
    }

    fn deny_rule(pattern: &str, caps: &[Capability]) -> Rule {
        Rule {
            pattern: pattern.to_string(),
            capabilities: caps.iter().copied().collect(),
            deny: true,
        }
    }

    fn policy(name: &str, domain: ResourceDomain, rules: Vec<Rule>) -> Policy {
        let mut map = HashMap::new();
        map.insert(domain, rules);
        Policy {
            name: name.to_string(),
            description: None,
            rules: map,
        }
    }

    #[test]
    fn empty_policy_set_is_always_denied() {
        let engine = AclEngine::new();
        assert!(!engine.test(&[], ResourceDomain::Kv, "anything", Capability::Read));
    }

    #[test]
    fn unknown_policy_name_contributes_nothing() {
        let engine = AclEngine::new();
        assert!(!engine.test(
            &["does-not-exist".to_string()],
            ResourceDomain::Kv,
            "anything",
            Capability::Read
        ));
    }

    #[test]
    fn single_policy_grants_matching_capability() {
        let engine = AclEngine::new();
        engine.create_policy(policy(
            "p1",
            ResourceDomain::Kv,
            vec![allow_rule("app/**", &[Capability::Read])],
        ));
        assert!(engine.test(
            &["p1".to_string()],
            ResourceDomain::Kv,
            "app/config",
            Capability::Read
        ));
        assert!(!engine.test(
            &["p1".to_string()],
            ResourceDomain::Kv,
            "app/config",
            Capability::Write
        ));
        assert!(!engine.test(
            &["p1".to_string()],
            ResourceDomain::Kv,
            "other/config",
            Capability::Read
        ));
    }

    #[test]
    fn scenario_six_deny_beats_allow_regardless_of_specificity() {
        let engine = AclEngine::new();
        engine.create_policy(policy(
            "p1",
            ResourceDomain::Kv,
            vec![allow_rule("app/**", &[Capability::Read])],
        ));
        engine.create_policy(policy(
            "p2",
            ResourceDomain::Kv,
            vec![deny_rule("app/secret/**", &[Capability::Read])],
        ));

        let policies = vec!["p1".to_string(), "p2".to_string()];
        assert!(!engine.test(&policies, ResourceDomain::Kv, "app/secret/x", Capability::Read));
        assert!(engine.test(&policies, ResourceDomain::Kv, "app/config", Capability::Read));
    }

    #[test]
    fn most_specific_rule_within_a_policy_wins() {
        let engine = AclEngine::new();
        engine.create_policy(policy(
            "p1",
            ResourceDomain::Kv,
            vec![
                allow_rule("app/**", &[Capability::Read]),
                deny_rule("app/secret/**", &[Capability::Read]),
            ],
        ));
        let policies = vec!["p1".to_string()];
        assert!(!engine.test(&policies, ResourceDomain::Kv, "app/secret/x", Capability::Read));
        assert!(engine.test(&policies, ResourceDomain::Kv, "app/config", Capability::Read));
    }

    #[test]
    fn delete_policy_removes_it_from_future_checks() {
        let engine = AclEngine::new();
        engine.create_policy(policy(
            "p1",
            ResourceDomain::Kv,
            vec![allow_rule("**", &[Capability::Read])],
        ));
        assert!(engine.delete_policy("p1"));
        assert!(!engine.test(&["p1".to_string()], ResourceDomain::Kv, "x", Capability::Read));
    }

    #[test]
    fn domains_are_isolated() {
        let engine = AclEngine::new();
        engine.create_policy(policy(
            "p1",
            ResourceDomain::Kv,
            vec![allow_rule("**", &[Capability::Read])],
        ));
        assert!(!engine.test(&["p1".to_string()], ResourceDomain::Service, "x", Capability::Read));
    }
}
