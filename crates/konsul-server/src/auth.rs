//! Admission: token identity and ACL authorization for every handler.
//!
//! JWT/session issuance is out of scope (spec §1 Excluded), so tokens here
//! are opaque random strings minted by an admin endpoint and held in
//! memory. `TokenStore` keeps only the shape it needs — a principal's
//! policy set plus an optional expiry — with no signing/verification
//! machinery, since that belongs to a collaborator system this crate
//! doesn't own.
//!
//! `auth.enabled` and `acl.enabled` are orthogonal switches: auth decides
//! whether a caller must present a valid token at all; ACL decides whether
//! that caller's (possibly empty) policy set is then checked against the
//! requested capability. With auth off, every request carries an empty
//! policy set, so enabling ACL alone makes every request forbidden until an
//! operator attaches policies to a minted token — a deliberate default-deny
//! reading of spec §4.6, recorded in DESIGN.md.

use std::time::{Duration, Instant};

use actix_web::HttpRequest;
use dashmap::DashMap;
use konsul_common::ConError;
use konsul_core::acl::{Capability, ResourceDomain};
use rand::Rng;

use crate::state::AppState;

struct TokenRecord {
    policies: Vec<String>,
    expires_at: Option<Instant>,
}

pub struct TokenStore {
    tokens: DashMap<String, TokenRecord>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }

    /// Mints a new opaque token bound to `policies`, returning the token
    /// string. `ttl: None` means the token never expires.
    pub fn create(&self, policies: Vec<String>, ttl: Option<Duration>) -> String {
        let token = random_token();
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.tokens
            .insert(token.clone(), TokenRecord { policies, expires_at });
        token
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    /// Resolves `token`'s policy set, lazily evicting it if expired.
    pub fn policies_for(&self, token: &str) -> Option<Vec<String>> {
        let record = self.tokens.get(token)?;
        if let Some(expires_at) = record.expires_at {
            if Instant::now() >= expires_at {
                drop(record);
                self.tokens.remove(token);
                return None;
            }
        }
        Some(record.policies.clone())
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

fn random_token() -> String {
    let bytes: [u8; 24] = rand::rng().random();
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    let header = req.headers().get(actix_web::http::header::AUTHORIZATION)?;
    let value = header.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|s| s.trim().to_string())
}

/// Resolves the caller's policy set from its bearer token under
/// `auth.enabled`; an empty set when auth is disabled. Shared by
/// `authorize` and by `watch::watch`, which needs the policy set itself to
/// build the watcher's per-event read predicate.
pub fn resolve_policies(state: &AppState, req: &HttpRequest) -> Result<Vec<String>, ConError> {
    if !state.config.auth.enabled {
        return Ok(Vec::new());
    }
    let token = bearer_token(req).ok_or(ConError::Unauthorized)?;
    state.tokens.policies_for(&token).ok_or(ConError::Unauthorized)
}

/// Resolves the caller's policy set under `auth.enabled`, then — if
/// `acl.enabled` — checks it against `domain`/`path`/`capability`.
pub fn authorize(
    state: &AppState,
    req: &HttpRequest,
    domain: ResourceDomain,
    path: &str,
    capability: Capability,
) -> Result<(), ConError> {
    let policies = resolve_policies(state, req)?;

    if state.config.acl.enabled && !state.coordinator.acl.test(&policies, domain, path, capability) {
        return Err(ConError::Forbidden(format!(
            "policy set does not grant {capability:?} on {path}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_token_resolves_its_policies() {
        let store = TokenStore::new();
        let token = store.create(vec!["admin".to_string()], None);
        assert_eq!(store.policies_for(&token).unwrap(), vec!["admin".to_string()]);
    }

    #[test]
    fn expired_token_is_evicted_lazily() {
        let store = TokenStore::new();
        let token = store.create(vec!["admin".to_string()], Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(store.policies_for(&token).is_none());
        assert!(store.policies_for(&token).is_none()); // still gone, not re-inserted
    }

    #[test]
    fn revoke_removes_token_immediately() {
        let store = TokenStore::new();
        let token = store.create(vec!["admin".to_string()], None);
        assert!(store.revoke(&token));
        assert!(store.policies_for(&token).is_none());
    }

    #[test]
    fn unknown_token_resolves_to_none() {
        let store = TokenStore::new();
        assert!(store.policies_for("not-a-real-token").is_none());
    }
}
