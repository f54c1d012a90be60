//! `/admin/ratelimit/*` admin surface (spec §4.7/§6).

use std::time::{Duration, Instant};

use actix_web::{HttpRequest, HttpResponse, web};
use konsul_core::acl::{Capability, ResourceDomain};
use konsul_core::ratelimit::{BucketConfig, IdentityKind};
use serde::{Deserialize, Serialize};

use crate::auth::authorize;
use crate::error_response::render;
use crate::state::AppState;

fn require_admin(state: &AppState, req: &HttpRequest) -> Result<(), konsul_common::ConError> {
    authorize(state, req, ResourceDomain::Admin, "ratelimit", Capability::Write)
}

#[derive(Deserialize)]
pub struct IdentityQuery {
    #[serde(rename = "type")]
    pub kind: String,
    pub identifier: String,
}

fn parse_identity(q: &IdentityQuery) -> Result<(IdentityKind, String), konsul_common::ConError> {
    let kind = match q.kind.as_str() {
        "ip" => IdentityKind::Ip,
        "apikey" => IdentityKind::ApiKey,
        other => {
            return Err(konsul_common::ConError::invalid_argument(format!(
                "unknown identity type '{other}'"
            )));
        }
    };
    Ok((kind, q.identifier.clone()))
}

#[derive(Serialize)]
struct RateLimitConfigResponse {
    enabled: bool,
    capacity: f64,
    refill_rate: f64,
}

#[derive(Deserialize)]
pub struct ConfigUpdateBody {
    pub requests_per_sec: Option<f64>,
    pub burst: Option<f64>,
}

pub async fn get_config(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    let config = state.coordinator.rate_limiter.default_config();
    HttpResponse::Ok().json(RateLimitConfigResponse {
        enabled: state.config.rate_limit.enabled,
        capacity: config.capacity,
        refill_rate: config.refill_rate,
    })
}

pub async fn put_config(state: web::Data<AppState>, body: web::Json<ConfigUpdateBody>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    let current = state.coordinator.rate_limiter.default_config();
    let capacity = body.burst.unwrap_or(current.capacity);
    let refill_rate = body.requests_per_sec.unwrap_or(current.refill_rate);
    state
        .coordinator
        .rate_limiter
        .set_default_config(BucketConfig { capacity, refill_rate });
    HttpResponse::Ok().json(RateLimitConfigResponse {
        enabled: state.config.rate_limit.enabled,
        capacity,
        refill_rate,
    })
}

#[derive(Serialize)]
struct BucketSummary {
    kind: String,
    identifier: String,
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
}

pub async fn list_buckets(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    let buckets: Vec<BucketSummary> = state
        .coordinator
        .rate_limiter
        .list_buckets()
        .into_iter()
        .map(|((kind, identifier), stats)| BucketSummary {
            kind: kind_label(kind).to_string(),
            identifier,
            tokens: stats.tokens,
            capacity: stats.capacity,
            refill_rate: stats.refill_rate,
        })
        .collect();
    HttpResponse::Ok().json(buckets)
}

fn kind_label(kind: IdentityKind) -> &'static str {
    match kind {
        IdentityKind::Ip => "ip",
        IdentityKind::ApiKey => "apikey",
    }
}

pub async fn reset_bucket(state: web::Data<AppState>, query: web::Query<IdentityQuery>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    match parse_identity(&query) {
        Ok(identity) => {
            state.coordinator.rate_limiter.reset_bucket(&identity);
            HttpResponse::Ok().finish()
        }
        Err(e) => render(&req, &e),
    }
}

pub async fn reset_all(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    state.coordinator.rate_limiter.reset_all();
    HttpResponse::Ok().finish()
}

#[derive(Deserialize)]
pub struct WhitelistBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub identifier: String,
    pub ttl_secs: Option<u64>,
}

pub async fn whitelist_add(state: web::Data<AppState>, body: web::Json<WhitelistBody>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    let kind = match body.kind.as_str() {
        "ip" => IdentityKind::Ip,
        "apikey" => IdentityKind::ApiKey,
        other => {
            return render(&req, &konsul_common::ConError::invalid_argument(format!("unknown identity type '{other}'")));
        }
    };
    let expires_at = body.ttl_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    state
        .coordinator
        .rate_limiter
        .whitelist_add((kind, body.identifier.clone()), expires_at);
    HttpResponse::Ok().finish()
}

pub async fn whitelist_remove(state: web::Data<AppState>, query: web::Query<IdentityQuery>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    match parse_identity(&query) {
        Ok(identity) => {
            state.coordinator.rate_limiter.whitelist_remove(&identity);
            HttpResponse::Ok().finish()
        }
        Err(e) => render(&req, &e),
    }
}

#[derive(Deserialize)]
pub struct BlacklistBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub identifier: String,
    pub ttl_secs: u64,
}

pub async fn blacklist_add(state: web::Data<AppState>, body: web::Json<BlacklistBody>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    let kind = match body.kind.as_str() {
        "ip" => IdentityKind::Ip,
        "apikey" => IdentityKind::ApiKey,
        other => {
            return render(&req, &konsul_common::ConError::invalid_argument(format!("unknown identity type '{other}'")));
        }
    };
    let expires_at = Instant::now() + Duration::from_secs(body.ttl_secs);
    state
        .coordinator
        .rate_limiter
        .blacklist_add((kind, body.identifier.clone()), expires_at);
    HttpResponse::Ok().finish()
}

pub async fn blacklist_remove(state: web::Data<AppState>, query: web::Query<IdentityQuery>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    match parse_identity(&query) {
        Ok(identity) => {
            state.coordinator.rate_limiter.blacklist_remove(&identity);
            HttpResponse::Ok().finish()
        }
        Err(e) => render(&req, &e),
    }
}

#[derive(Deserialize)]
pub struct OverrideBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub identifier: String,
    pub capacity: f64,
    pub refill_rate: f64,
    pub duration_secs: u64,
}

pub async fn override_bucket(state: web::Data<AppState>, body: web::Json<OverrideBody>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    let kind = match body.kind.as_str() {
        "ip" => IdentityKind::Ip,
        "apikey" => IdentityKind::ApiKey,
        other => {
            return render(&req, &konsul_common::ConError::invalid_argument(format!("unknown identity type '{other}'")));
        }
    };
    let now = Instant::now();
    state.coordinator.rate_limiter.override_bucket(
        (kind, body.identifier.clone()),
        BucketConfig {
            capacity: body.capacity,
            refill_rate: body.refill_rate,
        },
        now + Duration::from_secs(body.duration_secs),
        now,
    );
    HttpResponse::Ok().finish()
}

