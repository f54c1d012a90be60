//! `/acl/policies*` and `/acl/test` admin handlers (spec §4.6/§6).

use actix_web::{HttpRequest, HttpResponse, web};
use konsul_core::acl::{Capability, Policy, ResourceDomain};
use serde::Deserialize;

use crate::auth::authorize;
use crate::error_response::render;
use crate::state::AppState;

fn require_admin(state: &AppState, req: &HttpRequest) -> Result<(), konsul_common::ConError> {
    authorize(state, req, ResourceDomain::Admin, "acl/policies", Capability::Write)
}

pub async fn list_policies(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    HttpResponse::Ok().json(state.coordinator.acl.list_policies())
}

pub async fn get_policy(state: web::Data<AppState>, path: web::Path<String>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    match state.coordinator.acl.get_policy(&path.into_inner()) {
        Some(policy) => HttpResponse::Ok().json(policy),
        None => render(&req, &konsul_common::ConError::not_found("policy not found")),
    }
}

pub async fn put_policy(state: web::Data<AppState>, body: web::Json<Policy>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    state.coordinator.acl.create_policy(body.into_inner());
    HttpResponse::Ok().finish()
}

pub async fn delete_policy(state: web::Data<AppState>, path: web::Path<String>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    if state.coordinator.acl.delete_policy(&path.into_inner()) {
        HttpResponse::Ok().finish()
    } else {
        render(&req, &konsul_common::ConError::not_found("policy not found"))
    }
}

#[derive(Deserialize)]
pub struct AclTestBody {
    pub policies: Vec<String>,
    pub resource: ResourceDomain,
    pub path: String,
    pub capability: Capability,
}

pub async fn test_acl(state: web::Data<AppState>, body: web::Json<AclTestBody>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = require_admin(&state, &req) {
        return render(&req, &e);
    }
    let body = body.into_inner();
    let allowed = state
        .coordinator
        .acl
        .test(&body.policies, body.resource, &body.path, body.capability);
    HttpResponse::Ok().json(serde_json::json!({ "allowed": allowed }))
}
