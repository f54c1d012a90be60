//! `/register`, `/services/*`, `/heartbeat/*`, `/deregister/*` handlers
//! (spec §6), mirroring `http::kv`'s ACL-check-then-handle shape.

use std::collections::{HashMap, HashSet};

use actix_web::{HttpRequest, HttpResponse, web};
use konsul_core::acl::{Capability, ResourceDomain};
use konsul_core::registry::{ServiceEntry, ServiceRegistration};
use serde::{Deserialize, Serialize};

use crate::auth::authorize;
use crate::error_response::render;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RegisterBody {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    pub cas: Option<u64>,
}

#[derive(Deserialize)]
pub struct DeregisterQuery {
    pub cas: Option<u64>,
}

#[derive(Serialize)]
struct ServiceResponse {
    name: String,
    address: String,
    port: u16,
    tags: Vec<String>,
    meta: HashMap<String, String>,
    create_index: u64,
    modify_index: u64,
}

impl From<&ServiceEntry> for ServiceResponse {
    fn from(e: &ServiceEntry) -> Self {
        let mut tags: Vec<String> = e.tags.iter().cloned().collect();
        tags.sort();
        Self {
            name: e.name.clone(),
            address: e.address.clone(),
            port: e.port,
            tags,
            meta: e.meta.clone(),
            create_index: e.create_index,
            modify_index: e.modify_index,
        }
    }
}

pub async fn register(
    state: web::Data<AppState>,
    body: web::Json<RegisterBody>,
    req: HttpRequest,
) -> HttpResponse {
    let capability = if body.cas.is_some() {
        Capability::Update
    } else {
        Capability::Register
    };
    if let Err(e) = authorize(&state, &req, ResourceDomain::Service, &body.name, capability) {
        return render(&req, &e);
    }
    let body = body.into_inner();
    let registration = ServiceRegistration {
        name: body.name,
        address: body.address,
        port: body.port,
        tags: body.tags,
        meta: body.meta,
    };
    match state.coordinator.register_service(registration, body.cas) {
        Ok(entry) => HttpResponse::Ok().json(ServiceResponse::from(&entry)),
        Err(e) => render(&req, &e),
    }
}

pub async fn list_services(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(e) = authorize(&state, &req, ResourceDomain::Service, "", Capability::List) {
        return render(&req, &e);
    }
    let entries: Vec<ServiceResponse> = state.coordinator.registry.list().iter().map(ServiceResponse::from).collect();
    HttpResponse::Ok().json(entries)
}

pub async fn get_service(state: web::Data<AppState>, path: web::Path<String>, req: HttpRequest) -> HttpResponse {
    let name = path.into_inner();
    if let Err(e) = authorize(&state, &req, ResourceDomain::Service, &name, Capability::Read) {
        return render(&req, &e);
    }
    match state.coordinator.registry.get(&name) {
        Ok(entry) => HttpResponse::Ok().json(ServiceResponse::from(&entry)),
        Err(e) => render(&req, &e),
    }
}

pub async fn heartbeat(state: web::Data<AppState>, path: web::Path<String>, req: HttpRequest) -> HttpResponse {
    let name = path.into_inner();
    if let Err(e) = authorize(&state, &req, ResourceDomain::Service, &name, Capability::Update) {
        return render(&req, &e);
    }
    match state.coordinator.heartbeat(&name) {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(e) => render(&req, &e),
    }
}

pub async fn deregister(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<DeregisterQuery>,
    req: HttpRequest,
) -> HttpResponse {
    let name = path.into_inner();
    if let Err(e) = authorize(&state, &req, ResourceDomain::Service, &name, Capability::Deregister) {
        return render(&req, &e);
    }

    let result = match query.cas {
        Some(expected) => state
            .coordinator
            .deregister_service_cas(&name, expected)
            .map(|()| true),
        None => state.coordinator.deregister_service(&name),
    };

    match result {
        Ok(_) => HttpResponse::Ok().finish(),
        Err(e) => render(&req, &e),
    }
}
