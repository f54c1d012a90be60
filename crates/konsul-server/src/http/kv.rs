//! `/kv/*` handlers (spec §6): ACL check before touching the store,
//! `web::Query` for optional params, base64-encoded values in the JSON
//! body, `HttpResponse` builder with explicit content type.

use actix_web::{HttpRequest, HttpResponse, web};
use base64::Engine;
use konsul_core::KvEntry;
use konsul_core::acl::{Capability, ResourceDomain};
use konsul_core::kv::BatchSetItem;
use serde::{Deserialize, Serialize};

use crate::auth::authorize;
use crate::error_response::render;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct GetQuery {
    #[serde(default)]
    pub metadata: bool,
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: String,
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    pub cas: Option<u64>,
}

#[derive(Deserialize)]
pub struct PutBody {
    pub value: String,
    #[serde(default)]
    pub flags: u64,
    pub cas: Option<u64>,
}

#[derive(Serialize)]
struct KvResponse {
    key: String,
    value: String,
    create_index: u64,
    modify_index: u64,
    flags: u64,
}

impl KvResponse {
    fn from_entry(key: &str, entry: &KvEntry) -> Self {
        Self {
            key: key.to_string(),
            value: base64::engine::general_purpose::STANDARD.encode(&entry.value),
            create_index: entry.create_index,
            modify_index: entry.modify_index,
            flags: entry.flags,
        }
    }
}

pub async fn get_kv(
    state: web::Data<AppState>,
    path: web::Path<String>,
    _query: web::Query<GetQuery>,
    req: HttpRequest,
) -> HttpResponse {
    let key = path.into_inner();
    if let Err(e) = authorize(&state, &req, ResourceDomain::Kv, &key, Capability::Read) {
        return render(&req, &e);
    }
    match state.coordinator.kv.get(&key) {
        Ok(entry) => HttpResponse::Ok().json(KvResponse::from_entry(&key, &entry)),
        Err(e) => render(&req, &e),
    }
}

pub async fn list_kv(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
    req: HttpRequest,
) -> HttpResponse {
    if let Err(e) = authorize(&state, &req, ResourceDomain::Kv, &query.prefix, Capability::List) {
        return render(&req, &e);
    }
    let keys = state.coordinator.kv.list(&query.prefix);
    HttpResponse::Ok().json(keys)
}

pub async fn put_kv(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<PutBody>,
    req: HttpRequest,
) -> HttpResponse {
    let key = path.into_inner();
    let capability = if body.cas.is_some() {
        Capability::Update
    } else {
        Capability::Write
    };
    if let Err(e) = authorize(&state, &req, ResourceDomain::Kv, &key, capability) {
        return render(&req, &e);
    }
    let value = match base64::engine::general_purpose::STANDARD.decode(&body.value) {
        Ok(v) => v,
        Err(_) => {
            let e = konsul_common::ConError::invalid_argument("value must be base64-encoded");
            return render(&req, &e);
        }
    };

    let result = match body.cas {
        Some(expected) => state.coordinator.kv_set_cas(key.clone(), value, expected, body.flags),
        None => state.coordinator.kv_set(key.clone(), value, body.flags),
    };

    match result {
        Ok(entry) => HttpResponse::Ok().json(KvResponse::from_entry(&key, &entry)),
        Err(e) => render(&req, &e),
    }
}

pub async fn delete_kv(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<DeleteQuery>,
    req: HttpRequest,
) -> HttpResponse {
    let key = path.into_inner();
    if let Err(e) = authorize(&state, &req, ResourceDomain::Kv, &key, Capability::Delete) {
        return render(&req, &e);
    }

    let result = match query.cas {
        Some(expected) => state.coordinator.kv_delete_cas(&key, expected).map(|_| true),
        None => state.coordinator.kv_delete(&key),
    };

    match result {
        Ok(_) => HttpResponse::Ok().finish(),
        Err(e) => render(&req, &e),
    }
}

#[derive(Deserialize)]
pub struct BatchSetEntry {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub flags: u64,
    pub cas: Option<u64>,
}

#[derive(Deserialize)]
pub struct BatchSetBody {
    pub items: Vec<BatchSetEntry>,
}

pub async fn batch_set_kv(
    state: web::Data<AppState>,
    body: web::Json<BatchSetBody>,
    req: HttpRequest,
) -> HttpResponse {
    for item in &body.items {
        if let Err(e) = authorize(&state, &req, ResourceDomain::Kv, &item.key, Capability::Write) {
            return render(&req, &e);
        }
    }
    let mut items = Vec::with_capacity(body.items.len());
    for item in &body.items {
        let value = match base64::engine::general_purpose::STANDARD.decode(&item.value) {
            Ok(v) => v,
            Err(_) => {
                let e = konsul_common::ConError::invalid_argument("value must be base64-encoded");
                return render(&req, &e);
            }
        };
        items.push(BatchSetItem {
            key: item.key.clone(),
            value,
            flags: item.flags,
            cas: item.cas,
        });
    }
    match state.coordinator.kv_batch_set(items) {
        Ok(count) => HttpResponse::Ok().json(serde_json::json!({ "applied": count })),
        Err(e) => render(&req, &e),
    }
}

#[derive(Deserialize)]
pub struct BatchDeleteBody {
    pub keys: Vec<String>,
    pub cas: Option<Vec<u64>>,
}

pub async fn batch_delete_kv(
    state: web::Data<AppState>,
    body: web::Json<BatchDeleteBody>,
    req: HttpRequest,
) -> HttpResponse {
    for key in &body.keys {
        if let Err(e) = authorize(&state, &req, ResourceDomain::Kv, key, Capability::Delete) {
            return render(&req, &e);
        }
    }
    let body = body.into_inner();
    match state.coordinator.kv_batch_delete(body.keys, body.cas) {
        Ok(count) => HttpResponse::Ok().json(serde_json::json!({ "applied": count })),
        Err(e) => render(&req, &e),
    }
}
