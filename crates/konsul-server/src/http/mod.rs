//! REST surface wiring (spec §6): `App::new().service(...)` composition,
//! routes grouped by resource.

pub mod acl_routes;
pub mod admin;
pub mod kv;
pub mod services;

use actix_web::{HttpResponse, web};

use crate::watch;

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/kv/").route(web::get().to(kv::list_kv)))
        .service(
            web::resource("/kv/batch")
                .route(web::post().to(kv::batch_set_kv))
                .route(web::delete().to(kv::batch_delete_kv)),
        )
        .service(web::resource("/kv/watch/{pattern:.*}").route(web::get().to(watch::watch)))
        .service(
            web::resource("/kv/{key:.*}")
                .route(web::get().to(kv::get_kv))
                .route(web::put().to(kv::put_kv))
                .route(web::delete().to(kv::delete_kv)),
        )
        .service(web::resource("/register").route(web::put().to(services::register)))
        .service(web::resource("/services/").route(web::get().to(services::list_services)))
        .service(web::resource("/services/{name}").route(web::get().to(services::get_service)))
        .service(web::resource("/heartbeat/{name}").route(web::put().to(services::heartbeat)))
        .service(web::resource("/deregister/{name}").route(web::delete().to(services::deregister)))
        .service(
            web::resource("/acl/policies")
                .route(web::get().to(acl_routes::list_policies))
                .route(web::post().to(acl_routes::put_policy)),
        )
        .service(
            web::resource("/acl/policies/{name}")
                .route(web::get().to(acl_routes::get_policy))
                .route(web::put().to(acl_routes::put_policy))
                .route(web::delete().to(acl_routes::delete_policy)),
        )
        .service(web::resource("/acl/test").route(web::post().to(acl_routes::test_acl)))
        .service(
            web::resource("/admin/ratelimit/config")
                .route(web::get().to(admin::get_config))
                .route(web::put().to(admin::put_config)),
        )
        .service(web::resource("/admin/ratelimit/buckets").route(web::get().to(admin::list_buckets)))
        .service(web::resource("/admin/ratelimit/reset").route(web::post().to(admin::reset_bucket)))
        .service(web::resource("/admin/ratelimit/reset-all").route(web::post().to(admin::reset_all)))
        .service(
            web::resource("/admin/ratelimit/whitelist")
                .route(web::post().to(admin::whitelist_add))
                .route(web::delete().to(admin::whitelist_remove)),
        )
        .service(
            web::resource("/admin/ratelimit/blacklist")
                .route(web::post().to(admin::blacklist_add))
                .route(web::delete().to(admin::blacklist_remove)),
        )
        .service(web::resource("/admin/ratelimit/override").route(web::post().to(admin::override_bucket)));
}
