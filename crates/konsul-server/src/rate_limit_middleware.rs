//! Global rate-limit admission, wrapping every route except `public_paths`.
//! A standard `Transform`/`Service` pair with an `EitherBody` left/right
//! split and a 429-with-headers shape on denial. The bucket bookkeeping
//! itself lives in `konsul_core::ratelimit::RateLimiter` rather than a
//! second copy in this middleware, so the admin `/admin/ratelimit/*`
//! endpoints and the HTTP layer observe the exact same bucket state.

use std::rc::Rc;
use std::time::Instant;

use actix_web::body::EitherBody;
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready};
use actix_web::{Error, web};
use futures::future::{LocalBoxFuture, Ready, ok};
use konsul_core::ratelimit::{Identity, IdentityKind, RateLimitDecision};

use crate::state::AppState;

pub struct RateLimitMiddleware;

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimitMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimitMiddlewareService {
            service: Rc::new(service),
        })
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let state = req.app_data::<web::Data<AppState>>().cloned();

        Box::pin(async move {
            let Some(state) = state else {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            };

            if !state.config.rate_limit.enabled || is_public(&state, req.path()) {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            }

            let identity = identity_for(&state, &req);
            match state.coordinator.rate_limiter.check(identity, Instant::now(), 1.0) {
                RateLimitDecision::Allowed => {
                    let res = service.call(req).await?;
                    Ok(res.map_into_left_body())
                }
                RateLimitDecision::Denied { retry_after_secs } => {
                    let err = konsul_common::ConError::RateLimited { retry_after_secs };
                    let response = crate::error_response::render(req.request(), &err);
                    Ok(req.into_response(response).map_into_right_body())
                }
            }
        })
    }
}

fn is_public(state: &AppState, path: &str) -> bool {
    state.config.public_paths.iter().any(|p| p == path)
}

fn identity_for(state: &AppState, req: &ServiceRequest) -> Identity {
    if state.config.rate_limit.by_apikey {
        if let Some(key) = req.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
            return (IdentityKind::ApiKey, key.to_string());
        }
    }
    let ip = {
        let info = req.connection_info();
        info.realip_remote_addr().unwrap_or("unknown").to_string()
    };
    (IdentityKind::Ip, ip)
}
