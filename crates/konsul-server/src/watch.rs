//! `/kv/watch/<pattern>` dispatch: WebSocket session actor and SSE stream
//! (spec §4.5).
//!
//! The WebSocket half is built on `actix-web-actors`' standard
//! `ws::WebsocketContext` idiom, with the ping/pong idle-timeout shape using
//! the same `Instant`-based staleness bookkeeping the rate limiter uses for
//! bucket admission, applied here to connection liveness instead of a token
//! bucket. The SSE half streams `ChangeBus::subscribe`'s receiver through
//! `tokio_stream`.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{HttpRequest, HttpResponse, web};
use actix_web_actors::ws;
use dashmap::DashMap;
use futures::Stream;
use konsul_common::ConError;
use konsul_core::acl::{Capability, ResourceDomain};
use konsul_core::{ChangeEvent, Coordinator, WatcherId};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::auth;
use crate::error_response::render;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Caps concurrent watchers per client (spec §6 `watch.max_per_client`).
/// Client identity is the connecting IP, same scoping the rate limiter uses
/// for unauthenticated callers.
pub struct ClientWatchLimiter {
    counts: DashMap<String, AtomicUsize>,
}

impl ClientWatchLimiter {
    pub fn new() -> Self {
        Self { counts: DashMap::new() }
    }

    pub fn try_acquire(&self, client: &str, max_per_client: usize) -> bool {
        let counter = self.counts.entry(client.to_string()).or_insert_with(|| AtomicUsize::new(0));
        let current = counter.fetch_add(1, Ordering::SeqCst);
        if current >= max_per_client {
            counter.fetch_sub(1, Ordering::SeqCst);
            false
        } else {
            true
        }
    }

    pub fn release(&self, client: &str) {
        if let Some(counter) = self.counts.get(client) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Default for ClientWatchLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn client_id(req: &HttpRequest) -> String {
    req.connection_info().realip_remote_addr().unwrap_or("unknown").to_string()
}

fn validate_pattern(pattern: &str) -> Result<(), ConError> {
    if pattern.is_empty() {
        return Err(ConError::invalid_argument("watch pattern must not be empty"));
    }
    Ok(())
}

/// Builds the watcher's own read predicate, resolved once here from its
/// policy set, to hand to `ChangeBus::subscribe`.
fn build_predicate(
    coordinator: Arc<Coordinator>,
    policies: Vec<String>,
    acl_enabled: bool,
) -> impl Fn(&str) -> bool + Send + Sync + 'static {
    move |key: &str| !acl_enabled || coordinator.acl.test(&policies, ResourceDomain::Kv, key, Capability::Read)
}

/// `GET /kv/watch/<pattern>`: upgrades to WebSocket unless the client asks
/// for `text/event-stream`, per spec §4.5. Pattern/ACL validation and the
/// per-client watch cap are all enforced before any upgrade happens, so
/// rejection always uses the transport's native failure path.
pub async fn watch(req: HttpRequest, stream: web::Payload, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let pattern = path.into_inner();

    if let Err(e) = validate_pattern(&pattern) {
        return render(&req, &e);
    }

    let policies = match auth::resolve_policies(&state, &req) {
        Ok(p) => p,
        Err(e) => return render(&req, &e),
    };

    if state.config.acl.enabled && !state.coordinator.acl.test(&policies, ResourceDomain::Kv, &pattern, Capability::Read) {
        return render(&req, &ConError::Forbidden(format!("no read access to '{pattern}'")));
    }

    let client = client_id(&req);
    if !state.watch_limiter.try_acquire(&client, state.config.watch.max_per_client) {
        return render(&req, &ConError::TooManyWatchers(client));
    }

    let wants_sse = req
        .headers()
        .get(actix_web::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    let predicate = build_predicate(state.coordinator.clone(), policies, state.config.acl.enabled);
    let (id, rx) = state.coordinator.bus.subscribe(pattern.clone(), predicate);

    if wants_sse {
        let body_stream = ReceiverStream::new(rx).map(|event| {
            let json = serde_json::to_string(&event).unwrap_or_default();
            Ok::<_, actix_web::Error>(web::Bytes::from(format!("event: kv-change\ndata: {json}\n\n")))
        });
        let guarded = UnsubscribeOnDrop {
            inner: body_stream,
            id,
            coordinator: state.coordinator.clone(),
            limiter: state.watch_limiter.clone(),
            client,
        };
        return HttpResponse::Ok().content_type("text/event-stream").streaming(guarded);
    }

    let session = WatchSession {
        watcher_id: id,
        rx: Some(rx),
        client,
        coordinator: state.coordinator.clone(),
        watch_limiter: state.watch_limiter.clone(),
        last_heartbeat: Instant::now(),
    };
    match ws::start(session, &req, stream) {
        Ok(resp) => resp,
        Err(e) => {
            state.coordinator.bus.unsubscribe(id);
            state.watch_limiter.release(&client_id(&req));
            HttpResponse::from_error(e)
        }
    }
}

/// Wraps an SSE body stream so the watcher is unregistered and the
/// client's watch-limit slot released as soon as the response stream is
/// dropped (client disconnect or response completion).
struct UnsubscribeOnDrop<St> {
    inner: St,
    id: WatcherId,
    coordinator: Arc<Coordinator>,
    limiter: Arc<ClientWatchLimiter>,
    client: String,
}

impl<St> Stream for UnsubscribeOnDrop<St>
where
    St: Stream + Unpin,
{
    type Item = St::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_next(cx)
    }
}

impl<St> Drop for UnsubscribeOnDrop<St> {
    fn drop(&mut self) {
        self.coordinator.bus.unsubscribe(self.id);
        self.limiter.release(&self.client);
    }
}

/// WebSocket session actor: one per connected watcher. The bus receiver is
/// wired in as an actor stream on `started`, so incoming `ChangeEvent`s and
/// incoming WS frames are multiplexed onto the same actor mailbox.
struct WatchSession {
    watcher_id: WatcherId,
    rx: Option<tokio::sync::mpsc::Receiver<ChangeEvent>>,
    client: String,
    coordinator: Arc<Coordinator>,
    watch_limiter: Arc<ClientWatchLimiter>,
    last_heartbeat: Instant,
}

impl Actor for WatchSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(rx) = self.rx.take() {
            ctx.add_stream(ReceiverStream::new(rx));
        }
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.coordinator.bus.unsubscribe(self.watcher_id);
        self.watch_limiter.release(&self.client);
    }
}

impl StreamHandler<ChangeEvent> for WatchSession {
    fn handle(&mut self, item: ChangeEvent, ctx: &mut Self::Context) {
        if let Ok(json) = serde_json::to_string(&item) {
            ctx.text(json);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WatchSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(bytes)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&bytes);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Text(_)) | Ok(ws::Message::Binary(_)) => {
                // clients never send data on this channel; ignore
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(_) => ctx.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_limiter_rejects_past_cap_and_releases_on_drop() {
        let limiter = ClientWatchLimiter::new();
        assert!(limiter.try_acquire("1.2.3.4", 2));
        assert!(limiter.try_acquire("1.2.3.4", 2));
        assert!(!limiter.try_acquire("1.2.3.4", 2));
        limiter.release("1.2.3.4");
        assert!(limiter.try_acquire("1.2.3.4", 2));
    }

    #[test]
    fn watch_limiter_tracks_clients_independently() {
        let limiter = ClientWatchLimiter::new();
        assert!(limiter.try_acquire("a", 1));
        assert!(limiter.try_acquire("b", 1));
        assert!(!limiter.try_acquire("a", 1));
    }
}
