//! HTTP surface: health check, WebSocket upgrade, CORS and request logging.

use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};

use crate::config::CorsConfig;
use crate::session::Relay;

/// Build the router.
///
/// `log_requests` installs the per-request access log.
pub fn build_router(relay: Relay, ws_path: &str, cors: &CorsConfig, log_requests: bool) -> Router {
    let mut router = Router::new()
        .route("/ping", get(ping_handler))
        .route(ws_path, get(ws_handler))
        .with_state(relay);
    if log_requests {
        router = router.layer(middleware::from_fn(log_request));
    }
    router.layer(cors_layer(cors))
}

async fn ping_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "pong" }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<Relay>) -> impl IntoResponse {
    let limit = relay.connection_config().max_message_size;
    ws.max_message_size(limit)
        .on_failed_upgrade(log_failed_upgrade)
        .on_upgrade(move |socket| async move {
            let report = relay.serve(socket).await;
            if !report.teardown_failures.is_empty() {
                log::warn!(
                    "{}: incomplete teardown {:?}",
                    report.identity,
                    report.teardown_failures
                );
            }
        })
}

fn log_failed_upgrade(error: axum::Error) {
    log::warn!("WebSocket upgrade failed: {error}");
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    log::info!(
        "{method} {path} {} {:?}",
        response.status().as_u16(),
        started.elapsed()
    );
    response
}

/// Translate a [`CorsConfig`] into a layer.
///
/// Browsers reject `*` together with credentials, so wildcards are turned
/// into request mirroring when credentials are allowed.
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let credentials = config.allow_credentials;
    let mut layer = CorsLayer::new();

    layer = if config.allows_any_origin() {
        if credentials {
            layer.allow_origin(AllowOrigin::mirror_request())
        } else {
            layer.allow_origin(Any)
        }
    } else {
        let allowed = config.allow_origins.clone();
        layer.allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &axum::http::request::Parts| {
                origin
                    .to_str()
                    .map(|origin| allowed.iter().any(|a| a.eq_ignore_ascii_case(origin)))
                    .unwrap_or(false)
            },
        ))
    };

    layer = if is_wildcard(&config.allow_methods) {
        if credentials {
            layer.allow_methods(AllowMethods::mirror_request())
        } else {
            layer.allow_methods(Any)
        }
    } else {
        let methods: Vec<Method> = config
            .allow_methods
            .iter()
            .filter_map(|m| parse_or_warn(m, |m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok()))
            .collect();
        layer.allow_methods(methods)
    };

    layer = if is_wildcard(&config.allow_headers) {
        if credentials {
            layer.allow_headers(AllowHeaders::mirror_request())
        } else {
            layer.allow_headers(Any)
        }
    } else {
        layer.allow_headers(header_names(&config.allow_headers))
    };

    if is_wildcard(&config.expose_headers) {
        if credentials {
            log::warn!("CORS: ignoring wildcard expose list with credentials enabled");
        } else {
            layer = layer.expose_headers(Any);
        }
    } else if !config.expose_headers.is_empty() {
        layer = layer.expose_headers(header_names(&config.expose_headers));
    }

    if credentials {
        layer = layer.allow_credentials(true);
    }
    if !config.max_age.is_zero() {
        layer = layer.max_age(config.max_age);
    }
    layer
}

fn is_wildcard(values: &[String]) -> bool {
    values.iter().any(|v| v == "*")
}

fn header_names(values: &[String]) -> Vec<HeaderName> {
    values
        .iter()
        .filter_map(|h| parse_or_warn(h, |h| HeaderName::from_bytes(h.as_bytes()).ok()))
        .collect()
}

fn parse_or_warn<T>(value: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let parsed = parse(value);
    if parsed.is_none() {
        log::warn!("CORS: skipping invalid entry {value:?}");
    }
    parsed
}
