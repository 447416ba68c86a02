//! Control API (HTTP + JSON, basic auth).
//!
//! CRUD over configuration objects mutates the stored document; data-plane
//! changes take effect on `POST /config/reload`. Prometheus metrics are
//! exposed at `/metrics`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tracing::info;

use crate::config::{ApiConfig, IngressConfig, ResolverConfig};
use crate::error::Result;

use super::Runtime;

pub const ERR_CODE_INVALID: i32 = 40001;
pub const ERR_CODE_DUP: i32 = 40002;
pub const ERR_CODE_NOT_FOUND: i32 = 40401;
pub const ERR_CODE_FAILED: i32 = 50001;

#[derive(Serialize)]
struct ApiResponse {
    code: i32,
    msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

fn ok(data: Option<serde_json::Value>) -> Response {
    (
        StatusCode::OK,
        Json(ApiResponse {
            code: 0,
            msg: "OK".into(),
            data,
        }),
    )
        .into_response()
}

fn fail(status: StatusCode, code: i32, msg: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }),
    )
        .into_response()
}

#[derive(Clone)]
struct ApiState {
    runtime: Arc<Runtime>,
    auth: Option<(String, String)>,
}

/// Serve the control API until the process exits.
pub async fn serve_api(runtime: Arc<Runtime>, config: ApiConfig) -> Result<()> {
    let state = ApiState {
        runtime,
        auth: config.auth.as_ref().map(|a| (a.username.clone(), a.password.clone())),
    };

    let router = Router::new()
        .route("/metrics", get(metrics))
        .route("/config", get(get_config))
        .route("/config/reload", post(reload))
        .route("/config/ingresses", get(list_ingresses).post(create_ingress))
        .route(
            "/config/ingresses/:name",
            get(get_ingress).put(update_ingress).delete(delete_ingress),
        )
        .route("/config/resolvers", get(list_resolvers).post(create_resolver))
        .route(
            "/config/resolvers/:name",
            get(get_resolver).put(update_resolver).delete(delete_resolver),
        )
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("api listening on {}", config.listen);
    axum::serve(listener, router)
        .await
        .map_err(|e| crate::error::Error::Io(e))?;
    Ok(())
}

async fn basic_auth(
    State(state): State<ApiState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let Some((user, pass)) = &state.auth else {
        return next.run(request).await;
    };

    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| BASE64.decode(v.trim()).ok())
        .map(|decoded| {
            let expected = format!("{}:{}", user, pass);
            decoded == expected.as_bytes()
        })
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"api\"")],
        )
            .into_response();
    }
    next.run(request).await
}

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let families = crate::metrics::REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            ERR_CODE_FAILED,
            "metrics encoding failed",
        );
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buf,
    )
        .into_response()
}

async fn get_config(State(state): State<ApiState>) -> Response {
    match serde_json::to_value(state.runtime.config()) {
        Ok(value) => ok(Some(value)),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, ERR_CODE_FAILED, e.to_string()),
    }
}

async fn reload(State(state): State<ApiState>) -> Response {
    match state.runtime.reload() {
        Ok(()) => ok(None),
        // the previous config stays active on failure
        Err(e) => fail(StatusCode::BAD_REQUEST, ERR_CODE_INVALID, e.to_string()),
    }
}

async fn list_ingresses(State(state): State<ApiState>) -> Response {
    let list = state.runtime.config().ingresses;
    ok(serde_json::to_value(list).ok())
}

async fn get_ingress(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state
        .runtime
        .config()
        .ingresses
        .into_iter()
        .find(|i| i.name == name)
    {
        Some(ingress) => ok(serde_json::to_value(ingress).ok()),
        None => fail(StatusCode::NOT_FOUND, ERR_CODE_NOT_FOUND, "ingress not found"),
    }
}

async fn create_ingress(
    State(state): State<ApiState>,
    Json(ingress): Json<IngressConfig>,
) -> Response {
    if ingress.name.is_empty() {
        return fail(StatusCode::BAD_REQUEST, ERR_CODE_INVALID, "name is required");
    }
    if state
        .runtime
        .config()
        .ingresses
        .iter()
        .any(|i| i.name == ingress.name)
    {
        return fail(StatusCode::BAD_REQUEST, ERR_CODE_DUP, "ingress already exists");
    }
    state.runtime.set_config(|c| c.ingresses.push(ingress));
    ok(None)
}

async fn update_ingress(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(mut ingress): Json<IngressConfig>,
) -> Response {
    ingress.name = name.clone();
    let mut found = false;
    state.runtime.set_config(|c| {
        if let Some(existing) = c.ingresses.iter_mut().find(|i| i.name == name) {
            *existing = ingress;
            found = true;
        }
    });
    if found {
        ok(None)
    } else {
        fail(StatusCode::NOT_FOUND, ERR_CODE_NOT_FOUND, "ingress not found")
    }
}

async fn delete_ingress(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let mut found = false;
    state.runtime.set_config(|c| {
        let before = c.ingresses.len();
        c.ingresses.retain(|i| i.name != name);
        found = c.ingresses.len() != before;
    });
    if found {
        ok(None)
    } else {
        fail(StatusCode::NOT_FOUND, ERR_CODE_NOT_FOUND, "ingress not found")
    }
}

async fn list_resolvers(State(state): State<ApiState>) -> Response {
    let list = state.runtime.config().resolvers;
    ok(serde_json::to_value(list).ok())
}

async fn get_resolver(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state
        .runtime
        .config()
        .resolvers
        .into_iter()
        .find(|r| r.name == name)
    {
        Some(resolver) => ok(serde_json::to_value(resolver).ok()),
        None => fail(StatusCode::NOT_FOUND, ERR_CODE_NOT_FOUND, "resolver not found"),
    }
}

async fn create_resolver(
    State(state): State<ApiState>,
    Json(resolver): Json<ResolverConfig>,
) -> Response {
    if resolver.name.is_empty() {
        return fail(StatusCode::BAD_REQUEST, ERR_CODE_INVALID, "name is required");
    }
    if state
        .runtime
        .config()
        .resolvers
        .iter()
        .any(|r| r.name == resolver.name)
    {
        return fail(StatusCode::BAD_REQUEST, ERR_CODE_DUP, "resolver already exists");
    }
    state.runtime.set_config(|c| c.resolvers.push(resolver));
    ok(None)
}

async fn update_resolver(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(mut resolver): Json<ResolverConfig>,
) -> Response {
    resolver.name = name.clone();
    let mut found = false;
    state.runtime.set_config(|c| {
        if let Some(existing) = c.resolvers.iter_mut().find(|r| r.name == name) {
            *existing = resolver;
            found = true;
        }
    });
    if found {
        ok(None)
    } else {
        fail(StatusCode::NOT_FOUND, ERR_CODE_NOT_FOUND, "resolver not found")
    }
}

async fn delete_resolver(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let mut found = false;
    state.runtime.set_config(|c| {
        let before = c.resolvers.len();
        c.resolvers.retain(|r| r.name != name);
        found = c.resolvers.len() != before;
    });
    if found {
        ok(None)
    } else {
        fail(StatusCode::NOT_FOUND, ERR_CODE_NOT_FOUND, "resolver not found")
    }
}
