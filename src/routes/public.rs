use std::collections::HashMap;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tracing::{error, warn};

use super::AppState;
use crate::rate_limit::RateDecision;

const CACHE_CONTROL_PUBLIC: &str = "public, max-age=15, s-maxage=30";
const DEPRECATION_NOTICE: &str = "unversioned /public/* is deprecated; use /public/v1/*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiVersion {
    Legacy,
    V1,
    V2,
}

impl ApiVersion {
    fn label(self) -> &'static str {
        match self {
            ApiVersion::V2 => "v2",
            _ => "v1",
        }
    }
}

/// Single entry point for the public read API.
///
/// Pipeline: origin policy, method gate, rate limit, version resolution,
/// dispatch, envelope. Every response (including errors) carries the CORS
/// headers computed up front and `X-API-Default-Version`.
pub async fn public_entry(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let (allow_origin, origin_ok) = resolve_origin(&state.config.allowed_origins, origin);
    let mut reply = Reply { allow_origin, rate: None };

    if !origin_ok {
        return reply.json(
            StatusCode::FORBIDDEN,
            json!({"ok": false, "error": "origin not allowed"}),
        );
    }
    if method == Method::OPTIONS {
        return reply.empty(StatusCode::NO_CONTENT);
    }
    if method != Method::GET {
        return reply.json(
            StatusCode::METHOD_NOT_ALLOWED,
            json!({"ok": false, "error": "method not allowed"}),
        );
    }

    let ip = client_ip(&headers);
    let decision = state.limiter.check(&ip);
    reply.rate = Some(decision);
    if !decision.allowed {
        warn!(client = %ip, "public api rate limit exceeded");
        return reply.json(
            StatusCode::TOO_MANY_REQUESTS,
            json!({"ok": false, "error": "rate limit exceeded"}),
        );
    }

    let (version, op) = split_version(&path);
    let (data, meta_extras) = match dispatch(&state, version, op, &params).await {
        Some(Ok(pair)) => pair,
        Some(Err(e)) => {
            error!(endpoint = op, error = %format!("{e:#}"), "public api upstream error");
            return reply.json(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"ok": false, "error": "upstream error"}),
            );
        }
        None => {
            return reply.json(StatusCode::NOT_FOUND, json!({"ok": false, "error": "not found"}));
        }
    };

    let body = match version {
        ApiVersion::Legacy => legacy_body(data, meta_extras),
        versioned => enveloped_body(versioned, op, data, meta_extras),
    };
    let mut resp = reply.json(StatusCode::OK, body);
    let h = resp.headers_mut();
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_PUBLIC));
    if version == ApiVersion::Legacy {
        h.insert("x-api-deprecated", HeaderValue::from_static(DEPRECATION_NOTICE));
    }
    resp
}

/// One database read per operation; `None` means unknown route.
async fn dispatch(
    state: &AppState,
    version: ApiVersion,
    op: &str,
    params: &HashMap<String, String>,
) -> Option<Result<(Value, Map<String, Value>)>> {
    let db = &state.db;
    let result = match op {
        "metrics" => db.presale_metrics().await.map(|data| (data, Map::new())),
        "daily" => {
            let default = if version == ApiVersion::V2 { 90 } else { 30 };
            let days = clamped_param(params.get("days"), default, 1, 365);
            let call = if version == ApiVersion::V2 {
                db.daily_stats_extended(days).await
            } else {
                db.daily_stats(days).await
            };
            call.map(|data| (data, extras(&[("days", json!(days))])))
        }
        "wallets" => db.wallet_distribution().await.map(|data| (data, Map::new())),
        "batches" => match (version, params.get("id")) {
            // Presence of `id` switches v2 to the single-batch drill-down.
            (ApiVersion::V2, Some(id)) => db
                .batch_detail(id)
                .await
                .map(|data| (data, extras(&[("batch_id", json!(id))]))),
            _ => {
                let limit = clamped_param(params.get("limit"), 10, 1, 50);
                db.recent_batches(limit)
                    .await
                    .map(|data| (data, extras(&[("limit", json!(limit))])))
            }
        },
        "changelog" => {
            let limit = clamped_param(params.get("limit"), 20, 1, 100);
            db.changelog(limit)
                .await
                .map(|data| (data, extras(&[("limit", json!(limit))])))
        }
        _ => return None,
    };
    Some(result)
}

fn enveloped_body(version: ApiVersion, op: &str, data: Value, meta_extras: Map<String, Value>) -> Value {
    let mut meta = Map::new();
    meta.insert(
        "generated_at".to_string(),
        json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    meta.insert("endpoint".to_string(), json!(op));
    meta.extend(meta_extras);
    json!({"ok": true, "version": version.label(), "meta": meta, "data": data})
}

/// Pre-versioning consumers get the op parameters at the top level and no
/// `version`/`meta` keys. Kept distinct on purpose; see DESIGN.md.
fn legacy_body(data: Value, meta_extras: Map<String, Value>) -> Value {
    let mut body = Map::new();
    body.insert("ok".to_string(), json!(true));
    body.extend(meta_extras);
    body.insert("data".to_string(), data);
    Value::Object(body)
}

fn extras(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn split_version(path: &str) -> (ApiVersion, &str) {
    let path = path.trim_matches('/');
    match path.split_once('/') {
        Some(("v1", rest)) => (ApiVersion::V1, rest),
        Some(("v2", rest)) => (ApiVersion::V2, rest),
        _ => (ApiVersion::Legacy, path),
    }
}

/// Parse-then-clamp; absent or non-numeric values fall back to the default.
fn clamped_param(raw: Option<&String>, default: i64, min: i64, max: i64) -> i64 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

/// CDN-supplied real IP first, then the first forwarded hop, else a
/// sentinel that throttles all unattributable traffic together.
fn client_ip(headers: &HeaderMap) -> String {
    if let Some(ip) = headers.get("cf-connecting-ip").and_then(|v| v.to_str().ok()) {
        let ip = ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    "unknown".to_string()
}

/// Returns the Allow-Origin value to attach and whether the request passes
/// the allow-list. An empty list reflects `*`; a present-but-unlisted
/// Origin is rejected.
fn resolve_origin(allowed: &[String], origin: Option<&str>) -> (String, bool) {
    if allowed.is_empty() {
        return ("*".to_string(), true);
    }
    match origin {
        None => (allowed[0].clone(), true),
        Some(o) if allowed.iter().any(|a| a == o) => (o.to_string(), true),
        Some(_) => (allowed[0].clone(), false),
    }
}

struct Reply {
    allow_origin: String,
    rate: Option<RateDecision>,
}

impl Reply {
    fn json(&self, status: StatusCode, body: Value) -> Response {
        let mut resp = (status, Json(body)).into_response();
        self.decorate(&mut resp);
        resp
    }

    fn empty(&self, status: StatusCode) -> Response {
        let mut resp = status.into_response();
        self.decorate(&mut resp);
        resp
    }

    fn decorate(&self, resp: &mut Response) {
        let h = resp.headers_mut();
        h.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_str(&self.allow_origin).unwrap_or(HeaderValue::from_static("*")),
        );
        h.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, OPTIONS"),
        );
        h.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        );
        h.insert(header::VARY, HeaderValue::from_static("Origin"));
        h.insert("x-api-default-version", HeaderValue::from_static("v1"));
        if let Some(rate) = self.rate {
            h.insert("x-ratelimit-limit", num_header(rate.limit as i64));
            h.insert("x-ratelimit-remaining", num_header(rate.remaining as i64));
            h.insert("x-ratelimit-reset", num_header(rate.reset_epoch_secs()));
        }
    }
}

fn num_header(n: i64) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).unwrap_or(HeaderValue::from_static("0"))
}
