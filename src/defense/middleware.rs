use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, request::Parts, HeaderMap, Method, Request},
    middleware::Next,
    response::Response,
};

use super::{detector::is_multipart, ClientInfo, Payload, RequestDescriptor};
use crate::{
    env::PayloadLimits,
    error::{Error, Result},
    parameters::defaults,
    response,
    session::Principal,
    state::AppState,
};

/// First hop of `X-Forwarded-For`, else the socket peer.
pub fn client_ip<B>(req: &Request<B>) -> Result<String> {
    let forwarded = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return Ok(ip.to_string());
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .ok_or_else(|| Error::Validation("unable to determine client address".to_string()))
}

pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.parse().ok())
}

/// Byte budget for a request body. Multipart bodies may carry an upload of
/// up to `IMAGE_MAX_SIZE` megabytes on top of the regular limit.
async fn body_limit(state: &AppState, headers: &HeaderMap) -> Result<usize> {
    let limit = state.env.limits.max_body_bytes;
    let multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .is_some_and(is_multipart);
    if !multipart {
        return Ok(limit);
    }

    let upload_mb = state.parameters.get_u64(defaults::IMAGE_MAX_SIZE).await?;
    Ok(limit.saturating_add(usize::try_from(upload_mb).unwrap_or(usize::MAX).saturating_mul(1024 * 1024)))
}

/// Buffers a POST body so its fields can be inspected, and hands back a body
/// the view can still read.
async fn read_payload(
    parts: &Parts,
    body: Body,
    limits: &PayloadLimits,
    body_limit: usize,
) -> (Payload, Body) {
    if declared_length(&parts.headers).is_some_and(|len| len > body_limit) {
        return (
            Payload::Malformed("declared body over the limit".to_string()),
            Body::empty(),
        );
    }
    if parts.method != Method::POST {
        return (Payload::Empty, body);
    }

    match axum::body::to_bytes(body, body_limit).await {
        Ok(bytes) => {
            let content_type = parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|h| h.to_str().ok());
            let payload = Payload::read(content_type, bytes.clone(), limits).await;
            (payload, Body::from(bytes))
        }
        Err(e) => (
            Payload::Malformed(format!("unreadable body: {e}")),
            Body::empty(),
        ),
    }
}

pub async fn client_defense_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response> {
    let ip = client_ip(&req)?;
    let client = ClientInfo::new(&ip, &user_agent(req.headers())).with_username(
        req.extensions()
            .get::<Principal>()
            .map(|principal| principal.username.clone()),
    );

    let limit = body_limit(&state, req.headers()).await?;
    let (parts, body) = req.into_parts();
    let (payload, body) = read_payload(&parts, body, &state.env.limits, limit).await;
    let descriptor = RequestDescriptor {
        client,
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        payload,
    };

    let verdict = state.defense.inspect(&descriptor).await?;
    if let Some(short_circuit) = response::from_verdict(verdict) {
        return Ok(short_circuit);
    }

    let mut req = Request::from_parts(parts, body);
    req.extensions_mut().insert(descriptor.client.clone());
    let response = next.run(req).await;

    let verdict = state
        .defense
        .review(&descriptor.client, &descriptor.path)
        .await?;
    Ok(response::from_verdict(verdict).unwrap_or(response))
}
