//! HTTP serving surface.
//!
//! A single catch-all handler: every request runs through the matching
//! engine and gets either the selected rule's response or a diagnostic
//! 404. Declared delays are slept here, not in the engine.

use crate::config::{ResponseBody, SimulatorConfig};
use crate::journal::{ExchangeJournal, ExchangeRecord};
use crate::matcher::{parse_query_string, MatchOutcome, Matcher};
use crate::template::TemplateEngine;
use anyhow::Context;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Request bodies past this size are rejected outright.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Shared state behind the catch-all route.
#[derive(Clone)]
pub struct HttpSimulator {
    config: Arc<SimulatorConfig>,
    matcher: Arc<Matcher>,
    templates: Arc<TemplateEngine>,
    journal: Arc<ExchangeJournal>,
}

impl HttpSimulator {
    pub fn new(
        config: Arc<SimulatorConfig>,
        templates: Arc<TemplateEngine>,
        journal: Arc<ExchangeJournal>,
    ) -> Self {
        let matcher = Arc::new(Matcher::new(&config.endpoints));
        Self {
            config,
            matcher,
            templates,
            journal,
        }
    }

    pub fn router(self) -> Router {
        Router::new().fallback(handle_request).with_state(self)
    }
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    listen: SocketAddr,
    sim: HttpSimulator,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    info!(address = %listen, "http simulator listening");
    axum::serve(
        listener,
        sim.router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("http server terminated")?;
    Ok(())
}

async fn handle_request(State(sim): State<HttpSimulator>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let client = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string());
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(%error, "request body rejected");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let method = parts.method.as_str().to_string();
    let path = parts.uri.path().to_string();
    let query_params = parse_query_string(parts.uri.query().unwrap_or(""));
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    let body_text = if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    };

    let mut record = ExchangeRecord::http(&method, &path);
    record.client = client;
    record.request_headers = headers.clone();
    record.query_params = query_params.clone();
    record.request_body = body_text.clone();

    let outcome = sim.matcher.resolve(
        &sim.config.endpoints,
        &method,
        &path,
        &query_params,
        &headers,
        body_text.as_deref(),
    );

    let response = match outcome {
        Some(outcome) => {
            info!(
                method = %method,
                path = %path,
                endpoint = %outcome.endpoint.name,
                rule = outcome.rule.name.as_deref().unwrap_or("-"),
                "request matched"
            );
            record.endpoint = Some(outcome.endpoint.name.clone());
            record.rule = outcome.rule.name.clone();
            record.matched = true;
            let (response, response_body) =
                respond_matched(&sim, &outcome, &method, &path, &headers, Some(&bytes)).await;
            record.response_body = response_body;
            response
        }
        None => {
            info!(method = %method, path = %path, "no endpoint matched");
            no_match_response(&method, &path)
        }
    };

    record.status = Some(response.status().as_u16());
    sim.journal.record(record).await;
    response
}

/// Build the matched response. Also returns the body text for the journal
/// when it is valid UTF-8.
async fn respond_matched(
    sim: &HttpSimulator,
    outcome: &MatchOutcome<'_>,
    method: &str,
    path: &str,
    headers: &HashMap<String, String>,
    request_body: Option<&[u8]>,
) -> (Response, Option<String>) {
    let response = &outcome.rule.response;
    if response.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(response.delay_ms)).await;
    }

    let payload = match response_bytes(
        &sim.templates,
        outcome,
        method,
        path,
        headers,
        request_body,
    ) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(endpoint = %outcome.endpoint.name, %error, "response body failed");
            return (StatusCode::INTERNAL_SERVER_ERROR.into_response(), None);
        }
    };

    let mut builder = Response::builder().status(response.status);
    let mut has_content_type = false;
    for (name, value) in &response.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(header_name), Ok(header_value)) => {
                has_content_type |= header_name == header::CONTENT_TYPE;
                builder = builder.header(header_name, header_value);
            }
            _ => warn!(header = %name, "invalid response header, skipping"),
        }
    }

    let (body, body_text) = match payload {
        Some((bytes, content_type)) => {
            if !has_content_type {
                builder = builder.header(header::CONTENT_TYPE, content_type);
            }
            let text = std::str::from_utf8(&bytes).ok().map(String::from);
            (Body::from(bytes), text)
        }
        None => (Body::empty(), None),
    };

    match builder.body(body) {
        Ok(response) => (response, body_text),
        Err(error) => {
            warn!(%error, "response build failed");
            (StatusCode::INTERNAL_SERVER_ERROR.into_response(), None)
        }
    }
}

/// Assemble the response body, rendering templates when the rule asks for
/// it. A render failure falls back to the body verbatim; only an
/// undecodable body is an error.
fn response_bytes(
    templates: &TemplateEngine,
    outcome: &MatchOutcome<'_>,
    method: &str,
    path: &str,
    headers: &HashMap<String, String>,
    request_body: Option<&[u8]>,
) -> anyhow::Result<Option<(Vec<u8>, &'static str)>> {
    let response = &outcome.rule.response;
    let body = match &response.body {
        Some(body) => body,
        None => return Ok(None),
    };
    let content_type = body.content_type();

    if response.template {
        let rendered: anyhow::Result<Vec<u8>> = match body {
            ResponseBody::Text { content } => templates
                .render_http(content, &outcome.context, method, path, headers, request_body)
                .map(String::into_bytes)
                .map_err(anyhow::Error::from),
            ResponseBody::Json { content } => templates
                .render_http_json(content, &outcome.context, method, path, headers, request_body)
                .map_err(anyhow::Error::from)
                .and_then(|value| serde_json::to_vec(&value).map_err(anyhow::Error::from)),
            // Binary bodies are never templated.
            ResponseBody::Base64 { .. } => return Ok(Some((body.to_bytes()?, content_type))),
        };
        match rendered {
            Ok(bytes) => return Ok(Some((bytes, content_type))),
            Err(error) => {
                warn!(
                    endpoint = %outcome.endpoint.name,
                    %error,
                    "template render failed, serving body verbatim"
                );
            }
        }
    }

    Ok(Some((body.to_bytes()?, content_type)))
}

fn no_match_response(method: &str, path: &str) -> Response {
    let body = json!({
        "error": "no_match",
        "message": format!("no endpoint matched {} {}", method, path),
    });
    match Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
    {
        Ok(response) => response,
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
