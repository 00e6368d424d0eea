//! Template engine for dynamic response and reply bodies.
//!
//! Uses Handlebars. HTTP responses render with the request context; broker
//! auto-replies render with the inbound message context.

use crate::matcher::MatchContext;
use crate::transport::InboundMessage;
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::HashMap;

/// Template engine for rendering dynamic bodies.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Context for rendering an HTTP response body.
#[derive(Debug, Serialize)]
struct HttpContext {
    /// Request method
    method: String,
    /// Request path
    path: String,
    /// Request headers
    headers: HashMap<String, String>,
    /// Query parameters
    query: HashMap<String, String>,
    /// Capture groups of a pattern path
    captures: HashMap<String, String>,
    /// Request body (as string, if text)
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    /// Request body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    json: Option<serde_json::Value>,
}

/// Context for rendering a broker auto-reply body.
#[derive(Serialize)]
struct ReplyContext<'a> {
    message: MessageView<'a>,
    /// Inbound body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    json: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct MessageView<'a> {
    body: &'a str,
    routing_key: &'a str,
    correlation_id: Option<&'a str>,
    reply_to: Option<&'a str>,
    headers: &'a HashMap<String, String>,
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Not rendering HTML, keep output verbatim.
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a template string with an HTTP request context.
    pub fn render_http(
        &self,
        template: &str,
        match_ctx: &MatchContext,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        body: Option<&[u8]>,
    ) -> Result<String, handlebars::RenderError> {
        let ctx = http_context(match_ctx, method, path, headers, body);
        self.handlebars.render_template(template, &ctx)
    }

    /// Render a JSON value with templates in its string fields, using an
    /// HTTP request context.
    pub fn render_http_json(
        &self,
        value: &serde_json::Value,
        match_ctx: &MatchContext,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        body: Option<&[u8]>,
    ) -> Result<serde_json::Value, handlebars::RenderError> {
        let ctx = http_context(match_ctx, method, path, headers, body);
        self.render_json_value(value, &ctx)
    }

    /// Render a reply body with the inbound message as context.
    pub fn render_reply(
        &self,
        template: &str,
        message: &InboundMessage,
    ) -> Result<String, handlebars::RenderError> {
        let ctx = ReplyContext {
            message: MessageView {
                body: &message.body,
                routing_key: &message.routing_key,
                correlation_id: message.correlation_id.as_deref(),
                reply_to: message.reply_to.as_deref(),
                headers: &message.headers,
            },
            json: serde_json::from_str(&message.body).ok(),
        };
        self.handlebars.render_template(template, &ctx)
    }

    fn render_json_value<T: Serialize>(
        &self,
        value: &serde_json::Value,
        ctx: &T,
    ) -> Result<serde_json::Value, handlebars::RenderError> {
        match value {
            serde_json::Value::String(s) => {
                if s.contains("{{") {
                    let rendered = self.handlebars.render_template(s, ctx)?;
                    Ok(serde_json::Value::String(rendered))
                } else {
                    Ok(value.clone())
                }
            }
            serde_json::Value::Array(arr) => {
                let rendered: Result<Vec<_>, _> = arr
                    .iter()
                    .map(|v| self.render_json_value(v, ctx))
                    .collect();
                Ok(serde_json::Value::Array(rendered?))
            }
            serde_json::Value::Object(obj) => {
                let mut rendered = serde_json::Map::new();
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_json_value(v, ctx)?);
                }
                Ok(serde_json::Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn http_context(
    match_ctx: &MatchContext,
    method: &str,
    path: &str,
    headers: &HashMap<String, String>,
    body: Option<&[u8]>,
) -> HttpContext {
    let body_str = body
        .and_then(|b| std::str::from_utf8(b).ok())
        .map(String::from);
    let json = body_str.as_ref().and_then(|s| serde_json::from_str(s).ok());

    HttpContext {
        method: method.to_string(),
        path: path.to_string(),
        headers: headers.clone(),
        query: match_ctx.query_params.clone(),
        captures: match_ctx.captures.clone(),
        body: body_str,
        json,
    }
}

// Custom Handlebars helpers

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let uuid = format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffffffffffff,
    );
    out.write(&uuid)?;
    Ok(())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use chrono::Utc;

    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    let now = Utc::now();
    out.write(&now.format(format).to_string())?;
    Ok(())
}

fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let min = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let max = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);

    let mut rng = rand::thread_rng();
    let value = rng.gen_range(min..=max);
    out.write(&value.to_string())?;
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}
