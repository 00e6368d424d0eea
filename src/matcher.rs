//! Request matching engine.
//!
//! Selects a response rule for an incoming HTTP request: the first enabled
//! endpoint accepting the method and path becomes the candidate, then its
//! rules are evaluated in priority order (highest first, ties keep file
//! order) and the first rule whose criteria all hold wins. No match is a
//! normal outcome, not an error.

use crate::config::{EndpointConfig, Protocol, ResponseRule};
use regex::Regex;
use std::collections::HashMap;
use tracing::warn;

/// Context captured during matching (for template variables).
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Query parameters of the request
    pub query_params: HashMap<String, String>,
    /// Capture groups of a pattern path, numbered and named
    pub captures: HashMap<String, String>,
}

/// Result of matching a request against the endpoint set.
#[derive(Debug)]
pub struct MatchOutcome<'a> {
    /// The endpoint that accepted the request
    pub endpoint: &'a EndpointConfig,
    /// The selected rule
    pub rule: &'a ResponseRule,
    /// Context captured during matching
    pub context: MatchContext,
}

/// Response payload selected by the engine. The declared delay is reported
/// here; sleeping it is the serving layer's concern.
#[derive(Debug, Clone)]
pub struct MatchedResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: HashMap<String, String>,
    /// Response body bytes
    pub body: Option<Vec<u8>>,
    /// Delay before responding
    pub delay_ms: u64,
}

impl MatchOutcome<'_> {
    /// Assemble the response payload for the selected rule, without
    /// template rendering.
    pub fn response_payload(&self) -> anyhow::Result<MatchedResponse> {
        let body = match &self.rule.response.body {
            Some(b) => Some(b.to_bytes()?),
            None => None,
        };
        Ok(MatchedResponse {
            status: self.rule.response.status,
            headers: self.rule.response.headers.clone(),
            body,
            delay_ms: self.rule.response.delay_ms,
        })
    }
}

/// Matching engine with patterns compiled once at load time.
pub struct Matcher {
    /// Compiled per-endpoint state, parallel to the endpoint slice
    endpoints: Vec<CompiledEndpoint>,
}

struct CompiledEndpoint {
    /// Path test; None for endpoints without HTTP settings (never match)
    path: Option<PathTest>,
    /// Rule indices sorted by priority descending, ties in file order
    rule_order: Vec<usize>,
    /// Compiled body criteria, parallel to the rule list
    body_tests: Vec<Option<BodyCriterion>>,
}

enum PathTest {
    Literal(String),
    Pattern(Regex),
}

/// Body criterion resolved once at load time.
enum BodyCriterion {
    /// Undelimited pattern: the body must contain it
    Substring(String),
    /// Delimited pattern that failed to compile: fall back to equality
    /// against the raw pattern text
    Exact(String),
    /// Delimited pattern: a find anywhere in the body suffices
    Pattern(Regex),
}

impl BodyCriterion {
    fn compile(raw: &str, endpoint: &str) -> Self {
        if raw.len() > 1 && raw.starts_with('/') && raw.ends_with('/') {
            let inner = &raw[1..raw.len() - 1];
            match Regex::new(inner) {
                Ok(re) => BodyCriterion::Pattern(re),
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        pattern = %raw,
                        error = %e,
                        "invalid body pattern, falling back to exact match"
                    );
                    BodyCriterion::Exact(raw.to_string())
                }
            }
        } else {
            BodyCriterion::Substring(raw.to_string())
        }
    }

    fn matches(&self, body: &str) -> bool {
        match self {
            BodyCriterion::Substring(s) => body.contains(s.as_str()),
            BodyCriterion::Exact(s) => body == s,
            BodyCriterion::Pattern(re) => re.is_match(body),
        }
    }
}

impl CompiledEndpoint {
    fn compile(endpoint: &EndpointConfig) -> Self {
        let path = endpoint.http.as_ref().map(|http| {
            if http.path_is_pattern {
                // Full-match semantics: the pattern must cover the whole path.
                match Regex::new(&format!("^(?:{})$", http.path)) {
                    Ok(re) => PathTest::Pattern(re),
                    Err(e) => {
                        warn!(
                            endpoint = %endpoint.name,
                            pattern = %http.path,
                            error = %e,
                            "invalid path pattern, falling back to literal match"
                        );
                        PathTest::Literal(http.path.clone())
                    }
                }
            } else {
                PathTest::Literal(http.path.clone())
            }
        });

        let mut rule_order: Vec<usize> = (0..endpoint.rules.len()).collect();
        rule_order.sort_by(|&a, &b| {
            endpoint.rules[b]
                .priority
                .cmp(&endpoint.rules[a].priority)
        });

        let body_tests = endpoint
            .rules
            .iter()
            .map(|rule| {
                rule.match_body
                    .as_deref()
                    .map(|raw| BodyCriterion::compile(raw, &endpoint.name))
            })
            .collect();

        Self {
            path,
            rule_order,
            body_tests,
        }
    }

    fn test_path(&self, path: &str) -> Option<MatchContext> {
        let mut context = MatchContext::default();
        match self.path.as_ref()? {
            PathTest::Literal(value) => {
                if path != value {
                    return None;
                }
            }
            PathTest::Pattern(re) => {
                let captures = re.captures(path)?;
                for (i, cap) in captures.iter().enumerate().skip(1) {
                    if let Some(m) = cap {
                        context
                            .captures
                            .insert(format!("{}", i), m.as_str().to_string());
                    }
                }
                for name in re.capture_names().flatten() {
                    if let Some(m) = captures.name(name) {
                        context
                            .captures
                            .insert(name.to_string(), m.as_str().to_string());
                    }
                }
            }
        }
        Some(context)
    }
}

impl Matcher {
    /// Compile the endpoint set. Pattern failures degrade with a warning
    /// here; nothing is re-parsed per request.
    pub fn new(endpoints: &[EndpointConfig]) -> Self {
        let endpoints = endpoints.iter().map(CompiledEndpoint::compile).collect();
        Self { endpoints }
    }

    /// Resolve a request against the endpoint set the matcher was built
    /// from. Returns None when no endpoint accepts the request or the
    /// accepting endpoint has no rule whose criteria hold.
    pub fn resolve<'a>(
        &self,
        endpoints: &'a [EndpointConfig],
        method: &str,
        path: &str,
        query_params: &HashMap<String, String>,
        headers: &HashMap<String, String>,
        body: Option<&str>,
    ) -> Option<MatchOutcome<'a>> {
        for (idx, endpoint) in endpoints.iter().enumerate() {
            if !endpoint.enabled || endpoint.protocol != Protocol::Http {
                continue;
            }
            let Some(http) = &endpoint.http else {
                continue;
            };
            if !method.eq_ignore_ascii_case(&http.method) {
                continue;
            }
            let compiled = &self.endpoints[idx];
            let Some(mut context) = compiled.test_path(path) else {
                continue;
            };

            // The first endpoint accepting method+path is the candidate;
            // its rules decide the outcome.
            context.query_params = query_params.clone();
            for &rule_idx in &compiled.rule_order {
                let rule = &endpoint.rules[rule_idx];
                if self.rule_matches(compiled, rule_idx, rule, query_params, headers, body) {
                    return Some(MatchOutcome {
                        endpoint,
                        rule,
                        context,
                    });
                }
            }
            return None;
        }
        None
    }

    fn rule_matches(
        &self,
        compiled: &CompiledEndpoint,
        rule_idx: usize,
        rule: &ResponseRule,
        query_params: &HashMap<String, String>,
        headers: &HashMap<String, String>,
        body: Option<&str>,
    ) -> bool {
        for (name, expected) in &rule.match_headers {
            let actual = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v);
            if actual != Some(expected) {
                return false;
            }
        }

        for (name, expected) in &rule.match_query {
            if query_params.get(name) != Some(expected) {
                return false;
            }
        }

        if let Some(criterion) = &compiled.body_tests[rule_idx] {
            let Some(body) = body else {
                return false;
            };
            if !criterion.matches(body) {
                return false;
            }
        }

        true
    }
}

/// Parse a query string into key-value pairs.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        if let Some((key, value)) = part.split_once('=') {
            params.insert(urlencoding_decode(key), urlencoding_decode(value));
        } else {
            params.insert(urlencoding_decode(part), String::new());
        }
    }

    params
}

/// Simple URL decoding.
fn urlencoding_decode(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if hex.len() == 2 {
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    result.push(byte as char);
                    continue;
                }
            }
            result.push('%');
            result.push_str(&hex);
        } else if ch == '+' {
            result.push(' ');
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpEndpoint, MessagePattern, ResponseBody, RuleResponse};

    fn make_rule(priority: i32) -> ResponseRule {
        ResponseRule {
            name: None,
            priority,
            match_headers: HashMap::new(),
            match_query: HashMap::new(),
            match_body: None,
            response: RuleResponse {
                status: 200,
                headers: HashMap::new(),
                body: None,
                delay_ms: 0,
                template: false,
            },
        }
    }

    fn make_endpoint(name: &str, method: &str, path: &str, rules: Vec<ResponseRule>) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            description: None,
            protocol: Protocol::Http,
            pattern: MessagePattern::RequestReply,
            enabled: true,
            http: Some(HttpEndpoint {
                method: method.to_string(),
                path: path.to_string(),
                path_is_pattern: false,
            }),
            broker: None,
            rules,
        }
    }

    fn resolve_simple<'a>(
        matcher: &Matcher,
        endpoints: &'a [EndpointConfig],
        method: &str,
        path: &str,
    ) -> Option<MatchOutcome<'a>> {
        matcher.resolve(
            endpoints,
            method,
            path,
            &HashMap::new(),
            &HashMap::new(),
            None,
        )
    }

    #[test]
    fn test_literal_path_and_method() {
        let endpoints = vec![make_endpoint("users", "GET", "/users", vec![make_rule(0)])];
        let matcher = Matcher::new(&endpoints);

        assert!(resolve_simple(&matcher, &endpoints, "GET", "/users").is_some());
        assert!(resolve_simple(&matcher, &endpoints, "get", "/users").is_some());
        assert!(resolve_simple(&matcher, &endpoints, "POST", "/users").is_none());
        assert!(resolve_simple(&matcher, &endpoints, "GET", "/orders").is_none());
    }

    #[test]
    fn test_pattern_path_full_match() {
        let mut endpoint = make_endpoint("user-by-id", "GET", r"/users/(\d+)", vec![make_rule(0)]);
        endpoint.http.as_mut().unwrap().path_is_pattern = true;
        let endpoints = vec![endpoint];
        let matcher = Matcher::new(&endpoints);

        let outcome = resolve_simple(&matcher, &endpoints, "GET", "/users/42").unwrap();
        assert_eq!(outcome.context.captures.get("1"), Some(&"42".to_string()));

        // Full-match semantics: trailing segments do not qualify.
        assert!(resolve_simple(&matcher, &endpoints, "GET", "/users/42/posts").is_none());
        assert!(resolve_simple(&matcher, &endpoints, "GET", "/users/abc").is_none());
    }

    #[test]
    fn test_invalid_path_pattern_degrades_to_literal() {
        let mut endpoint = make_endpoint("broken", "GET", "/users/[", vec![make_rule(0)]);
        endpoint.http.as_mut().unwrap().path_is_pattern = true;
        let endpoints = vec![endpoint];
        let matcher = Matcher::new(&endpoints);

        assert!(resolve_simple(&matcher, &endpoints, "GET", "/users/[").is_some());
        assert!(resolve_simple(&matcher, &endpoints, "GET", "/users/1").is_none());
    }

    #[test]
    fn test_priority_dominates_specificity() {
        let unconditional = make_rule(10);
        let mut gated = make_rule(0);
        gated
            .match_headers
            .insert("X-Env".to_string(), "test".to_string());

        let endpoints = vec![make_endpoint(
            "users",
            "GET",
            "/users",
            vec![gated, unconditional],
        )];
        let matcher = Matcher::new(&endpoints);

        let mut headers = HashMap::new();
        headers.insert("X-Env".to_string(), "test".to_string());

        // Both rules match; the higher priority wins even though the
        // lower one is more specific.
        let outcome = matcher
            .resolve(&endpoints, "GET", "/users", &HashMap::new(), &headers, None)
            .unwrap();
        assert_eq!(outcome.rule.priority, 10);
    }

    #[test]
    fn test_priority_ties_keep_file_order() {
        let mut first = make_rule(0);
        first.name = Some("first".to_string());
        let mut second = make_rule(0);
        second.name = Some("second".to_string());

        let endpoints = vec![make_endpoint("users", "GET", "/users", vec![first, second])];
        let matcher = Matcher::new(&endpoints);

        let outcome = resolve_simple(&matcher, &endpoints, "GET", "/users").unwrap();
        assert_eq!(outcome.rule.name.as_deref(), Some("first"));
    }

    #[test]
    fn test_gated_rule_selected_when_it_outranks() {
        let mut gated = make_rule(5);
        gated
            .match_headers
            .insert("X-Env".to_string(), "test".to_string());
        let fallback = make_rule(0);

        let endpoints = vec![make_endpoint(
            "users",
            "GET",
            "/users",
            vec![fallback, gated],
        )];
        let matcher = Matcher::new(&endpoints);

        let mut headers = HashMap::new();
        headers.insert("x-env".to_string(), "test".to_string());
        let outcome = matcher
            .resolve(&endpoints, "GET", "/users", &HashMap::new(), &headers, None)
            .unwrap();
        assert_eq!(outcome.rule.priority, 5);

        // Without the header, the gated rule fails and the fallback wins.
        let outcome = resolve_simple(&matcher, &endpoints, "GET", "/users").unwrap();
        assert_eq!(outcome.rule.priority, 0);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut rule = make_rule(0);
        rule.match_headers
            .insert("X-Request-Id".to_string(), "abc".to_string());
        let endpoints = vec![make_endpoint("users", "GET", "/users", vec![rule])];
        let matcher = Matcher::new(&endpoints);

        let mut headers = HashMap::new();
        headers.insert("x-request-id".to_string(), "abc".to_string());
        assert!(matcher
            .resolve(&endpoints, "GET", "/users", &HashMap::new(), &headers, None)
            .is_some());

        // Values stay exact.
        headers.insert("x-request-id".to_string(), "ABC".to_string());
        assert!(matcher
            .resolve(&endpoints, "GET", "/users", &HashMap::new(), &headers, None)
            .is_none());
    }

    #[test]
    fn test_query_param_exact_match() {
        let mut rule = make_rule(0);
        rule.match_query.insert("page".to_string(), "1".to_string());
        let endpoints = vec![make_endpoint("users", "GET", "/users", vec![rule])];
        let matcher = Matcher::new(&endpoints);

        let mut query = HashMap::new();
        query.insert("page".to_string(), "1".to_string());
        assert!(matcher
            .resolve(&endpoints, "GET", "/users", &query, &HashMap::new(), None)
            .is_some());

        query.insert("page".to_string(), "2".to_string());
        assert!(matcher
            .resolve(&endpoints, "GET", "/users", &query, &HashMap::new(), None)
            .is_none());
    }

    #[test]
    fn test_body_regex_find() {
        let mut rule = make_rule(0);
        rule.match_body = Some("/foo.*bar/".to_string());
        let endpoints = vec![make_endpoint("users", "POST", "/users", vec![rule])];
        let matcher = Matcher::new(&endpoints);

        let outcome = matcher.resolve(
            &endpoints,
            "POST",
            "/users",
            &HashMap::new(),
            &HashMap::new(),
            Some("xx foobar yy"),
        );
        assert!(outcome.is_some());

        let outcome = matcher.resolve(
            &endpoints,
            "POST",
            "/users",
            &HashMap::new(),
            &HashMap::new(),
            Some("xx barfoo yy"),
        );
        assert!(outcome.is_none());
    }

    #[test]
    fn test_body_substring_containment() {
        let mut rule = make_rule(0);
        rule.match_body = Some("foo".to_string());
        let endpoints = vec![make_endpoint("users", "POST", "/users", vec![rule])];
        let matcher = Matcher::new(&endpoints);

        let outcome = matcher.resolve(
            &endpoints,
            "POST",
            "/users",
            &HashMap::new(),
            &HashMap::new(),
            Some("xxfooyy"),
        );
        assert!(outcome.is_some());
    }

    #[test]
    fn test_body_invalid_regex_falls_back_to_exact() {
        let mut rule = make_rule(0);
        rule.match_body = Some("/[unclosed/".to_string());
        let endpoints = vec![make_endpoint("users", "POST", "/users", vec![rule])];
        let matcher = Matcher::new(&endpoints);

        // Equality against the raw pattern text, delimiters included.
        let outcome = matcher.resolve(
            &endpoints,
            "POST",
            "/users",
            &HashMap::new(),
            &HashMap::new(),
            Some("/[unclosed/"),
        );
        assert!(outcome.is_some());

        let outcome = matcher.resolve(
            &endpoints,
            "POST",
            "/users",
            &HashMap::new(),
            &HashMap::new(),
            Some("[unclosed"),
        );
        assert!(outcome.is_none());
    }

    #[test]
    fn test_body_criterion_requires_a_body() {
        let mut rule = make_rule(0);
        rule.match_body = Some("foo".to_string());
        let endpoints = vec![make_endpoint("users", "POST", "/users", vec![rule])];
        let matcher = Matcher::new(&endpoints);

        assert!(resolve_simple(&matcher, &endpoints, "POST", "/users").is_none());
    }

    #[test]
    fn test_endpoint_with_zero_rules_never_matches() {
        let endpoints = vec![make_endpoint("empty", "GET", "/users", vec![])];
        let matcher = Matcher::new(&endpoints);

        assert!(resolve_simple(&matcher, &endpoints, "GET", "/users").is_none());
    }

    #[test]
    fn test_candidate_endpoint_commits() {
        // The first endpoint accepts the path but no rule matches; a later
        // endpoint with the same path is not consulted.
        let mut gated = make_rule(0);
        gated
            .match_headers
            .insert("X-Env".to_string(), "test".to_string());
        let first = make_endpoint("first", "GET", "/users", vec![gated]);
        let second = make_endpoint("second", "GET", "/users", vec![make_rule(0)]);
        let endpoints = vec![first, second];
        let matcher = Matcher::new(&endpoints);

        assert!(resolve_simple(&matcher, &endpoints, "GET", "/users").is_none());
    }

    #[test]
    fn test_disabled_endpoint_skipped() {
        let mut endpoint = make_endpoint("dark", "GET", "/users", vec![make_rule(0)]);
        endpoint.enabled = false;
        let live = make_endpoint("live", "GET", "/users", vec![make_rule(7)]);
        let endpoints = vec![endpoint, live];
        let matcher = Matcher::new(&endpoints);

        let outcome = resolve_simple(&matcher, &endpoints, "GET", "/users").unwrap();
        assert_eq!(outcome.endpoint.name, "live");
    }

    #[test]
    fn test_response_payload_reports_delay() {
        let mut rule = make_rule(0);
        rule.response.status = 201;
        rule.response.delay_ms = 120;
        rule.response
            .headers
            .insert("X-Simulated".to_string(), "yes".to_string());
        rule.response.body = Some(ResponseBody::Text {
            content: "created".to_string(),
        });
        let endpoints = vec![make_endpoint("users", "POST", "/users", vec![rule])];
        let matcher = Matcher::new(&endpoints);

        let outcome = resolve_simple(&matcher, &endpoints, "POST", "/users").unwrap();
        let payload = outcome.response_payload().unwrap();
        assert_eq!(payload.status, 201);
        assert_eq!(payload.delay_ms, 120);
        assert_eq!(
            payload.headers.get("X-Simulated").map(String::as_str),
            Some("yes")
        );
        assert_eq!(payload.body.as_deref(), Some(&b"created"[..]));
    }

    #[test]
    fn test_parse_query_string() {
        let params = parse_query_string("foo=bar&baz=qux");
        assert_eq!(params.get("foo"), Some(&"bar".to_string()));
        assert_eq!(params.get("baz"), Some(&"qux".to_string()));

        let params = parse_query_string("name=John%20Doe&flag");
        assert_eq!(params.get("name"), Some(&"John Doe".to_string()));
        assert_eq!(params.get("flag"), Some(&String::new()));
    }
}
