//! HTTP node - make HTTP requests.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::types::{Node, NodeContext, NodeMetadata, NodeResult, ParameterSpec};
use crate::error::{Error, Result};
use crate::metrics;

/// Env toggle that disables the internal-address guard.
pub const ALLOW_INTERNAL_URLS_ENV: &str = "FLOWRUN_ALLOW_INTERNAL_URLS";

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
const MAX_ERROR_BODY_CHARS: usize = 512;

fn internal_urls_allowed_by_env() -> bool {
    std::env::var(ALLOW_INTERNAL_URLS_ENV)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Validate URL to prevent SSRF attacks.
/// Blocks access to localhost, private IP ranges, and non-http(s) schemes.
fn validate_url(url: &str, allow_internal: bool) -> Result<reqwest::Url> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::Validation(format!("Invalid URL '{}': {}", url, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(Error::Validation(format!(
                "Unsupported URL scheme '{}'. Only http and https are allowed.",
                scheme
            )));
        }
    }

    if allow_internal {
        return Ok(parsed);
    }

    if let Some(host) = parsed.host_str() {
        let host_lower = host.to_lowercase();
        let bare = host_lower.trim_start_matches('[').trim_end_matches(']');
        if bare == "localhost" || bare == "0.0.0.0" || bare == "::1" {
            warn!(url = %url, "Blocked SSRF attempt to localhost");
            return Err(Error::Validation(
                "Access to localhost is not allowed for security reasons.".to_string(),
            ));
        }

        if let Ok(ip) = bare.parse::<IpAddr>() {
            if is_private_or_special_ip(&ip) {
                warn!(url = %url, "Blocked SSRF attempt to private IP");
                return Err(Error::Validation(
                    "Access to private or internal IP addresses is not allowed for security reasons."
                        .to_string(),
                ));
            }
        }

        if bare.ends_with(".local") || bare.ends_with(".internal") || bare.ends_with(".localhost") {
            warn!(url = %url, "Blocked SSRF attempt to internal host");
            return Err(Error::Validation(
                "Access to internal hostnames is not allowed for security reasons.".to_string(),
            ));
        }
    }

    Ok(parsed)
}

/// Check if an IP address is private, loopback, or otherwise special.
fn is_private_or_special_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()              // 127.0.0.0/8
                || ipv4.is_private()         // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
                || ipv4.is_link_local()      // 169.254.0.0/16, cloud metadata
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                || ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xc0) == 64 // 100.64.0.0/10 (CGNAT)
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                || (ipv6.segments()[0] & 0xfe00) == 0xfc00 // fc00::/7
                || ipv6
                    .to_ipv4_mapped()
                    .map(|v4| is_private_or_special_ip(&IpAddr::V4(v4)))
                    .unwrap_or(false)
        }
    }
}

/// HTTP request node.
pub struct HttpNode {
    client: Client,
    /// Overrides the env toggle when set
    allow_internal: Option<bool>,
}

impl HttpNode {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_HTTP_CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout defaults: {}", e);
                Client::new()
            });
        Self {
            client,
            allow_internal: None,
        }
    }

    /// Permit loopback and private addresses (tests, self-hosted setups).
    pub fn allow_internal(mut self, allow: bool) -> Self {
        self.allow_internal = Some(allow);
        self
    }

    fn internal_allowed(&self) -> bool {
        self.allow_internal.unwrap_or_else(internal_urls_allowed_by_env)
    }
}

impl Default for HttpNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct HttpConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: Map<String, Value>,
    #[serde(default)]
    query: Map<String, Value>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default, alias = "timeout")]
    timeout_seconds: Option<u64>,
    /// "auto" parses JSON when the body looks like JSON, "json" requires it,
    /// "text" returns the raw body
    #[serde(default = "default_response_format")]
    response_format: String,
    /// How credential fields authenticate the request.
    /// - `bearer`: `Authorization: Bearer <token>`
    /// - `basic`: `username` / `password`
    /// - `api_key`: `X-API-Key: <api_key>`
    /// - `header:<name>`: custom header with the credential `value`
    #[serde(default = "default_auth_type")]
    auth_type: String,
    /// Turn 4xx/5xx responses into errors
    #[serde(default = "default_fail_on_status")]
    fail_on_status: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_response_format() -> String {
    "auto".to_string()
}

fn default_auth_type() -> String {
    "bearer".to_string()
}

fn default_fail_on_status() -> bool {
    true
}

const PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::required("url", "string", "Request URL"),
    ParameterSpec::optional("method", "string", "GET, POST, PUT, PATCH, DELETE, HEAD"),
    ParameterSpec::optional("headers", "object", "Request headers"),
    ParameterSpec::optional("query", "object", "Query string parameters"),
    ParameterSpec::optional("body", "any", "JSON request body"),
    ParameterSpec::optional("timeout_seconds", "number", "Request timeout"),
    ParameterSpec::optional("response_format", "string", "auto | json | text"),
    ParameterSpec::optional("auth_type", "string", "bearer | basic | api_key | header:<name>"),
    ParameterSpec::optional("fail_on_status", "boolean", "Fail on 4xx/5xx (default true)"),
];

fn credential_field<'c>(ctx: &'c NodeContext, fields: &[&str]) -> Result<&'c str> {
    fields
        .iter()
        .find_map(|f| ctx.credential(f))
        .ok_or_else(|| {
            Error::Credential(format!(
                "credential for node '{}' needs one of: {}",
                ctx.node_id,
                fields.join(", ")
            ))
        })
}

/// Apply authentication from the node's credential, if it has one.
fn apply_authentication(
    request: reqwest::RequestBuilder,
    ctx: &NodeContext,
    auth_type: &str,
) -> Result<reqwest::RequestBuilder> {
    if ctx.credentials.is_none() {
        return Ok(request);
    }
    match auth_type {
        "bearer" => Ok(request.bearer_auth(credential_field(ctx, &["token", "api_key", "value"])?)),
        "basic" => {
            let username = credential_field(ctx, &["username", "user"])?;
            let password = ctx.credential("password");
            Ok(request.basic_auth(username, password))
        }
        "api_key" => Ok(request.header("X-API-Key", credential_field(ctx, &["api_key", "value"])?)),
        other => match other.strip_prefix("header:") {
            Some(name) if !name.is_empty() => {
                Ok(request.header(name, credential_field(ctx, &["value", "token", "api_key"])?))
            }
            Some(_) => Err(Error::Validation(
                "header: auth_type must specify a header name".to_string(),
            )),
            None => Err(Error::Validation(format!(
                "Unknown auth_type '{}'. Use: bearer, basic, api_key, or header:<name>",
                auth_type
            ))),
        },
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}

#[async_trait]
impl Node for HttpNode {
    fn node_type(&self) -> &str {
        "http"
    }

    fn description(&self) -> &str {
        "Make HTTP requests (GET, POST, PUT, DELETE, PATCH)"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::transform().with_parameters(PARAMETERS)
    }

    fn service_key(&self, params: &Value) -> Option<String> {
        let url = params.get("url")?.as_str()?;
        let parsed = reqwest::Url::parse(url).ok()?;
        Some(format!("http:{}", parsed.host_str()?))
    }

    async fn execute(&self, params: &Value, ctx: &NodeContext) -> Result<NodeResult> {
        let config: HttpConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Validation(format!("Invalid HTTP config: {}", e)))?;

        let url = validate_url(&config.url, self.internal_allowed())?;
        let method = config.method.to_uppercase();

        debug!(method = %method, url = %url, "HTTP request");

        let mut request = match method.as_str() {
            "GET" => self.client.get(url.clone()),
            "POST" => self.client.post(url.clone()),
            "PUT" => self.client.put(url.clone()),
            "DELETE" => self.client.delete(url.clone()),
            "PATCH" => self.client.patch(url.clone()),
            "HEAD" => self.client.head(url.clone()),
            _ => {
                return Err(Error::Validation(format!(
                    "Unknown HTTP method: {}",
                    config.method
                )))
            }
        };

        request = apply_authentication(request, ctx, &config.auth_type)?;

        for (key, value) in &config.headers {
            request = request.header(key, scalar_to_string(value));
        }

        if !config.query.is_empty() {
            let pairs: Vec<(String, String)> = config
                .query
                .iter()
                .map(|(k, v)| (k.clone(), scalar_to_string(v)))
                .collect();
            request = request.query(&pairs);
        }

        if let Some(body) = &config.body {
            request = request.json(body);
        }

        if let Some(timeout) = config.timeout_seconds {
            request = request.timeout(Duration::from_secs(timeout));
        }

        ctx.check_cancelled()?;
        let start = std::time::Instant::now();
        let response = request.send().await?;
        let duration = start.elapsed();

        let status = response.status().as_u16();
        metrics::record_http_request(&method, status);

        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    Value::String(v.to_str().unwrap_or("").to_string()),
                )
            })
            .collect();

        let body_text = response.text().await?;

        if status >= 400 && config.fail_on_status {
            return Err(Error::HttpStatus {
                status,
                message: format!(
                    "{} {} failed: {}",
                    method,
                    url,
                    truncate(&body_text, MAX_ERROR_BODY_CHARS)
                ),
            });
        }

        let body = match config.response_format.as_str() {
            "text" => Value::String(body_text),
            "json" => serde_json::from_str(&body_text).map_err(|e| {
                Error::Validation(format!("HTTP {} {} returned non-JSON body: {}", method, url, e))
            })?,
            _ => {
                if body_text.is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(&body_text).unwrap_or(Value::String(body_text))
                }
            }
        };

        info!(
            method = %method,
            url = %url,
            status,
            duration_ms = duration.as_millis() as u64,
            "HTTP request completed"
        );

        Ok(NodeResult::main(vec![json!({
            "status": status,
            "headers": headers,
            "body": body,
        })])
        .with_metadata(json!({ "duration_ms": duration.as_millis() as u64 })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialData;

    fn ctx() -> NodeContext {
        NodeContext::new("exec-1", "test").with_node("call", "call")
    }

    #[test]
    fn test_ssrf_protection_localhost() {
        let result = validate_url("http://localhost:8080/admin", false);
        assert!(result.unwrap_err().to_string().contains("localhost"));
        assert!(validate_url("http://[::1]:80/", false).is_err());
    }

    #[test]
    fn test_ssrf_protection_private_ip() {
        assert!(validate_url("http://127.0.0.1:6379", false).is_err());
        let result = validate_url("http://10.0.0.1/internal", false);
        assert!(result.unwrap_err().to_string().contains("private"));
        assert!(validate_url("http://192.168.1.1/admin", false).is_err());
        assert!(validate_url("http://172.16.0.1/secret", false).is_err());
        assert!(validate_url("http://169.254.169.254/latest/meta-data/", false).is_err());
    }

    #[test]
    fn test_ssrf_protection_internal_hostnames() {
        assert!(validate_url("http://db.internal/query", false).is_err());
        assert!(validate_url("http://redis.local/", false).is_err());
    }

    #[test]
    fn test_ssrf_protection_invalid_scheme() {
        let result = validate_url("file:///etc/passwd", true);
        assert!(result.unwrap_err().to_string().contains("scheme"));
        assert!(validate_url("ftp://example.com/file", false).is_err());
    }

    #[test]
    fn test_ssrf_protection_allows_external() {
        assert!(validate_url("https://api.example.com/v1/users", false).is_ok());
        assert!(validate_url("http://127.0.0.1:8080/", true).is_ok());
    }

    #[test]
    fn test_service_key_uses_host() {
        let node = HttpNode::new();
        assert_eq!(
            node.service_key(&json!({"url": "https://api.example.com/v1?x=1"})),
            Some("http:api.example.com".to_string())
        );
        assert_eq!(node.service_key(&json!({"url": "nope"})), None);
    }

    #[tokio::test]
    async fn test_http_post_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/users")
            .match_query(mockito::Matcher::UrlEncoded("page".into(), "2".into()))
            .match_header("x-trace", "abc")
            .match_body(mockito::Matcher::Json(json!({"x": 1})))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": 7}"#)
            .create_async()
            .await;

        let node = HttpNode::new().allow_internal(true);
        let params = json!({
            "url": format!("{}/users", server.url()),
            "method": "post",
            "query": {"page": 2},
            "headers": {"X-Trace": "abc"},
            "body": {"x": 1}
        });
        let result = node.execute(&params, &ctx()).await.unwrap();
        let item = &result.items("main")[0];
        assert_eq!(item["status"], 201);
        assert_eq!(item["body"]["id"], 7);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/down")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let node = HttpNode::new().allow_internal(true);
        let params = json!({"url": format!("{}/down", server.url())});
        let err = node.execute(&params, &ctx()).await.unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 503, .. }));

        let params = json!({"url": format!("{}/down", server.url()), "fail_on_status": false});
        let result = node.execute(&params, &ctx()).await.unwrap();
        assert_eq!(result.items("main")[0]["body"], "maintenance");
    }

    #[tokio::test]
    async fn test_http_bearer_credential() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/me")
            .match_header("authorization", "Bearer tok-123")
            .with_body("{}")
            .create_async()
            .await;

        let mut credentials = CredentialData::default();
        credentials.insert("token", "tok-123");
        let node = HttpNode::new().allow_internal(true);
        node.execute(
            &json!({"url": format!("{}/me", server.url())}),
            &ctx().with_credentials(credentials),
        )
        .await
        .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_blocked_without_allow_internal() {
        let node = HttpNode::new().allow_internal(false);
        let err = node
            .execute(&json!({"url": "http://127.0.0.1:1/"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
