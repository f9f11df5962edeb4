//! HTTP client for webhook delivery behind the egress ACL.
//!
//! Every name the client resolves goes through `AclResolver`, which rejects
//! the connection if any resolved address is denied. IP-literal URLs never
//! reach a resolver, so they are checked before the request is built and
//! again on every redirect hop, together with domain rules.
//!
//! With `proxy_url` set, the proxy resolves destination names, so only the
//! URL checks apply to them and address rules for those names are left to
//! the proxy. The proxy host itself is trusted configuration and is exempt
//! from the ACL. Environment proxy variables are never read.

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use hookwire_core::models::{AttemptId, EventId, HttpMethod};
use reqwest::{
    dns::{Addrs, Name, Resolve, Resolving},
    header::{HeaderMap, HeaderName, HeaderValue},
    Certificate, Identity, Proxy, Response, Url,
};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    acl::Acl,
    error::{DeliveryError, Result},
};

/// Default maximum response body kept for attempt details.
pub const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 64 * 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Response bytes kept; the rest is discarded.
    pub max_response_body_bytes: usize,
    /// Forward proxy for every delivery, `http://` or `https://`.
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Extra trust and identity for outbound TLS.
    #[serde(default)]
    pub tls: ClientTlsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            max_redirects: 3,
            verify_tls: true,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            proxy_url: None,
            tls: ClientTlsConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Checks the proxy URL and TLS file pairing without touching the files.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for a proxy URL that is
    /// not absolute `http`/`https`, or a client certificate without its key
    /// (or the reverse).
    pub fn validate(&self) -> Result<()> {
        if let Some(proxy_url) = &self.proxy_url {
            parse_proxy_url(proxy_url)?;
        }
        if self.tls.client_cert.is_some() != self.tls.client_key.is_some() {
            return Err(DeliveryError::configuration(
                "TLS client certificate and key must be set together",
            ));
        }
        Ok(())
    }
}

/// PEM files applied to every TLS connection the client opens, the proxy's
/// included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTlsConfig {
    /// Additional trusted CA certificate.
    pub ca_cert: Option<PathBuf>,
    /// Client certificate presented when a server asks for one.
    pub client_cert: Option<PathBuf>,
    /// Private key of `client_cert`.
    pub client_key: Option<PathBuf>,
}

fn parse_proxy_url(proxy_url: &str) -> Result<Url> {
    let url = Url::parse(proxy_url).map_err(|e| {
        DeliveryError::configuration(format!("invalid proxy url '{proxy_url}': {e}"))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DeliveryError::configuration(format!(
            "proxy url '{proxy_url}' must use http or https"
        )));
    }
    if url.host_str().is_none() {
        return Err(DeliveryError::configuration(format!("proxy url '{proxy_url}' has no host")));
    }
    Ok(url)
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        DeliveryError::configuration(format!("failed to read {what} {}: {e}", path.display()))
    })
}

/// `hookwire/<crate version>`.
pub fn default_user_agent() -> String {
    format!("hookwire/{}", env!("CARGO_PKG_VERSION"))
}

/// Error raised inside name resolution and redirect checks.
#[derive(Debug, Clone)]
pub struct DeniedError {
    host: String,
    addr: Option<IpAddr>,
}

impl DeniedError {
    /// Human-readable destination for error messages.
    pub fn destination(&self) -> String {
        match self.addr {
            Some(addr) => format!("{}(ip={addr})", self.host),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for DeniedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request to {} is denied", self.destination())
    }
}

impl std::error::Error for DeniedError {}

/// DNS resolver that enforces the ACL on every resolved address.
#[derive(Debug, Clone)]
pub struct AclResolver {
    acl: Arc<Acl>,
    trusted_host: Option<String>,
}

impl AclResolver {
    /// Creates a resolver enforcing `acl`.
    pub fn new(acl: Arc<Acl>) -> Self {
        Self { acl, trusted_host: None }
    }

    /// Resolves `host` without ACL checks. Used for the configured proxy.
    pub fn trusting(mut self, host: impl Into<String>) -> Self {
        self.trusted_host = Some(host.into());
        self
    }
}

type ResolveError = Box<dyn std::error::Error + Send + Sync>;

async fn resolve_checked(
    acl: Arc<Acl>,
    host: String,
    trusted: bool,
) -> std::result::Result<Addrs, ResolveError> {
    if trusted {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0)).await?.collect();
        return Ok(Box::new(addrs.into_iter()));
    }
    if acl.denies_host(&host) {
        return Err(Box::new(DeniedError { host, addr: None }));
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0)).await?.collect();
    if let Some(denied) = addrs.iter().find(|addr| !acl.allow(&host, addr.ip())) {
        let addr = Some(denied.ip());
        return Err(Box::new(DeniedError { host, addr }));
    }

    Ok(Box::new(addrs.into_iter()))
}

impl Resolve for AclResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        let trusted = self.trusted_host.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(&host));
        Box::pin(resolve_checked(self.acl.clone(), host, trusted))
    }
}

/// HTTP client for webhook delivery.
///
/// Never retries: a request is sent once and its outcome classified. Retry
/// policy belongs to the worker.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
    acl: Arc<Acl>,
}

/// One outbound delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Attempt being delivered.
    pub attempt_id: AttemptId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Destination URL.
    pub url: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// Caller headers, applied after the defaults.
    pub headers: HashMap<String, String>,
    /// Request body.
    pub body: Bytes,
    /// Per-request timeout.
    pub timeout: Duration,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

/// Response from a webhook delivery.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, at most `max_response_body_bytes`.
    pub body: String,
    /// Whether the body was cut short.
    pub body_truncated: bool,
    /// Time from send to end of body.
    pub duration: Duration,
    /// Whether the status is 2xx.
    pub is_success: bool,
}

impl DeliveryClient {
    /// Creates a new delivery client enforcing `acl`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the configuration is
    /// invalid, a TLS file cannot be loaded, or the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig, acl: Arc<Acl>) -> Result<Self> {
        config.validate()?;
        let redirect_acl = acl.clone();
        let max_redirects = config.max_redirects;
        let redirect = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                return attempt.error(format!("too many redirects (max {max_redirects})"));
            }
            if let Some(denied) = url_denial(&redirect_acl, attempt.url()) {
                return attempt.error(denied);
            }
            attempt.follow()
        });

        let mut resolver = AclResolver::new(acl.clone());
        let mut builder = reqwest::Client::builder()
            .redirect(redirect)
            .danger_accept_invalid_certs(!config.verify_tls);

        match &config.proxy_url {
            Some(proxy_url) => {
                let url = parse_proxy_url(proxy_url)?;
                if let Some(host) = url.host_str() {
                    resolver = resolver.trusting(host);
                }
                let proxy = Proxy::all(url).map_err(|e| {
                    DeliveryError::configuration(format!("invalid proxy url '{proxy_url}': {e}"))
                })?;
                builder = builder.proxy(proxy);
                tracing::info!(proxy_url = %proxy_url, "delivery proxy enabled");
            },
            None => builder = builder.no_proxy(),
        }

        if let Some(path) = &config.tls.ca_cert {
            let cert = Certificate::from_pem(&read_pem(path, "CA certificate")?).map_err(|e| {
                DeliveryError::configuration(format!("invalid CA certificate: {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&config.tls.client_cert, &config.tls.client_key) {
            let mut pem = read_pem(cert, "client certificate")?;
            pem.push(b'\n');
            pem.extend(read_pem(key, "client key")?);
            let identity = Identity::from_pem(&pem).map_err(|e| {
                DeliveryError::configuration(format!("invalid client certificate: {e}"))
            })?;
            builder = builder.identity(identity);
        }

        let client = builder.dns_resolver(Arc::new(resolver)).build().map_err(|e| {
            DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
        })?;

        Ok(Self { client, config, acl })
    }

    /// Creates a client with default configuration and no egress rules.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default(), Arc::new(Acl::allow_all()))
    }

    /// Headers sent for `extra`: defaults first, caller values replace them.
    pub fn outbound_headers(&self, extra: &HashMap<String, String>) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json; charset=utf-8".to_string());
        headers.insert("user-agent".to_string(), self.config.user_agent.clone());
        for (key, value) in extra {
            if !is_managed_header(key) {
                headers.insert(key.to_ascii_lowercase(), value.clone());
            }
        }
        headers
    }

    /// Delivers a webhook.
    ///
    /// Non-2xx answers are returned as responses, not errors.
    ///
    /// # Errors
    ///
    /// - `Denied` when the ACL rejects the destination
    /// - `Timeout` when the per-request timeout elapses
    /// - `NetworkError` for every other transport failure
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_delivery",
            attempt_id = %request.attempt_id,
            event_id = %request.event_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            let url = Url::parse(&request.url)
                .map_err(|e| DeliveryError::network(format!("invalid URL: {e}")))?;
            if let Some(denied) = url_denial(&self.acl, &url) {
                tracing::warn!(destination = %denied.destination(), "delivery denied by ACL");
                return Err(DeliveryError::denied(denied.destination()));
            }

            let mut header_map = HeaderMap::new();
            for (key, value) in self.outbound_headers(&request.headers) {
                match (HeaderName::try_from(key.as_str()), HeaderValue::try_from(value.as_str())) {
                    (Ok(name), Ok(value)) => {
                        header_map.insert(name, value);
                    },
                    _ => tracing::warn!(header = %key, "skipping invalid header"),
                }
            }

            let method = to_reqwest_method(request.method);
            let start_time = Instant::now();
            let response = self
                .client
                .request(method, url)
                .headers(header_map)
                .timeout(request.timeout)
                .body(request.body.clone())
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);
                    return Err(classify(&e, request.timeout));
                },
            };

            let delivery_response =
                self.read_response(response, start_time, request.timeout).await?;

            if delivery_response.is_success {
                tracing::debug!(status = delivery_response.status_code, "webhook delivered");
            } else {
                tracing::warn!(status = delivery_response.status_code, "non-success response");
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }

    async fn read_response(
        &self,
        mut response: Response,
        start_time: Instant,
        timeout: Duration,
    ) -> Result<DeliveryResponse> {
        let status_code = response.status().as_u16();
        let is_success = response.status().is_success();
        let headers = extract_headers(response.headers());

        let limit = self.config.max_response_body_bytes;
        let mut body = Vec::new();
        let mut body_truncated = false;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let remaining = limit.saturating_sub(body.len());
                    if chunk.len() > remaining {
                        body.extend_from_slice(&chunk[..remaining]);
                        body_truncated = true;
                        break;
                    }
                    body.extend_from_slice(&chunk);
                },
                Ok(None) => break,
                Err(e) if e.is_timeout() => return Err(DeliveryError::timeout(timeout)),
                Err(e) => {
                    tracing::warn!("failed to read response body: {}", e);
                    break;
                },
            }
        }

        Ok(DeliveryResponse {
            status_code,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
            body_truncated,
            duration: start_time.elapsed(),
            is_success,
        })
    }
}

/// Checks what the URL alone decides: IP literals, which bypass the
/// resolver, and domain rules, which a proxy would otherwise bypass.
fn url_denial(acl: &Acl, url: &Url) -> Option<DeniedError> {
    let host = url.host_str()?;
    match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(ip) => {
            (!acl.allow(host, ip)).then(|| DeniedError { host: host.to_string(), addr: Some(ip) })
        },
        Err(_) => acl.denies_host(host).then(|| DeniedError { host: host.to_string(), addr: None }),
    }
}

/// Maps a reqwest failure to a delivery error.
fn classify(error: &reqwest::Error, timeout: Duration) -> DeliveryError {
    if let Some(denied) = find_denial(error) {
        return DeliveryError::denied(denied);
    }
    if error.is_timeout() {
        return DeliveryError::timeout(timeout);
    }
    if error.is_connect() {
        return DeliveryError::network(format!("connection failed: {error}"));
    }
    DeliveryError::network(error.to_string())
}

fn find_denial(error: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(denied) = err.downcast_ref::<DeniedError>() {
            return Some(denied.destination());
        }
        current = err.source();
    }
    None
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

/// Extracts headers from reqwest HeaderMap into a standard HashMap.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.to_string(), value_str.to_string());
        }
    }

    headers
}

/// Hop-by-hop and framing headers the client always controls.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
