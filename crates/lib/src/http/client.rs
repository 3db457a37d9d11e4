//! REST dispatcher: authenticated requests issued under the rate-limit governor.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{self, ApiConfig, Config};
use crate::error::HttpError;
use crate::http::ratelimit::RateLimiter;
use crate::http::route::bucket_key;

const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
const HEADER_GLOBAL: &str = "x-ratelimit-global";
const HEADER_RETRY_AFTER: &str = "retry-after";

/// Body of a 429 response.
#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: f64,
    #[serde(default)]
    global: bool,
}

/// Error body returned with 4xx responses.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: u64,
    #[serde(default)]
    message: String,
}

/// `GET /gateway/bot` response.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` resets.
    pub reset_after: u64,
    pub max_concurrency: u32,
}

/// A REST request before it is sent: method, route relative to the API base,
/// optional query, JSON body, and extra headers.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub route: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: HeaderMap,
}

impl ApiRequest {
    pub fn new(method: Method, route: impl Into<String>) -> Self {
        Self {
            method,
            route: route.into(),
            query: Vec::new(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Quota headers from one response.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct QuotaHeaders {
    remaining: Option<u32>,
    reset_after: Option<Duration>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn seconds(s: &str) -> Option<Duration> {
    s.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(Duration::from_secs_f64)
}

impl QuotaHeaders {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            remaining: header_str(headers, HEADER_REMAINING).and_then(|s| s.trim().parse().ok()),
            reset_after: header_str(headers, HEADER_RESET_AFTER).and_then(seconds),
        }
    }
}

/// Client for the REST API. Cheap to clone; clones share the rate limiter.
#[derive(Clone)]
pub struct HttpClient {
    base_url: String,
    auth: Option<HeaderValue>,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    settings: ApiConfig,
}

impl HttpClient {
    /// Build a client from config: base URL, token, and retry budgets.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config::resolve_api_base(config),
            config::resolve_token(config),
            config.api.clone(),
        )
    }

    pub fn new(base_url: impl Into<String>, token: Option<String>, settings: ApiConfig) -> Self {
        let auth = token.and_then(|t| {
            let value = if settings.auth_prefix.trim().is_empty() {
                t
            } else {
                format!("{} {}", settings.auth_prefix.trim(), t)
            };
            let mut v = HeaderValue::from_str(&value).ok()?;
            v.set_sensitive(true);
            Some(v)
        });
        if auth.is_none() {
            log::debug!("http client has no usable token; requests are unauthenticated");
        }
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .unwrap_or_else(|e| {
                log::warn!("http client builder failed ({}); using defaults without a timeout", e);
                reqwest::Client::new()
            });
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            client,
            limiter: Arc::new(RateLimiter::new()),
            settings,
        }
    }

    /// Share an existing governor (e.g. between several clients of one process).
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn default_headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(ref auth) = self.auth {
            h.insert(AUTHORIZATION, auth.clone());
        }
        h.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!(
                "DiscordBot (https://github.com/wumpus-rs/wumpus, ",
                env!("CARGO_PKG_VERSION"),
                ")"
            )),
        );
        h
    }

    async fn send_once(&self, req: &ApiRequest) -> Result<Response, reqwest::Error> {
        let route = req.route.trim_start_matches('/');
        let url = format!("{}/{}", self.base_url, route);
        let mut headers = self.default_headers();
        headers.extend(req.headers.clone());
        let mut builder = self.client.request(req.method.clone(), &url).headers(headers);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(ref body) = req.body {
            builder = builder.json(body);
        }
        builder.send().await
    }

    /// Send a request under its bucket's lease and classify the response.
    ///
    /// 429s are retried in place after the governor's delay; 5xx responses are
    /// retried up to `maxServerErrorAttempts`; 401 is never retried.
    pub async fn request(&self, req: ApiRequest) -> Result<Value, HttpError> {
        let key = bucket_key(&req.method, &req.route);
        let mut server_errors = 0u32;
        let mut rate_limits = 0u32;
        loop {
            let lease = self.limiter.acquire(&key).await;
            // the lease is dropped (and the bucket released) if sending fails
            let res = self.send_once(&req).await?;
            let status = res.status();
            let quota = QuotaHeaders::from_headers(res.headers());

            if status == StatusCode::TOO_MANY_REQUESTS {
                let (retry_after, global) = rate_limit_details(res).await;
                self.limiter.rate_limited(lease, retry_after, global);
                rate_limits += 1;
                if rate_limits > self.settings.max_rate_limit_retries {
                    return Err(HttpError::RateLimited {
                        retry_after,
                        global,
                    });
                }
                continue;
            }

            self.limiter.release(lease, quota.remaining, quota.reset_after);

            if status.is_success() {
                return decode_body(res).await;
            }
            if status.is_server_error() {
                server_errors += 1;
                if server_errors >= self.settings.max_server_error_attempts.max(1) {
                    return Err(HttpError::InternalServerError {
                        status: status.as_u16(),
                    });
                }
                let backoff = self.settings.retry_backoff() * server_errors;
                log::warn!(
                    "{} {} returned {}, retrying in {:?}",
                    req.method,
                    req.route,
                    status,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                continue;
            }
            return Err(client_error(status, res).await);
        }
    }

    pub async fn get(&self, route: &str) -> Result<Value, HttpError> {
        self.request(ApiRequest::new(Method::GET, route)).await
    }

    pub async fn post(&self, route: &str, body: Value) -> Result<Value, HttpError> {
        self.request(ApiRequest::new(Method::POST, route).json(body)).await
    }

    pub async fn patch(&self, route: &str, body: Value) -> Result<Value, HttpError> {
        self.request(ApiRequest::new(Method::PATCH, route).json(body)).await
    }

    pub async fn delete(&self, route: &str) -> Result<Value, HttpError> {
        self.request(ApiRequest::new(Method::DELETE, route)).await
    }

    /// GET /gateway/bot: connect URL, recommended shards, and identify budget.
    pub async fn gateway_bot(&self) -> Result<GatewayInfo, HttpError> {
        let v = self.get("/gateway/bot").await?;
        Ok(serde_json::from_value(v)?)
    }

    /// GET /users/@me: the user the token belongs to.
    pub async fn current_user(&self) -> Result<Value, HttpError> {
        self.get("/users/@me").await
    }
}

/// retry_after/global from a 429 body, falling back to headers.
async fn rate_limit_details(res: Response) -> (Duration, bool) {
    let headers = res.headers().clone();
    let header_global = header_str(&headers, HEADER_GLOBAL)
        .map(|s| s.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let header_retry = header_str(&headers, HEADER_RETRY_AFTER)
        .and_then(seconds)
        .or_else(|| header_str(&headers, HEADER_RESET_AFTER).and_then(seconds));
    match res.json::<RateLimitBody>().await {
        Ok(body) => (
            Duration::try_from_secs_f64(body.retry_after).unwrap_or(Duration::from_secs(1)),
            body.global || header_global,
        ),
        Err(e) => {
            log::debug!("429 without a readable body: {}", e);
            (header_retry.unwrap_or(Duration::from_secs(1)), header_global)
        }
    }
}

async fn decode_body(res: Response) -> Result<Value, HttpError> {
    let bytes = res.bytes().await?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

async fn client_error(status: StatusCode, res: Response) -> HttpError {
    let body: ErrorBody = match res.bytes().await {
        Ok(b) => serde_json::from_slice(&b).unwrap_or_default(),
        Err(_) => ErrorBody::default(),
    };
    let message = if body.message.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    } else {
        body.message
    };
    match status {
        StatusCode::UNAUTHORIZED => HttpError::Unauthorized,
        StatusCode::FORBIDDEN => HttpError::Forbidden {
            code: body.code,
            message,
        },
        StatusCode::NOT_FOUND => HttpError::NotFound {
            code: body.code,
            message,
        },
        _ => HttpError::Client {
            status: status.as_u16(),
            code: body.code,
            message,
        },
    }
}
