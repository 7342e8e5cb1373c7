//! Bounded, rate-limited API client.
//!
//! Every call flows through the same pipeline:
//!
//! ```text
//! pool permit -> before hooks -> RateLimiter::admit -> Transport::send
//!             -> RateLimiter::record_response -> after hook -> classification
//! ```
//!
//! The client never retries. Transport errors and non-2xx statuses are
//! returned to the caller, which owns the retry policy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::AppError;
use crate::rate_limit::{RateLimitHeaders, RateLimiter};
use crate::request::{ApiRequest, ApiResponse};
use crate::traits::{RequestHook, ResponseAction, ResponseHook, Transport};

/// Bytes of a failed response body kept in the error message.
const ERROR_BODY_LIMIT: usize = 512;

/// Configuration for [`AsyncClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL relative request paths are resolved against.
    pub endpoint: String,
    /// Size of the worker pool: maximum calls in flight.
    pub concurrency: usize,
    /// Per-request timeout, enforced by the transport.
    pub timeout: Duration,
    /// Static ceiling used until the server reports its own limit.
    pub requests_per_hour: Option<u32>,
    /// Statuses degraded to a soft-skip instead of an error.
    pub ignore_statuses: Vec<u16>,
    pub rate_limit_headers: RateLimitHeaders,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            concurrency: 10,
            timeout: Duration::from_secs(120),
            requests_per_hour: None,
            ignore_statuses: Vec::new(),
            rate_limit_headers: RateLimitHeaders::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Load from `API_ENDPOINT`, `API_CONCURRENCY`, `API_TIMEOUT` (seconds)
    /// and `API_REQUESTS_PER_HOUR`.
    pub fn from_env() -> Result<Self, AppError> {
        let endpoint = std::env::var("API_ENDPOINT")
            .map_err(|_| AppError::ConfigError("API_ENDPOINT must be set".into()))?;
        let mut config = Self::new(endpoint);

        if let Some(n) = env_parse::<usize>("API_CONCURRENCY")? {
            config.concurrency = n;
        }
        if let Some(secs) = env_parse::<u64>("API_TIMEOUT")? {
            config.timeout = Duration::from_secs(secs);
        }
        config.requests_per_hour = env_parse::<u32>("API_REQUESTS_PER_HOUR")?;
        Ok(config)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_requests_per_hour(mut self, requests: u32) -> Self {
        self.requests_per_hour = Some(requests);
        self
    }

    pub fn with_ignore_status(mut self, status: u16) -> Self {
        self.ignore_statuses.push(status);
        self
    }

    pub fn with_rate_limit_headers(mut self, headers: RateLimitHeaders) -> Self {
        self.rate_limit_headers = headers;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, AppError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AppError::ConfigError(format!("{name} is not valid: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

struct ClientInner<T> {
    transport: T,
    endpoint: Url,
    pool: Semaphore,
    limiter: RateLimiter,
    request_hooks: Vec<Arc<dyn RequestHook>>,
    response_hook: Option<Arc<dyn ResponseHook>>,
    ignore_statuses: Vec<u16>,
    unauthorized: AtomicBool,
}

/// Cheaply cloneable handle to a shared worker pool and rate limiter.
pub struct AsyncClient<T> {
    inner: Arc<ClientInner<T>>,
}

impl<T> Clone for AsyncClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`AsyncClient`].
pub struct AsyncClientBuilder<T> {
    transport: T,
    config: ClientConfig,
    limiter: Option<RateLimiter>,
    request_hooks: Vec<Arc<dyn RequestHook>>,
    response_hook: Option<Arc<dyn ResponseHook>>,
}

impl<T: Transport> AsyncClientBuilder<T> {
    /// Append a hook. Hooks run in insertion order.
    pub fn with_request_hook(mut self, hook: impl RequestHook + 'static) -> Self {
        self.request_hooks.push(Arc::new(hook));
        self
    }

    pub fn with_response_hook(mut self, hook: impl ResponseHook + 'static) -> Self {
        self.response_hook = Some(Arc::new(hook));
        self
    }

    /// Share an existing limiter, e.g. between clients of one connection.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn build(self) -> Result<AsyncClient<T>, AppError> {
        if self.config.concurrency == 0 {
            return Err(AppError::ConfigError(
                "Client concurrency must be at least 1".into(),
            ));
        }
        let endpoint = parse_endpoint(&self.config.endpoint)?;
        let limiter = self.limiter.unwrap_or_else(|| {
            RateLimiter::new(
                self.config.rate_limit_headers.clone(),
                self.config.requests_per_hour,
            )
        });

        Ok(AsyncClient {
            inner: Arc::new(ClientInner {
                transport: self.transport,
                endpoint,
                pool: Semaphore::new(self.config.concurrency),
                limiter,
                request_hooks: self.request_hooks,
                response_hook: self.response_hook,
                ignore_statuses: self.config.ignore_statuses,
                unauthorized: AtomicBool::new(false),
            }),
        })
    }
}

/// Endpoints always end with `/` so relative paths append to them.
fn parse_endpoint(raw: &str) -> Result<Url, AppError> {
    let mut url = Url::parse(raw)
        .map_err(|e| AppError::ConfigError(format!("Invalid endpoint '{raw}': {e}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

impl<T: Transport> AsyncClient<T> {
    pub fn builder(transport: T, config: ClientConfig) -> AsyncClientBuilder<T> {
        AsyncClientBuilder {
            transport,
            config,
            limiter: None,
            request_hooks: Vec::new(),
            response_hook: None,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// True once any call has been rejected with 401.
    pub fn is_unauthorized(&self) -> bool {
        self.inner.unauthorized.load(Ordering::Acquire)
    }

    /// Resolve a possibly relative URL against the endpoint.
    pub fn resolve(&self, url: &str) -> Result<Url, AppError> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .inner
                .endpoint
                .join(url)
                .map_err(|e| AppError::InvalidInput(format!("Invalid request path '{url}': {e}"))),
            Err(e) => Err(AppError::InvalidInput(format!("Invalid URL '{url}': {e}"))),
        }
    }

    /// Execute one call inside the worker pool.
    ///
    /// Cancellation is honoured while waiting for a permit, for the rate
    /// limiter and for the transport.
    pub async fn execute(
        &self,
        mut request: ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, AppError> {
        if self.is_unauthorized() {
            return Err(AppError::Unauthorized {
                url: self.inner.endpoint.to_string(),
            });
        }

        let _permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            permit = self.inner.pool.acquire() => permit
                .map_err(|_| AppError::Generic("Client worker pool closed".into()))?,
        };

        request.url = self.resolve(&request.url)?.to_string();
        for hook in &self.inner.request_hooks {
            hook.before_request(&mut request)?;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            () = self.inner.limiter.admit() => {}
        }

        tracing::debug!(method = %request.method, url = %request.url, "Sending request");
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            response = self.inner.transport.send(&request) => response?,
        };

        if let Err(e) = self.inner.limiter.record_response(&response.headers) {
            tracing::warn!(url = %response.url, error = %e, "Ignoring malformed rate limit headers");
        }

        self.classify(response)
    }

    fn classify(&self, response: ApiResponse) -> Result<ApiResponse, AppError> {
        let action = self
            .inner
            .response_hook
            .as_ref()
            .map_or(ResponseAction::Continue, |hook| hook.after_response(&response));

        match action {
            ResponseAction::Continue => {}
            ResponseAction::Ignore => {
                return Err(AppError::Ignored {
                    status: response.status,
                    url: response.url,
                });
            }
            ResponseAction::Unauthorized => return Err(self.mark_unauthorized(response.url)),
            ResponseAction::Fail(body) => {
                return Err(AppError::HttpStatus {
                    status: response.status,
                    url: response.url,
                    body,
                });
            }
        }

        if response.status == 401 {
            return Err(self.mark_unauthorized(response.url));
        }
        if self.inner.ignore_statuses.contains(&response.status) {
            tracing::debug!(status = response.status, url = %response.url, "Ignoring response status");
            return Err(AppError::Ignored {
                status: response.status,
                url: response.url,
            });
        }
        if !response.is_success() {
            return Err(AppError::HttpStatus {
                status: response.status,
                body: response.text_snippet(ERROR_BODY_LIMIT),
                url: response.url,
            });
        }
        Ok(response)
    }

    fn mark_unauthorized(&self, url: String) -> AppError {
        if !self.inner.unauthorized.swap(true, Ordering::AcqRel) {
            tracing::error!(%url, "Credentials rejected, failing all further calls");
        }
        AppError::Unauthorized { url }
    }
}
