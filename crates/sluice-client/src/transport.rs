use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use sluice_core::client::ClientConfig;
use sluice_core::error::AppError;
use sluice_core::request::{ApiRequest, ApiResponse, Method};
use sluice_core::traits::Transport;
use url::Url;

/// HTTP transport using reqwest.
///
/// Returns every HTTP status as a response; only connection-level failures
/// become errors. Status classification is left to the
/// [`AsyncClient`](sluice_core::client::AsyncClient).
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout_secs: u64,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(ClientConfig::default().timeout)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        Self::build(timeout, None)
    }

    /// Transport matching a client configuration, optionally through a proxy
    /// (`http://`, `https://` or `socks5://`).
    pub fn from_config(config: &ClientConfig, proxy: Option<&str>) -> Result<Self, AppError> {
        Self::build(config.timeout, proxy)
    }

    fn build(timeout: Duration, proxy: Option<&str>) -> Result<Self, AppError> {
        let mut builder = Client::builder()
            .user_agent(concat!("Sluice/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout);
        if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| AppError::ConfigError(format!("Invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
        })
    }

    fn map_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::HttpError(e.to_string())
        }
    }
}

/// Request URL with the query pairs appended.
fn request_url(request: &ApiRequest) -> Result<Url, AppError> {
    let mut url = Url::parse(&request.url)
        .map_err(|e| AppError::InvalidInput(format!("Invalid URL '{}': {e}", request.url)))?;
    if !request.query.is_empty() {
        url.query_pairs_mut().extend_pairs(&request.query);
    }
    Ok(url)
}

impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, AppError> {
        let url = request_url(request)?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))?
            .to_vec();

        Ok(ApiResponse {
            status,
            url,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_are_appended_and_encoded() {
        let request = ApiRequest::get("https://gitlab.example.com/api/v4/projects/37/issues?scope=all")
            .with_query("page", "2")
            .with_query("updated_after", "2024-05-03T12:00:00Z");
        let url = request_url(&request).unwrap();
        assert_eq!(
            url.as_str(),
            "https://gitlab.example.com/api/v4/projects/37/issues?scope=all&page=2&updated_after=2024-05-03T12%3A00%3A00Z"
        );
    }

    #[test]
    fn relative_url_is_rejected() {
        let err = request_url(&ApiRequest::get("projects/37")).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn invalid_proxy_is_config_error() {
        let config = ClientConfig::new("https://gitlab.example.com/api/v4");
        assert!(matches!(
            ReqwestTransport::from_config(&config, Some("not a proxy url")),
            Err(AppError::ConfigError(_))
        ));
    }
}
