use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::GatewayError;

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    connect_timeout: Duration,
    use_env_proxy: bool,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, GatewayError> {
    // No total timeout: streaming bodies are bounded by the session deadline instead.
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| GatewayError::Transport(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| GatewayError::Transport(format!("Failed to build HTTP client: {err}")))
}

fn describe_send_error(err: &reqwest::Error) -> String {
    if err.is_connect() {
        format!("upstream connection failed: {err}")
    } else if err.is_timeout() {
        format!("upstream request timed out: {err}")
    } else {
        format!("upstream request failed: {err}")
    }
}

/// Pooled HTTP client for the upstream provider.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    connect_timeout: Duration,
}

impl HttpTransport {
    /// Build the transport from server pool settings and the optional upstream proxy.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the proxy URL is rejected or the
    /// client cannot be built.
    pub fn new(config: &ServerConfig, proxy_url: Option<&str>) -> Result<Self, GatewayError> {
        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
        let client = build_reqwest_client(
            config.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            connect_timeout,
            config.http_use_env_proxy,
            proxy_url,
        )?;
        Ok(Self {
            client,
            connect_timeout,
        })
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// POST a streaming request. The caller reads the response body incrementally.
    ///
    /// Any HTTP status is returned as a response; only transport failures are errors.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the connection cannot be
    /// established or the request cannot be sent.
    pub async fn send_stream(
        &self,
        url: &url::Url,
        headers: &http::HeaderMap,
        body: bytes::Bytes,
    ) -> Result<reqwest::Response, GatewayError> {
        self.client
            .post(url.clone())
            .headers(headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(describe_send_error(&err)))
    }
}
