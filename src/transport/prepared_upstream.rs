use crate::config::UpstreamConfig;
use crate::error::GatewayError;

/// Generation parameters applied when the caller leaves them unset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationDefaults {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
}

/// Precomputed upstream metadata used by the request path.
#[derive(Debug, Clone)]
pub struct PreparedUpstream {
    completions_url: url::Url,
    host: String,
    model: String,
    proxy: Option<String>,
    defaults: GenerationDefaults,
    static_headers: http::HeaderMap,
}

impl PreparedUpstream {
    /// Build the prepared upstream from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when the base URL cannot be parsed.
    pub fn new(upstream: &UpstreamConfig) -> Result<Self, GatewayError> {
        let base = upstream.base_url.trim().trim_end_matches('/');
        let completions_url = url::Url::parse(&format!("{base}/chat/completions"))
            .map_err(|err| GatewayError::Config(format!("invalid upstream base_url: {err}")))?;
        let host = completions_url
            .host_str()
            .map(|host| match completions_url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            })
            .unwrap_or_default();

        let mut static_headers = http::HeaderMap::new();
        static_headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        static_headers.insert(
            http::header::ACCEPT,
            http::HeaderValue::from_static("text/event-stream"),
        );

        Ok(Self {
            completions_url,
            host,
            model: upstream.model.trim().to_string(),
            proxy: normalize_proxy(upstream.proxy.as_deref()),
            defaults: GenerationDefaults {
                temperature: upstream.temperature,
                max_tokens: upstream.max_tokens,
                top_p: upstream.top_p,
            },
            static_headers,
        })
    }

    #[must_use]
    pub fn completions_url(&self) -> &url::Url {
        &self.completions_url
    }

    /// `host[:port]` of the upstream, for health output and logs.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    #[must_use]
    pub fn defaults(&self) -> &GenerationDefaults {
        &self.defaults
    }

    /// Request headers for one upstream call carrying `api_key` as a bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when the key contains characters that
    /// cannot appear in a header value.
    pub fn build_headers(&self, api_key: &str) -> Result<http::HeaderMap, GatewayError> {
        let mut headers = self.static_headers.clone();
        let mut value = http::HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
            GatewayError::Config("upstream credential is not a valid header value".to_string())
        })?;
        value.set_sensitive(true);
        headers.insert(http::header::AUTHORIZATION, value);
        Ok(headers)
    }
}

fn normalize_proxy(proxy: Option<&str>) -> Option<String> {
    proxy.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
