use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::transport::{HttpTransport, PreparedUpstream};

/// Shared application state accessible to all handlers.
///
/// Read-only after startup; sessions never write to it.
#[derive(Debug)]
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    pub upstream: PreparedUpstream,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, transport: HttpTransport, upstream: PreparedUpstream) -> Self {
        Self {
            config,
            transport,
            upstream,
        }
    }

    /// Build the transport and prepared upstream from a validated config.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] or [`GatewayError::Transport`] when
    /// the upstream settings cannot be turned into a client.
    pub fn from_config(config: AppConfig) -> Result<Self, GatewayError> {
        let upstream = PreparedUpstream::new(&config.upstream)?;
        let transport = HttpTransport::new(&config.server, upstream.proxy())?;
        Ok(Self::new(config, transport, upstream))
    }

    /// Upstream credential for this request, resolved at call time so a
    /// rotated environment variable is picked up without a restart.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when no credential is configured.
    pub fn upstream_api_key(&self) -> Result<String, GatewayError> {
        self.config.upstream.resolve_api_key().ok_or_else(|| {
            GatewayError::Config(format!(
                "upstream API key is not configured (set upstream.api_key or {})",
                self.config.upstream.api_key_env
            ))
        })
    }

    #[must_use]
    pub fn has_upstream_credential(&self) -> bool {
        self.config.upstream.resolve_api_key().is_some()
    }
}
