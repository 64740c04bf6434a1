use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// A missing upstream credential is not a validation failure: it is reported to
/// callers per request.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream(config)?;
    validate_cors(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.connect_timeout_secs == 0 {
        return Err(validation_err(
            "server.connect_timeout_secs must be greater than 0",
        ));
    }
    if server.stream_max_duration_secs == 0 {
        return Err(validation_err(
            "server.stream_max_duration_secs must be greater than 0",
        ));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(max_blocking_threads) = server.runtime_max_blocking_threads {
        if max_blocking_threads == 0 {
            return Err(validation_err(
                "server.runtime_max_blocking_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(listener_count) = server.tcp_reuse_port_listener_count {
        if listener_count == 0 {
            return Err(validation_err(
                "server.tcp_reuse_port_listener_count must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    let parsed = url::Url::parse(upstream.base_url.trim())
        .map_err(|err| validation_err(format!("upstream.base_url is not a valid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(
            "upstream.base_url must start with http:// or https://",
        ));
    }
    if upstream.model.trim().is_empty() {
        return Err(validation_err("upstream.model cannot be empty"));
    }
    validate_proxy_url(upstream.proxy.as_deref())?;

    if let Some(temperature) = upstream.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(validation_err(
                "upstream.temperature must be between 0 and 2",
            ));
        }
    }
    if let Some(top_p) = upstream.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            return Err(validation_err("upstream.top_p must be between 0 and 1"));
        }
    }
    if upstream.max_tokens == Some(0) {
        return Err(validation_err(
            "upstream.max_tokens must be greater than 0 when set",
        ));
    }
    Ok(())
}

fn validate_proxy_url(proxy: Option<&str>) -> Result<(), ConfigError> {
    let Some(proxy) = proxy.map(str::trim) else {
        return Ok(());
    };
    if proxy.is_empty() {
        return Err(validation_err("upstream.proxy cannot be empty when set"));
    }
    let parsed = url::Url::parse(proxy)
        .map_err(|err| validation_err(format!("upstream.proxy is not a valid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(
            "upstream.proxy must use http:// or https://",
        ));
    }
    Ok(())
}

fn validate_cors(config: &AppConfig) -> Result<(), ConfigError> {
    if config.cors.allowed_origins.is_empty() {
        return Err(validation_err("cors.allowed_origins cannot be empty"));
    }
    for origin in &config.cors.allowed_origins {
        if origin.trim().is_empty() {
            return Err(validation_err("cors.allowed_origins contains an empty origin"));
        }
        if http::HeaderValue::from_str(origin).is_err() {
            return Err(validation_err(format!(
                "cors.allowed_origins entry '{origin}' is not a valid header value"
            )));
        }
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}
