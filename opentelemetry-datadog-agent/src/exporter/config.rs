use std::env;

// https://docs.datadoghq.com/tracing/trace_collection/library_config/
const DD_TRACE_AGENT_URL_ENV_VAR: &str = "DD_TRACE_AGENT_URL";
const DD_AGENT_HOST_ENV_VAR: &str = "DD_AGENT_HOST";
const DD_TRACE_AGENT_PORT_ENV_VAR: &str = "DD_TRACE_AGENT_PORT";
const DD_SERVICE_ENV_VAR: &str = "DD_SERVICE";

/// Agent host used when neither the builder nor the environment name one.
pub const DEFAULT_AGENT_HOST: &str = "localhost";
/// Agent trace port used when neither the builder nor the environment name one.
pub const DEFAULT_AGENT_PORT: &str = "8126";
/// Service name used when neither the builder, the environment nor the resource
/// name one.
pub const DEFAULT_SERVICE_NAME: &str = "unknown_service";

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// `DD_TRACE_AGENT_URL`, otherwise `http://$DD_AGENT_HOST:$DD_TRACE_AGENT_PORT`.
pub(crate) fn agent_endpoint_from_env() -> String {
    if let Some(url) = non_empty_var(DD_TRACE_AGENT_URL_ENV_VAR) {
        return url;
    }
    let host = non_empty_var(DD_AGENT_HOST_ENV_VAR);
    let port = non_empty_var(DD_TRACE_AGENT_PORT_ENV_VAR);
    format!(
        "http://{}:{}",
        host.as_deref().unwrap_or(DEFAULT_AGENT_HOST),
        port.as_deref().unwrap_or(DEFAULT_AGENT_PORT)
    )
}

pub(crate) fn service_name_from_env() -> Option<String> {
    non_empty_var(DD_SERVICE_ENV_VAR)
}
