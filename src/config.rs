use once_cell::sync::Lazy;

/// Secret used for JWT verification. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Directory holding the plugin registry and config JSON files. Defaults to `./plugins-data`.
pub static PLUGINS_DIR: Lazy<String> =
    Lazy::new(|| std::env::var("PLUGINS_DIR").unwrap_or_else(|_| "plugins-data".to_string()));

/// Address the HTTP server binds to. Defaults to `0.0.0.0:8080`.
pub static BIND_ADDR: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()));

/// Payment environment. Anything other than `production` selects sandbox credentials.
pub static PAYMENT_ENV: Lazy<String> =
    Lazy::new(|| std::env::var("PAYMENT_ENV").unwrap_or_else(|_| "sandbox".to_string()));

/// Base URL redirect targets are built from when the request carries no Origin.
pub static FRONTEND_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
});

/// Timeout in seconds applied to every outbound provider call.
pub static PROVIDER_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("PROVIDER_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(15)
});

/// TTL in seconds for cached idempotency records.
pub static IDEMPOTENCY_TTL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("IDEMPOTENCY_TTL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(24 * 60 * 60)
});
