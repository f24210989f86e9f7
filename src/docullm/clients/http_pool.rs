//! Shared HTTP connection pool for provider and Git-host calls.

use lazy_static::lazy_static;
use std::time::Duration;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client instance keeps TLS sessions and DNS lookups warm,
    /// which significantly reduces latency when many concurrent turns issue
    /// requests to the same upstream hosts. Per-call deadlines are applied
    /// on the individual request builders, not here.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
///
/// The returned reference can be cloned and reused by individual clients and
/// adapters.
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}
