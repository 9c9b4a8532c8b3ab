//! Middleware implementation for reqwest.

use crate::config::ProxyPoolConfig;
use crate::error::NoProxyAvailable;
use crate::pool::ProxyPool;
use crate::proxy::Protocol;
use crate::source::ProxySource;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{info, warn};
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;

/// Middleware that sends each request through a usable proxy from the pool.
#[derive(Clone)]
pub struct ProxyPoolMiddleware {
    /// The proxy pool.
    pool: Arc<ProxyPool>,
}

impl ProxyPoolMiddleware {
    /// Create a pool from `config` and `sources`, start its periodic checks
    /// and wrap it.
    pub async fn new(config: ProxyPoolConfig, sources: Vec<Arc<dyn ProxySource>>) -> Result<Self> {
        let pool = ProxyPool::new(config, sources).map_err(Error::Reqwest)?;
        pool.start_periodic_checks();
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: Arc<ProxyPool>) -> Self {
        Self { pool }
    }

    /// The wrapped pool.
    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }
}

#[async_trait]
impl Middleware for ProxyPoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let max_retries = self.pool.config.retry_count;
        let protocol = match req.url().scheme() {
            "https" => Protocol::Https,
            _ => Protocol::Http,
        };
        let mut retry_count = 0;

        loop {
            let proxy = match self.pool.random_proxy(protocol).await {
                Ok(Some(proxy)) => proxy,
                Ok(None) => {
                    warn!("No {} proxy available", protocol);
                    return Err(Error::Middleware(anyhow!(NoProxyAvailable)));
                }
                Err(e) => return Err(Error::Middleware(anyhow!(e))),
            };

            let proxied_request = req.try_clone().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request object is not cloneable. Are you passing a streaming body?"
                        .to_string()
                ))
            })?;

            info!("Using proxy: {} (attempt {})", proxy.address, retry_count + 1);

            let client = match proxy.to_reqwest_proxy().and_then(|p| {
                reqwest::Client::builder()
                    .proxy(p)
                    .timeout(self.pool.config.validation_timeout)
                    .build()
            }) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to build client with proxy {}: {}", proxy.address, e);
                    retry_count += 1;
                    if retry_count > max_retries {
                        return Err(Error::Reqwest(e));
                    }
                    continue;
                }
            };

            match client.execute(proxied_request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(
                        "Request failed with proxy {} (attempt {}): {}",
                        proxy.address,
                        retry_count + 1,
                        err
                    );
                    retry_count += 1;
                    if retry_count > max_retries {
                        return Err(Error::Reqwest(err));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::ScriptedFetcher;
    use crate::proxy::{ProxyAddr, ProxyRecord};
    use crate::store::tests::FlakyStore;
    use crate::store::{ProxyStore, Role};
    use crate::validator::tests::ScriptedProbe;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn client(
        retry_count: usize,
        store: Arc<FlakyStore>,
    ) -> reqwest_middleware::ClientWithMiddleware {
        let config = ProxyPoolConfig::builder()
            .retry_count(retry_count)
            .validation_timeout(Duration::from_secs(2))
            .build();
        let pool = ProxyPool::with_components(
            config,
            store,
            Arc::new(ScriptedProbe::default()),
            Arc::new(ScriptedFetcher::default()),
            Vec::new(),
        );
        reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(ProxyPoolMiddleware::from_pool(pool))
            .build()
    }

    /// A proxy on a port nothing listens on.
    fn unreachable(protocol: Protocol) -> ProxyRecord {
        ProxyRecord::new(ProxyAddr::new("127.0.0.1", 1), protocol, "test", 1.0)
    }

    fn is_no_proxy(err: &Error) -> bool {
        matches!(err, Error::Middleware(e) if e.downcast_ref::<NoProxyAvailable>().is_some())
    }

    #[tokio::test]
    async fn empty_pool_fails_without_sending() {
        let store = Arc::new(FlakyStore::default());
        let client = client(3, Arc::clone(&store));

        let err = assert_err!(client.get("http://example.com/").send().await);
        assert!(is_no_proxy(&err));
        assert_eq!(store.random_member_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn url_scheme_selects_the_protocol_pool() {
        let store = Arc::new(FlakyStore::default());
        assert_ok!(store.add(Protocol::Https, Role::Usable, unreachable(Protocol::Https)).await);
        let client = client(0, Arc::clone(&store));

        let err = assert_err!(client.get("http://example.com/").send().await);
        assert!(is_no_proxy(&err));

        let err = assert_err!(client.get("https://example.com/").send().await);
        assert!(matches!(err, Error::Reqwest(_)));
    }

    #[tokio::test]
    async fn failed_request_is_retried_up_to_retry_count() {
        let store = Arc::new(FlakyStore::default());
        assert_ok!(store.add(Protocol::Http, Role::Usable, unreachable(Protocol::Http)).await);
        let client = client(1, Arc::clone(&store));

        let err = assert_err!(client.get("http://example.com/").send().await);
        assert!(matches!(err, Error::Reqwest(_)));
        // First attempt plus one retry, each with a fresh pick.
        assert_eq!(store.random_member_calls.load(Ordering::SeqCst), 2);
    }
}
