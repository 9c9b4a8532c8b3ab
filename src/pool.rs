//! Public face of the proxy pool: reading proxies and controlling the
//! background check cycle.

use crate::config::ProxyPoolConfig;
use crate::controller::{CycleOutcome, CycleState, Replenisher};
use crate::error::{NoProxyAvailable, PoolError};
use crate::pipeline::{DiscoveryPipeline, HttpFetcher, PageFetcher};
use crate::proxy::{Protocol, ProxyRecord};
use crate::source::ProxySource;
use crate::store::{MemoryStore, ProxyStore, Role};
use crate::validator::{EchoProbe, HttpEchoProbe, Validator};

use log::{error, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Sizes of each protocol's roles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub usable_http: usize,
    pub usable_https: usize,
    pub validated_http: usize,
    pub validated_https: usize,
}

/// A self-replenishing pool of validated HTTP and HTTPS proxies.
pub struct ProxyPool {
    /// Configuration for the pool.
    pub config: ProxyPoolConfig,
    store: Arc<dyn ProxyStore>,
    replenisher: Arc<Replenisher>,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyPool {
    /// Create a pool backed by an in-memory store, validating through the
    /// configured echo endpoints and crawling `sources` over HTTP.
    ///
    /// Nothing runs until [`start_periodic_checks`](Self::start_periodic_checks)
    /// or [`check_now`](Self::check_now).
    pub fn new(
        config: ProxyPoolConfig,
        sources: Vec<Arc<dyn ProxySource>>,
    ) -> Result<Arc<Self>, reqwest::Error> {
        let fetcher = Arc::new(HttpFetcher::new(&config)?);
        let probe = Arc::new(HttpEchoProbe::new(&config));
        Ok(Self::with_components(
            config,
            Arc::new(MemoryStore::new()),
            probe,
            fetcher,
            sources,
        ))
    }

    /// Create a pool from explicit collaborators.
    pub fn with_components(
        config: ProxyPoolConfig,
        store: Arc<dyn ProxyStore>,
        probe: Arc<dyn EchoProbe>,
        fetcher: Arc<dyn PageFetcher>,
        sources: Vec<Arc<dyn ProxySource>>,
    ) -> Arc<Self> {
        info!("Initializing proxy pool with {} sources", sources.len());

        let pipelines = sources
            .into_iter()
            .map(|source| {
                DiscoveryPipeline::spawn(
                    &config,
                    source,
                    Arc::clone(&fetcher),
                    Arc::clone(&store),
                    Arc::clone(&probe),
                )
            })
            .collect();
        let validator = Validator::new("checker", &config, Arc::clone(&store), probe);
        let replenisher = Replenisher::new(config.clone(), Arc::clone(&store), validator, pipelines);

        Arc::new(Self {
            config,
            store,
            replenisher: Arc::new(replenisher),
            periodic: Mutex::new(None),
        })
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn ProxyStore> {
        &self.store
    }

    /// Where the check cycle currently is.
    pub fn state(&self) -> CycleState {
        self.replenisher.state()
    }

    /// Run one check cycle now. Skipped if a cycle is already running.
    pub async fn check_now(&self) -> Result<CycleOutcome, PoolError> {
        self.replenisher.run_cycle().await
    }

    /// Run a check cycle immediately and then every `check_interval`.
    /// Calling this again while checks are scheduled has no effect.
    pub fn start_periodic_checks(&self) {
        let mut periodic = self.periodic.lock();
        if periodic.is_some() {
            return;
        }

        let replenisher = Arc::clone(&self.replenisher);
        let mut shutdown = replenisher.shutdown_signal();
        let period = self.config.check_interval.max(Duration::from_millis(1));

        *periodic = Some(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                match replenisher.run_cycle().await {
                    Ok(outcome) => info!("Check cycle finished: {:?}", outcome),
                    Err(PoolError::Cancelled) => break,
                    Err(e) => error!("Check cycle failed: {}", e),
                }
            }
            info!("Periodic checks stopped");
        }));
    }

    /// Stop future cycles, cancel a running one and quit every pipeline.
    pub async fn stop(&self) {
        self.replenisher.shutdown().await;
        let periodic = self.periodic.lock().take();
        if let Some(handle) = periodic {
            if let Err(e) = handle.await {
                error!("Periodic check task died: {}", e);
            }
        }
    }

    /// A random usable proxy record, if there is one.
    pub async fn random_proxy(&self, protocol: Protocol) -> Result<Option<ProxyRecord>, PoolError> {
        Ok(self.store.random_member(protocol, Role::Usable).await?)
    }

    /// A random usable proxy as `host:port`, without waiting.
    pub async fn try_get_proxy(&self, protocol: Protocol) -> Result<String, PoolError> {
        match self.random_proxy(protocol).await? {
            Some(proxy) => Ok(proxy.address.to_string()),
            None => Err(NoProxyAvailable.into()),
        }
    }

    /// A random usable proxy as `host:port`.
    ///
    /// Waits while the pool for `protocol` is empty, polling every
    /// `get_proxy_poll_interval`, for at most `get_proxy_timeout` if set.
    pub async fn get_proxy(&self, protocol: Protocol) -> Result<String, PoolError> {
        let deadline = self.config.get_proxy_timeout.map(|t| Instant::now() + t);
        let mut shutdown = self.replenisher.shutdown_signal();
        loop {
            if let Some(proxy) = self.random_proxy(protocol).await? {
                return Ok(proxy.address.to_string());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(NoProxyAvailable.into());
            }
            if self.replenisher.is_shut_down() {
                return Err(PoolError::Cancelled);
            }
            tokio::select! {
                _ = time::sleep(self.config.get_proxy_poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// True when both protocol pools hold at least one proxy.
    pub async fn is_ready(&self) -> Result<bool, PoolError> {
        for protocol in Protocol::ALL {
            if self.store.count(protocol, Role::Usable).await? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Get statistics about the proxy pool.
    pub async fn get_stats(&self) -> Result<PoolStats, PoolError> {
        Ok(PoolStats {
            usable_http: self.store.count(Protocol::Http, Role::Usable).await?,
            usable_https: self.store.count(Protocol::Https, Role::Usable).await?,
            validated_http: self.store.count(Protocol::Http, Role::Validated).await?,
            validated_https: self.store.count(Protocol::Https, Role::Validated).await?,
        })
    }
}
