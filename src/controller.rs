//! Replenishment state machine.
//!
//! One cycle runs `Idle -> Checking -> (Replenishing)? -> Idle`:
//!
//! 1. **Checking** re-validates every usable proxy, together with anything left
//!    in the validated role by an interrupted cycle.
//! 2. If either protocol ends up below its minimum, **Replenishing** starts
//!    every discovery pipeline and polls the store until both protocols reach
//!    their minimum, then ends the pipelines.
//! 3. The validated set replaces the usable set for both protocols.
//!
//! Cycles never overlap: a cycle requested while another runs is skipped.

use crate::config::ProxyPoolConfig;
use crate::error::PoolError;
use crate::pipeline::DiscoveryPipeline;
use crate::proxy::{Protocol, ProxyRecord};
use crate::store::{ProxyStore, Role};
use crate::validator::{ValidationItem, Validator};

use futures::future;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, Instant};

/// Where the controller is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Checking,
    Replenishing,
}

/// Result of one check cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was already running.
    Skipped,
    /// Enough proxies survived re-validation; no crawl was needed.
    Healthy { http: usize, https: usize },
    /// The pipelines ran and the pool was refilled.
    Replenished { http: usize, https: usize },
}

/// Drives validation and discovery to keep the usable pool above its minimum.
pub struct Replenisher {
    config: ProxyPoolConfig,
    store: Arc<dyn ProxyStore>,
    validator: Validator,
    pipelines: Vec<DiscoveryPipeline>,
    state: Mutex<CycleState>,
    cycle: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl Replenisher {
    pub fn new(
        config: ProxyPoolConfig,
        store: Arc<dyn ProxyStore>,
        validator: Validator,
        pipelines: Vec<DiscoveryPipeline>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            validator,
            pipelines,
            state: Mutex::new(CycleState::Idle),
            cycle: tokio::sync::Mutex::new(()),
            shutdown,
        }
    }

    /// Current cycle state.
    pub fn state(&self) -> CycleState {
        *self.state.lock()
    }

    /// Receiver that flips to `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&self, state: CycleState) {
        *self.state.lock() = state;
    }

    /// Run one check cycle, unless one is already running.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, PoolError> {
        let Ok(_running) = self.cycle.try_lock() else {
            warn!("check cycle already running, skipping");
            return Ok(CycleOutcome::Skipped);
        };
        if self.is_shut_down() {
            return Err(PoolError::Cancelled);
        }

        let result = self.cycle().await;
        self.set_state(CycleState::Idle);
        result
    }

    async fn cycle(&self) -> Result<CycleOutcome, PoolError> {
        self.set_state(CycleState::Checking);
        self.check().await?;

        if self.pool_low().await? {
            self.set_state(CycleState::Replenishing);
            self.replenish().await?;
            let (http, https) = self.promote().await?;
            return Ok(CycleOutcome::Replenished { http, https });
        }

        let (http, https) = self.promote().await?;
        Ok(CycleOutcome::Healthy { http, https })
    }

    /// Re-validate the usable pool plus leftovers from an earlier round.
    ///
    /// Everything is read from the store before the round opens, so a store
    /// failure never leaves a round without its end marker.
    async fn check(&self) -> Result<(), PoolError> {
        info!("start checking proxies");

        let mut pending = Vec::new();
        for protocol in Protocol::ALL {
            let usable = self.store.members(protocol, Role::Usable).await?;
            info!("{} proxies number: {}", protocol, usable.len());
            pending.extend(usable);
        }

        let mut leftovers = Vec::new();
        for protocol in Protocol::ALL {
            match self.store.drain_all(protocol, Role::Validated).await {
                Ok(drained) => leftovers.extend(drained),
                Err(e) => {
                    self.restore_leftovers(leftovers).await;
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = self.validator.start() {
            self.restore_leftovers(leftovers).await;
            return Err(e.into());
        }

        let submitted = pending.len() + leftovers.len();
        for record in pending.into_iter().chain(leftovers) {
            self.validator.submit(ValidationItem::Proxy(record))?;
        }
        self.validator.submit(ValidationItem::End)?;

        let report = self.validator.wait_round_complete().await?;
        info!(
            "re-validated {} proxies: {} passed, {} failed",
            submitted, report.passed, report.failed
        );
        for protocol in Protocol::ALL {
            info!(
                "usable {} proxies number: {}",
                protocol,
                self.store.count(protocol, Role::Validated).await?
            );
        }
        Ok(())
    }

    /// Put drained leftovers back so the next cycle re-validates them.
    async fn restore_leftovers(&self, leftovers: Vec<ProxyRecord>) {
        for record in leftovers {
            let address = record.address.clone();
            if let Err(e) = self.store.add(record.protocol, Role::Validated, record).await {
                error!("cannot restore leftover proxy {}: {}", address, e);
            }
        }
    }

    /// True if any protocol's validated set is below its minimum.
    ///
    /// A shortfall in one protocol replenishes both.
    async fn pool_low(&self) -> Result<bool, PoolError> {
        for protocol in Protocol::ALL {
            let count = self.store.count(protocol, Role::Validated).await?;
            if count < self.config.min_usable(protocol) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn replenish(&self) -> Result<(), PoolError> {
        if self.pipelines.is_empty() {
            warn!("proxy pool is low but no sources are configured");
            return Ok(());
        }

        info!("proxy pool is low, starting {} crawlers", self.pipelines.len());
        for pipeline in &self.pipelines {
            pipeline.start()?;
        }

        let waited = self.wait_until_enough().await;

        let ended = future::join_all(self.pipelines.iter().map(|p| p.end())).await;
        waited?;
        for result in ended {
            result?;
        }
        Ok(())
    }

    /// Poll the store until every protocol meets its minimum.
    async fn wait_until_enough(&self) -> Result<(), PoolError> {
        let deadline = self.config.replenish_timeout.map(|t| Instant::now() + t);
        let mut shutdown = self.shutdown_signal();

        while self.pool_low().await? {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("replenishment timed out");
                return Err(PoolError::ReplenishTimedOut);
            }
            tokio::select! {
                _ = time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
            if self.is_shut_down() {
                return Err(PoolError::Cancelled);
            }
        }
        Ok(())
    }

    /// Swap the validated set into the usable pool for both protocols.
    async fn promote(&self) -> Result<(usize, usize), PoolError> {
        let http = self.store.promote(Protocol::Http).await?;
        let https = self.store.promote(Protocol::Https).await?;
        info!("proxy pool refreshed: {} HTTP, {} HTTPS", http, https);
        Ok((http, https))
    }

    /// Cancel any cycle in progress and shut every pipeline down for good.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let results = future::join_all(self.pipelines.iter().map(|p| p.quit())).await;
        for (pipeline, result) in self.pipelines.iter().zip(results) {
            if let Err(e) = result {
                error!("crawler `{}` did not quit cleanly: {}", pipeline.name(), e);
            }
        }
        info!("replenisher shut down");
    }
}
