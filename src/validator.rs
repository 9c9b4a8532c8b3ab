//! Bounded-concurrency proxy validation.
//!
//! A proxy passes when it completes `validation_attempts` echo requests in a
//! row: each must succeed, must not redirect, and must report the proxy's own
//! host as the request origin. Passing proxies are written to the store's
//! validated role; failures leave no trace.

use crate::config::ProxyPoolConfig;
use crate::error::{PoolError, ProbeError, StoreError, ValidatorError};
use crate::proxy::{Protocol, ProxyRecord};
use crate::store::{ProxyStore, Role};

use async_trait::async_trait;
use futures::FutureExt;
use http::StatusCode;
use log::{debug, error, info};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

/// Interval at which round completion is polled.
const ROUND_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the echo endpoint reported for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct EchoReply {
    pub status: StatusCode,
    /// The request was answered with a redirect.
    pub redirected: bool,
    /// Apparent origin address of the request.
    pub origin: String,
}

impl EchoReply {
    /// Whether this reply proves the request went out through `host`.
    pub fn confirms(&self, host: &str) -> bool {
        self.status.is_success() && !self.redirected && self.origin.trim() == host
    }
}

/// One echo request through a proxy.
#[async_trait]
pub trait EchoProbe: Send + Sync {
    async fn echo(&self, record: &ProxyRecord) -> Result<EchoReply, ProbeError>;
}

#[derive(Deserialize)]
struct EchoBody {
    origin: Option<String>,
}

/// Probe that asks an httpbin-style endpoint for the request origin.
pub struct HttpEchoProbe {
    echo_url_http: String,
    echo_url_https: String,
    timeout: Duration,
}

impl HttpEchoProbe {
    pub fn new(config: &ProxyPoolConfig) -> Self {
        Self {
            echo_url_http: config.echo_url_http.clone(),
            echo_url_https: config.echo_url_https.clone(),
            timeout: config.validation_timeout,
        }
    }
}

#[async_trait]
impl EchoProbe for HttpEchoProbe {
    async fn echo(&self, record: &ProxyRecord) -> Result<EchoReply, ProbeError> {
        let client = reqwest::Client::builder()
            .proxy(record.to_reqwest_proxy()?)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.timeout)
            .pool_max_idle_per_host(0)
            .build()?;

        let url = match record.protocol {
            Protocol::Http => &self.echo_url_http,
            Protocol::Https => &self.echo_url_https,
        };

        let resp = client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Ok(EchoReply {
                status,
                redirected: status.is_redirection(),
                origin: String::new(),
            });
        }

        let body: EchoBody = resp.json().await?;
        let origin = body.origin.ok_or(ProbeError::MissingOrigin)?;
        Ok(EchoReply {
            status,
            redirected: false,
            origin,
        })
    }
}

/// Item accepted by [`Validator::submit`].
#[derive(Debug, Clone)]
pub enum ValidationItem {
    /// A proxy to validate.
    Proxy(ProxyRecord),
    /// End of the round: drain in-flight work and exit.
    End,
}

/// Tally of one finished round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub passed: usize,
    pub failed: usize,
    /// Items that arrived after the end marker and were dropped.
    pub discarded: usize,
}

enum Verdict {
    Passed,
    Failed,
}

struct Round {
    tx: UnboundedSender<ValidationItem>,
    handle: JoinHandle<Result<RoundReport, PoolError>>,
}

/// Validates proxies in rounds, with at most `validator_workers` in flight.
pub struct Validator {
    name: String,
    store: Arc<dyn ProxyStore>,
    probe: Arc<dyn EchoProbe>,
    attempts: usize,
    workers: usize,
    round: Mutex<Option<Round>>,
}

impl Validator {
    pub fn new(
        name: impl Into<String>,
        config: &ProxyPoolConfig,
        store: Arc<dyn ProxyStore>,
        probe: Arc<dyn EchoProbe>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            probe,
            attempts: config.validation_attempts,
            workers: config.validator_workers,
            round: Mutex::new(None),
        }
    }

    /// Start a new round.
    ///
    /// Fails with [`ValidatorError::RoundInProgress`] while the previous
    /// round's workers are still running.
    pub fn start(&self) -> Result<(), ValidatorError> {
        let mut round = self.round.lock();
        if let Some(previous) = round.take() {
            if !previous.handle.is_finished() {
                *round = Some(previous);
                return Err(ValidatorError::RoundInProgress);
            }
            if let Some(Ok(Err(e))) = previous.handle.now_or_never() {
                error!("validator `{}`: uncollected round failed: {}", self.name, e);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = RoundWorker {
            name: self.name.clone(),
            store: Arc::clone(&self.store),
            probe: Arc::clone(&self.probe),
            attempts: self.attempts,
            workers: self.workers,
        };
        let handle = tokio::spawn(worker.run(rx));
        *round = Some(Round { tx, handle });
        debug!("validator `{}`: round started", self.name);
        Ok(())
    }

    /// Queue an item for the current round. Never blocks.
    ///
    /// Items sent after the round already closed are dropped.
    pub fn submit(&self, item: ValidationItem) -> Result<(), ValidatorError> {
        let round = self.round.lock();
        let round = round.as_ref().ok_or(ValidatorError::NotStarted)?;
        if let Err(mpsc::error::SendError(item)) = round.tx.send(item) {
            debug!("validator `{}`: round closed, dropping {:?}", self.name, item);
        }
        Ok(())
    }

    /// True once the round's workers have all exited. Also true when no
    /// round was ever started.
    pub fn is_round_complete(&self) -> bool {
        self.round
            .lock()
            .as_ref()
            .map_or(true, |round| round.handle.is_finished())
    }

    /// Block until the current round is complete and collect its report.
    ///
    /// A store failure during the round is returned here, as is
    /// [`PoolError::RoundAborted`] when the round or one of its validation
    /// tasks died.
    pub async fn wait_round_complete(&self) -> Result<RoundReport, PoolError> {
        while !self.is_round_complete() {
            tokio::time::sleep(ROUND_POLL_INTERVAL).await;
        }
        let finished = self.round.lock().take();
        let Some(round) = finished else {
            return Ok(RoundReport::default());
        };
        match round.handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("validator `{}`: round task died: {}", self.name, e);
                Err(PoolError::RoundAborted(self.name.clone()))
            }
        }
    }
}

struct RoundWorker {
    name: String,
    store: Arc<dyn ProxyStore>,
    probe: Arc<dyn EchoProbe>,
    attempts: usize,
    workers: usize,
}

impl RoundWorker {
    async fn run(
        self,
        mut rx: UnboundedReceiver<ValidationItem>,
    ) -> Result<RoundReport, PoolError> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut report = RoundReport::default();
        let mut failure = None;

        while let Some(item) = rx.recv().await {
            let record = match item {
                ValidationItem::Proxy(record) => record,
                ValidationItem::End => break,
            };
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            while let Some(done) = tasks.try_join_next() {
                tally(&self.name, done, &mut report, &mut failure);
            }

            debug!("validator `{}`: testing {}", self.name, record.address);
            let store = Arc::clone(&self.store);
            let probe = Arc::clone(&self.probe);
            let attempts = self.attempts;
            tasks.spawn(async move {
                let _permit = permit;
                if !validate(probe.as_ref(), &record, attempts).await {
                    return Ok::<_, StoreError>(Verdict::Failed);
                }
                info!("validated {}", record);
                store.add(record.protocol, Role::Validated, record).await?;
                Ok(Verdict::Passed)
            });
        }

        // Late arrivals from a stage that has not fully stopped yet.
        rx.close();
        while rx.try_recv().is_ok() {
            report.discarded += 1;
        }

        while let Some(done) = tasks.join_next().await {
            tally(&self.name, done, &mut report, &mut failure);
        }

        info!(
            "validator `{}`: round done, {} passed, {} failed, {} discarded",
            self.name, report.passed, report.failed, report.discarded
        );
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

fn tally(
    name: &str,
    done: Result<Result<Verdict, StoreError>, tokio::task::JoinError>,
    report: &mut RoundReport,
    failure: &mut Option<PoolError>,
) {
    match done {
        Ok(Ok(Verdict::Passed)) => report.passed += 1,
        Ok(Ok(Verdict::Failed)) => report.failed += 1,
        Ok(Err(e)) => {
            error!("validator `{}`: store write failed: {}", name, e);
            failure.get_or_insert(e.into());
        }
        Err(e) => {
            error!("validator `{}`: validation task died: {}", name, e);
            failure.get_or_insert(PoolError::RoundAborted(name.to_string()));
        }
    }
}

/// Run `attempts` sequential echo requests, stopping at the first failure.
pub(crate) async fn validate(probe: &dyn EchoProbe, record: &ProxyRecord, attempts: usize) -> bool {
    for attempt in 1..=attempts {
        match probe.echo(record).await {
            Ok(reply) if reply.confirms(&record.address.host) => {}
            Ok(reply) => {
                debug!(
                    "{} failed attempt {}: status {}, origin `{}`",
                    record.address, attempt, reply.status, reply.origin
                );
                return false;
            }
            Err(e) => {
                debug!("{} failed attempt {}: {}", record.address, attempt, e);
                return false;
            }
        }
    }
    true
}
