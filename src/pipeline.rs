//! Per-source discovery pipeline.
//!
//! Each pipeline runs a control loop that owns two stages while crawling:
//!
//! * **fetch** pops a location, downloads it (directly or through a known-good
//!   proxy) and hands the page on;
//! * **extract** turns a page into candidates for the pipeline's validator and
//!   pushes the next location back to fetch.
//!
//! `start` spins the stages up from the source's index location, `end` stops
//! and drains them while the control loop keeps waiting for the next `start`,
//! and `quit` ends the control loop for good.

use crate::config::ProxyPoolConfig;
use crate::error::{FetchError, PoolError};
use crate::proxy::{Protocol, ProxyAddr, ProxyRecord, RawCandidate};
use crate::source::ProxySource;
use crate::store::{ProxyStore, Role};
use crate::validator::{EchoProbe, ValidationItem, Validator};

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use http::HeaderMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Downloads source pages.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch `location`, through `via` when given, otherwise directly.
    async fn fetch(
        &self,
        location: &Url,
        headers: &HeaderMap,
        via: Option<&ProxyRecord>,
    ) -> Result<String, FetchError>;
}

/// Fetcher backed by reqwest.
pub struct HttpFetcher {
    direct: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &ProxyPoolConfig) -> Result<Self, reqwest::Error> {
        let direct = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()?;
        Ok(Self {
            direct,
            timeout: config.fetch_timeout,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        location: &Url,
        headers: &HeaderMap,
        via: Option<&ProxyRecord>,
    ) -> Result<String, FetchError> {
        let client = match via {
            Some(proxy) => reqwest::Client::builder()
                .proxy(reqwest::Proxy::all(proxy.proxy_url())?)
                .timeout(self.timeout)
                .pool_max_idle_per_host(0)
                .build()?,
            None => self.direct.clone(),
        };

        let resp = client
            .get(location.clone())
            .headers(headers.clone())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status()));
        }
        Ok(resp.text().await?)
    }
}

/// Message on a pipeline's control channel.
pub enum ControlSignal {
    /// Begin crawling from the source's index location.
    Start,
    /// Stop and drain both stages; acknowledged once they have exited and the
    /// pipeline's validation round is complete.
    End(oneshot::Sender<Result<(), PoolError>>),
    /// Stop everything and leave the control loop.
    Quit(oneshot::Sender<Result<(), PoolError>>),
}

/// Queue element: data, or the end-of-stream marker.
enum Stage<T> {
    Item(T),
    Sentinel,
}

struct Page {
    body: String,
    location: Url,
}

/// State shared by the control loop and both stages.
struct StageContext {
    source: Arc<dyn ProxySource>,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn ProxyStore>,
    limiter: Option<Limiter>,
    retry_limit: usize,
    backoff: Duration,
    max_latency_ms: f64,
    /// Proxies that failed to fetch for this source; kept for the
    /// pipeline's lifetime.
    blacklist: Mutex<HashSet<ProxyAddr>>,
}

impl StageContext {
    fn name(&self) -> &str {
        self.source.name()
    }

    /// Apply the protocol and latency filters to a raw candidate.
    fn admit(&self, candidate: RawCandidate) -> Option<ProxyRecord> {
        let protocol = match candidate.protocol.parse::<Protocol>() {
            Ok(protocol) => protocol,
            Err(e) => {
                debug!("crawler `{}`: pass {}:{}: {}", self.name(), candidate.host, candidate.port, e);
                return None;
            }
        };
        if candidate.latency_ms > self.max_latency_ms {
            debug!(
                "crawler `{}`: pass {}:{}: latency {}ms",
                self.name(),
                candidate.host,
                candidate.port,
                candidate.latency_ms
            );
            return None;
        }
        Some(ProxyRecord::new(
            ProxyAddr::new(candidate.host, candidate.port),
            protocol,
            self.name(),
            candidate.latency_ms,
        ))
    }

    /// A validated proxy found by another source that has not failed us yet.
    async fn crawl_proxy(&self) -> Option<ProxyRecord> {
        for role in [Role::Validated, Role::Usable] {
            match self.store.random_member(Protocol::Http, role).await {
                Ok(Some(proxy))
                    if proxy.source != self.name()
                        && !self.blacklist.lock().contains(&proxy.address) =>
                {
                    return Some(proxy);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("crawler `{}`: cannot pick crawl proxy: {}", self.name(), e);
                    return None;
                }
            }
        }
        None
    }

    /// Fetch `location` until it succeeds or the crawl is ending.
    ///
    /// The first `retry_limit - 1` failures are retried immediately; after
    /// that every retry waits `backoff` first. The location is never dropped.
    async fn fetch_with_retry(
        &self,
        location: &Url,
        headers: &HeaderMap,
        ending: &mut watch::Receiver<bool>,
    ) -> Option<String> {
        let mut failures = 0;
        loop {
            if *ending.borrow() {
                return None;
            }
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            let via = self.crawl_proxy().await;
            match &via {
                Some(proxy) => debug!("crawler `{}`: fetch {} via {}", self.name(), location, proxy.address),
                None => debug!("crawler `{}`: fetch {} directly", self.name(), location),
            }

            match self.fetcher.fetch(location, headers, via.as_ref()).await {
                Ok(body) => return Some(body),
                Err(e) => {
                    failures += 1;
                    warn!(
                        "crawler `{}`: fetch {} failed ({} so far): {}",
                        self.name(),
                        location,
                        failures,
                        e
                    );
                    if let Some(proxy) = via {
                        warn!("crawler `{}`: proxy {} is useless", self.name(), proxy.address);
                        self.blacklist.lock().insert(proxy.address);
                    }
                }
            }

            if failures >= self.retry_limit {
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff) => {}
                    changed = ending.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                }
            }
        }
    }
}

/// Handle to one source's discovery pipeline.
pub struct DiscoveryPipeline {
    name: String,
    control: UnboundedSender<ControlSignal>,
    context: Arc<StageContext>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryPipeline {
    /// Spawn the pipeline's control loop. It idles until `start`.
    pub fn spawn(
        config: &ProxyPoolConfig,
        source: Arc<dyn ProxySource>,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn ProxyStore>,
        probe: Arc<dyn EchoProbe>,
    ) -> Self {
        let name = source.name().to_string();
        let validator = Validator::new(
            format!("crawler-{}", name),
            config,
            Arc::clone(&store),
            probe,
        );
        let limiter = Quota::with_period(config.crawl_delay).map(RateLimiter::direct);
        let context = Arc::new(StageContext {
            source,
            fetcher,
            store,
            limiter,
            retry_limit: config.fetch_retry_limit,
            backoff: config.fetch_backoff,
            max_latency_ms: config.max_candidate_latency_ms,
            blacklist: Mutex::new(HashSet::new()),
        });

        let (control, signals) = mpsc::unbounded_channel();
        let handle = tokio::spawn(control_loop(
            Arc::clone(&context),
            Arc::new(validator),
            signals,
        ));

        Self {
            name,
            control,
            context,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Begin crawling. Ignored if already crawling.
    pub fn start(&self) -> Result<(), PoolError> {
        self.control
            .send(ControlSignal::Start)
            .map_err(|_| PoolError::PipelineClosed(self.name.clone()))
    }

    /// Stop crawling and wait until both stages have drained.
    pub async fn end(&self) -> Result<(), PoolError> {
        let (ack, done) = oneshot::channel();
        self.control
            .send(ControlSignal::End(ack))
            .map_err(|_| PoolError::PipelineClosed(self.name.clone()))?;
        done.await
            .map_err(|_| PoolError::PipelineClosed(self.name.clone()))?
    }

    /// Stop crawling and terminate the control loop.
    pub async fn quit(&self) -> Result<(), PoolError> {
        let (ack, done) = oneshot::channel();
        self.control
            .send(ControlSignal::Quit(ack))
            .map_err(|_| PoolError::PipelineClosed(self.name.clone()))?;
        let result = done
            .await
            .map_err(|_| PoolError::PipelineClosed(self.name.clone()))?;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("crawler `{}`: control loop died: {}", self.name, e);
            }
        }
        result
    }

    /// Proxies this pipeline has stopped crawling through.
    pub fn blacklisted(&self) -> HashSet<ProxyAddr> {
        self.context.blacklist.lock().clone()
    }
}

/// A crawl in progress: both stages plus the senders used to stop them.
struct Crawl {
    locations: UnboundedSender<Stage<Url>>,
    pages: UnboundedSender<Stage<Page>>,
    ending: watch::Sender<bool>,
    fetch: JoinHandle<()>,
    extract: JoinHandle<()>,
}

impl Crawl {
    fn begin(ctx: &Arc<StageContext>, validator: &Arc<Validator>) -> Self {
        let (locations, location_rx) = mpsc::unbounded_channel();
        let (pages, page_rx) = mpsc::unbounded_channel();
        let (ending, ending_rx) = watch::channel(false);

        let _ = locations.send(Stage::Item(ctx.source.index_location()));

        let fetch = tokio::spawn(fetch_stage(
            Arc::clone(ctx),
            location_rx,
            pages.clone(),
            ending_rx.clone(),
        ));
        let extract = tokio::spawn(extract_stage(
            Arc::clone(ctx),
            Arc::clone(validator),
            page_rx,
            locations.clone(),
            ending_rx,
        ));

        Self {
            locations,
            pages,
            ending,
            fetch,
            extract,
        }
    }

    /// Signal both stages and wait for them to exit.
    async fn finish(self, name: &str) {
        let _ = self.ending.send(true);
        let _ = self.locations.send(Stage::Sentinel);
        let _ = self.pages.send(Stage::Sentinel);
        for (stage, handle) in [("fetch", self.fetch), ("extract", self.extract)] {
            if let Err(e) = handle.await {
                error!("crawler `{}`: {} stage died: {}", name, stage, e);
            }
        }
    }
}

async fn control_loop(
    ctx: Arc<StageContext>,
    validator: Arc<Validator>,
    mut signals: UnboundedReceiver<ControlSignal>,
) {
    let mut crawl: Option<Crawl> = None;

    while let Some(signal) = signals.recv().await {
        match signal {
            ControlSignal::Start => {
                if crawl.is_some() {
                    debug!("crawler `{}`: already running", ctx.name());
                    continue;
                }
                if let Err(e) = validator.start() {
                    warn!("crawler `{}`: cannot start: {}", ctx.name(), e);
                    continue;
                }
                info!("crawler `{}`: start", ctx.name());
                crawl = Some(Crawl::begin(&ctx, &validator));
            }
            ControlSignal::End(ack) => {
                let result = stop(&ctx, &validator, crawl.take()).await;
                let _ = ack.send(result);
            }
            ControlSignal::Quit(ack) => {
                let result = stop(&ctx, &validator, crawl.take()).await;
                info!("crawler `{}`: quit", ctx.name());
                let _ = ack.send(result);
                return;
            }
        }
    }

    // Every handle dropped without quitting.
    let _ = stop(&ctx, &validator, crawl.take()).await;
}

async fn stop(
    ctx: &StageContext,
    validator: &Validator,
    crawl: Option<Crawl>,
) -> Result<(), PoolError> {
    let Some(crawl) = crawl else {
        return Ok(());
    };
    crawl.finish(ctx.name()).await;
    let report = validator.wait_round_complete().await?;
    info!(
        "crawler `{}`: end, {} proxies validated this crawl",
        ctx.name(),
        report.passed
    );
    Ok(())
}

async fn fetch_stage(
    ctx: Arc<StageContext>,
    mut locations: UnboundedReceiver<Stage<Url>>,
    pages: UnboundedSender<Stage<Page>>,
    mut ending: watch::Receiver<bool>,
) {
    let headers = ctx.source.headers();

    while let Some(Stage::Item(location)) = locations.recv().await {
        debug!("crawler `{}`: get location to crawl: {}", ctx.name(), location);
        let Some(body) = ctx.fetch_with_retry(&location, &headers, &mut ending).await else {
            break;
        };
        debug!("crawler `{}`: put page to parse", ctx.name());
        if pages.send(Stage::Item(Page { body, location })).is_err() {
            break;
        }
    }

    let dropped = drain(&mut locations);
    info!("crawler `{}`: fetch stage quit, {} locations dropped", ctx.name(), dropped);
}

async fn extract_stage(
    ctx: Arc<StageContext>,
    validator: Arc<Validator>,
    mut pages: UnboundedReceiver<Stage<Page>>,
    locations: UnboundedSender<Stage<Url>>,
    ending: watch::Receiver<bool>,
) {
    while let Some(Stage::Item(page)) = pages.recv().await {
        if *ending.borrow() {
            break;
        }

        let extraction = ctx.source.extract(&page.body, &page.location);
        let mut submitted = 0;
        for candidate in extraction.candidates {
            let Some(record) = ctx.admit(candidate) else {
                continue;
            };
            debug!("crawler `{}`: put proxy to test: {}", ctx.name(), record);
            match validator.submit(ValidationItem::Proxy(record)) {
                Ok(()) => submitted += 1,
                Err(e) => warn!("crawler `{}`: cannot submit proxy: {}", ctx.name(), e),
            }
        }
        debug!(
            "crawler `{}`: {} candidates from {}",
            ctx.name(),
            submitted,
            page.location
        );

        if let Some(next) = extraction.next {
            debug!("crawler `{}`: put location to crawl: {}", ctx.name(), next);
            let _ = locations.send(Stage::Item(next));
        }
    }

    let dropped = drain(&mut pages);
    if let Err(e) = validator.submit(ValidationItem::End) {
        warn!("crawler `{}`: cannot end validation round: {}", ctx.name(), e);
    }
    info!("crawler `{}`: extract stage quit, {} pages dropped", ctx.name(), dropped);
}

/// Close `rx` and discard whatever is still queued.
fn drain<T>(rx: &mut UnboundedReceiver<T>) -> usize {
    rx.close();
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::source::TextListSource;
    use crate::store::MemoryStore;
    use crate::validator::tests::ScriptedProbe;
    use http::StatusCode;
    use std::collections::HashMap;
    use tokio_test::assert_ok;

    /// Fetcher serving canned pages. Each location fails as many times as
    /// configured before succeeding; unknown locations answer 404.
    #[derive(Default)]
    pub(crate) struct ScriptedFetcher {
        pub pages: HashMap<String, String>,
        pub failures: Mutex<HashMap<String, usize>>,
        pub fail_via_proxy: bool,
        pub calls: Mutex<Vec<(String, Option<ProxyAddr>)>>,
    }

    impl ScriptedFetcher {
        pub(crate) fn with_page(mut self, location: &str, body: &str) -> Self {
            self.pages.insert(location.to_string(), body.to_string());
            self
        }

        pub(crate) fn failing(self, location: &str, times: usize) -> Self {
            self.failures.lock().insert(location.to_string(), times);
            self
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            location: &Url,
            _headers: &HeaderMap,
            via: Option<&ProxyRecord>,
        ) -> Result<String, FetchError> {
            self.calls
                .lock()
                .push((location.to_string(), via.map(|p| p.address.clone())));
            if via.is_some() && self.fail_via_proxy {
                return Err(FetchError::Status(StatusCode::FORBIDDEN));
            }
            if let Some(left) = self.failures.lock().get_mut(location.as_str()) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FetchError::Status(StatusCode::SERVICE_UNAVAILABLE));
                }
            }
            self.pages
                .get(location.as_str())
                .cloned()
                .ok_or(FetchError::Status(StatusCode::NOT_FOUND))
        }
    }

    const INDEX: &str = "http://list.example/page/1";

    fn config() -> ProxyPoolConfig {
        ProxyPoolConfig::builder()
            .crawl_delay(Duration::ZERO)
            .fetch_backoff(Duration::from_secs(5))
            .fetch_retry_limit(3)
            .validation_attempts(2)
            .max_candidate_latency_ms(1000.0)
            .build()
    }

    fn source() -> Arc<dyn ProxySource> {
        Arc::new(TextListSource::new("list", Url::parse(INDEX).unwrap()).paginated())
    }

    async fn wait_for_validated(store: &MemoryStore, protocol: Protocol, n: usize) {
        while store.snapshot(protocol, Role::Validated).len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn crawls_filters_and_validates_candidates() {
        let page = "\
1.1.1.1:80 http 100
2.2.2.2:80 http 5000
3.3.3.3:1080 socks5 10
4.4.4.4:443 https 10
";
        let fetcher = Arc::new(ScriptedFetcher::default().with_page(INDEX, page));
        let store = Arc::new(MemoryStore::new());
        let probe = Arc::new(ScriptedProbe::passing(&["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4"]));
        let pipeline = DiscoveryPipeline::spawn(&config(), source(), fetcher.clone(), store.clone(), probe);

        assert_ok!(pipeline.start());
        wait_for_validated(&store, Protocol::Http, 1).await;
        wait_for_validated(&store, Protocol::Https, 1).await;
        assert_ok!(pipeline.end().await);

        let http = store.snapshot(Protocol::Http, Role::Validated);
        assert_eq!(http.len(), 1);
        let proxy = http.iter().next().unwrap();
        assert_eq!(proxy.address, ProxyAddr::new("1.1.1.1", 80));
        assert_eq!(proxy.source, "list");
        assert_eq!(store.snapshot(Protocol::Https, Role::Validated).len(), 1);

        let calls = fetcher.calls.lock();
        assert_eq!(calls[0].0, INDEX);
        assert!(calls.iter().any(|(l, _)| l == "http://list.example/page/2"));
        drop(calls);
        assert_ok!(pipeline.quit().await);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_location_is_retried_after_backoff() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with_page(INDEX, "1.1.1.1:80")
                .failing(INDEX, 3),
        );
        let store = Arc::new(MemoryStore::new());
        let probe = Arc::new(ScriptedProbe::passing(&["1.1.1.1"]));
        let pipeline = DiscoveryPipeline::spawn(&config(), source(), fetcher.clone(), store.clone(), probe);

        let started = tokio::time::Instant::now();
        assert_ok!(pipeline.start());
        wait_for_validated(&store, Protocol::Http, 1).await;

        assert!(started.elapsed() >= Duration::from_secs(5));
        let calls = fetcher.calls.lock().clone();
        assert!(calls.len() >= 4);
        assert!(calls[..4].iter().all(|(l, _)| l == INDEX));
        assert_ok!(pipeline.quit().await);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_crawl_proxy_is_blacklisted() {
        let store = Arc::new(MemoryStore::new());
        let helper = ProxyRecord::new(ProxyAddr::new("9.9.9.9", 8080), Protocol::Http, "other", 10.0);
        let own = ProxyRecord::new(ProxyAddr::new("8.8.8.8", 8080), Protocol::Http, "list", 10.0);
        assert_ok!(store.add(Protocol::Http, Role::Usable, helper.clone()).await);
        assert_ok!(store.add(Protocol::Http, Role::Validated, own).await);

        let fetcher = Arc::new(ScriptedFetcher {
            fail_via_proxy: true,
            ..ScriptedFetcher::default().with_page(INDEX, "1.1.1.1:80")
        });
        let probe = Arc::new(ScriptedProbe::passing(&["1.1.1.1"]));
        let pipeline = DiscoveryPipeline::spawn(&config(), source(), fetcher.clone(), store.clone(), probe);

        assert_ok!(pipeline.start());
        wait_for_validated(&store, Protocol::Http, 2).await;
        assert_ok!(pipeline.end().await);

        let calls = fetcher.calls.lock().clone();
        assert_eq!(calls[0], (INDEX.to_string(), Some(helper.address.clone())));
        assert_eq!(calls[1], (INDEX.to_string(), None));
        assert!(pipeline.blacklisted().contains(&helper.address));
        assert_ok!(pipeline.quit().await);
    }

    #[tokio::test(start_paused = true)]
    async fn end_drains_and_silences_the_pipeline() {
        let fetcher = Arc::new(ScriptedFetcher::default().with_page(INDEX, "1.1.1.1:80"));
        let store = Arc::new(MemoryStore::new());
        let probe = Arc::new(ScriptedProbe::passing(&["1.1.1.1"]));
        let pipeline = DiscoveryPipeline::spawn(&config(), source(), fetcher.clone(), store.clone(), probe);

        assert_ok!(pipeline.start());
        wait_for_validated(&store, Protocol::Http, 1).await;
        assert_ok!(pipeline.end().await);

        let calls = fetcher.call_count();
        let _ = store.drain_all(Protocol::Http, Role::Validated).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fetcher.call_count(), calls);
        assert!(store.snapshot(Protocol::Http, Role::Validated).is_empty());

        // The control loop survives `end` and crawls again from the index.
        assert_ok!(pipeline.start());
        wait_for_validated(&store, Protocol::Http, 1).await;
        assert_eq!(fetcher.calls.lock()[calls].0, INDEX);
        assert_ok!(pipeline.quit().await);
        assert!(pipeline.start().is_err());
    }
}
