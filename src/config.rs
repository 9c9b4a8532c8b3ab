//! Configuration for the proxy pool.

use crate::proxy::Protocol;

use std::time::Duration;

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Number of echo requests a proxy must pass in a row.
    pub validation_attempts: usize,
    /// Timeout for a single echo request.
    pub validation_timeout: Duration,
    /// Maximum number of proxies validated concurrently.
    pub validator_workers: usize,
    /// Echo endpoint used to validate HTTP proxies.
    pub echo_url_http: String,
    /// Echo endpoint used to validate HTTPS proxies.
    pub echo_url_https: String,
    /// Minimum number of usable HTTP proxies.
    pub min_usable_http: usize,
    /// Minimum number of usable HTTPS proxies.
    pub min_usable_https: usize,
    /// Fetch failures tolerated before the crawler starts backing off.
    pub fetch_retry_limit: usize,
    /// Timeout for a single page fetch.
    pub fetch_timeout: Duration,
    /// Pause between fetch attempts once the retry limit is exceeded.
    pub fetch_backoff: Duration,
    /// Minimum spacing between page requests to one source.
    pub crawl_delay: Duration,
    /// Candidates advertising a higher latency are discarded.
    pub max_candidate_latency_ms: f64,
    /// Interval between check cycles.
    pub check_interval: Duration,
    /// Interval between store polls while replenishing.
    pub poll_interval: Duration,
    /// Upper bound on one replenishment; `None` waits indefinitely.
    pub replenish_timeout: Option<Duration>,
    /// Interval between polls while `get_proxy` waits for a proxy.
    pub get_proxy_poll_interval: Duration,
    /// Upper bound on `get_proxy`; `None` waits indefinitely.
    pub get_proxy_timeout: Option<Duration>,
    /// Number of times the middleware retries a request with different proxies.
    pub retry_count: usize,
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new()
    }

    /// Minimum usable pool size for `protocol`.
    pub fn min_usable(&self, protocol: Protocol) -> usize {
        match protocol {
            Protocol::Http => self.min_usable_http,
            Protocol::Https => self.min_usable_https,
        }
    }

    /// Echo endpoint for `protocol`.
    pub fn echo_url(&self, protocol: Protocol) -> &str {
        match protocol {
            Protocol::Http => &self.echo_url_http,
            Protocol::Https => &self.echo_url_https,
        }
    }
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        ProxyPoolConfigBuilder::new().build()
    }
}

/// Builder for `ProxyPoolConfig`.
#[derive(Default)]
pub struct ProxyPoolConfigBuilder {
    validation_attempts: Option<usize>,
    validation_timeout: Option<Duration>,
    validator_workers: Option<usize>,
    echo_url_http: Option<String>,
    echo_url_https: Option<String>,
    min_usable_http: Option<usize>,
    min_usable_https: Option<usize>,
    fetch_retry_limit: Option<usize>,
    fetch_timeout: Option<Duration>,
    fetch_backoff: Option<Duration>,
    crawl_delay: Option<Duration>,
    max_candidate_latency_ms: Option<f64>,
    check_interval: Option<Duration>,
    poll_interval: Option<Duration>,
    replenish_timeout: Option<Duration>,
    get_proxy_poll_interval: Option<Duration>,
    get_proxy_timeout: Option<Duration>,
    retry_count: Option<usize>,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many echo requests a proxy must pass.
    pub fn validation_attempts(mut self, attempts: usize) -> Self {
        self.validation_attempts = Some(attempts);
        self
    }

    /// Set the timeout for a single echo request.
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = Some(timeout);
        self
    }

    /// Set the number of concurrent validations.
    pub fn validator_workers(mut self, workers: usize) -> Self {
        self.validator_workers = Some(workers);
        self
    }

    /// Set the echo endpoint used for HTTP proxies.
    pub fn echo_url_http(mut self, url: impl Into<String>) -> Self {
        self.echo_url_http = Some(url.into());
        self
    }

    /// Set the echo endpoint used for HTTPS proxies.
    pub fn echo_url_https(mut self, url: impl Into<String>) -> Self {
        self.echo_url_https = Some(url.into());
        self
    }

    /// Set the minimum number of usable HTTP proxies.
    pub fn min_usable_http(mut self, count: usize) -> Self {
        self.min_usable_http = Some(count);
        self
    }

    /// Set the minimum number of usable HTTPS proxies.
    pub fn min_usable_https(mut self, count: usize) -> Self {
        self.min_usable_https = Some(count);
        self
    }

    /// Set the number of fetch failures tolerated before backing off.
    pub fn fetch_retry_limit(mut self, limit: usize) -> Self {
        self.fetch_retry_limit = Some(limit);
        self
    }

    /// Set the timeout for a single page fetch.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Set the pause between fetch attempts past the retry limit.
    pub fn fetch_backoff(mut self, backoff: Duration) -> Self {
        self.fetch_backoff = Some(backoff);
        self
    }

    /// Set the minimum spacing between page requests to one source.
    pub fn crawl_delay(mut self, delay: Duration) -> Self {
        self.crawl_delay = Some(delay);
        self
    }

    /// Set the maximum advertised latency a candidate may have.
    pub fn max_candidate_latency_ms(mut self, latency: f64) -> Self {
        self.max_candidate_latency_ms = Some(latency);
        self
    }

    /// Set the interval between check cycles.
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = Some(interval);
        self
    }

    /// Set the interval between store polls while replenishing.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Bound how long one replenishment may take.
    pub fn replenish_timeout(mut self, timeout: Duration) -> Self {
        self.replenish_timeout = Some(timeout);
        self
    }

    /// Set the interval between polls in `get_proxy`.
    pub fn get_proxy_poll_interval(mut self, interval: Duration) -> Self {
        self.get_proxy_poll_interval = Some(interval);
        self
    }

    /// Bound how long `get_proxy` waits for a proxy.
    pub fn get_proxy_timeout(mut self, timeout: Duration) -> Self {
        self.get_proxy_timeout = Some(timeout);
        self
    }

    /// Set the number of times to retry a request with different proxies.
    pub fn retry_count(mut self, count: usize) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            validation_attempts: self.validation_attempts.unwrap_or(5).max(1),
            validation_timeout: self.validation_timeout.unwrap_or(Duration::from_secs(5)),
            validator_workers: self.validator_workers.unwrap_or(60).max(1),
            echo_url_http: self
                .echo_url_http
                .unwrap_or_else(|| "http://httpbin.org/get".to_string()),
            echo_url_https: self
                .echo_url_https
                .unwrap_or_else(|| "https://httpbin.org/get".to_string()),
            min_usable_http: self.min_usable_http.unwrap_or(20),
            min_usable_https: self.min_usable_https.unwrap_or(1),
            fetch_retry_limit: self.fetch_retry_limit.unwrap_or(3),
            fetch_timeout: self.fetch_timeout.unwrap_or(Duration::from_secs(5)),
            fetch_backoff: self.fetch_backoff.unwrap_or(Duration::from_secs(5)),
            crawl_delay: self.crawl_delay.unwrap_or(Duration::from_secs(1)),
            max_candidate_latency_ms: self.max_candidate_latency_ms.unwrap_or(5000.0),
            check_interval: self.check_interval.unwrap_or(Duration::from_secs(30 * 60)),
            poll_interval: self.poll_interval.unwrap_or(Duration::from_secs(2)),
            replenish_timeout: self.replenish_timeout,
            get_proxy_poll_interval: self
                .get_proxy_poll_interval
                .unwrap_or(Duration::from_millis(500)),
            get_proxy_timeout: self.get_proxy_timeout,
            retry_count: self.retry_count.unwrap_or(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ProxyPoolConfig::default();
        assert_eq!(config.validation_attempts, 5);
        assert_eq!(config.validator_workers, 60);
        assert_eq!(config.min_usable(Protocol::Http), 20);
        assert_eq!(config.min_usable(Protocol::Https), 1);
        assert_eq!(config.fetch_retry_limit, 3);
        assert_eq!(config.echo_url(Protocol::Https), "https://httpbin.org/get");
        assert!(config.replenish_timeout.is_none());
    }

    #[test]
    fn builder_overrides_and_clamps() {
        let config = ProxyPoolConfig::builder()
            .validation_attempts(0)
            .validator_workers(0)
            .min_usable_http(2)
            .replenish_timeout(Duration::from_secs(60))
            .build();
        assert_eq!(config.validation_attempts, 1);
        assert_eq!(config.validator_workers, 1);
        assert_eq!(config.min_usable(Protocol::Http), 2);
        assert_eq!(config.replenish_timeout, Some(Duration::from_secs(60)));
    }
}
