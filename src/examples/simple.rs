//! Simple example of using proxy-replenisher.

use proxy_replenisher::{Protocol, ProxyPool, ProxyPoolConfig, ProxySource, TextListSource};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Initializing proxy pool...");

    // free http proxy lists, one `ip:port` per line
    let sources: Vec<Arc<dyn ProxySource>> = vec![
        Arc::new(TextListSource::new(
            "proxifly",
            Url::parse("https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/http/data.txt")?,
        )),
        Arc::new(TextListSource::new(
            "free-proxy",
            Url::parse("https://cdn.jsdelivr.net/gh/dpangestuw/Free-Proxy@main/http_proxies.txt")?,
        )),
    ];

    let config = ProxyPoolConfig::builder()
        .min_usable_http(5)
        .min_usable_https(0)
        .validation_attempts(3)
        .validation_timeout(Duration::from_secs(5))
        .check_interval(Duration::from_secs(10 * 60))
        .get_proxy_timeout(Duration::from_secs(600))
        .build();

    let pool = ProxyPool::new(config, sources)?;
    pool.start_periodic_checks();

    for _ in 0..5 {
        println!("Proxy: {}", pool.get_proxy(Protocol::Http).await?);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    println!("Stats: {:?}", pool.get_stats().await?);
    pool.stop().await;

    Ok(())
}
