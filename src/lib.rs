//! # proxy-replenisher
//!
//! A self-replenishing pool of validated HTTP and HTTPS proxies.
//!
//! A periodic check cycle re-validates the usable pool against an echo
//! endpoint. When too few proxies survive, per-source discovery pipelines crawl
//! proxy listings until enough fresh proxies pass validation, and the freshly
//! validated set replaces the usable pool in one step. A reqwest middleware
//! routes requests through the pool.

pub mod config;
pub mod controller;
pub mod error;
pub mod middleware;
pub mod pipeline;
pub mod pool;
pub mod proxy;
pub mod source;
pub mod store;
pub mod utils;
pub mod validator;

pub use config::{ProxyPoolConfig, ProxyPoolConfigBuilder};
pub use controller::{CycleOutcome, CycleState, Replenisher};
pub use error::{FetchError, NoProxyAvailable, PoolError, ProbeError, StoreError, ValidatorError};
pub use middleware::ProxyPoolMiddleware;
pub use pipeline::{ControlSignal, DiscoveryPipeline, HttpFetcher, PageFetcher};
pub use pool::{PoolStats, ProxyPool};
pub use proxy::{Protocol, ProxyAddr, ProxyRecord, RawCandidate};
pub use source::{Extraction, ProxySource, TextListSource};
pub use store::{MemoryStore, ProxyStore, Role};
pub use validator::{EchoProbe, EchoReply, HttpEchoProbe, RoundReport, ValidationItem, Validator};
