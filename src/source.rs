//! Upstream proxy sources.
//!
//! A source knows where its listing starts, which headers to send, and how to
//! turn a fetched page into candidates plus the next page to fetch.
//! Site-specific HTML extractors implement [`ProxySource`] outside this crate.

use crate::proxy::RawCandidate;
use crate::utils;

use http::HeaderMap;
use url::Url;

/// What a source extracted from one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub candidates: Vec<RawCandidate>,
    /// Next location to fetch; `None` ends this crawl.
    pub next: Option<Url>,
}

/// An upstream site listing free proxies.
pub trait ProxySource: Send + Sync {
    /// Short identifier, recorded as each proxy's source.
    fn name(&self) -> &str;

    /// First listing page.
    fn index_location(&self) -> Url;

    /// Headers sent with every page request.
    fn headers(&self) -> HeaderMap {
        HeaderMap::new()
    }

    /// Turn a fetched page into candidates.
    fn get_candidates(&self, page: &str) -> Vec<RawCandidate>;

    /// Location after `crawled`. Defaults to bumping the page number.
    fn next_location(&self, crawled: &Url) -> Option<Url> {
        utils::next_page_location(&self.index_location(), crawled)
    }

    /// Candidates and next location for a page fetched from `location`.
    fn extract(&self, page: &str, location: &Url) -> Extraction {
        Extraction {
            candidates: self.get_candidates(page),
            next: self.next_location(location),
        }
    }
}

/// Source serving plain-text proxy lists, one `host:port [protocol]
/// [latency_ms]` per line.
pub struct TextListSource {
    name: String,
    index: Url,
    headers: HeaderMap,
    paginated: bool,
}

impl TextListSource {
    /// A single-page list at `index`.
    pub fn new(name: impl Into<String>, index: Url) -> Self {
        Self {
            name: name.into(),
            index,
            headers: HeaderMap::new(),
            paginated: false,
        }
    }

    /// Follow numbered pages after the index, as derived by
    /// [`utils::next_page_location`].
    pub fn paginated(mut self) -> Self {
        self.paginated = true;
        self
    }

    /// Send `headers` with every request.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

impl ProxySource for TextListSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn index_location(&self) -> Url {
        self.index.clone()
    }

    fn headers(&self) -> HeaderMap {
        self.headers.clone()
    }

    fn get_candidates(&self, page: &str) -> Vec<RawCandidate> {
        utils::parse_proxy_list(page)
    }

    fn next_location(&self, crawled: &Url) -> Option<Url> {
        if !self.paginated {
            return None;
        }
        utils::next_page_location(&self.index, crawled)
    }
}
