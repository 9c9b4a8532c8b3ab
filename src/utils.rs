//! Utility functions for the proxy pool.

use crate::proxy::RawCandidate;

use url::{Position, Url};

/// Derive the location of the page after `crawled`.
///
/// The first number in the crawled location's path and query is taken as the
/// current page number; every number in the index location's path and query
/// is replaced by that number plus one. Returns `None` when either location
/// carries no page number.
pub fn next_page_location(index: &Url, crawled: &Url) -> Option<Url> {
    let current = first_number(&crawled[Position::BeforePath..])?;
    let next = current.checked_add(1)?.to_string();

    let tail = &index[Position::BeforePath..];
    first_number(tail)?;
    let mut rewritten = String::with_capacity(tail.len() + 2);
    let mut in_digits = false;
    for c in tail.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                rewritten.push_str(&next);
                in_digits = true;
            }
        } else {
            in_digits = false;
            rewritten.push(c);
        }
    }

    Url::parse(&format!("{}{}", &index[..Position::BeforePath], rewritten)).ok()
}

fn first_number(s: &str) -> Option<u64> {
    let start = s.find(|c: char| c.is_ascii_digit())?;
    let digits: String = s[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Parse a plain-text proxy list.
///
/// Each line is `host:port [protocol] [latency_ms]`; protocol defaults to
/// `http` and latency to 0. Blank lines, `#` comments and malformed lines are
/// skipped.
pub(crate) fn parse_proxy_list(content: &str) -> Vec<RawCandidate> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut fields = line.split_whitespace();
            let addr = fields.next()?;
            let addr = addr
                .split_once("://")
                .map_or(addr, |(_, rest)| rest);
            let (host, port) = addr.rsplit_once(':')?;
            let port = port.parse().ok()?;
            let protocol = fields.next().unwrap_or("http").to_string();
            let latency_ms = match fields.next() {
                Some(latency) => latency.trim_end_matches("ms").parse().ok()?,
                None => 0.0,
            };
            Some(RawCandidate {
                host: host.to_string(),
                port,
                protocol,
                latency_ms,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn derives_next_page_from_crawled_location() {
        let index = url("http://www.kuaidaili.com/free/inha/1/");
        let next = next_page_location(&index, &index).unwrap();
        assert_eq!(next.as_str(), "http://www.kuaidaili.com/free/inha/2/");

        let after = next_page_location(&index, &next).unwrap();
        assert_eq!(after.as_str(), "http://www.kuaidaili.com/free/inha/3/");
    }

    #[test]
    fn host_digits_do_not_count_as_page_numbers() {
        let index = url("https://proxy123.example.com/list/p1.aspx");
        let next = next_page_location(&index, &index).unwrap();
        assert_eq!(next.as_str(), "https://proxy123.example.com/list/p2.aspx");
    }

    #[test]
    fn no_page_number_means_no_next_page() {
        let index = url("https://example.com/list");
        assert!(next_page_location(&index, &index).is_none());
    }

    #[test]
    fn parses_list_lines() {
        let content = "\
# free proxies
1.2.3.4:8080
http://5.6.7.8:3128 https 250
9.9.9.9:1080 socks5 12ms
not-a-proxy
10.0.0.1:notaport http
";
        let parsed = parse_proxy_list(content);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].host, "1.2.3.4");
        assert_eq!(parsed[0].protocol, "http");
        assert_eq!(parsed[1].port, 3128);
        assert_eq!(parsed[1].protocol, "https");
        assert_eq!(parsed[1].latency_ms, 250.0);
        assert_eq!(parsed[2].protocol, "socks5");
        assert_eq!(parsed[2].latency_ms, 12.0);
    }
}
