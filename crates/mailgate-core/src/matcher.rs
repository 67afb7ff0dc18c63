//! Shared pattern and address matching
//!
//! Glob matching backs the router's condition patterns; the CIDR helper
//! backs the SPF `a`/`mx` mechanisms.

use ipnet::{Ipv4Net, Ipv6Net};
use std::net::IpAddr;

/// Match a glob pattern against a value, case-insensitively.
///
/// `*` matches any run of characters, `?` matches exactly one character.
/// An empty pattern matches nothing.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }

    let pattern = pattern.to_lowercase();
    let value = value.to_lowercase();

    let mut regex_pattern = String::with_capacity(pattern.len() + 2);
    regex_pattern.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex_pattern.push_str(".*"),
            '?' => regex_pattern.push('.'),
            '.' | '+' | '^' | '$' | '[' | ']' | '(' | ')' | '{' | '}' | '|' | '\\' => {
                regex_pattern.push('\\');
                regex_pattern.push(ch);
            }
            _ => regex_pattern.push(ch),
        }
    }
    regex_pattern.push('$');

    // Patterns come from operator-authored rules; cap the compiled size
    match regex::RegexBuilder::new(&regex_pattern)
        .size_limit(1 << 20)
        .build()
    {
        Ok(re) => re.is_match(&value),
        Err(_) => false,
    }
}

/// Check whether `ip` falls within the network formed by `candidate` and
/// a prefix length.
///
/// When no prefix is given the candidate matches as a single host (/32
/// for IPv4, /128 for IPv6). Addresses of different families never match.
pub fn ip_matches_with_prefix(ip: IpAddr, candidate: IpAddr, prefix: Option<u8>) -> bool {
    match (ip, candidate) {
        (IpAddr::V4(ip), IpAddr::V4(candidate)) => {
            let prefix = prefix.unwrap_or(32);
            match Ipv4Net::new(candidate, prefix) {
                Ok(net) => net.trunc().contains(&ip),
                Err(_) => false,
            }
        }
        (IpAddr::V6(ip), IpAddr::V6(candidate)) => {
            let prefix = prefix.unwrap_or(128);
            match Ipv6Net::new(candidate, prefix) {
                Ok(net) => net.trunc().contains(&ip),
                Err(_) => false,
            }
        }
        _ => false,
    }
}
