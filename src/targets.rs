use anyhow::{Context, Result};
use ipnet::IpNet;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;
use tracing::debug;

use crate::netdetect;

/// CIDR lines expanding to more hosts than this are rejected as malformed.
pub const MAX_CIDR_HOSTS: usize = 65_536;

/// One normalized `host[:port]` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target(String);

impl Target {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a single `host[:port]` token into normalized form.
    pub fn parse(raw: &str) -> Option<Target> {
        let s = strip_decorations(raw)?;
        normalize_endpoint(s).map(Target)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<IpAddr> for Target {
    fn from(ip: IpAddr) -> Self {
        Target(ip.to_string())
    }
}

/// Parser output: unique targets in first-seen order plus skip counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTargets {
    pub targets: Vec<Target>,
    pub malformed: usize,
    pub duplicates: usize,
}

impl ParsedTargets {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }
}

/// Parse newline-separated targets into a deduplicated, ordered list.
///
/// Supported formats per line:
/// - IPv4/IPv6 literal or hostname: `192.168.1.1`, `router.lan`
/// - with port: `192.168.1.1:8080`, `[fe80::1]:443`
/// - optional `http://` / `https://` prefix and trailing `/`
/// - IPv4 CIDR: `192.168.1.0/30` (expands to host addresses)
/// - comments: everything after `#` is ignored
///
/// Malformed lines are counted and skipped; they never abort the parse.
pub fn parse_targets_str(s: &str) -> ParsedTargets {
    let mut out = ParsedTargets::default();
    let mut seen = HashSet::new();

    let mut push = |out: &mut ParsedTargets, t: Target| {
        if seen.insert(t.clone()) {
            out.targets.push(t);
        } else {
            out.duplicates += 1;
        }
    };

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }

        let Some(body) = strip_decorations(line) else {
            debug!(line_no, line, "skipping malformed target");
            out.malformed += 1;
            continue;
        };

        if body.contains('/') {
            match expand_cidr_line(body) {
                Some(hosts) => {
                    for ip in hosts {
                        push(&mut out, Target::from(ip));
                    }
                }
                None => {
                    debug!(line_no, line, "skipping malformed CIDR");
                    out.malformed += 1;
                }
            }
            continue;
        }

        match normalize_endpoint(body) {
            Some(t) => push(&mut out, Target(t)),
            None => {
                debug!(line_no, line, "skipping malformed target");
                out.malformed += 1;
            }
        }
    }

    out
}

/// Load a targets list from a file path.
pub fn load_targets_from_path(path: impl AsRef<Path>) -> Result<ParsedTargets> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read targets file: {}", path.as_ref().display()))?;
    Ok(parse_targets_str(&content))
}

fn strip_decorations(raw: &str) -> Option<&str> {
    let mut s = raw.trim();
    for scheme in ["http://", "https://"] {
        if s.get(..scheme.len()).is_some_and(|p| p.eq_ignore_ascii_case(scheme)) {
            s = &s[scheme.len()..];
            break;
        }
    }
    let s = s.trim_end_matches('/');
    if s.is_empty() || s.chars().any(char::is_whitespace) {
        return None;
    }
    Some(s)
}

fn expand_cidr_line(s: &str) -> Option<Vec<IpAddr>> {
    let net = s.parse::<IpNet>().ok()?;
    let IpNet::V4(v4) = net else {
        return None;
    };
    if v4.prefix_len() < 16 {
        return None;
    }
    let hosts = netdetect::expand_cidr_to_ips(net);
    if hosts.is_empty() || hosts.len() > MAX_CIDR_HOSTS {
        return None;
    }
    Some(hosts)
}

fn normalize_endpoint(s: &str) -> Option<String> {
    // [v6]:port or [v6]
    if let Some(rest) = s.strip_prefix('[') {
        let (addr, tail) = rest.split_once(']')?;
        let ip = addr.parse::<Ipv6Addr>().ok()?;
        return match tail {
            "" => Some(ip.to_string()),
            _ => {
                let port = parse_port(tail.strip_prefix(':')?)?;
                Some(format!("[{ip}]:{port}"))
            }
        };
    }

    // bare IPv4/IPv6 literal
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(ip.to_string());
    }

    let (host, port) = match s.rsplit_once(':') {
        Some((h, p)) => (h, Some(parse_port(p)?)),
        None => (s, None),
    };
    let host = normalize_host(host)?;
    Some(match port {
        Some(p) => format!("{host}:{p}"),
        None => host,
    })
}

fn normalize_host(host: &str) -> Option<String> {
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        return Some(ip.to_string());
    }
    if host.is_empty() || host.len() > 253 || host.contains(':') {
        return None;
    }
    let labels: Vec<&str> = host.split('.').collect();
    // Dotted numbers that failed IPv4 parsing (e.g. 300.1.1.1) are not hostnames.
    if labels.iter().all(|l| l.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    let valid = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    valid.then(|| host.to_ascii_lowercase())
}

fn parse_port(s: &str) -> Option<u16> {
    match s.parse::<u32>() {
        Ok(v) if (1..=65535).contains(&v) => Some(v as u16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(p: &ParsedTargets) -> Vec<&str> {
        p.targets.iter().map(Target::as_str).collect()
    }

    #[test]
    fn dedupes_first_occurrence_wins() {
        let parsed = parse_targets_str("10.0.0.1\n10.0.0.1\n10.0.0.2");
        assert_eq!(strs(&parsed), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(parsed.duplicates, 1);
        assert_eq!(parsed.malformed, 0);
    }

    #[test]
    fn blank_lines_and_comments_ignored() {
        let input = r#"
            # lab routers
            192.168.1.1   # main

            router.lan:8080
        "#;
        let parsed = parse_targets_str(input);
        assert_eq!(strs(&parsed), vec!["192.168.1.1", "router.lan:8080"]);
        assert_eq!(parsed.malformed, 0);
    }

    #[test]
    fn malformed_lines_counted_not_fatal() {
        let parsed = parse_targets_str("10.0.0.1:0\nnot a host\n300.1.1.1\n-bad.lan\n10.0.0.9");
        assert_eq!(strs(&parsed), vec!["10.0.0.9"]);
        assert_eq!(parsed.malformed, 4);
    }

    #[test]
    fn normalization_merges_equivalent_forms() {
        let parsed = parse_targets_str("HTTP://Router.LAN/\nrouter.lan\nhttps://router.lan");
        assert_eq!(strs(&parsed), vec!["router.lan"]);
        assert_eq!(parsed.duplicates, 2);
    }

    #[test]
    fn ipv6_forms() {
        let parsed = parse_targets_str("fe80::1\n[FE80::1]:8443\n[fe80::1]");
        assert_eq!(strs(&parsed), vec!["fe80::1", "[fe80::1]:8443"]);
        assert_eq!(parsed.duplicates, 1);
    }

    #[test]
    fn cidr_expands_and_dedupes_against_plain_lines() {
        let parsed = parse_targets_str("10.0.0.2\n10.0.0.0/30");
        assert_eq!(strs(&parsed), vec!["10.0.0.2", "10.0.0.1"]);
        assert_eq!(parsed.duplicates, 1);
    }

    #[test]
    fn oversized_cidr_is_malformed() {
        let parsed = parse_targets_str("10.0.0.0/8\nfe80::/64");
        assert!(parsed.is_empty());
        assert_eq!(parsed.malformed, 2);
    }
}
