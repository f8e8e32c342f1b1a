//! C1 — Line parser.
//!
//! Parses one access-log line into a typed [`ParsedLine`] or a typed
//! [`RejectReason`]. Pure function: no state, no I/O, no metrics calls.
//! The grammar is anchored on the literal tokens `from` and `email:` per
//! spec.md §4.1:
//!
//! ```text
//! <YYYY/MM/DD HH:MM:SS[.ffffff]> from <ip>:<port> <action> <proto>:<dst>:<port> [<tag>] email: <addr>
//! ```

use ipnet::{Ipv4Net, Ipv6Net};
use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;

/// Result of parsing a single access-log line, before server-side tagging
/// (node id, ingest wall clock) is attached by the ingest server (C5).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub source_ip: IpAddr,
    pub email: String,
    pub protocol: String,
    pub destination: String,
    pub action: String,
    /// The agent-reported timestamp, informational only (spec.md §4.1:
    /// the tracker keys time off the server's ingest wall clock).
    pub line_timestamp: String,
}

/// Typed rejection kinds, counted by the caller and never logged at
/// warn/error — parse rejections are expected traffic noise (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Empty,
    NoEmail,
    Malformed,
    Oversize,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::Empty => "REJECT_EMPTY",
            RejectReason::NoEmail => "REJECT_NO_EMAIL",
            RejectReason::Malformed => "REJECT_MALFORMED",
            RejectReason::Oversize => "REJECT_OVERSIZE",
        };
        f.write_str(s)
    }
}

/// Matches everything up to and including the optional `[tag]`, leaving
/// whatever follows (the `email:` token, or nothing) in `rest`. Splitting
/// the grammar here means a line missing `email:` still matches this
/// regex — it just produces an empty/non-email `rest` — so the caller can
/// tell "no email token" apart from "line doesn't look like an access-log
/// line at all" (spec.md §4.1, §7: these are two distinct rejection kinds).
fn grammar() -> &'static Regex {
    static GRAMMAR: OnceLock<Regex> = OnceLock::new();
    GRAMMAR.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^
            (?P<ts>\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2}(?:\.\d+)?)\s+
            from\s+
            (?P<ip>\[[0-9A-Fa-f:]+\]|[0-9]{1,3}(?:\.[0-9]{1,3}){3}):\d+\s+
            (?P<action>\S+)\s+
            (?P<proto>[^:\s]+):(?P<dst>[^:\s]+):\d+
            (?:\s+\[[^\]]*\])?
            \s*
            (?P<rest>.*)
            $
            ",
        )
        .expect("access-log grammar is a valid regex")
    })
}

/// Matches the `email:` token in isolation against whatever `grammar()`
/// left in `rest`.
fn email_grammar() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^email:\s*(?P<email>\S+)\s*$").expect("email grammar is a valid regex")
    })
}

/// Parse one line. Whitespace is normalized first (spec.md §4.1); an
/// empty or control-prefixed line is rejected without attempting the
/// grammar match.
pub fn parse_line(raw: &str) -> Result<ParsedLine, RejectReason> {
    let line = raw.trim();
    if line.is_empty() || line.chars().next().is_some_and(|c| c.is_control()) {
        return Err(RejectReason::Empty);
    }

    // Collapse internal whitespace runs so agent-side formatting quirks
    // don't defeat the fixed-width grammar above.
    let normalized = normalize_whitespace(line);

    let captures = grammar().captures(&normalized).ok_or(RejectReason::Malformed)?;

    let ip_token = captures.name("ip").unwrap().as_str();
    let ip_text = ip_token.trim_start_matches('[').trim_end_matches(']');
    let source_ip: IpAddr = ip_text.parse().map_err(|_| RejectReason::Malformed)?;

    let rest = captures.name("rest").map(|m| m.as_str()).unwrap_or("");
    if !rest.starts_with("email:") {
        return Err(RejectReason::NoEmail);
    }
    let email = email_grammar()
        .captures(rest)
        .and_then(|c| c.name("email"))
        .map(|m| m.as_str().to_string())
        .ok_or(RejectReason::NoEmail)?;

    Ok(ParsedLine {
        source_ip,
        email,
        protocol: captures["proto"].to_string(),
        destination: format!("{}:{}", &captures["proto"], &captures["dst"]),
        action: captures["action"].to_string(),
        line_timestamp: captures["ts"].to_string(),
    })
}

/// Parse a line already known to respect the configured size limit;
/// callers that enforce `max_line_bytes` should call this after the
/// length check and translate an oversize line to `RejectReason::Oversize`
/// themselves (the parser has no notion of the configured limit).
pub fn parse_line_bounded(raw: &str, max_bytes: usize) -> Result<ParsedLine, RejectReason> {
    if raw.len() > max_bytes {
        return Err(RejectReason::Oversize);
    }
    parse_line(raw)
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonicalize a source IP to its /24 (IPv4) or /64 (IPv6) network when
/// `SUBNET_GROUPING` is enabled (spec.md §4.1). The original IP is
/// retained by the caller in `recent_requests`; only the counting key
/// changes.
pub fn canonicalize_ip(ip: IpAddr, subnet_grouping: bool) -> IpAddr {
    if !subnet_grouping {
        return ip;
    }
    match ip {
        IpAddr::V4(v4) => Ipv4Net::new(v4, 24)
            .map(|net| IpAddr::V4(net.network()))
            .unwrap_or(ip),
        IpAddr::V6(v6) => Ipv6Net::new(v6, 64)
            .map(|net| IpAddr::V6(net.network()))
            .unwrap_or(ip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_line(email: &str) -> String {
        format!(
            "2026/07/28 10:00:00.123456 from 203.0.113.9:54321 accept tcp:example.com:443 [rule-1] email: {}",
            email
        )
    }

    #[test]
    fn parses_well_formed_ipv4_line() {
        let parsed = parse_line(&sample_line("alice@example.com")).unwrap();
        assert_eq!(parsed.source_ip, "203.0.113.9".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.email, "alice@example.com");
        assert_eq!(parsed.protocol, "tcp");
        assert_eq!(parsed.action, "accept");
    }

    #[test]
    fn parses_bracketed_ipv6_line() {
        let line = "2026/07/28 10:00:00 from [2001:db8::1]:443 accept tcp:example.com:443 email: bob@example.com";
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.source_ip, "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn rejects_empty_line() {
        assert_eq!(parse_line("   "), Err(RejectReason::Empty));
    }

    #[test]
    fn rejects_missing_email() {
        let line = "2026/07/28 10:00:00 from 203.0.113.9:54321 accept tcp:example.com:443";
        assert_eq!(parse_line(line), Err(RejectReason::NoEmail));
    }

    #[test]
    fn rejects_malformed_grammar() {
        assert_eq!(parse_line("not a valid log line at all"), Err(RejectReason::Malformed));
    }

    #[test]
    fn rejects_oversize_line() {
        let huge = sample_line("carol@example.com") + &"x".repeat(20_000);
        assert_eq!(parse_line_bounded(&huge, 16 * 1024), Err(RejectReason::Oversize));
    }

    #[test]
    fn insignificant_whitespace_does_not_change_result() {
        let tight = sample_line("dana@example.com");
        let loose = tight.replace(' ', "   ");
        assert_eq!(parse_line(&tight).unwrap(), parse_line(&loose).unwrap());
    }

    #[test]
    fn subnet_grouping_collapses_same_v4_slash24() {
        let a: IpAddr = "203.0.113.5".parse().unwrap();
        let b: IpAddr = "203.0.113.250".parse().unwrap();
        assert_eq!(canonicalize_ip(a, true), canonicalize_ip(b, true));
    }

    #[test]
    fn subnet_grouping_disabled_keeps_original_ip() {
        let a: IpAddr = "203.0.113.5".parse().unwrap();
        assert_eq!(canonicalize_ip(a, false), a);
    }

    #[test]
    fn subnet_grouping_collapses_same_v6_slash64() {
        let a: IpAddr = "2001:db8::1".parse().unwrap();
        let b: IpAddr = "2001:db8::dead:beef".parse().unwrap();
        assert_eq!(canonicalize_ip(a, true), canonicalize_ip(b, true));
    }

    proptest::proptest! {
        #[test]
        fn parse_is_insensitive_to_surrounding_whitespace(
            email in "[a-z]{3,10}@[a-z]{3,10}\\.com",
            pad_before in 0usize..4,
            pad_after in 0usize..4,
        ) {
            let core = sample_line(&email);
            let padded = format!("{}{}{}", " ".repeat(pad_before), core, " ".repeat(pad_after));
            let a = parse_line(&core).unwrap();
            let b = parse_line(&padded).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
