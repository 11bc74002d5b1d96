//! Protocol classification by connection prefix.
//!
//! Rules are an ordered list of (matcher, target) pairs. Each matcher looks
//! at the bytes buffered so far and answers [`Verdict::Match`],
//! [`Verdict::NoMatch`] or [`Verdict::NeedMore`]. Rules are consulted top to
//! bottom:
//!
//! - the first `Match` wins;
//! - a `NeedMore` stops evaluation so lower-priority rules cannot win before
//!   the higher-priority rule has decided;
//! - if every rule says `NoMatch` the connection is rejected.
//!
//! Rule order is the only tie-break. Priority is HTTP, then TLS (admin), then
//! SOCKS5.

use std::net::SocketAddr;

use crate::backend::BackendRole;

/// Request-line verbs routed to the HTTP proxy (each followed by a space).
pub const HTTP_VERBS: [&[u8]; 4] = [b"GET ", b"POST ", b"PUT ", b"DELETE "];

/// TLS handshake record type.
pub const TLS_HANDSHAKE: u8 = 0x16;

/// Highest accepted TLS record major version byte.
pub const TLS_MAX_MAJOR: u8 = 0x03;

/// SOCKS protocol version 5.
pub const SOCKS5_VERSION: u8 = 0x05;

/// Lookahead buffer size; enough for the longest verb.
pub const LOOKAHEAD: usize = 16;

/// A matcher's answer for a given prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    NoMatch,
    NeedMore,
}

/// Prefix predicate.
pub type Matcher = fn(&[u8]) -> Verdict;

/// `GET `, `POST `, `PUT ` or `DELETE `.
pub fn match_http(prefix: &[u8]) -> Verdict {
    let mut verdict = Verdict::NoMatch;
    for verb in HTTP_VERBS {
        if prefix.starts_with(verb) {
            return Verdict::Match;
        }
        if verb.starts_with(prefix) {
            verdict = Verdict::NeedMore;
        }
    }
    verdict
}

/// TLS record header: handshake content type followed by major version 0..=3.
pub fn match_tls(prefix: &[u8]) -> Verdict {
    match prefix {
        [] => Verdict::NeedMore,
        [first, ..] if *first != TLS_HANDSHAKE => Verdict::NoMatch,
        [_] => Verdict::NeedMore,
        [_, major, ..] if *major <= TLS_MAX_MAJOR => Verdict::Match,
        _ => Verdict::NoMatch,
    }
}

/// SOCKS5 version byte.
pub fn match_socks5(prefix: &[u8]) -> Verdict {
    match prefix.first() {
        None => Verdict::NeedMore,
        Some(&SOCKS5_VERSION) => Verdict::Match,
        Some(_) => Verdict::NoMatch,
    }
}

/// One routing rule.
#[derive(Debug, Clone)]
pub struct MuxRule {
    pub role: BackendRole,
    pub matcher: Matcher,
    pub target: SocketAddr,
}

/// Result of classifying a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Rule at this index matched.
    Matched(usize),
    /// A higher-priority rule is still undecided.
    Undecided,
    /// No rule can match.
    Rejected,
}

/// Ordered rule set.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: Vec<MuxRule>,
}

impl Classifier {
    pub fn new(rules: Vec<MuxRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[MuxRule] {
        &self.rules
    }

    pub fn rule(&self, index: usize) -> Option<&MuxRule> {
        self.rules.get(index)
    }

    /// Evaluate the rules against `prefix`, top to bottom.
    pub fn classify(&self, prefix: &[u8]) -> Classification {
        for (index, rule) in self.rules.iter().enumerate() {
            match (rule.matcher)(prefix) {
                Verdict::Match => return Classification::Matched(index),
                Verdict::NeedMore => return Classification::Undecided,
                Verdict::NoMatch => {}
            }
        }
        Classification::Rejected
    }

    /// Classify a prefix that will not grow (EOF, timeout or full buffer).
    ///
    /// A rule that still needs more bytes can no longer match, so it counts
    /// as `NoMatch`.
    pub fn classify_final(&self, prefix: &[u8]) -> Classification {
        self.rules
            .iter()
            .position(|rule| (rule.matcher)(prefix) == Verdict::Match)
            .map_or(Classification::Rejected, Classification::Matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        Classifier::new(
            [BackendRole::Http, BackendRole::Admin, BackendRole::Socks]
                .into_iter()
                .map(|role| MuxRule {
                    role,
                    matcher: role.matcher(),
                    target,
                })
                .collect(),
        )
    }

    fn role_for(prefix: &[u8]) -> Option<BackendRole> {
        let classifier = classifier();
        match classifier.classify_final(prefix) {
            Classification::Matched(i) => classifier.rule(i).map(|r| r.role),
            _ => None,
        }
    }

    #[test]
    fn test_reference_prefixes() {
        assert_eq!(role_for(b"GET / HTTP/1.1\r\n"), Some(BackendRole::Http));
        assert_eq!(
            role_for(b"\x16\x03\x01\x02\x00\x01\x00\x01\xfc\x03\x03"),
            Some(BackendRole::Admin)
        );
        assert_eq!(role_for(b"\x05\x01\x00"), Some(BackendRole::Socks));
        assert_eq!(role_for(b"\xFF\xFF"), None);
    }

    #[test]
    fn test_all_http_verbs() {
        for line in [
            &b"GET http://example.com/ HTTP/1.1"[..],
            b"POST http://example.com/ HTTP/1.1",
            b"PUT http://example.com/ HTTP/1.1",
            b"DELETE http://example.com/ HTTP/1.1",
        ] {
            assert_eq!(role_for(line), Some(BackendRole::Http));
        }
    }

    #[test]
    fn test_other_verbs_rejected() {
        assert_eq!(role_for(b"CONNECT example.com:443 HTTP/1.1"), None);
        assert_eq!(role_for(b"HEAD / HTTP/1.1"), None);
        assert_eq!(role_for(b"GETX / HTTP/1.1"), None);
        assert_eq!(role_for(b"get / HTTP/1.1"), None);
    }

    #[test]
    fn test_partial_prefixes_wait() {
        let c = classifier();
        assert_eq!(c.classify(b""), Classification::Undecided);
        assert_eq!(c.classify(b"G"), Classification::Undecided);
        assert_eq!(c.classify(b"GET"), Classification::Undecided);
        assert_eq!(c.classify(b"P"), Classification::Undecided);
        assert_eq!(c.classify(b"PU"), Classification::Undecided);
        assert_eq!(c.classify(b"DELET"), Classification::Undecided);
        assert_eq!(c.classify(b"\x16"), Classification::Undecided);

        assert_eq!(c.classify_final(b"GET"), Classification::Rejected);
        assert_eq!(c.classify_final(b"\x16"), Classification::Rejected);
        assert_eq!(c.classify_final(b""), Classification::Rejected);
    }

    #[test]
    fn test_tls_version_byte_bounds() {
        assert_eq!(match_tls(b"\x16\x00"), Verdict::Match);
        assert_eq!(match_tls(b"\x16\x03"), Verdict::Match);
        assert_eq!(match_tls(b"\x16\x04"), Verdict::NoMatch);
        assert_eq!(match_tls(b"\x17\x03"), Verdict::NoMatch);
    }

    #[test]
    fn test_socks_matches_on_first_byte() {
        let c = classifier();
        assert_eq!(c.classify(b"\x05"), Classification::Matched(2));
        assert_eq!(c.classify(b"\x04\x01"), Classification::Rejected);
    }

    #[test]
    fn test_priority_order_is_the_tie_break() {
        // A rule set where both matchers would accept the same bytes: the
        // first rule always wins.
        fn any(_: &[u8]) -> Verdict {
            Verdict::Match
        }
        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let c = Classifier::new(vec![
            MuxRule {
                role: BackendRole::Socks,
                matcher: match_socks5,
                target,
            },
            MuxRule {
                role: BackendRole::Http,
                matcher: any,
                target,
            },
        ]);
        assert_eq!(c.classify(b"\x05\x01\x00"), Classification::Matched(0));
        assert_eq!(c.classify(b"\xFF"), Classification::Matched(1));

        // An undecided higher-priority rule blocks a lower-priority match.
        let c = Classifier::new(vec![
            MuxRule {
                role: BackendRole::Http,
                matcher: match_http,
                target,
            },
            MuxRule {
                role: BackendRole::Socks,
                matcher: any,
                target,
            },
        ]);
        assert_eq!(c.classify(b"PO"), Classification::Undecided);
        assert_eq!(c.classify(b"POST "), Classification::Matched(0));
        assert_eq!(c.classify_final(b"PO"), Classification::Matched(1));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let c = classifier();
        for prefix in [&b"GET / "[..], b"\x16\x03\x01", b"\x05\x01\x00", b"\xFF\xFF"] {
            let first = c.classify_final(prefix);
            for _ in 0..10 {
                assert_eq!(c.classify_final(prefix), first);
            }
        }
    }
}
