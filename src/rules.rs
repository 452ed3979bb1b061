//! Signature-based rule engine
//!
//! Compiles the configured pattern rules and evaluates them, in list order,
//! against one surface of each request. The first match wins; a request
//! checked against zero rules never matches.

use hyper::HeaderMap;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

use crate::config::RuleConfig;
use crate::error::{ProxyError, Result};

/// Request surface a rule inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleLocation {
    Body,
    QueryParams,
    Uri,
    Headers,
}

/// One compiled signature
#[derive(Debug)]
pub struct CompiledRule {
    pub name: String,
    pub location: RuleLocation,
    pattern: Regex,
}

/// Ordered set of compiled rules
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
}

impl RuleEngine {
    /// Compile the configured rules; any pattern that fails to compile
    /// rejects the whole set.
    pub fn new(configs: &[RuleConfig]) -> Result<Self> {
        let mut rules = Vec::with_capacity(configs.len());
        for cfg in configs {
            let pattern = Regex::new(&cfg.pattern).map_err(|e| ProxyError::Rule {
                name: cfg.name.clone(),
                source: e,
            })?;
            rules.push(CompiledRule {
                name: cfg.name.clone(),
                location: cfg.location,
                pattern,
            });
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate every rule against its surface; returns the name of the
    /// first rule that matches.
    ///
    /// Location semantics:
    /// - `uri`: the request path, query string excluded
    /// - `query_params`: each decoded query value; any value matching wins
    /// - `headers`: each header value; any value matching wins
    /// - `body`: the buffered body bytes; only evaluated when non-empty
    pub fn check(
        &self,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Option<&str> {
        for rule in &self.rules {
            let matched = match rule.location {
                RuleLocation::Body => !body.is_empty() && rule.pattern.is_match(body),
                RuleLocation::QueryParams => query.is_some_and(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .any(|(_, value)| rule.pattern.is_match(value.as_bytes()))
                }),
                RuleLocation::Uri => rule.pattern.is_match(path.as_bytes()),
                RuleLocation::Headers => headers
                    .values()
                    .any(|value| rule.pattern.is_match(value.as_bytes())),
            };

            if matched {
                return Some(&rule.name);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(rules: &[(&str, &str, RuleLocation)]) -> RuleEngine {
        let configs: Vec<RuleConfig> = rules
            .iter()
            .map(|(name, pattern, location)| RuleConfig {
                name: name.to_string(),
                pattern: pattern.to_string(),
                location: *location,
            })
            .collect();
        RuleEngine::new(&configs).unwrap()
    }

    #[test]
    fn test_empty_engine_never_matches() {
        let engine = RuleEngine::new(&[]).unwrap();
        let headers = HeaderMap::new();
        assert!(engine
            .check("/etc/passwd", Some("q=UNION+SELECT"), &headers, b"body")
            .is_none());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let configs = [RuleConfig {
            name: "broken".to_string(),
            pattern: "[".to_string(),
            location: RuleLocation::Uri,
        }];
        assert!(RuleEngine::new(&configs).is_err());
    }

    #[test]
    fn test_uri_matches_path_only() {
        let engine = engine(&[("traversal", r"\.\./", RuleLocation::Uri)]);
        let headers = HeaderMap::new();

        assert_eq!(
            engine.check("/../../etc/passwd", None, &headers, &[]),
            Some("traversal")
        );
        // The query string is not part of the uri surface
        assert!(engine
            .check("/safe", Some("path=../../etc"), &headers, &[])
            .is_none());
    }

    #[test]
    fn test_query_values_are_decoded() {
        let engine = engine(&[("sqli", "UNION SELECT", RuleLocation::QueryParams)]);
        let headers = HeaderMap::new();

        assert_eq!(
            engine.check("/", Some("q=UNION%20SELECT"), &headers, &[]),
            Some("sqli")
        );
        assert_eq!(
            engine.check("/", Some("a=1&q=UNION+SELECT+1"), &headers, &[]),
            Some("sqli")
        );
        assert!(engine.check("/", Some("q=hello"), &headers, &[]).is_none());
        assert!(engine.check("/", None, &headers, &[]).is_none());
    }

    #[test]
    fn test_header_values_scanned() {
        let engine = engine(&[("xss", "(?i)<script", RuleLocation::Headers)]);
        let mut headers = HeaderMap::new();
        headers.insert("x-payload", "<SCRIPT>alert(1)</SCRIPT>".parse().unwrap());

        assert_eq!(engine.check("/", None, &headers, &[]), Some("xss"));

        let clean = HeaderMap::new();
        assert!(engine.check("/", None, &clean, &[]).is_none());
    }

    #[test]
    fn test_body_requires_bytes() {
        let engine = engine(&[("cmd", "(?i)/bin/sh", RuleLocation::Body)]);
        let headers = HeaderMap::new();

        assert_eq!(
            engine.check("/", None, &headers, b"run /bin/sh now"),
            Some("cmd")
        );
        // An empty body never matches, even patterns that match ""
        let engine = engine_with_empty_match();
        assert!(engine.check("/", None, &headers, &[]).is_none());
    }

    fn engine_with_empty_match() -> RuleEngine {
        engine(&[("anything", ".*", RuleLocation::Body)])
    }

    #[test]
    fn test_first_match_wins_in_list_order() {
        let engine = engine(&[
            ("first", "attack", RuleLocation::Uri),
            ("second", "attack", RuleLocation::Uri),
        ]);
        let headers = HeaderMap::new();
        assert_eq!(engine.check("/attack", None, &headers, &[]), Some("first"));
    }

    #[test]
    fn test_case_sensitivity_follows_pattern() {
        let engine1 = engine(&[("exact", "UNION SELECT", RuleLocation::QueryParams)]);
        let headers = HeaderMap::new();
        assert!(engine1
            .check("/", Some("q=union+select"), &headers, &[])
            .is_none());

        let engine2 = engine(&[("folded", "(?i)union select", RuleLocation::QueryParams)]);
        assert_eq!(
            engine2.check("/", Some("q=UnIoN+sElEcT"), &headers, &[]),
            Some("folded")
        );
    }
}
