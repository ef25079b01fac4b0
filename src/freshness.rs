// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Freshness classification of stored replies

use crate::storage::EntryMeta;

use http::header;
use httpdate::HttpDate;
use log::warn;
use pingora_http::ResponseHeader;
use regex::Regex;
use serde::Deserialize;
use std::time::{Duration, SystemTime};

/// The verdict on one stored reply at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Usable only after validation against the origin
    Stale,
    /// No expiry information and no modification time: the entry cannot be
    /// revalidated, treat as a miss
    Unknown,
}

/// One heuristic freshness rule, applied when the reply carries no explicit
/// expiry. First matching rule wins.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRule {
    /// Applied to URIs matching this pattern
    #[serde(with = "serde_regex")]
    pub pattern: Regex,
    /// Objects younger than this are always fresh
    pub min: Duration,
    /// Fraction of the object's age at caching time (its Last-Modified
    /// distance) it stays fresh for, in percent
    pub percent: u32,
    /// Objects older than this are always stale
    pub max: Duration,
}

// Regex does not implement Deserialize; keep the conf type deserializable
mod serde_regex {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Regex, D::Error> {
        let s = String::deserialize(d)?;
        Regex::new(&s).map_err(serde::de::Error::custom)
    }
}

impl RefreshRule {
    fn classify(&self, age: Duration, lm_age: Option<Duration>) -> Freshness {
        if age < self.min {
            return Freshness::Fresh;
        }
        if age >= self.max {
            return Freshness::Stale;
        }
        match lm_age {
            Some(lm_age) => {
                let horizon = lm_age.mul_f64(f64::from(self.percent) / 100.0);
                if age < horizon {
                    Freshness::Fresh
                } else {
                    Freshness::Stale
                }
            }
            // between min and max with nothing to extrapolate from
            None => Freshness::Stale,
        }
    }
}

/// Decides stale/fresh/needs-validation from entry metadata, the stored
/// reply and the refresh rule table.
///
/// Pure function of its inputs; `now` is a parameter so tests are
/// deterministic. Callers must set `need_validation` on the request whenever
/// [Freshness::Stale] comes back.
pub struct FreshnessEvaluator<'a> {
    rules: &'a [RefreshRule],
}

impl<'a> FreshnessEvaluator<'a> {
    pub fn new(rules: &'a [RefreshRule]) -> Self {
        FreshnessEvaluator { rules }
    }

    /// Classify the stored reply for `uri` at `now`.
    pub fn check(
        &self,
        meta: &EntryMeta,
        reply: &ResponseHeader,
        uri: &str,
        now: SystemTime,
    ) -> Freshness {
        let age = now
            .duration_since(meta.timestamp)
            .unwrap_or(Duration::ZERO);

        // explicit freshness: Cache-Control max-age / s-maxage first
        if let Some(max_age) = max_age_sec(reply) {
            return if age.as_secs() < max_age {
                Freshness::Fresh
            } else {
                Freshness::Stale
            };
        }

        // then the Expires header (an unparsable date means already expired)
        if let Some(expires) = expires_time(reply).or(meta.expires) {
            return if now < expires {
                Freshness::Fresh
            } else {
                Freshness::Stale
            };
        }

        // heuristics need a modification time to extrapolate from
        let lm_age = meta
            .last_modified
            .and_then(|lm| meta.timestamp.duration_since(lm).ok());

        for rule in self.rules {
            if rule.pattern.is_match(uri) {
                let fresh = rule.classify(age, lm_age);
                if fresh == Freshness::Stale && meta.last_modified.is_none() {
                    // stale but unrevalidatable
                    return Freshness::Unknown;
                }
                return fresh;
            }
        }

        if meta.last_modified.is_none() {
            return Freshness::Unknown;
        }
        // no rule matched: consider the copy stale and let validation decide
        Freshness::Stale
    }
}

/// `max-age`/`s-maxage` seconds from the reply's Cache-Control, preferring
/// `s-maxage` as we are a shared cache.
fn max_age_sec(reply: &ResponseHeader) -> Option<u64> {
    let mut max_age = None;
    let mut s_maxage = None;
    for value in reply.headers.get_all(header::CACHE_CONTROL) {
        let Ok(value) = value.to_str() else { continue };
        for directive in value.split(',') {
            let directive = directive.trim();
            if let Some(v) = directive.strip_prefix("s-maxage=") {
                s_maxage = v.trim_matches('"').parse::<u64>().ok();
            } else if let Some(v) = directive.strip_prefix("max-age=") {
                max_age = v.trim_matches('"').parse::<u64>().ok();
            }
        }
    }
    s_maxage.or(max_age)
}

/// The expiry from the `Expires` header only.
///
/// Multiple `Expires` headers are invalid and ignored; an unparsable date is
/// a time in the past per RFC 9111.
fn expires_time(reply: &ResponseHeader) -> Option<SystemTime> {
    let mut iter = reply.headers.get_all(header::EXPIRES).iter();
    let first = iter.next()?;
    if iter.next().is_some() {
        return None;
    }
    let parsed = first
        .to_str()
        .ok()
        .and_then(|v| v.parse::<HttpDate>().ok())
        .map(SystemTime::from);
    if parsed.is_none() {
        warn!("invalid Expires header treated as already expired");
        return Some(SystemTime::UNIX_EPOCH);
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_reply(headers: &[(&str, &str)]) -> ResponseHeader {
        let mut reply = ResponseHeader::build(200, Some(headers.len())).unwrap();
        for (k, v) in headers {
            reply.append_header(k.to_string(), *v).unwrap();
        }
        reply
    }

    fn meta_with_age(age_sec: u64) -> EntryMeta {
        EntryMeta {
            timestamp: SystemTime::now() - Duration::from_secs(age_sec),
            last_modified: Some(SystemTime::now() - Duration::from_secs(age_sec + 3600)),
            expires: None,
        }
    }

    #[test]
    fn test_max_age() {
        let eval = FreshnessEvaluator::new(&[]);
        let reply = build_reply(&[("Cache-Control", "max-age=60")]);
        let now = SystemTime::now();
        assert_eq!(
            eval.check(&meta_with_age(10), &reply, "/a", now),
            Freshness::Fresh
        );
        assert_eq!(
            eval.check(&meta_with_age(61), &reply, "/a", now),
            Freshness::Stale
        );
    }

    #[test]
    fn test_s_maxage_wins() {
        let eval = FreshnessEvaluator::new(&[]);
        let reply = build_reply(&[("Cache-Control", "max-age=1000, s-maxage=5")]);
        assert_eq!(
            eval.check(&meta_with_age(10), &reply, "/a", SystemTime::now()),
            Freshness::Stale
        );
    }

    #[test]
    fn test_expires() {
        let eval = FreshnessEvaluator::new(&[]);
        let future = SystemTime::now() + Duration::from_secs(300);
        let reply = build_reply(&[("Expires", &httpdate::fmt_http_date(future))]);
        assert_eq!(
            eval.check(&meta_with_age(10), &reply, "/a", SystemTime::now()),
            Freshness::Fresh
        );

        let reply = build_reply(&[("Expires", "0")]);
        assert_eq!(
            eval.check(&meta_with_age(10), &reply, "/a", SystemTime::now()),
            Freshness::Stale
        );
    }

    #[test]
    fn test_heuristic_rule() {
        let rules = vec![RefreshRule {
            pattern: Regex::new(".").unwrap(),
            min: Duration::from_secs(30),
            percent: 20,
            max: Duration::from_secs(3600),
        }];
        let eval = FreshnessEvaluator::new(&rules);
        let reply = build_reply(&[]);
        let now = SystemTime::now();

        // below min: fresh regardless of Last-Modified distance
        assert_eq!(
            eval.check(&meta_with_age(10), &reply, "/a", now),
            Freshness::Fresh
        );
        // 20% of a 1h LM distance is 720s
        assert_eq!(
            eval.check(&meta_with_age(600), &reply, "/a", now),
            Freshness::Fresh
        );
        assert_eq!(
            eval.check(&meta_with_age(1000), &reply, "/a", now),
            Freshness::Stale
        );
        // above max: stale
        assert_eq!(
            eval.check(&meta_with_age(4000), &reply, "/a", now),
            Freshness::Stale
        );
    }

    #[test]
    fn test_unknown_without_last_modified() {
        let eval = FreshnessEvaluator::new(&[]);
        let reply = build_reply(&[]);
        let meta = EntryMeta {
            timestamp: SystemTime::now() - Duration::from_secs(600),
            last_modified: None,
            expires: None,
        };
        assert_eq!(
            eval.check(&meta, &reply, "/a", SystemTime::now()),
            Freshness::Unknown
        );
    }
}
