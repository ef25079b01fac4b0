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

//! Conditional request evaluation against a stored reply

use http::{header::*, Method, StatusCode};
use httpdate::parse_http_date;
use pingora_http::{RequestHeader, ResponseHeader};
use std::time::SystemTime;

/// What a conditional hit resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Preconditions passed (or none present): serve the full hit
    Hit,
    /// 304 to a GET/HEAD whose validator matched
    NotModified,
    /// 412: If-Match failed, or a matched If-None-Match on an unsafe method
    PreconditionFailed,
    /// The stored reply cannot answer conditionals (non-200 base): refetch
    Miss,
}

/// Evaluate the client's preconditions against the stored reply.
///
/// Precedence per RFC 9110: If-Match, then If-None-Match (which makes
/// If-Modified-Since ignored), then If-Modified-Since.
pub fn evaluate(
    req: &RequestHeader,
    stored: &ResponseHeader,
    last_modified: Option<SystemTime>,
) -> Disposition {
    // 304 can only validate a stored 200
    if stored.status != StatusCode::OK {
        return Disposition::Miss;
    }

    let etag = stored.headers.get(ETAG);

    if req.headers.contains_key(IF_MATCH) {
        // If-Match uses the strong comparison
        let matched = etag.is_some_and(|etag| {
            req.headers
                .get_all(IF_MATCH)
                .iter()
                .any(|im| strong_validate_etag(im.as_bytes(), etag.as_bytes()))
        });
        if !matched {
            return Disposition::PreconditionFailed;
        }
    }

    if req.headers.contains_key(IF_NONE_MATCH) {
        // "MUST ignore If-Modified-Since if the request contains an
        // If-None-Match header" -- the caller clears the ims flag
        let matched = etag.is_some_and(|etag| {
            req.headers
                .get_all(IF_NONE_MATCH)
                .iter()
                .any(|inm| weak_validate_etag(inm.as_bytes(), etag.as_bytes()))
        });
        if matched {
            return if matches!(req.method, Method::GET | Method::HEAD) {
                Disposition::NotModified
            } else {
                Disposition::PreconditionFailed
            };
        }
        // no ETag matched: unconditional hit, IMS stays ignored
        return Disposition::Hit;
    }

    if let Some(ims) = req
        .headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_http_date(v).ok())
    {
        if modified_since(last_modified, ims) {
            return Disposition::Hit;
        }
        return Disposition::NotModified;
    }

    Disposition::Hit
}

/// Whether the stored object changed after `since`.
///
/// An unknown modification time counts as modified; we cannot prove
/// otherwise.
pub fn modified_since(last_modified: Option<SystemTime>, since: SystemTime) -> bool {
    match last_modified {
        Some(lm) => lm > since,
        None => true,
    }
}

// The entity-tag with its weakness indicator removed
fn opaque_tag(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

/// Search for an ETag matching `target_etag` in the input header using the
/// [weak comparison](https://datatracker.ietf.org/doc/html/rfc9110#section-8.8.3.2):
/// weakness indicators are ignored on both sides and the opaque tags must be
/// octet-identical. The header may carry a comma-separated list of tags.
pub fn weak_validate_etag(input_etag_header: &[u8], target_etag: &[u8]) -> bool {
    let (Ok(input), Ok(target)) = (
        std::str::from_utf8(input_etag_header),
        std::str::from_utf8(target_etag),
    ) else {
        // entity-tags are ASCII; anything else cannot match
        return false;
    };
    if input.trim() == "*" {
        return true;
    }
    let target = opaque_tag(target.trim());
    input
        .split(',')
        .any(|candidate| opaque_tag(candidate.trim()) == target)
}

/// The strong comparison: both tags must be strong and octet-identical.
/// Used by If-Match.
pub fn strong_validate_etag(input_etag_header: &[u8], target_etag: &[u8]) -> bool {
    let (Ok(input), Ok(target)) = (
        std::str::from_utf8(input_etag_header),
        std::str::from_utf8(target_etag),
    ) else {
        return false;
    };
    if input.trim() == "*" {
        return true;
    }
    let target = target.trim();
    if target.starts_with("W/") {
        return false;
    }
    input
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.starts_with("W/"))
        .any(|candidate| candidate == target)
}

/// Whether the stored reply carries a strong ETag, and its value
pub fn strong_etag(stored: &ResponseHeader) -> Option<&http::HeaderValue> {
    let etag = stored.headers.get(ETAG)?;
    if etag.as_bytes().starts_with(b"W/") {
        None
    } else {
        Some(etag)
    }
}

/// Project a stored reply to its 304 form.
///
/// Status becomes 304; validators and caching directives stay, while the
/// metadata that only describes the body we are not sending is dropped
/// (RFC 9110 section 15.4.5).
pub fn make_304(resp: &mut ResponseHeader) {
    resp.set_status(StatusCode::NOT_MODIFIED).unwrap();
    for name in [
        CONTENT_LENGTH,
        CONTENT_TYPE,
        CONTENT_ENCODING,
        TRANSFER_ENCODING,
        ACCEPT_RANGES,
    ] {
        resp.remove_header(&name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn build_req(method: Method, headers: &[(&str, &str)]) -> RequestHeader {
        let mut req = RequestHeader::build(method, b"/", None).unwrap();
        for (k, v) in headers {
            req.insert_header(k.to_string(), *v).unwrap();
        }
        req
    }

    fn build_resp(status: u16, headers: &[(&str, &str)]) -> ResponseHeader {
        let mut resp = ResponseHeader::build(status, None).unwrap();
        for (k, v) in headers {
            resp.insert_header(k.to_string(), *v).unwrap();
        }
        resp
    }

    #[test]
    fn test_non_200_is_miss() {
        let req = build_req(Method::GET, &[("If-None-Match", "\"v1\"")]);
        let resp = build_resp(301, &[("ETag", "\"v1\"")]);
        assert_eq!(evaluate(&req, &resp, None), Disposition::Miss);
    }

    #[test]
    fn test_if_match() {
        let resp = build_resp(200, &[("ETag", "\"v1\"")]);
        let req = build_req(Method::GET, &[("If-Match", "\"v1\"")]);
        assert_eq!(evaluate(&req, &resp, None), Disposition::Hit);

        let req = build_req(Method::GET, &[("If-Match", "\"v2\"")]);
        assert_eq!(evaluate(&req, &resp, None), Disposition::PreconditionFailed);

        // weak target never strong-matches
        let weak = build_resp(200, &[("ETag", "W/\"v1\"")]);
        let req = build_req(Method::GET, &[("If-Match", "\"v1\"")]);
        assert_eq!(evaluate(&req, &weak, None), Disposition::PreconditionFailed);
    }

    #[test]
    fn test_if_none_match() {
        let resp = build_resp(200, &[("ETag", "\"v1\"")]);

        let req = build_req(Method::GET, &[("If-None-Match", "\"v1\"")]);
        assert_eq!(evaluate(&req, &resp, None), Disposition::NotModified);

        let req = build_req(Method::POST, &[("If-None-Match", "\"v1\"")]);
        assert_eq!(evaluate(&req, &resp, None), Disposition::PreconditionFailed);

        let req = build_req(Method::GET, &[("If-None-Match", "\"v2\"")]);
        assert_eq!(evaluate(&req, &resp, None), Disposition::Hit);

        // weak comparison accepts a weak stored tag
        let weak = build_resp(200, &[("ETag", "W/\"v1\"")]);
        let req = build_req(Method::GET, &[("If-None-Match", "\"v1\"")]);
        assert_eq!(evaluate(&req, &weak, None), Disposition::NotModified);
    }

    #[test]
    fn test_inm_suppresses_ims() {
        // INM misses, so IMS must be ignored even though it would 304
        let lm = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let resp = build_resp(200, &[("ETag", "\"v1\"")]);
        let req = build_req(
            Method::GET,
            &[
                ("If-None-Match", "\"other\""),
                ("If-Modified-Since", &httpdate::fmt_http_date(lm)),
            ],
        );
        assert_eq!(evaluate(&req, &resp, Some(lm)), Disposition::Hit);
    }

    #[test]
    fn test_ims() {
        let lm = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let resp = build_resp(200, &[]);

        let req = build_req(
            Method::GET,
            &[("If-Modified-Since", &httpdate::fmt_http_date(lm))],
        );
        assert_eq!(evaluate(&req, &resp, Some(lm)), Disposition::NotModified);

        // modified after the client's copy
        let newer = lm + Duration::from_secs(60);
        assert_eq!(evaluate(&req, &resp, Some(newer)), Disposition::Hit);

        // unknown modification time counts as modified
        assert_eq!(evaluate(&req, &resp, None), Disposition::Hit);
    }

    #[test]
    fn test_weak_validate_etag() {
        assert!(weak_validate_etag(b"*", br#""xyzzy""#));
        assert!(weak_validate_etag(br#""xyzzy""#, br#"W/"xyzzy""#));
        assert!(weak_validate_etag(br#"W/"xyzzy""#, br#""xyzzy""#));
        assert!(!weak_validate_etag(br#""abc""#, br#""xyzzy""#));
        let multiple = br#"a, "xyzzy","r2d2", "c3po",zzzfoo"#;
        assert!(weak_validate_etag(multiple, br#""xyzzy""#));
        assert!(!weak_validate_etag(multiple, br#""nope""#));
    }

    #[test]
    fn test_strong_validate_etag() {
        assert!(strong_validate_etag(br#""v1""#, br#""v1""#));
        assert!(strong_validate_etag(br#""v0", "v1""#, br#""v1""#));
        assert!(!strong_validate_etag(br#"W/"v1""#, br#""v1""#));
        assert!(!strong_validate_etag(br#""v1""#, br#"W/"v1""#));
        assert!(strong_validate_etag(b"*", br#""v1""#));
    }

    #[test]
    fn test_make_304() {
        let mut resp = build_resp(
            200,
            &[
                ("Content-Length", "10"),
                ("Content-Type", "text/plain"),
                ("ETag", "\"v1\""),
                ("Date", "Fri, 26 Mar 2010 00:05:00 GMT"),
            ],
        );
        make_304(&mut resp);
        assert_eq!(resp.status, StatusCode::NOT_MODIFIED);
        assert!(resp.headers.get(CONTENT_LENGTH).is_none());
        assert!(resp.headers.get(CONTENT_TYPE).is_none());
        assert!(resp.headers.get(ETAG).is_some());
        assert!(resp.headers.get(DATE).is_some());
    }
}
