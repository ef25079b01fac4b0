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

//! The parsed client request consumed by the reply pipeline
//!
//! Request parsing and transport live upstream of this crate. A [Request] is
//! the read-only product of that work: the header plus the flags the parser
//! and the access phase derived from it. The reply state keeps its own
//! mutable copy of [RequestFlags] so the shared request never changes.

use http::{header, Method, StatusCode, Version};
use pingora_http::RequestHeader;
use std::time::SystemTime;

/// A redirect queued before cache processing (e.g. by a URL rewriter).
///
/// A queued redirect forces a miss: 3xx responses have no body to cache.
#[derive(Debug, Clone)]
pub struct QueuedRedirect {
    pub status: StatusCode,
    pub location: String,
}

/// Request facts the pipeline branches on.
///
/// The parser sets these once; the reply state mutates only its own copy.
#[derive(Debug, Clone, Default)]
pub struct RequestFlags {
    /// Client sent `Cache-Control: no-cache` (or `Pragma: no-cache`)
    pub no_cache: bool,
    /// `Cache-Control: only-if-cached`
    pub only_if_cached: bool,
    /// Internally generated request; may read cached objects regardless
    pub internal: bool,
    /// This request has already passed through us (Via loop)
    pub loop_detected: bool,
    /// The response may be stored
    pub cachable: bool,
    /// A stale copy exists and must be validated before use.
    /// Suppresses sibling forwarding loops.
    pub need_validation: bool,
    /// This request is a revalidation of a stale entry
    pub refresh: bool,
    /// Forward upstream validation errors instead of serving the stale copy
    pub fail_on_validation_err: bool,
    /// Connection-oriented auth is in use on this connection
    pub connection_auth: bool,
    /// Connection-oriented auth schemes must be stripped from replies
    pub connection_auth_disabled: bool,
    /// The reply must keep the connection open (session-based auth)
    pub must_keepalive: bool,
    /// Keep-alive decision for the reply, may be withdrawn by the builder
    pub proxy_keepalive: bool,
    /// The reply body will be chunked
    pub chunked_reply: bool,
    /// Reverse-proxy (accelerated) request
    pub accelerated: bool,
    /// Transparently intercepted request
    pub intercepted: bool,
    /// TLS was bumped on this connection
    pub ssl_bumped: bool,
    /// The client connection is pinned to one upstream
    pub pinned: bool,
    /// A local override pretends the client did not send no-cache
    pub no_cache_hack: bool,
    /// Set once the client's If-Modified-Since has been consumed
    pub ims: bool,
}

/// The parsed client request plus everything the reply pipeline needs to
/// know about how it arrived.
#[derive(Debug)]
pub struct Request {
    pub header: RequestHeader,
    pub flags: RequestFlags,
    pub redirect: Option<QueuedRedirect>,
    /// Login mode of the configured peer, if any (`PASS` and `PASSTHRU`
    /// allow `Proxy-Authenticate` through)
    pub peer_login: Option<String>,
    /// Challenge the auth layer wants attached to 401/407 replies we
    /// generate ourselves
    pub auth_challenge: Option<String>,
    /// Client advertised `Surrogate-Capability`
    pub surrogate_capable: bool,
}

impl Request {
    /// Wrap a parsed header, deriving the cache-control request flags.
    pub fn new(header: RequestHeader) -> Self {
        let mut flags = RequestFlags {
            proxy_keepalive: true,
            cachable: matches!(header.method, Method::GET | Method::HEAD),
            ..Default::default()
        };
        for cc in header.headers.get_all(header::CACHE_CONTROL) {
            let Ok(cc) = cc.to_str() else { continue };
            for directive in cc.split(',') {
                match directive.trim() {
                    d if d.eq_ignore_ascii_case("no-cache") => flags.no_cache = true,
                    d if d.eq_ignore_ascii_case("only-if-cached") => flags.only_if_cached = true,
                    _ => {}
                }
            }
        }
        if header.headers.get(header::PRAGMA).is_some_and(|v| {
            v.to_str()
                .is_ok_and(|v| v.eq_ignore_ascii_case("no-cache"))
        }) {
            flags.no_cache = true;
        }
        flags.ims = header.headers.contains_key(header::IF_MODIFIED_SINCE);
        let surrogate_capable = header.headers.contains_key("surrogate-capability");
        Request {
            header,
            flags,
            redirect: None,
            peer_login: None,
            auth_challenge: None,
            surrogate_capable,
        }
    }

    pub fn method(&self) -> &Method {
        &self.header.method
    }

    /// The request carries any precondition header
    pub fn conditional(&self) -> bool {
        let h = &self.header.headers;
        h.contains_key(header::IF_MATCH)
            || h.contains_key(header::IF_NONE_MATCH)
            || h.contains_key(header::IF_MODIFIED_SINCE)
    }

    /// Parsed `If-Modified-Since`, `None` when absent or malformed
    pub fn if_modified_since(&self) -> Option<SystemTime> {
        let v = self.header.headers.get(header::IF_MODIFIED_SINCE)?;
        httpdate::parse_http_date(v.to_str().ok()?).ok()
    }

    /// `Max-Forwards`, when present and well formed
    pub fn max_forwards(&self) -> Option<u64> {
        let v = self.header.headers.get(header::MAX_FORWARDS)?;
        v.to_str().ok()?.trim().parse().ok()
    }

    /// Whether the scheme is revalidatable (we only know how for http/https)
    pub fn http_scheme(&self) -> bool {
        match self.header.uri.scheme_str() {
            Some(s) => s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("https"),
            // origin-form request line: implicitly http
            None => true,
        }
    }

    /// Host portion of the request URI, for IP cache invalidation
    pub fn host(&self) -> Option<&str> {
        self.header
            .uri
            .host()
            .or_else(|| self.header.headers.get(header::HOST)?.to_str().ok())
    }

    /// Whether the client speaks HTTP/1.1 or newer (may receive chunked)
    pub fn http11(&self) -> bool {
        self.header.version >= Version::HTTP_11
    }
}
