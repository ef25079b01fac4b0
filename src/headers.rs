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

//! Reply header rewriting
//!
//! Clones of stored replies are never sent as-is: this module applies the
//! fixed mutation sequence (cookie and auth filtering, hop-by-hop removal,
//! Age/Date bookkeeping, Cache-Status, keep-alive and chunked signaling,
//! Via) before anything reaches the client.

use crate::config::ConfigSnapshot;
use crate::errors::SERVER_NAME;
use crate::request::{Request, RequestFlags};
use crate::LogTag;

use http::{header, HeaderValue, Method, StatusCode, Version};
use log::debug;
use pingora_http::ResponseHeader;
use std::time::SystemTime;

/// Everything the builder consults besides the reply itself.
pub struct ReplyHeaderCtx<'a> {
    pub config: &'a ConfigSnapshot,
    pub request: &'a Request,
    /// The reply state's mutable flag copy; keep-alive/chunked/must-keepalive
    /// decisions land here
    pub flags: &'a mut RequestFlags,
    pub tag: LogTag,
    pub entry_special: bool,
    pub entry_timestamp: Option<SystemTime>,
    pub entry_expires: Option<SystemTime>,
    pub first_lookup: Option<&'a str>,
    pub collapsed_slave: bool,
    /// Injected so the output is a pure function of its inputs
    pub now: SystemTime,
}

/// Body size the reply promises, `None` when unknown (close- or
/// chunk-delimited).
pub fn reply_body_size(method: &Method, reply: &ResponseHeader) -> Option<u64> {
    if *method == Method::HEAD {
        return Some(0);
    }
    match reply.status.as_u16() {
        204 | 304 => return Some(0),
        s if (100..200).contains(&s) => return Some(0),
        _ => {}
    }
    reply
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Whether the reply, as received, allows the connection it came on to
/// persist.
fn reply_persistent(reply: &ResponseHeader) -> bool {
    let close = reply
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("close"));
    if reply.version >= Version::HTTP_11 {
        !close
    } else {
        // 1.0 upstreams must opt in
        reply
            .headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case("keep-alive"))
    }
}

/// Remove hop-by-hop headers: the fixed RFC set plus anything the reply's
/// own Connection header nominates.
fn remove_hop_by_hop(reply: &mut ResponseHeader) {
    let nominated: Vec<String> = reply
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    for name in nominated {
        reply.remove_header(name.as_str());
    }
    reply.remove_header(&header::CONNECTION);
    reply.remove_header("keep-alive");
    reply.remove_header(&header::PROXY_AUTHORIZATION);
    reply.remove_header(&header::TE);
    reply.remove_header(&header::TRAILER);
    reply.remove_header(&header::TRANSFER_ENCODING);
    reply.remove_header(&header::UPGRADE);
}

// Content-Length is meaningless on these and some servers send it anyway
fn remove_irrelevant_content_length(reply: &mut ResponseHeader) {
    let s = reply.status.as_u16();
    if (100..200).contains(&s) || s == 204 || s == 304 {
        reply.remove_header(&header::CONTENT_LENGTH);
    }
}

fn connection_oriented_scheme(value: &[u8]) -> bool {
    fn is_scheme(value: &[u8], scheme: &[u8]) -> bool {
        value.len() >= scheme.len()
            && value[..scheme.len()].eq_ignore_ascii_case(scheme)
            && matches!(value.get(scheme.len()), None | Some(b' '))
    }
    is_scheme(value, b"NTLM") || is_scheme(value, b"Negotiate") || is_scheme(value, b"Kerberos")
}

/// Generate the reply headers sent to the client.
///
/// Mutation order is fixed; see the test for the idempotence contract
/// (building twice with the same inputs yields the same header set).
pub fn build_reply_header(ctx: &mut ReplyHeaderCtx, reply: &mut ResponseHeader) {
    let is_hit = ctx.tag.is_hit();
    let status = reply.status;
    // read before the hop-by-hop sweep strips the evidence
    let persistent = reply_persistent(reply);

    // Hits never relay cookies that a different client earned. Same for
    // revalidation slaves reading a borrowed entry.
    if is_hit || ctx.collapsed_slave {
        reply.remove_header(&header::SET_COOKIE);
    }

    // Proxy-Authenticate only passes through peers configured to forward
    // credentials
    let peer_passes_auth = ctx
        .request
        .peer_login
        .as_deref()
        .is_some_and(|l| l == "PASS" || l == "PASSTHRU");
    if !peer_passes_auth {
        reply.remove_header(&header::PROXY_AUTHENTICATE);
    }

    remove_hop_by_hop(reply);
    remove_irrelevant_content_length(reply);

    // Age bookkeeping on hits
    if is_hit {
        // any upstream Age described a different cache's copy
        reply.remove_header(&header::AGE);
        if ctx.entry_special {
            reply.remove_header(&header::DATE);
            reply
                .insert_header(header::DATE, httpdate::fmt_http_date(ctx.now))
                .unwrap();
        } else if ctx.config.act_as_origin {
            if let Some(date) = reply.remove_header(&header::DATE) {
                reply.insert_header("X-Origin-Date", date).unwrap();
            }
            reply
                .insert_header(header::DATE, httpdate::fmt_http_date(ctx.now))
                .unwrap();
            if let Some(expires) = ctx.entry_expires {
                if let Some(old) = reply.remove_header(&header::EXPIRES) {
                    reply.insert_header("X-Origin-Expires", old).unwrap();
                    if let Some(ts) = ctx.entry_timestamp {
                        if let Ok(ttl) = expires.duration_since(ts) {
                            reply
                                .insert_header(
                                    header::EXPIRES,
                                    httpdate::fmt_http_date(ctx.now + ttl),
                                )
                                .unwrap();
                        }
                    }
                }
            }
            if let Some(age) = ctx
                .entry_timestamp
                .and_then(|ts| ctx.now.duration_since(ts).ok())
            {
                // an origin has no Age; report ours out of band
                reply
                    .insert_header("X-Cache-Age", age.as_secs())
                    .unwrap();
            }
        } else if let Some(age) = ctx
            .entry_timestamp
            .and_then(|ts| ctx.now.duration_since(ts).ok())
        {
            reply.insert_header(header::AGE, age.as_secs()).unwrap();
        }
    }

    // We have a clock, so amend servers that forgot theirs
    if !reply.headers.contains_key(header::DATE) {
        let date = ctx.entry_timestamp.unwrap_or(ctx.now);
        reply
            .insert_header(header::DATE, httpdate::fmt_http_date(date))
            .unwrap();
    }

    // Filter unproxyable authentication schemes
    if ctx.tag != LogTag::TcpDenied && reply.headers.contains_key(header::WWW_AUTHENTICATE) {
        let values: Vec<HeaderValue> = reply
            .headers
            .get_all(header::WWW_AUTHENTICATE)
            .iter()
            .cloned()
            .collect();
        let connection_oriented = values
            .iter()
            .any(|v| connection_oriented_scheme(v.as_bytes()));
        if connection_oriented {
            if !ctx.config.connection_auth {
                debug!("stripping connection-oriented auth challenge");
                reply.remove_header(&header::WWW_AUTHENTICATE);
                for v in values {
                    if !connection_oriented_scheme(v.as_bytes()) {
                        reply.append_header(header::WWW_AUTHENTICATE, v).unwrap();
                    }
                }
            } else {
                ctx.flags.must_keepalive = true;
                if !ctx.flags.accelerated && !ctx.flags.intercepted {
                    reply
                        .insert_header("Proxy-Support", "Session-Based-Authentication")
                        .unwrap();
                    // mark Proxy-Support hop-by-hop for intermediaries that
                    // do not know this header
                    reply
                        .insert_header(header::CONNECTION, "Proxy-support")
                        .unwrap();
                }
            }
        }
    }

    // Challenges we denied with carry the auth layer's challenge header
    if ctx.tag == LogTag::TcpDenied
        && matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED
        )
    {
        if let Some(challenge) = ctx.request.auth_challenge.as_deref() {
            let name = if status == StatusCode::UNAUTHORIZED {
                header::WWW_AUTHENTICATE
            } else {
                header::PROXY_AUTHENTICATE
            };
            if !reply.headers.contains_key(&name) {
                reply.insert_header(name, challenge).unwrap();
            }
        }
    }

    // Cache-Status: <host>;<hit|fwd>;detail=<first classification>
    let mut cache_status = ctx.config.hostname.clone();
    cache_status.push_str(if is_hit { ";hit" } else { ";fwd" });
    if let Some(detail) = ctx.first_lookup {
        cache_status.push_str(";detail=");
        cache_status.push_str(detail);
    }
    reply
        .insert_header("Cache-Status", cache_status)
        .unwrap();

    let multipart_range = ctx
        .request
        .header
        .headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(','));
    let body_size = reply_body_size(ctx.request.method(), reply);
    let may_send_chunked = !multipart_range && ctx.request.http11();

    // Decide whether to keep the connection; first match closes
    if !ctx.config.error_pconns && status.as_u16() >= 400 && !ctx.flags.must_keepalive {
        debug!("error reply, don't keep-alive");
        ctx.flags.proxy_keepalive = false;
    } else if !ctx.config.client_pconns && !ctx.flags.must_keepalive {
        ctx.flags.proxy_keepalive = false;
    } else if ctx.flags.proxy_keepalive && ctx.config.shutting_down {
        debug!("shutting down, don't keep-alive");
        ctx.flags.proxy_keepalive = false;
    } else if ctx.flags.connection_auth && !persistent {
        debug!("connection-oriented auth but upstream non-persistent");
        ctx.flags.proxy_keepalive = false;
    } else if body_size.is_none() && !may_send_chunked {
        debug!("unknown body size and cannot chunk, close-delimited reply");
        ctx.flags.proxy_keepalive = false;
    } else if ctx.config.fd_pressure && !ctx.flags.must_keepalive {
        ctx.flags.proxy_keepalive = false;
    } else if ctx.flags.ssl_bumped && !persistent {
        ctx.flags.proxy_keepalive = false;
    } else if ctx.flags.pinned && !persistent {
        ctx.flags.proxy_keepalive = false;
    } else if ctx.config.listening_port_closed {
        ctx.flags.proxy_keepalive = false;
    }

    // Unknown length on a chunk-capable client: chunked transfer
    if may_send_chunked && body_size.is_none() {
        ctx.flags.chunked_reply = true;
        reply
            .insert_header(header::TRANSFER_ENCODING, "chunked")
            .unwrap();
    }

    // Append our Via token, once
    let via_token = format!("1.1 {} ({})", ctx.config.hostname, SERVER_NAME);
    let already_via = reply
        .headers
        .get_all(header::VIA)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(&via_token));
    if !already_via {
        reply.append_header(header::VIA, via_token).unwrap();
    }

    // Signal keep-alive or close explicitly
    let connection = if ctx.flags.proxy_keepalive {
        "keep-alive"
    } else {
        "close"
    };
    if reply.headers.contains_key(header::CONNECTION) {
        reply.append_header(header::CONNECTION, connection).unwrap();
    } else {
        reply.insert_header(header::CONNECTION, connection).unwrap();
    }

    // Surrogate-Control requires Surrogate-Capability from the client
    if reply.headers.contains_key("surrogate-control") && !ctx.request.surrogate_capable {
        reply.remove_header("surrogate-control");
    }
}
