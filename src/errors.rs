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

//! Error reply synthesis
//!
//! Every user-visible failure becomes a well-formed HTTP message built here
//! and delivered through the same streaming path as a success. Page
//! rendering proper is external ([ErrorFactory]); this module owns the kinds
//! and a plain default factory.

use bytes::Bytes;
use http::{header, StatusCode};
use pingora_http::{RequestHeader, ResponseHeader};

/// Server token advertised in synthesized replies and `Via`
pub const SERVER_NAME: &str = concat!("cachefront/", env!("CARGO_PKG_VERSION"));

/// The kinds of error pages the pipeline requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// `only-if-cached` without a servable hit, 504
    OnlyIfCachedMiss,
    /// Denied by access control (or purge disabled, or a forwarding loop)
    AccessDenied,
    /// The reply body exceeds the configured maximum
    TooBig,
    /// `If-Match` failed
    PreconditionFailed,
    /// The upstream reply could not be used
    InvalidResponse,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnlyIfCachedMiss => "ERR_ONLY_IF_CACHED_MISS",
            Self::AccessDenied => "ERR_ACCESS_DENIED",
            Self::TooBig => "ERR_TOO_BIG",
            Self::PreconditionFailed => "ERR_PRECONDITION_FAILED",
            Self::InvalidResponse => "ERR_INVALID_RESP",
        }
    }
}

/// A rendered error page: the reply header and its body.
pub struct ErrorBody {
    pub reply: ResponseHeader,
    pub body: Bytes,
}

/// Renders error pages. The default implementation produces a minimal
/// text/html page; deployments substitute their own templates.
pub trait ErrorFactory: Send + Sync {
    fn build(&self, kind: ErrorKind, status: StatusCode, request: &RequestHeader) -> ErrorBody;
}

/// The built-in page renderer.
pub struct DefaultErrorFactory;

impl ErrorFactory for DefaultErrorFactory {
    fn build(&self, kind: ErrorKind, status: StatusCode, request: &RequestHeader) -> ErrorBody {
        let body = format!(
            "<html><head><title>{status}</title></head><body>\
             <h1>{reason}</h1><p>{kind} while trying to retrieve {uri}</p>\
             </body></html>\n",
            status = status.as_u16(),
            reason = status.canonical_reason().unwrap_or("Error"),
            kind = kind.as_str(),
            uri = request.uri,
        );
        let body = Bytes::from(body);
        let mut reply = ResponseHeader::build(status, Some(4)).unwrap();
        reply.insert_header(header::SERVER, SERVER_NAME).unwrap();
        reply
            .insert_header(header::CONTENT_TYPE, "text/html")
            .unwrap();
        reply
            .insert_header(header::CONTENT_LENGTH, body.len())
            .unwrap();
        reply
            .insert_header(header::CACHE_CONTROL, "private, no-store")
            .unwrap();
        ErrorBody { reply, body }
    }
}
