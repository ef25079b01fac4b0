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

//! The miss path: fetch from upstream, or answer locally for redirects,
//! traces, loops and only-if-cached requests.

use crate::collapse::CollapsedForwarding;
use crate::errors::{ErrorKind, SERVER_NAME};
use crate::storage::EntryMeta;
use crate::{is_purge, known_method, LogTag, ReplyPhase, ReplyState};

use bytes::Bytes;
use http::{header, Method, StatusCode};
use log::{debug, warn};
use pingora_error::Result;
use pingora_http::ResponseHeader;

impl ReplyState {
    /// Prepare to fetch the object: a cache miss of some kind.
    pub(crate) async fn process_miss(&mut self) -> Result<()> {
        let method = self.request.method().clone();
        debug!("miss for {} {}", method, self.request.header.uri);

        // a left-over entry from a failed hit or revalidation
        if let Some(handle) = self.current.take() {
            if handle.entry().flags().special {
                warn!("miss on a special object {}", self.request.header.uri);
            }
        }

        if is_purge(&method) {
            self.set_phase(ReplyPhase::Purge);
            return Ok(());
        }

        // unknown extension methods invalidate every cached variant first
        if !known_method(&method) {
            self.purge_all_cached().await;
        }

        if self.flags.only_if_cached {
            return self.process_only_if_cached_miss().await;
        }

        if self.flags.loop_detected {
            warn!("forwarding loop detected for {}", self.request.header.uri);
            return self
                .set_reply_to_error(ErrorKind::AccessDenied, StatusCode::FORBIDDEN)
                .await;
        }

        let flags = self.flags.clone();
        let entry = self.create_entry(&flags, "reply miss").await?;

        // make the entry collapsible as early as possible so concurrent
        // requests can share this fetch
        if self.env.config.collapsed_forwarding {
            let cf = CollapsedForwarding::new(&self.env.config);
            if cf.offer(self.env.store.as_ref(), &entry, &flags, &method) {
                debug!("other requests may collapse on this miss");
            }
        }

        if let Some(redirect) = self.request.redirect.clone() {
            // a queued redirect completes immediately, nothing is fetched
            self.update_tag(LogTag::TcpRedirect);
            let mut reply = ResponseHeader::build(redirect.status, Some(3))?;
            reply.insert_header(header::SERVER, SERVER_NAME)?;
            reply.insert_header(header::LOCATION, redirect.location)?;
            reply.insert_header(header::CONTENT_LENGTH, 0)?;
            let mut fill = self.env.store.fill_handler(&entry)?;
            fill.set_reply(reply, EntryMeta::default())?;
            fill.finish().await?;
            self.phase_streaming();
            return Ok(());
        }

        // start forwarding to get the object from the network
        let fill = self.env.store.fill_handler(&entry)?;
        let upstream_req = self.request.header.clone();
        self.env
            .forwarder
            .start(upstream_req, entry, fill)
            .await?;
        self.phase_streaming();
        Ok(())
    }

    /// `only-if-cached` without a servable hit: 504 without any upstream
    /// attempt, as RFC 9111 suggests.
    pub(crate) async fn process_only_if_cached_miss(&mut self) -> Result<()> {
        debug!(
            "only-if-cached miss for {} {}",
            self.request.method(),
            self.request.header.uri
        );
        self.current = None;
        self.set_reply_to_error(ErrorKind::OnlyIfCachedMiss, StatusCode::GATEWAY_TIMEOUT)
            .await
    }

    /// Answer TRACE with Max-Forwards: 0 locally: echo the request.
    pub(crate) async fn trace_reply(&mut self) -> Result<()> {
        let req = &self.request.header;
        let mut echo = Vec::with_capacity(256);
        echo.extend_from_slice(req.method.as_str().as_bytes());
        echo.push(b' ');
        echo.extend_from_slice(req.uri.to_string().as_bytes());
        echo.extend_from_slice(b" HTTP/1.1\r\n");
        req.header_to_h1_wire(&mut echo);
        echo.extend_from_slice(b"\r\n");
        let body = Bytes::from(echo);

        let mut reply = ResponseHeader::build(StatusCode::OK, Some(3))?;
        reply.insert_header(header::SERVER, SERVER_NAME)?;
        reply.insert_header(header::CONTENT_TYPE, "message/http")?;
        reply.insert_header(header::CONTENT_LENGTH, body.len())?;
        self.install_synthetic_reply(reply, body, EntryMeta::default())
            .await
    }

    /// Drop the GET and HEAD slots of this URL.
    pub(crate) async fn purge_all_cached(&mut self) {
        let base = self.cache_key().without_variance();
        for method in [Method::GET, Method::HEAD] {
            let key = base.with_method(&method);
            if self.env.store.evict_if_found(&key).await {
                debug!("invalidated {} variant of {}", method, key.uri());
            }
            if let Some(peers) = self.env.peers.as_deref() {
                peers.htcp_clear(key.uri(), &method);
            }
        }
    }
}
