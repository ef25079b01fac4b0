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

//! The bridge from store buffers to the downstream stream pipeline
//!
//! Headers are built and gated on the first delivery; after that raw body
//! flows through with offset bookkeeping. Both sides may abort: the store
//! through the entry's aborted flag, the client through a write error or
//! detach.

use crate::access::{check_reply_access, AclContext, GateOutcome};
use crate::collapse::CollapsedRole;
use crate::headers::{build_reply_header, reply_body_size, ReplyHeaderCtx};
use crate::storage::{EntryRef, StoreStatus};
use crate::{LogTag, ReplyPhase, ReplyState, COPY_BUF_SZ};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Version};
use log::{debug, warn};
use pingora_error::{Error, ErrorType, Result};
use pingora_http::ResponseHeader;
use std::time::SystemTime;

/// Status of the object from the downstream node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// More is expected
    None,
    Complete,
    /// The transfer ended, but with fewer bytes than the reply promised
    UnplannedComplete,
    /// The socket should be closed without a clean end of message
    Failed,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Complete => "complete",
            Self::UnplannedComplete => "unplanned-complete",
            Self::Failed => "failed",
        }
    }
}

/// A stage in the downstream delivery pipeline.
///
/// Write errors mean the client side is gone; the reply state gives up with
/// [StreamStatus::Failed] and the caller closes the socket.
#[async_trait]
pub trait StreamNode: Send {
    async fn write_headers(&mut self, reply: Box<ResponseHeader>) -> Result<()>;

    /// `end` is set on exactly the final call
    async fn write_body(&mut self, data: Bytes, end: bool) -> Result<()>;
}

/// The h1 wire size of a built reply header, status line included.
pub(crate) fn wire_header_size(reply: &ResponseHeader) -> u32 {
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    reply.header_to_h1_wire(&mut buf);
    let reason_len = reply
        .status
        .canonical_reason()
        .map_or(0, |r| r.len() + 1);
    // "HTTP/1.1" SP status [SP reason] CRLF ... headers ... CRLF
    (8 + 1 + 3 + reason_len + 2 + buf.len() + 2) as u32
}

fn content_length_of(reply: &ResponseHeader) -> Option<u64> {
    reply
        .headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

impl ReplyState {
    /// Body octets already consumed from the store
    fn body_offset(&self) -> u64 {
        if self.state_flags.headers_sent {
            self.reqofs - u64::from(self.headers_sz)
        } else {
            0
        }
    }

    /// The single authoritative "received enough" predicate, shared by the
    /// pump loop and [Self::reply_status].
    fn transfer_done(&self, entry: &EntryRef, body_consumed: u64, delivered: u64) -> bool {
        // Range and HEAD short-circuits set done_copying instead of
        // reasoning about lengths
        if self.state_flags.done_copying {
            return true;
        }
        match entry.store_status() {
            StoreStatus::Ok => entry
                .body_len()
                .is_some_and(|len| body_consumed >= len),
            StoreStatus::Pending => {
                if self.headers_sz == 0 {
                    // haven't found end of headers yet
                    return false;
                }
                let expected = entry.base_reply().as_deref().and_then(content_length_of);
                expected.is_some_and(|cl| delivered >= cl + u64::from(self.headers_sz))
            }
        }
    }

    /// Whether the object has been fully received from the store
    pub fn check_transfer_done(&self) -> bool {
        let Some(handle) = self.current.as_ref() else {
            return false;
        };
        let entry = handle.entry().clone();
        self.transfer_done(&entry, self.body_offset(), self.reqsize)
    }

    /// Status of this reply for the downstream sink.
    pub fn reply_status(&self) -> StreamStatus {
        let Some(handle) = self.current.as_ref() else {
            debug!("reply status: no store entry");
            return StreamStatus::Failed;
        };
        let entry = handle.entry();
        if entry.flags().aborted {
            debug!("reply status: aborted store entry");
            return StreamStatus::Failed;
        }
        let done = self.check_transfer_done();
        if done || self.state_flags.complete {
            if entry.flags().bad_length {
                debug!("reply status: truncated response body");
                return StreamStatus::UnplannedComplete;
            }
            if !done {
                debug!("reply status: closing, not done but read 0 bytes");
                return StreamStatus::Failed;
            }
            if let Some(reply) = self.reply.as_ref() {
                if let Some(expected) =
                    reply_body_size(self.request.method(), reply).or(content_length_of(reply))
                {
                    if self.reqsize < expected + u64::from(self.headers_sz) {
                        debug!("reply status: client didn't get all it expected");
                        return StreamStatus::UnplannedComplete;
                    }
                }
            }
            return StreamStatus::Complete;
        }
        StreamStatus::None
    }

    /// Pump store buffers into the downstream node until the reply is over.
    pub(crate) async fn stream(&mut self, node: &mut dyn StreamNode) -> Result<()> {
        if !self.state_flags.storelogic_complete {
            // classification is final once bytes start moving
            self.state_flags.storelogic_complete = true;
        }
        loop {
            if self.detached() {
                debug!("not sending more data after detach");
                self.set_phase(ReplyPhase::Done(StreamStatus::Failed));
                return Ok(());
            }

            let buf = match self.first_buffer.take() {
                Some(buf) => buf,
                None => {
                    let offset = self.body_offset();
                    let handle = self.current.as_mut().ok_or_else(|| {
                        Error::explain(ErrorType::InternalError, "streaming without an entry")
                    })?;
                    handle.copy(offset, COPY_BUF_SZ).await?
                }
            };

            let entry = self.current.as_ref().unwrap().entry().clone();

            // A shared entry can go private at any suspension point; slaves
            // must never serve bytes past that.
            if (self.collapsed_role == CollapsedRole::Slave
                || entry.hitting_requires_collapsing())
                && !entry.may_start_hitting()
            {
                if self.state_flags.headers_sent {
                    warn!("shared entry lost while streaming");
                    return self.send_stream_error();
                }
                debug!("shared entry lost before headers, MISS");
                self.update_tag(LogTag::TcpMiss);
                self.current = None;
                self.collapsed_role = CollapsedRole::None;
                self.phase_miss();
                return Ok(());
            }

            if buf.error || entry.flags().aborted {
                return self.send_stream_error();
            }

            if !self.state_flags.headers_sent {
                let Some(stored) = entry.freshest_reply() else {
                    if buf.eof {
                        warn!("entry completed without a reply");
                        return self.send_stream_error();
                    }
                    // headers not there yet, keep waiting
                    continue;
                };
                if !self.emit_headers(node, &stored).await? {
                    // rerouted to an error reply (or failed downstream)
                    return Ok(());
                }
            }

            // push the body slice through
            let len = buf.data.len() as u64;
            let body_after = self.body_offset() + len;
            let delivered_after = self.reqofs + len;
            let end = self.state_flags.done_copying
                || buf.eof
                || self.transfer_done(&entry, body_after, delivered_after);

            let data = if self.state_flags.done_copying {
                Bytes::new()
            } else {
                buf.data
            };
            if !data.is_empty() || end {
                if let Err(e) = node.write_body(data, end).await {
                    debug!("downstream write failed: {e}");
                    self.set_phase(ReplyPhase::Done(StreamStatus::Failed));
                    return Ok(());
                }
            }
            if !self.state_flags.done_copying {
                self.reqofs += len;
                self.reqsize = self.reqofs;
            }

            if end {
                self.state_flags.complete = true;
                let status = self.reply_status();
                self.set_phase(ReplyPhase::Done(status));
                return Ok(());
            }
        }
    }

    /// Clone, rewrite and gate the reply headers, then hand them downstream.
    ///
    /// Returns false when the reply was rerouted (access denial) or the
    /// downstream is gone.
    async fn emit_headers(
        &mut self,
        node: &mut dyn StreamNode,
        stored: &ResponseHeader,
    ) -> Result<bool> {
        // building twice is a programming error
        assert!(!self.state_flags.headers_sent, "headers already sent");

        let entry = self.current.as_ref().unwrap().entry().clone();
        let meta = entry.meta();
        let mut reply = stored.clone();
        // we speak for ourselves, not for the origin's protocol version
        reply.set_version(Version::HTTP_11);

        let first_lookup = self.first_store_lookup();
        let mut ctx = ReplyHeaderCtx {
            config: &self.env.config,
            request: &self.request,
            flags: &mut self.flags,
            tag: self.tag,
            entry_special: entry.flags().special,
            entry_timestamp: Some(meta.timestamp),
            entry_expires: meta.expires,
            first_lookup,
            collapsed_slave: self.collapsed_role == CollapsedRole::Slave,
            now: SystemTime::now(),
        };
        build_reply_header(&mut ctx, &mut reply);

        let gate = check_reply_access(
            &self.env.config,
            self.env.acl.as_deref(),
            &AclContext {
                request: &self.request.header,
                reply: &reply,
                tag: self.tag,
            },
        )
        .await;
        match gate {
            GateOutcome::Allow => {}
            GateOutcome::TooBig => {
                debug!("expected body too large, denying reply");
                self.update_tag(LogTag::TcpDeniedReply);
                self.reply = None;
                self.set_reply_to_error(
                    crate::errors::ErrorKind::TooBig,
                    http::StatusCode::FORBIDDEN,
                )
                .await?;
                return Ok(false);
            }
            GateOutcome::Deny(page) => {
                debug!("reply denied by access controls");
                self.update_tag(LogTag::TcpDeniedReply);
                self.reply = None;
                self.set_reply_to_error(page, http::StatusCode::FORBIDDEN)
                    .await?;
                return Ok(false);
            }
        }

        self.headers_sz = wire_header_size(&reply);
        self.state_flags.headers_sent = true;
        self.reqofs = u64::from(self.headers_sz);
        self.reqsize = self.reqofs;

        // do not forward a body for HEAD replies
        if *self.request.method() == Method::HEAD {
            self.state_flags.done_copying = true;
        }

        self.reply = Some(reply.clone());
        if let Err(e) = node.write_headers(Box::new(reply)).await {
            debug!("downstream header write failed: {e}");
            self.set_phase(ReplyPhase::Done(StreamStatus::Failed));
            return Ok(false);
        }
        debug!(
            "sent {} header octets for {}",
            self.headers_sz, self.request.header.uri
        );
        Ok(true)
    }

    /// Mark the stream failed so the client socket gets closed.
    fn send_stream_error(&mut self) -> Result<()> {
        debug!("stream error, marking complete and sending no more data");
        self.state_flags.complete = true;
        self.set_phase(ReplyPhase::Done(StreamStatus::Failed));
        Ok(())
    }
}
