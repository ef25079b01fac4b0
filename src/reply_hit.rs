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

//! Hit classification: the work between "an entry was identified" and the
//! first byte leaving for the client.

use crate::conditional::{self, Disposition};
use crate::errors::ErrorKind;
use crate::freshness::{Freshness, FreshnessEvaluator};
use crate::storage::{EntryMeta, MemStatus, StoreStatus};
use crate::vary::VaryResult;
use crate::{LogTag, ReplyState, COPY_BUF_SZ};

use http::{header, StatusCode};
use log::{debug, warn};
use pingora_error::Result;
use std::time::SystemTime;

impl ReplyState {
    /// Process a possible cache hit.
    ///
    /// Called once the identified entry delivers its first store buffer.
    /// Hands off to streaming, revalidation, conditional synthesis, or the
    /// miss path.
    pub(crate) async fn cache_hit(&mut self) -> Result<()> {
        let Some(handle) = self.current.as_mut() else {
            debug!("hit entry went away, treat as miss");
            self.update_tag(LogTag::TcpMiss);
            self.phase_miss();
            return Ok(());
        };

        let buf = handle.copy(0, COPY_BUF_SZ).await?;

        if self.detached() {
            debug!("hit object being deleted, ignore the hit");
            return Ok(());
        }

        if buf.error {
            // swap-in failure, recover by refetching
            debug!("swap-in failure, treat as miss");
            self.update_tag(LogTag::TcpSwapfailMiss);
            self.current = None;
            self.phase_miss();
            return Ok(());
        }

        let entry = self.current.as_ref().unwrap().entry().clone();

        // The previously identified hit may have become unshareable: common
        // for collapsed slaves, possible for any hit since we run
        // asynchronously.
        if !entry.may_start_hitting() {
            debug!("unshareable entry, MISS");
            self.update_tag(LogTag::TcpMiss);
            self.current = None;
            self.phase_miss();
            return Ok(());
        }

        let Some(stored) = entry.freshest_reply() else {
            // the store could not produce headers for the object
            debug!("store buffer has no reply, MISS");
            self.update_tag(LogTag::TcpMiss);
            self.current = None;
            self.phase_miss();
            return Ok(());
        };

        match self.vary.evaluate(&stored, &self.request.header) {
            VaryResult::None | VaryResult::Match => {}
            VaryResult::Other => {
                // not the entity for this request; the fingerprint was
                // updated (exactly once), requery the store
                debug!("vary mismatch, requery");
                self.current = None;
                self.set_phase(super::ReplyPhase::Start);
                return Ok(());
            }
            VaryResult::Cancel => {
                warn!("vary object loop, MISS");
                self.update_tag(LogTag::TcpMiss);
                self.current = None;
                self.phase_miss();
                return Ok(());
            }
        }

        if entry.flags().negative && !self.flags.no_cache_hack {
            debug!("negative hit");
            self.update_tag(LogTag::TcpNegativeHit);
            self.first_buffer = Some(buf);
            self.phase_streaming();
            return Ok(());
        }

        // freshness (offline mode serves whatever we have)
        if !self.flags.internal && !self.env.config.offline_mode {
            let meta = entry.meta();
            let evaluator = FreshnessEvaluator::new(&self.env.config.refresh_rules);
            let uri = self.request.header.uri.to_string();
            match evaluator.check(&meta, &stored, &uri, SystemTime::now()) {
                Freshness::Fresh => {}
                verdict => {
                    // a stale copy must only be validated through parents;
                    // two siblings with stale copies would loop otherwise
                    self.flags.need_validation = true;
                    return self.classify_stale(verdict, meta);
                }
            }
        }

        if self.request.conditional() {
            debug!("conditional hit");
            if self.process_conditional(&stored, entry.meta()).await? {
                return Ok(());
            }
        }

        // plain old hit
        if entry.store_status() != StoreStatus::Ok {
            // still-filling shared entry: served, but not a clean hit
            debug!("hit on a pending entry");
        } else if entry.mem_status() == MemStatus::InMemory {
            self.update_tag(LogTag::TcpMemHit);
        } else if self.env.config.offline_mode {
            self.update_tag(LogTag::TcpOfflineHit);
        }
        self.first_buffer = Some(buf);
        self.phase_streaming();
        Ok(())
    }

    /// A hit that failed the freshness check: decide between revalidation
    /// and the miss fallbacks.
    fn classify_stale(&mut self, verdict: Freshness, meta: EntryMeta) -> Result<()> {
        debug_assert!(verdict != Freshness::Fresh);
        if verdict == Freshness::Unknown || meta.last_modified.is_none() {
            // cannot calculate the entry modification time, do MISS
            debug!("validate hit? no, unknown modification time");
            self.update_tag(LogTag::TcpMiss);
            self.current = None;
            self.phase_miss();
        } else if self.flags.no_cache {
            // no refresh pattern overrode it, honor the client's no-cache
            debug!("validate hit? no, client sent no-cache");
            self.update_tag(LogTag::TcpClientRefreshMiss);
            self.current = None;
            self.phase_miss();
        } else if self.request.http_scheme() {
            debug!("validate hit? yes");
            self.set_phase(super::ReplyPhase::Expired);
        } else {
            // we only know how to revalidate http(s)
            debug!("validate hit? no, non-http scheme");
            self.update_tag(LogTag::TcpMiss);
            self.current = None;
            self.phase_miss();
        }
        Ok(())
    }

    /// Evaluate the client's preconditions against the stored reply.
    ///
    /// Returns true when the request was fully answered here (304, 412 or
    /// converted to a miss); false falls through to the unconditional hit.
    pub(crate) async fn process_conditional(
        &mut self,
        stored: &pingora_http::ResponseHeader,
        meta: EntryMeta,
    ) -> Result<bool> {
        if self.request.header.headers.contains_key(header::IF_NONE_MATCH) {
            // If-None-Match recipients must ignore If-Modified-Since
            self.flags.ims = false;
        }
        match conditional::evaluate(&self.request.header, stored, meta.last_modified) {
            Disposition::Hit => Ok(false),
            Disposition::Miss => {
                debug!("conditional miss, stored reply is not a 200");
                self.update_tag(LogTag::TcpMiss);
                self.current = None;
                self.phase_miss();
                Ok(true)
            }
            Disposition::PreconditionFailed => {
                self.send_precondition_failed().await?;
                Ok(true)
            }
            Disposition::NotModified => {
                self.send_not_modified().await?;
                Ok(true)
            }
        }
    }

    /// Send 304 to the client, preserving the entry's timestamp so the 304
    /// carries a meaningful Age.
    pub(crate) async fn send_not_modified(&mut self) -> Result<()> {
        let entry = self.current.as_ref().unwrap().entry().clone();
        let meta = entry.meta();
        let mut reply = entry
            .freshest_reply()
            .map(|r| r.as_ref().clone())
            .expect("conditional evaluation required a stored reply");
        conditional::make_304(&mut reply);

        // 304 generated for If-None-Match logs differently from one for IMS
        if self.request.header.headers.contains_key(header::IF_NONE_MATCH) {
            self.update_tag(LogTag::TcpInmHit);
        } else {
            self.update_tag(LogTag::TcpImsHit);
        }
        self.install_synthetic_reply(reply, bytes::Bytes::new(), meta)
            .await
    }

    /// Send 412 Precondition Failed
    pub(crate) async fn send_precondition_failed(&mut self) -> Result<()> {
        self.update_tag(LogTag::TcpHit);
        self.set_reply_to_error(ErrorKind::PreconditionFailed, StatusCode::PRECONDITION_FAILED)
            .await
    }
}
