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

//! Revalidation of stale entries
//!
//! A stale hit keeps its original entry on the side while a conditional
//! fetch runs against a second one. Depending on what the origin says, the
//! client gets the refreshed old entry, the fresh reply, or (on failure)
//! whichever the validation policy prefers.

use crate::collapse::{CollapsedForwarding, CollapsedRole};
use crate::conditional;
use crate::handle::StoreHandle;
use crate::storage::StoreBuffer;
use crate::{LogTag, ReplyPhase, ReplyState, COPY_BUF_SZ};

use http::{header, HeaderValue, StatusCode};
use log::{debug, warn};
use pingora_error::{Error, ErrorType, Result};
use pingora_http::RequestHeader;
use std::time::SystemTime;

/// The pre-revalidation snapshot: everything needed to resume serving the
/// old entry if the origin disappoints.
pub(crate) struct SavedContext {
    pub old_handle: StoreHandle,
    pub old_lastmod: Option<SystemTime>,
    pub old_etag: Option<HeaderValue>,
    pub old_reqofs: u64,
    pub old_reqsize: u64,
}

impl ReplyState {
    /// There is an expired entry in the store: run a conditional fetch to
    /// the origin and arbitrate the outcome.
    pub(crate) async fn process_expired(&mut self) -> Result<()> {
        // instead of a 504 we may want to return the stale entry if it
        // matches client requirements; for now only-if-cached always 504s
        if self.flags.only_if_cached {
            return self.process_only_if_cached_miss().await;
        }

        debug!("revalidating {}", self.request.header.uri);
        self.update_tag(LogTag::TcpRefresh);
        self.flags.refresh = true;

        self.save_state()?;
        let saved = self.saved.as_ref().unwrap();
        let lastmod = saved.old_lastmod;
        let old_etag = saved.old_etag.clone();

        let config = self.env.config.clone();
        let cf = CollapsedForwarding::new(&config);
        let collapsing_allowed =
            cf.allowed(self.env.store.as_ref(), self.vary.fingerprint());

        // join an in-flight revalidation of the same key when we may
        let mut joined = None;
        if collapsing_allowed {
            if let Some(candidate) = self.env.store.lookup_public(&self.cache_key()).await? {
                if candidate.hitting_requires_collapsing() && cf.may_join(&candidate) {
                    joined = Some(candidate);
                }
            }
        }

        let entry = match joined {
            Some(entry) => {
                debug!("collapsed on existing revalidation entry");
                self.collapsed_role = CollapsedRole::Slave;
                self.current = Some(StoreHandle::new(
                    self.env.store.as_ref(),
                    entry,
                    "collapsed revalidation",
                )?);
                self.current.as_ref().unwrap().entry().clone()
            }
            None => {
                let flags = self.flags.clone();
                let entry = self.create_entry(&flags, "revalidation").await?;
                if collapsing_allowed
                    && cf.offer(self.env.store.as_ref(), &entry, &flags, self.request.method())
                {
                    debug!("other revalidations may collapse on this entry");
                    self.collapsed_role = CollapsedRole::Initiator;
                } else {
                    self.collapsed_role = CollapsedRole::None;
                }
                entry
            }
        };

        if self.collapsed_role != CollapsedRole::Slave {
            let upstream_req = revalidation_request(&self.request.header, lastmod, old_etag)?;
            let fill = self.env.store.fill_handler(&entry)?;
            self.env
                .forwarder
                .start(upstream_req, entry, fill)
                .await?;
        }

        self.reqofs = 0;
        self.set_phase(ReplyPhase::AwaitingIms);
        Ok(())
    }

    /// The workhorse: called with data back from the origin following our
    /// conditional request for a stale entry.
    pub(crate) async fn handle_ims(&mut self) -> Result<()> {
        // wait until the revalidation entry can be judged: its reply header
        // is installed, or it dies
        let buf = loop {
            let handle = self
                .current
                .as_mut()
                .ok_or_else(|| Error::explain(ErrorType::InternalError, "no revalidation entry"))?;
            let buf = handle.copy(0, COPY_BUF_SZ).await?;
            if self.detached() {
                return Ok(());
            }
            let entry = self.current.as_ref().unwrap().entry();

            if self.collapsed_role == CollapsedRole::Slave && !entry.may_start_hitting() {
                // the shared entry went private under us
                debug!("collapsed slave lost the shared entry, MISS");
                // restore context to meet the miss path's expectations
                self.restore_state()?;
                self.update_tag(LogTag::TcpMiss);
                self.phase_miss();
                return Ok(());
            }

            if buf.error || entry.flags().aborted {
                debug!("request to origin aborted, sending old entry");
                self.update_tag(LogTag::TcpRefreshFailOld);
                return self.send_client_old_entry();
            }

            if entry.freshest_reply().is_some() {
                break buf;
            }
            if buf.eof {
                // finished without ever producing headers
                warn!("revalidation entry completed without a reply");
                self.update_tag(LogTag::TcpRefreshFailOld);
                return self.send_client_old_entry();
            }
        };

        let new_reply = self.current_reply()?;
        let status = new_reply.status;
        let (old_lastmod, old_entry, old_reply) = {
            let saved = self.saved.as_ref().ok_or_else(|| {
                Error::explain(ErrorType::InternalError, "no saved revalidation state")
            })?;
            (
                saved.old_lastmod,
                saved.old_handle.entry().clone(),
                saved.old_handle.entry().freshest_reply(),
            )
        };

        // Note on borrowed (collapsed) entries that are still being
        // written: we judge the parsed reply header as soon as it exists.
        // The stream pump handles the incomplete body, and an abort flips
        // the entry flag we check at every chunk.

        if status == StatusCode::NOT_MODIFIED {
            self.update_tag(LogTag::TcpRefreshUnmodified);
            let new_entry = self.current.as_ref().unwrap().entry().clone();
            self.env
                .store
                .update_on_not_modified(&old_entry, &new_entry)
                .await?;

            // a client that sent IMS for an unmodified object gets the 304
            if self.flags.ims {
                if let Some(client_ims) = self.request.if_modified_since() {
                    if !conditional::modified_since(old_lastmod, client_ims) {
                        debug!("origin replied 304, forwarding 304 to client");
                        return self.send_client_upstream_response(buf);
                    }
                }
            }
            debug!("origin replied 304, sending revalidated entry");
            return self.send_client_old_entry();
        }

        if status.as_u16() < 500 {
            // "when more than one suitable response is stored, a cache MUST
            // use the most recent one" - an older Date loses to our copy
            if reply_older_than(&new_reply, old_reply.as_deref()) {
                warn!(
                    "origin replied {} with an older Date header, sending old entry",
                    status
                );
                self.state_flags.ignored_fresh_reply = true;
                return self.send_client_old_entry();
            }
            debug!("origin replied {}, forwarding to client", status);
            self.update_tag(LogTag::TcpRefreshModified);
            return self.send_client_upstream_response(buf);
        }

        // origin replied with an error
        if self.flags.fail_on_validation_err {
            debug!("origin replied {}, forwarding per validation policy", status);
            self.update_tag(LogTag::TcpRefreshFailErr);
            return self.send_client_upstream_response(buf);
        }
        debug!("origin replied {}, sending old entry", status);
        self.update_tag(LogTag::TcpRefreshFailOld);
        self.send_client_old_entry()
    }

    /// Park the current (stale) entry and its offsets while the
    /// revalidation runs.
    pub(crate) fn save_state(&mut self) -> Result<()> {
        debug_assert!(self.saved.is_none(), "revalidation already in progress");
        let handle = self
            .current
            .take()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "nothing to save"))?;
        let meta = handle.entry().meta();
        let old_etag = handle
            .entry()
            .freshest_reply()
            .and_then(|r| conditional::strong_etag(&r).cloned());
        self.saved = Some(SavedContext {
            old_handle: handle,
            old_lastmod: meta.last_modified,
            old_etag,
            old_reqofs: self.reqofs,
            old_reqsize: self.reqsize,
        });
        self.reqofs = 0;
        self.reqsize = 0;
        Ok(())
    }

    /// Resume serving from the parked entry.
    pub(crate) fn restore_state(&mut self) -> Result<()> {
        let saved = self
            .saved
            .take()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "nothing to restore"))?;
        // the revalidation handle (if any) drops here
        self.current = Some(saved.old_handle);
        self.reqofs = saved.old_reqofs;
        self.reqsize = saved.old_reqsize;
        Ok(())
    }

    /// Serve the reply the origin just produced; the old entry is released.
    fn send_client_upstream_response(&mut self, buf: StoreBuffer) -> Result<()> {
        self.saved = None;
        self.reqofs = 0;
        self.reqsize = 0;
        // the data to send is the data we just received
        self.first_buffer = Some(buf);
        self.phase_streaming();
        Ok(())
    }

    /// Serve the pre-revalidation entry; the fresh one is released.
    fn send_client_old_entry(&mut self) -> Result<()> {
        self.restore_state()?;
        self.collapsed_role = CollapsedRole::None;
        // nothing was sent yet, stream from the top
        self.reqofs = 0;
        self.reqsize = 0;
        self.first_buffer = None;
        self.phase_streaming();
        Ok(())
    }
}

/// Build the conditional request sent upstream for a stale entry.
///
/// Precondition and range headers from the client are dropped; we want the
/// 200, not the client's 304. Our own validators come from the stale copy.
fn revalidation_request(
    req: &RequestHeader,
    lastmod: Option<SystemTime>,
    old_etag: Option<HeaderValue>,
) -> Result<RequestHeader> {
    let mut upstream = req.clone();
    upstream.remove_header(&header::IF_MATCH);
    upstream.remove_header(&header::IF_NONE_MATCH);
    upstream.remove_header(&header::IF_MODIFIED_SINCE);
    upstream.remove_header(&header::IF_UNMODIFIED_SINCE);
    upstream.remove_header(&header::IF_RANGE);
    upstream.remove_header(&header::RANGE);

    if let Some(lastmod) = lastmod {
        upstream.insert_header(header::IF_MODIFIED_SINCE, httpdate::fmt_http_date(lastmod))?;
    }
    // send both validators, but never override a client-supplied INM with a
    // weak tag of ours
    if !req.headers.contains_key(header::IF_NONE_MATCH) {
        if let Some(etag) = old_etag {
            upstream.insert_header(header::IF_NONE_MATCH, etag)?;
        }
    }
    Ok(upstream)
}

/// Whether `new` carries a Date header strictly older than `old`'s.
fn reply_older_than(
    new: &pingora_http::ResponseHeader,
    old: Option<&pingora_http::ResponseHeader>,
) -> bool {
    fn date_of(reply: &pingora_http::ResponseHeader) -> Option<SystemTime> {
        let v = reply.headers.get(header::DATE)?;
        httpdate::parse_http_date(v.to_str().ok()?).ok()
    }
    let Some(old) = old else { return false };
    match (date_of(new), date_of(old)) {
        (Some(new_date), Some(old_date)) => new_date < old_date,
        _ => false,
    }
}
