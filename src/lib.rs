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

//! The client-reply pipeline for HTTP caching proxies.
//!
//! Given a parsed client request and a shared object store, [ReplyState]
//! decides whether the request is a cache hit, miss, stale copy in need of
//! revalidation, conditional hit, purge or trace, and drives the resulting
//! state machine until a response has been streamed to the client.

#![allow(clippy::new_without_default)]

use async_trait::async_trait;
use http::{Method, StatusCode};
use log::{debug, error};
use pingora_error::{Error, ErrorType, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod access;
pub mod collapse;
pub mod conditional;
pub mod config;
pub mod errors;
pub mod freshness;
pub mod handle;
pub mod headers;
pub mod key;
pub mod memory;
mod reply_hit;
mod reply_miss;
mod reply_purge;
mod reply_revalidate;
mod reply_stream;
pub mod request;
pub mod storage;
pub mod vary;

use access::AclEngine;
use collapse::CollapsedRole;
use config::ConfigSnapshot;
use errors::{ErrorFactory, ErrorKind};
use handle::StoreHandle;
use key::CacheKey;
use reply_revalidate::SavedContext;
use request::Request;
use storage::{EntryMeta, EntryRef, FillHandler, Store, StoreBuffer};
use vary::VaryMatcher;

pub use reply_stream::{StreamNode, StreamStatus};
pub use request::RequestFlags;

/// How many body octets one store copy asks for
pub(crate) const COPY_BUF_SZ: usize = 4096;

/// How a request was (eventually) satisfied. The access log records these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    TcpHit,
    TcpMemHit,
    TcpOfflineHit,
    TcpNegativeHit,
    TcpMiss,
    TcpClientRefreshMiss,
    /// Transient: a revalidation is underway
    TcpRefresh,
    TcpRefreshModified,
    TcpRefreshUnmodified,
    TcpRefreshFailOld,
    TcpRefreshFailErr,
    TcpInmHit,
    TcpImsHit,
    TcpRedirect,
    TcpDenied,
    TcpDeniedReply,
    TcpSwapfailMiss,
}

impl LogTag {
    /// Convert [LogTag] as `str`, the stable access-log vocabulary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TcpHit => "TCP_HIT",
            Self::TcpMemHit => "TCP_MEM_HIT",
            Self::TcpOfflineHit => "TCP_OFFLINE_HIT",
            Self::TcpNegativeHit => "TCP_NEGATIVE_HIT",
            Self::TcpMiss => "TCP_MISS",
            Self::TcpClientRefreshMiss => "TCP_CLIENT_REFRESH_MISS",
            Self::TcpRefresh => "TCP_REFRESH",
            Self::TcpRefreshModified => "TCP_REFRESH_MODIFIED",
            Self::TcpRefreshUnmodified => "TCP_REFRESH_UNMODIFIED",
            Self::TcpRefreshFailOld => "TCP_REFRESH_FAIL_OLD",
            Self::TcpRefreshFailErr => "TCP_REFRESH_FAIL_ERR",
            Self::TcpInmHit => "TCP_INM_HIT",
            Self::TcpImsHit => "TCP_IMS_HIT",
            Self::TcpRedirect => "TCP_REDIRECT",
            Self::TcpDenied => "TCP_DENIED",
            Self::TcpDeniedReply => "TCP_DENIED_REPLY",
            Self::TcpSwapfailMiss => "TCP_SWAPFAIL_MISS",
        }
    }

    /// Whether the client was served from the cache
    pub fn is_hit(&self) -> bool {
        matches!(
            self,
            Self::TcpHit
                | Self::TcpMemHit
                | Self::TcpOfflineHit
                | Self::TcpNegativeHit
                | Self::TcpInmHit
                | Self::TcpImsHit
                | Self::TcpRefreshUnmodified
                | Self::TcpRefreshFailOld
        )
    }
}

/// The phase of a reply through the life of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyPhase {
    /// Nothing classified yet
    Start,
    /// An entry was identified; classify it once its headers arrive
    Hit,
    /// Fetch from upstream (or synthesize) into a fresh entry
    Miss,
    /// A stale copy needs validation; set up the conditional fetch
    Expired,
    /// Pump the revalidation entry until its verdict is known
    AwaitingIms,
    Purge,
    Trace,
    /// Headers and body flow to the downstream node
    Streaming,
    Done(StreamStatus),
}

/// Upstream fetching, consumed as an interface.
///
/// `start` returns once the fetch is underway; the response lands in
/// `entry` through `fill` asynchronously.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn start(
        &self,
        request: RequestHeader,
        entry: EntryRef,
        fill: FillHandler,
    ) -> Result<()>;
}

/// DNS cache invalidation hooks used by purge and reload handling.
/// Best effort only.
pub trait IpCache: Send + Sync {
    fn invalidate(&self, host: &str);
    fn invalidate_negative(&self, host: &str);
}

/// Cache peer notification (HTCP CLR) on purges. Best effort only.
pub trait PeerNotifier: Send + Sync {
    fn htcp_clear(&self, uri: &str, method: &Method);
}

/// The collaborators one reply state works against.
#[derive(Clone)]
pub struct ReplyEnv {
    pub store: Arc<dyn Store>,
    pub forwarder: Arc<dyn Forwarder>,
    pub error_factory: Arc<dyn ErrorFactory>,
    pub acl: Option<Arc<dyn AclEngine>>,
    pub ip_cache: Option<Arc<dyn IpCache>>,
    pub peers: Option<Arc<dyn PeerNotifier>>,
    pub config: Arc<ConfigSnapshot>,
}

#[derive(Debug, Default)]
pub(crate) struct StateFlags {
    /// Classification is over; only the stream pump runs from here
    pub storelogic_complete: bool,
    /// The last byte was handed downstream
    pub complete: bool,
    /// Latch: headers are built and sent exactly once
    pub headers_sent: bool,
    /// HEAD/bodyless short-circuit: nothing further is owed downstream
    pub done_copying: bool,
    /// A usable-but-older fresh reply was discarded in favor of the cache
    pub ignored_fresh_reply: bool,
}

/// Cancellation hook handed to the downstream owner; flipping it makes the
/// state observe the detach at its next suspension point.
#[derive(Clone)]
pub struct DetachHandle(Arc<AtomicBool>);

impl DetachHandle {
    pub fn detach(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// One in-flight client request being answered.
///
/// Owned and driven by a single task; all I/O suspends through `.await`.
pub struct ReplyState {
    pub(crate) env: ReplyEnv,
    pub(crate) request: Arc<Request>,
    /// The state's own mutable copy; the shared request never changes
    pub(crate) flags: RequestFlags,
    phase: ReplyPhase,
    pub(crate) tag: LogTag,
    pub(crate) current: Option<StoreHandle>,
    pub(crate) saved: Option<SavedContext>,
    pub(crate) collapsed_role: CollapsedRole,
    pub(crate) vary: VaryMatcher,
    /// Octets consumed from the store, in delivered-stream coordinates
    pub(crate) reqofs: u64,
    /// Octets handed downstream
    pub(crate) reqsize: u64,
    /// Wire size of the built reply header, once known
    pub(crate) headers_sz: u32,
    pub(crate) reply: Option<ResponseHeader>,
    pub(crate) state_flags: StateFlags,
    pub(crate) purge_status: Option<StatusCode>,
    /// First store lookup classification; later ones are ignored
    first_store_lookup: Option<&'static str>,
    pub(crate) deleting: Arc<AtomicBool>,
    /// Buffer carried from classification into the stream pump
    pub(crate) first_buffer: Option<StoreBuffer>,
}

impl ReplyState {
    pub fn new(env: ReplyEnv, request: Arc<Request>) -> Self {
        let flags = request.flags.clone();
        ReplyState {
            env,
            request,
            flags,
            phase: ReplyPhase::Start,
            tag: LogTag::TcpMiss,
            current: None,
            saved: None,
            collapsed_role: CollapsedRole::None,
            vary: VaryMatcher::new(),
            reqofs: 0,
            reqsize: 0,
            headers_sz: 0,
            reply: None,
            state_flags: StateFlags::default(),
            purge_status: None,
            first_store_lookup: None,
            deleting: Arc::new(AtomicBool::new(false)),
            first_buffer: None,
        }
    }

    /// The access-log tag as currently known
    pub fn tag(&self) -> LogTag {
        self.tag
    }

    /// The first store lookup classification, for `Cache-Status` and logs
    pub fn first_store_lookup(&self) -> Option<&'static str> {
        self.first_store_lookup
    }

    /// Status a PURGE resolved to, once it has
    pub fn purge_status(&self) -> Option<StatusCode> {
        self.purge_status
    }

    /// Whether a fresher-but-older upstream reply was ignored
    pub fn ignored_fresh_reply(&self) -> bool {
        self.state_flags.ignored_fresh_reply
    }

    /// The cancellation hook for the downstream owner
    pub fn detach_handle(&self) -> DetachHandle {
        DetachHandle(self.deleting.clone())
    }

    pub(crate) fn detached(&self) -> bool {
        self.deleting.load(Ordering::SeqCst)
    }

    pub(crate) fn update_tag(&mut self, tag: LogTag) {
        debug!("{} -> {}", self.tag.as_str(), tag.as_str());
        self.tag = tag;
    }

    /// Remember the very first store lookup classification, ignore the rest
    pub(crate) fn detail_store_lookup(&mut self, detail: &'static str) {
        if self.first_store_lookup.is_none() {
            self.first_store_lookup = Some(detail);
        } else {
            debug!("ignoring lookup detail {detail}");
        }
    }

    pub(crate) fn cache_key(&self) -> CacheKey {
        let mut key = CacheKey::new(
            self.request.method(),
            self.request.header.uri.to_string(),
        );
        if let Some(fingerprint) = self.vary.fingerprint() {
            key.set_variance_key(fingerprint);
        }
        key
    }

    pub(crate) fn set_phase(&mut self, phase: ReplyPhase) {
        debug!("reply phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    pub(crate) fn phase_miss(&mut self) {
        self.set_phase(ReplyPhase::Miss);
    }

    pub(crate) fn phase_streaming(&mut self) {
        self.set_phase(ReplyPhase::Streaming);
    }

    /// Drive the machine until a response has been streamed (or failed).
    ///
    /// This is the entry point called by the downstream stream owner.
    pub async fn run(&mut self, node: &mut dyn StreamNode) -> StreamStatus {
        loop {
            if self.detached() {
                debug!("reply state detached, stopping");
                return StreamStatus::Failed;
            }
            let step = match self.phase {
                ReplyPhase::Start => self.identify().await,
                ReplyPhase::Hit => self.cache_hit().await,
                ReplyPhase::Miss => self.process_miss().await,
                ReplyPhase::Expired => self.process_expired().await,
                ReplyPhase::AwaitingIms => self.handle_ims().await,
                ReplyPhase::Purge => self.purge_request().await,
                ReplyPhase::Trace => self.trace_reply().await,
                ReplyPhase::Streaming => self.stream(node).await,
                ReplyPhase::Done(status) => return status,
            };
            if let Err(e) = step {
                // fatal to this request only, never the process
                error!("reply state failed in {:?}: {e}", self.phase);
                self.set_phase(ReplyPhase::Done(StreamStatus::Failed));
            }
        }
    }

    /// Classify the request against the store: the Identify state.
    async fn identify(&mut self) -> Result<()> {
        let method = self.request.method().clone();

        if is_purge(&method) {
            self.set_phase(ReplyPhase::Purge);
            return Ok(());
        }
        if method == Method::TRACE {
            if self.request.max_forwards() == Some(0) {
                self.set_phase(ReplyPhase::Trace);
                return Ok(());
            }
            // continue forwarding, not finished yet
            self.update_tag(LogTag::TcpMiss);
            self.phase_miss();
            return Ok(());
        }

        // client sent CC:no-cache or some other condition prevents
        // delivering a public object
        if self.flags.no_cache && !self.flags.internal {
            self.detail_store_lookup("no-cache");
            if let (Some(cache), Some(host)) = (self.env.ip_cache.as_deref(), self.request.host())
            {
                cache.invalidate_negative(host);
            }
            self.update_tag(LogTag::TcpMiss);
            self.phase_miss();
            return Ok(());
        }

        let key = self.cache_key();
        let entry = self.env.store.lookup_public(&key).await?;
        self.detail_store_lookup(if entry.is_some() { "match" } else { "mismatch" });

        let Some(entry) = entry else {
            debug!("no store entry - MISS");
            self.update_tag(LogTag::TcpMiss);
            self.phase_miss();
            return Ok(());
        };

        if self.env.config.offline_mode {
            debug!("offline HIT");
            self.update_tag(LogTag::TcpHit);
            return self.adopt_hit(entry);
        }

        if self.request.redirect.is_some() {
            // no body on 3xx responses, the found entry is of no use
            self.update_tag(LogTag::TcpRedirect);
            self.phase_miss();
            return Ok(());
        }

        if !entry.valid_to_send() {
            debug!("entry not valid to send - MISS");
            self.update_tag(LogTag::TcpMiss);
            self.phase_miss();
            return Ok(());
        }

        if entry.flags().special {
            // special entries are always hits, no matter what the client says
            self.update_tag(LogTag::TcpHit);
            return self.adopt_hit(entry);
        }

        if self.flags.no_cache {
            // internal no-cache request: honor it as a refresh
            self.update_tag(LogTag::TcpClientRefreshMiss);
            self.phase_miss();
            return Ok(());
        }

        if entry.hitting_requires_collapsing() {
            let cf = collapse::CollapsedForwarding::new(&self.env.config);
            if !cf.may_join(&entry) {
                debug!("prohibited collapsed hit - MISS");
                self.update_tag(LogTag::TcpMiss);
                self.phase_miss();
                return Ok(());
            }
            self.collapsed_role = CollapsedRole::Slave;
        }

        self.update_tag(LogTag::TcpHit);
        self.adopt_hit(entry)
    }

    /// Subscribe to a found entry and move to hit classification
    fn adopt_hit(&mut self, entry: EntryRef) -> Result<()> {
        debug_assert!(self.reqsize == 0, "hit adopted after bytes were sent");
        self.current = Some(StoreHandle::new(
            self.env.store.as_ref(),
            entry,
            "reply hit",
        )?);
        self.reqofs = 0;
        self.set_phase(ReplyPhase::Hit);
        Ok(())
    }

    /// Create a fresh entry, wrap it in a handle, and release the creation
    /// lock in favor of the handle's.
    pub(crate) async fn create_entry(
        &mut self,
        flags: &RequestFlags,
        reason: &'static str,
    ) -> Result<EntryRef> {
        let key = self.cache_key();
        let entry = self
            .env
            .store
            .create(&key, flags, self.request.method())
            .await?;
        self.current = Some(StoreHandle::new(self.env.store.as_ref(), entry, reason)?);
        let entry = self.current.as_ref().unwrap().entry().clone();
        entry.unlock("create handoff");
        Ok(entry)
    }

    /// Build an error page, install it into a fresh entry and stream it like
    /// any other reply.
    pub(crate) async fn set_reply_to_error(
        &mut self,
        kind: ErrorKind,
        status: StatusCode,
    ) -> Result<()> {
        let page = self
            .env
            .error_factory
            .build(kind, status, &self.request.header);
        self.install_synthetic_reply(page.reply, page.body, EntryMeta::default())
            .await
    }

    /// Install a locally generated reply so the stream layer delivers it
    /// uniformly.
    pub(crate) async fn install_synthetic_reply(
        &mut self,
        reply: ResponseHeader,
        body: bytes::Bytes,
        meta: EntryMeta,
    ) -> Result<()> {
        self.current = None;
        self.saved = None;
        self.collapsed_role = CollapsedRole::None;
        let entry = self
            .create_entry(&RequestFlags::default(), "synthetic reply")
            .await?;
        let mut fill = self.env.store.fill_handler(&entry)?;
        fill.set_reply(reply, meta)?;
        if body.is_empty() {
            fill.finish().await?;
        } else {
            fill.write_body(body, true).await?;
        }
        self.reqofs = 0;
        self.reqsize = 0;
        self.first_buffer = None;
        self.phase_streaming();
        Ok(())
    }

    /// The freshest reply of the entry being served, or an internal error
    /// when the store has none yet.
    pub(crate) fn current_reply(&self) -> Result<Arc<ResponseHeader>> {
        self.current
            .as_ref()
            .and_then(|h| h.entry().freshest_reply())
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "no reply on current entry"))
    }
}

// PURGE is not a registered http::Method constant
pub(crate) fn is_purge(method: &Method) -> bool {
    method.as_str() == "PURGE"
}

/// Whether the method is one we know the semantics of. Unknown extension
/// methods invalidate all cached variants of their URL on the miss path.
pub(crate) fn known_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET
            | Method::HEAD
            | Method::POST
            | Method::PUT
            | Method::DELETE
            | Method::CONNECT
            | Method::OPTIONS
            | Method::TRACE
            | Method::PATCH
    ) || is_purge(method)
}
