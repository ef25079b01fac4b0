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

//! Hash map based in memory store
//!
//! For testing only, not for production use

use crate::key::{CacheHashKey, CacheKey};
use crate::request::RequestFlags;
use crate::storage::*;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use log::debug;
use parking_lot::RwLock;
use pingora_error::{Error, ErrorType, Result};
use pingora_http::ResponseHeader;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default)]
struct BodyState {
    written: usize,
    complete: bool,
    aborted: bool,
    has_reply: bool,
}

struct MemEntryInner {
    key: CacheKey,
    meta: RwLock<EntryMeta>,
    freshest: RwLock<Option<Arc<ResponseHeader>>>,
    base: RwLock<Option<Arc<ResponseHeader>>>,
    // body is Arc so subscriptions outlive evicted entries
    body: Arc<RwLock<Vec<u8>>>,
    state: watch::Sender<BodyState>,
    special: AtomicBool,
    negative: AtomicBool,
    bad_length: AtomicBool,
    shareable: AtomicBool,
    collapsing: AtomicBool,
    // admit into the public map when the writer finishes
    publish_on_finish: AtomicBool,
    mem_status: RwLock<MemStatus>,
    locks: AtomicU32,
}

/// One object in a [MemStore].
#[derive(Clone)]
pub struct MemEntry(Arc<MemEntryInner>);

impl MemEntry {
    fn new(key: CacheKey, publish_on_finish: bool) -> Self {
        let (tx, _rx) = watch::channel(BodyState::default());
        MemEntry(Arc::new(MemEntryInner {
            key,
            meta: RwLock::new(EntryMeta::default()),
            freshest: RwLock::new(None),
            base: RwLock::new(None),
            body: Arc::new(RwLock::new(Vec::new())),
            state: tx,
            special: AtomicBool::new(false),
            negative: AtomicBool::new(false),
            bad_length: AtomicBool::new(false),
            shareable: AtomicBool::new(true),
            collapsing: AtomicBool::new(false),
            publish_on_finish: AtomicBool::new(publish_on_finish),
            mem_status: RwLock::new(MemStatus::InMemory),
            locks: AtomicU32::new(0),
        }))
    }

    /// Mark this object internally generated (always a hit)
    pub fn set_special(&self, special: bool) {
        self.0.special.store(special, Ordering::SeqCst);
    }

    /// Mark this object a cached negative response
    pub fn set_negative(&self, negative: bool) {
        self.0.negative.store(negative, Ordering::SeqCst);
    }

    /// Pretend the stored length disagrees with the advertised one
    pub fn set_bad_length(&self, bad: bool) {
        self.0.bad_length.store(bad, Ordering::SeqCst);
    }

    /// Change where the object pretends to live
    pub fn set_mem_status(&self, status: MemStatus) {
        *self.0.mem_status.write() = status;
    }

    /// Withdraw shareability, as a writer losing its public key would
    pub fn set_unshareable(&self) {
        self.0.shareable.store(false, Ordering::SeqCst);
        self.0.state.send_modify(|_| {});
    }

    fn abort(&self) {
        self.0.shareable.store(false, Ordering::SeqCst);
        self.0.state.send_modify(|s| s.aborted = true);
    }
}

impl Entry for MemEntry {
    fn key(&self) -> CacheKey {
        self.0.key.clone()
    }

    fn meta(&self) -> EntryMeta {
        *self.0.meta.read()
    }

    fn flags(&self) -> EntryFlags {
        let state = *self.0.state.borrow();
        EntryFlags {
            special: self.0.special.load(Ordering::SeqCst),
            aborted: state.aborted,
            bad_length: self.0.bad_length.load(Ordering::SeqCst),
            negative: self.0.negative.load(Ordering::SeqCst),
        }
    }

    fn store_status(&self) -> StoreStatus {
        if self.0.state.borrow().complete {
            StoreStatus::Ok
        } else {
            StoreStatus::Pending
        }
    }

    fn mem_status(&self) -> MemStatus {
        *self.0.mem_status.read()
    }

    fn freshest_reply(&self) -> Option<Arc<ResponseHeader>> {
        self.0.freshest.read().clone()
    }

    fn base_reply(&self) -> Option<Arc<ResponseHeader>> {
        self.0.base.read().clone()
    }

    fn body_len(&self) -> Option<u64> {
        let state = *self.0.state.borrow();
        state.complete.then_some(state.written as u64)
    }

    fn lock(&self, reason: &'static str) {
        let n = self.0.locks.fetch_add(1, Ordering::SeqCst);
        debug!("lock {} ({reason}): {}", self.0.key.combined(), n + 1);
    }

    fn unlock(&self, reason: &'static str) {
        let n = self.0.locks.fetch_sub(1, Ordering::SeqCst);
        assert!(n > 0, "unlock without lock ({reason})");
        debug!("unlock {} ({reason}): {}", self.0.key.combined(), n - 1);
    }

    fn may_start_hitting(&self) -> bool {
        !self.0.state.borrow().aborted && self.0.shareable.load(Ordering::SeqCst)
    }

    fn hitting_requires_collapsing(&self) -> bool {
        self.0.collapsing.load(Ordering::SeqCst) && self.store_status() == StoreStatus::Pending
    }

    fn valid_to_send(&self) -> bool {
        !self.0.state.borrow().aborted
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

struct MemSubscription {
    body: Arc<RwLock<Vec<u8>>>,
    state: watch::Receiver<BodyState>,
    // deliver the empty header wakeup only once
    poked: bool,
}

#[async_trait]
impl Subscribe for MemSubscription {
    async fn copy(&mut self, offset: u64, max: usize) -> Result<StoreBuffer> {
        loop {
            let state = *self.state.borrow_and_update();
            if state.aborted {
                return Ok(StoreBuffer {
                    offset,
                    error: true,
                    ..Default::default()
                });
            }
            let written = state.written as u64;
            if written > offset {
                let end = std::cmp::min(written, offset + max as u64);
                let data =
                    Bytes::copy_from_slice(&self.body.read()[offset as usize..end as usize]);
                return Ok(StoreBuffer {
                    offset,
                    data,
                    eof: state.complete && end == written,
                    error: false,
                });
            }
            if state.complete {
                return Ok(StoreBuffer {
                    offset,
                    eof: true,
                    ..Default::default()
                });
            }
            if state.has_reply && !self.poked {
                // headers are available before any body; let the reader act
                self.poked = true;
                return Ok(StoreBuffer {
                    offset,
                    ..Default::default()
                });
            }
            if self.state.changed().await.is_err() {
                // writer side gone without completing
                return Ok(StoreBuffer {
                    offset,
                    error: true,
                    ..Default::default()
                });
            }
        }
    }
}

struct MemFillHandler {
    entry: MemEntry,
    map: Arc<RwLock<HashMap<String, MemEntry>>>,
    finished: bool,
}

#[async_trait]
impl HandleFill for MemFillHandler {
    fn set_reply(&mut self, reply: ResponseHeader, meta: EntryMeta) -> Result<()> {
        let inner = &self.entry.0;
        let reply = Arc::new(reply);
        if inner.base.read().is_none() {
            *inner.base.write() = Some(reply.clone());
        }
        *inner.freshest.write() = Some(reply);
        *inner.meta.write() = meta;
        inner.state.send_modify(|s| s.has_reply = true);
        Ok(())
    }

    async fn write_body(&mut self, data: Bytes, eof: bool) -> Result<()> {
        let inner = &self.entry.0;
        {
            let state = inner.state.borrow();
            if state.complete {
                return Error::e_explain(ErrorType::InternalError, "write after EOF");
            }
            if !state.has_reply {
                return Error::e_explain(ErrorType::InternalError, "body before reply");
            }
        }
        inner.body.write().extend_from_slice(&data);
        let written = inner.body.read().len();
        inner.state.send_modify(|s| {
            s.written = written;
            s.complete = eof;
        });
        if eof {
            self.finish_inner();
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        {
            let inner = &self.entry.0;
            if !inner.state.borrow().complete {
                let written = inner.body.read().len();
                inner.state.send_modify(|s| {
                    s.written = written;
                    s.complete = true;
                });
            }
        }
        self.finish_inner();
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        self.finished = true;
        self.entry.abort();
    }
}

impl MemFillHandler {
    fn finish_inner(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.entry.0.publish_on_finish.load(Ordering::SeqCst) {
            let hash = self.entry.0.key.combined();
            self.map.write().insert(hash, self.entry.clone());
        }
    }
}

impl Drop for MemFillHandler {
    fn drop(&mut self) {
        // an incomplete admission is an aborted one
        if !self.finished && !self.entry.0.state.borrow().complete {
            self.entry.abort();
        }
    }
}

/// Hash map based in memory store.
///
/// For testing only, not for production use.
pub struct MemStore {
    map: Arc<RwLock<HashMap<String, MemEntry>>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            map: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn downcast(entry: &EntryRef) -> Result<&MemEntry> {
        entry
            .as_any()
            .downcast_ref::<MemEntry>()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "not a MemStore entry"))
    }

    /// Outstanding locks for `key`, for leak assertions in tests
    pub fn lock_count(&self, key: &CacheKey) -> u32 {
        self.map
            .read()
            .get(&key.combined())
            .map_or(0, |e| e.0.locks.load(Ordering::SeqCst))
    }

    /// The concrete entry for `key`, for test manipulation
    pub fn get_mem_entry(&self, key: &CacheKey) -> Option<MemEntry> {
        self.map.read().get(&key.combined()).cloned()
    }

    /// Shorthand for seeding a complete object.
    pub async fn admit(
        &self,
        key: &CacheKey,
        reply: ResponseHeader,
        meta: EntryMeta,
        body: &[u8],
    ) -> EntryRef {
        let flags = RequestFlags {
            cachable: true,
            ..Default::default()
        };
        let entry = self
            .create(key, &flags, &Method::GET)
            .await
            .expect("create");
        let mut fill = self.fill_handler(&entry).expect("fill handler");
        fill.set_reply(reply, meta).expect("set reply");
        fill.write_body(Bytes::copy_from_slice(body), false)
            .await
            .expect("write");
        fill.finish().await.expect("finish");
        entry.unlock("admit");
        self.get_mem_entry(key).expect("admitted").into_ref()
    }
}

impl MemEntry {
    fn into_ref(self) -> EntryRef {
        Arc::new(self)
    }
}

#[async_trait]
impl Store for MemStore {
    async fn lookup_public(&self, key: &CacheKey) -> Result<Option<EntryRef>> {
        let hash = key.combined();
        Ok(self
            .map
            .read()
            .get(&hash)
            .cloned()
            .map(MemEntry::into_ref))
    }

    async fn create(
        &self,
        key: &CacheKey,
        flags: &RequestFlags,
        _method: &Method,
    ) -> Result<EntryRef> {
        // created private; published by allow_collapsing or on finish
        let entry = MemEntry::new(key.clone(), flags.cachable && !flags.need_validation);
        entry.lock("create");
        Ok(Arc::new(entry))
    }

    fn subscribe(&self, entry: &EntryRef) -> Result<Subscription> {
        let entry = Self::downcast(entry)?;
        Ok(Box::new(MemSubscription {
            body: entry.0.body.clone(),
            state: entry.0.state.subscribe(),
            poked: false,
        }))
    }

    fn fill_handler(&self, entry: &EntryRef) -> Result<FillHandler> {
        let entry = Self::downcast(entry)?;
        Ok(Box::new(MemFillHandler {
            entry: entry.clone(),
            map: self.map.clone(),
            finished: false,
        }))
    }

    async fn evict_if_found(&self, key: &CacheKey) -> bool {
        self.map.write().remove(&key.combined()).is_some()
    }

    async fn update_on_not_modified(&self, old: &EntryRef, fresh: &EntryRef) -> Result<()> {
        let old = Self::downcast(old)?;
        let fresh_reply = fresh
            .freshest_reply()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "no fresh reply"))?;
        let mut merged = old
            .freshest_reply()
            .map(|r| r.as_ref().clone())
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "no stored reply"))?;
        // RFC 9111 4.3.4: update stored header fields from the 304
        for name in [
            "cache-control",
            "expires",
            "date",
            "etag",
            "last-modified",
        ] {
            if let Some(value) = fresh_reply.headers.get(name) {
                merged.insert_header(name, value).unwrap();
            }
        }
        *old.0.freshest.write() = Some(Arc::new(merged));
        let mut meta = old.0.meta.write();
        meta.timestamp = fresh.meta().timestamp;
        if let Some(expires) = fresh.meta().expires {
            meta.expires = Some(expires);
        }
        Ok(())
    }

    fn allow_collapsing(&self, entry: &EntryRef, _flags: &RequestFlags, method: &Method) -> bool {
        if *method != Method::GET {
            return false;
        }
        let Ok(entry) = Self::downcast(entry) else {
            return false;
        };
        entry.0.collapsing.store(true, Ordering::SeqCst);
        // visible to joiners from now on
        self.map
            .write()
            .insert(entry.0.key.combined(), entry.clone());
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::FutureExt;

    fn gen_reply() -> ResponseHeader {
        let mut reply = ResponseHeader::build(200, None).unwrap();
        reply.append_header("Content-Type", "text/plain").unwrap();
        reply
    }

    fn key() -> CacheKey {
        CacheKey::new(&Method::GET, "http://a.example/m")
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemStore::new();
        let key = key();
        assert!(store.lookup_public(&key).await.unwrap().is_none());

        let entry = store
            .admit(&key, gen_reply(), EntryMeta::default(), b"test1test2")
            .await;
        assert_eq!(entry.store_status(), StoreStatus::Ok);
        assert_eq!(entry.body_len(), Some(10));

        let found = store.lookup_public(&key).await.unwrap().unwrap();
        let mut sub = store.subscribe(&found).unwrap();
        let buf = sub.copy(0, 4096).await.unwrap();
        assert_eq!(&buf.data[..], b"test1test2");
        assert!(buf.eof);
    }

    #[tokio::test]
    async fn test_read_while_write() {
        let store = MemStore::new();
        let key = key();
        let flags = RequestFlags {
            cachable: true,
            ..Default::default()
        };
        let entry = store.create(&key, &flags, &Method::GET).await.unwrap();
        let mut fill = store.fill_handler(&entry).unwrap();
        let mut sub = store.subscribe(&entry).unwrap();

        // nothing yet, not even headers
        assert!(sub.copy(0, 4096).now_or_never().is_none());

        fill.set_reply(gen_reply(), EntryMeta::default()).unwrap();
        // header poke: empty, not EOF
        let buf = sub.copy(0, 4096).await.unwrap();
        assert!(buf.data.is_empty() && !buf.eof && !buf.error);

        fill.write_body(Bytes::from_static(b"part1"), false)
            .await
            .unwrap();
        let buf = sub.copy(0, 4096).await.unwrap();
        assert_eq!(&buf.data[..], b"part1");
        assert!(!buf.eof);

        fill.write_body(Bytes::from_static(b"part2"), true)
            .await
            .unwrap();
        let buf = sub.copy(5, 4096).await.unwrap();
        assert_eq!(&buf.data[..], b"part2");
        assert!(buf.eof);

        // published once complete
        assert!(store.lookup_public(&key).await.unwrap().is_some());
        entry.unlock("test");
    }

    #[tokio::test]
    async fn test_abort_wakes_readers() {
        let store = MemStore::new();
        let key = key();
        let flags = RequestFlags {
            cachable: true,
            ..Default::default()
        };
        let entry = store.create(&key, &flags, &Method::GET).await.unwrap();
        let mut fill = store.fill_handler(&entry).unwrap();
        fill.set_reply(gen_reply(), EntryMeta::default()).unwrap();
        let mut sub = store.subscribe(&entry).unwrap();
        let _ = sub.copy(0, 4096).await.unwrap(); // header poke

        fill.abort();
        let buf = sub.copy(0, 4096).await.unwrap();
        assert!(buf.error);
        assert!(entry.flags().aborted);
        assert!(!entry.may_start_hitting());
        entry.unlock("test");
    }

    #[tokio::test]
    async fn test_dropped_fill_aborts() {
        let store = MemStore::new();
        let key = key();
        let flags = RequestFlags {
            cachable: true,
            ..Default::default()
        };
        let entry = store.create(&key, &flags, &Method::GET).await.unwrap();
        {
            let mut fill = store.fill_handler(&entry).unwrap();
            fill.set_reply(gen_reply(), EntryMeta::default()).unwrap();
            // dropped without finish
        }
        assert!(entry.flags().aborted);
        entry.unlock("test");
    }

    #[tokio::test]
    async fn test_evict() {
        let store = MemStore::new();
        let key = key();
        store
            .admit(&key, gen_reply(), EntryMeta::default(), b"x")
            .await;
        assert!(store.evict_if_found(&key).await);
        assert!(!store.evict_if_found(&key).await);
        assert!(store.lookup_public(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_on_not_modified() {
        let store = MemStore::new();
        let key = key();
        let mut stale = gen_reply();
        stale.insert_header("ETag", "\"v1\"").unwrap();
        let old_meta = EntryMeta {
            timestamp: std::time::SystemTime::now() - std::time::Duration::from_secs(600),
            ..Default::default()
        };
        let old = store.admit(&key, stale, old_meta, b"body").await;

        let fresh_key = CacheKey::new(&Method::GET, "http://a.example/m-reval");
        let mut not_modified = ResponseHeader::build(304, None).unwrap();
        not_modified
            .insert_header("Cache-Control", "max-age=300")
            .unwrap();
        let fresh = store
            .admit(&fresh_key, not_modified, EntryMeta::default(), b"")
            .await;

        store.update_on_not_modified(&old, &fresh).await.unwrap();
        let merged = old.freshest_reply().unwrap();
        assert_eq!(
            merged.headers.get("cache-control").unwrap(),
            "max-age=300"
        );
        // the body and base reply are untouched
        assert_eq!(merged.status.as_u16(), 200);
        assert!(old.meta().timestamp > old_meta.timestamp);
    }

    #[tokio::test]
    async fn test_collapsing_publish() {
        let store = MemStore::new();
        let key = key();
        let flags = RequestFlags {
            cachable: true,
            ..Default::default()
        };
        let entry = store.create(&key, &flags, &Method::GET).await.unwrap();
        // private before the offer
        assert!(store.lookup_public(&key).await.unwrap().is_none());
        assert!(store.allow_collapsing(&entry, &flags, &Method::GET));
        let found = store.lookup_public(&key).await.unwrap().unwrap();
        assert!(found.hitting_requires_collapsing());
        entry.unlock("test");
    }
}
