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

//! Object store abstraction consumed by the reply pipeline
//!
//! The store itself lives elsewhere; this crate only ever locks, subscribes,
//! copies and evicts through these traits and treats the store as
//! linearizable.

use crate::key::CacheKey;
use crate::request::RequestFlags;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use pingora_error::Result;
use pingora_http::ResponseHeader;
use std::sync::Arc;
use std::time::SystemTime;

/// Whether the entry has everything it will ever have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// A writer may still append data
    Pending,
    /// The object is complete
    Ok,
}

/// Where the object currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemStatus {
    InMemory,
    OnDisk,
    None,
}

/// Entry state bits observed by the reply pipeline
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryFlags {
    /// Internally generated object (icons, error pages); always a hit
    pub special: bool,
    /// The writer gave up; readers must not trust the tail
    pub aborted: bool,
    /// Stored length disagrees with the advertised length
    pub bad_length: bool,
    /// A cached negative response (e.g. a remembered 404)
    pub negative: bool,
}

/// Timestamps describing one stored object
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    /// When the object was (last) admitted or revalidated
    pub timestamp: SystemTime,
    /// Origin `Last-Modified`, when the origin supplied one
    pub last_modified: Option<SystemTime>,
    /// Origin `Expires`, when supplied
    pub expires: Option<SystemTime>,
}

impl Default for EntryMeta {
    fn default() -> Self {
        EntryMeta {
            timestamp: SystemTime::now(),
            last_modified: None,
            expires: None,
        }
    }
}

/// One byte range delivered by a store subscription.
///
/// Offsets count body octets from the start of the stored object. An empty
/// `data` with `eof` set means the object ended at `offset`; `error` means
/// the store could not produce the bytes (swap-in failure).
#[derive(Debug, Default, Clone)]
pub struct StoreBuffer {
    pub offset: u64,
    pub data: Bytes,
    pub eof: bool,
    pub error: bool,
}

/// A shared view of one cached object.
///
/// Every reader holds at least one [lock](Entry::lock) while reading; the
/// [StoreHandle](crate::handle::StoreHandle) pairs the lock with a
/// subscription so neither can leak.
pub trait Entry: Send + Sync {
    fn key(&self) -> CacheKey;
    fn meta(&self) -> EntryMeta;
    fn flags(&self) -> EntryFlags;
    fn store_status(&self) -> StoreStatus;
    fn mem_status(&self) -> MemStatus;

    /// The most recent complete reply metadata (may reflect a 304 update).
    /// `None` until a writer installs one.
    fn freshest_reply(&self) -> Option<Arc<ResponseHeader>>;

    /// The original reply metadata of this object
    fn base_reply(&self) -> Option<Arc<ResponseHeader>>;

    /// Stored body length; known once the entry is [StoreStatus::Ok]
    fn body_len(&self) -> Option<u64>;

    /// Reference-counted lock keeping the object alive
    fn lock(&self, reason: &'static str);
    fn unlock(&self, reason: &'static str);

    /// Whether this object may (still) be served to a new reader.
    /// Collapsed slaves must re-check this at every resumption.
    fn may_start_hitting(&self) -> bool;

    /// Whether readers of this entry are required to collapse onto the
    /// in-flight writer
    fn hitting_requires_collapsing(&self) -> bool;

    /// Whether the object is in a servable state at all
    fn valid_to_send(&self) -> bool;

    /// Helper function to cast the trait object to concrete types
    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync);
}

pub type EntryRef = Arc<dyn Entry>;

/// A store client: the read side of one entry.
///
/// One subscription belongs to exactly one [StoreHandle](crate::handle::StoreHandle).
#[async_trait]
pub trait Subscribe: Send {
    /// Wait for bytes at `offset`, up to `max` of them.
    ///
    /// Resolves early with an empty, non-eof buffer when the entry's reply
    /// metadata becomes available before any body does, so callers can act
    /// on headers of still-filling entries.
    async fn copy(&mut self, offset: u64, max: usize) -> Result<StoreBuffer>;
}

pub type Subscription = Box<dyn Subscribe>;

/// The write side of one entry: how a forwarder or a synthesized reply is
/// installed.
///
/// Dropping the handle without [finish](HandleFill::finish) marks the entry
/// aborted.
#[async_trait]
pub trait HandleFill: Send {
    /// Install the reply metadata. Must happen before any body write.
    fn set_reply(&mut self, reply: ResponseHeader, meta: EntryMeta) -> Result<()>;

    async fn write_body(&mut self, data: Bytes, eof: bool) -> Result<()>;

    /// Complete the object; it becomes [StoreStatus::Ok]
    async fn finish(self: Box<Self>) -> Result<()>;

    /// Give up; readers observe the aborted flag
    fn abort(self: Box<Self>);
}

pub type FillHandler = Box<dyn HandleFill>;

/// The object store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Find a public entry for the key. The returned entry is not locked;
    /// callers wrap it in a handle before reading.
    async fn lookup_public(&self, key: &CacheKey) -> Result<Option<EntryRef>>;

    /// Create a fresh pending entry for the key. The entry is locked once on
    /// behalf of the caller.
    async fn create(&self, key: &CacheKey, flags: &RequestFlags, method: &Method)
        -> Result<EntryRef>;

    /// Register a store client on the entry
    fn subscribe(&self, entry: &EntryRef) -> Result<Subscription>;

    /// The write side of a pending entry
    fn fill_handler(&self, entry: &EntryRef) -> Result<FillHandler>;

    /// Drop the object for `key` if present. Best effort; active readers
    /// keep their locked object.
    async fn evict_if_found(&self, key: &CacheKey) -> bool;

    /// A revalidation came back 304: refresh `old` from the headers of
    /// `fresh` and reset its age.
    async fn update_on_not_modified(&self, old: &EntryRef, fresh: &EntryRef) -> Result<()>;

    /// Publish `entry` so concurrent requests for the same key may collapse
    /// onto its writer. Returns false when the store refuses.
    fn allow_collapsing(&self, entry: &EntryRef, flags: &RequestFlags, method: &Method) -> bool;

    /// Whether the store is shared across worker processes (SMP). Collapsed
    /// revalidation is not attempted on shared stores.
    fn is_smp_shared(&self) -> bool {
        false
    }
}
