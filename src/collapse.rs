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

//! Collapsed forwarding arbitration
//!
//! Concurrent revalidations of one key share a single upstream fetch: the
//! first request becomes the initiator and produces into a shared entry,
//! later ones become slaves reading from it. The store mediates the actual
//! sharing through its subscription protocol; this module owns the policy of
//! when sharing is allowed at all.

use crate::config::ConfigSnapshot;
use crate::key::HashBinary;
use crate::request::RequestFlags;
use crate::storage::{EntryRef, Store};

use http::Method;
use strum::IntoStaticStr;

/// Role of a request in a collapsed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum CollapsedRole {
    /// Not collapsed
    None,
    /// Produces into the shared entry; starts the forwarder
    Initiator,
    /// Reads from another request's entry; must re-check shareability at
    /// every chunk
    Slave,
}

/// The collapsed-forwarding policy for one request.
pub struct CollapsedForwarding<'a> {
    config: &'a ConfigSnapshot,
}

impl<'a> CollapsedForwarding<'a> {
    pub fn new(config: &'a ConfigSnapshot) -> Self {
        CollapsedForwarding { config }
    }

    /// Whether this request may participate in collapsing at all: the
    /// feature is on, the store is not SMP-shared, and the request carries
    /// no Vary fingerprint (collapsed revalidation of Vary-controlled
    /// entries is not supported).
    pub fn allowed(&self, store: &dyn Store, vary_fingerprint: Option<HashBinary>) -> bool {
        self.config.collapsed_forwarding && !store.is_smp_shared() && vary_fingerprint.is_none()
    }

    /// Whether a new request may join `entry` as a slave.
    ///
    /// Join succeeds iff the entry advertises that hitting it requires
    /// collapsing and it still accepts new readers.
    pub fn may_join(&self, entry: &EntryRef) -> bool {
        entry.hitting_requires_collapsing() && entry.may_start_hitting()
    }

    /// Offer a freshly created entry for others to collapse on.
    ///
    /// The initiator must not publish collapsing on entries it cannot
    /// guarantee to be shareable: Vary-controlled requests and
    /// must-revalidate-unknown entries never get here (see
    /// [Self::allowed]).
    pub fn offer(
        &self,
        store: &dyn Store,
        entry: &EntryRef,
        flags: &RequestFlags,
        method: &Method,
    ) -> bool {
        if !flags.cachable || flags.need_validation {
            return false;
        }
        if !matches!(*method, Method::GET | Method::HEAD) {
            return false;
        }
        store.allow_collapsing(entry, flags, method)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::key::CacheKey;
    use crate::memory::MemStore;

    fn config(on: bool) -> ConfigSnapshot {
        ConfigSnapshot {
            collapsed_forwarding: on,
            ..Default::default()
        }
    }

    async fn pending_entry(store: &MemStore) -> EntryRef {
        let key = CacheKey::new(&Method::GET, "http://a.example/c");
        store
            .create(&key, &RequestFlags::default(), &Method::GET)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_allowed() {
        let store = MemStore::new();
        let cf_on = config(true);
        let cf = CollapsedForwarding::new(&cf_on);
        assert!(cf.allowed(&store, None));
        // a vary fingerprint disables collapsing
        assert!(!cf.allowed(&store, Some([0u8; 16])));

        let cf_off = config(false);
        let cf = CollapsedForwarding::new(&cf_off);
        assert!(!cf.allowed(&store, None));
    }

    #[tokio::test]
    async fn test_offer_then_join() {
        let store = MemStore::new();
        let conf = config(true);
        let cf = CollapsedForwarding::new(&conf);
        let entry = pending_entry(&store).await;

        // nothing to join before the offer
        assert!(!cf.may_join(&entry));

        let mut flags = RequestFlags::default();
        flags.cachable = true;
        assert!(cf.offer(&store, &entry, &flags, &Method::GET));
        assert!(cf.may_join(&entry));
    }

    #[tokio::test]
    async fn test_offer_refused() {
        let store = MemStore::new();
        let conf = config(true);
        let cf = CollapsedForwarding::new(&conf);
        let entry = pending_entry(&store).await;

        let mut flags = RequestFlags::default();
        flags.cachable = false;
        assert!(!cf.offer(&store, &entry, &flags, &Method::GET));

        flags.cachable = true;
        flags.need_validation = true;
        assert!(!cf.offer(&store, &entry, &flags, &Method::GET));

        flags.need_validation = false;
        assert!(!cf.offer(&store, &entry, &flags, &Method::POST));
    }
}
