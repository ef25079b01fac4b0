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

//! RAII handle coupling an entry lock with its subscription

use crate::storage::{EntryRef, Store, StoreBuffer, Subscription};

use pingora_error::Result;

/// An owned reference that keeps a cache entry alive and subscribed.
///
/// Exactly one subscription per handle. Dropping the handle releases the
/// lock and the subscription on every exit path, so no manual unlock pairs
/// exist anywhere in the pipeline.
pub struct StoreHandle {
    entry: EntryRef,
    subscription: Subscription,
    reason: &'static str,
}

impl StoreHandle {
    /// Lock `entry` and register a store client on it.
    ///
    /// `reason` shows up in store lock diagnostics.
    pub fn new(store: &dyn Store, entry: EntryRef, reason: &'static str) -> Result<Self> {
        entry.lock(reason);
        let subscription = match store.subscribe(&entry) {
            Ok(s) => s,
            Err(e) => {
                entry.unlock(reason);
                return Err(e);
            }
        };
        Ok(StoreHandle {
            entry,
            subscription,
            reason,
        })
    }

    pub fn entry(&self) -> &EntryRef {
        &self.entry
    }

    /// Wait for bytes at `offset` from this handle's subscription
    pub async fn copy(&mut self, offset: u64, max: usize) -> Result<StoreBuffer> {
        self.subscription.copy(offset, max).await
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        // subscription is dropped by the compiler right after; the unlock
        // must not observe a live store client
        self.entry.unlock(self.reason);
    }
}
