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

//! Cache key

use blake2::{Blake2b, Digest};
use http::Method;
use serde::{Deserialize, Serialize};

// 128-bit keys; wide enough that collisions are not a practical concern
const KEY_SIZE: usize = 16;

/// An 128 bit hash binary
pub type HashBinary = [u8; KEY_SIZE];

/// Incremental Blake2b-128 hashing of key material.
///
/// Every key and fingerprint hash in the crate goes through this wrapper so
/// the choice of hash lives in exactly one place.
pub(crate) struct KeyHasher(Blake2b<blake2::digest::consts::U16>);

impl KeyHasher {
    pub fn new() -> Self {
        KeyHasher(Blake2b::new())
    }

    pub fn write(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Feed one length-delimited field, so adjacent fields can never run
    /// into each other no matter what bytes they contain.
    pub fn write_field(&mut self, data: &[u8]) {
        self.0.update((data.len() as u64).to_be_bytes());
        self.0.update(data);
    }

    pub fn finish(self) -> HashBinary {
        self.0.finalize().into()
    }
}

/// The trait for cache key hashing
pub trait CacheHashKey {
    /// Return the hash of the cache key
    fn primary_bin(&self) -> HashBinary;

    /// Return the variance hash of the cache key.
    ///
    /// `None` if no variance.
    fn variance_bin(&self) -> Option<HashBinary>;

    /// The hash addressing one concrete variant: the primary hash alone for
    /// non-varying objects, a hash over both otherwise.
    fn combined_bin(&self) -> HashBinary {
        let primary = self.primary_bin();
        match self.variance_bin() {
            Some(variance) => {
                let mut hasher = KeyHasher::new();
                hasher.write(&primary);
                hasher.write(&variance);
                hasher.finish()
            }
            None => primary,
        }
    }

    /// Hex form of [Self::combined_bin], how stores index the object
    fn combined(&self) -> String {
        hex::encode(self.combined_bin())
    }
}

/// The identity of a stored entity: method x URI x optional Vary fingerprint.
///
/// The variance hash distinguishes multiple cached variants living under the
/// same primary (method + URI) slot.
#[derive(Debug, Clone)]
pub struct CacheKey {
    method: String,
    uri: String,
    variance: Option<HashBinary>,
}

impl CacheKey {
    /// Create a new [CacheKey] for the given method and request URI
    pub fn new(method: &Method, uri: impl Into<String>) -> Self {
        CacheKey {
            method: method.as_str().to_string(),
            uri: uri.into(),
            variance: None,
        }
    }

    /// The same URI under a different method.
    ///
    /// Purge uses this to reach the GET and HEAD slots of one URL.
    pub fn with_method(&self, method: &Method) -> Self {
        CacheKey {
            method: method.as_str().to_string(),
            uri: self.uri.clone(),
            variance: self.variance,
        }
    }

    /// The same method and URI without the variance, addressing the primary slot
    pub fn without_variance(&self) -> Self {
        CacheKey {
            method: self.method.clone(),
            uri: self.uri.clone(),
            variance: None,
        }
    }

    /// Set the value of the variance hash
    pub fn set_variance_key(&mut self, key: HashBinary) {
        self.variance = Some(key)
    }

    /// Get the value of the variance hash
    pub fn get_variance_key(&self) -> Option<&HashBinary> {
        self.variance.as_ref()
    }

    /// Removes the variance from this cache key
    pub fn remove_variance_key(&mut self) {
        self.variance = None
    }

    /// Return the request URI of this key
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Return the method of this key
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Convert this key to [CompactCacheKey].
    pub fn to_compact(&self) -> CompactCacheKey {
        CompactCacheKey {
            primary: self.primary_bin(),
            variance: self.variance.map(Box::new),
        }
    }
}

impl CacheHashKey for CacheKey {
    fn primary_bin(&self) -> HashBinary {
        let mut hasher = KeyHasher::new();
        hasher.write_field(self.method.as_bytes());
        hasher.write_field(self.uri.as_bytes());
        hasher.finish()
    }

    fn variance_bin(&self) -> Option<HashBinary> {
        self.variance
    }
}

/// Storage optimized cache key to keep in memory or in storage
#[derive(Debug, Deserialize, Serialize, Clone, Hash, PartialEq, Eq)]
pub struct CompactCacheKey {
    pub primary: HashBinary,
    // save 8 bytes for non-variance but waste 8 bytes for variance vs. flat 16 bytes
    pub variance: Option<Box<HashBinary>>,
}

impl CacheHashKey for CompactCacheKey {
    fn primary_bin(&self) -> HashBinary {
        self.primary
    }

    fn variance_bin(&self) -> Option<HashBinary> {
        self.variance.as_ref().map(|s| *s.as_ref())
    }
}
