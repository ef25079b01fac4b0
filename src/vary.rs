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

//! Vary evaluation and variance fingerprints

use crate::key::{HashBinary, KeyHasher};

use http::header;
use pingora_http::{RequestHeader, ResponseHeader};

/// Outcome of matching a stored entry's Vary against the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaryResult {
    /// The entry does not vary
    None,
    /// This is the correct variant for the request
    Match,
    /// Another variant is wanted; the request's fingerprint was updated,
    /// requery the store
    Other,
    /// Vary loop detected (or `Vary: *`): give up and treat as miss
    Cancel,
}

/// Compute the request's variance fingerprint under the stored reply's Vary
/// header. `Ok(None)` when the reply does not vary; `Err(())` on `Vary: *`.
///
/// The selected header names are hashed sorted, lowercased and
/// length-delimited together with the request's values for them, so neither
/// header order nor field boundaries can change the result. Headers the
/// request does not carry contribute an empty value, which still
/// distinguishes the fingerprint from "no variance at all".
pub fn request_variance(
    stored: &ResponseHeader,
    req: &RequestHeader,
) -> Result<Option<HashBinary>, ()> {
    let mut names = Vec::new();
    for vary in stored.headers.get_all(header::VARY) {
        let Ok(vary) = vary.to_str() else { continue };
        for name in vary.split(',') {
            let name = name.trim();
            if name == "*" {
                // never matchable
                return Err(());
            }
            if !name.is_empty() {
                names.push(name.to_ascii_lowercase());
            }
        }
    }
    if names.is_empty() {
        return Ok(None);
    }
    names.sort();
    names.dedup();

    let mut hasher = KeyHasher::new();
    for name in names.iter() {
        hasher.write_field(name.as_bytes());
        let value = req
            .headers
            .get(name.as_str())
            .map(|v| v.as_bytes())
            .unwrap_or_default();
        hasher.write_field(value);
    }
    Ok(Some(hasher.finish()))
}

/// Evaluates a stored entry's Vary against the request.
///
/// The matcher updates the request's fingerprint on mismatch exactly once
/// (`retried` bounds the requery loop); a second mismatch reports a loop.
pub struct VaryMatcher {
    fingerprint: Option<HashBinary>,
    retried: bool,
}

impl VaryMatcher {
    pub fn new() -> Self {
        VaryMatcher {
            fingerprint: None,
            retried: false,
        }
    }

    /// The fingerprint the request currently carries
    pub fn fingerprint(&self) -> Option<HashBinary> {
        self.fingerprint
    }

    /// Match `stored`'s Vary against `req`.
    pub fn evaluate(&mut self, stored: &ResponseHeader, req: &RequestHeader) -> VaryResult {
        let wanted = match request_variance(stored, req) {
            Ok(None) => return VaryResult::None,
            Ok(Some(v)) => v,
            Err(()) => return VaryResult::Cancel,
        };
        if self.fingerprint == Some(wanted) {
            return VaryResult::Match;
        }
        if self.retried {
            // fingerprint updated once already and we still mismatch
            return VaryResult::Cancel;
        }
        self.fingerprint = Some(wanted);
        self.retried = true;
        VaryResult::Other
    }
}
