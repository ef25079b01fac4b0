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

//! PURGE handling: evict entries by URL x method x vary and answer with a
//! synthetic reply through the normal stream.

use crate::errors::{ErrorKind, SERVER_NAME};
use crate::key::CacheKey;
use crate::storage::EntryMeta;
use crate::{LogTag, ReplyState};

use bytes::Bytes;
use http::{header, Method, StatusCode};
use log::debug;
use once_cell::sync::Lazy;
use pingora_error::Result;
use pingora_http::ResponseHeader;

fn gen_purge_response(code: u16) -> ResponseHeader {
    let mut resp = ResponseHeader::build(code, Some(3)).unwrap();
    resp.insert_header(header::SERVER, SERVER_NAME).unwrap();
    resp.insert_header(header::CONTENT_LENGTH, 0).unwrap();
    resp.insert_header(header::CACHE_CONTROL, "private, no-store")
        .unwrap();
    resp
}

static OK: Lazy<ResponseHeader> = Lazy::new(|| gen_purge_response(200));
static NOT_FOUND: Lazy<ResponseHeader> = Lazy::new(|| gen_purge_response(404));

impl ReplyState {
    /// Entry point for `PURGE` requests.
    pub(crate) async fn purge_request(&mut self) -> Result<()> {
        if !self.env.config.enable_purge {
            debug!("purge not enabled");
            self.update_tag(LogTag::TcpDenied);
            return self
                .set_reply_to_error(ErrorKind::AccessDenied, StatusCode::FORBIDDEN)
                .await;
        }

        // release the IP cache entries for the host
        if let (Some(cache), Some(host)) = (self.env.ip_cache.as_deref(), self.request.host()) {
            cache.invalidate(host);
        }

        self.purge_do_purge().await
    }

    async fn purge_do_purge(&mut self) -> Result<()> {
        let base = self.cache_key();

        let get_key = base.with_method(&Method::GET);
        let mut first_found = false;
        if let Some(entry) = self.env.store.lookup_public(&get_key).await? {
            // special entries are off limits to clients
            if entry.flags().special {
                debug!("refusing to purge a special entry");
                self.update_tag(LogTag::TcpDenied);
                return self
                    .set_reply_to_error(ErrorKind::AccessDenied, StatusCode::FORBIDDEN)
                    .await;
            }
            first_found = true;
            self.purge_entry(&get_key, &Method::GET).await;
        }

        self.detail_store_lookup(if first_found { "match" } else { "mismatch" });

        let head_key = base.with_method(&Method::HEAD);
        if self.env.store.lookup_public(&head_key).await?.is_some() {
            self.purge_entry(&head_key, &Method::HEAD).await;
        }

        // for Vary, also release the base URI if the request carried a
        // variant fingerprint
        if self.vary.fingerprint().is_some() {
            let plain = base.without_variance();
            for method in [Method::GET, Method::HEAD] {
                let key = plain.with_method(&method);
                if self.env.store.lookup_public(&key).await?.is_some() {
                    self.purge_entry(&key, &method).await;
                }
            }
        }

        let status = self.purge_status.unwrap_or(StatusCode::NOT_FOUND);
        self.purge_status = Some(status);

        // a new entry to hold the reply written to the client
        let reply = if status == StatusCode::OK {
            (*OK).clone()
        } else {
            (*NOT_FOUND).clone()
        };
        self.install_synthetic_reply(reply, Bytes::new(), EntryMeta::default())
            .await
    }

    /// Evict one slot and report it to peers. Infallible by design: purge
    /// results are counted, not propagated.
    async fn purge_entry(&mut self, key: &CacheKey, method: &Method) {
        debug!("purging {} '{}'", method, key.uri());
        if let Some(peers) = self.env.peers.as_deref() {
            peers.htcp_clear(key.uri(), method);
        }
        if self.env.store.evict_if_found(key).await {
            self.purge_status = Some(StatusCode::OK);
        }
    }
}
