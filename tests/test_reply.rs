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

//! End-to-end exercises of the reply pipeline against the in-memory store,
//! a scripted forwarder and a collecting downstream node.

use cachefront::access::{AclContext, AclEngine, Answer};
use cachefront::config::ConfigSnapshot;
use cachefront::errors::DefaultErrorFactory;
use cachefront::key::CacheKey;
use cachefront::memory::MemStore;
use cachefront::request::Request;
use cachefront::storage::{EntryMeta, EntryRef, FillHandler, MemStatus, Store};
use cachefront::{Forwarder, LogTag, ReplyEnv, ReplyState, StreamNode, StreamStatus};

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use pingora_error::Result;
use pingora_http::{RequestHeader, ResponseHeader};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Replays canned upstream responses into the entry it is handed.
struct ScriptedForwarder {
    responses: Mutex<VecDeque<(ResponseHeader, Bytes, EntryMeta)>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedForwarder {
    fn new() -> Self {
        ScriptedForwarder {
            responses: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(10),
        }
    }

    fn push(&self, reply: ResponseHeader, body: &[u8], meta: EntryMeta) {
        self.responses
            .lock()
            .unwrap()
            .push_back((reply, Bytes::copy_from_slice(body), meta));
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Forwarder for ScriptedForwarder {
    async fn start(
        &self,
        _request: RequestHeader,
        _entry: EntryRef,
        mut fill: FillHandler,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (reply, body, meta) = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("forwarder called without a scripted response");
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fill.set_reply(reply, meta).unwrap();
            if body.is_empty() {
                fill.finish().await.unwrap();
            } else {
                fill.write_body(body, true).await.unwrap();
            }
        });
        Ok(())
    }
}

/// Downstream node that records what it is sent.
#[derive(Default)]
struct CollectNode {
    reply: Option<ResponseHeader>,
    body: Vec<u8>,
    ended: bool,
}

#[async_trait]
impl StreamNode for CollectNode {
    async fn write_headers(&mut self, reply: Box<ResponseHeader>) -> Result<()> {
        assert!(self.reply.is_none(), "headers delivered twice");
        self.reply = Some(*reply);
        Ok(())
    }

    async fn write_body(&mut self, data: Bytes, end: bool) -> Result<()> {
        assert!(!self.ended, "body after end");
        assert!(self.reply.is_some(), "body before headers");
        self.body.extend_from_slice(&data);
        if end {
            self.ended = true;
        }
        Ok(())
    }
}

fn env_with(store: Arc<MemStore>, fwd: Arc<ScriptedForwarder>, config: ConfigSnapshot) -> ReplyEnv {
    ReplyEnv {
        store,
        forwarder: fwd,
        error_factory: Arc::new(DefaultErrorFactory),
        acl: None,
        ip_cache: None,
        peers: None,
        config: Arc::new(config),
    }
}

fn get_request(uri: &str, headers: &[(&str, &str)]) -> Arc<Request> {
    request_with_method("GET", uri, headers)
}

fn request_with_method(method: &str, uri: &str, headers: &[(&str, &str)]) -> Arc<Request> {
    let parsed: http::Uri = uri.parse().unwrap();
    let path = parsed
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .as_bytes();
    let mut header = RequestHeader::build(method, path, None).unwrap();
    header.set_uri(parsed);
    for (k, v) in headers {
        header.insert_header(k.to_string(), *v).unwrap();
    }
    Arc::new(Request::new(header))
}

fn reply_200(headers: &[(&str, &str)], body_len: usize) -> ResponseHeader {
    let mut reply = ResponseHeader::build(200, None).unwrap();
    reply.insert_header("Content-Length", body_len).unwrap();
    for (k, v) in headers {
        reply.insert_header(k.to_string(), *v).unwrap();
    }
    reply
}

fn meta(age_sec: u64, last_modified: Option<SystemTime>) -> EntryMeta {
    EntryMeta {
        timestamp: SystemTime::now() - Duration::from_secs(age_sec),
        last_modified,
        expires: None,
    }
}

async fn drive(env: ReplyEnv, request: Arc<Request>) -> (ReplyState, CollectNode, StreamStatus) {
    let mut state = ReplyState::new(env, request);
    let mut node = CollectNode::default();
    let status = state.run(&mut node).await;
    (state, node, status)
}

// Scenario 1: fresh memory hit
#[tokio::test]
async fn test_fresh_memory_hit() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/a");
    store
        .admit(
            &key,
            reply_200(&[("Cache-Control", "max-age=3600")], 4),
            meta(30, None),
            b"body",
        )
        .await;

    let config = ConfigSnapshot {
        hostname: "cache1".into(),
        ..Default::default()
    };
    let env = env_with(store.clone(), Arc::new(ScriptedForwarder::new()), config);
    let (state, node, status) = drive(env, get_request("http://origin.example/a", &[])).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpMemHit);
    let reply = node.reply.unwrap();
    assert_eq!(reply.status.as_u16(), 200);
    let age: u64 = reply
        .headers
        .get("age")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((29..=31).contains(&age), "age {age} out of range");
    let cache_status = reply.headers.get("cache-status").unwrap().to_str().unwrap();
    assert!(cache_status.starts_with("cache1;hit"), "{cache_status}");
    assert_eq!(node.body, b"body");
    assert!(node.ended);
}

// Scenario 2: conditional hit, If-None-Match matches
#[tokio::test]
async fn test_conditional_hit_inm_match() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/a");
    store
        .admit(
            &key,
            reply_200(
                &[("Cache-Control", "max-age=3600"), ("ETag", "\"v1\"")],
                4,
            ),
            meta(30, None),
            b"body",
        )
        .await;

    let env = env_with(
        store.clone(),
        Arc::new(ScriptedForwarder::new()),
        ConfigSnapshot::default(),
    );
    let request = get_request("http://origin.example/a", &[("If-None-Match", "\"v1\"")]);
    let (state, node, status) = drive(env, request).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpInmHit);
    let reply = node.reply.unwrap();
    assert_eq!(reply.status.as_u16(), 304);
    assert!(reply.headers.get("date").is_some());
    assert!(node.body.is_empty());
}

fn stale_entry_reply(etag: Option<&str>) -> ResponseHeader {
    let mut headers = vec![
        ("Cache-Control", "max-age=60"),
        ("Last-Modified", "Fri, 26 Mar 2010 00:05:00 GMT"),
    ];
    if let Some(etag) = etag {
        headers.push(("ETag", etag));
    }
    reply_200(&headers, 8)
}

fn stale_lastmod() -> SystemTime {
    httpdate::parse_http_date("Fri, 26 Mar 2010 00:05:00 GMT").unwrap()
}

// Scenario 3: stale revalidation where the origin says 304
#[tokio::test]
async fn test_revalidation_not_modified() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/b");
    store
        .admit(
            &key,
            stale_entry_reply(Some("\"v1\"")),
            meta(600, Some(stale_lastmod())),
            b"old-body",
        )
        .await;

    let fwd = Arc::new(ScriptedForwarder::new());
    let mut not_modified = ResponseHeader::build(304, None).unwrap();
    not_modified
        .insert_header("Cache-Control", "max-age=120")
        .unwrap();
    fwd.push(not_modified, b"", meta(0, Some(stale_lastmod())));

    let env = env_with(store.clone(), fwd.clone(), ConfigSnapshot::default());
    let (state, node, status) = drive(env, get_request("http://origin.example/b", &[])).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpRefreshUnmodified);
    assert_eq!(fwd.calls(), 1);
    // the client-visible body is byte-identical to the stored entry
    assert_eq!(node.body, b"old-body");
    assert_eq!(node.reply.unwrap().status.as_u16(), 200);

    // the stored entry was refreshed in place
    let entry = store.lookup_public(&key).await.unwrap().unwrap();
    let refreshed = entry.freshest_reply().unwrap();
    assert_eq!(
        refreshed.headers.get("cache-control").unwrap(),
        "max-age=120"
    );
    assert!(entry.meta().timestamp > SystemTime::now() - Duration::from_secs(30));
}

// A client that itself sent IMS gets the origin's 304 forwarded
#[tokio::test]
async fn test_revalidation_forwards_304_to_conditional_client() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/b2");
    store
        .admit(
            &key,
            stale_entry_reply(None),
            meta(600, Some(stale_lastmod())),
            b"old-body",
        )
        .await;

    let fwd = Arc::new(ScriptedForwarder::new());
    fwd.push(
        ResponseHeader::build(304, None).unwrap(),
        b"",
        meta(0, Some(stale_lastmod())),
    );

    let env = env_with(store.clone(), fwd, ConfigSnapshot::default());
    // the client's copy is as new as ours
    let request = get_request(
        "http://origin.example/b2",
        &[("If-Modified-Since", "Sat, 27 Mar 2010 00:00:00 GMT")],
    );
    let (state, node, status) = drive(env, request).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpRefreshUnmodified);
    assert_eq!(node.reply.unwrap().status.as_u16(), 304);
    assert!(node.body.is_empty());
}

// A revalidation answered with a fresh 200 forwards the new entity
#[tokio::test]
async fn test_revalidation_modified() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/bm");
    store
        .admit(
            &key,
            stale_entry_reply(None),
            meta(600, Some(stale_lastmod())),
            b"old-body",
        )
        .await;

    let fwd = Arc::new(ScriptedForwarder::new());
    let mut fresh = reply_200(&[("Cache-Control", "max-age=60")], 8);
    fresh
        .insert_header("Date", httpdate::fmt_http_date(SystemTime::now()))
        .unwrap();
    fwd.push(fresh, b"new-body", meta(0, None));

    let env = env_with(store.clone(), fwd, ConfigSnapshot::default());
    let (state, node, status) = drive(env, get_request("http://origin.example/bm", &[])).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpRefreshModified);
    assert_eq!(node.reply.unwrap().status.as_u16(), 200);
    assert_eq!(node.body, b"new-body");
}

// A "fresh" reply that is older than the cached one loses to the cache
#[tokio::test]
async fn test_revalidation_older_date_ignored() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/bo");
    let mut stored = stale_entry_reply(None);
    stored
        .insert_header("Date", "Sat, 27 Mar 2010 00:00:00 GMT")
        .unwrap();
    store
        .admit(&key, stored, meta(600, Some(stale_lastmod())), b"old-body")
        .await;

    let fwd = Arc::new(ScriptedForwarder::new());
    let mut suspect = reply_200(&[], 10);
    suspect
        .insert_header("Date", "Thu, 25 Mar 2010 00:00:00 GMT")
        .unwrap();
    fwd.push(suspect, b"very-stale", meta(0, None));

    let env = env_with(store, fwd, ConfigSnapshot::default());
    let (state, node, status) = drive(env, get_request("http://origin.example/bo", &[])).await;

    assert_eq!(status, StreamStatus::Complete);
    assert!(state.ignored_fresh_reply());
    assert_eq!(node.body, b"old-body");
    assert_eq!(node.reply.unwrap().status.as_u16(), 200);
}

// Scenario 4: stale revalidation, origin 500, policy keeps the old copy
#[tokio::test]
async fn test_revalidation_error_serves_old() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/b3");
    store
        .admit(
            &key,
            stale_entry_reply(None),
            meta(600, Some(stale_lastmod())),
            b"old-body",
        )
        .await;

    let fwd = Arc::new(ScriptedForwarder::new());
    let mut err = ResponseHeader::build(500, None).unwrap();
    err.insert_header("Content-Length", "5").unwrap();
    fwd.push(err, b"oops!", meta(0, None));

    let env = env_with(store.clone(), fwd, ConfigSnapshot::default());
    let (state, node, status) = drive(env, get_request("http://origin.example/b3", &[])).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpRefreshFailOld);
    assert_eq!(node.reply.unwrap().status.as_u16(), 200);
    assert_eq!(node.body, b"old-body");
}

// The same upstream failure with fail_on_validation_err forwards the error
#[tokio::test]
async fn test_revalidation_error_forwarded_by_policy() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/b4");
    store
        .admit(
            &key,
            stale_entry_reply(None),
            meta(600, Some(stale_lastmod())),
            b"old-body",
        )
        .await;

    let fwd = Arc::new(ScriptedForwarder::new());
    let mut err = ResponseHeader::build(502, None).unwrap();
    err.insert_header("Content-Length", "3").unwrap();
    fwd.push(err, b"bad", meta(0, None));

    let env = env_with(store.clone(), fwd, ConfigSnapshot::default());
    let mut header = RequestHeader::build("GET", b"/b4", None).unwrap();
    header.set_uri("http://origin.example/b4".parse::<http::Uri>().unwrap());
    header.insert_header("Accept", "*/*").unwrap();
    let mut request = Request::new(header);
    request.flags.fail_on_validation_err = true;
    let (state, node, status) = drive(env, Arc::new(request)).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpRefreshFailErr);
    assert_eq!(node.reply.unwrap().status.as_u16(), 502);
    assert_eq!(node.body, b"bad");
}

// Scenario 5: PURGE evicts GET and HEAD variants; repeat purge is a 404
#[tokio::test]
async fn test_purge_then_miss() {
    init_log();
    let store = Arc::new(MemStore::new());
    let get_key = CacheKey::new(&Method::GET, "http://origin.example/c");
    let head_key = get_key.with_method(&Method::HEAD);
    store
        .admit(
            &get_key,
            reply_200(&[("Cache-Control", "max-age=3600")], 4),
            meta(1, None),
            b"body",
        )
        .await;
    store
        .admit(
            &head_key,
            reply_200(&[("Cache-Control", "max-age=3600")], 0),
            meta(1, None),
            b"",
        )
        .await;

    let config = ConfigSnapshot {
        enable_purge: true,
        ..Default::default()
    };
    let fwd = Arc::new(ScriptedForwarder::new());
    let env = env_with(store.clone(), fwd.clone(), config.clone());

    let request = request_with_method("PURGE", "http://origin.example/c", &[]);
    let (state, node, status) = drive(env.clone(), request).await;
    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.purge_status(), Some(http::StatusCode::OK));
    assert_eq!(node.reply.unwrap().status.as_u16(), 200);
    assert!(store.lookup_public(&get_key).await.unwrap().is_none());
    assert!(store.lookup_public(&head_key).await.unwrap().is_none());

    // a subsequent GET is a plain miss
    fwd.push(reply_200(&[], 5), b"fresh", meta(0, None));
    let (state, node, status) = drive(env.clone(), get_request("http://origin.example/c", &[])).await;
    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpMiss);
    assert_eq!(node.body, b"fresh");

    // purging again finds nothing
    let request = request_with_method("PURGE", "http://origin.example/c", &[]);
    let (state, node, _status) = drive(env, request).await;
    assert_eq!(state.purge_status(), Some(http::StatusCode::NOT_FOUND));
    assert_eq!(node.reply.unwrap().status.as_u16(), 404);
}

// PURGE against a proxy that does not allow it
#[tokio::test]
async fn test_purge_disabled() {
    init_log();
    let store = Arc::new(MemStore::new());
    let env = env_with(
        store,
        Arc::new(ScriptedForwarder::new()),
        ConfigSnapshot::default(),
    );
    let request = request_with_method("PURGE", "http://origin.example/c", &[]);
    let (state, node, status) = drive(env, request).await;
    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpDenied);
    assert_eq!(node.reply.unwrap().status.as_u16(), 403);
}

// Scenario 6: only-if-cached without a cached object
#[tokio::test]
async fn test_only_if_cached_miss() {
    init_log();
    let store = Arc::new(MemStore::new());
    let fwd = Arc::new(ScriptedForwarder::new());
    let env = env_with(store, fwd.clone(), ConfigSnapshot::default());
    let request = get_request(
        "http://origin.example/d",
        &[("Cache-Control", "only-if-cached")],
    );
    let (_state, node, status) = drive(env, request).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(node.reply.unwrap().status.as_u16(), 504);
    // no upstream attempt was made
    assert_eq!(fwd.calls(), 0);
}

// B1: a stale entry without Last-Modified cannot revalidate, it refetches
#[tokio::test]
async fn test_stale_without_lastmod_is_miss() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/e");
    store
        .admit(&key, reply_200(&[], 3), meta(600, None), b"old")
        .await;

    let fwd = Arc::new(ScriptedForwarder::new());
    fwd.push(reply_200(&[], 3), b"new", meta(0, None));
    let env = env_with(store, fwd.clone(), ConfigSnapshot::default());
    let (state, node, status) = drive(env, get_request("http://origin.example/e", &[])).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpMiss);
    assert_eq!(fwd.calls(), 1);
    assert_eq!(node.body, b"new");
}

// A client no-cache skips the store entirely
#[tokio::test]
async fn test_client_no_cache() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/f");
    store
        .admit(
            &key,
            reply_200(&[("Cache-Control", "max-age=3600")], 3),
            meta(1, None),
            b"old",
        )
        .await;

    let fwd = Arc::new(ScriptedForwarder::new());
    fwd.push(reply_200(&[], 3), b"new", meta(0, None));
    let env = env_with(store, fwd.clone(), ConfigSnapshot::default());
    let request = get_request("http://origin.example/f", &[("Cache-Control", "no-cache")]);
    let (state, node, status) = drive(env, request).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpMiss);
    assert_eq!(state.first_store_lookup(), Some("no-cache"));
    assert_eq!(node.body, b"new");
}

// Negative hits are served, tagged as such
#[tokio::test]
async fn test_negative_hit() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/g");
    let mut reply = ResponseHeader::build(404, None).unwrap();
    reply.insert_header("Content-Length", "9").unwrap();
    reply.insert_header("Cache-Control", "max-age=60").unwrap();
    store.admit(&key, reply, meta(1, None), b"not found").await;
    store.get_mem_entry(&key).unwrap().set_negative(true);

    let env = env_with(
        store,
        Arc::new(ScriptedForwarder::new()),
        ConfigSnapshot::default(),
    );
    let (state, node, status) = drive(env, get_request("http://origin.example/g", &[])).await;
    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpNegativeHit);
    assert_eq!(node.reply.unwrap().status.as_u16(), 404);
    assert_eq!(node.body, b"not found");
}

// An entry on disk is a plain TCP_HIT, not a memory hit
#[tokio::test]
async fn test_disk_hit_tag() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/h");
    store
        .admit(
            &key,
            reply_200(&[("Cache-Control", "max-age=3600")], 4),
            meta(1, None),
            b"body",
        )
        .await;
    store
        .get_mem_entry(&key)
        .unwrap()
        .set_mem_status(MemStatus::OnDisk);

    let env = env_with(
        store,
        Arc::new(ScriptedForwarder::new()),
        ConfigSnapshot::default(),
    );
    let (state, _node, status) = drive(env, get_request("http://origin.example/h", &[])).await;
    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpHit);
}

// Queued redirects answer immediately, nothing is fetched
#[tokio::test]
async fn test_queued_redirect() {
    init_log();
    let store = Arc::new(MemStore::new());
    let fwd = Arc::new(ScriptedForwarder::new());
    let env = env_with(store, fwd.clone(), ConfigSnapshot::default());

    let mut header = RequestHeader::build("GET", b"/i", None).unwrap();
    header.set_uri("http://origin.example/i".parse::<http::Uri>().unwrap());
    let mut request = Request::new(header);
    request.redirect = Some(cachefront::request::QueuedRedirect {
        status: http::StatusCode::FOUND,
        location: "http://elsewhere.example/".to_string(),
    });
    let (state, node, status) = drive(env, Arc::new(request)).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpRedirect);
    let reply = node.reply.unwrap();
    assert_eq!(reply.status.as_u16(), 302);
    assert_eq!(
        reply.headers.get("location").unwrap(),
        "http://elsewhere.example/"
    );
    assert_eq!(fwd.calls(), 0);
}

// TRACE with Max-Forwards: 0 echoes the request
#[tokio::test]
async fn test_trace_max_forwards_zero() {
    init_log();
    let store = Arc::new(MemStore::new());
    let env = env_with(
        store,
        Arc::new(ScriptedForwarder::new()),
        ConfigSnapshot::default(),
    );
    let request = request_with_method(
        "TRACE",
        "http://origin.example/j",
        &[("Max-Forwards", "0"), ("X-Probe", "1")],
    );
    let (_state, node, status) = drive(env, request).await;

    assert_eq!(status, StreamStatus::Complete);
    let reply = node.reply.unwrap();
    assert_eq!(reply.status.as_u16(), 200);
    assert_eq!(reply.headers.get("content-type").unwrap(), "message/http");
    let body = String::from_utf8(node.body).unwrap();
    assert!(body.starts_with("TRACE http://origin.example/j"));
    assert!(body.contains("X-Probe"));
}

// A detected forwarding loop is refused
#[tokio::test]
async fn test_loop_detected() {
    init_log();
    let store = Arc::new(MemStore::new());
    let fwd = Arc::new(ScriptedForwarder::new());
    let env = env_with(store, fwd.clone(), ConfigSnapshot::default());
    let mut header = RequestHeader::build("GET", b"/k", None).unwrap();
    header.set_uri("http://origin.example/k".parse::<http::Uri>().unwrap());
    let mut request = Request::new(header);
    request.flags.loop_detected = true;
    let (_state, node, status) = drive(env, Arc::new(request)).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(node.reply.unwrap().status.as_u16(), 403);
    assert_eq!(fwd.calls(), 0);
}

// Vary: the primary slot redirects the lookup to the variant slot
#[tokio::test]
async fn test_vary_variant_hit() {
    init_log();
    let store = Arc::new(MemStore::new());
    let base_key = CacheKey::new(&Method::GET, "http://origin.example/v");

    let request = get_request("http://origin.example/v", &[("Accept-Encoding", "gzip")]);
    let varying = reply_200(
        &[("Cache-Control", "max-age=3600"), ("Vary", "Accept-Encoding")],
        7,
    );
    // primary slot: a variant marker carrying the Vary header
    store
        .admit(&base_key, varying.clone(), meta(1, None), b"plain!!")
        .await;
    // variant slot for Accept-Encoding: gzip
    let fingerprint = cachefront::vary::request_variance(&varying, &request.header)
        .unwrap()
        .unwrap();
    let mut variant_key = base_key.clone();
    variant_key.set_variance_key(fingerprint);
    store
        .admit(&variant_key, varying.clone(), meta(1, None), b"gzip!!!")
        .await;

    let env = env_with(
        store,
        Arc::new(ScriptedForwarder::new()),
        ConfigSnapshot::default(),
    );
    let (state, node, status) = drive(env, request).await;
    assert_eq!(status, StreamStatus::Complete);
    assert!(state.tag().is_hit());
    assert_eq!(node.body, b"gzip!!!");
}

// Two concurrent misses for one key share a single upstream fetch
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_collapsed_miss() {
    init_log();
    let store = Arc::new(MemStore::new());
    let fwd = Arc::new(ScriptedForwarder::new());
    fwd.push(
        reply_200(&[("Cache-Control", "max-age=60")], 6),
        b"shared",
        meta(0, None),
    );
    let config = ConfigSnapshot {
        collapsed_forwarding: true,
        ..Default::default()
    };
    let env = env_with(store, fwd.clone(), config);

    let env_a = env.clone();
    let leader = tokio::spawn(async move {
        drive(env_a, get_request("http://origin.example/cf", &[])).await
    });
    // let the leader create and offer its entry
    tokio::time::sleep(Duration::from_millis(3)).await;
    let env_b = env.clone();
    let follower = tokio::spawn(async move {
        drive(env_b, get_request("http://origin.example/cf", &[])).await
    });

    let (state_a, node_a, status_a) = leader.await.unwrap();
    let (state_b, node_b, status_b) = follower.await.unwrap();

    assert_eq!(status_a, StreamStatus::Complete);
    assert_eq!(status_b, StreamStatus::Complete);
    assert_eq!(node_a.body, b"shared");
    assert_eq!(node_b.body, b"shared");
    assert_eq!(state_a.tag(), LogTag::TcpMiss);
    // the follower was served from the leader's in-flight entry
    assert!(state_b.tag().is_hit(), "follower tag {:?}", state_b.tag());
    // exactly one upstream fetch
    assert_eq!(fwd.calls(), 1);
}

// P1: no store locks leak across a request, hit or revalidation
#[tokio::test]
async fn test_no_handle_leaks() {
    init_log();
    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/leak");
    store
        .admit(
            &key,
            stale_entry_reply(None),
            meta(600, Some(stale_lastmod())),
            b"old-body",
        )
        .await;

    let fwd = Arc::new(ScriptedForwarder::new());
    fwd.push(
        ResponseHeader::build(304, None).unwrap(),
        b"",
        meta(0, Some(stale_lastmod())),
    );
    let env = env_with(store.clone(), fwd, ConfigSnapshot::default());
    {
        let (state, _node, status) =
            drive(env, get_request("http://origin.example/leak", &[])).await;
        assert_eq!(status, StreamStatus::Complete);
        drop(state);
    }
    assert_eq!(store.lock_count(&key), 0);
}

// Reply access denial turns into a 403 through the same stream
#[tokio::test]
async fn test_reply_access_denied() {
    init_log();
    struct DenyAll;
    #[async_trait]
    impl AclEngine for DenyAll {
        async fn check(&self, _list: &str, _ctx: &AclContext<'_>) -> Answer {
            Answer::Denied(None)
        }
    }

    let store = Arc::new(MemStore::new());
    let key = CacheKey::new(&Method::GET, "http://origin.example/deny");
    store
        .admit(
            &key,
            reply_200(&[("Cache-Control", "max-age=3600")], 4),
            meta(1, None),
            b"body",
        )
        .await;

    let config = ConfigSnapshot {
        reply_access: Some("reply".into()),
        ..Default::default()
    };
    let mut env = env_with(store, Arc::new(ScriptedForwarder::new()), config);
    env.acl = Some(Arc::new(DenyAll));
    let (state, node, status) = drive(env, get_request("http://origin.example/deny", &[])).await;

    assert_eq!(status, StreamStatus::Complete);
    assert_eq!(state.tag(), LogTag::TcpDeniedReply);
    assert_eq!(node.reply.unwrap().status.as_u16(), 403);
    assert!(!node.body.is_empty());
}

// Detaching stops the state at its next suspension point
#[tokio::test]
async fn test_detach() {
    init_log();
    let store = Arc::new(MemStore::new());
    let env = env_with(
        store,
        Arc::new(ScriptedForwarder::new()),
        ConfigSnapshot::default(),
    );
    let mut state = ReplyState::new(env, get_request("http://origin.example/x", &[]));
    state.detach_handle().detach();
    let mut node = CollectNode::default();
    let status = state.run(&mut node).await;
    assert_eq!(status, StreamStatus::Failed);
    assert!(node.reply.is_none());
}

// HEAD hits deliver headers only
#[tokio::test]
async fn test_head_hit_no_body() {
    init_log();
    let store = Arc::new(MemStore::new());
    let get_key = CacheKey::new(&Method::HEAD, "http://origin.example/hd");
    store
        .admit(
            &get_key,
            reply_200(&[("Cache-Control", "max-age=3600")], 4),
            meta(1, None),
            b"body",
        )
        .await;

    let env = env_with(
        store,
        Arc::new(ScriptedForwarder::new()),
        ConfigSnapshot::default(),
    );
    let request = request_with_method("HEAD", "http://origin.example/hd", &[]);
    let (state, node, status) = drive(env, request).await;

    assert_eq!(status, StreamStatus::Complete);
    assert!(state.tag().is_hit());
    assert_eq!(node.reply.unwrap().status.as_u16(), 200);
    assert!(node.body.is_empty());
    assert!(node.ended);
}
