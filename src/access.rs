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

//! Reply access enforcement
//!
//! Runs after the reply headers are built and before anything reaches the
//! client. Our own responses and bodyless status messages are never blocked.

use crate::config::ConfigSnapshot;
use crate::errors::ErrorKind;
use crate::headers::reply_body_size;
use crate::LogTag;

use async_trait::async_trait;
use http::StatusCode;
use pingora_http::{RequestHeader, ResponseHeader};

/// Result of an access-control evaluation. The engine may compute it
/// asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Allowed,
    /// Denied; optionally naming the deny_info page to serve
    Denied(Option<ErrorKind>),
}

/// What the gate hands to the engine.
pub struct AclContext<'a> {
    pub request: &'a RequestHeader,
    pub reply: &'a ResponseHeader,
    pub tag: LogTag,
}

/// External access-control evaluation.
#[async_trait]
pub trait AclEngine: Send + Sync {
    async fn check(&self, list: &str, ctx: &AclContext<'_>) -> Answer;
}

/// What the gate decided to do with the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Allow,
    /// 403 TOO_BIG
    TooBig,
    /// 403 with the named page
    Deny(ErrorKind),
}

/// Responses with no body have no content-type for the usual reply ACLs to
/// match on; blocking them only produces mysterious breakage.
pub fn always_allow_response(status: StatusCode) -> bool {
    matches!(status.as_u16(), 100 | 101 | 102 | 204 | 304)
}

/// Run the reply access checks.
pub async fn check_reply_access(
    config: &ConfigSnapshot,
    acl: Option<&dyn AclEngine>,
    ctx: &AclContext<'_>,
) -> GateOutcome {
    // never block our own responses or HTTP status messages
    if matches!(ctx.tag, LogTag::TcpDenied | LogTag::TcpDeniedReply)
        || always_allow_response(ctx.reply.status)
    {
        return GateOutcome::Allow;
    }

    if config.max_reply_body_size > 0 {
        if let Some(size) = reply_body_size(&ctx.request.method, ctx.reply) {
            if size > config.max_reply_body_size {
                return GateOutcome::TooBig;
            }
        }
    }

    // absent access controls permit by default
    let Some(list) = config.reply_access.as_deref() else {
        return GateOutcome::Allow;
    };
    let Some(acl) = acl else {
        return GateOutcome::Allow;
    };

    match acl.check(list, ctx).await {
        Answer::Allowed => GateOutcome::Allow,
        Answer::Denied(page) => GateOutcome::Deny(page.unwrap_or(ErrorKind::AccessDenied)),
    }
}
