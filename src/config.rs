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

//! Immutable configuration snapshot for the reply pipeline
//!
//! Configuration loading lives outside this crate. A [ConfigSnapshot] is read
//! only for the lifetime of a reply state so that every decision a request
//! makes is against one consistent view.

use serde::Deserialize;

use crate::freshness::RefreshRule;

/// The configuration knobs the reply pipeline reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigSnapshot {
    /// Hostname advertised in `Via` and `Cache-Status`
    pub hostname: String,
    /// Allow concurrent revalidations of one key to share a single fetch
    pub collapsed_forwarding: bool,
    /// Accept `PURGE` requests
    pub enable_purge: bool,
    /// Serve every classified entry as a hit, never contacting upstreams
    pub offline_mode: bool,
    /// Keep connections alive after error responses
    pub error_pconns: bool,
    /// Keep client connections alive at all
    pub client_pconns: bool,
    /// Advertise ourselves as the origin: overwrite `Date`, keep the original
    /// under `X-Origin-Date`
    pub act_as_origin: bool,
    /// Allow connection-oriented auth schemes (NTLM/Negotiate/Kerberos) to
    /// pass through
    pub connection_auth: bool,
    /// Largest reply body we are willing to relay, 0 = unlimited
    pub max_reply_body_size: u64,
    /// Name of the reply access list to evaluate, if any
    pub reply_access: Option<String>,
    /// Heuristic freshness rules, first match wins
    pub refresh_rules: Vec<RefreshRule>,
    /// The process is draining; close connections after the current reply
    pub shutting_down: bool,
    /// File descriptors are running out; shed keep-alive
    pub fd_pressure: bool,
    /// The listening port this request arrived on is gone (reconfigure)
    pub listening_port_closed: bool,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        ConfigSnapshot {
            hostname: "localhost".to_string(),
            collapsed_forwarding: false,
            enable_purge: false,
            offline_mode: false,
            error_pconns: false,
            client_pconns: true,
            act_as_origin: false,
            connection_auth: true,
            max_reply_body_size: 0,
            reply_access: None,
            refresh_rules: Vec::new(),
            shutting_down: false,
            fd_pressure: false,
            listening_port_closed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = ConfigSnapshot::default();
        assert!(!conf.enable_purge);
        assert!(conf.client_pconns);
        assert_eq!(conf.max_reply_body_size, 0);
    }

    #[test]
    fn test_deserialize_partial() {
        let conf: ConfigSnapshot =
            serde_json::from_str(r#"{"hostname": "cache1", "enable_purge": true}"#).unwrap();
        assert_eq!(conf.hostname, "cache1");
        assert!(conf.enable_purge);
        assert!(!conf.collapsed_forwarding);
    }
}
