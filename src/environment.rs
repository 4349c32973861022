// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Environment (C3): a typed, validated view over session/auth/channel/pool
//! settings, matching the key set in `spec.md` §6.
//!
//! Modeled on `SftpBuilder` in the teacher's `services::sftp::backend`:
//! fluent `&mut self -> &mut Self` setters plus a `from_map` constructor for
//! the string-valued subset of keys.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ExceptionFactory;

const DEFAULT_CLIENT_CONNECTION_COUNT: usize = 1;

/// Typed, validated environment. Cheap to clone: identity-bearing
/// sub-objects (the exception factory) are shared by `Arc`, everything else
/// is plain data, matching `spec.md` §3's cloning invariant — the pool must
/// be insulated from later mutation of the caller's original environment.
#[derive(Clone)]
pub struct Environment {
    username: Option<String>,
    password: Option<String>,
    connect_timeout: Option<Duration>,
    timeout: Option<Duration>,
    client_version: Option<String>,
    host_key_alias: Option<String>,
    server_alive_interval: Option<Duration>,
    server_alive_count_max: Option<u32>,
    config: HashMap<String, String>,
    known_hosts: Option<String>,
    agent_forwarding: bool,
    filename_encoding: Option<String>,
    default_dir: Option<String>,
    client_connection_count: usize,
    client_connection_wait_timeout: Duration,
    exception_factory: Option<Arc<dyn ExceptionFactory>>,
}

impl Default for Environment {
    fn default() -> Self {
        Environment {
            username: None,
            password: None,
            connect_timeout: None,
            timeout: None,
            client_version: None,
            host_key_alias: None,
            server_alive_interval: None,
            server_alive_count_max: None,
            config: HashMap::new(),
            known_hosts: None,
            agent_forwarding: false,
            filename_encoding: None,
            default_dir: None,
            client_connection_count: DEFAULT_CLIENT_CONNECTION_COUNT,
            client_connection_wait_timeout: Duration::ZERO,
            exception_factory: None,
        }
    }
}

impl Debug for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Never print the password.
        f.debug_struct("Environment")
            .field("username", &self.username)
            .field("default_dir", &self.default_dir)
            .field("client_connection_count", &self.client_connection_count)
            .field(
                "client_connection_wait_timeout",
                &self.client_connection_wait_timeout,
            )
            .finish()
    }
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_username(&mut self, username: impl Into<String>) -> &mut Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(&mut self, password: impl Into<String>) -> &mut Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_connect_timeout(&mut self, d: Duration) -> &mut Self {
        self.connect_timeout = Some(d);
        self
    }

    pub fn with_timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = Some(d);
        self
    }

    pub fn with_client_version(&mut self, v: impl Into<String>) -> &mut Self {
        self.client_version = Some(v.into());
        self
    }

    pub fn with_host_key_alias(&mut self, v: impl Into<String>) -> &mut Self {
        self.host_key_alias = Some(v.into());
        self
    }

    pub fn with_server_alive_interval(&mut self, d: Duration) -> &mut Self {
        self.server_alive_interval = Some(d);
        self
    }

    pub fn with_server_alive_count_max(&mut self, n: u32) -> &mut Self {
        self.server_alive_count_max = Some(n);
        self
    }

    pub fn with_config(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_known_hosts(&mut self, path: impl Into<String>) -> &mut Self {
        self.known_hosts = Some(path.into());
        self
    }

    pub fn with_agent_forwarding(&mut self, enabled: bool) -> &mut Self {
        self.agent_forwarding = enabled;
        self
    }

    pub fn with_filename_encoding(&mut self, charset: impl Into<String>) -> &mut Self {
        self.filename_encoding = Some(charset.into());
        self
    }

    pub fn with_default_dir(&mut self, dir: impl Into<String>) -> &mut Self {
        self.default_dir = Some(dir.into());
        self
    }

    /// Set the pool capacity. Clamped to at least 1 per `spec.md` §3's
    /// invariant `clientConnectionCount >= 1`.
    pub fn with_client_connection_count(&mut self, n: usize) -> &mut Self {
        self.client_connection_count = n.max(1);
        self
    }

    /// Set the acquisition wait timeout. `Duration::ZERO` means wait
    /// indefinitely, per `spec.md` §4.4.
    pub fn with_client_connection_wait_timeout(&mut self, d: Duration) -> &mut Self {
        self.client_connection_wait_timeout = d;
        self
    }

    pub fn with_exception_factory(&mut self, factory: Arc<dyn ExceptionFactory>) -> &mut Self {
        self.exception_factory = Some(factory);
        self
    }

    /// Build an environment from the string-valued subset of keys in
    /// `spec.md` §6. Keys with non-string payloads (identities, sockets,
    /// proxies, the exception factory) must be set through the typed
    /// methods above; unknown keys are ignored, matching the teacher's
    /// `Builder::from_map`.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut env = Environment::new();

        if let Some(v) = map.get("username") {
            env.with_username(v.clone());
        }
        if let Some(v) = map.get("password") {
            env.with_password(v.clone());
        }
        if let Some(v) = map.get("connectTimeout").and_then(|v| v.parse().ok()) {
            env.with_connect_timeout(Duration::from_millis(v));
        }
        if let Some(v) = map.get("timeOut").and_then(|v| v.parse().ok()) {
            env.with_timeout(Duration::from_millis(v));
        }
        if let Some(v) = map.get("clientVersion") {
            env.with_client_version(v.clone());
        }
        if let Some(v) = map.get("hostKeyAlias") {
            env.with_host_key_alias(v.clone());
        }
        if let Some(v) = map
            .get("serverAliveInterval")
            .and_then(|v| v.parse().ok())
        {
            env.with_server_alive_interval(Duration::from_millis(v));
        }
        if let Some(v) = map
            .get("serverAliveCountMax")
            .and_then(|v| v.parse().ok())
        {
            env.with_server_alive_count_max(v);
        }
        if let Some(v) = map.get("knownHosts") {
            env.with_known_hosts(v.clone());
        }
        if let Some(v) = map.get("agentForwarding").and_then(|v| v.parse().ok()) {
            env.with_agent_forwarding(v);
        }
        if let Some(v) = map.get("filenameEncoding") {
            env.with_filename_encoding(v.clone());
        }
        if let Some(v) = map.get("defaultDir") {
            env.with_default_dir(v.clone());
        }
        if let Some(v) = map
            .get("clientConnectionCount")
            .and_then(|v| v.parse().ok())
        {
            env.with_client_connection_count(v);
        }
        if let Some(v) = map
            .get("clientConnectionWaitTimeout")
            .and_then(|v| v.parse().ok())
        {
            env.with_client_connection_wait_timeout(Duration::from_millis(v));
        }

        env
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn client_version(&self) -> Option<&str> {
        self.client_version.as_deref()
    }

    pub fn host_key_alias(&self) -> Option<&str> {
        self.host_key_alias.as_deref()
    }

    pub fn server_alive_interval(&self) -> Option<Duration> {
        self.server_alive_interval
    }

    pub fn server_alive_count_max(&self) -> Option<u32> {
        self.server_alive_count_max
    }

    pub fn config(&self) -> &HashMap<String, String> {
        &self.config
    }

    pub fn known_hosts(&self) -> Option<&str> {
        self.known_hosts.as_deref()
    }

    pub fn agent_forwarding(&self) -> bool {
        self.agent_forwarding
    }

    pub fn filename_encoding(&self) -> Option<&str> {
        self.filename_encoding.as_deref()
    }

    pub fn default_dir(&self) -> Option<&str> {
        self.default_dir.as_deref()
    }

    pub fn client_connection_count(&self) -> usize {
        self.client_connection_count
    }

    pub fn client_connection_wait_timeout(&self) -> Duration {
        self.client_connection_wait_timeout
    }

    pub fn exception_factory(&self) -> Option<Arc<dyn ExceptionFactory>> {
        self.exception_factory.clone()
    }
}
