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

//! The channel pool (C4): a bounded FIFO queue of [`Channel`]s, the ad hoc
//! `get_or_create` escape hatch, liveness-checked acquisition with
//! starvation-resistant replacement, and the second refcount streams hold
//! across their lifetime (`spec.md` §4.4).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use crate::channel::{self, Channel, SessionFactory, SftpSession};
use crate::environment::Environment;
use crate::{Error, ErrorKind, Result};

/// A pooled [`Channel`] plus the bookkeeping `spec.md` §3 attaches to it:
/// a refcount and a `pooled` flag. Held behind an `Arc` so a lease and the
/// stream adapter it spawns can each own an independent handle to the same
/// channel and decrement the same counter.
pub(crate) struct ChannelCell {
    channel: Channel,
    refcount: AtomicUsize,
    pooled: AtomicBool,
}

impl ChannelCell {
    pub(crate) fn session(&self) -> &dyn SftpSession {
        self.channel.session()
    }

    pub fn default_dir(&self) -> &str {
        self.channel.default_dir()
    }

    pub fn channel_id(&self) -> u64 {
        self.channel.id()
    }
}

struct PoolState {
    idle: VecDeque<Arc<ChannelCell>>,
    /// How many of the `capacity` pooled slots have been dialed at least
    /// once. Never decremented: a slot whose channel dies and fails to be
    /// replaced keeps its place in the queue (as a still-broken cell) rather
    /// than shrinking the pool, per `spec.md` §4.4 point 3.
    created: usize,
    closed: bool,
}

/// Bounded pool of SFTP channels for one filesystem. Cheap to clone: the
/// handle is a thin wrapper over an `Arc`'d core, matching the shared-handle
/// pattern the façade needs (one pool, many concurrent callers).
#[derive(Clone)]
pub struct ChannelPool {
    core: Arc<PoolCore>,
}

struct PoolCore {
    host: String,
    port: u16,
    env: Environment,
    session_factory: Arc<dyn SessionFactory>,
    capacity: usize,
    wait_timeout: Duration,
    state: Mutex<PoolState>,
    notify: Notify,
}

fn closed_error() -> Error {
    Error::new(ErrorKind::ClosedFileSystem, "channel pool is closed").with_operation("pool-get")
}

fn wait_timeout_error(waited: Duration) -> Error {
    Error::new(
        ErrorKind::ClientConnectionWaitTimeoutExpired,
        format!("no channel became available within {waited:?}"),
    )
    .with_operation("pool-get")
}

impl ChannelPool {
    /// Build a pool for `host:port`, bound to `env`'s
    /// `client_connection_count`/`client_connection_wait_timeout`. No
    /// channels are dialed yet; they're created lazily as `get()` demands
    /// them, up to capacity.
    pub fn new(host: impl Into<String>, port: u16, env: Environment, session_factory: Arc<dyn SessionFactory>) -> Self {
        let capacity = env.client_connection_count();
        let wait_timeout = env.client_connection_wait_timeout();
        ChannelPool {
            core: Arc::new(PoolCore {
                host: host.into(),
                port,
                env,
                session_factory,
                capacity,
                wait_timeout,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    created: 0,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    async fn dial(&self) -> Result<ChannelCell> {
        let channel = channel::connect(
            &self.core.host,
            self.core.port,
            &self.core.env,
            self.core.session_factory.as_ref(),
        )
        .await?;
        Ok(ChannelCell {
            channel,
            refcount: AtomicUsize::new(1),
            pooled: AtomicBool::new(false),
        })
    }

    /// Acquire a pooled channel, blocking (per `env.client_connection_wait_timeout()`,
    /// `Duration::ZERO` meaning indefinitely) until a slot is idle, a fresh
    /// slot can be dialed, or the wait times out. `spec.md` §8 scenario: with
    /// `N=3`, `waitTimeout=500ms`, a 4th concurrent `get()` raises
    /// `ClientConnectionWaitTimeoutExpired` once 500ms elapse.
    pub async fn get(&self) -> Result<ChannelLease> {
        let start = Instant::now();
        loop {
            enum Action {
                Validate(Arc<ChannelCell>),
                Dial,
                Wait,
            }

            let action = {
                let mut state = self.core.state.lock().await;
                if state.closed {
                    return Err(closed_error());
                }
                if let Some(cell) = state.idle.pop_front() {
                    Action::Validate(cell)
                } else if state.created < self.core.capacity {
                    state.created += 1;
                    Action::Dial
                } else {
                    Action::Wait
                }
            };

            match action {
                Action::Validate(cell) => {
                    return self.validate_or_replace(cell, true).await.map(|cell| ChannelLease::new(self.clone(), cell));
                }
                Action::Dial => match self.dial().await {
                    Ok(cell) => {
                        cell.pooled.store(true, Ordering::SeqCst);
                        return Ok(ChannelLease::new(self.clone(), Arc::new(cell)));
                    }
                    Err(e) => {
                        // The slot was reserved optimistically; give it back
                        // so a later get() can try again instead of
                        // permanently shrinking the pool, and wake anyone
                        // parked waiting for a slot to free up.
                        let mut state = self.core.state.lock().await;
                        state.created -= 1;
                        drop(state);
                        self.core.notify.notify_one();
                        return Err(e);
                    }
                },
                Action::Wait => {
                    if self.core.wait_timeout.is_zero() {
                        self.core.notify.notified().await;
                    } else {
                        let elapsed = start.elapsed();
                        if elapsed >= self.core.wait_timeout {
                            return Err(wait_timeout_error(elapsed));
                        }
                        let remaining = self.core.wait_timeout - elapsed;
                        if tokio::time::timeout(remaining, self.core.notify.notified())
                            .await
                            .is_err()
                        {
                            return Err(wait_timeout_error(start.elapsed()));
                        }
                    }
                }
            }
        }
    }

    /// Ad hoc, unpooled acquisition (`spec.md` §4.4's `getOrCreate`): never
    /// waits. Takes an idle channel if one is sitting in the queue,
    /// otherwise dials a fresh channel that doesn't count against capacity
    /// and is disconnected (not recycled) on release.
    pub async fn get_or_create(&self) -> Result<ChannelLease> {
        let maybe_idle = {
            let mut state = self.core.state.lock().await;
            if state.closed {
                return Err(closed_error());
            }
            state.idle.pop_front()
        };

        if let Some(cell) = maybe_idle {
            if let Ok(cell) = self.validate_or_replace(cell, true).await {
                return Ok(ChannelLease::new(self.clone(), cell));
            }
            // Replacement also failed; fall through to an ad hoc dial so the
            // caller still gets a channel without waiting.
        }

        let cell = self.dial().await?;
        Ok(ChannelLease::new(self.clone(), Arc::new(cell)))
    }

    /// Liveness-check a channel taken from the idle queue; on failure,
    /// disconnect it and dial a replacement. If the replacement also fails,
    /// the broken cell is pushed back onto the queue unchanged (refcount
    /// reset to 0) so the pool's size doesn't shrink and a later `get()` can
    /// retry the replacement (`spec.md` §4.4 point 3, starvation
    /// resistance).
    async fn validate_or_replace(&self, cell: Arc<ChannelCell>, pooled: bool) -> Result<Arc<ChannelCell>> {
        let alive = cell.session().is_connected().await && cell.session().keep_alive().await.is_ok();
        if alive {
            cell.refcount.store(1, Ordering::SeqCst);
            cell.pooled.store(pooled, Ordering::SeqCst);
            return Ok(cell);
        }

        log::warn!(
            "sftp channel {} failed its liveness check, replacing",
            cell.channel_id()
        );
        cell.session().disconnect().await;

        match self.dial().await {
            Ok(new_cell) => {
                new_cell.pooled.store(pooled, Ordering::SeqCst);
                Ok(Arc::new(new_cell))
            }
            Err(e) => {
                cell.refcount.store(0, Ordering::SeqCst);
                self.enqueue(cell).await;
                Err(e)
            }
        }
    }

    async fn enqueue(&self, cell: Arc<ChannelCell>) {
        let mut state = self.core.state.lock().await;
        state.idle.push_back(cell);
        drop(state);
        self.core.notify.notify_one();
    }

    /// Release a handle's contribution to a channel's refcount. At zero, a
    /// pooled channel is returned to the idle queue (unless the pool has
    /// since been closed, in which case it's disconnected instead); an ad
    /// hoc (unpooled) channel is always disconnected.
    async fn release(&self, cell: Arc<ChannelCell>) {
        let previous = cell.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous >= 1, "channel refcount underflow");
        if previous != 1 {
            return;
        }

        let should_enqueue = {
            let state = self.core.state.lock().await;
            cell.pooled.load(Ordering::SeqCst) && !state.closed
        };

        if should_enqueue {
            self.enqueue(cell).await;
        } else {
            cell.session().disconnect().await;
        }
    }

    /// Send a keep-alive probe through every currently idle channel,
    /// re-enqueuing each regardless of outcome (`spec.md` §4.9). Returns the
    /// first failure, if any, with the rest recorded as context.
    pub async fn keep_alive(&self) -> Result<()> {
        let drained: Vec<Arc<ChannelCell>> = {
            let mut state = self.core.state.lock().await;
            if state.closed {
                return Err(closed_error());
            }
            state.idle.drain(..).collect()
        };

        let mut errors = Vec::new();
        for cell in &drained {
            if let Err(e) = cell.session().keep_alive().await {
                errors.push(e);
            }
        }
        for cell in drained {
            self.enqueue(cell).await;
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.into_iter().next().unwrap()),
            n => {
                let mut first = errors.remove(0);
                first = first.with_context("additional_failures", (n - 1).to_string());
                Err(first)
            }
        }
    }

    /// Mark the pool closed and disconnect every currently idle channel.
    /// Channels out on loan aren't forced closed; they disconnect (rather
    /// than re-enter the queue) on their own release, since `closed` is
    /// checked there too. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let drained: Vec<Arc<ChannelCell>> = {
            let mut state = self.core.state.lock().await;
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.core.notify.notify_waiters();

        for cell in &drained {
            cell.session().disconnect().await;
        }
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.core.state.lock().await.closed
    }
}

/// A leased channel. Call [`ChannelLease::release`] on every exit path —
/// that's the primary, synchronous-to-call-site release the façade relies
/// on. `Drop` is a best-effort backstop only, for the panic/task-cancellation
/// paths an async `release().await` can't run on its own (it spawns the
/// release onto the current runtime, or logs and leaks the slot if none is
/// running); it is not a substitute for calling `release()`.
pub struct ChannelLease {
    pool: ChannelPool,
    cell: Option<Arc<ChannelCell>>,
}

impl ChannelLease {
    fn new(pool: ChannelPool, cell: Arc<ChannelCell>) -> Self {
        ChannelLease {
            pool,
            cell: Some(cell),
        }
    }

    pub fn session(&self) -> &dyn SftpSession {
        self.cell.as_ref().expect("lease already released").session()
    }

    pub fn default_dir(&self) -> &str {
        self.cell.as_ref().expect("lease already released").default_dir()
    }

    pub fn channel_id(&self) -> u64 {
        self.cell.as_ref().expect("lease already released").channel_id()
    }

    /// Release this lease's contribution to the channel's refcount.
    pub async fn release(mut self) {
        if let Some(cell) = self.cell.take() {
            self.pool.release(cell).await;
        }
    }

    /// Take a second, independent reference to this lease's channel for a
    /// streaming reader/writer adapter (`spec.md` §4.4/§4.9): the pool
    /// increments the refcount again and hands back a [`StreamChannelRef`]
    /// whose own `release()` is the stream's sole contribution. The
    /// façade's own lease must still be released separately — a stream's
    /// close contributes exactly one release, the call site contributes the
    /// other.
    pub fn acquire_stream_ref(&self) -> StreamChannelRef {
        let cell = self.cell.as_ref().expect("lease already released").clone();
        cell.refcount.fetch_add(1, Ordering::SeqCst);
        StreamChannelRef {
            pool: self.pool.clone(),
            cell: Some(cell),
            released: AtomicBool::new(false),
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let Some(cell) = self.cell.take() else {
            return;
        };
        let pool = self.pool.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.release(cell).await });
            }
            Err(_) => {
                log::warn!(
                    "channel {} dropped outside a tokio runtime; leaking its pool slot",
                    cell.channel_id()
                );
            }
        }
    }
}

/// The extra refcount a stream adapter holds on a channel, independent of
/// the lease that opened it. `release()` is idempotent: a stream's `close()`
/// may be called more than once (`spec.md` §5), but only the first call may
/// decrement the shared counter.
pub struct StreamChannelRef {
    pool: ChannelPool,
    cell: Option<Arc<ChannelCell>>,
    released: AtomicBool,
}

impl StreamChannelRef {
    pub fn session(&self) -> &dyn SftpSession {
        self.cell.as_ref().expect("stream ref already released").session()
    }

    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cell) = self.cell.as_ref() {
            self.pool.release(cell.clone()).await;
        }
    }
}
