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

//! The `Channel` entity (C4) and the `SftpSession` seam that decouples the
//! pool/façade logic from the external SFTP wire client.
//!
//! The real implementation (`OpensshSession`) drives `openssh` +
//! `openssh-sftp-client`, exactly the pair `services::sftp::backend` depends
//! on in the teacher. The wire protocol itself is never reimplemented here
//! (`spec.md` §1): this module only dials, authenticates, and translates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

use crate::environment::Environment;
use crate::error::{ExceptionFactory, Operation, RemoteStatus};
use crate::{Error, ErrorKind, Result};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A remote file or directory's attributes, in the shape the façade needs
/// them (`spec.md` §4.5 "Attribute reads").
#[derive(Clone, Debug, Default)]
pub struct RemoteMetadata {
    pub is_dir: bool,
    pub is_symlink: bool,
    pub is_regular: bool,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub atime: Option<SystemTime>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// 9-bit POSIX permission mask.
    pub permissions: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct RemoteDirEntry {
    pub name: String,
    pub metadata: RemoteMetadata,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FileStoreStats {
    pub total_space: u64,
    pub usable_space: u64,
    pub unallocated_space: u64,
}

/// Which attributes to change in a `setstat` call; `None` fields are left
/// untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetStat {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub mtime: Option<SystemTime>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or truncate, then write from offset 0.
    Overwrite,
    Append,
}

/// How a byte channel is opened (`spec.md` §4.5 "Byte channel": "built on
/// the same stream primitives"). Mirrors the flag combinations
/// `options.rs`'s [`crate::OpenOptions`] already normalizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteChannelMode {
    ReadOnly,
    /// Read/write, existing content preserved, positioned at offset 0.
    ReadWrite,
    /// Read/write, any existing content discarded.
    Overwrite,
    /// Read/write, every write lands at EOF.
    Append,
}

/// A handle returned by [`SftpSession::open_byte_channel`]: readable,
/// writable, and seekable, matching `spec.md` §4.5's "position/read/write"
/// surface.
pub trait SftpFile: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin> SftpFile for T {}

/// The external SFTP session, abstracted behind a trait so the pool and
/// façade are unit-testable without a live server (`spec.md` §1 treats the
/// wire client as an external collaborator; this is that collaborator's
/// interface from this crate's point of view).
#[async_trait]
pub trait SftpSession: Send + Sync {
    async fn is_connected(&self) -> bool;
    async fn keep_alive(&self) -> Result<()>;
    async fn pwd(&self) -> Result<String>;
    async fn disconnect(&self);

    async fn stat(&self, path: &str, follow_links: bool) -> Result<RemoteMetadata>;
    async fn open_read(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
    async fn open_write(
        &self,
        path: &str,
        mode: WriteMode,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>>;
    async fn open_byte_channel(&self, path: &str, mode: ByteChannelMode) -> Result<Box<dyn SftpFile>>;
    async fn mkdir(&self, path: &str) -> Result<()>;
    async fn rmdir(&self, path: &str) -> Result<()>;
    async fn remove_file(&self, path: &str) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn readlink(&self, path: &str) -> Result<String>;
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>>;
    async fn setstat(&self, path: &str, attrs: SetStat) -> Result<()>;
    async fn statvfs(&self, path: &str) -> Result<FileStoreStats>;
}

/// One live SFTP session/channel pair, matching `spec.md` §3's `Channel`
/// entity's identity and session. The refcount/`pooled` bookkeeping the
/// entity also describes lives one level up, in `pool::ChannelCell`,
/// alongside the queue it's mutated in lockstep with — that avoids a
/// second lock per channel.
pub struct Channel {
    pub(crate) id: u64,
    pub(crate) session: Box<dyn SftpSession>,
    pub(crate) default_dir: String,
}

impl Channel {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn default_dir(&self) -> &str {
        &self.default_dir
    }

    pub fn session(&self) -> &dyn SftpSession {
        self.session.as_ref()
    }
}

/// Dial, authenticate, open the SFTP subsystem, `chdir` to the default
/// directory if one is set, and verify the session with a trivial `pwd`
/// call, per `spec.md` §3's `Channel` lifecycle.
pub async fn connect(
    host: &str,
    port: u16,
    env: &Environment,
    session_factory: &dyn SessionFactory,
) -> Result<Channel> {
    let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
    log::debug!("sftp channel {id} connecting to {host}:{port}");

    let session = session_factory
        .connect(host, port, env)
        .await
        .map_err(|e| {
            Error::new(ErrorKind::Unexpected, e.to_string())
                .with_operation("connect")
                .with_context("host", host.to_string())
                .with_source(e)
        })?;

    // SFTP (protocol v3) has no server-side "current directory"; the
    // default directory is purely client-tracked, captured once here from
    // the login directory (`pwd`) or overridden by the caller.
    let login_dir = session.pwd().await?;
    let default_dir = match env.default_dir() {
        Some(dir) => {
            session.stat(dir, true).await.map_err(|e| {
                Error::new(ErrorKind::Unexpected, format!("default dir unreachable: {e}"))
                    .with_operation(Operation::Chdir.as_str())
                    .with_path(dir)
            })?;
            dir.to_string()
        }
        None => login_dir,
    };

    log::debug!("sftp channel {id} connected, default dir {default_dir}");

    Ok(Channel {
        id,
        session,
        default_dir,
    })
}

/// Factory for dialing a fresh [`SftpSession`]. A trait rather than a bare
/// function so tests can substitute an in-memory fake; the real instance
/// (`OpensshSessionFactory`) lives in `channel_openssh.rs`.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        env: &Environment,
    ) -> std::result::Result<Box<dyn SftpSession>, anyhow::Error>;
}

/// Translate a [`RemoteStatus`] observed by a concrete `SftpSession`
/// implementation into a filesystem [`Error`], via the environment's
/// exception factory (or the default policy).
pub fn translate(
    factory: Option<&dyn ExceptionFactory>,
    op: Operation,
    status: RemoteStatus,
    path: &str,
    second_path: Option<&str>,
    cause: anyhow::Error,
) -> Error {
    use crate::error::DefaultExceptionFactory;
    match factory {
        Some(f) => f.translate(op, status, path, second_path, cause),
        None => DefaultExceptionFactory.translate(op, status, path, second_path, cause),
    }
}
