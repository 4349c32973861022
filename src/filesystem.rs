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

//! The filesystem façade (C5): one instance per open filesystem, translating
//! path-addressed verbs into sequences of primitives against a leased
//! [`Channel`](crate::channel::Channel).
//!
//! Grounded on `services/sftp/backend.rs`'s `Accessor` impl (`create_dir`,
//! `read`, `write`, `stat`, `delete`, `list`, each a scoped
//! acquire-execute-release against `client.fs()`), generalized to the full
//! operation set `spec.md` §4.5 names.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::AsyncWriteExt;

use crate::attributes::{self, AttributeValue, AttributeView, BasicAttributes, PosixAttributes, WritableAttribute};
use crate::channel::{ByteChannelMode, FileStoreStats, RemoteMetadata, SessionFactory, SetStat, WriteMode};
use crate::environment::Environment;
use crate::error::Operation;
use crate::path::SftpPath;
use crate::pool::{ChannelLease, ChannelPool};
use crate::stream::{SftpByteChannel, SftpReader, SftpWriter};
use crate::uri::AuthorityKey;
use crate::{Error, ErrorKind, OpenOptions, Result};

/// What to do when the rename target already exists, and whether an atomic
/// move was specifically requested (`spec.md` §4.5 "Rename / move").
#[derive(Clone, Copy, Debug, Default)]
pub struct RenameOptions {
    pub replace_existing: bool,
    pub atomic_move: bool,
}

/// Copy behavior (`spec.md` §4.5 "Copy").
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyOptions {
    pub replace_existing: bool,
    pub copy_attributes: bool,
}

/// One open SFTP filesystem: a pool, the authority it was opened against,
/// and the policy objects (exception factory) that shape how errors surface
/// (`spec.md` §3's "Filesystem instance" entity).
pub struct SftpFileSystem {
    pool: ChannelPool,
    authority: AuthorityKey,
    default_dir: String,
    closed: AtomicBool,
}

impl SftpFileSystem {
    /// Open a filesystem: build its pool and capture the default directory
    /// from a first dialed channel (`spec.md` §4.5 "Path resolution": "the
    /// default directory is captured at connect time"). The environment's
    /// exception factory, if any, travels to the wire session through the
    /// pool rather than being held here a second time.
    pub async fn connect(
        authority: AuthorityKey,
        env: Environment,
        session_factory: Arc<dyn SessionFactory>,
    ) -> Result<Self> {
        let pool = ChannelPool::new(authority.host().to_string(), authority.port(), env, session_factory);

        let probe = pool.get().await?;
        let default_dir = probe.default_dir().to_string();
        probe.release().await;

        Ok(SftpFileSystem {
            pool,
            authority,
            default_dir,
            closed: AtomicBool::new(false),
        })
    }

    pub fn authority(&self) -> &AuthorityKey {
        &self.authority
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bind a raw path string to this filesystem.
    pub fn path(&self, raw: &str) -> SftpPath {
        SftpPath::new(self.authority.normalized_without_password(), self.default_dir.clone(), raw)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::ClosedFileSystem, "filesystem is closed").with_operation("check-open"));
        }
        Ok(())
    }

    fn belongs_to_this(&self, path: &SftpPath) -> bool {
        path.filesystem_id() == self.authority.normalized_without_password()
    }

    /// Build a named attribute view (`spec.md` §4.7) bound weakly to this
    /// filesystem. `None` for any name other than `"basic"`/`"owner"`/
    /// `"posix"`, matching the null-view contract rather than an error.
    pub fn attribute_view(self: &Arc<Self>, name: &str, path: &SftpPath, follow_links: bool) -> Option<AttributeView> {
        AttributeView::for_name(name, Arc::downgrade(self), path.clone(), follow_links)
    }

    /// Drain and disconnect the pool, then mark this filesystem closed.
    /// Idempotent. The registry entry removal is the caller's
    /// responsibility (`provider.rs`), per `spec.md` §4.6's ordering rule.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.close().await
    }

    /// Probe every idle pooled channel (`spec.md` §4.9). `ClosedFileSystem`
    /// if this filesystem has already been closed.
    pub async fn keep_alive(&self) -> Result<()> {
        self.ensure_open()?;
        self.pool.keep_alive().await
    }

    // -- file open -----------------------------------------------------

    pub async fn open_read(&self, path: &SftpPath, options: &OpenOptions) -> Result<SftpReader> {
        self.ensure_open()?;
        if options.write || options.append || options.create || options.create_new {
            return Err(Error::new(ErrorKind::IllegalArgument, "write flags are not valid for a read-only open")
                .with_operation(Operation::OpenInput.as_str())
                .with_path(path.to_absolute_string()));
        }

        let abs = path.to_absolute_string();
        let lease = self.pool.get().await?;
        let opened = lease.session().open_read(&abs).await;
        let result = match opened {
            Ok(inner) => {
                let channel_ref = lease.acquire_stream_ref();
                let delete_path = options.delete_on_close.then(|| abs.clone());
                Ok(SftpReader::new(inner, channel_ref, delete_path))
            }
            Err(e) => Err(e),
        };
        lease.release().await;
        result
    }

    pub async fn open_write(&self, path: &SftpPath, options: &OpenOptions) -> Result<SftpWriter> {
        self.ensure_open()?;
        let abs = path.to_absolute_string();
        let lease = self.pool.get().await?;
        let result = self.open_write_on(&lease, &abs, options).await;
        lease.release().await;
        result
    }

    async fn open_write_on(&self, lease: &ChannelLease, abs: &str, options: &OpenOptions) -> Result<SftpWriter> {
        match lease.session().stat(abs, true).await {
            Ok(meta) => {
                if options.create_new {
                    return Err(Error::new(ErrorKind::FileAlreadyExists, "target already exists")
                        .with_operation(Operation::OpenOutput.as_str())
                        .with_path(abs));
                }
                if meta.is_dir {
                    return Err(Error::new(ErrorKind::IsADirectory, "target is a directory")
                        .with_operation(Operation::OpenOutput.as_str())
                        .with_path(abs));
                }
            }
            Err(e) if e.kind() == ErrorKind::NoSuchFile => {
                if !options.create && !options.create_new {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }

        let mode = if options.append {
            WriteMode::Append
        } else {
            WriteMode::Overwrite
        };

        let inner = lease.session().open_write(abs, mode).await?;
        let channel_ref = lease.acquire_stream_ref();
        let delete_path = options.delete_on_close.then(|| abs.to_string());
        Ok(SftpWriter::new(inner, channel_ref, delete_path))
    }

    /// Open a seekable byte channel (`spec.md` §4.5 "Byte channel"), sharing
    /// `open_write_on`'s existence/create-flag checks since it's "built on
    /// the same stream primitives".
    pub async fn open_byte_channel(&self, path: &SftpPath, options: &OpenOptions) -> Result<SftpByteChannel> {
        self.ensure_open()?;
        let abs = path.to_absolute_string();
        let lease = self.pool.get().await?;
        let result = self.open_byte_channel_on(&lease, &abs, options).await;
        lease.release().await;
        result
    }

    async fn open_byte_channel_on(&self, lease: &ChannelLease, abs: &str, options: &OpenOptions) -> Result<SftpByteChannel> {
        match lease.session().stat(abs, true).await {
            Ok(meta) => {
                if options.create_new {
                    return Err(Error::new(ErrorKind::FileAlreadyExists, "target already exists")
                        .with_operation(Operation::OpenOutput.as_str())
                        .with_path(abs));
                }
                if meta.is_dir {
                    return Err(Error::new(ErrorKind::IsADirectory, "target is a directory")
                        .with_operation(Operation::OpenOutput.as_str())
                        .with_path(abs));
                }
            }
            Err(e) if e.kind() == ErrorKind::NoSuchFile => {
                if !options.create && !options.create_new {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }

        let mode = if !options.write && !options.append {
            ByteChannelMode::ReadOnly
        } else if options.append {
            ByteChannelMode::Append
        } else if options.truncate || options.create_new {
            ByteChannelMode::Overwrite
        } else {
            ByteChannelMode::ReadWrite
        };

        let inner = lease.session().open_byte_channel(abs, mode).await?;
        let channel_ref = lease.acquire_stream_ref();
        Ok(SftpByteChannel::new(inner, channel_ref, abs.to_string(), options.append))
    }

    // -- directories -----------------------------------------------------

    pub async fn list_dir(&self, path: &SftpPath) -> Result<Vec<SftpPath>> {
        self.ensure_open()?;
        let abs = path.to_absolute_string();
        let lease = self.pool.get().await?;
        let result = self.list_dir_on(&lease, path, &abs).await;
        lease.release().await;
        result
    }

    async fn list_dir_on(&self, lease: &ChannelLease, path: &SftpPath, abs: &str) -> Result<Vec<SftpPath>> {
        let meta = lease.session().stat(abs, true).await?;
        if !meta.is_dir {
            return Err(Error::new(ErrorKind::NotDirectory, "not a directory")
                .with_operation(Operation::List.as_str())
                .with_path(abs));
        }
        let entries = lease.session().list_dir(abs).await?;
        Ok(entries.into_iter().map(|e| path.join(&e.name)).collect())
    }

    pub async fn create_dir(&self, path: &SftpPath) -> Result<()> {
        self.ensure_open()?;
        let abs = path.to_absolute_string();
        let lease = self.pool.get().await?;
        let result = self.create_dir_on(&lease, &abs).await;
        lease.release().await;
        result
    }

    async fn create_dir_on(&self, lease: &ChannelLease, abs: &str) -> Result<()> {
        match lease.session().mkdir(abs).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::FileAlreadyExists => Err(e),
            Err(e) => {
                // Status-code-first, probe only on ambiguous failures
                // (Open Question 3, `spec.md` §9): a plain stat confirms
                // whether the real cause was "already exists".
                if lease.session().stat(abs, true).await.is_ok() {
                    Err(Error::new(ErrorKind::FileAlreadyExists, "target already exists")
                        .with_operation(Operation::Mkdir.as_str())
                        .with_path(abs))
                } else {
                    Err(e)
                }
            }
        }
    }

    // -- delete / rename / copy -----------------------------------------

    pub async fn delete(&self, path: &SftpPath) -> Result<()> {
        self.ensure_open()?;
        let abs = path.to_absolute_string();
        let lease = self.pool.get().await?;
        let result = self.delete_on(&lease, &abs).await;
        lease.release().await;
        result
    }

    async fn delete_on(&self, lease: &ChannelLease, abs: &str) -> Result<()> {
        let meta = lease.session().stat(abs, false).await?;
        if meta.is_dir {
            // SFTP v3 has no dedicated "directory not empty" status; detect
            // it here rather than inferring it from a generic rmdir failure.
            let entries = lease.session().list_dir(abs).await?;
            if !entries.is_empty() {
                return Err(Error::new(ErrorKind::DirectoryNotEmpty, "directory is not empty")
                    .with_operation(Operation::DeleteDir.as_str())
                    .with_path(abs));
            }
            lease.session().rmdir(abs).await
        } else {
            lease.session().remove_file(abs).await
        }
    }

    pub async fn rename(&self, from: &SftpPath, to: &SftpPath, options: RenameOptions) -> Result<()> {
        self.ensure_open()?;
        let from_abs = from.to_absolute_string();
        let to_abs = to.to_absolute_string();
        let lease = self.pool.get().await?;
        let result = self.rename_on(&lease, &from_abs, &to_abs, options).await;
        lease.release().await;
        result
    }

    async fn rename_on(&self, lease: &ChannelLease, from: &str, to: &str, options: RenameOptions) -> Result<()> {
        match lease.session().stat(to, false).await {
            Ok(meta) => {
                if !options.replace_existing {
                    return Err(Error::new(ErrorKind::FileAlreadyExists, "rename target exists")
                        .with_operation(Operation::Rename.as_str())
                        .with_path(from)
                        .with_second_path(to));
                }
                if meta.is_dir {
                    lease.session().rmdir(to).await?;
                } else {
                    lease.session().remove_file(to).await?;
                }
            }
            Err(e) if e.kind() == ErrorKind::NoSuchFile => {}
            Err(e) => return Err(e),
        }

        match lease.session().rename(from, to).await {
            Ok(()) => Ok(()),
            Err(e) if options.atomic_move && e.kind() == ErrorKind::UnsupportedOperation => {
                Err(Error::new(ErrorKind::AtomicMoveNotSupported, "server does not support an atomic rename")
                    .with_operation(Operation::Rename.as_str())
                    .with_path(from)
                    .with_second_path(to))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn copy(&self, from: &SftpPath, to: &SftpPath, options: CopyOptions) -> Result<()> {
        self.ensure_open()?;
        if from.filesystem_id() != to.filesystem_id() {
            return Err(Error::new(ErrorKind::UnsupportedOperation, "cross-filesystem copy is not supported")
                .with_operation("copy")
                .with_path(from.to_absolute_string())
                .with_second_path(to.to_absolute_string()));
        }

        let src_abs = from.to_absolute_string();
        let dst_abs = to.to_absolute_string();
        let lease = self.pool.get().await?;
        let result = self.copy_on(&lease, &src_abs, &dst_abs, options).await;
        lease.release().await;
        result
    }

    async fn copy_on(&self, lease: &ChannelLease, src: &str, dst: &str, options: CopyOptions) -> Result<()> {
        if !options.replace_existing && lease.session().stat(dst, false).await.is_ok() {
            return Err(Error::new(ErrorKind::FileAlreadyExists, "copy target exists")
                .with_operation("copy")
                .with_path(src)
                .with_second_path(dst));
        }

        let mut reader = lease.session().open_read(src).await?;
        let mut writer = lease.session().open_write(dst, WriteMode::Overwrite).await?;

        tokio::io::copy(&mut reader, &mut writer).await.map_err(|e| {
            Error::new(ErrorKind::Unexpected, e.to_string())
                .with_operation("copy")
                .with_path(src)
                .with_second_path(dst)
                .with_source(e)
        })?;
        writer.shutdown().await.map_err(|e| {
            Error::new(ErrorKind::Unexpected, e.to_string())
                .with_operation("copy")
                .with_path(dst)
                .with_source(e)
        })?;

        if options.copy_attributes {
            let meta = lease.session().stat(src, true).await?;
            lease
                .session()
                .setstat(
                    dst,
                    SetStat {
                        uid: meta.uid,
                        gid: meta.gid,
                        permissions: meta.permissions,
                        mtime: meta.mtime,
                    },
                )
                .await?;
        }

        Ok(())
    }

    // -- symlinks ---------------------------------------------------------

    pub async fn read_link(&self, path: &SftpPath) -> Result<SftpPath> {
        self.ensure_open()?;
        let abs = path.to_absolute_string();
        let lease = self.pool.get().await?;
        let result = lease.session().readlink(&abs).await;
        lease.release().await;
        result.map(|target| self.path(&target))
    }

    // -- attributes ---------------------------------------------------------

    pub async fn stat(&self, path: &SftpPath, follow_links: bool) -> Result<RemoteMetadata> {
        self.ensure_open()?;
        let abs = path.to_absolute_string();
        let lease = self.pool.get().await?;
        let result = lease.session().stat(&abs, follow_links).await;
        lease.release().await;
        result
    }

    pub async fn read_basic_attributes(&self, path: &SftpPath, follow_links: bool) -> Result<BasicAttributes> {
        let meta = self.stat(path, follow_links).await?;
        Ok(attributes::basic_from_remote(path, &meta))
    }

    pub async fn read_posix_attributes(&self, path: &SftpPath, follow_links: bool) -> Result<PosixAttributes> {
        let meta = self.stat(path, follow_links).await?;
        Ok(attributes::posix_from_remote(path, &meta))
    }

    pub async fn read_named_attributes(
        &self,
        path: &SftpPath,
        selector: &str,
        follow_links: bool,
    ) -> Result<Vec<(String, AttributeValue)>> {
        let attrs = self.read_posix_attributes(path, follow_links).await?;
        attributes::read_selector(selector, &attrs)
    }

    /// `setAttribute(name, value, followLinks)` (`spec.md` §4.5): parse
    /// `"view:name"`, verify the target exists under `followLinks`, then
    /// dispatch to the matching primitive.
    pub async fn set_attribute(
        &self,
        path: &SftpPath,
        selector: &str,
        value: AttributeValue,
        follow_links: bool,
    ) -> Result<()> {
        match (attributes::parse_writable_attribute(selector)?, value) {
            (WritableAttribute::Permissions, AttributeValue::Permissions(mode)) => {
                self.set_permissions(path, mode, follow_links).await
            }
            (WritableAttribute::Owner, AttributeValue::Id(uid)) => self.set_owner(path, uid, follow_links).await,
            (WritableAttribute::Group, AttributeValue::Id(gid)) => self.set_group(path, gid, follow_links).await,
            (WritableAttribute::LastModifiedTime, AttributeValue::Time(t)) => {
                self.set_last_modified_time(path, t, follow_links).await
            }
            _ => Err(Error::new(ErrorKind::IllegalArgument, "attribute value does not match its selector")
                .with_operation("set-attribute")
                .with_path(path.to_absolute_string())),
        }
    }

    pub async fn set_permissions(&self, path: &SftpPath, mode: u32, follow_links: bool) -> Result<()> {
        self.set_stat(path, follow_links, SetStat { permissions: Some(mode), ..Default::default() }).await
    }

    pub async fn set_owner(&self, path: &SftpPath, uid: u32, follow_links: bool) -> Result<()> {
        self.set_stat(path, follow_links, SetStat { uid: Some(uid), ..Default::default() }).await
    }

    pub async fn set_group(&self, path: &SftpPath, gid: u32, follow_links: bool) -> Result<()> {
        self.set_stat(path, follow_links, SetStat { gid: Some(gid), ..Default::default() }).await
    }

    pub async fn set_last_modified_time(&self, path: &SftpPath, mtime: SystemTime, follow_links: bool) -> Result<()> {
        self.set_stat(path, follow_links, SetStat { mtime: Some(mtime), ..Default::default() }).await
    }

    async fn set_stat(&self, path: &SftpPath, follow_links: bool, attrs: SetStat) -> Result<()> {
        self.ensure_open()?;
        let abs = path.to_absolute_string();
        let lease = self.pool.get().await?;
        let result = async {
            lease.session().stat(&abs, follow_links).await?;
            lease.session().setstat(&abs, attrs).await
        }
        .await;
        lease.release().await;
        result
    }

    // -- filestore / isSameFile -------------------------------------------

    pub async fn statvfs(&self, path: &SftpPath) -> Result<FileStoreStats> {
        self.ensure_open()?;
        let abs = path.to_absolute_string();
        let lease = self.pool.get().await?;
        let result = lease.session().statvfs(&abs).await;
        lease.release().await;
        result
    }

    /// `spec.md` §4.5 "isSameFile": same filesystem and normalized path, or
    /// both regular files with identical synthesized file keys once links
    /// are followed. A path from a different filesystem always compares
    /// false, never raises (`spec.md` §8 scenario 7).
    pub async fn is_same_file(&self, a: &SftpPath, b: &SftpPath) -> Result<bool> {
        if !self.belongs_to_this(a) || !self.belongs_to_this(b) {
            return Ok(false);
        }
        if a == b {
            return Ok(true);
        }

        let meta_a = self.stat(a, true).await?;
        let meta_b = self.stat(b, true).await?;
        if !meta_a.is_regular || !meta_b.is_regular {
            return Ok(false);
        }
        Ok(attributes::synthesize_file_key(a) == attributes::synthesize_file_key(b))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::SeekFrom;
    use std::pin::Pin;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use std::sync::{Arc, Mutex};
    use std::task::{Context as TaskContext, Poll};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

    use super::*;
    use crate::channel::{FileStoreStats, RemoteDirEntry, RemoteMetadata, SessionFactory, SftpFile, SftpSession, WriteMode};
    use crate::options::{OpenFlag, OpenIntent};

    #[derive(Clone)]
    enum FakeKind {
        File(Vec<u8>),
        Dir,
    }

    struct FakeEntry {
        kind: FakeKind,
        permissions: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        mtime: Option<SystemTime>,
    }

    impl FakeEntry {
        fn file(content: Vec<u8>) -> Self {
            FakeEntry {
                kind: FakeKind::File(content),
                permissions: Some(0o644),
                uid: Some(1000),
                gid: Some(1000),
                mtime: Some(SystemTime::UNIX_EPOCH),
            }
        }

        fn dir() -> Self {
            FakeEntry {
                kind: FakeKind::Dir,
                permissions: Some(0o755),
                uid: Some(1000),
                gid: Some(1000),
                mtime: Some(SystemTime::UNIX_EPOCH),
            }
        }
    }

    fn to_metadata(entry: &FakeEntry) -> RemoteMetadata {
        match &entry.kind {
            FakeKind::Dir => RemoteMetadata {
                is_dir: true,
                is_symlink: false,
                is_regular: false,
                size: 0,
                mtime: entry.mtime,
                atime: None,
                uid: entry.uid,
                gid: entry.gid,
                permissions: entry.permissions,
            },
            FakeKind::File(content) => RemoteMetadata {
                is_dir: false,
                is_symlink: false,
                is_regular: true,
                size: content.len() as u64,
                mtime: entry.mtime,
                atime: None,
                uid: entry.uid,
                gid: entry.gid,
                permissions: entry.permissions,
            },
        }
    }

    fn no_such_file(path: &str) -> Error {
        Error::new(ErrorKind::NoSuchFile, "no such file").with_operation("stat").with_path(path)
    }

    // A Vec<u8>-backed reader; content is a snapshot taken at open time, like
    // a real SFTP read handle.
    struct MemReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for MemReader {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            let remaining = &this.data[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    // Buffers writes in memory, committing the whole buffer back to the
    // shared node map on shutdown, mirroring `SftpWriter::close`'s flush.
    struct MemWriter {
        nodes: Arc<Mutex<HashMap<String, FakeEntry>>>,
        path: String,
        buf: Vec<u8>,
    }

    impl AsyncWrite for MemWriter {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>, data: &[u8]) -> Poll<std::io::Result<usize>> {
            self.get_mut().buf.extend_from_slice(data);
            Poll::Ready(Ok(data.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            let mut nodes = this.nodes.lock().unwrap();
            nodes.insert(this.path.clone(), FakeEntry::file(std::mem::take(&mut this.buf)));
            Poll::Ready(Ok(()))
        }
    }

    // A seekable in-memory file: every write commits immediately, since
    // `SftpByteChannel::close` never flushes (`stream.rs`).
    struct MemFile {
        nodes: Arc<Mutex<HashMap<String, FakeEntry>>>,
        path: String,
        buf: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for MemFile {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            let remaining = if this.pos < this.buf.len() { &this.buf[this.pos..] } else { &[][..] };
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for MemFile {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>, data: &[u8]) -> Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            let end = this.pos + data.len();
            if end > this.buf.len() {
                this.buf.resize(end, 0);
            }
            this.buf[this.pos..end].copy_from_slice(data);
            this.pos = end;
            let mut nodes = this.nodes.lock().unwrap();
            nodes.insert(this.path.clone(), FakeEntry::file(this.buf.clone()));
            Poll::Ready(Ok(data.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl tokio::io::AsyncSeek for MemFile {
        fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
            let this = self.get_mut();
            let new_pos = match position {
                SeekFrom::Start(n) => n as i64,
                SeekFrom::End(n) => this.buf.len() as i64 + n,
                SeekFrom::Current(n) => this.pos as i64 + n,
            };
            if new_pos < 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "negative seek"));
            }
            this.pos = new_pos as usize;
            Ok(())
        }

        fn poll_complete(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<u64>> {
            Poll::Ready(Ok(self.pos as u64))
        }
    }

    struct FakeSession {
        nodes: Arc<Mutex<HashMap<String, FakeEntry>>>,
        deny_atomic_rename: Arc<StdAtomicBool>,
    }

    #[async_trait]
    impl SftpSession for FakeSession {
        async fn is_connected(&self) -> bool {
            true
        }

        async fn keep_alive(&self) -> Result<()> {
            Ok(())
        }

        async fn pwd(&self) -> Result<String> {
            Ok("/home/test".to_string())
        }

        async fn disconnect(&self) {}

        async fn stat(&self, path: &str, _follow_links: bool) -> Result<RemoteMetadata> {
            let nodes = self.nodes.lock().unwrap();
            nodes.get(path).map(to_metadata).ok_or_else(|| no_such_file(path))
        }

        async fn open_read(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
            let nodes = self.nodes.lock().unwrap();
            match nodes.get(path) {
                Some(FakeEntry { kind: FakeKind::File(content), .. }) => {
                    Ok(Box::new(MemReader { data: content.clone(), pos: 0 }))
                }
                Some(_) => Err(Error::new(ErrorKind::IsADirectory, "is a directory")
                    .with_operation(Operation::OpenInput.as_str())
                    .with_path(path)),
                None => Err(no_such_file(path)),
            }
        }

        async fn open_write(&self, path: &str, mode: WriteMode) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
            let initial = match mode {
                WriteMode::Append => {
                    let nodes = self.nodes.lock().unwrap();
                    match nodes.get(path) {
                        Some(FakeEntry { kind: FakeKind::File(content), .. }) => content.clone(),
                        _ => Vec::new(),
                    }
                }
                WriteMode::Overwrite => Vec::new(),
            };
            Ok(Box::new(MemWriter { nodes: self.nodes.clone(), path: path.to_string(), buf: initial }))
        }

        async fn open_byte_channel(&self, path: &str, mode: ByteChannelMode) -> Result<Box<dyn SftpFile>> {
            let existing = {
                let nodes = self.nodes.lock().unwrap();
                match nodes.get(path) {
                    Some(FakeEntry { kind: FakeKind::File(content), .. }) => Some(content.clone()),
                    _ => None,
                }
            };

            let (buf, pos) = match mode {
                ByteChannelMode::ReadOnly | ByteChannelMode::ReadWrite => (existing.unwrap_or_default(), 0),
                ByteChannelMode::Overwrite => {
                    let mut nodes = self.nodes.lock().unwrap();
                    nodes.insert(path.to_string(), FakeEntry::file(Vec::new()));
                    (Vec::new(), 0)
                }
                ByteChannelMode::Append => {
                    let content = existing.unwrap_or_default();
                    let len = content.len();
                    (content, len)
                }
            };

            Ok(Box::new(MemFile { nodes: self.nodes.clone(), path: path.to_string(), buf, pos }))
        }

        async fn mkdir(&self, path: &str) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            if nodes.contains_key(path) {
                // Deliberately ambiguous, not `FileAlreadyExists`: exercises
                // `create_dir_on`'s stat-probe fallback.
                return Err(Error::new(ErrorKind::Unexpected, "mkdir failed")
                    .with_operation(Operation::Mkdir.as_str())
                    .with_path(path));
            }
            nodes.insert(path.to_string(), FakeEntry::dir());
            Ok(())
        }

        async fn rmdir(&self, path: &str) -> Result<()> {
            self.nodes.lock().unwrap().remove(path);
            Ok(())
        }

        async fn remove_file(&self, path: &str) -> Result<()> {
            self.nodes.lock().unwrap().remove(path);
            Ok(())
        }

        async fn rename(&self, from: &str, to: &str) -> Result<()> {
            if self.deny_atomic_rename.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::UnsupportedOperation, "rename is not supported")
                    .with_operation(Operation::Rename.as_str())
                    .with_path(from)
                    .with_second_path(to));
            }
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.remove(from) {
                Some(entry) => {
                    nodes.insert(to.to_string(), entry);
                    Ok(())
                }
                None => Err(no_such_file(from)),
            }
        }

        async fn readlink(&self, _path: &str) -> Result<String> {
            Ok(String::new())
        }

        async fn list_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>> {
            let nodes = self.nodes.lock().unwrap();
            let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
            let mut entries = Vec::new();
            for (k, v) in nodes.iter() {
                if let Some(rest) = k.strip_prefix(prefix.as_str()) {
                    if !rest.is_empty() && !rest.contains('/') {
                        entries.push(RemoteDirEntry { name: rest.to_string(), metadata: to_metadata(v) });
                    }
                }
            }
            Ok(entries)
        }

        async fn setstat(&self, path: &str, attrs: SetStat) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            let entry = nodes.get_mut(path).ok_or_else(|| no_such_file(path))?;
            if let Some(uid) = attrs.uid {
                entry.uid = Some(uid);
            }
            if let Some(gid) = attrs.gid {
                entry.gid = Some(gid);
            }
            if let Some(permissions) = attrs.permissions {
                entry.permissions = Some(permissions);
            }
            if let Some(mtime) = attrs.mtime {
                entry.mtime = Some(mtime);
            }
            Ok(())
        }

        async fn statvfs(&self, _path: &str) -> Result<FileStoreStats> {
            Ok(FileStoreStats::default())
        }
    }

    struct FakeFactory {
        nodes: Arc<Mutex<HashMap<String, FakeEntry>>>,
        deny_atomic_rename: Arc<StdAtomicBool>,
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn connect(
            &self,
            _host: &str,
            _port: u16,
            _env: &Environment,
        ) -> std::result::Result<Box<dyn SftpSession>, anyhow::Error> {
            Ok(Box::new(FakeSession {
                nodes: self.nodes.clone(),
                deny_atomic_rename: self.deny_atomic_rename.clone(),
            }))
        }
    }

    struct TestFs {
        fs: SftpFileSystem,
        nodes: Arc<Mutex<HashMap<String, FakeEntry>>>,
        deny_atomic_rename: Arc<StdAtomicBool>,
    }

    impl TestFs {
        fn insert_file(&self, path: &str, content: &[u8]) {
            self.nodes.lock().unwrap().insert(path.to_string(), FakeEntry::file(content.to_vec()));
        }

        fn insert_dir(&self, path: &str) {
            self.nodes.lock().unwrap().insert(path.to_string(), FakeEntry::dir());
        }

        fn contains(&self, path: &str) -> bool {
            self.nodes.lock().unwrap().contains_key(path)
        }

        fn path(&self, raw: &str) -> SftpPath {
            self.fs.path(raw)
        }
    }

    async fn test_fs() -> TestFs {
        let nodes = Arc::new(Mutex::new(HashMap::new()));
        let deny_atomic_rename = Arc::new(StdAtomicBool::new(false));
        let factory = Arc::new(FakeFactory { nodes: nodes.clone(), deny_atomic_rename: deny_atomic_rename.clone() });
        let authority = crate::uri::parse("sftp://tester@filesystem-test.example/home").unwrap().authority;
        let fs = SftpFileSystem::connect(authority, Environment::new(), factory).await.unwrap();
        TestFs { fs, nodes, deny_atomic_rename }
    }

    fn write_options(flags: &[OpenFlag]) -> OpenOptions {
        OpenOptions::parse(flags.to_vec(), OpenIntent::Write).unwrap()
    }

    /// `spec.md` §8 scenario 3: `CREATE_NEW` against an existing regular
    /// file fails without touching its content.
    #[tokio::test]
    async fn create_new_conflict_does_not_truncate() {
        let t = test_fs().await;
        t.insert_file("/a", b"original");

        let opts = write_options(&[OpenFlag::Write, OpenFlag::CreateNew]);
        let err = t.fs.open_write(&t.path("/a"), &opts).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileAlreadyExists);

        let nodes = t.nodes.lock().unwrap();
        match &nodes.get("/a").unwrap().kind {
            FakeKind::File(content) => assert_eq!(content.as_slice(), b"original"),
            FakeKind::Dir => panic!("expected a file"),
        }
    }

    #[tokio::test]
    async fn open_write_without_create_on_missing_file_propagates_no_such_file() {
        let t = test_fs().await;
        let opts = write_options(&[OpenFlag::Write]);
        let err = t.fs.open_write(&t.path("/missing"), &opts).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchFile);
    }

    #[tokio::test]
    async fn open_write_default_truncates_existing_content() {
        let t = test_fs().await;
        t.insert_file("/a", b"original content");

        let opts = write_options(&[OpenFlag::Write, OpenFlag::Create]);
        let mut writer = t.fs.open_write(&t.path("/a"), &opts).await.unwrap();
        writer.write_all(b"new").await.unwrap();
        writer.close().await.unwrap();

        let nodes = t.nodes.lock().unwrap();
        match &nodes.get("/a").unwrap().kind {
            FakeKind::File(content) => assert_eq!(content.as_slice(), b"new"),
            FakeKind::Dir => panic!("expected a file"),
        }
    }

    #[tokio::test]
    async fn delete_on_non_empty_directory_fails() {
        let t = test_fs().await;
        t.insert_dir("/d");
        t.insert_file("/d/child", b"x");

        let err = t.fs.delete(&t.path("/d")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DirectoryNotEmpty);
        assert!(t.contains("/d"));
    }

    #[tokio::test]
    async fn delete_on_empty_directory_removes_it() {
        let t = test_fs().await;
        t.insert_dir("/d");

        t.fs.delete(&t.path("/d")).await.unwrap();
        assert!(!t.contains("/d"));
    }

    #[tokio::test]
    async fn delete_on_close_removes_file_after_full_read() {
        let t = test_fs().await;
        t.insert_file("/b", b"hello");

        let opts = OpenOptions::parse([OpenFlag::Read, OpenFlag::DeleteOnClose], OpenIntent::Read).unwrap();
        let mut reader = t.fs.open_read(&t.path("/b"), &opts).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
        reader.close().await.unwrap();

        assert!(!t.contains("/b"));
        let err = t.fs.stat(&t.path("/b"), true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchFile);
    }

    #[tokio::test]
    async fn rename_replace_existing_overwrites_target() {
        let t = test_fs().await;
        t.insert_file("/src", b"source");
        t.insert_file("/dst", b"old");

        t.fs
            .rename(&t.path("/src"), &t.path("/dst"), RenameOptions { replace_existing: true, atomic_move: false })
            .await
            .unwrap();

        assert!(!t.contains("/src"));
        let nodes = t.nodes.lock().unwrap();
        match &nodes.get("/dst").unwrap().kind {
            FakeKind::File(content) => assert_eq!(content.as_slice(), b"source"),
            FakeKind::Dir => panic!("expected a file"),
        }
    }

    #[tokio::test]
    async fn rename_without_replace_existing_fails_on_existing_target() {
        let t = test_fs().await;
        t.insert_file("/src", b"source");
        t.insert_file("/dst", b"old");

        let err = t
            .fs
            .rename(&t.path("/src"), &t.path("/dst"), RenameOptions { replace_existing: false, atomic_move: false })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileAlreadyExists);
    }

    #[tokio::test]
    async fn atomic_rename_unsupported_by_server_is_reclassified() {
        let t = test_fs().await;
        t.insert_file("/src", b"source");
        t.deny_atomic_rename.store(true, Ordering::SeqCst);

        let err = t
            .fs
            .rename(&t.path("/src"), &t.path("/dst"), RenameOptions { replace_existing: true, atomic_move: true })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AtomicMoveNotSupported);
    }

    /// `spec.md` §8 scenario 5.
    #[tokio::test]
    async fn copy_with_attributes_propagates_metadata_and_content() {
        let t = test_fs().await;
        let mtime = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        {
            let mut nodes = t.nodes.lock().unwrap();
            nodes.insert(
                "/src".to_string(),
                FakeEntry {
                    kind: FakeKind::File(b"payload".to_vec()),
                    permissions: Some(0o640),
                    uid: Some(42),
                    gid: Some(43),
                    mtime: Some(mtime),
                },
            );
        }

        t.fs
            .copy(&t.path("/src"), &t.path("/dst"), CopyOptions { replace_existing: false, copy_attributes: true })
            .await
            .unwrap();

        let nodes = t.nodes.lock().unwrap();
        let dst = nodes.get("/dst").unwrap();
        match &dst.kind {
            FakeKind::File(content) => assert_eq!(content.as_slice(), b"payload"),
            FakeKind::Dir => panic!("expected a file"),
        }
        assert_eq!(dst.permissions, Some(0o640));
        assert_eq!(dst.uid, Some(42));
        assert_eq!(dst.gid, Some(43));
        assert_eq!(dst.mtime, Some(mtime));
    }

    #[tokio::test]
    async fn copy_without_replace_existing_fails_on_existing_target() {
        let t = test_fs().await;
        t.insert_file("/src", b"payload");
        t.insert_file("/dst", b"old");

        let err = t
            .fs
            .copy(&t.path("/src"), &t.path("/dst"), CopyOptions { replace_existing: false, copy_attributes: false })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileAlreadyExists);
    }

    /// `spec.md` §8 scenario 7: a path from a different filesystem compares
    /// false and never raises.
    #[tokio::test]
    async fn is_same_file_across_filesystems_is_false_without_error() {
        let t = test_fs().await;
        t.insert_file("/a", b"x");
        let foreign = SftpPath::new("some-other-filesystem", "/", "/a");

        let same = t.fs.is_same_file(&t.path("/a"), &foreign).await.unwrap();
        assert!(!same);
    }

    #[tokio::test]
    async fn is_same_file_same_path_is_true_without_a_stat_round_trip() {
        let t = test_fs().await;
        let same = t.fs.is_same_file(&t.path("/a"), &t.path("/a")).await.unwrap();
        assert!(same);
    }

    #[tokio::test]
    async fn is_same_file_distinct_paths_compare_unequal() {
        let t = test_fs().await;
        t.insert_file("/a", b"x");
        t.insert_file("/b", b"y");

        let same = t.fs.is_same_file(&t.path("/a"), &t.path("/b")).await.unwrap();
        assert!(!same);
    }

    #[tokio::test]
    async fn create_dir_on_ambiguous_failure_falls_back_to_stat_probe() {
        let t = test_fs().await;
        t.insert_dir("/existing");

        let err = t.fs.create_dir(&t.path("/existing")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileAlreadyExists);
    }

    #[tokio::test]
    async fn byte_channel_write_seek_read_back_and_truncate() {
        let t = test_fs().await;
        let opts = OpenOptions::parse([OpenFlag::Write, OpenFlag::Create], OpenIntent::Write).unwrap();

        let mut channel = t.fs.open_byte_channel(&t.path("/f"), &opts).await.unwrap();
        channel.write_all(b"hello world").await.unwrap();
        assert_eq!(channel.size().await.unwrap(), 11);

        channel.seek(SeekFrom::Start(0)).await.unwrap();
        let mut buf = [0u8; 5];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        channel.truncate(0).await.unwrap();
        assert_eq!(channel.size().await.unwrap(), 0);

        channel.close().await.unwrap();
        channel.close().await.unwrap(); // idempotent
    }

    #[tokio::test]
    async fn byte_channel_truncate_on_append_mode_is_unsupported() {
        let t = test_fs().await;
        t.insert_file("/f", b"x");
        let opts = OpenOptions::parse([OpenFlag::Write, OpenFlag::Append], OpenIntent::Write).unwrap();

        let mut channel = t.fs.open_byte_channel(&t.path("/f"), &opts).await.unwrap();
        let err = channel.truncate(0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }
}
