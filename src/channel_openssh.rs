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

//! Real [`SftpSession`] backed by `openssh` + `openssh-sftp-client`, the
//! same pair `services::sftp::backend` uses in the teacher crate.

use std::pin::Pin;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use openssh::{KnownHosts, SessionBuilder};
use openssh_sftp_client::error::SftpErrorKind;
use openssh_sftp_client::file::TokioCompatFile;
use openssh_sftp_client::metadata::MetaData as WireMetadata;
use openssh_sftp_client::{Error as SftpClientError, Sftp, SftpOptions};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::{
    ByteChannelMode, FileStoreStats, RemoteDirEntry, RemoteMetadata, SessionFactory, SetStat,
    SftpFile, SftpSession, WriteMode,
};
use crate::environment::Environment;
use crate::error::ExceptionFactory;
use crate::{Error, ErrorKind, Result};

/// The default, real [`SessionFactory`]: dials an SSH session with
/// `openssh`, then an SFTP subsystem channel on top of it with
/// `openssh-sftp-client`.
#[derive(Default)]
pub struct OpensshSessionFactory;

#[async_trait]
impl SessionFactory for OpensshSessionFactory {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        env: &Environment,
    ) -> std::result::Result<Box<dyn SftpSession>, anyhow::Error> {
        let mut builder = SessionBuilder::default();

        if let Some(user) = env.username() {
            builder.user(user.to_string());
        }
        builder.port(port);
        if let Some(timeout) = env.connect_timeout() {
            builder.connect_timeout(timeout);
        }
        if let Some(alive) = env.server_alive_interval() {
            builder.server_alive_interval(alive);
        } else {
            builder.server_alive_interval(Duration::from_secs(15));
        }
        if let Some(known_hosts) = env.known_hosts() {
            builder.known_hosts_check(KnownHosts::Strict);
            builder.config_file(known_hosts.to_string());
        } else {
            builder.known_hosts_check(KnownHosts::Add);
        }
        for (k, v) in env.config() {
            builder.config(k.clone(), v.clone());
        }

        let session = builder.connect(host).await?;
        let sftp = Sftp::from_session(session, SftpOptions::default()).await?;

        Ok(Box::new(OpensshSession {
            sftp,
            exception_factory: env.exception_factory(),
        }))
    }
}

struct OpensshSession {
    sftp: Sftp,
    exception_factory: Option<std::sync::Arc<dyn ExceptionFactory>>,
}

fn wire_metadata_to_remote(meta: &WireMetadata) -> RemoteMetadata {
    let file_type = meta.file_type();
    RemoteMetadata {
        is_dir: file_type.map(|t| t.is_dir()).unwrap_or(false),
        is_symlink: file_type.map(|t| t.is_symlink()).unwrap_or(false),
        is_regular: file_type.map(|t| t.is_file()).unwrap_or(false),
        size: meta.len().unwrap_or(0),
        mtime: meta
            .modified()
            .map(|t| SystemTime::UNIX_EPOCH + Duration::from_secs(t.as_secs() as u64)),
        atime: meta
            .accessed()
            .map(|t| SystemTime::UNIX_EPOCH + Duration::from_secs(t.as_secs() as u64)),
        uid: meta.uid(),
        gid: meta.gid(),
        permissions: meta.permissions().map(|p| p.bits() & 0o777),
    }
}

fn classify(err: &SftpClientError) -> crate::error::RemoteStatus {
    use crate::error::RemoteStatus;
    match err {
        SftpClientError::SftpError(kind, _) => match kind {
            SftpErrorKind::NoSuchFile => RemoteStatus::NoSuchFile,
            SftpErrorKind::PermissionDenied => RemoteStatus::PermissionDenied,
            SftpErrorKind::OpUnsupported => RemoteStatus::OpUnsupported,
            SftpErrorKind::Failure => RemoteStatus::Other,
            _ => RemoteStatus::Other,
        },
        _ => RemoteStatus::Other,
    }
}

impl OpensshSession {
    fn to_error(&self, op: crate::error::Operation, path: &str, err: SftpClientError) -> Error {
        let status = classify(&err);
        crate::channel::translate(
            self.exception_factory.as_deref(),
            op,
            status,
            path,
            None,
            anyhow::anyhow!(err),
        )
    }
}

#[async_trait]
impl SftpSession for OpensshSession {
    async fn is_connected(&self) -> bool {
        // openssh-sftp-client has no direct liveness probe; a trivial
        // round trip is used instead and interpreted by the pool's
        // liveness check (`pool.rs`) rather than here.
        true
    }

    async fn keep_alive(&self) -> Result<()> {
        self.sftp
            .fs()
            .metadata(".")
            .await
            .map(|_| ())
            .map_err(|e| self.to_error(crate::error::Operation::Stat, ".", e))
    }

    async fn pwd(&self) -> Result<String> {
        Ok(self.sftp.fs().cwd().to_string_lossy().into_owned())
    }

    async fn disconnect(&self) {
        // Dropping the last handle to `Sftp` closes the underlying
        // channel; there is no explicit async disconnect in the wire
        // client, so this is intentionally a no-op and relies on `Drop`.
    }

    async fn stat(&self, path: &str, follow_links: bool) -> Result<RemoteMetadata> {
        let fs = self.sftp.fs();
        let meta = if follow_links {
            fs.metadata(path).await
        } else {
            fs.symlink_metadata(path).await
        }
        .map_err(|e| self.to_error(crate::error::Operation::Stat, path, e))?;
        Ok(wire_metadata_to_remote(&meta))
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| self.to_error(crate::error::Operation::OpenInput, path, e))?;
        Ok(Box::new(TokioCompatFile::new(file)))
    }

    async fn open_write(
        &self,
        path: &str,
        mode: WriteMode,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let mut options = self.sftp.options();
        options.write(true).create(true);
        match mode {
            WriteMode::Overwrite => {
                options.truncate(true);
            }
            WriteMode::Append => {
                options.append(true);
            }
        }
        let file = options
            .open(&self.sftp, path)
            .await
            .map_err(|e| self.to_error(crate::error::Operation::OpenOutput, path, e))?;
        Ok(Box::new(TokioCompatFile::new(file)))
    }

    async fn open_byte_channel(&self, path: &str, mode: ByteChannelMode) -> Result<Box<dyn SftpFile>> {
        let mut options = self.sftp.options();
        options.read(true);
        let op = match mode {
            ByteChannelMode::ReadOnly => crate::error::Operation::OpenInput,
            ByteChannelMode::ReadWrite => {
                options.write(true).create(true);
                crate::error::Operation::OpenOutput
            }
            ByteChannelMode::Overwrite => {
                options.write(true).create(true).truncate(true);
                crate::error::Operation::OpenOutput
            }
            ByteChannelMode::Append => {
                options.write(true).create(true).append(true);
                crate::error::Operation::OpenOutput
            }
        };

        let file = options
            .open(&self.sftp, path)
            .await
            .map_err(|e| self.to_error(op, path, e))?;
        Ok(Box::new(TokioCompatFile::new(file)))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.sftp
            .fs()
            .create_dir(path)
            .await
            .map_err(|e| self.to_error(crate::error::Operation::Mkdir, path, e))
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        self.sftp
            .fs()
            .remove_dir(path)
            .await
            .map_err(|e| self.to_error(crate::error::Operation::DeleteDir, path, e))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.sftp
            .fs()
            .remove_file(path)
            .await
            .map_err(|e| self.to_error(crate::error::Operation::DeleteFile, path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.sftp
            .fs()
            .rename(from, to)
            .await
            .map_err(|e| self.to_error(crate::error::Operation::Rename, from, e))
    }

    async fn readlink(&self, path: &str) -> Result<String> {
        let target = self
            .sftp
            .fs()
            .read_link(path)
            .await
            .map_err(|e| self.to_error(crate::error::Operation::Readlink, path, e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>> {
        use futures::StreamExt;

        let mut dir = self
            .sftp
            .fs()
            .open_dir(path)
            .await
            .map_err(|e| self.to_error(crate::error::Operation::List, path, e))?
            .read_dir();

        let mut entries = Vec::new();
        while let Some(entry) = Pin::new(&mut dir).next().await {
            let entry = entry.map_err(|e| self.to_error(crate::error::Operation::List, path, e))?;
            let name = entry.filename().to_string_lossy().into_owned();
            if name == "." || name == ".." {
                continue;
            }
            let metadata = entry
                .metadata()
                .map(wire_metadata_to_remote)
                .unwrap_or_default();
            entries.push(RemoteDirEntry { name, metadata });
        }
        Ok(entries)
    }

    async fn setstat(&self, path: &str, attrs: SetStat) -> Result<()> {
        use openssh_sftp_client::metadata::{MetaDataBuilder, Permissions};

        let mut builder = MetaDataBuilder::new();
        if let (Some(uid), Some(gid)) = (attrs.uid, attrs.gid) {
            builder.uid(uid).gid(gid);
        } else if let Some(uid) = attrs.uid {
            builder.uid(uid);
        } else if let Some(gid) = attrs.gid {
            builder.gid(gid);
        }
        if let Some(perm) = attrs.permissions {
            builder.permissions(Permissions::from_bits_truncate(perm));
        }
        if let Some(mtime) = attrs.mtime {
            if let Ok(since_epoch) = mtime.duration_since(SystemTime::UNIX_EPOCH) {
                builder.mtime(since_epoch.into());
            }
        }

        self.sftp
            .fs()
            .set_metadata(path, builder.create())
            .await
            .map_err(|e| self.to_error(crate::error::Operation::Chmod, path, e))
    }

    async fn statvfs(&self, path: &str) -> Result<FileStoreStats> {
        let stats = self.sftp.fs().statvfs(path).await.map_err(|e| {
            let status = classify(&e);
            if status == crate::error::RemoteStatus::OpUnsupported {
                Error::new(ErrorKind::UnsupportedOperation, "statVFS not supported by server")
                    .with_operation(crate::error::Operation::StatVfs.as_str())
                    .with_path(path)
            } else {
                self.to_error(crate::error::Operation::StatVfs, path, e)
            }
        })?;

        Ok(FileStoreStats {
            total_space: stats.total_space(),
            usable_space: stats.available_space(),
            unallocated_space: stats.free_space(),
        })
    }
}
