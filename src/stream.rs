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

//! Reader/writer adapters returned by [`crate::filesystem::SftpFileSystem`]'s
//! `open_*` operations (`spec.md` §4.5/§4.9).
//!
//! Grounded on `services/sftp/writer.rs`'s `SftpWriter`, which wraps a
//! `TokioCompatFile` and forwards `write`/`close`/`abort`; extended with the
//! pool's second-refcount discipline and `DELETE_ON_CLOSE` handling.

use std::io::SeekFrom;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, AsyncWrite, ReadBuf};

use crate::channel::{ByteChannelMode, SftpFile};
use crate::pool::StreamChannelRef;
use crate::{Error, ErrorKind, Result};

/// A byte stream open for reading. `close()` is the only place the
/// channel's extra refcount is released; it's safe to call more than once.
/// `DELETE_ON_CLOSE` (`spec.md` §4.5 "File open for read") is applied here
/// too, before the channel's extra reference is released.
pub struct SftpReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    channel_ref: StreamChannelRef,
    delete_on_close: Option<String>,
    closed: bool,
}

impl SftpReader {
    pub(crate) fn new(
        inner: Box<dyn AsyncRead + Send + Unpin>,
        channel_ref: StreamChannelRef,
        delete_on_close_path: Option<String>,
    ) -> Self {
        SftpReader {
            inner,
            channel_ref,
            delete_on_close: delete_on_close_path,
            closed: false,
        }
    }

    /// Release this reader's hold on its channel, deleting the file first if
    /// `DELETE_ON_CLOSE` was requested at open time. Idempotent (`spec.md`
    /// §5): a second call is a no-op, not an error.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let delete_result = match self.delete_on_close.take() {
            Some(path) => self.channel_ref.session().remove_file(&path).await,
            None => Ok(()),
        };
        self.channel_ref.release().await;
        delete_result
    }
}

impl AsyncRead for SftpReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// A byte stream open for writing (or appending). On `close()`, the
/// underlying file is flushed/shut down, the delete-on-close path (if
/// requested at open time) is applied, and the channel's extra refcount is
/// released last — the file must be gone before the channel that deleted it
/// is allowed to recycle.
pub struct SftpWriter {
    inner: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    channel_ref: StreamChannelRef,
    delete_on_close: Option<DeleteOnClose>,
}

struct DeleteOnClose {
    path: String,
}

impl SftpWriter {
    pub(crate) fn new(
        inner: Box<dyn AsyncWrite + Send + Unpin>,
        channel_ref: StreamChannelRef,
        delete_on_close_path: Option<String>,
    ) -> Self {
        SftpWriter {
            inner: Some(inner),
            channel_ref,
            delete_on_close: delete_on_close_path.map(|path| DeleteOnClose { path }),
        }
    }

    /// Flush and close the file, deleting it first if `DELETE_ON_CLOSE` was
    /// requested at open time, then release the channel. A primary I/O
    /// failure is returned; a delete-on-close failure that happens after a
    /// successful flush is folded into the result as context rather than
    /// silently dropped (`spec.md` §4.1/§7).
    pub async fn close(&mut self) -> Result<()> {
        let flush_result = if let Some(inner) = self.inner.as_mut() {
            use tokio::io::AsyncWriteExt;
            let result = inner.shutdown().await;
            self.inner = None;
            result
        } else {
            Ok(())
        };

        let mut error = flush_result.err().map(|e| {
            Error::new(ErrorKind::Unexpected, e.to_string())
                .with_operation("close")
                .with_source(e)
        });

        if let Some(delete) = self.delete_on_close.take() {
            if let Err(e) = self.channel_ref.session().remove_file(&delete.path).await {
                error = Some(match error.take() {
                    Some(existing) => existing.with_context("delete_on_close_failure", e.to_string()),
                    None => e,
                });
            }
        }

        self.channel_ref.release().await;

        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Abandon the write without flushing or applying `DELETE_ON_CLOSE`, and
    /// release the channel. Used when a caller fails mid-write and wants to
    /// drop the partial file descriptor without a second close attempt.
    pub async fn abort(&mut self) {
        self.inner = None;
        self.channel_ref.release().await;
    }
}

impl AsyncWrite for SftpWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match this.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_write(cx, buf),
            None => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "writer already closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// A random-access byte stream (`spec.md` §4.5 "Byte channel"): the same
/// ref-holding discipline as [`SftpReader`]/[`SftpWriter`], plus `position`/
/// `size`/`truncate`. `close()` is the only place the channel's extra
/// refcount is released; idempotent like the other two adapters.
pub struct SftpByteChannel {
    inner: Box<dyn SftpFile>,
    channel_ref: StreamChannelRef,
    path: String,
    append: bool,
    closed: bool,
}

impl SftpByteChannel {
    pub(crate) fn new(inner: Box<dyn SftpFile>, channel_ref: StreamChannelRef, path: String, append: bool) -> Self {
        SftpByteChannel {
            inner,
            channel_ref,
            path,
            append,
            closed: false,
        }
    }

    /// Current offset, per `spec.md` §4.5's "position" verb.
    pub async fn position(&mut self) -> Result<u64> {
        self.inner.stream_position().await.map_err(|e| io_error(e, "position", &self.path))
    }

    /// Reposition the channel; `spec.md` §4.5's "position" verb used as a
    /// setter.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.inner.seek(pos).await.map_err(|e| io_error(e, "seek", &self.path))
    }

    /// Current file size, via a fresh `stat` (SFTP has no cheaper local
    /// notion of size once a handle is open).
    pub async fn size(&self) -> Result<u64> {
        let meta = self.channel_ref.session().stat(&self.path, true).await?;
        Ok(meta.size)
    }

    /// Truncate the file. SFTP v3 has no partial in-place truncate through
    /// this crate's primitives: a non-append channel is reopened in
    /// overwrite mode, discarding its content regardless of `size`, and
    /// repositioned at offset 0 (`spec.md` §4.5: "Truncate on a non-append
    /// open behaves as re-opening the file in overwrite mode").
    pub async fn truncate(&mut self, size: u64) -> Result<()> {
        let _ = size;
        if self.append {
            return Err(Error::new(
                ErrorKind::UnsupportedOperation,
                "truncate is not supported on an append-mode byte channel",
            )
            .with_operation("truncate")
            .with_path(self.path.clone()));
        }
        self.inner = self
            .channel_ref
            .session()
            .open_byte_channel(&self.path, ByteChannelMode::Overwrite)
            .await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.channel_ref.release().await;
        Ok(())
    }
}

fn io_error(e: std::io::Error, op: &'static str, path: &str) -> Error {
    Error::new(ErrorKind::Unexpected, e.to_string())
        .with_operation(op)
        .with_path(path)
        .with_source(e)
}

impl AsyncRead for SftpByteChannel {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SftpByteChannel {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl AsyncSeek for SftpByteChannel {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        Pin::new(&mut self.get_mut().inner).start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Pin::new(&mut self.get_mut().inner).poll_complete(cx)
    }
}
