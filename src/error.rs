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

//! Errors returned by this crate.
//!
//! # Examples
//!
//! ```
//! use sftp_fs::{Error, ErrorKind};
//!
//! fn handle(err: Error) {
//!     if err.kind() == ErrorKind::NoSuchFile {
//!         println!("not found");
//!     }
//! }
//! ```

use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::io;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The kinds of error this crate can return.
///
/// This enumerates exactly the kinds `spec.md` §7 lists; `Unexpected` is the
/// generic catch-all for remote failures that don't map onto a more specific
/// kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    NoSuchFile,
    FileAlreadyExists,
    AccessDenied,
    DirectoryNotEmpty,
    IsADirectory,
    NotDirectory,
    AtomicMoveNotSupported,
    UnsupportedOperation,
    ClosedFileSystem,
    ProviderMismatch,
    FileSystemAlreadyExists,
    FileSystemNotFound,
    IllegalArgument,
    ClientConnectionWaitTimeoutExpired,
    InterruptedIo,
    /// Everything else: a remote failure with no more specific kind.
    Unexpected,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NoSuchFile => "NoSuchFile",
            ErrorKind::FileAlreadyExists => "FileAlreadyExists",
            ErrorKind::AccessDenied => "AccessDenied",
            ErrorKind::DirectoryNotEmpty => "DirectoryNotEmpty",
            ErrorKind::IsADirectory => "IsADirectory",
            ErrorKind::NotDirectory => "NotDirectory",
            ErrorKind::AtomicMoveNotSupported => "AtomicMoveNotSupported",
            ErrorKind::UnsupportedOperation => "UnsupportedOperation",
            ErrorKind::ClosedFileSystem => "ClosedFileSystem",
            ErrorKind::ProviderMismatch => "ProviderMismatch",
            ErrorKind::FileSystemAlreadyExists => "FileSystemAlreadyExists",
            ErrorKind::FileSystemNotFound => "FileSystemNotFound",
            ErrorKind::IllegalArgument => "IllegalArgument",
            ErrorKind::ClientConnectionWaitTimeoutExpired => "ClientConnectionWaitTimeoutExpired",
            ErrorKind::InterruptedIo => "InterruptedIo",
            ErrorKind::Unexpected => "Unexpected",
        };
        write!(f, "{s}")
    }
}

/// The primary path (and, for two-path operations like rename/copy, the
/// secondary path) an error occurred against.
pub struct Error {
    kind: ErrorKind,
    message: String,

    operation: &'static str,
    context: Vec<(&'static str, String)>,
    source: Option<anyhow::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            operation: "",
            context: Vec::new(),
            source: None,
        }
    }

    /// Attach the operation this error occurred during (`"rename"`,
    /// `"open-input"`, ...). If an operation is already set, it's preserved
    /// in the context under `"called"` so nested attribution isn't lost.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            self.context.push(("called", self.operation.to_string()));
        }
        self.operation = operation;
        self
    }

    pub fn with_path(self, path: impl Into<String>) -> Self {
        self.with_context("path", path)
    }

    pub fn with_second_path(self, path: impl Into<String>) -> Self {
        self.with_context("second_path", path)
    }

    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    pub fn with_source(mut self, src: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none());
        self.source = Some(src.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.operation.is_empty() {
            write!(f, " at {}", self.operation)?;
        }
        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            write!(
                f,
                "{}",
                self.context
                    .iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )?;
            write!(f, " }}")?;
        }
        write!(f, " => {}", self.message)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} at {} => {}", self.kind, self.operation, self.message)?;
        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "    {k}: {v}")?;
            }
        }
        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source: {:?}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind() {
            ErrorKind::NoSuchFile => io::ErrorKind::NotFound,
            ErrorKind::FileAlreadyExists => io::ErrorKind::AlreadyExists,
            ErrorKind::AccessDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::InterruptedIo => io::ErrorKind::Interrupted,
            ErrorKind::UnsupportedOperation => io::ErrorKind::Unsupported,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Operations the exception-translation policy (C2) knows how to attribute
/// an error to. Matches `spec.md` §4.2's enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Operation {
    OpenInput,
    OpenOutput,
    Stat,
    List,
    Mkdir,
    DeleteFile,
    DeleteDir,
    Rename,
    Chown,
    Chgrp,
    Chmod,
    SetMtime,
    Readlink,
    Chdir,
    StatVfs,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::OpenInput => "open-input",
            Operation::OpenOutput => "open-output",
            Operation::Stat => "stat",
            Operation::List => "list",
            Operation::Mkdir => "mkdir",
            Operation::DeleteFile => "delete-file",
            Operation::DeleteDir => "delete-dir",
            Operation::Rename => "rename",
            Operation::Chown => "chown",
            Operation::Chgrp => "chgrp",
            Operation::Chmod => "chmod",
            Operation::SetMtime => "set-mtime",
            Operation::Readlink => "readlink",
            Operation::Chdir => "chdir",
            Operation::StatVfs => "stat-vfs",
        }
    }
}

/// A remote status, abstracted away from any particular SFTP client crate's
/// status-code enum. `channel.rs`'s `SftpSession` implementations translate
/// their own library's error types into this before handing them to the
/// exception factory, keeping C2 decoupled from the wire client (per
/// `spec.md` §1, the wire client is an external collaborator).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteStatus {
    NoSuchFile,
    PermissionDenied,
    FileAlreadyExists,
    OpUnsupported,
    Other,
}

/// Polymorphic mapping from `(operation, path, [second path], cause)` to a
/// filesystem [`Error`]. A tagged variant over operations (rather than deep
/// inheritance) per `spec.md` §9's design note.
pub trait ExceptionFactory: Send + Sync {
    fn translate(
        &self,
        op: Operation,
        status: RemoteStatus,
        path: &str,
        second_path: Option<&str>,
        cause: anyhow::Error,
    ) -> Error;
}

/// The default policy described by `spec.md` §4.2's mapping rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExceptionFactory;

impl ExceptionFactory for DefaultExceptionFactory {
    fn translate(
        &self,
        op: Operation,
        status: RemoteStatus,
        path: &str,
        second_path: Option<&str>,
        cause: anyhow::Error,
    ) -> Error {
        let kind = match status {
            RemoteStatus::NoSuchFile => ErrorKind::NoSuchFile,
            RemoteStatus::PermissionDenied => ErrorKind::AccessDenied,
            RemoteStatus::FileAlreadyExists => ErrorKind::FileAlreadyExists,
            RemoteStatus::OpUnsupported if op == Operation::StatVfs || op == Operation::Rename => {
                ErrorKind::UnsupportedOperation
            }
            _ => ErrorKind::Unexpected,
        };

        let mut err = Error::new(kind, cause.to_string())
            .with_operation(op.as_str())
            .with_path(path)
            .with_source(cause);
        if let Some(second) = second_path {
            err = err.with_second_path(second);
        }
        err
    }
}
