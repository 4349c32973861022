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

//! A virtual filesystem over SFTP.
//!
//! One [`filesystem::SftpFileSystem`] is opened per authority
//! (`sftp://user@host:port`) through [`provider::new_filesystem`], backed by
//! a bounded [`pool::ChannelPool`] of SFTP channels. Paths are resolved
//! relative to the channel's login directory unless an `Environment` default
//! directory overrides it; file operations acquire a channel, run, and
//! release it back to the pool.
//!
//! ```no_run
//! # async fn example() -> sftp_fs::Result<()> {
//! use sftp_fs::Environment;
//!
//! let fs = sftp_fs::provider::new_filesystem("sftp://alice@example.com/home/alice", Environment::new()).await?;
//! let entries = fs.list_dir(&fs.path(".")).await?;
//! for entry in entries {
//!     println!("{entry}");
//! }
//! # Ok(())
//! # }
//! ```

mod attributes;
mod channel;
mod channel_openssh;
mod environment;
mod error;
mod filesystem;
mod options;
mod path;
mod pool;
pub mod provider;
mod stream;
mod uri;

pub use attributes::{AttributeValue, AttributeView, BasicAttributes, PosixAttributes, WritableAttribute};
pub use channel::{FileStoreStats, RemoteDirEntry, RemoteMetadata, SessionFactory, SetStat, SftpSession, WriteMode};
pub use environment::Environment;
pub use error::{ErrorKind, Error, ExceptionFactory, Operation, RemoteStatus, Result};
pub use filesystem::{CopyOptions, RenameOptions, SftpFileSystem};
pub use options::{OpenFlag, OpenIntent, OpenOptions};
pub use path::SftpPath;
pub use stream::{SftpByteChannel, SftpReader, SftpWriter};
pub use uri::AuthorityKey;
