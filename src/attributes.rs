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

//! Attribute views (C7): the `basic`/`owner`/`posix` record shapes
//! (`spec.md` §4.5 "Attribute reads/writes", §4.7) and the polymorphic view
//! object layered on top of the façade.
//!
//! No teacher analog exists for this — OpenDAL's `Metadata` is a flat
//! struct, not a named-view system — so the shapes below are built directly
//! from `spec.md`'s description of a POSIX-shaped attribute record.

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use crate::channel::RemoteMetadata;
use crate::filesystem::SftpFileSystem;
use crate::path::SftpPath;
use crate::{Error, ErrorKind, Result};

/// `spec.md` §4.5's POSIX-shaped attribute record. `creation` has no SFTP
/// counterpart and is synthesized as `last_modified`.
#[derive(Clone, Debug)]
pub struct BasicAttributes {
    pub last_modified: Option<SystemTime>,
    pub last_access: Option<SystemTime>,
    pub creation: Option<SystemTime>,
    pub size: u64,
    /// Inode-ish identity, synthesized from the filesystem id and resolved
    /// path when the server doesn't expose a real inode number.
    pub file_key: String,
    pub is_regular_file: bool,
    pub is_directory: bool,
    pub is_symbolic_link: bool,
    pub is_other: bool,
}

#[derive(Clone, Debug)]
pub struct PosixAttributes {
    pub basic: BasicAttributes,
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub permissions: Option<u32>,
}

pub(crate) fn synthesize_file_key(path: &SftpPath) -> String {
    format!("{}:{}", path.filesystem_id(), path.to_absolute_string())
}

pub(crate) fn basic_from_remote(path: &SftpPath, meta: &RemoteMetadata) -> BasicAttributes {
    BasicAttributes {
        last_modified: meta.mtime,
        last_access: meta.atime,
        creation: meta.mtime,
        size: meta.size,
        file_key: synthesize_file_key(path),
        is_regular_file: meta.is_regular,
        is_directory: meta.is_dir,
        is_symbolic_link: meta.is_symlink,
        is_other: !meta.is_regular && !meta.is_dir && !meta.is_symlink,
    }
}

pub(crate) fn posix_from_remote(path: &SftpPath, meta: &RemoteMetadata) -> PosixAttributes {
    PosixAttributes {
        basic: basic_from_remote(path, meta),
        owner: meta.uid,
        group: meta.gid,
        permissions: meta.permissions,
    }
}

/// One value read out of a named-attribute selector such as
/// `"basic:size,lastModifiedTime"`.
#[derive(Clone, Debug)]
pub enum AttributeValue {
    Time(SystemTime),
    Size(u64),
    Id(u32),
    Permissions(u32),
    Flag(bool),
    Text(String),
}

/// Parse `"view:name,name2,..."` and return the requested values out of
/// `attrs`. Unknown view or attribute name fails with `IllegalArgument`
/// (`spec.md` §4.5).
pub fn read_selector(selector: &str, attrs: &PosixAttributes) -> Result<Vec<(String, AttributeValue)>> {
    let (view, names) = selector
        .split_once(':')
        .ok_or_else(|| illegal_argument(selector))?;

    names
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|name| read_one(view, name, attrs).map(|v| (name.to_string(), v)))
        .collect()
}

fn read_one(view: &str, name: &str, attrs: &PosixAttributes) -> Result<AttributeValue> {
    match (view, name) {
        ("basic", "size") => Ok(AttributeValue::Size(attrs.basic.size)),
        ("basic", "lastModifiedTime") => attrs
            .basic
            .last_modified
            .map(AttributeValue::Time)
            .ok_or_else(|| illegal_argument(name)),
        ("basic", "lastAccessTime") => attrs
            .basic
            .last_access
            .map(AttributeValue::Time)
            .ok_or_else(|| illegal_argument(name)),
        ("basic", "creationTime") => attrs
            .basic
            .creation
            .map(AttributeValue::Time)
            .ok_or_else(|| illegal_argument(name)),
        ("basic", "isRegularFile") => Ok(AttributeValue::Flag(attrs.basic.is_regular_file)),
        ("basic", "isDirectory") => Ok(AttributeValue::Flag(attrs.basic.is_directory)),
        ("basic", "isSymbolicLink") => Ok(AttributeValue::Flag(attrs.basic.is_symbolic_link)),
        ("basic", "isOther") => Ok(AttributeValue::Flag(attrs.basic.is_other)),
        ("basic", "fileKey") => Ok(AttributeValue::Text(attrs.basic.file_key.clone())),
        ("owner", "owner") | ("posix", "owner") => {
            attrs.owner.map(AttributeValue::Id).ok_or_else(|| illegal_argument(name))
        }
        ("posix", "group") => attrs.group.map(AttributeValue::Id).ok_or_else(|| illegal_argument(name)),
        ("posix", "permissions") => attrs
            .permissions
            .map(AttributeValue::Permissions)
            .ok_or_else(|| illegal_argument(name)),
        _ => Err(illegal_argument(name)),
    }
}

/// The writable attribute a `"view:name"` selector resolves to
/// (`spec.md` §4.5 "Attribute writes"): dispatches to `chmod`, `chown`,
/// `chgrp`, or `setMtime` in the façade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WritableAttribute {
    Permissions,
    Owner,
    Group,
    LastModifiedTime,
}

pub fn parse_writable_attribute(selector: &str) -> Result<WritableAttribute> {
    let (view, name) = selector
        .split_once(':')
        .ok_or_else(|| illegal_argument(selector))?;

    match (view, name) {
        ("posix", "permissions") => Ok(WritableAttribute::Permissions),
        ("owner", "owner") | ("posix", "owner") => Ok(WritableAttribute::Owner),
        ("posix", "group") => Ok(WritableAttribute::Group),
        ("basic", "lastModifiedTime") => Ok(WritableAttribute::LastModifiedTime),
        _ => Err(illegal_argument(selector)),
    }
}

fn illegal_argument(what: &str) -> Error {
    Error::new(ErrorKind::IllegalArgument, format!("unknown attribute selector: {what}"))
        .with_operation("parse-attribute")
}

/// One of the three named views (`spec.md` §4.7): `"basic"`, `"owner"`, or
/// `"posix"`. Holds a weak reference to the owning filesystem plus the
/// target path and link-following mode; reads/writes delegate to the
/// façade. Requesting an unknown view returns `None`, not an error —
/// matching the standard filesystem-view contract of "null view" for an
/// unsupported name.
pub struct AttributeView {
    fs: Weak<SftpFileSystem>,
    path: SftpPath,
    follow_links: bool,
    name: &'static str,
}

impl AttributeView {
    pub fn for_name(name: &str, fs: Weak<SftpFileSystem>, path: SftpPath, follow_links: bool) -> Option<Self> {
        let name = match name {
            "basic" => "basic",
            "owner" => "owner",
            "posix" => "posix",
            _ => return None,
        };
        Some(AttributeView {
            fs,
            path,
            follow_links,
            name,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn upgrade(&self) -> Result<Arc<SftpFileSystem>> {
        self.fs
            .upgrade()
            .ok_or_else(|| Error::new(ErrorKind::ClosedFileSystem, "filesystem no longer exists").with_operation("attribute-view"))
    }

    pub async fn read_basic(&self) -> Result<BasicAttributes> {
        let fs = self.upgrade()?;
        fs.read_basic_attributes(&self.path, self.follow_links).await
    }

    pub async fn read_posix(&self) -> Result<PosixAttributes> {
        let fs = self.upgrade()?;
        fs.read_posix_attributes(&self.path, self.follow_links).await
    }

    pub async fn set_times(&self, mtime: SystemTime) -> Result<()> {
        let fs = self.upgrade()?;
        fs.set_last_modified_time(&self.path, mtime, self.follow_links).await
    }

    pub async fn set_owner(&self, uid: u32) -> Result<()> {
        let fs = self.upgrade()?;
        fs.set_owner(&self.path, uid, self.follow_links).await
    }

    pub async fn set_group(&self, gid: u32) -> Result<()> {
        let fs = self.upgrade()?;
        fs.set_group(&self.path, gid, self.follow_links).await
    }

    pub async fn set_permissions(&self, mode: u32) -> Result<()> {
        let fs = self.upgrade()?;
        fs.set_permissions(&self.path, mode, self.follow_links).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> PosixAttributes {
        PosixAttributes {
            basic: BasicAttributes {
                last_modified: Some(SystemTime::UNIX_EPOCH),
                last_access: None,
                creation: Some(SystemTime::UNIX_EPOCH),
                size: 42,
                file_key: "fs1:/a".to_string(),
                is_regular_file: true,
                is_directory: false,
                is_symbolic_link: false,
                is_other: false,
            },
            owner: Some(1000),
            group: Some(1000),
            permissions: Some(0o640),
        }
    }

    #[test]
    fn reads_multiple_basic_attributes() {
        let attrs = sample();
        let values = read_selector("basic:size,lastModifiedTime", &attrs).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].0, "size");
        assert!(matches!(values[0].1, AttributeValue::Size(42)));
    }

    #[test]
    fn reads_posix_permissions() {
        let attrs = sample();
        let values = read_selector("posix:permissions", &attrs).unwrap();
        assert!(matches!(values[0].1, AttributeValue::Permissions(0o640)));
    }

    #[test]
    fn unknown_view_is_illegal_argument() {
        let attrs = sample();
        let err = read_selector("weird:thing", &attrs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    }

    #[test]
    fn parses_writable_attribute_names() {
        assert_eq!(
            parse_writable_attribute("posix:permissions").unwrap(),
            WritableAttribute::Permissions
        );
        assert_eq!(
            parse_writable_attribute("owner:owner").unwrap(),
            WritableAttribute::Owner
        );
        assert_eq!(
            parse_writable_attribute("posix:group").unwrap(),
            WritableAttribute::Group
        );
        assert_eq!(
            parse_writable_attribute("basic:lastModifiedTime").unwrap(),
            WritableAttribute::LastModifiedTime
        );
        assert!(parse_writable_attribute("posix:nonsense").is_err());
    }
}
