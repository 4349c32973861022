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

//! The `Path` entity (`spec.md` §3): an immutable, normalized,
//! absolute-or-relative POSIX-style path bound to a filesystem instance.
//!
//! `spec.md` §1 treats general path algebra as an external given; this
//! module only implements the slice of it the façade actually needs:
//! normalizing, resolving against a default directory, and splitting into
//! parent/file-name. It is not a general-purpose path library.

use std::fmt;

/// Normalize a raw path string: trim whitespace, collapse repeated `/`,
/// treat empty as `/`. Unlike the teacher's `normalize_path`, a leading `/`
/// is preserved (it's meaningful here: it marks an absolute path) rather
/// than stripped for root-relative joining.
pub fn normalize(raw: &str) -> String {
    let raw = raw.trim();
    let absolute = raw.starts_with('/');

    let collapsed = raw
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/");

    if absolute {
        format!("/{collapsed}")
    } else if collapsed.is_empty() {
        ".".to_string()
    } else {
        collapsed
    }
}

/// An immutable path bound to one filesystem's identity and default
/// directory. Equality includes the filesystem identity (`spec.md` §3), so
/// two textually-identical paths bound to different filesystems compare
/// unequal.
#[derive(Clone, Debug)]
pub struct SftpPath {
    /// Opaque identity of the owning filesystem (its authority key string).
    filesystem_id: String,
    /// Default directory captured at connect time, used to resolve
    /// relative paths to absolute ones.
    default_dir: String,
    /// The normalized, possibly-relative path string as given by the
    /// caller.
    raw: String,
}

impl SftpPath {
    pub fn new(filesystem_id: impl Into<String>, default_dir: impl Into<String>, raw: &str) -> Self {
        SftpPath {
            filesystem_id: filesystem_id.into(),
            default_dir: normalize(&default_dir.into()),
            raw: normalize(raw),
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.raw.starts_with('/')
    }

    /// Resolve this path to an absolute SFTP path string, using the
    /// filesystem's default directory when this path is relative.
    pub fn to_absolute_string(&self) -> String {
        if self.is_absolute() {
            self.raw.clone()
        } else if self.raw == "." {
            self.default_dir.clone()
        } else if self.default_dir == "/" {
            format!("/{}", self.raw)
        } else {
            format!("{}/{}", self.default_dir, self.raw)
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn filesystem_id(&self) -> &str {
        &self.filesystem_id
    }

    /// The final path segment, or `/` for the root.
    pub fn file_name(&self) -> &str {
        let abs = self.raw.trim_end_matches('/');
        if abs.is_empty() {
            return "/";
        }
        match abs.rfind('/') {
            Some(idx) => &abs[idx + 1..],
            None => abs,
        }
    }

    /// The parent path, in the same (absolute/relative) style as this path.
    /// `None` for the root and for single-segment relative paths.
    pub fn parent(&self) -> Option<SftpPath> {
        let abs = self.raw.trim_end_matches('/');
        let idx = abs.rfind('/')?;
        let parent_raw = if idx == 0 { "/" } else { &abs[..idx] };
        Some(SftpPath::new(
            self.filesystem_id.clone(),
            self.default_dir.clone(),
            parent_raw,
        ))
    }

    pub fn join(&self, child: &str) -> SftpPath {
        let joined = if self.raw == "/" {
            format!("/{child}")
        } else {
            format!("{}/{}", self.raw, child)
        };
        SftpPath::new(self.filesystem_id.clone(), self.default_dir.clone(), &joined)
    }
}

impl fmt::Display for SftpPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl PartialEq for SftpPath {
    fn eq(&self, other: &Self) -> bool {
        self.filesystem_id == other.filesystem_id && self.to_absolute_string() == other.to_absolute_string()
    }
}

impl Eq for SftpPath {}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normalize_collapses_and_preserves_absoluteness() {
        assert_eq!(normalize("///abc//def"), "/abc/def");
        assert_eq!(normalize("abc///def"), "abc/def");
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("  /abc/ "), "/abc");
    }

    /// Scenario 2 in `spec.md` §8: with default dir `/home/user`, resolving
    /// each of `{"/", "foo", "/foo", "foo/bar", "/foo/bar"}` must produce
    /// the listed absolute path strings.
    #[test]
    fn resolves_against_default_directory() {
        let cases = [
            ("/", "/"),
            ("foo", "/home/user/foo"),
            ("/foo", "/foo"),
            ("foo/bar", "/home/user/foo/bar"),
            ("/foo/bar", "/foo/bar"),
        ];
        for (input, expect) in cases {
            let p = SftpPath::new("fs1", "/home/user", input);
            assert_eq!(p.to_absolute_string(), expect, "input={input}");
        }
    }

    #[test]
    fn equality_includes_filesystem_identity() {
        let a = SftpPath::new("fs1", "/home/user", "/foo");
        let b = SftpPath::new("fs2", "/home/user", "/foo");
        assert_ne!(a, b);

        let c = SftpPath::new("fs1", "/home/user", "/foo");
        assert_eq!(a, c);
    }

    #[test]
    fn file_name_and_parent() {
        let p = SftpPath::new("fs1", "/home/user", "/a/b/c.txt");
        assert_eq!(p.file_name(), "c.txt");
        assert_eq!(p.parent().unwrap().raw(), "/a/b");

        let root = SftpPath::new("fs1", "/home/user", "/");
        assert_eq!(root.file_name(), "/");
        assert!(root.parent().is_none());
    }

    #[test]
    fn join_builds_child_paths() {
        let p = SftpPath::new("fs1", "/home/user", "/a");
        assert_eq!(p.join("b").raw(), "/a/b");

        let root = SftpPath::new("fs1", "/home/user", "/");
        assert_eq!(root.join("b").raw(), "/b");
    }
}
