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

//! Open-options model (C1): parses an unordered set of flag tokens into a
//! normalized, validated [`OpenOptions`] record.

use crate::{Error, ErrorKind, Result};

/// A single open-flag token, from the universe `spec.md` §3 defines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpenFlag {
    Read,
    Write,
    Append,
    TruncateExisting,
    Create,
    CreateNew,
    DeleteOnClose,
    Sparse,
    Sync,
    Dsync,
}

/// Which call site is parsing the flags, used only to pick the default
/// read/write flag when neither is present (`spec.md` §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenIntent {
    Read,
    Write,
}

/// Normalized, validated open-options record.
///
/// Retains the original token list for error reporting, per `spec.md` §4.1.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
    pub create_new: bool,
    pub delete_on_close: bool,
    tokens: Vec<OpenFlag>,
}

impl OpenOptions {
    /// Parse an unordered collection of flag tokens into a normalized,
    /// validated record.
    pub fn parse(tokens: impl IntoIterator<Item = OpenFlag>, intent: OpenIntent) -> Result<Self> {
        let tokens: Vec<OpenFlag> = tokens.into_iter().collect();

        let has = |flag: OpenFlag| tokens.contains(&flag);

        let mut read = has(OpenFlag::Read);
        let mut write = has(OpenFlag::Write);
        let append = has(OpenFlag::Append);
        let truncate = has(OpenFlag::TruncateExisting);
        let create = has(OpenFlag::Create);
        let create_new = has(OpenFlag::CreateNew);
        let delete_on_close = has(OpenFlag::DeleteOnClose);

        if !read && !write && !append {
            match intent {
                OpenIntent::Read => read = true,
                OpenIntent::Write => write = true,
            }
        }

        if read && append {
            return Err(unsupported(&tokens, "READ and APPEND are mutually exclusive"));
        }
        if read && truncate {
            return Err(unsupported(
                &tokens,
                "READ and TRUNCATE_EXISTING are mutually exclusive",
            ));
        }
        if append && truncate {
            return Err(unsupported(
                &tokens,
                "APPEND and TRUNCATE_EXISTING are mutually exclusive",
            ));
        }
        if create_new && !write {
            return Err(unsupported(&tokens, "CREATE_NEW requires write intent"));
        }
        if append {
            write = true;
            read = false;
        }

        Ok(OpenOptions {
            read,
            write,
            append,
            truncate,
            create,
            create_new,
            delete_on_close,
            tokens,
        })
    }

    /// The original, unordered token collection this record was parsed from.
    pub fn tokens(&self) -> &[OpenFlag] {
        &self.tokens
    }
}

fn unsupported(tokens: &[OpenFlag], message: &str) -> Error {
    Error::new(ErrorKind::IllegalArgument, message)
        .with_operation("parse-open-options")
        .with_context("tokens", format!("{tokens:?}"))
}
