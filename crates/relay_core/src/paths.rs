// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Keeping client-supplied paths and entry names where they belong.

use std::path::{Component, Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("output path is empty")]
    Empty,
    #[error("output path {0:?} must be relative")]
    Absolute(String),
    #[error("output path {0:?} escapes the archive root")]
    Escapes(String),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EntryNameError {
    #[error("entry name is empty")]
    Empty,
    #[error("entry name {0:?} must be a relative path of plain components")]
    Invalid(String),
}

/// Directory that every archive must be written beneath.
#[derive(Clone, Debug)]
pub struct ConfinedRoot {
    root: PathBuf,
}

impl ConfinedRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `relative` beneath the root.
    ///
    /// Purely lexical: `.` and `..` are folded away, and any `..` that would climb above the
    /// root is an error. Symlinks inside the root are trusted.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, PathError> {
        let mut parts: Vec<&std::ffi::OsStr> = vec![];
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => parts.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(PathError::Escapes(relative.to_owned()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathError::Absolute(relative.to_owned()));
                }
            }
        }
        if parts.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(parts.iter().fold(self.root.clone(), |path, part| path.join(part)))
    }

    /// `path` relative to the root, for reporting back to clients.
    pub fn display<'a>(&self, path: &'a Path) -> std::path::Display<'a> {
        path.strip_prefix(&self.root).unwrap_or(path).display()
    }
}

/// Check that `name` is safe to use as an archive entry: non-empty, relative, `/`-separated,
/// and without `.` or `..` components.
pub fn validate_entry_name(name: &str) -> Result<&str, EntryNameError> {
    if name.is_empty() {
        return Err(EntryNameError::Empty);
    }
    let plain = |part: &str| !matches!(part, "" | "." | "..");
    if name.contains(['\\', '\0']) || !name.split('/').all(plain) {
        return Err(EntryNameError::Invalid(name.to_owned()));
    }
    Ok(name)
}
