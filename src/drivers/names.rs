//! Member name handling shared by the drivers.
//!
//! - Replaces characters the local filesystem cannot store
//! - Keeps a safe-name -> raw-name mapping for formats whose native member
//!   names cannot be passed back as-is
//! - Resolves destination names under the extraction directory

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

const REPLACEMENT_CHAR: char = '_';

/// Characters that cannot appear in a file name on this platform.
pub fn invalid_filesystem_chars() -> &'static [char] {
    if cfg!(windows) {
        &[':', '*', '?', '"', '<', '>', '|']
    } else {
        &[]
    }
}

/// Replace characters that cannot be saved to disk with `_`.
pub fn sanitize_member_name(name: &str) -> String {
    let unsafe_chars = invalid_filesystem_chars();
    name.chars()
        .map(|c| {
            if c == '\0' || unsafe_chars.contains(&c) {
                REPLACEMENT_CHAR
            } else {
                c
            }
        })
        .collect()
}

/// Bidirectional mapping between listed (safe) names and raw archive names.
///
/// `R` is whatever the format needs to find the member again: the decoded
/// name for zip, the raw path bytes for tar, the file index for 7z.
#[derive(Debug, Clone)]
pub struct NameMap<R> {
    originals: HashMap<String, R>,
}

impl<R: Clone> NameMap<R> {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    /// Register a member and return the unique safe name it is listed under.
    pub fn register(&mut self, display: &str, raw: R) -> String {
        let base = sanitize_member_name(display);
        let mut candidate = base.clone();
        let mut counter = 2;
        while self.originals.contains_key(&candidate) {
            candidate = with_suffix(&base, counter);
            counter += 1;
        }
        self.originals.insert(candidate.clone(), raw);
        candidate
    }

    /// Map a listed name back to the raw archive name.
    pub fn original(&self, name: &str) -> Option<&R> {
        self.originals.get(name)
    }

    pub fn len(&self) -> usize {
        self.originals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.originals.is_empty()
    }
}

impl<R: Clone> Default for NameMap<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert `_N` before the extension of the last path component.
fn with_suffix(name: &str, counter: usize) -> String {
    let (dir, file) = match name.rfind('/') {
        Some(idx) => name.split_at(idx + 1),
        None => ("", name),
    };
    match file.rfind('.') {
        Some(dot) if dot > 0 => format!("{dir}{}_{counter}{}", &file[..dot], &file[dot..]),
        _ => format!("{dir}{file}_{counter}"),
    }
}

/// Join a destination name under `root`, rejecting anything that could
/// escape it.
pub fn resolve_destination(root: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;

    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::UnsafeDestination(name.to_owned()));
            }
        }
    }

    if depth == 0 {
        return Err(Error::UnsafeDestination(name.to_owned()));
    }
    Ok(resolved)
}
