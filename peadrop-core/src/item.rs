//! Transfer items: one file or directory of a flattened source tree, and the
//! receiver-side reconstruction of its path.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::protocol::Header;

/// Separator used in `relative_parent_path` on the wire, whatever the host OS uses.
pub const PATH_SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Directory,
}

/// A single unit of a transfer. Item lists are built once per job and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub name: String,
    /// Parent path relative to the transfer root, `/`-separated, empty at the top level.
    pub relative_parent_path: String,
    pub kind: ItemKind,
    /// Declared size in bytes; meaningful only for files.
    pub size: u64,
    /// Local source path. Only set on the sending side.
    pub path: Option<PathBuf>,
    pub mtime: Option<SystemTime>,
}

impl Item {
    /// Relative path of this item itself, `/`-separated.
    pub fn relative_path(&self) -> String {
        join_relative(&self.relative_parent_path, &self.name)
    }

    /// Announcement header for this item. `size` is the size the sender is about to stream.
    pub fn announcement(&self, size: Option<u64>) -> Header {
        Header::New {
            name: self.name.clone(),
            relative_parent_path: self.relative_parent_path.clone(),
            kind: self.kind,
            size: match self.kind {
                ItemKind::File => size.or(Some(self.size)),
                ItemKind::Directory => None,
            },
        }
    }

    /// Where this item lands under `root`. None if the name or parent path would
    /// escape `root` (absolute parts, `..`, empty name).
    pub fn target_path(&self, root: &Path) -> Option<PathBuf> {
        target_path(root, &self.relative_parent_path, &self.name)
    }
}

/// Join a relative parent path and a child name with the canonical separator.
pub fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}{}{}", parent, PATH_SEPARATOR, name)
    }
}

/// Rewrite any host separator (`\` on Windows senders) to `/` and drop empty segments.
pub fn normalize_relative(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Rebuild `root/relative_parent_path/name`, refusing anything that is not a plain
/// descendant of `root`.
pub fn target_path(root: &Path, relative_parent_path: &str, name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return None;
    }
    let mut out = root.to_path_buf();
    for segment in normalize_relative(relative_parent_path).split('/') {
        if segment.is_empty() {
            continue;
        }
        match Path::new(segment).components().next() {
            Some(Component::Normal(_)) => out.push(segment),
            _ => return None,
        }
    }
    out.push(name);
    Some(out)
}
