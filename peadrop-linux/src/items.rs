//! Flatten user-selected files and directories into the ordered item list a job streams.

use std::path::{Path, PathBuf};

use peadrop_core::item::join_relative;
use peadrop_core::{Item, ItemKind};
use tracing::warn;

/// Depth-first pre-order walk of `roots`: every directory precedes its children,
/// children are visited in name order. Roots must exist; entries that vanish or
/// cannot be read below a root are left out. Directory symlinks are not followed.
pub async fn flatten_items(roots: &[PathBuf]) -> std::io::Result<Vec<Item>> {
    let mut out = Vec::new();
    // (path, relative parent, is_root)
    let mut stack: Vec<(PathBuf, String, bool)> = roots
        .iter()
        .rev()
        .map(|p| (p.clone(), String::new(), true))
        .collect();

    while let Some((path, parent, is_root)) = stack.pop() {
        let item = match describe(&path, &parent).await {
            Ok(Some(item)) => item,
            Ok(None) => continue,
            Err(e) if is_root => return Err(e),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "leaving out unreadable entry");
                continue;
            }
        };
        if item.kind == ItemKind::Directory {
            let children = match list_children(&path).await {
                Ok(c) => c,
                Err(e) if is_root => return Err(e),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot list directory");
                    Vec::new()
                }
            };
            let rel = join_relative(&parent, &item.name);
            stack.extend(children.into_iter().rev().map(|c| (c, rel.clone(), false)));
        }
        out.push(item);
    }
    Ok(out)
}

async fn describe(path: &Path, parent: &str) -> std::io::Result<Option<Item>> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
        })?;
    let link_meta = tokio::fs::symlink_metadata(path).await?;
    let meta = if link_meta.file_type().is_symlink() {
        let target = tokio::fs::metadata(path).await?;
        if target.is_dir() {
            warn!(path = %path.display(), "skipping directory symlink");
            return Ok(None);
        }
        target
    } else {
        link_meta
    };
    let kind = if meta.is_dir() {
        ItemKind::Directory
    } else {
        ItemKind::File
    };
    Ok(Some(Item {
        name,
        relative_parent_path: parent.to_string(),
        kind,
        size: if kind == ItemKind::File { meta.len() } else { 0 },
        path: Some(path.to_path_buf()),
        mtime: meta.modified().ok(),
    }))
}

async fn list_children(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut rd = tokio::fs::read_dir(dir).await?;
    let mut children = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        children.push(entry.path());
    }
    children.sort();
    Ok(children)
}
