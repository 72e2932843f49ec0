//! Which working-tree changes go into a job's change bundle.

use std::collections::HashSet;
use std::path::Path;

use gits_core::ContentBundle;

use crate::error::{CliError, Result};
use crate::git::StatusEntry;

/// Paths to upload and paths to delete, relative to the repository root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub files: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.deleted.is_empty()
    }
}

/// Flatten repeated and comma-separated `-f` values, trimming blanks and
/// keeping the first occurrence of each path.
pub fn split_file_args(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .flat_map(|arg| arg.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter(|p| seen.insert(p.to_string()))
        .map(String::from)
        .collect()
}

/// Every pending change: modified, added and untracked files that still
/// exist, plus deletions and rename sources.
pub fn all_changes(status: &[StatusEntry], exists: impl Fn(&str) -> bool) -> Result<ChangeSet> {
    let mut set = ChangeSet::default();
    for entry in status {
        if entry.is_deleted() {
            push_unique(&mut set.deleted, &entry.path);
            continue;
        }
        if let Some(orig) = &entry.orig {
            if entry.is_renamed() {
                push_unique(&mut set.deleted, orig);
            }
        }
        if exists(&entry.path) {
            push_unique(&mut set.files, &entry.path);
        }
    }

    if set.is_empty() {
        return Err(CliError::NoChanges);
    }
    Ok(set)
}

/// Only the user's paths. Each must exist or be a deletion/rename the status
/// knows about; anything else fails before any network call.
pub fn selected_changes(
    status: &[StatusEntry],
    selected: &[String],
    exists: impl Fn(&str) -> bool,
) -> Result<ChangeSet> {
    let deleted: HashSet<&str> = status
        .iter()
        .filter(|e| e.is_deleted())
        .map(|e| e.path.as_str())
        .collect();
    let renamed_from: HashSet<&str> = status
        .iter()
        .filter(|e| e.is_renamed())
        .filter_map(|e| e.orig.as_deref())
        .collect();

    let mut set = ChangeSet::default();
    for path in selected {
        if exists(path) {
            push_unique(&mut set.files, path);
        } else if deleted.contains(path.as_str()) || renamed_from.contains(path.as_str()) {
            push_unique(&mut set.deleted, path);
        } else {
            return Err(CliError::FileNotFound(path.clone()));
        }
    }
    Ok(set)
}

/// Read every file under `root` into a bundle. Directories are walked,
/// skipping `.git`.
pub fn build_bundle(root: &Path, changes: &ChangeSet) -> Result<ContentBundle> {
    let mut bundle = ContentBundle::default();
    for path in &changes.files {
        add_path(&mut bundle, root, path)?;
    }
    for path in &changes.deleted {
        bundle.add_deleted(path)?;
    }
    Ok(bundle)
}

fn add_path(bundle: &mut ContentBundle, root: &Path, rel: &str) -> Result<()> {
    let full = root.join(rel);
    if full.is_dir() {
        let mut children: Vec<_> = std::fs::read_dir(&full)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != ".git")
            .collect();
        children.sort();
        for child in children {
            let child_rel = format!("{}/{child}", rel.trim_end_matches('/'));
            add_path(bundle, root, &child_rel)?;
        }
        return Ok(());
    }
    let bytes = std::fs::read(&full)?;
    bundle.add_file(rel, &bytes)?;
    Ok(())
}

fn push_unique(list: &mut Vec<String>, path: &str) {
    if !list.iter().any(|p| p == path) {
        list.push(path.to_string());
    }
}
