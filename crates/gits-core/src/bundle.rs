//! Change bundle: the working-tree files a job applies before running git.
//!
//! JSON `{files: [{path, base64}], deleted: [path]}`. Paths are relative to
//! the repository root and may not escape it.

use std::path::{Component, Path};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{GitsError, Result};

/// Prefix of uploaded bundle filenames, followed by a unix timestamp.
pub const BUNDLE_PREFIX: &str = "gits-changes-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    pub path: String,
    pub base64: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBundle {
    #[serde(default)]
    pub files: Vec<BundleFile>,
    #[serde(default)]
    pub deleted: Vec<String>,
}

impl ContentBundle {
    pub fn add_file(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        check_relative(path)?;
        self.files.push(BundleFile {
            path: path.to_string(),
            base64: STANDARD.encode(bytes),
        });
        Ok(())
    }

    pub fn add_deleted(&mut self, path: &str) -> Result<()> {
        check_relative(path)?;
        self.deleted.push(path.to_string());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.deleted.is_empty()
    }

    /// Every path the bundle touches, files first, in bundle order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .map(|f| f.path.as_str())
            .chain(self.deleted.iter().map(String::as_str))
    }

    /// Decoded file contents, validating every path on the way.
    pub fn decoded_files(&self) -> Result<Vec<(&str, Vec<u8>)>> {
        self.files
            .iter()
            .map(|f| {
                check_relative(&f.path)?;
                let bytes = STANDARD.decode(&f.base64).map_err(|e| {
                    GitsError::Bundle(format!("bad base64 for {}: {e}", f.path))
                })?;
                Ok((f.path.as_str(), bytes))
            })
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bundle: ContentBundle = serde_json::from_slice(bytes)?;
        for path in bundle.paths() {
            check_relative(path)?;
        }
        Ok(bundle)
    }

    pub fn filename(unix_ts: i64) -> String {
        format!("{BUNDLE_PREFIX}{unix_ts}.json")
    }
}

/// Reject empty, absolute, and parent-escaping paths.
pub fn check_relative(path: &str) -> Result<()> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(GitsError::Bundle(format!(
            "path must be relative to the repository root: {path}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_json_shape() {
        let mut b = ContentBundle::default();
        b.add_file("src/main.rs", b"fn main() {}").unwrap();
        b.add_deleted("old.txt").unwrap();

        let json: serde_json::Value = serde_json::from_slice(&b.to_bytes().unwrap()).unwrap();
        assert_eq!(json["files"][0]["path"], "src/main.rs");
        assert_eq!(json["files"][0]["base64"], "Zm4gbWFpbigpIHt9");
        assert_eq!(json["deleted"][0], "old.txt");

        let back = ContentBundle::from_bytes(&b.to_bytes().unwrap()).unwrap();
        let files = back.decoded_files().unwrap();
        assert_eq!(files, vec![("src/main.rs", b"fn main() {}".to_vec())]);
        assert_eq!(back.paths().collect::<Vec<_>>(), ["src/main.rs", "old.txt"]);
    }

    #[test]
    fn escaping_paths_are_rejected() {
        for bad in ["", "/etc/passwd", "../x", "a/../../b"] {
            assert!(check_relative(bad).is_err(), "{bad:?}");
        }
        assert!(check_relative("./a/b.txt").is_ok());

        let hostile = br#"{"files":[],"deleted":["../../outside"]}"#;
        assert!(ContentBundle::from_bytes(hostile).is_err());
    }

    #[test]
    fn filename_carries_timestamp() {
        assert_eq!(ContentBundle::filename(1752764400), "gits-changes-1752764400.json");
    }
}
