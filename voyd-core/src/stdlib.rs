use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::CoreError;

/// Extension of source files in the standard library.
pub const SOURCE_EXTENSION: &str = "vast";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdlibFile {
    pub path: PathBuf,
    pub contents: String,
}

pub fn default_stdlib_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../stdlib")
}

/// Reads every `.vast` file under `root`, in a stable (path) order.
pub fn load_stdlib_files(root: impl AsRef<Path>) -> Result<Vec<StdlibFile>, CoreError> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(CoreError::MissingStdlib(root.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|err| CoreError::SourceIo(err.into()))?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == SOURCE_EXTENSION) {
            let contents = fs::read_to_string(path)?;
            let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
            files.push(StdlibFile {
                path: relative,
                contents,
            });
        }
    }
    tracing::debug!(root = %root.display(), files = files.len(), "loaded stdlib");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_files_from_default_root() {
        let files = load_stdlib_files(default_stdlib_root()).expect("stdlib should load");
        assert!(!files.is_empty());
        assert!(
            files
                .iter()
                .all(|file| file.path.extension().is_some_and(|ext| ext == SOURCE_EXTENSION))
        );
    }

    #[test]
    fn ignores_other_files_and_sorts_by_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("nested");
        fs::create_dir_all(&nested).expect("create nested dir");
        fs::write(dir.path().join("b.vast"), "").expect("write b");
        fs::write(nested.join("a.vast"), "").expect("write a");
        fs::write(dir.path().join("notes.txt"), "").expect("write notes");

        let files = load_stdlib_files(dir.path()).expect("load");
        let paths: Vec<_> = files.iter().map(|file| file.path.clone()).collect();
        assert_eq!(
            paths,
            [PathBuf::from("b.vast"), PathBuf::from("nested/a.vast")]
        );
    }

    #[test]
    fn missing_root_is_reported() {
        let err = load_stdlib_files("./path/that/does/not/exist").unwrap_err();
        assert!(matches!(err, CoreError::MissingStdlib(_)));
    }
}
