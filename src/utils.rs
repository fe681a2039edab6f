//! Utility functions shared by the partitioner and the converter

/// File I/O utilities
pub mod io {
    use crate::error::Result;
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Ensure directory exists
    pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }

    /// Ensure the parent directory of a file exists
    pub fn ensure_parent_exists<P: AsRef<Path>>(path: P) -> Result<()> {
        match path.as_ref().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => ensure_dir_exists(parent),
            _ => Ok(()),
        }
    }

    /// Regular files in `dir` whose extension matches `extension` (case-insensitive), sorted by name
    pub fn list_files_with_extension<P: AsRef<Path>>(dir: P, extension: &str) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| e.eq_ignore_ascii_case(extension));
            if matches && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

}
