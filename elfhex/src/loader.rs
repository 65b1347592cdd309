//! A [`FileLoader`] that searches a fixed list of directories on the real filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use assembler::{AssemblyError, FileLoader};

/// Searches `search_dirs`, in order, for each resolved path.
pub struct FilesystemLoader {
    /// The directories searched, in the order they are tried.
    search_dirs: Vec<PathBuf>,
}

impl FilesystemLoader {
    /// Creates a loader that searches `search_dirs` in order.
    #[must_use]
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }
}

impl FileLoader for FilesystemLoader {
    fn resolve(&self, logical_path: &str) -> Result<(String, String), AssemblyError> {
        for directory in &self.search_dirs {
            let candidate = directory.join(logical_path);
            if let Ok(canonical) = fs::canonicalize(&candidate) {
                if let Ok(source) = fs::read_to_string(&canonical) {
                    return Ok((source, canonical_key(&canonical)));
                }
            }
        }
        Err(AssemblyError::IncludeNotFound {
            path: logical_path.to_owned(),
        })
    }
}

fn canonical_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_from_the_first_directory_that_has_the_file() {
        let dir = std::env::temp_dir().join(format!("elfhex-loader-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file_path = dir.join("lib.eh");
        let mut file = fs::File::create(&file_path).unwrap();
        write!(file, "segment s() {{ 00 }}").unwrap();

        let loader = FilesystemLoader::new(vec![dir.clone()]);
        let (source, canonical) = loader.resolve("lib.eh").unwrap();
        assert!(source.contains("segment s()"));
        assert!(canonical.ends_with("lib.eh"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_reported() {
        let loader = FilesystemLoader::new(vec![PathBuf::from("/nonexistent-elfhex-dir")]);
        let error = loader.resolve("missing.eh").unwrap_err();
        assert!(matches!(error, AssemblyError::IncludeNotFound { .. }));
    }
}
