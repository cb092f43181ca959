use crate::config::{ConfigError, FileConfig, Result};
use globset::{GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Expands command-line targets into the list of documents to check
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    /// File extensions to include (e.g., ["xml"])
    extensions: Vec<String>,
    /// Include patterns set
    include_set: Option<GlobSet>,
    /// Exclude patterns set
    exclude_set: Option<GlobSet>,
    /// Descend below the first directory level
    recursive: bool,
    /// Follow symbolic links
    follow_symlinks: bool,
}

impl FileDiscovery {
    pub fn new() -> Self {
        Self {
            extensions: vec!["xml".to_string()],
            include_set: None,
            exclude_set: None,
            recursive: false,
            follow_symlinks: false,
        }
    }

    /// Discovery as configured by the `files` section
    pub fn from_config(files: &FileConfig) -> Result<Self> {
        Ok(Self::new()
            .with_extensions(files.extensions.clone())
            .with_include_patterns(&files.include_patterns)?
            .with_exclude_patterns(&files.exclude_patterns)?
            .with_recursive(files.recursive))
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions
            .into_iter()
            .map(|ext| ext.to_lowercase())
            .collect();
        self
    }

    pub fn with_include_patterns(mut self, patterns: &[String]) -> Result<Self> {
        self.include_set = build_glob_set(patterns)?;
        Ok(self)
    }

    pub fn with_exclude_patterns(mut self, patterns: &[String]) -> Result<Self> {
        self.exclude_set = build_glob_set(patterns)?;
        Ok(self)
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Expand all targets. Missing targets are logged and skipped; ending up with
    /// nothing to check is an error.
    pub fn discover(&self, targets: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for target in targets {
            if !target.exists() {
                warn!("Target {} does not exist and is ignored", target.display());
                continue;
            }
            files.extend(self.discover_files(target));
        }

        if files.is_empty() {
            return Err(ConfigError::Validation(
                "No documents to check were found in the given targets".to_string(),
            ));
        }
        Ok(files)
    }

    /// Files below a single target. An explicitly named file is always taken.
    pub fn discover_files(&self, path: &Path) -> Vec<PathBuf> {
        if path.is_file() {
            return vec![path.to_path_buf()];
        }

        let mut walker = WalkBuilder::new(path);
        walker
            .standard_filters(false)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name(|a, b| a.cmp(b));
        if !self.recursive {
            walker.max_depth(Some(1));
        }

        let mut files = Vec::new();
        for entry in walker.build() {
            match entry {
                Ok(entry) => {
                    let is_file = entry.file_type().is_some_and(|kind| kind.is_file());
                    if is_file && self.should_process(entry.path()) {
                        files.push(entry.into_path());
                    }
                }
                Err(e) => warn!("Error while scanning {}: {}", path.display(), e),
            }
        }
        debug!("Found {} documents in {}", files.len(), path.display());
        files
    }

    /// Check if a file should be processed based on extensions and patterns
    pub fn should_process(&self, path: &Path) -> bool {
        let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
            return false;
        };
        if !self.extensions.contains(&extension.to_lowercase()) {
            return false;
        }

        if let Some(exclude_set) = &self.exclude_set
            && exclude_set.is_match(path)
        {
            return false;
        }

        // If include patterns are given, at least one must match
        if let Some(include_set) = &self.include_set {
            return include_set.is_match(path);
        }

        true
    }
}

impl Default for FileDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

fn build_glob_set(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = globset::GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| {
                ConfigError::Validation(format!("Invalid glob pattern '{}': {}", pattern, e))
            })?;
        builder.add(glob);
    }

    let set = builder
        .build()
        .map_err(|e| ConfigError::Validation(format!("Failed to build glob set: {}", e)))?;
    Ok(Some(set))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_directory() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        fs::create_dir_all(root.join("subdir1")).unwrap();
        fs::create_dir_all(root.join("subdir2/nested")).unwrap();

        fs::write(root.join("file1.xml"), "<a/>").unwrap();
        fs::write(root.join("file2.XML"), "<a/>").unwrap();
        fs::write(root.join("file3.txt"), "text file").unwrap();
        fs::write(root.join("subdir1/nested.xml"), "<a/>").unwrap();
        fs::write(root.join("subdir2/nested/deep.xml"), "<a/>").unwrap();
        fs::write(root.join("subdir2/nested/other.ubl"), "<a/>").unwrap();

        temp_dir
    }

    fn names(files: &[PathBuf]) -> HashSet<String> {
        files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_directory_is_not_recursive_by_default() {
        let temp_dir = create_test_directory();
        let files = FileDiscovery::new().discover_files(temp_dir.path());

        assert_eq!(
            names(&files),
            HashSet::from(["file1.xml".to_string(), "file2.XML".to_string()])
        );
    }

    #[test]
    fn test_recursive_discovery() {
        let temp_dir = create_test_directory();
        let files = FileDiscovery::new()
            .with_recursive(true)
            .discover_files(temp_dir.path());

        assert_eq!(files.len(), 4);
        assert!(names(&files).contains("deep.xml"));
    }

    #[test]
    fn test_multiple_extensions() {
        let temp_dir = create_test_directory();
        let files = FileDiscovery::new()
            .with_extensions(vec!["xml".to_string(), "UBL".to_string()])
            .with_recursive(true)
            .discover_files(temp_dir.path());

        assert_eq!(files.len(), 5);
    }

    #[test]
    fn test_include_and_exclude_patterns() {
        let temp_dir = create_test_directory();
        let discovery = FileDiscovery::new()
            .with_recursive(true)
            .with_exclude_patterns(&["**/subdir2/**".to_string()])
            .unwrap();
        let files = discovery.discover_files(temp_dir.path());
        assert!(!names(&files).contains("deep.xml"));
        assert_eq!(files.len(), 3);

        let discovery = FileDiscovery::new()
            .with_recursive(true)
            .with_include_patterns(&["**/nested*".to_string()])
            .unwrap();
        let files = discovery.discover_files(temp_dir.path());
        assert_eq!(names(&files), HashSet::from(["nested.xml".to_string()]));
    }

    #[test]
    fn test_invalid_glob() {
        let result = FileDiscovery::new().with_include_patterns(&["a[".to_string()]);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_explicit_file_is_always_taken() {
        let temp_dir = create_test_directory();
        let file = temp_dir.path().join("file3.txt");
        assert_eq!(FileDiscovery::new().discover_files(&file), vec![file]);
    }

    #[test]
    fn test_missing_targets_are_skipped() {
        let temp_dir = create_test_directory();
        let files = FileDiscovery::new()
            .discover(&[
                temp_dir.path().join("missing.xml"),
                temp_dir.path().join("file1.xml"),
            ])
            .unwrap();
        assert_eq!(files, vec![temp_dir.path().join("file1.xml")]);
    }

    #[test]
    fn test_no_targets_is_an_error() {
        let result = FileDiscovery::new().discover(&[PathBuf::from("/nonexistent/path")]);
        assert!(matches!(result, Err(ConfigError::Validation(_))));

        assert!(FileDiscovery::new().discover(&[]).is_err());
    }

    #[test]
    fn test_should_process() {
        let discovery = FileDiscovery::new();
        assert!(discovery.should_process(Path::new("test.xml")));
        assert!(!discovery.should_process(Path::new("test.txt")));
        assert!(!discovery.should_process(Path::new("test")));
    }

    #[test]
    fn test_from_config() {
        let files = FileConfig {
            extensions: vec!["ubl".to_string()],
            recursive: true,
            ..FileConfig::default()
        };
        let discovery = FileDiscovery::from_config(&files).unwrap();
        assert!(discovery.should_process(Path::new("a.ubl")));
        assert!(!discovery.should_process(Path::new("a.xml")));
    }
}
