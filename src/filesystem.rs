//! Artifact addressing.
//!
//! An artifact is either a plain filesystem path or an entry inside an archive container,
//! written `<container>!<innerPath>`. Accepted container spellings:
//!
//! - `/srv/repo.zip!/xsd/invoice.xsd`
//! - `zip:/srv/repo.zip!/xsd/invoice.xsd`
//! - `jar:file:///srv/repo.zip!/xsd/invoice.xsd`
//!
//! All paths are normalised lexically. Inner paths are always absolute within their container
//! and `..` never climbs above the container root.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{CheckError, ConfigurationError, Result};

/// Separator between a container location and the entry inside it
pub const CONTAINER_SEPARATOR: char = '!';

static CONTAINER_URI_REGEX: OnceLock<Regex> = OnceLock::new();
static SCHEME_REGEX: OnceLock<Regex> = OnceLock::new();

fn container_uri_regex() -> &'static Regex {
    CONTAINER_URI_REGEX.get_or_init(|| {
        Regex::new(r"^(?P<scheme>(?i:jar|zip):)?(?i:file:(?://)?)?(?P<container>[^!]+)!(?P<entry>[^!]*)$")
            .expect("Failed to compile container URI regex")
    })
}

fn scheme_regex() -> &'static Regex {
    SCHEME_REGEX.get_or_init(|| {
        Regex::new(r"^(?i:jar|zip|file):").expect("Failed to compile URI scheme regex")
    })
}

/// Location of a single artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactUri {
    /// Absolute, normalised filesystem path
    File(PathBuf),
    /// Entry inside an archive; `entry` is normalised and starts with `/`
    Container { container: PathBuf, entry: String },
}

impl ArtifactUri {
    /// Parse any accepted spelling of an artifact location
    pub fn parse(uri: &str) -> std::result::Result<Self, ConfigurationError> {
        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return Err(ConfigurationError::InvalidUri {
                uri: uri.to_string(),
                reason: "empty location".to_string(),
            });
        }

        if trimmed.contains(CONTAINER_SEPARATOR) {
            let captures =
                container_uri_regex()
                    .captures(trimmed)
                    .ok_or_else(|| ConfigurationError::InvalidUri {
                        uri: uri.to_string(),
                        reason: "expected exactly one container separator".to_string(),
                    })?;
            let container = PathBuf::from(&captures["container"]);
            // An existing file whose path happens to contain '!' is not a container entry
            let existing_plain_file = Path::new(strip_file_scheme(trimmed)).exists();
            if captures.name("scheme").is_some() || !existing_plain_file {
                return Ok(ArtifactUri::Container {
                    container: absolute_path(&container),
                    entry: normalize_entry(&captures["entry"]),
                });
            }
        }

        Ok(ArtifactUri::file(strip_file_scheme(trimmed)))
    }

    /// A plain filesystem location, made absolute and normalised
    pub fn file(path: impl AsRef<Path>) -> Self {
        ArtifactUri::File(absolute_path(path.as_ref()))
    }

    /// An entry inside `container`
    pub fn container_entry(container: impl AsRef<Path>, entry: &str) -> Self {
        ArtifactUri::Container {
            container: absolute_path(container.as_ref()),
            entry: normalize_entry(entry),
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, ArtifactUri::Container { .. })
    }

    pub fn container_path(&self) -> Option<&Path> {
        match self {
            ArtifactUri::File(_) => None,
            ArtifactUri::Container { container, .. } => Some(container),
        }
    }

    /// Canonical string form handed to engines and used as cache key
    pub fn system_id(&self) -> String {
        match self {
            ArtifactUri::File(path) => path.display().to_string(),
            ArtifactUri::Container { container, entry } => {
                format!("{}{}{}", container.display(), CONTAINER_SEPARATOR, entry)
            }
        }
    }

    /// Last path segment, if any
    pub fn file_name(&self) -> Option<String> {
        match self {
            ArtifactUri::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            ArtifactUri::Container { entry, .. } => entry
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        }
    }

    /// The enclosing directory. The root of a container has no parent inside it.
    pub fn parent(&self) -> Option<Self> {
        match self {
            ArtifactUri::File(path) => path.parent().map(|p| ArtifactUri::File(p.to_path_buf())),
            ArtifactUri::Container { container, entry } => {
                if entry == "/" {
                    return None;
                }
                let parent = match entry.rfind('/') {
                    Some(0) | None => "/".to_string(),
                    Some(index) => entry[..index].to_string(),
                };
                Some(ArtifactUri::Container {
                    container: container.clone(),
                    entry: parent,
                })
            }
        }
    }

    /// Resolve `href` treating `self` as a directory.
    ///
    /// Inside a container, relative references stay relative to the entry and absolute
    /// references address the container root. Full artifact URIs are taken as they are.
    pub fn join(&self, href: &str) -> std::result::Result<Self, ConfigurationError> {
        if is_artifact_uri(href) {
            return ArtifactUri::parse(href);
        }

        match self {
            ArtifactUri::File(directory) => {
                let reference = Path::new(href);
                if reference.is_absolute() {
                    Ok(ArtifactUri::file(reference))
                } else {
                    Ok(ArtifactUri::File(normalize_path(&directory.join(reference))))
                }
            }
            ArtifactUri::Container { container, entry } => {
                let joined = if href.starts_with('/') {
                    href.to_string()
                } else {
                    format!("{}/{}", entry.trim_end_matches('/'), href)
                };
                Ok(ArtifactUri::Container {
                    container: container.clone(),
                    entry: normalize_entry(&joined),
                })
            }
        }
    }

    /// Whether `self` lies at or below `root`, comparing whole path components
    pub fn is_within(&self, root: &ArtifactUri) -> bool {
        match (self, root) {
            (ArtifactUri::File(path), ArtifactUri::File(root)) => {
                canonical_path(path).starts_with(canonical_path(root))
            }
            (
                ArtifactUri::Container { container, entry },
                ArtifactUri::Container {
                    container: root_container,
                    entry: root_entry,
                },
            ) => {
                canonical_path(container) == canonical_path(root_container)
                    && entry_starts_with(entry, root_entry)
            }
            _ => false,
        }
    }

    /// Read the artifact's bytes
    pub fn read(&self) -> Result<Vec<u8>> {
        match self {
            ArtifactUri::File(path) => std::fs::read(path).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    ConfigurationError::ArtifactNotFound {
                        artifact: self.system_id(),
                    }
                    .into()
                } else {
                    CheckError::Io(e)
                }
            }),
            ArtifactUri::Container { container, entry } => read_container_entry(container, entry),
        }
    }

    /// Whether the artifact can be read
    pub fn exists(&self) -> bool {
        match self {
            ArtifactUri::File(path) => path.is_file(),
            ArtifactUri::Container { container, entry } => File::open(container)
                .ok()
                .and_then(|file| zip::ZipArchive::new(file).ok())
                .is_some_and(|archive| {
                    archive
                        .file_names()
                        .any(|name| name == entry.trim_start_matches('/'))
                }),
        }
    }
}

impl fmt::Display for ArtifactUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.system_id())
    }
}

/// Whether `reference` is already a complete artifact location rather than a relative href
pub fn is_artifact_uri(reference: &str) -> bool {
    scheme_regex().is_match(reference) || container_uri_regex().is_match(reference)
}

fn strip_file_scheme(uri: &str) -> &str {
    if uri.len() >= 5 && uri[..5].eq_ignore_ascii_case("file:") {
        let rest = &uri[5..];
        // file:///abs and file:/abs both denote /abs
        rest.strip_prefix("//").unwrap_or(rest)
    } else {
        uri
    }
}

fn read_container_entry(container: &Path, entry: &str) -> Result<Vec<u8>> {
    let container_error = |details: String| ConfigurationError::Container {
        container: container.display().to_string(),
        details,
    };

    let file = File::open(container).map_err(|e| container_error(e.to_string()))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| container_error(e.to_string()))?;

    let mut zipped = match archive.by_name(entry.trim_start_matches('/')) {
        Ok(zipped) => zipped,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(ConfigurationError::ArtifactNotFound {
                artifact: format!("{}{}{}", container.display(), CONTAINER_SEPARATOR, entry),
            }
            .into());
        }
        Err(e) => return Err(container_error(e.to_string()).into()),
    };

    let mut content = Vec::with_capacity(zipped.size() as usize);
    zipped.read_to_end(&mut content)?;
    Ok(content)
}

/// Make a path absolute against the working directory and normalise it
pub fn absolute_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    normalize_path(&absolute)
}

/// Normalise lexically, then resolve symlinks along the longest existing prefix
pub fn canonical_path(path: &Path) -> PathBuf {
    let normalized = normalize_path(path);
    let mut existing = normalized.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            return missing
                .iter()
                .rev()
                .fold(canonical, |resolved, segment| resolved.join(segment));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

/// Lexically remove `.` and `..` components. `..` never climbs above the root.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() && !path.has_root() {
                    normalized.push("..");
                }
            }
            Component::Normal(segment) => normalized.push(segment),
        }
    }
    normalized
}

/// Normalise an inner container path to the `/a/b` form
pub fn normalize_entry(entry: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in entry.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

fn entry_starts_with(entry: &str, root: &str) -> bool {
    if root == "/" {
        return true;
    }
    entry == root
        || entry
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}
