use std::{
    collections::HashMap,
    fs::Metadata,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Timestamp format used for `modified_at` (ISO 8601, UTC).
const MODIFIED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// What the API exposes about one filesystem entry.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    /// Base name only, never a full path.
    pub name: String,
    pub size: u64,
    pub modified_at: String,
    /// Empty when the classifier has no answer.
    pub mime_type: String,
    pub is_code: bool,
    pub is_directory: bool,
    pub is_hidden: bool,
    pub is_link: bool,
}

impl EntryDescriptor {
    /// Builds a descriptor from the entry's own (`lstat`) metadata and, for
    /// symlinks, the metadata of whatever the link points at if it resolves.
    pub fn new(
        name: String,
        link_metadata: &Metadata,
        target_metadata: Option<&Metadata>,
        mime_type: Option<String>,
    ) -> Self {
        let is_link = link_metadata.file_type().is_symlink();
        let metadata = target_metadata.unwrap_or(link_metadata);
        let is_directory = metadata.is_dir();

        EntryDescriptor {
            size: metadata.len(),
            modified_at: format_modified(metadata),
            mime_type: mime_type.unwrap_or_default(),
            is_code: !is_directory && is_source_code(&name),
            is_directory,
            is_hidden: name.starts_with('.'),
            is_link,
            name,
        }
    }
}

fn format_modified(metadata: &Metadata) -> String {
    metadata
        .modified()
        .map(|time| DateTime::<Utc>::from(time).format(MODIFIED_AT_FORMAT).to_string())
        .unwrap_or_default()
}

/// Source file extensions the UI renders as code.
const CODE_EXTENSIONS: &[&str] = &[
    "c", "cc", "cpp", "cs", "css", "go", "h", "hpp", "hs", "html", "java", "js", "json", "jsx",
    "kt", "lua", "m", "md", "php", "pl", "py", "rb", "rs", "scala", "sh", "sql", "swift", "toml",
    "ts", "tsx", "vim", "xml", "yaml", "yml",
];

/// Well-known extensionless source files.
const CODE_FILE_NAMES: &[&str] = &["makefile", "dockerfile", "rakefile", "gemfile"];

pub fn is_source_code(name: &str) -> bool {
    let lower = name.to_lowercase();
    if CODE_FILE_NAMES.contains(&lower.as_str()) {
        return true;
    }
    Path::new(&lower)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| CODE_EXTENSIONS.contains(&ext))
}

/// Maps filesystem paths to MIME type strings.
pub trait MimeClassifier: Send + Sync {
    /// `None` when the type is unknown.
    fn classify(&self, path: &Path) -> Option<String>;

    /// Classifies several paths at once; unknown paths are left out.
    fn classify_all(&self, paths: &[PathBuf]) -> HashMap<PathBuf, String> {
        paths
            .iter()
            .filter_map(|path| self.classify(path).map(|mime| (path.clone(), mime)))
            .collect()
    }
}

/// Classifies by file extension alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtensionClassifier;

impl MimeClassifier for ExtensionClassifier {
    fn classify(&self, path: &Path) -> Option<String> {
        mime_guess::from_path(path).first().map(|mime| mime.to_string())
    }
}

/// The broad kind of content behind a MIME type, decided once per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCategory {
    Image,
    /// SVG: already scalable, served as-is instead of being converted.
    VectorImage,
    Video,
    Other,
}

impl ContentCategory {
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type == "image/svg+xml" {
            return ContentCategory::VectorImage;
        }
        match mime_type.split_once('/') {
            Some(("image", _)) => ContentCategory::Image,
            Some(("video", _)) => ContentCategory::Video,
            _ => ContentCategory::Other,
        }
    }
}
