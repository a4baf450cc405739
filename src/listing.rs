use std::{
    fs::Metadata,
    path::{Path, PathBuf},
};

use tokio::fs;
use tracing::{error, warn};

use crate::{
    entry::{EntryDescriptor, MimeClassifier},
    error::AppError,
    natural::compare_entries,
};

/// Lists the immediate children of `dir` in natural order.
///
/// Children that vanish or can't be stat'ed between the directory read and
/// the stat are skipped, as are names that aren't valid UTF-8.
pub async fn list_directory(
    dir: &Path,
    classifier: &dyn MimeClassifier,
) -> Result<Vec<EntryDescriptor>, AppError> {
    let mut reader = fs::read_dir(dir).await.map_err(|e| {
        error!("Failed to read directory {}: {}", dir.display(), e);
        AppError::NotFound
    })?;

    let mut children: Vec<(String, PathBuf, Metadata, Option<Metadata>)> = Vec::new();
    loop {
        let entry = match reader.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read entry in {}: {}", dir.display(), e);
                return Err(AppError::NotFound);
            }
        };

        let path = entry.path();
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => {
                warn!("Skipping entry with non-UTF8 filename in {}", dir.display());
                continue;
            }
        };

        match stat(&path).await {
            Ok((link_metadata, target_metadata)) => {
                children.push((name, path, link_metadata, target_metadata))
            }
            Err(e) => {
                warn!("Failed to get metadata for {}: {}", path.display(), e);
                continue;
            }
        }
    }

    let paths: Vec<PathBuf> = children.iter().map(|(_, path, _, _)| path.clone()).collect();
    let mut mime_types = classifier.classify_all(&paths);

    let mut entries: Vec<EntryDescriptor> = children
        .into_iter()
        .map(|(name, path, link_metadata, target_metadata)| {
            EntryDescriptor::new(
                name,
                &link_metadata,
                target_metadata.as_ref(),
                mime_types.remove(&path),
            )
        })
        .collect();

    entries.sort_by(compare_entries);
    Ok(entries)
}

/// Describes a single entry. `name` is supplied by the caller so the root
/// can be reported under a generic name instead of its real one.
pub async fn describe_entry(
    path: &Path,
    name: String,
    classifier: &dyn MimeClassifier,
) -> Result<EntryDescriptor, AppError> {
    let (link_metadata, target_metadata) = stat(path).await.map_err(|e| {
        error!("Failed to get metadata for {}: {}", path.display(), e);
        AppError::NotFound
    })?;

    Ok(EntryDescriptor::new(
        name,
        &link_metadata,
        target_metadata.as_ref(),
        classifier.classify(path),
    ))
}

/// `lstat`s `path`, and for symlinks also `stat`s the target. A dangling
/// link has no target metadata.
async fn stat(path: &Path) -> std::io::Result<(Metadata, Option<Metadata>)> {
    let link_metadata = fs::symlink_metadata(path).await?;
    let target_metadata = if link_metadata.file_type().is_symlink() {
        fs::metadata(path).await.ok()
    } else {
        None
    };
    Ok((link_metadata, target_metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ExtensionClassifier;

    fn names(entries: &[EntryDescriptor]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[tokio::test]
    async fn lists_directories_first_in_natural_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a").join("1.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("file10"), b"").unwrap();
        std::fs::write(dir.path().join("file2"), b"").unwrap();
        std::fs::create_dir(dir.path().join("z")).unwrap();

        let entries = list_directory(dir.path(), &ExtensionClassifier).await.unwrap();

        assert_eq!(names(&entries), vec!["a", "z", "b.txt", "file2", "file10"]);
        assert!(entries[0].is_directory);
        assert_eq!(entries[2].mime_type, "text/plain");
        assert_eq!(entries[2].size, 1);
    }

    #[tokio::test]
    async fn listing_is_not_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();

        let entries = list_directory(dir.path(), &ExtensionClassifier).await.unwrap();
        assert_eq!(names(&entries), vec!["a"]);
    }

    #[tokio::test]
    async fn empty_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let entries = list_directory(dir.path(), &ExtensionClassifier).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn missing_or_non_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();

        let missing = list_directory(&dir.path().join("missing"), &ExtensionClassifier).await;
        assert!(matches!(missing, Err(AppError::NotFound)));

        let not_a_dir = list_directory(&file, &ExtensionClassifier).await;
        assert!(matches!(not_a_dir, Err(AppError::NotFound)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_flagged_and_dangling_links_still_listed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink("real", dir.path().join("alias")).unwrap();
        std::os::unix::fs::symlink("nowhere", dir.path().join("dangling")).unwrap();

        let entries = list_directory(dir.path(), &ExtensionClassifier).await.unwrap();

        assert_eq!(names(&entries), vec!["alias", "real", "dangling"]);
        assert!(entries[0].is_link && entries[0].is_directory);
        assert!(!entries[1].is_link);
        assert!(entries[2].is_link && !entries[2].is_directory);
    }

    #[tokio::test]
    async fn describes_single_entry_under_given_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, b"KEY=1").unwrap();

        let entry = describe_entry(&path, ".env".to_string(), &ExtensionClassifier)
            .await
            .unwrap();
        assert_eq!(entry.name, ".env");
        assert!(entry.is_hidden);
        assert_eq!(entry.size, 5);

        let root = describe_entry(dir.path(), "/".to_string(), &ExtensionClassifier)
            .await
            .unwrap();
        assert_eq!(root.name, "/");
        assert!(root.is_directory);

        let nope = dir.path().join("nope");
        let missing = describe_entry(&nope, "nope".into(), &ExtensionClassifier);
        assert!(matches!(missing.await, Err(AppError::NotFound)));
    }
}
