//! Streams a directory subtree as a ZIP archive.
//!
//! The archive is written to a forward-only sink: nothing is seeked, at most
//! one file is being copied at a time, and the sink is flushed after every
//! entry so a client sees the download grow as the walk proceeds.

use std::{
    cell::Cell,
    fmt,
    fs::{File, Metadata},
    io::{self, Write},
    path::{Component, Path},
    rc::Rc,
    time::SystemTime,
};

use chrono::{DateTime as ChronoDateTime, Datelike, Timelike, Utc};
use thiserror::Error;
use walkdir::WalkDir;
use zip::{write::SimpleFileOptions, CompressionMethod, DateTime, ZipWriter};

use crate::paths::Root;

/// Download name used when the whole root is archived, so its real name
/// isn't disclosed.
pub const ROOT_ARCHIVE_NAME: &str = "files.zip";

/// Which step of writing an entry failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStage {
    Walk,
    Header,
    Add,
    ReadLink,
    Read,
    Copy,
    Flush,
    Finish,
}

impl fmt::Display for ArchiveStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self {
            ArchiveStage::Walk => "walk to",
            ArchiveStage::Header => "generate archive header for",
            ArchiveStage::Add => "add",
            ArchiveStage::ReadLink => "resolve",
            ArchiveStage::Read => "read",
            ArchiveStage::Copy => "write",
            ArchiveStage::Flush => "flush data for",
            ArchiveStage::Finish => "finish",
        };
        f.write_str(action)
    }
}

/// A failure on one entry. `entry` is always relative to the archived
/// directory, so the message is safe to show.
#[derive(Debug, Error)]
#[error("Failed to {stage} {entry}")]
pub struct ArchiveError {
    pub entry: String,
    pub stage: ArchiveStage,
    #[source]
    pub source: io::Error,
}

impl ArchiveError {
    fn new(entry: impl Into<String>, stage: ArchiveStage, source: impl Into<io::Error>) -> Self {
        ArchiveError {
            entry: entry.into(),
            stage,
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub entries: usize,
    pub bytes: u64,
}

/// Name offered to the client for an archive of `dir`.
pub fn download_name(root: &Root, dir: &Path) -> String {
    if root.is_root(dir) {
        return ROOT_ARCHIVE_NAME.to_string();
    }
    match dir.file_name() {
        Some(name) => format!("{}.zip", name.to_string_lossy()),
        None => ROOT_ARCHIVE_NAME.to_string(),
    }
}

/// Shared between the stream and the caller so a failed archive can be cut
/// off even while the zip writer still owns the sink.
#[derive(Default)]
struct Fuse {
    blown: Cell<bool>,
    written: Cell<u64>,
}

/// Passes writes through until the first error (or until the fuse is blown
/// from outside); every write after that fails without touching `inner`.
struct FusedSink<W> {
    inner: W,
    fuse: Rc<Fuse>,
}

impl<W: Write> FusedSink<W> {
    fn check(&self) -> io::Result<()> {
        if self.fuse.blown.get() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "archive stream aborted"));
        }
        Ok(())
    }
}

impl<W: Write> Write for FusedSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        match self.inner.write(buf) {
            Ok(n) => {
                self.fuse.written.set(self.fuse.written.get() + n as u64);
                Ok(n)
            }
            Err(e) => {
                self.fuse.blown.set(true);
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        self.inner.flush().inspect_err(|_| self.fuse.blown.set(true))
    }
}

/// Writes `dir` and everything below it to `sink` as one ZIP archive.
///
/// `dir` itself becomes the entry `./`; descendants are named relative to it
/// and visited depth-first in file name order. Symlinks are stored as links
/// and never followed. The first failure stops the walk: what has already
/// been flushed stays in the sink, and nothing else, not even the central
/// directory, is written after it.
pub fn stream_archive<W: Write>(dir: &Path, sink: W) -> Result<ArchiveSummary, ArchiveError> {
    let fuse = Rc::new(Fuse::default());
    let mut zip = ZipWriter::new_stream(FusedSink {
        inner: sink,
        fuse: Rc::clone(&fuse),
    });

    let entries = match write_entries(dir, &mut zip) {
        Ok(entries) => entries,
        Err(e) => {
            // Dropping the writer tries to finish the archive; the blown fuse
            // makes that fail, and zip prints "ZipWriter drop failed" to
            // stderr. Expected for every aborted archive. Forgetting the
            // writer instead would leak its entry table.
            fuse.blown.set(true);
            drop(zip);
            return Err(e);
        }
    };

    let mut stream = zip
        .finish()
        .map_err(|e| ArchiveError::new("archive", ArchiveStage::Finish, e))?;
    stream
        .flush()
        .map_err(|e| ArchiveError::new("archive", ArchiveStage::Flush, e))?;

    Ok(ArchiveSummary {
        entries,
        bytes: fuse.written.get(),
    })
}

fn write_entries<W: Write + io::Seek>(
    dir: &Path,
    zip: &mut ZipWriter<W>,
) -> Result<usize, ArchiveError> {
    let mut count = 0;

    for walked in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let walked = walked.map_err(|e| {
            let name = e
                .path()
                .and_then(|p| p.strip_prefix(dir).ok())
                .map(archive_name)
                .unwrap_or_default();
            ArchiveError::new(name, ArchiveStage::Walk, e)
        })?;

        let relative = walked.path().strip_prefix(dir).unwrap_or(walked.path());
        let mut name = archive_name(relative);

        let metadata = walked
            .metadata()
            .map_err(|e| ArchiveError::new(name.clone(), ArchiveStage::Header, e))?;
        let file_type = walked.file_type();

        if file_type.is_symlink() {
            let target = std::fs::read_link(walked.path())
                .map_err(|e| ArchiveError::new(name.clone(), ArchiveStage::ReadLink, e))?;
            zip.add_symlink(name.clone(), target.to_string_lossy(), entry_options(&metadata))
                .map_err(|e| ArchiveError::new(name.clone(), ArchiveStage::Add, e))?;
        } else if file_type.is_dir() {
            // The trailing separator makes this an explicit directory entry,
            // so empty directories survive.
            name.push('/');
            zip.add_directory(name.clone(), entry_options(&metadata))
                .map_err(|e| ArchiveError::new(name.clone(), ArchiveStage::Add, e))?;
        } else {
            let mut file = File::open(walked.path())
                .map_err(|e| ArchiveError::new(name.clone(), ArchiveStage::Read, e))?;
            let options = entry_options(&metadata)
                .large_file(metadata.len() >= u64::from(u32::MAX));
            zip.start_file(name.clone(), options)
                .map_err(|e| ArchiveError::new(name.clone(), ArchiveStage::Add, e))?;
            io::copy(&mut file, zip)
                .map_err(|e| ArchiveError::new(name.clone(), ArchiveStage::Copy, e))?;
        }

        zip.flush()
            .map_err(|e| ArchiveError::new(name.clone(), ArchiveStage::Flush, e))?;
        count += 1;
    }

    Ok(count)
}

/// `/`-separated form of a relative path; the empty path is `.`.
fn archive_name(relative: &Path) -> String {
    let segments: Vec<_> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => Some(segment.to_string_lossy()),
            _ => None,
        })
        .collect();
    if segments.is_empty() {
        ".".to_string()
    } else {
        segments.join("/")
    }
}

fn entry_options(metadata: &Metadata) -> SimpleFileOptions {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(permissions(metadata));
    match metadata.modified().ok().and_then(zip_time) {
        Some(time) => options.last_modified_time(time),
        None => options,
    }
}

#[cfg(unix)]
fn permissions(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// ZIP timestamps only cover 1980..=2107; anything else keeps the default.
fn zip_time(time: SystemTime) -> Option<DateTime> {
    let time = ChronoDateTime::<Utc>::from(time);
    let year = u16::try_from(time.year()).ok()?;
    DateTime::from_date_and_time(
        year,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    )
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use zip::ZipArchive;

    const S_IFMT: u32 = 0o170000;
    const S_IFLNK: u32 = 0o120000;

    fn archive(dir: &Path) -> ZipArchive<Cursor<Vec<u8>>> {
        let mut buf = Vec::new();
        stream_archive(dir, &mut buf).unwrap();
        ZipArchive::new(Cursor::new(buf)).unwrap()
    }

    fn entry_names(zip: &mut ZipArchive<Cursor<Vec<u8>>>) -> Vec<String> {
        (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn read_entry(zip: &mut ZipArchive<Cursor<Vec<u8>>>, name: &str) -> String {
        let mut content = String::new();
        zip.by_name(name).unwrap().read_to_string(&mut content).unwrap();
        content
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn empty_directory_is_a_single_directory_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut zip = archive(dir.path());

        assert_eq!(entry_names(&mut zip), vec!["./"]);
        assert!(zip.by_index(0).unwrap().is_dir());
    }

    #[test]
    fn entries_are_relative_and_depth_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bee").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/1.txt"), b"one").unwrap();
        std::fs::create_dir(dir.path().join("a/empty")).unwrap();

        let mut buf = Vec::new();
        let summary = stream_archive(dir.path(), &mut buf).unwrap();
        assert_eq!(summary.entries, 5);
        assert_eq!(summary.bytes, buf.len() as u64);

        let prefix = dir.path().to_string_lossy().into_owned();
        assert!(!contains(&buf, prefix.as_bytes()));

        let mut zip = ZipArchive::new(Cursor::new(buf)).unwrap();
        assert_eq!(
            entry_names(&mut zip),
            vec!["./", "a/", "a/1.txt", "a/empty/", "b.txt"]
        );
        assert!(zip.by_name("a/empty/").unwrap().is_dir());
        assert_eq!(read_entry(&mut zip, "a/1.txt"), "one");
        assert_eq!(read_entry(&mut zip, "b.txt"), "bee");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_stored_as_links_to_their_raw_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real.txt"), b"real content").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/inner.txt"), b"inner").unwrap();
        std::os::unix::fs::symlink("real.txt", dir.path().join("link.txt")).unwrap();
        std::os::unix::fs::symlink("sub", dir.path().join("sublink")).unwrap();

        let mut zip = archive(dir.path());

        assert_eq!(
            entry_names(&mut zip),
            vec!["./", "link.txt", "real.txt", "sub/", "sub/inner.txt", "sublink"]
        );
        for link in ["link.txt", "sublink"] {
            let mode = zip.by_name(link).unwrap().unix_mode().unwrap();
            assert_eq!(mode & S_IFMT, S_IFLNK, "{link}");
        }
        assert_eq!(read_entry(&mut zip, "link.txt"), "real.txt");
        assert_eq!(read_entry(&mut zip, "sublink"), "sub");
    }

    #[cfg(unix)]
    #[test]
    fn unopenable_entry_aborts_without_further_entries() {
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"first").unwrap();
        // Opening a socket fails with ENXIO regardless of privileges.
        let _listener = UnixListener::bind(dir.path().join("b.sock")).unwrap();
        std::fs::write(dir.path().join("c.txt"), b"last").unwrap();

        let mut buf = Vec::new();
        let err = stream_archive(dir.path(), &mut buf).unwrap_err();

        assert_eq!(err.entry, "b.sock");
        assert_eq!(err.stage, ArchiveStage::Read);
        assert_eq!(err.to_string(), "Failed to read b.sock");
        assert!(contains(&buf, b"a.txt"));
        assert!(contains(&buf, b"first"));
        assert!(!contains(&buf, b"b.sock"));
        assert!(!contains(&buf, b"c.txt"));
        // No central directory: the truncated output is not a valid archive.
        assert!(!contains(&buf, b"PK\x01\x02"));
        assert!(ZipArchive::new(Cursor::new(buf)).is_err());
    }

    /// Accepts `limit` bytes, then fails every write. Counts calls made after
    /// the first failure.
    struct ClosingSink {
        limit: usize,
        received: Vec<u8>,
        failed: bool,
        calls_after_failure: usize,
    }

    impl Write for ClosingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failed {
                self.calls_after_failure += 1;
            }
            let room = self.limit - self.received.len();
            if room == 0 {
                self.failed = true;
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
            }
            let n = buf.len().min(room);
            self.received.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            if self.failed {
                self.calls_after_failure += 1;
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
            }
            Ok(())
        }
    }

    #[test]
    fn closed_sink_stops_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            std::fs::write(dir.path().join(format!("file{i}.bin")), vec![b'x'; 4096]).unwrap();
        }

        let mut sink = ClosingSink {
            limit: 10_000,
            received: Vec::new(),
            failed: false,
            calls_after_failure: 0,
        };
        let err = stream_archive(dir.path(), &mut sink).unwrap_err();

        assert!(matches!(
            err.stage,
            ArchiveStage::Add | ArchiveStage::Copy | ArchiveStage::Flush
        ));
        assert!(sink.failed);
        assert_eq!(sink.calls_after_failure, 0);
        assert_eq!(sink.received.len(), 10_000);
    }

    #[test]
    fn archive_names_use_forward_slashes() {
        assert_eq!(archive_name(Path::new("")), ".");
        assert_eq!(archive_name(Path::new("a")), "a");
        assert_eq!(archive_name(Path::new("a/b/c.txt")), "a/b/c.txt");
    }

    #[test]
    fn download_names_hide_the_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("photos")).unwrap();
        let root = Root::establish(dir.path()).unwrap();

        assert_eq!(download_name(&root, root.path()), "files.zip");
        assert_eq!(download_name(&root, &root.path().join("photos")), "photos.zip");
    }

    #[test]
    fn stage_messages() {
        let err = ArchiveError::new("a/b.txt", ArchiveStage::Flush, io::Error::other("boom"));
        assert_eq!(err.to_string(), "Failed to flush data for a/b.txt");
    }
}
