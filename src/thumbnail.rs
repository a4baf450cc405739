//! Preview thumbnails, produced by external converters.
//!
//! Images go through GraphicsMagick (`gm`) and videos through `ffmpeg`; both
//! write a JPEG to stdout. Callers must only ever pass paths that have already
//! been resolved under the root.

use std::{path::Path, process::Stdio};

use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info};

use crate::entry::ContentCategory;

pub const DEFAULT_THUMBNAIL_SIZE: u32 = 256;

/// Binaries that must be on `PATH` for thumbnails to work.
pub const REQUIRED_BINARIES: &[&str] = &["gm", "ffmpeg"];

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("unsupported file type: {0:?}")]
    Unsupported(ContentCategory),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Converter {
        program: &'static str,
        status: std::process::ExitStatus,
    },
}

#[derive(Debug)]
pub enum Thumbnail {
    /// Freshly rendered JPEG bytes.
    Jpeg(Vec<u8>),
    /// The source is already suitable as a preview; serve the file itself.
    Original,
}

#[derive(Debug, Clone)]
pub struct ThumbnailGenerator {
    size: u32,
}

impl ThumbnailGenerator {
    pub fn new(size: u32) -> Self {
        ThumbnailGenerator { size }
    }

    pub async fn generate(
        &self,
        path: &Path,
        category: ContentCategory,
    ) -> Result<Thumbnail, ThumbnailError> {
        let (program, args) = match category {
            ContentCategory::VectorImage => return Ok(Thumbnail::Original),
            ContentCategory::Image => ("gm", self.image_args(path)),
            ContentCategory::Video => ("ffmpeg", self.video_args(path)),
            ContentCategory::Other => return Err(ThumbnailError::Unsupported(category)),
        };

        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ThumbnailError::Spawn { program, source })?;

        if !output.status.success() {
            error!(
                "{} failed on {}: {}",
                program,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(ThumbnailError::Converter {
                program,
                status: output.status,
            });
        }

        info!("Generated {}px thumbnail for {}", self.size, path.display());
        Ok(Thumbnail::Jpeg(output.stdout))
    }

    fn image_args(&self, path: &Path) -> Vec<String> {
        let size = self.size;
        vec![
            "convert".to_string(),
            "-size".to_string(),
            format!("{size}x{size}"),
            path.to_string_lossy().into_owned(),
            "-geometry".to_string(),
            format!("{size}x{size}^"),
            "+profile".to_string(),
            "*".to_string(),
            "jpeg:-".to_string(),
        ]
    }

    fn video_args(&self, path: &Path) -> Vec<String> {
        vec![
            "-i".to_string(),
            path.to_string_lossy().into_owned(),
            "-vf".to_string(),
            format!("thumbnail,scale=-1:{}", self.size),
            "-frames:v".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "mjpeg".to_string(),
            "-".to_string(),
        ]
    }
}

impl Default for ThumbnailGenerator {
    fn default() -> Self {
        ThumbnailGenerator::new(DEFAULT_THUMBNAIL_SIZE)
    }
}

/// The subset of `binaries` that can't be found on `PATH`.
pub fn missing_binaries<'a>(binaries: &[&'a str]) -> Vec<&'a str> {
    binaries
        .iter()
        .copied()
        .filter(|binary| which::which(binary).is_err())
        .collect()
}
