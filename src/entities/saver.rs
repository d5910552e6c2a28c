//! Persistence collaborator. Callers invoke it through `Registry::save`,
//! the registry only reacts to the outcome.

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageError};
use log::debug;

use crate::core::resource::ResourceId;

/// Save failures. The resource stays modified, nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl From<ImageError> for SaveError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::IoError(io) => SaveError::Io(io),
            other => SaveError::Encode(other.to_string()),
        }
    }
}

pub trait Saver: Send + Sync {
    fn save(&self, id: &ResourceId, image: &DynamicImage) -> Result<(), SaveError>;
}

/// Writes pixels back with the `image` crate, format picked from the extension
#[derive(Debug, Default, Clone)]
pub struct ImageSaver {
    /// Write here instead of over the source file
    output_dir: Option<PathBuf>,
}

impl ImageSaver {
    /// Overwrite source files in place
    pub fn in_place() -> Self {
        Self { output_dir: None }
    }

    /// Write copies into `dir`, keeping file names
    pub fn to_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: Some(dir.into()),
        }
    }

    pub fn target_path(&self, id: &ResourceId) -> PathBuf {
        match (&self.output_dir, id.path().file_name()) {
            (Some(dir), Some(name)) => dir.join(name),
            _ => id.path().to_path_buf(),
        }
    }

    fn write(path: &Path, image: &DynamicImage) -> Result<(), SaveError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        image.save(path)?;
        Ok(())
    }
}

impl Saver for ImageSaver {
    fn save(&self, id: &ResourceId, image: &DynamicImage) -> Result<(), SaveError> {
        let path = self.target_path(id);
        debug!("Saving {} -> {}", id, path.display());
        Self::write(&path, image)
    }
}
