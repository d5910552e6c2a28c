//! Decoder collaborator: turns a resource id into metadata or pixels.
//!
//! The registry never decodes on its own thread. It hands a `DecodeRequest`
//! to a `Decoder`, which fulfills it later (usually from a worker thread).
//! Fulfilling only sends a `DecodeCompletion` over a channel; the registry
//! applies it on its mutator path in `Registry::pump()`.

use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::Sender;
use image::{ImageError, ImageReader};
use log::{debug, trace};

use crate::core::resource::{Granularity, ResourceId};
use crate::core::workers::Workers;
use crate::entities::payload::{Decoded, ImageMetadata};

/// Load failures. The resource enters `Failed`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Unsupported format: {0}")]
    Unsupported(String),
    #[error("Image error: {0}")]
    Image(String),
}

impl From<ImageError> for DecodeError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::IoError(io) => DecodeError::Io(io.to_string()),
            ImageError::Unsupported(u) => DecodeError::Unsupported(u.to_string()),
            other => DecodeError::Image(other.to_string()),
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        DecodeError::Io(e.to_string())
    }
}

/// Result of one decode, routed back to the registry
#[derive(Debug)]
pub struct DecodeCompletion {
    pub id: ResourceId,
    pub ticket: u64,
    pub granularity: Granularity,
    pub result: Result<Decoded, DecodeError>,
}

/// One pending decode, fulfilled exactly once. Dropping it unfulfilled (a
/// panicking job, a decoder discarding its queue) reports it as failed.
#[derive(Debug)]
pub struct DecodeRequest {
    id: ResourceId,
    ticket: u64,
    granularity: Granularity,
    /// Taken on fulfillment
    done: Option<Sender<DecodeCompletion>>,
}

impl DecodeRequest {
    pub(crate) fn new(id: ResourceId, ticket: u64, granularity: Granularity, done: Sender<DecodeCompletion>) -> Self {
        Self {
            id,
            ticket,
            granularity,
            done: Some(done),
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Report the outcome. Safe to call after the registry is gone.
    pub fn fulfill(mut self, result: Result<Decoded, DecodeError>) {
        self.send(result);
    }

    fn send(&mut self, result: Result<Decoded, DecodeError>) {
        let Some(done) = self.done.take() else {
            return;
        };
        let completion = DecodeCompletion {
            id: self.id.clone(),
            ticket: self.ticket,
            granularity: self.granularity,
            result,
        };
        if done.send(completion).is_err() {
            trace!("Decode completion dropped: registry shut down");
        }
    }
}

impl Drop for DecodeRequest {
    fn drop(&mut self) {
        if self.done.is_some() {
            debug!("Decode of {} (ticket {}) abandoned", self.id, self.ticket);
            self.send(Err(DecodeError::Image("decode abandoned".into())));
        }
    }
}

/// Asynchronous byte-to-pixel decoder
pub trait Decoder: Send + Sync {
    /// Start decoding. Must not block on the decode itself.
    fn begin_load(&self, request: DecodeRequest);
}

impl<T: Decoder + ?Sized> Decoder for Arc<T> {
    fn begin_load(&self, request: DecodeRequest) {
        (**self).begin_load(request)
    }
}

/// Decoder backed by the `image` crate, running on the worker pool
pub struct ImageDecoder {
    workers: Arc<Workers>,
}

impl ImageDecoder {
    pub fn new(workers: Arc<Workers>) -> Self {
        Self { workers }
    }

    /// Read dimensions and format from the file header without decoding pixels
    pub fn header(path: &Path) -> Result<ImageMetadata, DecodeError> {
        debug!("Reading image header: {}", path.display());

        let reader = ImageReader::open(path)?.with_guessed_format()?;
        let format = reader
            .format()
            .ok_or_else(|| DecodeError::Unsupported(format!("cannot detect format of {}", path.display())))?;
        let (width, height) = reader.into_dimensions()?;

        Ok(ImageMetadata::new(width, height, format!("{:?}", format)))
    }

    /// Decode the complete image
    pub fn load(path: &Path) -> Result<Decoded, DecodeError> {
        debug!("Loading image: {}", path.display());

        let reader = ImageReader::open(path)?.with_guessed_format()?;
        let format = reader
            .format()
            .ok_or_else(|| DecodeError::Unsupported(format!("cannot detect format of {}", path.display())))?;
        let img = reader.decode()?;
        let metadata = ImageMetadata::from_image(&img, format!("{:?}", format));
        trace!("Decoded {}: ~{} KB", path.display(), metadata.mem_estimate() / 1024);

        Ok(Decoded::Full {
            metadata,
            pixels: Arc::new(img),
        })
    }
}

impl Decoder for ImageDecoder {
    fn begin_load(&self, request: DecodeRequest) {
        self.workers.execute(move || {
            let path = request.id().path().to_path_buf();
            let result = match request.granularity() {
                Granularity::MetadataOnly => Self::header(&path).map(Decoded::Metadata),
                Granularity::Full => Self::load(&path),
            };
            request.fulfill(result);
        });
    }
}
