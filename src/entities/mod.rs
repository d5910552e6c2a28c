//! Entities module - image payloads and the decode/save collaborators

pub mod decoder;
pub mod payload;
pub mod saver;

pub use decoder::{DecodeError, DecodeRequest, Decoder, ImageDecoder};
pub use payload::{Decoded, Edit, ImageMetadata, Pixels};
pub use saver::{ImageSaver, SaveError, Saver};
