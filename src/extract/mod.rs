//! Extraction of kernel caches from OCI images
//!
//! - `image`: reference parsing and digest pinning
//! - `unpacker`: the external unpack primitive (command or stub)
//! - `extractor`: extract/remove over the cache database and usage registry

pub mod extractor;
pub mod image;
pub mod unpacker;

pub use extractor::{Extracted, Extractor, Removal};
pub use image::ImageRef;
pub use unpacker::{Compatibility, CommandUnpacker, StubUnpacker, UnpackRequest, Unpacker};
