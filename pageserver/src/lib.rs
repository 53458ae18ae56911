//! Timeline-versioned page storage that keeps its history in layer files in remote storage,
//! and downloads only the layers that reads need.

pub mod config;
pub mod metrics;
pub mod tenant;

/// Current storage format version
///
/// This is embedded in the header of all the layer files.
/// If you make any backwards-incompatible changes to the storage
/// format, bump this!
pub const STORAGE_FORMAT_VERSION: u16 = 1;

// Magic constants used to identify different kinds of files
pub const IMAGE_FILE_MAGIC: u16 = 0x5A60;
pub const DELTA_FILE_MAGIC: u16 = 0x5A61;

/// Suffix of layer files being written, before they are renamed into place.
pub const TEMP_FILE_SUFFIX: &str = "___temp";
