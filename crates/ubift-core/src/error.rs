use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy of the analysis core.
///
/// Failures on *optional* data (recovery candidates, unreferenced PEBs) are
/// counted by the layer that encounters them and never surface as errors;
/// everything below is reserved for data a command actually requires.
#[derive(Debug, Error)]
pub enum UbiftError {
    #[error("cannot read input image {}: {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("offset {offset:#x} (length {len:#x}) lies outside the image of {image_len:#x} bytes")]
    OutOfBounds {
        offset: u64,
        len: u64,
        image_len: u64,
    },

    #[error("cannot deduce {what} from the image and none was supplied")]
    Geometry { what: &'static str },

    #[error("{structure} at PEB {peb}, byte offset {offset:#x}: {reason}")]
    Integrity {
        structure: &'static str,
        peb: u32,
        offset: u64,
        reason: String,
    },

    #[error("malformed {node} at LEB {leb}, offset {offset:#x}: {reason}")]
    Decoding {
        node: &'static str,
        leb: u32,
        offset: u32,
        reason: String,
    },

    #[error("unrecoverable state: {0}")]
    Unrecoverable(String),
}

pub type Result<T, E = UbiftError> = std::result::Result<T, E>;
