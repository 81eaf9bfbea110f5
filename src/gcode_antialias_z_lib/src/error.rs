use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::mesh::MeshError;
use crate::policy::ConfigError;

/// Fatal errors. Anything that can go wrong with a single line or a single sample is recovered
/// locally and never shows up here.
#[derive(Debug, Error)]
pub enum Error {
    /// The tool path is a binary container (.bgcode or similar), not text.
    #[error("binary G-code is not supported: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    /// The companion STL can't be found.
    #[error("STL file not found: {}", .0.display())]
    MissingGeometry(PathBuf),

    /// Stdin mode has nothing to derive an STL path from.
    #[error("STL path is required when reading G-code from stdin")]
    StlPathRequired,

    #[error("mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
