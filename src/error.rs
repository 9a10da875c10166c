use thiserror::Error;

/// Failures the pipeline detects itself. I/O and parser errors from the
/// underlying crates travel alongside these through `anyhow`.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No boundary files match {pattern}")]
    NoInputFiles { pattern: String },

    #[error("Column '{column}' not found in {location}")]
    MissingColumn { column: String, location: String },

    #[error("Duplicate nanoarea identifier {id} in column '{column}'")]
    DuplicateId { column: String, id: String },

    #[error("Duplicate cluster definition for key {key}")]
    DuplicateClusterKey { key: String },

    #[error("Unsupported reprojection: {from} -> {to}")]
    UnsupportedCrs { from: String, to: String },

    #[error("Unsupported projection '{name}' in {file}")]
    UnsupportedProjection { file: String, name: String },

    #[error("Invalid CRS identifier: {0}")]
    InvalidCrs(String),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Geometry for {id} is still invalid after repair")]
    InvalidGeometry { id: String },
}
