use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] transmux::PipelineError),

    #[error("JSON output error: {0}")]
    Json(#[from] serde_json::Error),
}
