use thiserror::Error;

#[derive(Error, Debug)]
pub enum IncomeEvidenceError {
    #[error("Validation error on field '{field}': {details}")]
    ValidationError { field: String, details: String },

    #[error("Contract already exists: {0}")]
    DuplicateKey(String),

    #[error("Contract not found: {0}")]
    NotFound(String),

    #[error("Import failed: all {failed} rows were rejected. First errors:\n{}", messages.join("\n"))]
    ImportError { failed: usize, messages: Vec<String> },

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Spreadsheet parse error: {0}")]
    ParseError(String),

    #[error("Export error: {0}")]
    ExportError(String),

    #[error("Attachment error: {0}")]
    AttachmentError(String),

    #[error("Arithmetic overflow: {0}")]
    ArithmeticOverflow(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}

impl IncomeEvidenceError {
    pub(crate) fn validation(field: &str, details: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IncomeEvidenceError>;
