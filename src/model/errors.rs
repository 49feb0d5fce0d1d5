use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("No definition named '{0}' in the model.")]
    UnknownDefinition(String),

    #[error("Association '{0}' has target '{1}' which is not defined in the model.")]
    DanglingTarget(String, String),

    #[error("Malformed CSN document: {0}")]
    MalformedCsn(String),

    #[error("Element '{0}' of '{1}' is neither scalar, structured, nor an association.")]
    MalformedElement(String, String),
}
