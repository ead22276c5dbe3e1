use thiserror::Error;

use crate::ids::NodeId;

pub type NodeResult<T> = Result<T, NodeError>;

/// Errores de los servicios de un nodo (locales o remotos).
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("configuración inválida: {0}")]
    Config(String),

    #[error("descriptor de job inválido: {0}")]
    Descriptor(String),

    #[error("argumento inválido: {0}")]
    InvalidArgument(String),

    #[error("job desconocido: {0}")]
    UnknownJob(String),

    #[error("attempt desconocido: {0}")]
    UnknownAttempt(String),

    #[error("nodo desconocido: {0}")]
    UnknownNode(NodeId),

    #[error("nodo inalcanzable: {0}")]
    Unreachable(String),

    #[error("error remoto (status {status}): {message}")]
    Remote { status: u16, message: String },

    #[error("inconsistencia interna: {0}")]
    Internal(String),

    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("error de serialización: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NodeError {
    /// Errores de transporte: se loguean y se ignoran en heartbeats y status push.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, NodeError::Unreachable(_))
    }

    /// Errores que el llamador provocó con datos inválidos.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            NodeError::Config(_) | NodeError::Descriptor(_) | NodeError::InvalidArgument(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            NodeError::UnknownJob(_) | NodeError::UnknownAttempt(_) | NodeError::UnknownNode(_)
        )
    }
}
