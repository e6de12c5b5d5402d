use crate::store::StoreError;
use gatekeeper_constraint_controller_core::{ActionError, EngineError};
use gatekeeper_constraint_controller_k8s_binding::{GateError, TemplateError, TransformError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    #[error("enforcement action: {0}")]
    EnforcementAction(#[from] ActionError),

    #[error("binding: {0}")]
    Binding(#[from] BindingError),

    /// Recording `error` on the pod status failed as well.
    #[error("{error} (status update failed: {status})")]
    StatusUpdate {
        error: Box<Error>,
        #[source]
        status: StoreError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

// === impl Error ===

impl Error {
    /// A short code recorded alongside the message on the pod status.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(_) => "store_error",
            Self::Engine(_) => "ingest_error",
            Self::EnforcementAction(_) => "invalid_enforcement_action",
            Self::Binding(_) => "vapb_error",
            Self::StatusUpdate { error, .. } => error.code(),
        }
    }
}

impl From<TemplateError> for Error {
    fn from(error: TemplateError) -> Self {
        Self::Binding(error.into())
    }
}

impl From<GateError> for Error {
    fn from(error: GateError) -> Self {
        Self::Binding(error.into())
    }
}

impl From<TransformError> for Error {
    fn from(error: TransformError) -> Self {
        Self::Binding(error.into())
    }
}
