use crate::resources::ResolveError;

/// Everything that can end a reconcile pass early. Nothing here is retried
/// internally; errors bubble to the invocation boundary and the runtime's
/// backoff requeues the entity.
#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Resources(#[from] ResolveError),

    #[error(
        "unable to find {variable} environment variable or parameter image.name not set"
    )]
    MissingImage { variable: &'static str },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::Kube(e) if is_not_found(e))
    }
}

/// NotFound is expected input for create-on-first-sight checks, never an
/// error to log.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
