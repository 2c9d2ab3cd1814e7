use std::sync::Arc;

use crate::pipeline::RequestPipeline;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Verifier, limiter, cipher, blind index and signer, built once at startup
    pub pipeline: Arc<RequestPipeline>,
}
