//! Shared application state.

use std::sync::Arc;

use citadel_core::Core;

/// State handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Core>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
