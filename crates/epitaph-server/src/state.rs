use epitaph_client::DefaultFallback;
use epitaph_core::control::BatchManager;
use epitaph_db::Database;

pub type RunManager = BatchManager<Database, DefaultFallback>;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub db: Database,
    pub runs: RunManager,
    /// Bearer token for `/v1` routes (None = API disabled).
    pub admin_token: Option<String>,
}
