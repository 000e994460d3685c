use tracing::info;

use crate::{core::AppError, core::AppState};

/// Startup health checks (C10, spec §4.10), mirroring the teacher's
/// `initialize_on_startup` shape: verify the collaborators this service
/// depends on are reachable before the feed manager starts dialing upstream.
pub async fn initialize_on_startup(state: &AppState) -> Result<(), AppError> {
    let db_ok = state.db.health().await?;
    info!(db_ok, "startup: database health check");

    let kv_ok = state.kv.health().await;
    info!(kv_ok, "startup: key/value store health check");

    Ok(())
}
