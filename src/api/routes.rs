use axum::{routing::get, Router};

pub fn router() -> Router<crate::core::AppState> {
    Router::new().route("/healthz", get(health::healthz))
}

mod health {
    use axum::{extract::State, Json};
    use serde_json::json;

    use crate::connection::ConnectionState;
    use crate::core::AppState;

    fn state_label(s: ConnectionState) -> &'static str {
        match s {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    /// Liveness surface for operators/orchestrators (C11, spec §4.11). Not the
    /// out-of-scope plan CRUD API — just DB/KV reachability and per-connection
    /// state, the same thing the teacher's `/api/health` reported for Postgres.
    pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
        let db_ok = state.db.health().await.unwrap_or(false);
        let kv_ok = state.kv.health().await;
        let ltp_state = *state.feed_health.ltp.borrow();
        let snap_state = *state.feed_health.snap.borrow();

        Json(json!({
            "status": if db_ok && kv_ok { "ok" } else { "degraded" },
            "db_ok": db_ok,
            "kv_ok": kv_ok,
            "registry_tokens": state.registry.token_count(),
            "connections": [
                {"mode": "ltp", "state": state_label(ltp_state)},
                {"mode": "snapquote", "state": state_label(snap_state)},
            ],
        }))
    }
}
