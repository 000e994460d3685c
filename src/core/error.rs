use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Missing required env var: {0}")]
    MissingEnv(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Db(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Kv(#[from] redis::RedisError),

    #[error("vendor feed error: {0}")]
    Feed(String),

    #[error("vendor rejected authentication: {0}")]
    AuthRejected(String),

    #[error("session issuer error: {0}")]
    Session(String),
}
