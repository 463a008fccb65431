use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};
use leafid::IdGenerator;
use serde::{Deserialize, Serialize};

/// Shared by every request.
#[derive(Clone)]
pub struct AppState {
    generator: Arc<dyn IdGenerator>,
    query_param: Arc<str>,
}

impl AppState {
    pub fn new(generator: Arc<dyn IdGenerator>, query_param: &str) -> Self {
        Self {
            generator,
            query_param: Arc::from(query_param),
        }
    }
}

/// The body of every response. On failure `id` is the error's code and `msg`
/// its text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdResponse {
    pub id: i64,
    pub msg: String,
}

async fn next_id(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<IdResponse>) {
    let key = params
        .get(&*state.query_param)
        .map(String::as_str)
        .unwrap_or_default();

    match state.generator.generate(key).await {
        Ok(id) => (
            StatusCode::OK,
            Json(IdResponse {
                id,
                msg: String::new(),
            }),
        ),
        Err(e) => {
            tracing::warn!(key, error = %e, "id generation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(IdResponse {
                    id: e.code(),
                    msg: e.to_string(),
                }),
            )
        }
    }
}

pub fn router(state: AppState, request_path: &str) -> Router {
    Router::new()
        .route(request_path, get(next_id))
        .with_state(state)
}
