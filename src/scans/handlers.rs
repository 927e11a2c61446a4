use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::PathRejection,
        Multipart, Path, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument};

use crate::{
    auth::dto::MessageResponse,
    error::ApiError,
    inference::Prediction,
    state::AppState,
    storage::mime_from_key,
};

use super::{
    repo,
    repo_types::ScanRecord,
    services::{self, ScanForm},
};

pub fn predict_routes() -> Router<AppState> {
    Router::new().route("/predict", post(predict))
}

pub fn history_routes() -> Router<AppState> {
    Router::new()
        .route("/history/add", post(add_history))
        .route("/history/image/:filename", get(get_image))
        .route("/history/:user_id", get(list_history))
}

/// POST /predict (multipart: image, user_id, model_type?)
#[instrument(skip(state, mp))]
pub async fn predict(
    State(state): State<AppState>,
    mp: Result<Multipart, MultipartRejection>,
) -> Result<Json<Prediction>, ApiError> {
    let form = ScanForm::from_multipart(mp?).await?;
    let prediction = services::predict_and_record(&state, form).await?;
    Ok(Json(prediction))
}

#[instrument(skip(state))]
pub async fn list_history(
    State(state): State<AppState>,
    user_id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Vec<ScanRecord>>, ApiError> {
    let Path(user_id) = user_id?;
    let records = repo::list_by_user(&state.db, user_id).await?;
    info!(user_id, count = records.len(), "history listed");
    Ok(Json(records))
}

/// POST /history/add (multipart: user_id, image, plant_name, disease_name, confidence)
#[instrument(skip(state, mp))]
pub async fn add_history(
    State(state): State<AppState>,
    mp: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let form = ScanForm::from_multipart(mp?).await?;
    services::add_history(&state, form).await?;
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new("History saved successfully")),
    ))
}

#[instrument(skip(state))]
pub async fn get_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(body) = state.storage.get_object(&filename).await? else {
        return Err(ApiError::NotFound(format!("Image {filename} not found")));
    };
    Ok(([(header::CONTENT_TYPE, mime_from_key(&filename))], body))
}
