use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    routing::{post, put},
    Json, Router,
};
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{
            ChangePasswordRequest, LoginRequest, LoginResponse, MessageResponse, SignupRequest,
            UpdateProfileRequest,
        },
        password::{hash_password, verify_password},
        repo_types::{NewUser, User},
    },
    error::ApiError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/signup", post(signup))
        .route("/login", post(login))
}

pub fn profile_routes() -> Router<AppState> {
    Router::new()
        .route("/update_profile/:user_id", put(update_profile))
        .route("/change_password/:user_id", put(change_password))
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let Json(payload) = payload?;

    let hash = hash_password(&payload.password)?;
    let new_user = NewUser {
        username: &payload.username,
        email: &payload.email,
        password_hash: &hash,
        name: payload.name.as_deref(),
        age: payload.age,
        gender: payload.gender.as_deref(),
    };

    let id = User::create(&state.db, &new_user).await.map_err(|e| {
        warn!(error = %e, username = %payload.username, "signup rejected by database");
        e
    })?;

    info!(user_id = id, username = %payload.username, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new("User created successfully")),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(payload) = payload?;

    let user = match User::find_by_email(&state.db, &payload.email).await? {
        Some(u) => u,
        None => {
            warn!(email = %payload.email, "login unknown email");
            return Err(ApiError::InvalidCredentials);
        }
    };

    // A corrupt stored hash is treated like a wrong password.
    let ok = verify_password(&payload.password, &user.password_hash).unwrap_or(false);
    if !ok {
        warn!(user_id = user.id, "login wrong password");
        return Err(ApiError::InvalidCredentials);
    }

    info!(user_id = user.id, "user logged in");
    Ok(Json(LoginResponse {
        message: "Login successful".into(),
        user_id: user.id,
        username: user.username,
        name: user.name,
    }))
}

#[instrument(skip(state, payload))]
pub async fn update_profile(
    State(state): State<AppState>,
    user_id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<UpdateProfileRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Path(user_id) = user_id?;
    let Json(payload) = payload?;

    let rows = User::update_profile(
        &state.db,
        user_id,
        payload.name.as_deref(),
        payload.age,
        payload.gender.as_deref(),
    )
    .await?;

    info!(user_id, rows, "profile updated");
    Ok(Json(MessageResponse::new("Profile updated")))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    user_id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Path(user_id) = user_id?;
    let Json(payload) = payload?;

    let hash = hash_password(&payload.new_password)?;
    let rows = User::update_password(&state.db, user_id, &hash).await?;

    info!(user_id, rows, "password changed");
    Ok(Json(MessageResponse::new("Password changed successfully")))
}
