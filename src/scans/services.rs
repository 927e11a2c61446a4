use std::collections::HashMap;

use anyhow::anyhow;
use axum::extract::Multipart;
use bytes::Bytes;
use time::{macros::format_description, OffsetDateTime};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::ApiError,
    inference::{classify_blocking, ModelVariant, Prediction},
    state::AppState,
    storage::ext_from_mime,
};

use super::{repo, repo_types::NewScan};

pub const IMAGE_FIELD: &str = "image";

#[derive(Debug)]
pub struct UploadItem {
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// A multipart form split into its image part and its text fields.
#[derive(Debug, Default)]
pub struct ScanForm {
    pub image: Option<UploadItem>,
    fields: HashMap<String, String>,
}

impl ScanForm {
    pub async fn from_multipart(mut mp: Multipart) -> Result<Self, ApiError> {
        let mut form = ScanForm::default();
        while let Some(field) = mp.next_field().await? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if name == IMAGE_FIELD {
                let content_type = field.content_type().map(str::to_string);
                let body = field.bytes().await?;
                // An empty file part counts as no image.
                if !body.is_empty() {
                    form.image = Some(UploadItem { body, content_type });
                }
            } else {
                let value = field.text().await?;
                form.fields.insert(name, value);
            }
        }
        Ok(form)
    }

    /// Trimmed text field; blank values count as absent.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    #[cfg(test)]
    pub fn with_text(mut self, name: &str, value: &str) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    fn required(&self, name: &str) -> Result<&str, ApiError> {
        self.text(name)
            .ok_or_else(|| ApiError::BadRequest(format!("Missing field: {name}")))
    }
}

pub fn parse_user_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse::<i64>()
        .map_err(|_| ApiError::BadRequest(format!("user_id must be an integer, got `{raw}`")))
}

fn image_ext(content_type: Option<&str>) -> &'static str {
    content_type.and_then(ext_from_mime).unwrap_or("jpg")
}

/// `scan_<user_id>_<uuid>.<ext>`
pub fn scan_key(user_id: i64, content_type: Option<&str>) -> String {
    format!(
        "scan_{}_{}.{}",
        user_id,
        Uuid::new_v4().simple(),
        image_ext(content_type)
    )
}

/// `user_<user_id>_<YYYYmmddHHMMSS>_<suffix>.<ext>`; the random suffix keeps two uploads in the
/// same second apart.
pub fn history_key(
    user_id: i64,
    content_type: Option<&str>,
    at: OffsetDateTime,
) -> anyhow::Result<String> {
    let stamp = at.format(format_description!(
        "[year][month][day][hour][minute][second]"
    ))?;
    let suffix = Uuid::new_v4().simple().to_string();
    Ok(format!(
        "user_{}_{}_{}.{}",
        user_id,
        stamp,
        &suffix[..8],
        image_ext(content_type)
    ))
}

/// Classify an uploaded leaf and record the result against the user.
///
/// Validation and model resolution happen before anything is written, so a rejected request
/// leaves neither a file nor a row behind. Save, re-read, classify and insert are not
/// transactional: a failure after the save leaves an orphaned file.
pub async fn predict_and_record(state: &AppState, form: ScanForm) -> Result<Prediction, ApiError> {
    let (Some(image), Some(raw_user_id)) = (form.image.as_ref(), form.text("user_id")) else {
        return Err(ApiError::BadRequest("Missing image or user_id".into()));
    };
    let user_id = parse_user_id(raw_user_id)?;

    let variant = match form.text("model_type") {
        Some(raw) => raw.parse::<ModelVariant>().map_err(ApiError::BadRequest)?,
        None => ModelVariant::default(),
    };
    let classifier = state
        .classifiers
        .get(variant)
        .ok_or(ApiError::ModelUnavailable(variant))?;

    let key = scan_key(user_id, image.content_type.as_deref());
    state.storage.put_object(&key, image.body.clone()).await?;
    let saved = state
        .storage
        .get_object(&key)
        .await?
        .ok_or_else(|| anyhow!("saved image {key} could not be read back"))?;

    let prediction = classify_blocking(classifier, saved).await.map_err(|e| {
        warn!(error = %e, %key, %variant, "classification failed");
        e
    })?;

    let record = repo::insert(
        &state.db,
        &NewScan {
            user_id,
            image_path: &key,
            plant_name: &prediction.plant_name,
            disease_name: &prediction.disease_name,
            confidence: prediction.confidence,
            scanned_at: OffsetDateTime::now_utc(),
        },
    )
    .await?;

    info!(
        scan_id = record.id,
        user_id,
        %variant,
        plant = %prediction.plant_name,
        disease = %prediction.disease_name,
        "scan recorded"
    );
    Ok(prediction)
}

/// Store a client-supplied result with its image.
pub async fn add_history(state: &AppState, form: ScanForm) -> Result<i64, ApiError> {
    let user_id = parse_user_id(form.required("user_id")?)?;
    let image = form
        .image
        .as_ref()
        .ok_or_else(|| ApiError::BadRequest(format!("Missing field: {IMAGE_FIELD}")))?;
    let plant_name = form.required("plant_name")?;
    let disease_name = form.required("disease_name")?;
    let raw_confidence = form.required("confidence")?;
    let confidence = raw_confidence
        .parse::<f64>()
        .ok()
        .filter(|c| (0.0..=1.0).contains(c))
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "confidence must be a number in [0, 1], got `{raw_confidence}`"
            ))
        })?;

    let now = OffsetDateTime::now_utc();
    let key = history_key(user_id, image.content_type.as_deref(), now)?;
    state.storage.put_object(&key, image.body.clone()).await?;

    let record = repo::insert(
        &state.db,
        &NewScan {
            user_id,
            image_path: &key,
            plant_name,
            disease_name,
            confidence,
            scanned_at: now,
        },
    )
    .await?;

    info!(scan_id = record.id, user_id, "history entry added");
    Ok(record.id)
}
