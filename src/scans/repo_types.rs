use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

/// One stored prediction. `image_path` is the filename inside the upload directory.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScanRecord {
    pub id: i64,
    pub user_id: i64,
    pub image_path: String,
    pub plant_name: String,
    pub disease_name: String,
    pub confidence: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub scanned_at: OffsetDateTime,
}

#[derive(Debug)]
pub struct NewScan<'a> {
    pub user_id: i64,
    pub image_path: &'a str,
    pub plant_name: &'a str,
    pub disease_name: &'a str,
    pub confidence: f64,
    pub scanned_at: OffsetDateTime,
}
