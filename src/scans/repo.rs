use sqlx::PgPool;

use super::repo_types::{NewScan, ScanRecord};

pub async fn insert(db: &PgPool, scan: &NewScan<'_>) -> Result<ScanRecord, sqlx::Error> {
    sqlx::query_as::<_, ScanRecord>(
        r#"
        INSERT INTO scan_history (user_id, image_path, plant_name, disease_name, confidence, scanned_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, user_id, image_path, plant_name, disease_name, confidence, scanned_at
        "#,
    )
    .bind(scan.user_id)
    .bind(scan.image_path)
    .bind(scan.plant_name)
    .bind(scan.disease_name)
    .bind(scan.confidence)
    .bind(scan.scanned_at)
    .fetch_one(db)
    .await
}

/// Every record for the user, newest first.
pub async fn list_by_user(db: &PgPool, user_id: i64) -> Result<Vec<ScanRecord>, sqlx::Error> {
    sqlx::query_as::<_, ScanRecord>(
        r#"
        SELECT id, user_id, image_path, plant_name, disease_name, confidence, scanned_at
        FROM scan_history
        WHERE user_id = $1
        ORDER BY scanned_at DESC, id DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(db)
    .await
}
