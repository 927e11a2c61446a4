use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub vit_path: PathBuf,
    pub efficientnet_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub upload_dir: PathBuf,
    pub body_limit_bytes: usize,
    pub models: ModelConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let db_max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);
        let upload_dir = std::env::var("UPLOAD_DIR")
            .unwrap_or_else(|_| "static/uploads".into())
            .into();
        let body_limit_bytes = std::env::var("BODY_LIMIT_MB")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(20)
            * 1024
            * 1024;
        let models = ModelConfig {
            vit_path: std::env::var("VIT_MODEL_PATH")
                .unwrap_or_else(|_| "plant_vit_model.pth".into())
                .into(),
            efficientnet_path: std::env::var("EFFICIENTNET_MODEL_PATH")
                .unwrap_or_else(|_| "efficientnetv2_ccmt_best.pth".into())
                .into(),
        };
        Ok(Self {
            database_url,
            db_max_connections,
            upload_dir,
            body_limit_bytes,
            models,
        })
    }
}
