use std::net::SocketAddr;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;
use crate::{auth, scans};

pub const STATUS_TEXT: &str = "Plant Disease Detection API is running!";

pub fn build_app(state: AppState) -> Router {
    let body_limit = state.config.body_limit_bytes;
    Router::new()
        .route("/", get(|| async { STATUS_TEXT }))
        .merge(auth::router())
        .merge(scans::router())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!(
                        "http_request",
                        %method,
                        uri = %uri,
                        status = tracing::field::Empty
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     _latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        if status.is_server_error() {
                            tracing::error!(%status, "response");
                        } else {
                            tracing::info!(%status, "response");
                        }
                    },
                ),
        )
}

pub async fn serve(app: Router) -> anyhow::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        std::env::var("APP_PORT").unwrap_or_else(|_| "5001".into())
    )
    .parse()?;

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const BOUNDARY: &str = "leafboundary";

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a str, &'a [u8]),
    }

    fn multipart(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                            .as_bytes(),
                    );
                }
                Part::File(name, content_type, data) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"leaf\"\r\n\
                             Content-Type: {content_type}\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(data);
                    body.extend_from_slice(b"\r\n");
                }
            }
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(state: AppState, req: Request<Body>) -> Response {
        build_app(state).oneshot(req).await.unwrap()
    }

    async fn send_fake(req: Request<Body>) -> Response {
        let (state, _uploads) = AppState::fake().await;
        send(state, req).await
    }

    async fn body_bytes(res: Response) -> Bytes {
        res.into_body().collect().await.unwrap().to_bytes()
    }

    async fn error_message(res: Response) -> String {
        let value: serde_json::Value = serde_json::from_slice(&body_bytes(res).await).unwrap();
        value["error"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn home_reports_running() {
        let res = send_fake(
            Request::get("/").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(&body_bytes(res).await[..], STATUS_TEXT.as_bytes());
    }

    #[tokio::test]
    async fn predict_without_user_id_is_bad_request() {
        let req = multipart("/predict", &[Part::File("image", "image/png", b"\x89PNG")]);
        let res = send_fake(req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_message(res).await, "Missing image or user_id");
    }

    #[tokio::test]
    async fn predict_without_image_is_bad_request() {
        let req = multipart("/predict", &[Part::Text("user_id", "1")]);
        let res = send_fake(req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_message(res).await, "Missing image or user_id");
    }

    #[tokio::test]
    async fn predict_rejects_unknown_model_type() {
        let req = multipart(
            "/predict",
            &[
                Part::File("image", "image/png", b"\x89PNG"),
                Part::Text("user_id", "1"),
                Part::Text("model_type", "resnet"),
            ],
        );
        let res = send_fake(req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(error_message(res).await.contains("resnet"));
    }

    #[tokio::test]
    async fn unavailable_model_is_bad_request_and_writes_nothing() {
        let (state, _uploads) = AppState::fake().await;
        let upload_dir = state.config.upload_dir.clone();
        let req = multipart(
            "/predict",
            &[
                Part::File("image", "image/png", b"\x89PNG"),
                Part::Text("user_id", "1"),
                Part::Text("model_type", "efficientnet"),
            ],
        );
        let res = send(state, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let msg = error_message(res).await;
        assert!(msg.contains("efficientnet") && msg.contains("not available"), "{msg}");
        assert_eq!(std::fs::read_dir(upload_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn predict_requires_multipart_body() {
        let req = Request::post("/predict")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"user_id": 1}"#))
            .unwrap();
        let res = send_fake(req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(!error_message(res).await.is_empty());
    }

    #[tokio::test]
    async fn signup_rejects_malformed_json() {
        let req = Request::post("/signup")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"username": "ana""#))
            .unwrap();
        let res = send_fake(req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(!error_message(res).await.is_empty());
    }

    #[tokio::test]
    async fn login_requires_password_field() {
        let req = Request::post("/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"email": "ana@example.com"}"#))
            .unwrap();
        let res = send_fake(req).await;
        assert!(res.status().is_client_error());
        assert!(error_message(res).await.contains("password"));
    }

    #[tokio::test]
    async fn history_rejects_non_integer_user_id() {
        let res = send_fake(
            Request::get("/history/abc").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn add_history_rejects_out_of_range_confidence() {
        let req = multipart(
            "/history/add",
            &[
                Part::Text("user_id", "3"),
                Part::File("image", "image/jpeg", b"\xff\xd8\xff"),
                Part::Text("plant_name", "Maize"),
                Part::Text("disease_name", "streak virus"),
                Part::Text("confidence", "1.7"),
            ],
        );
        let res = send_fake(req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(error_message(res).await.contains("confidence"));
    }

    #[tokio::test]
    async fn add_history_names_missing_field() {
        let req = multipart(
            "/history/add",
            &[
                Part::Text("user_id", "3"),
                Part::File("image", "image/jpeg", b"\xff\xd8\xff"),
                Part::Text("plant_name", "Maize"),
            ],
        );
        let res = send_fake(req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_message(res).await, "Missing field: disease_name");
    }

    #[tokio::test]
    async fn stored_image_is_served_with_content_type() {
        let (state, _uploads) = AppState::fake().await;
        state
            .storage
            .put_object("scan_1_abc.png", Bytes::from_static(b"\x89PNG"))
            .await
            .unwrap();
        let res = send(
            state,
            Request::get("/history/image/scan_1_abc.png")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(&body_bytes(res).await[..], b"\x89PNG");
    }

    #[tokio::test]
    async fn missing_image_is_not_found() {
        let res = send_fake(
            Request::get("/history/image/nope.jpg")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(error_message(res).await.contains("nope.jpg"));
    }

    #[tokio::test]
    async fn image_download_cannot_traverse_directories() {
        let res = send_fake(
            Request::get("/history/image/..%2F..%2Fetc%2Fpasswd")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fake_upload_dir_is_removed_with_its_guard() {
        let (state, uploads) = AppState::fake().await;
        let dir = state.config.upload_dir.clone();
        assert!(dir.is_dir());
        drop(uploads);
        assert!(!dir.exists());
    }
}
