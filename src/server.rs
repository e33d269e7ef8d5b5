use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, Multipart, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::{HeaderValue, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    config::{AllowedOrigins, ServerConfig},
    detection::{Detection, ImageDimensions},
    image_input::decode_image,
    yolov8::Detector,
};

/// Name of the multipart field carrying the image.
const FILE_FIELD: &str = "file";

/// Shared state of the request handlers.
#[derive(Clone)]
pub struct AppState {
    detector: Arc<dyn Detector>,
}

impl AppState {
    /// Wrap the detector loaded at startup.
    pub fn new(detector: Arc<dyn Detector>) -> Self {
        Self { detector }
    }
}

/// Errors returned to API clients as `{success: false, error}`.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// The upload is not a decodable image.
    #[error("Invalid image file. Please upload a valid image.")]
    InvalidImage,

    /// The upload exceeds the configured body limit.
    #[error("Image file too large.")]
    PayloadTooLarge,

    /// Any other client mistake.
    #[error("{0}")]
    BadRequest(String),

    /// Inference failed; the detail is logged, never sent to the client.
    #[error("Prediction failed")]
    Internal(String),
}

impl ApiError {
    fn internal(err: impl std::fmt::Display) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return ApiError::PayloadTooLarge;
        }
        ApiError::BadRequest(format!("Malformed multipart body: {}", err.body_text()))
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(err: MultipartRejection) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return ApiError::PayloadTooLarge;
        }
        ApiError::BadRequest(err.body_text())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidImage | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(detail) => {
                tracing::error!("prediction failed: {detail}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    message: &'static str,
    status: &'static str,
    version: &'static str,
    model_loaded: bool,
}

#[derive(Serialize)]
struct PredictResponse {
    success: bool,
    detections: Vec<Detection>,
    count: usize,
    image_size: ImageDimensions,
}

/// Build the API router.
pub fn router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/predict", post(predict))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors_layer(&config.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &AllowedOrigins) -> CorsLayer {
    let origins = origins.clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &Parts| {
                origin.to_str().is_ok_and(|origin| origins.is_allowed(origin))
            },
        ))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn health() -> Json<HealthResponse> {
    // the router only exists once the detector is loaded
    Json(HealthResponse {
        message: "YellowCert Detection API",
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
        model_loaded: true,
    })
}

async fn predict(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let bytes = read_upload(multipart?).await?;
    tracing::debug!("received upload of {} bytes", bytes.len());

    let detector = state.detector.clone();
    let (image_size, bboxes) = tokio::task::spawn_blocking(move || {
        let image = decode_image(&bytes).map_err(|err| {
            tracing::debug!("rejecting upload: {err}");
            ApiError::InvalidImage
        })?;
        let image_size = ImageDimensions {
            width: image.width(),
            height: image.height(),
        };
        let bboxes = detector.detect(&image).map_err(ApiError::internal)?;
        Ok::<_, ApiError>((image_size, bboxes))
    })
    .await
    .map_err(ApiError::internal)??;

    tracing::info!(
        "detected {} objects in {}x{} image",
        bboxes.len(),
        image_size.width,
        image_size.height
    );

    let detections: Vec<Detection> = bboxes.iter().map(Detection::from_bounding_box).collect();
    Ok(Json(PredictResponse {
        success: true,
        count: detections.len(),
        detections,
        image_size,
    }))
}

async fn read_upload(mut multipart: Multipart) -> Result<Bytes, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FILE_FIELD) {
            return Ok(field.bytes().await?);
        }
    }
    Err(ApiError::BadRequest(format!(
        "No file uploaded. Send the image in a multipart field named `{FILE_FIELD}`."
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoundingBox, YoloV8Error};
    use axum::{
        body::Body,
        http::{Request, header},
    };
    use kornia_image::Image;
    use serde_json::{Value, json};
    use std::io::Cursor;
    use tower::ServiceExt;

    const BOUNDARY: &str = "yellowcert-test-boundary";

    struct FixedDetector(Vec<BoundingBox>);

    impl Detector for FixedDetector {
        fn detect(&self, _image: &Image<u8, 3>) -> Result<Vec<BoundingBox>, YoloV8Error> {
            Ok(self.0.clone())
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn detect(&self, _image: &Image<u8, 3>) -> Result<Vec<BoundingBox>, YoloV8Error> {
            Err(YoloV8Error::LoadModelError(
                "weights at /srv/secret/best.safetensors vanished".to_string(),
            ))
        }
    }

    fn app(detector: impl Detector + 'static) -> Router {
        router(AppState::new(Arc::new(detector)), &ServerConfig::default())
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([255, 255, 255]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png)
            .expect("encode png");
        buf.into_inner()
    }

    fn multipart_request(field: &str, payload: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"upload.png\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("valid request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::get("/").body(Body::empty()).expect("valid request");
        let response = app(FixedDetector(vec![])).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({
                "message": "YellowCert Detection API",
                "status": "running",
                "version": env!("CARGO_PKG_VERSION"),
                "model_loaded": true,
            })
        );
    }

    #[tokio::test]
    async fn test_predict_blank_image() {
        let response = app(FixedDetector(vec![]))
            .oneshot(multipart_request("file", &png_bytes(2, 2)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({
                "success": true,
                "detections": [],
                "count": 0,
                "image_size": {"width": 2, "height": 2},
            })
        );
    }

    #[tokio::test]
    async fn test_predict_maps_detections() {
        let detector = FixedDetector(vec![
            BoundingBox {
                xmin: 4.0,
                ymin: 8.0,
                xmax: 60.0,
                ymax: 30.5,
                confidence: 0.876,
                class: 1,
            },
            BoundingBox {
                xmin: 0.0,
                ymin: 0.0,
                xmax: 10.0,
                ymax: 10.0,
                confidence: 0.123,
                class: 20,
            },
        ]);
        let response = app(detector)
            .oneshot(multipart_request("file", &png_bytes(64, 48)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["count"], 2);
        assert_eq!(body["image_size"], json!({"width": 64, "height": 48}));
        let detections = body["detections"].as_array().expect("detections array");
        assert_eq!(detections.len(), 2);
        assert_eq!(
            detections[0],
            json!({
                "class": "covid",
                "confidence": 0.88,
                "bbox": {"x1": 4.0, "y1": 8.0, "x2": 60.0, "y2": 30.5},
            })
        );
        assert_eq!(detections[1]["class"], "class_20");
        assert_eq!(detections[1]["confidence"], 0.12);
    }

    #[tokio::test]
    async fn test_predict_rejects_random_bytes() {
        let payload: Vec<u8> = (0..512u32).map(|i| (i * 37 % 251) as u8).collect();
        let response = app(FixedDetector(vec![]))
            .oneshot(multipart_request("file", &payload))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(
            body["error"],
            "Invalid image file. Please upload a valid image."
        );
    }

    #[tokio::test]
    async fn test_predict_rejects_empty_upload() {
        let response = app(FixedDetector(vec![]))
            .oneshot(multipart_request("file", &[]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["success"], false);
    }

    #[tokio::test]
    async fn test_predict_requires_file_field() {
        let response = app(FixedDetector(vec![]))
            .oneshot(multipart_request("image", &png_bytes(2, 2)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().is_some_and(|e| e.contains("`file`")));
    }

    #[tokio::test]
    async fn test_predict_requires_multipart() {
        let request = Request::post("/predict")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .expect("valid request");
        let response = app(FixedDetector(vec![])).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["success"], false);
    }

    #[tokio::test]
    async fn test_predict_rejects_oversized_upload() {
        let config = ServerConfig {
            max_upload_bytes: 1024,
            ..Default::default()
        };
        let app = router(AppState::new(Arc::new(FixedDetector(vec![]))), &config);
        let response = app
            .oneshot(multipart_request("file", &[0u8; 4096]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = json_body(response).await;
        assert_eq!(body, json!({"success": false, "error": "Image file too large."}));
    }

    #[tokio::test]
    async fn test_predict_hides_internal_errors() {
        let response = app(FailingDetector)
            .oneshot(multipart_request("file", &png_bytes(2, 2)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body, json!({"success": false, "error": "Prediction failed"}));
    }

    #[tokio::test]
    async fn test_cors_allows_local_frontend() {
        let request = Request::get("/")
            .header(header::ORIGIN, "http://localhost:3000")
            .body(Body::empty())
            .expect("valid request");
        let response = app(FixedDetector(vec![])).oneshot(request).await.expect("response");
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN),
            Some(&HeaderValue::from_static("http://localhost:3000"))
        );
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS),
            Some(&HeaderValue::from_static("true"))
        );
    }

    #[tokio::test]
    async fn test_cors_rejects_unknown_origin() {
        let request = Request::get("/")
            .header(header::ORIGIN, "https://evil.example.com")
            .body(Body::empty())
            .expect("valid request");
        let response = app(FixedDetector(vec![])).oneshot(request).await.expect("response");
        assert!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none()
        );
    }
}
