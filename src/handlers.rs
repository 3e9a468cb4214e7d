use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use actix_multipart::Multipart;
use actix_web::http::header::{self, HeaderMap};
use actix_web::http::StatusCode;
use actix_web::rt::time::timeout;
use actix_web::web::Bytes;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use futures_util::{Stream, StreamExt};
use log::{error, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::classifier::{ClassifierService, Readiness};
use crate::errors::{PredictError, ValidationError};
use crate::models::{
    ErrorBody, HealthResponse, HealthStatus, PredictionResponse, ServiceDescriptor,
};

/// Seconds a client should wait before retrying while the model loads.
const RETRY_AFTER_SECS: &str = "5";

pub struct AppState {
    pub classifier: Arc<ClassifierService>,
    pub max_upload_bytes: usize,
    pub inference_timeout: Duration,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(index)))
        .service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/classify").route(web::post().to(classify)));
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("the classification model is still loading, retry shortly")]
    Starting,

    #[error("the classification model failed to load, the service cannot classify images")]
    Unavailable,

    #[error(transparent)]
    Predict(#[from] PredictError),

    #[error("inference did not finish within {0} ms")]
    Timeout(u128),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(ValidationError::PayloadTooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Starting | ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Predict(PredictError::InvalidImage(_)) => StatusCode::BAD_REQUEST,
            ApiError::Predict(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        if let ApiError::Starting = self {
            builder.insert_header((header::RETRY_AFTER, RETRY_AFTER_SECS));
        }
        builder.json(ErrorBody {
            detail: self.to_string(),
        })
    }
}

struct Upload {
    bytes: Vec<u8>,
    content_type: String,
    filename: Option<String>,
}

pub async fn index(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ServiceDescriptor {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        model_loaded: state.classifier.is_ready(),
        message: "Tennis image classification service. POST an image to /classify.",
    })
}

pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let (status, message) = match state.classifier.readiness() {
        Readiness::Ready => (HealthStatus::Ok, "model loaded"),
        Readiness::Starting => (HealthStatus::Starting, "model is still loading"),
        Readiness::Failed => (HealthStatus::Degraded, "model failed to load"),
    };

    HttpResponse::Ok().json(HealthResponse {
        status,
        model_loaded: status == HealthStatus::Ok,
        message,
    })
}

pub async fn classify(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let result = classify_upload(&req, payload, &state).await;
    if let Err(e) = &result {
        log_failure(&state.classifier, e);
    }
    result
}

fn log_failure(classifier: &ClassifierService, e: &ApiError) {
    if !e.status_code().is_server_error() {
        warn!("Rejected classification request: {}", e);
        return;
    }
    match (e, classifier.failure()) {
        (ApiError::Unavailable, Some(cause)) => {
            error!("Rejected classification, model load failed: {}", cause)
        }
        _ => error!("Classification failed: {}", e),
    }
}

async fn classify_upload(
    req: &HttpRequest,
    payload: web::Payload,
    state: &AppState,
) -> Result<HttpResponse, ApiError> {
    let upload = read_upload(req, payload, state.max_upload_bytes).await?;

    match state.classifier.readiness() {
        Readiness::Ready => {}
        Readiness::Starting => return Err(ApiError::Starting),
        Readiness::Failed => return Err(ApiError::Unavailable),
    }

    let size_bytes = upload.bytes.len();
    let classifier = Arc::clone(&state.classifier);
    let bytes = upload.bytes;
    let job = web::block(move || classifier.predict(&bytes));

    let prediction = match timeout(state.inference_timeout, job).await {
        Err(_) => return Err(ApiError::Timeout(state.inference_timeout.as_millis())),
        Ok(Err(e)) => return Err(ApiError::Internal(e.to_string())),
        Ok(Ok(result)) => result?,
    };

    Ok(HttpResponse::Ok().json(PredictionResponse {
        prediction,
        filename: upload.filename,
        content_type: upload.content_type,
        size_bytes,
        request_id: Uuid::new_v4(),
    }))
}

fn is_image(content_type: &str) -> bool {
    content_type.trim().to_ascii_lowercase().starts_with("image/")
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

/// Accepts either a multipart form carrying one file or a raw image body.
async fn read_upload(
    req: &HttpRequest,
    payload: web::Payload,
    limit: usize,
) -> Result<Upload, ValidationError> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if content_type.to_ascii_lowercase().starts_with("multipart/") {
        return read_multipart(req.headers(), payload, limit).await;
    }

    if !is_image(&content_type) {
        return Err(ValidationError::NotAnImage(describe(&content_type)));
    }
    if declared_length(req.headers()).is_some_and(|len| len > limit) {
        return Err(ValidationError::PayloadTooLarge { limit });
    }

    let bytes = collect_limited(payload, 0, limit).await?;
    Ok(Upload {
        bytes,
        content_type,
        filename: None,
    })
}

async fn read_multipart(
    headers: &HeaderMap,
    payload: web::Payload,
    limit: usize,
) -> Result<Upload, ValidationError> {
    let mut multipart = Multipart::new(headers, payload);
    let mut consumed = 0;

    while let Some(item) = multipart.next().await {
        let mut field = item.map_err(malformed)?;

        let disposition = field.content_disposition();
        let filename = disposition.get_filename().map(str::to_string);
        let is_file = filename.is_some() || disposition.get_name() == Some("file");
        if !is_file {
            consumed = drain_limited(&mut field, consumed, limit).await?;
            continue;
        }

        let content_type = field.content_type().to_string();
        if !is_image(&content_type) {
            return Err(ValidationError::NotAnImage(describe(&content_type)));
        }

        let bytes = collect_limited(field, consumed, limit).await?;
        return Ok(Upload {
            bytes,
            content_type,
            filename,
        });
    }

    Err(ValidationError::MissingFile)
}

/// Buffers a stream. `consumed` bytes of the same request already count
/// against `limit`.
async fn collect_limited<S, E>(
    mut stream: S,
    consumed: usize,
    limit: usize,
) -> Result<Vec<u8>, ValidationError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(malformed)?;
        if consumed + bytes.len() + chunk.len() > limit {
            return Err(ValidationError::PayloadTooLarge { limit });
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Discards a stream and returns the running byte count, failing once it
/// passes `limit`.
async fn drain_limited<S, E>(
    stream: &mut S,
    mut consumed: usize,
    limit: usize,
) -> Result<usize, ValidationError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    while let Some(chunk) = stream.next().await {
        consumed += chunk.map_err(malformed)?.len();
        if consumed > limit {
            return Err(ValidationError::PayloadTooLarge { limit });
        }
    }
    Ok(consumed)
}

fn malformed(e: impl Display) -> ValidationError {
    ValidationError::MalformedUpload(e.to_string())
}

fn describe(content_type: &str) -> String {
    if content_type.is_empty() {
        "none".to_string()
    } else {
        content_type.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use actix_web::test::{call_service, init_service, read_body_json, TestRequest};
    use actix_web::App;
    use serde_json::Value;

    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::classifier::test_support::{ready_service, solid_png};
    use crate::classifier::{Device, LoadOptions};
    use crate::errors::LoadError;
    use crate::preprocess::Preprocessing;

    const LABELS: [&str; 2] = ["ball", "racket"];
    const BOUNDARY: &str = "----tennis-classifier-boundary";

    fn state(service: ClassifierService, max_upload_bytes: usize) -> web::Data<AppState> {
        web::Data::new(AppState {
            classifier: Arc::new(service),
            max_upload_bytes,
            inference_timeout: Duration::from_secs(5),
        })
    }

    fn multipart_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    fn multipart(filename: &str, content_type: &str, data: &[u8]) -> (String, Vec<u8>) {
        let disposition = format!("form-data; name=\"file\"; filename=\"{filename}\"");
        let open = format!("--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\n");
        let head = format!("{open}Content-Type: {content_type}\r\n\r\n");
        let close = format!("\r\n--{BOUNDARY}--\r\n");
        let body = [head.as_bytes(), data, close.as_bytes()].concat();
        (multipart_type(), body)
    }

    fn form_field(name: &str, value: &str) -> (String, Vec<u8>) {
        let disposition = format!("form-data; name=\"{name}\"");
        let head = format!("--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\n\r\n");
        let body = format!("{head}{value}\r\n--{BOUNDARY}--\r\n");
        (multipart_type(), body.into_bytes())
    }

    fn classify_request(content_type: &str, body: Vec<u8>) -> TestRequest {
        TestRequest::post()
            .uri("/classify")
            .insert_header((header::CONTENT_TYPE, content_type.to_string()))
            .set_payload(body)
    }

    #[actix_rt::test]
    async fn classifies_uploaded_png() {
        let service = ready_service(FakeBackend::red_intensity(), &LABELS);
        let app = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;

        let png = solid_png(10, 10, [220, 30, 30]);
        let (content_type, body) = multipart("ball.png", "image/png", &png);
        let req = classify_request(&content_type, body).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = read_body_json(resp).await;
        let class_name = body["prediction"]["class_name"].as_str().unwrap();
        let confidence = body["prediction"]["confidence"].as_f64().unwrap();
        assert!(LABELS.contains(&class_name));
        assert!((0.0..=1.0).contains(&confidence));
        assert_eq!(confidence, (confidence * 10_000.0).round() / 10_000.0);
        assert_eq!(body["filename"], "ball.png");
        assert_eq!(body["content_type"], "image/png");
        let request_id = body["request_id"].as_str().unwrap();
        assert!(request_id.parse::<Uuid>().is_ok());
    }

    #[actix_rt::test]
    async fn filename_does_not_influence_prediction() {
        let service = ready_service(FakeBackend::red_intensity(), &LABELS);
        let app = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;
        let png = solid_png(10, 10, [20, 30, 200]);

        let mut predictions = Vec::new();
        for filename in ["ball.png", "racket.png"] {
            let (content_type, body) = multipart(filename, "image/png", &png);
            let req = classify_request(&content_type, body).to_request();
            let body: Value = read_body_json(call_service(&app, req).await).await;
            predictions.push(body["prediction"].clone());
        }
        assert_eq!(predictions[0], predictions[1]);
        assert_eq!(predictions[0]["class_name"], "racket");
    }

    #[actix_rt::test]
    async fn accepts_raw_image_body() {
        let service = ready_service(FakeBackend::red_intensity(), &LABELS);
        let app = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;

        let png = solid_png(10, 10, [250, 0, 0]);
        let req = classify_request("image/png", png).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = read_body_json(resp).await;
        assert_eq!(body["prediction"]["class_name"], "ball");
        assert_eq!(body["filename"], Value::Null);
    }

    #[actix_rt::test]
    async fn rejects_non_image_without_inference() {
        let backend = FakeBackend::red_intensity();
        let calls = backend.calls();
        let service = ready_service(backend, &LABELS);
        let app = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;

        let (content_type, body) = multipart("notes.png", "text/plain", b"just some text");
        let req = classify_request(&content_type, body).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = read_body_json(resp).await;
        assert!(body["detail"].as_str().unwrap().contains("image"));

        let text = b"just some text".to_vec();
        let req = classify_request("text/plain", text).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_rt::test]
    async fn rejects_oversized_upload_without_inference() {
        let backend = FakeBackend::red_intensity();
        let calls = backend.calls();
        let service = ready_service(backend, &LABELS);
        let limit = 16;
        let app = init_service(
            App::new()
                .app_data(state(service, limit))
                .configure(configure),
        )
        .await;
        let png = solid_png(64, 64, [1, 2, 3]);

        let (content_type, body) = multipart("big.png", "image/png", &png);
        let req = classify_request(&content_type, body).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let req = classify_request("image/png", png).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_rt::test]
    async fn rejects_multipart_without_file() {
        let service = ready_service(FakeBackend::red_intensity(), &LABELS);
        let app = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;

        let (content_type, body) = form_field("comment", "hello");
        let req = classify_request(&content_type, body).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_rt::test]
    async fn oversized_form_fields_count_against_limit() {
        let backend = FakeBackend::red_intensity();
        let calls = backend.calls();
        let service = ready_service(backend, &LABELS);
        let limit = 64;
        let app = init_service(
            App::new()
                .app_data(state(service, limit))
                .configure(configure),
        )
        .await;

        let (content_type, body) = form_field("comment", &"x".repeat(200));
        let req = classify_request(&content_type, body).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: Value = read_body_json(resp).await;
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.contains("64"), "{detail}");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_rt::test]
    async fn starting_service_answers_503_with_retry_after() {
        let service = ClassifierService::new();
        let app = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;

        let png = solid_png(10, 10, [0, 0, 0]);
        let (content_type, body) = multipart("ball.png", "image/png", &png);
        let req = classify_request(&content_type, body).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.headers().contains_key(header::RETRY_AFTER));
        let body: Value = read_body_json(resp).await;
        assert!(body["detail"].as_str().unwrap().contains("still loading"));
    }

    #[actix_rt::test]
    async fn failed_service_answers_503_without_retry_after() {
        let service = ClassifierService::new();
        let missing = LoadError::NotFound("models/best.onnx".into());
        let _ = service.load_with(|| Err(missing));
        let app = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;

        let png = solid_png(10, 10, [0, 0, 0]);
        let req = classify_request("image/png", png).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!resp.headers().contains_key(header::RETRY_AFTER));
        let body: Value = read_body_json(resp).await;
        assert!(body["detail"].as_str().unwrap().contains("failed to load"));
    }

    #[actix_rt::test]
    async fn undecodable_image_is_bad_request() {
        let service = ready_service(FakeBackend::red_intensity(), &LABELS);
        let app = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;

        let (content_type, body) = multipart("fake.png", "image/png", b"not really a png");
        let req = classify_request(&content_type, body).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = read_body_json(resp).await;
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("invalid image"));
    }

    #[actix_rt::test]
    async fn inference_failure_is_server_error() {
        let service = ready_service(FakeBackend::failing("tensor shape mismatch"), &LABELS);
        let app = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;

        let png = solid_png(10, 10, [0, 0, 0]);
        let req = classify_request("image/png", png).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = read_body_json(resp).await;
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.contains("tensor shape mismatch"));
    }

    #[actix_rt::test]
    async fn slow_inference_times_out() {
        let backend = FakeBackend::slow(Duration::from_millis(500), vec![0.4, 0.6]);
        let data = web::Data::new(AppState {
            classifier: Arc::new(ready_service(backend, &LABELS)),
            max_upload_bytes: 1 << 20,
            inference_timeout: Duration::from_millis(20),
        });
        let app = App::new().app_data(data).configure(configure);
        let app = init_service(app).await;

        let png = solid_png(10, 10, [0, 0, 0]);
        let req = classify_request("image/png", png).to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[actix_rt::test]
    async fn health_reports_each_state() {
        let service = ClassifierService::new();
        let starting = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;
        let req = TestRequest::get().uri("/health").to_request();
        let resp = call_service(&starting, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = read_body_json(resp).await;
        assert_eq!(body["status"], "starting");
        assert_eq!(body["model_loaded"], false);

        let service = ready_service(FakeBackend::red_intensity(), &LABELS);
        let ready = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;
        let req = TestRequest::get().uri("/health").to_request();
        let body: Value = read_body_json(call_service(&ready, req).await).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["model_loaded"], true);
    }

    #[actix_rt::test]
    async fn health_after_missing_artifact_is_degraded() {
        let service = ClassifierService::new();
        let options = LoadOptions {
            model_path: "/nonexistent/best.onnx".into(),
            labels_path: "/nonexistent/labels.txt".into(),
            device: Device::Cpu,
            preprocessing: Preprocessing::default(),
        };
        assert!(service.load(&options).is_err());

        let app = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;
        let req = TestRequest::get().uri("/health").to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = read_body_json(resp).await;
        assert_eq!(body["model_loaded"], false);
        assert_eq!(body["status"], "degraded");
        assert_ne!(body["status"], "starting");
    }

    #[actix_rt::test]
    async fn index_describes_service() {
        let service = ClassifierService::new();
        let app = init_service(
            App::new()
                .app_data(state(service, 1 << 20))
                .configure(configure),
        )
        .await;

        let req = TestRequest::get().uri("/").to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = read_body_json(resp).await;
        assert_eq!(body["name"], env!("CARGO_PKG_NAME"));
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["model_loaded"], false);
    }

    #[test]
    fn image_content_types_are_recognised() {
        assert!(is_image("image/png"));
        assert!(is_image("IMAGE/JPEG"));
        assert!(!is_image("text/plain"));
        assert!(!is_image(""));
    }
}
