use super::*;
use axum::{
    extract::{Multipart, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use std::io::Write as _;
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Debug, Clone, Default)]
struct ReceivedUpload {
    authorization: Option<String>,
    field_name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    bytes: Vec<u8>,
    text_fields: Vec<(String, String)>,
}

#[derive(Clone)]
enum Reply {
    Json(serde_json::Value),
    Text(&'static str),
    Status(StatusCode),
}

#[derive(Clone)]
struct ServerState {
    received: Arc<Mutex<Vec<ReceivedUpload>>>,
    reply: Reply,
}

async fn handle_upload(
    State(state): State<ServerState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut upload = ReceivedUpload {
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        ..Default::default()
    };

    while let Some(field) = multipart.next_field().await.expect("field") {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(file_name) = field.file_name().map(str::to_string) {
            upload.field_name = name;
            upload.file_name = Some(file_name);
            upload.content_type = field.content_type().map(str::to_string);
            upload.bytes = field.bytes().await.expect("bytes").to_vec();
        } else {
            let value = field.text().await.expect("text");
            upload.text_fields.push((name, value));
        }
    }
    state.received.lock().await.push(upload);

    match state.reply {
        Reply::Json(value) => Json(value).into_response(),
        Reply::Text(text) => text.into_response(),
        Reply::Status(status) => (status, "rejected").into_response(),
    }
}

async fn spawn_upload_server(reply: Reply) -> (String, Arc<Mutex<Vec<ReceivedUpload>>>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let received = Arc::new(Mutex::new(Vec::new()));
    let state = ServerState {
        received: Arc::clone(&received),
        reply,
    };
    let app = Router::new()
        .route("/upload", post(handle_upload))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/upload"), received)
}

fn recording_progress() -> (ProgressCallback, Arc<std::sync::Mutex<Vec<u8>>>) {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: ProgressCallback = Arc::new(move |percent| {
        sink.lock().unwrap().push(percent);
    });
    (callback, seen)
}

fn ignore_progress() -> ProgressCallback {
    Arc::new(|_| {})
}

#[test]
fn progress_percent_rounds_and_clamps() {
    assert_eq!(progress_percent(0, 200), 0);
    assert_eq!(progress_percent(1, 200), 1);
    assert_eq!(progress_percent(1, 3), 33);
    assert_eq!(progress_percent(2, 3), 67);
    assert_eq!(progress_percent(3, 3), 100);
    assert_eq!(progress_percent(10, 3), 100);
    assert_eq!(progress_percent(0, 0), 100);
}

#[test]
fn mime_type_prefers_explicit_then_guesses_from_name() {
    let explicit = FilePayload::from_bytes("report.bin", b"x".to_vec()).with_mime_type("text/csv");
    assert_eq!(mime_type_for(&explicit), "text/csv");

    let guessed = FilePayload::from_bytes("photo.png", b"x".to_vec());
    assert_eq!(mime_type_for(&guessed), "image/png");

    let unknown = FilePayload::from_bytes("blob.zzunknown", b"x".to_vec());
    assert_eq!(mime_type_for(&unknown), FALLBACK_MIME_TYPE);
}

#[tokio::test]
async fn sends_file_under_field_name_with_bearer_token() {
    let (endpoint, received) =
        spawn_upload_server(Reply::Json(serde_json::json!({ "id": 42, "ok": true }))).await;
    let transport = HttpUploadTransport::new();
    let file = FilePayload::from_bytes("stock.csv", b"sku,qty\nA-1,4\n".to_vec());
    let options = UploadOptions::new(endpoint)
        .with_field_name("attachment")
        .with_token("secret-token")
        .with_extra("warehouse", "north");

    let response = transport
        .upload(&file, &options, ignore_progress())
        .await
        .expect("upload");

    assert_eq!(
        response,
        UploadResponse::Json(serde_json::json!({ "id": 42, "ok": true }))
    );

    let received = received.lock().await;
    assert_eq!(received.len(), 1);
    let upload = &received[0];
    assert_eq!(upload.field_name, "attachment");
    assert_eq!(upload.file_name.as_deref(), Some("stock.csv"));
    assert_eq!(upload.content_type.as_deref(), Some("text/csv"));
    assert_eq!(upload.bytes, b"sku,qty\nA-1,4\n");
    assert_eq!(
        upload.authorization.as_deref(),
        Some("Bearer secret-token")
    );
    assert_eq!(
        upload.text_fields,
        vec![("warehouse".to_string(), "north".to_string())]
    );
}

#[tokio::test]
async fn omits_authorization_without_token() {
    let (endpoint, received) = spawn_upload_server(Reply::Text("stored")).await;
    let transport = HttpUploadTransport::new();
    let file = FilePayload::from_bytes("a.txt", b"hello".to_vec());

    let with_none = UploadOptions::new(endpoint.clone());
    transport
        .upload(&file, &with_none, ignore_progress())
        .await
        .expect("upload without token");

    let with_empty = UploadOptions::new(endpoint).with_token("");
    transport
        .upload(&file, &with_empty, ignore_progress())
        .await
        .expect("upload with empty token");

    let received = received.lock().await;
    assert_eq!(received.len(), 2);
    assert!(received.iter().all(|upload| upload.authorization.is_none()));
    assert_eq!(received[0].field_name, "file");
}

#[tokio::test]
async fn keeps_non_json_body_as_text() {
    let (endpoint, _received) = spawn_upload_server(Reply::Text("stored as 17")).await;
    let transport = HttpUploadTransport::new();
    let file = FilePayload::from_bytes("a.txt", b"hello".to_vec());

    let response = transport
        .upload(&file, &UploadOptions::new(endpoint), ignore_progress())
        .await
        .expect("upload");

    assert_eq!(response, UploadResponse::Text("stored as 17".to_string()));
}

#[tokio::test]
async fn non_success_status_is_upload_failed() {
    let (endpoint, _received) =
        spawn_upload_server(Reply::Status(StatusCode::INTERNAL_SERVER_ERROR)).await;
    let transport = HttpUploadTransport::new();
    let file = FilePayload::from_bytes("a.txt", b"hello".to_vec());

    let err = transport
        .upload(&file, &UploadOptions::new(endpoint), ignore_progress())
        .await
        .expect_err("500 must fail");

    assert_eq!(
        err,
        UploadError::upload_failed(500, "Internal Server Error")
    );
}

#[tokio::test]
async fn unreachable_endpoint_is_network_error() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let transport = HttpUploadTransport::new();
    let file = FilePayload::from_bytes("a.txt", b"hello".to_vec());
    let err = transport
        .upload(
            &file,
            &UploadOptions::new(format!("http://{addr}/upload")),
            ignore_progress(),
        )
        .await
        .expect_err("nothing listens there");

    assert!(matches!(err, UploadError::Network { .. }), "{err:?}");
}

#[tokio::test]
async fn malformed_endpoint_fails_at_upload_time() {
    let transport = HttpUploadTransport::new();
    let file = FilePayload::from_bytes("a.txt", b"hello".to_vec());

    let err = transport
        .upload(&file, &UploadOptions::new("not a url"), ignore_progress())
        .await
        .expect_err("malformed endpoint");

    assert!(matches!(err, UploadError::Network { .. }), "{err:?}");
}

#[tokio::test]
async fn reports_monotonic_progress_up_to_100() {
    let (endpoint, received) = spawn_upload_server(Reply::Text("ok")).await;
    let transport = HttpUploadTransport::new();
    let payload: Vec<u8> = (0..(UPLOAD_CHUNK_SIZE * 3 + 100))
        .map(|i| (i % 251) as u8)
        .collect();
    let file = FilePayload::from_bytes("big.bin", payload.clone());
    let (progress, seen) = recording_progress();

    transport
        .upload(&file, &UploadOptions::new(endpoint), progress)
        .await
        .expect("upload");

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 4);
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "{seen:?}");
    assert_eq!(seen.last().copied(), Some(100));
    assert_eq!(received.lock().await[0].bytes, payload);
}

#[tokio::test]
async fn empty_payload_reports_complete_progress() {
    let (endpoint, received) = spawn_upload_server(Reply::Text("ok")).await;
    let transport = HttpUploadTransport::new();
    let file = FilePayload::from_bytes("empty.txt", Vec::<u8>::new());
    let (progress, seen) = recording_progress();

    transport
        .upload(&file, &UploadOptions::new(endpoint), progress)
        .await
        .expect("upload");

    assert_eq!(*seen.lock().unwrap(), vec![100]);
    assert!(received.lock().await[0].bytes.is_empty());
}

#[tokio::test]
async fn rejected_upload_never_reports_complete_progress() {
    let (endpoint, received) =
        spawn_upload_server(Reply::Status(StatusCode::INTERNAL_SERVER_ERROR)).await;
    let transport = HttpUploadTransport::new();
    let payload = vec![7u8; UPLOAD_CHUNK_SIZE * 3];
    let file = FilePayload::from_bytes("rows.bin", payload.clone());
    let (progress, seen) = recording_progress();

    transport
        .upload(&file, &UploadOptions::new(endpoint), progress)
        .await
        .expect_err("server rejects");

    assert_eq!(*seen.lock().unwrap(), vec![33, 67]);
    assert_eq!(received.lock().await[0].bytes, payload);
}

#[tokio::test]
async fn empty_payload_to_unreachable_endpoint_reports_no_progress() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let transport = HttpUploadTransport::new();
    let file = FilePayload::from_bytes("empty.txt", Vec::<u8>::new());
    let (progress, seen) = recording_progress();

    let err = transport
        .upload(&file, &UploadOptions::new(format!("http://{addr}/upload")), progress)
        .await
        .expect_err("nothing listens there");

    assert!(matches!(err, UploadError::Network { .. }), "{err:?}");
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reads_path_payload_when_upload_starts() {
    let (endpoint, received) = spawn_upload_server(Reply::Text("ok")).await;
    let mut temp = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("tempfile");
    temp.write_all(br#"{"sku":"A-1"}"#).expect("write");
    let file = FilePayload::from_path(temp.path());
    let expected_name = file.file_name.clone();

    HttpUploadTransport::new()
        .upload(&file, &UploadOptions::new(endpoint), ignore_progress())
        .await
        .expect("upload");

    let received = received.lock().await;
    assert_eq!(received[0].bytes, br#"{"sku":"A-1"}"#);
    assert_eq!(received[0].file_name.as_deref(), Some(expected_name.as_str()));
    assert_eq!(received[0].content_type.as_deref(), Some("application/json"));
}

#[tokio::test]
async fn missing_path_payload_is_payload_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = FilePayload::from_path(dir.path().join("gone.csv"));

    let err = HttpUploadTransport::new()
        .upload(
            &file,
            &UploadOptions::new("http://127.0.0.1:9/upload"),
            ignore_progress(),
        )
        .await
        .expect_err("missing file");

    assert!(matches!(err, UploadError::Payload { .. }), "{err:?}");
}

#[test]
fn builds_client_from_config() {
    let config = HttpTransportConfig {
        timeout: Some(Duration::from_secs(5)),
        user_agent: Some("uploader-test".to_string()),
    };
    HttpUploadTransport::from_config(&config).expect("client");
}
