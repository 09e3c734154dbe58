// Receipt Ledger - Web Server
// REST API over review sessions with Axum

use anyhow::Context as AnyhowContext;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{delete, get, patch, post},
    Router,
};
use receipt_ledger::config::{ConfigError, Settings};
use receipt_ledger::extract::extract_receipt;
use receipt_ledger::intake::{self, Adjustments, CropBox, ImageUpload, IntakeError};
use receipt_ledger::logging::{init_logging, ConsoleOutput};
use receipt_ledger::review::{ReviewSession, SessionError, SessionView};
use receipt_ledger::schema::{receipt_json_schema, SchemaValidator};
use receipt_ledger::{collate, AnthropicClient, Exports, NameRules, ReceiptExtractor, ReceiptStore, StoredReceipt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const USER_HEADER: &str = "x-user";
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
/// Sessions untouched for this long are dropped
const SESSION_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

type Sessions = Arc<Mutex<HashMap<String, SessionEntry>>>;

/// An open review session and when it was last used
struct SessionEntry {
    session: ReviewSession,
    touched: Instant,
}

impl SessionEntry {
    fn new(session: ReviewSession) -> Self {
        Self {
            session,
            touched: Instant::now(),
        }
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    settings: Arc<Settings>,
    extractor: Arc<dyn ReceiptExtractor>,
    sessions: Sessions,
    /// One ledger connection per user, opened on first use
    stores: Arc<Mutex<HashMap<String, Arc<Mutex<ReceiptStore>>>>>,
}

impl AppState {
    fn new(settings: Settings, extractor: Arc<dyn ReceiptExtractor>) -> Self {
        Self {
            settings: Arc::new(settings),
            extractor,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            stores: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    fn not_found(id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("no session {}", id))
    }

    fn poisoned(what: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{} lock poisoned", what))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "request failed");
        }
        let body = ApiResponse {
            success: false,
            data: self.details,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let status = match &e {
            SessionError::WrongStage { .. } | SessionError::Busy | SessionError::NoImage => StatusCode::CONFLICT,
            SessionError::InvalidPath(_) | SessionError::ItemOutOfRange(_) => StatusCode::BAD_REQUEST,
            SessionError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::Extract(_) => StatusCode::BAD_GATEWAY,
            SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let details = match &e {
            SessionError::Invalid(errors) => serde_json::to_value(errors).ok(),
            _ => None,
        };
        Self {
            status,
            message: e.to_string(),
            details,
        }
    }
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        let status = match e {
            IntakeError::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            IntakeError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn user_from(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let explicit = headers.get(USER_HEADER).and_then(|v| v.to_str().ok());
    Ok(state.settings.resolve_user(explicit)?)
}

/// The user's store, opened once and shared by later requests
fn store_for(state: &AppState, user: &str) -> Result<Arc<Mutex<ReceiptStore>>, ApiError> {
    let mut stores = state.stores.lock().map_err(|_| ApiError::poisoned("store cache"))?;
    if let Some(store) = stores.get(user) {
        return Ok(Arc::clone(store));
    }

    let store = ReceiptStore::open(&state.settings.data, user)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("{:#}", e)))?;
    let store = Arc::new(Mutex::new(store));
    stores.insert(user.to_string(), Arc::clone(&store));
    Ok(store)
}

/// Run `f` against the user's store; never held across an await
fn with_store<R>(
    state: &AppState,
    user: &str,
    f: impl FnOnce(&ReceiptStore) -> Result<R, ApiError>,
) -> Result<R, ApiError> {
    let handle = store_for(state, user)?;
    let store = handle.lock().map_err(|_| ApiError::poisoned("store"))?;
    f(&store)
}

fn lock_sessions(sessions: &Sessions) -> Result<MutexGuard<'_, HashMap<String, SessionEntry>>, ApiError> {
    sessions.lock().map_err(|_| ApiError::poisoned("session map"))
}

/// Run `f` on a session owned by `user`; never held across an await
fn with_session<R>(
    state: &AppState,
    user: &str,
    id: &str,
    f: impl FnOnce(&mut ReviewSession) -> Result<R, ApiError>,
) -> Result<R, ApiError> {
    let mut sessions = lock_sessions(&state.sessions)?;

    match sessions.get_mut(id) {
        Some(entry) if entry.session.username() == user => {
            entry.touched = Instant::now();
            f(&mut entry.session)
        }
        _ => Err(ApiError::not_found(id)),
    }
}

/// Drop sessions idle past the TTL. In-flight ones stay until their call ends.
fn sweep_idle(sessions: &mut HashMap<String, SessionEntry>, now: Instant) -> usize {
    let before = sessions.len();
    sessions.retain(|_, entry| {
        entry.session.is_in_flight() || now.saturating_duration_since(entry.touched) < SESSION_TTL
    });
    let dropped = before - sessions.len();
    if dropped > 0 {
        tracing::info!(dropped, open = sessions.len(), "idle sessions dropped");
    }
    dropped
}

/// Releases the session's in-flight flag unless disarmed.
/// Covers handler futures dropped mid-extraction (client gone, timeout).
struct ExtractionGuard {
    sessions: Sessions,
    id: String,
    armed: bool,
}

impl ExtractionGuard {
    fn new(sessions: &Sessions, id: &str) -> Self {
        Self {
            sessions: Arc::clone(sessions),
            id: id.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ExtractionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut sessions) = self.sessions.lock() {
            if let Some(entry) = sessions.get_mut(&self.id) {
                entry.session.abort_extraction();
            }
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "version": receipt_ledger::VERSION,
    }))
}

/// GET /api/schema - Receipt JSON schema
async fn get_schema() -> impl IntoResponse {
    ApiResponse::ok(receipt_json_schema())
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    file_name: Option<String>,
    #[serde(default)]
    rotate: i32,
    crop: Option<String>,
}

/// POST /api/sessions - Upload an image and open a review session
async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> ApiResult<SessionView> {
    let user = user_from(&state, &headers)?;

    let crop = match query.crop.as_deref() {
        Some(raw) => Some(CropBox::parse(raw).ok_or_else(|| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("invalid crop '{}', expected x,y,width,height", raw))
        })?),
        None => None,
    };
    let adjustments = Adjustments {
        rotation_degrees: query.rotate,
        crop,
    };
    let upload = ImageUpload::new(query.file_name.unwrap_or_else(|| "upload".to_string()), body.to_vec());
    let options = state.settings.intake_options();

    // Decoding and resizing are CPU bound
    let image = tokio::task::spawn_blocking(move || intake::normalize(&upload, &adjustments, &options))
        .await
        .context("image normalization task failed")??;

    let earlier = with_store(&state, &user, |store| Ok(store.records_for_image(&image.original_sha256)?))?;
    if !earlier.is_empty() {
        tracing::warn!(user = %user, sha256 = %image.original_sha256, count = earlier.len(), "image already processed");
    }

    let mut session = ReviewSession::new(&user).with_engine(state.settings.reconciliation_engine());
    session.accept_image(image)?;
    let view = session.view();

    tracing::info!(user = %user, session = %view.id, "session opened");
    let mut sessions = lock_sessions(&state.sessions)?;
    sweep_idle(&mut sessions, Instant::now());
    sessions.insert(view.id.clone(), SessionEntry::new(session));

    Ok(ApiResponse::ok(view))
}

/// GET /api/sessions/:id - Current session state
async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<SessionView> {
    let user = user_from(&state, &headers)?;
    let view = with_session(&state, &user, &id, |session| Ok(session.view()))?;
    Ok(ApiResponse::ok(view))
}

/// POST /api/sessions/:id/extract - Run the one extraction call
async fn extract_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<SessionView> {
    let user = user_from(&state, &headers)?;
    let options = state.settings.extraction_options();

    let request = with_session(&state, &user, &id, |session| Ok(session.begin_extraction(&options)?))?;

    let mut guard = ExtractionGuard::new(&state.sessions, &id);
    let outcome = extract_receipt(state.extractor.as_ref(), &request, &SchemaValidator::new()).await;
    guard.disarm();

    with_session(&state, &user, &id, |session| match outcome {
        Ok((candidate, _)) => {
            session.apply_extraction(candidate)?;
            Ok(ApiResponse::ok(session.view()))
        }
        Err(e) => {
            session.record_failure(&e);
            Err(SessionError::from(e).into())
        }
    })
}

#[derive(Debug, Deserialize)]
struct FieldEdit {
    path: String,
    value: String,
}

/// PATCH /api/sessions/:id/fields - Edit one field and re-validate
async fn edit_field(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(edit): Json<FieldEdit>,
) -> ApiResult<SessionView> {
    let user = user_from(&state, &headers)?;
    let view = with_session(&state, &user, &id, |session| {
        session.edit(&edit.path, &edit.value)?;
        Ok(session.view())
    })?;
    Ok(ApiResponse::ok(view))
}

/// POST /api/sessions/:id/items - Append a blank item
async fn add_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<SessionView> {
    let user = user_from(&state, &headers)?;
    let view = with_session(&state, &user, &id, |session| {
        session.add_item()?;
        Ok(session.view())
    })?;
    Ok(ApiResponse::ok(view))
}

/// DELETE /api/sessions/:id/items/:index - Remove an item
async fn remove_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, index)): Path<(String, usize)>,
) -> ApiResult<SessionView> {
    let user = user_from(&state, &headers)?;
    let view = with_session(&state, &user, &id, |session| {
        session.remove_item(index)?;
        Ok(session.view())
    })?;
    Ok(ApiResponse::ok(view))
}

/// POST /api/sessions/:id/persist - Save the confirmed receipt.
/// A persisted session is closed; a failed save puts it back for more edits.
async fn persist_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StoredReceipt> {
    let user = user_from(&state, &headers)?;
    let handle = store_for(&state, &user)?;

    // Take the session out so disk and ledger writes run without the map lock
    let mut entry = {
        let mut sessions = lock_sessions(&state.sessions)?;
        let owned = sessions.get(&id).is_some_and(|e| e.session.username() == user);
        match sessions.remove(&id) {
            Some(entry) if owned => entry,
            Some(entry) => {
                sessions.insert(id.clone(), entry);
                return Err(ApiError::not_found(&id));
            }
            None => return Err(ApiError::not_found(&id)),
        }
    };

    let result = match handle.lock() {
        Ok(store) => entry.session.persist(&store).map(|stored| stored.clone()).map_err(ApiError::from),
        Err(_) => Err(ApiError::poisoned("store")),
    };

    match result {
        Ok(stored) => {
            tracing::info!(user = %user, session = %id, receipt = %stored.receipt_uuid, "receipt persisted, session closed");
            Ok(ApiResponse::ok(stored))
        }
        Err(e) => {
            entry.touched = Instant::now();
            lock_sessions(&state.sessions)?.insert(id, entry);
            Err(e)
        }
    }
}

/// GET /api/receipts - Persisted receipts of the user
async fn list_receipts(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Vec<StoredReceipt>> {
    let user = user_from(&state, &headers)?;
    let receipts = with_store(&state, &user, |store| Ok(store.list()?))?;
    Ok(ApiResponse::ok(receipts))
}

#[derive(Serialize)]
struct CollectResponse {
    shops: usize,
    items: usize,
    #[serde(flatten)]
    exports: Exports,
}

/// POST /api/collect - Write the CSV tables, workbook and artifact archive
async fn collect_receipts(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<CollectResponse> {
    let user = user_from(&state, &headers)?;

    let rules = match &state.settings.review.names_file {
        Some(path) => NameRules::load_from_file(path)?,
        None => NameRules::defaults(),
    };
    let response = with_store(&state, &user, |store| {
        let collation = collate::collect(store, &rules)?;
        if collation.is_empty() {
            return Err(ApiError::new(StatusCode::CONFLICT, "no persisted receipts to collate"));
        }
        let exports = collate::export(&collation, store)?;
        Ok(CollectResponse {
            shops: collation.shops.len(),
            items: collation.items.len(),
            exports,
        })
    })?;

    Ok(ApiResponse::ok(response))
}

/// GET / - Serve index.html
async fn serve_index() -> impl IntoResponse {
    Html(include_str!("../web/index.html"))
}

// ============================================================================
// Main Server
// ============================================================================

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/schema", get(get_schema))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/extract", post(extract_session))
        .route("/sessions/:id/fields", patch(edit_field))
        .route("/sessions/:id/items", post(add_item))
        .route("/sessions/:id/items/:index", delete(remove_item))
        .route("/sessions/:id/persist", post(persist_session))
        .route("/receipts", get(list_receipts))
        .route("/collect", post(collect_receipts))
        .with_state(state);

    Router::new()
        .route("/", get(serve_index))
        .nest("/api", api_routes)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load(None)?;
    init_logging(&settings.logging.level, settings.logging.directory.as_deref(), ConsoleOutput::Stderr)?;

    println!("🌐 Receipt Ledger - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut client = AnthropicClient::new(settings.anthropic_key()?);
    if let Some(base_url) = &settings.services.anthropic.base_url {
        client = client.with_base_url(base_url.clone());
    }
    if !client.is_reachable().await {
        tracing::warn!("extraction service status page unreachable");
    }

    let state = AppState::new(settings, Arc::new(client));

    // Abandoned sessions hold decoded images; drop them periodically
    let sessions = Arc::clone(&state.sessions);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match sessions.lock() {
                Ok(mut sessions) => {
                    sweep_idle(&mut sessions, Instant::now());
                }
                Err(_) => {
                    tracing::error!("session map poisoned, stopping idle sweep");
                    break;
                }
            }
        }
    });

    // Start server
    let addr = std::env::var("RECEIPTS_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/health", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, router(state))
        .await
        .context("Server error")?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use async_trait::async_trait;
    use receipt_ledger::{CannedExtractor, ExtractError, ExtractionRequest};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const SAMPLE: &str = include_str!("../fixtures/sample-receipt.json");

    fn png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(8, 12, image::Rgb([255, 255, 255]));
        let mut bytes = std::io::Cursor::new(Vec::new());
        img.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    struct HangingExtractor;

    #[async_trait]
    impl ReceiptExtractor for HangingExtractor {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn extract(&self, _request: &ExtractionRequest) -> Result<Value, ExtractError> {
            std::future::pending().await
        }
    }

    fn state_with(root: &std::path::Path, extractor: Arc<dyn ReceiptExtractor>) -> AppState {
        let mut settings = Settings::default();
        settings.data.root_dir = root.to_path_buf();
        AppState::new(settings, extractor)
    }

    fn state(root: &std::path::Path) -> AppState {
        state_with(root, Arc::new(CannedExtractor::new("canned", serde_json::from_str(SAMPLE).unwrap())))
    }

    fn app(root: &std::path::Path) -> Router {
        router(state(root))
    }

    async fn call(app: &Router, method: &str, uri: &str, user: &str, body: Body) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_HEADER, user)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn open_session(app: &Router, user: &str) -> String {
        let (status, body) = call(app, "POST", "/api/sessions?file_name=r.png&rotate=90", user, Body::from(png())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["stage"], "extracting");
        assert_eq!(body["data"]["image"]["width"], 12);
        body["data"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_review_flow() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let id = open_session(&app, "alice").await;

        let (status, body) = call(&app, "POST", &format!("/api/sessions/{}/extract", id), "alice", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["stage"], "reviewing");
        assert_eq!(body["data"]["valid"], true);
        assert_eq!(body["data"]["report"]["result"]["status"], "major_discrepancy");

        let edit = json!({ "path": "shop.total", "value": "8,00" }).to_string();
        let (status, body) = call(&app, "PATCH", &format!("/api/sessions/{}/fields", id), "alice", Body::from(edit)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["report"]["result"]["status"], "balanced");

        let (status, body) = call(&app, "POST", &format!("/api/sessions/{}/persist", id), "alice", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["receipt"]["shop"]["total"], 8.0);

        let (_, body) = call(&app, "GET", "/api/receipts", "alice", Body::empty()).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = call(&app, "POST", "/api/collect", "alice", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["items"], 3);
        assert!(body["data"]["workbook"].as_str().unwrap().ends_with("receipts.xlsx"));
        assert!(body["data"]["archive"].as_str().unwrap().ends_with("extractions.zip"));
        // original and edited image plus the record
        assert_eq!(body["data"]["archived_files"], 3);
    }

    #[tokio::test]
    async fn test_invalid_record_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let id = open_session(&app, "alice").await;
        call(&app, "POST", &format!("/api/sessions/{}/extract", id), "alice", Body::empty()).await;

        let edit = json!({ "path": "items[0].price", "value": "abc" }).to_string();
        let (_, body) = call(&app, "PATCH", &format!("/api/sessions/{}/fields", id), "alice", Body::from(edit)).await;
        assert_eq!(body["data"]["valid"], false);

        let (status, body) = call(&app, "POST", &format!("/api/sessions/{}/persist", id), "alice", Body::empty()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], false);
        assert_eq!(body["data"][0]["field"], "items[0].price");

        let (_, body) = call(&app, "GET", "/api/receipts", "alice", Body::empty()).await;
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_are_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let id = open_session(&app, "alice").await;

        let (status, _) = call(&app, "GET", &format!("/api/sessions/{}", id), "bob", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rejects_bad_upload() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let (status, _) = call(&app, "POST", "/api/sessions", "alice", Body::from("not an image")).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let (status, _) = call(&app, "POST", "/api/sessions?crop=0,0,100,100", "alice", Body::from(png())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_edit_before_extraction_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let id = open_session(&app, "alice").await;

        let edit = json!({ "path": "shop.name", "value": "Shop" }).to_string();
        let (status, _) = call(&app, "PATCH", &format!("/api/sessions/{}/fields", id), "alice", Body::from(edit)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_dropped_extraction_releases_session() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state_with(dir.path(), Arc::new(HangingExtractor)));
        let id = open_session(&app, "alice").await;

        let uri = format!("/api/sessions/{}/extract", id);
        let extraction = call(&app, "POST", &uri, "alice", Body::empty());
        assert!(tokio::time::timeout(Duration::from_millis(50), extraction).await.is_err());

        let (status, body) = call(&app, "GET", &format!("/api/sessions/{}", id), "alice", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["stage"], "extracting");
        assert_eq!(body["data"]["in_flight"], false);
        assert!(body["data"]["last_error"].as_str().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_persisted_session_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let app = router(state.clone());
        let id = open_session(&app, "alice").await;
        call(&app, "POST", &format!("/api/sessions/{}/extract", id), "alice", Body::empty()).await;

        // Bob cannot take alice's session out of the map
        let (status, _) = call(&app, "POST", &format!("/api/sessions/{}/persist", id), "bob", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(state.sessions.lock().unwrap().len(), 1);

        let (status, _) = call(&app, "POST", &format!("/api/sessions/{}/persist", id), "alice", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.sessions.lock().unwrap().is_empty());

        let (status, _) = call(&app, "GET", &format!("/api/sessions/{}", id), "alice", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_session() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let app = router(state.clone());
        let id = open_session(&app, "alice").await;

        // Still extracting, so persisting is refused
        let (status, _) = call(&app, "POST", &format!("/api/sessions/{}/persist", id), "alice", Body::empty()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, "GET", &format!("/api/sessions/{}", id), "alice", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn test_sweep_drops_idle_sessions() {
        let upload = ImageUpload::new("r.png", png());
        let image = intake::normalize(&upload, &Adjustments::default(), &Settings::default().intake_options()).unwrap();

        let mut busy = ReviewSession::new("alice");
        busy.accept_image(image).unwrap();
        busy.begin_extraction(&Settings::default().extraction_options()).unwrap();

        let mut sessions = HashMap::new();
        sessions.insert("idle".to_string(), SessionEntry::new(ReviewSession::new("alice")));
        sessions.insert("busy".to_string(), SessionEntry::new(busy));

        assert_eq!(sweep_idle(&mut sessions, Instant::now()), 0);

        let later = Instant::now() + SESSION_TTL + Duration::from_secs(1);
        assert_eq!(sweep_idle(&mut sessions, later), 1);
        assert!(sessions.contains_key("busy"));
        assert!(!sessions.contains_key("idle"));
    }

    #[tokio::test]
    async fn test_store_opened_once_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let app = router(state.clone());

        call(&app, "GET", "/api/receipts", "alice", Body::empty()).await;
        call(&app, "GET", "/api/receipts", "alice", Body::empty()).await;
        call(&app, "GET", "/api/receipts", "bob", Body::empty()).await;
        assert_eq!(state.stores.lock().unwrap().len(), 2);

        let first = store_for(&state, "alice").unwrap();
        let second = store_for(&state, "alice").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
