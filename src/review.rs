// 🔍 Review Session - Human-in-the-loop correction of extracted receipts
//
//   awaiting-upload → extracting → reviewing (valid | invalid) → persisted
//
// Every edit re-validates. Only a schema-valid record can be persisted;
// reconciliation advisories are shown but never block.

use crate::extract::{extract_receipt, ExtractError, Extraction, ExtractionOptions, ExtractionRequest, ReceiptExtractor};
use crate::intake::NormalizedImage;
use crate::receipt::{Category, Receipt};
use crate::reconcile::{ReconciliationEngine, ReconciliationReport};
use crate::schema::{field_spec, parse_integer, parse_number, FieldKind, Section, SchemaValidator, ValidationError};
use crate::store::{ReceiptStore, StoredReceipt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {action} while {stage}")]
    WrongStage { action: &'static str, stage: Stage },

    #[error("an extraction is already in flight")]
    Busy,

    #[error("no image has been uploaded")]
    NoImage,

    #[error("invalid field path: {0}")]
    InvalidPath(String),

    #[error("no item at index {0}")]
    ItemOutOfRange(usize),

    #[error("record is not schema-valid ({} problems)", .0.len())]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

// ============================================================================
// STAGE & VERDICT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AwaitingUpload,
    Extracting,
    Reviewing,
    Persisted,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::AwaitingUpload => "awaiting upload",
            Stage::Extracting => "extracting",
            Stage::Reviewing => "reviewing",
            Stage::Persisted => "persisted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Valid(Receipt),
    Invalid(Vec<ValidationError>),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid(_))
    }

    pub fn errors(&self) -> &[ValidationError] {
        match self {
            Verdict::Valid(_) => &[],
            Verdict::Invalid(errors) => errors,
        }
    }
}

// ============================================================================
// FIELD PATHS
// ============================================================================

/// `shop.<field>` or `items[<index>].<field>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPath {
    Shop(String),
    Item(usize, String),
}

impl FieldPath {
    pub fn parse(raw: &str) -> Option<FieldPath> {
        let raw = raw.trim();

        if let Some(field) = raw.strip_prefix("shop.") {
            return field_spec(Section::Shop, field).map(|_| FieldPath::Shop(field.to_string()));
        }

        let rest = raw.strip_prefix("items[")?;
        let (index, field) = rest.split_once("].")?;
        let index = index.parse::<usize>().ok()?;
        field_spec(Section::Item, field).map(|_| FieldPath::Item(index, field.to_string()))
    }

    fn section(&self) -> Section {
        match self {
            FieldPath::Shop(_) => Section::Shop,
            FieldPath::Item(..) => Section::Item,
        }
    }

    fn field(&self) -> &str {
        match self {
            FieldPath::Shop(field) | FieldPath::Item(_, field) => field,
        }
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldPath::Shop(field) => write!(f, "shop.{}", field),
            FieldPath::Item(index, field) => write!(f, "items[{}].{}", index, field),
        }
    }
}

/// Turn user text into a draft value for the field.
///
/// Blank input clears optional fields. Input that doesn't parse is kept as
/// text so the verdict points at it instead of the edit being dropped.
fn draft_value(section: Section, field: &str, text: &str) -> Value {
    let spec = match field_spec(section, field) {
        Some(spec) => spec,
        None => return Value::String(text.to_string()),
    };
    let trimmed = text.trim();

    if trimmed.is_empty() {
        return if spec.required {
            Value::String(String::new())
        } else {
            Value::Null
        };
    }

    match spec.kind {
        FieldKind::Text => Value::String(text.to_string()),
        FieldKind::Number => parse_number(trimmed)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        FieldKind::Integer => parse_integer(trimmed)
            .map(|n| json!(n))
            .unwrap_or_else(|| Value::String(text.to_string())),
        FieldKind::Category => Category::from_label(trimmed)
            .map(|c| json!(c.label()))
            .unwrap_or_else(|| Value::String(text.to_string())),
    }
}

/// Replace a non-object with an empty object
fn ensure_object(value: &mut Value) -> Option<&mut Map<String, Value>> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut()
}

fn ensure_array(value: &mut Value) -> Option<&mut Vec<Value>> {
    if !value.is_array() {
        *value = Value::Array(Vec::new());
    }
    value.as_array_mut()
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn blank_item() -> Value {
    json!({
        "name": "",
        "price": null,
        "count": 1,
        "mass": null,
        "tax": null,
        "category": null,
    })
}

// ============================================================================
// SESSION VIEW
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub source_name: String,
    pub sha256: String,
    pub width: u32,
    pub height: u32,
}

/// Snapshot of a session for display surfaces
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: String,
    pub username: String,
    pub stage: Stage,
    pub image: Option<ImageInfo>,
    pub draft: Value,
    pub valid: Option<bool>,
    pub errors: Vec<ValidationError>,
    pub report: Option<ReconciliationReport>,
    pub last_error: Option<String>,
    pub in_flight: bool,
    pub persisted_id: Option<String>,
}

// ============================================================================
// REVIEW SESSION
// ============================================================================

pub struct ReviewSession {
    id: String,
    username: String,
    stage: Stage,
    image: Option<NormalizedImage>,
    draft: Value,
    verdict: Option<Verdict>,
    report: Option<ReconciliationReport>,
    last_error: Option<String>,
    in_flight: bool,
    persisted: Option<StoredReceipt>,
    validator: SchemaValidator,
    engine: ReconciliationEngine,
}

impl ReviewSession {
    pub fn new(username: &str) -> Self {
        ReviewSession {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            stage: Stage::AwaitingUpload,
            image: None,
            draft: Value::Null,
            verdict: None,
            report: None,
            last_error: None,
            in_flight: false,
            persisted: None,
            validator: SchemaValidator::new(),
            engine: ReconciliationEngine::new(),
        }
    }

    pub fn with_engine(mut self, engine: ReconciliationEngine) -> Self {
        self.engine = engine;
        self.refresh_report();
        self
    }

    /// Resume review of a saved candidate
    pub fn from_draft(username: &str, candidate: Value, image: Option<NormalizedImage>) -> Self {
        let mut session = ReviewSession::new(username);
        session.image = image;
        session.draft = candidate;
        session.stage = Stage::Reviewing;
        session.revalidate();
        session
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn image(&self) -> Option<&NormalizedImage> {
        self.image.as_ref()
    }

    pub fn draft(&self) -> &Value {
        &self.draft
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        self.verdict.as_ref()
    }

    pub fn report(&self) -> Option<&ReconciliationReport> {
        self.report.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn persisted(&self) -> Option<&StoredReceipt> {
        self.persisted.as_ref()
    }

    pub fn item_count(&self) -> usize {
        self.draft["items"].as_array().map(Vec::len).unwrap_or(0)
    }

    fn require(&self, action: &'static str, stage: Stage) -> Result<(), SessionError> {
        if self.stage == stage {
            Ok(())
        } else {
            Err(SessionError::WrongStage {
                action,
                stage: self.stage,
            })
        }
    }

    // ------------------------------------------------------------------------
    // Upload & extraction
    // ------------------------------------------------------------------------

    /// Take a normalized image. Allowed before extraction starts and after a
    /// failed attempt, so a bad photo can be replaced.
    pub fn accept_image(&mut self, image: NormalizedImage) -> Result<(), SessionError> {
        match self.stage {
            Stage::AwaitingUpload => {}
            Stage::Extracting if !self.in_flight => {}
            Stage::Extracting => return Err(SessionError::Busy),
            stage => {
                return Err(SessionError::WrongStage {
                    action: "accept an image",
                    stage,
                })
            }
        }

        tracing::debug!(session = %self.id, sha256 = %image.original_sha256, "image accepted");
        self.image = Some(image);
        self.last_error = None;
        self.stage = Stage::Extracting;
        Ok(())
    }

    /// Build the request for the one in-flight extraction
    pub fn begin_extraction(&mut self, options: &ExtractionOptions) -> Result<ExtractionRequest, SessionError> {
        self.require("start an extraction", Stage::Extracting)?;
        if self.in_flight {
            return Err(SessionError::Busy);
        }
        let image = self.image.as_ref().ok_or(SessionError::NoImage)?;

        let request = ExtractionRequest::build(image, self.validator.json_schema(), options)?;
        self.in_flight = true;
        self.last_error = None;
        Ok(request)
    }

    /// Take the model's candidate, whatever its shape, and start review
    pub fn apply_extraction(&mut self, candidate: Value) -> Result<&Verdict, SessionError> {
        self.require("apply an extraction", Stage::Extracting)?;

        self.in_flight = false;
        self.draft = candidate;
        self.stage = Stage::Reviewing;
        Ok(self.revalidate())
    }

    /// Extraction failed: stay in extracting with the error visible.
    /// The user retries by calling `begin_extraction` again.
    pub fn record_failure(&mut self, error: impl std::fmt::Display) {
        let message = error.to_string();
        tracing::warn!(session = %self.id, error = %message, "extraction failed");
        self.in_flight = false;
        self.last_error = Some(message);
    }

    /// Release an extraction whose caller went away before it finished.
    /// No-op once the outcome has been applied or recorded.
    pub fn abort_extraction(&mut self) {
        if !self.in_flight {
            return;
        }
        tracing::warn!(session = %self.id, "extraction abandoned before completion");
        self.in_flight = false;
        self.last_error = Some("extraction was cancelled before it finished".to_string());
    }

    // ------------------------------------------------------------------------
    // Editing
    // ------------------------------------------------------------------------

    fn items_mut(&mut self) -> Result<&mut Vec<Value>, SessionError> {
        let invalid = || SessionError::InvalidPath("items".to_string());
        let root = ensure_object(&mut self.draft).ok_or_else(invalid)?;
        ensure_array(root.entry("items").or_insert(Value::Null)).ok_or_else(invalid)
    }

    /// Set one field from user text, then re-validate
    pub fn edit(&mut self, path: &str, text: &str) -> Result<&Verdict, SessionError> {
        self.require("edit", Stage::Reviewing)?;
        let invalid = || SessionError::InvalidPath(path.to_string());
        let parsed = FieldPath::parse(path).ok_or_else(invalid)?;
        let value = draft_value(parsed.section(), parsed.field(), text);

        let slot = match &parsed {
            FieldPath::Shop(_) => {
                let root = ensure_object(&mut self.draft).ok_or_else(invalid)?;
                ensure_object(root.entry("shop").or_insert(Value::Null)).ok_or_else(invalid)?
            }
            FieldPath::Item(index, _) => {
                let item = self
                    .items_mut()?
                    .get_mut(*index)
                    .ok_or(SessionError::ItemOutOfRange(*index))?;
                ensure_object(item).ok_or_else(invalid)?
            }
        };
        slot.insert(parsed.field().to_string(), value);

        tracing::debug!(session = %self.id, path = %parsed, "field edited");
        Ok(self.revalidate())
    }

    /// Current draft text of a field, for pre-filling an editor
    pub fn draft_text(&self, path: &str) -> Option<String> {
        let value = match FieldPath::parse(path)? {
            FieldPath::Shop(field) => self.draft.get("shop").and_then(|s| s.get(&field)),
            FieldPath::Item(index, field) => self
                .draft
                .get("items")
                .and_then(|items| items.get(index))
                .and_then(|item| item.get(&field)),
        };
        Some(display_value(value))
    }

    /// Append an empty item; returns its index
    pub fn add_item(&mut self) -> Result<usize, SessionError> {
        self.require("add an item", Stage::Reviewing)?;
        let items = self.items_mut()?;
        items.push(blank_item());
        let index = items.len() - 1;
        self.revalidate();
        Ok(index)
    }

    pub fn remove_item(&mut self, index: usize) -> Result<(), SessionError> {
        self.require("remove an item", Stage::Reviewing)?;
        let items = self.items_mut()?;
        if index >= items.len() {
            return Err(SessionError::ItemOutOfRange(index));
        }
        items.remove(index);
        self.revalidate();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Validation & persistence
    // ------------------------------------------------------------------------

    /// Validate the draft as it stands. Pure with respect to the draft.
    pub fn revalidate(&mut self) -> &Verdict {
        let verdict = match self.validator.validate(&self.draft) {
            Ok(receipt) => Verdict::Valid(receipt),
            Err(errors) => Verdict::Invalid(errors),
        };
        self.report = match &verdict {
            Verdict::Valid(receipt) => Some(self.engine.reconcile(receipt)),
            Verdict::Invalid(_) => None,
        };
        self.verdict.insert(verdict)
    }

    fn refresh_report(&mut self) {
        self.report = match &self.verdict {
            Some(Verdict::Valid(receipt)) => Some(self.engine.reconcile(receipt)),
            _ => None,
        };
    }

    /// The record as it would be persisted; errors while invalid
    pub fn confirmed_receipt(&self) -> Result<Receipt, SessionError> {
        self.require("confirm", Stage::Reviewing)?;
        match &self.verdict {
            Some(Verdict::Valid(receipt)) => Ok(receipt.clone()),
            Some(Verdict::Invalid(errors)) => Err(SessionError::Invalid(errors.clone())),
            None => Err(SessionError::Invalid(Vec::new())),
        }
    }

    /// Persist the confirmed record. Terminal: the session can't change after.
    pub fn persist(&mut self, store: &ReceiptStore) -> Result<&StoredReceipt, SessionError> {
        let receipt = self.confirmed_receipt()?;
        if let Some(report) = &self.report {
            for advisory in &report.advisories {
                tracing::info!(session = %self.id, advisory = %advisory, "persisting with advisory");
            }
        }

        let stored = store.persist(&receipt, self.image.as_ref())?;
        self.stage = Stage::Persisted;
        Ok(self.persisted.insert(stored))
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            username: self.username.clone(),
            stage: self.stage,
            image: self.image.as_ref().map(|image| ImageInfo {
                source_name: image.source_name.clone(),
                sha256: image.original_sha256.clone(),
                width: image.width,
                height: image.height,
            }),
            draft: self.draft.clone(),
            valid: self.verdict.as_ref().map(Verdict::is_valid),
            errors: self
                .verdict
                .as_ref()
                .map(|v| v.errors().to_vec())
                .unwrap_or_default(),
            report: self.report.clone(),
            last_error: self.last_error.clone(),
            in_flight: self.in_flight,
            persisted_id: self.persisted.as_ref().map(|p| p.receipt_uuid.clone()),
        }
    }
}

/// Run one extraction to completion for a session the caller owns exclusively
pub async fn run_extraction(
    session: &mut ReviewSession,
    extractor: &dyn ReceiptExtractor,
    options: &ExtractionOptions,
) -> Result<Extraction, SessionError> {
    let request = session.begin_extraction(options)?;
    let mut guard = InFlight(session);

    let outcome = extract_receipt(extractor, &request, &guard.0.validator).await;
    match outcome {
        Ok((candidate, extraction)) => {
            guard.0.apply_extraction(candidate)?;
            Ok(extraction)
        }
        Err(e) => {
            guard.0.record_failure(&e);
            Err(e.into())
        }
    }
}

/// Clears the in-flight flag if the extraction future is dropped mid-call
struct InFlight<'a>(&'a mut ReviewSession);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.abort_extraction();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::CannedExtractor;
    use crate::reconcile::ReconciliationResult;
    use async_trait::async_trait;

    const SAMPLE: &str = include_str!("../fixtures/sample-receipt.json");

    fn sample_candidate() -> Value {
        serde_json::from_str(SAMPLE).unwrap()
    }

    fn image() -> NormalizedImage {
        let bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
        NormalizedImage {
            source_name: "receipt.jpg".to_string(),
            original: bytes.clone(),
            original_sha256: crate::intake::sha256_hex(&bytes),
            bytes,
            media_type: "image/jpeg",
            width: 1,
            height: 1,
        }
    }

    struct FailingExtractor;

    #[async_trait]
    impl ReceiptExtractor for FailingExtractor {
        fn name(&self) -> &str {
            "failing"
        }

        async fn extract(&self, _request: &ExtractionRequest) -> Result<Value, ExtractError> {
            Err(ExtractError::Api {
                status: 529,
                body: "overloaded".to_string(),
            })
        }
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

    #[test]
    fn test_field_path_parse() {
        assert_eq!(FieldPath::parse("shop.total"), Some(FieldPath::Shop("total".to_string())));
        assert_eq!(
            FieldPath::parse("items[12].price"),
            Some(FieldPath::Item(12, "price".to_string()))
        );
        assert_eq!(FieldPath::parse("shop.price"), None);
        assert_eq!(FieldPath::parse("items[x].price"), None);
        assert_eq!(FieldPath::parse("items[0]"), None);
        assert_eq!(FieldPath::parse("items[3].mass").unwrap().to_string(), "items[3].mass");
    }

    #[test]
    fn test_draft_value_conversion() {
        assert_eq!(draft_value(Section::Shop, "total", "12,50"), json!(12.5));
        assert_eq!(draft_value(Section::Shop, "total", "twelve"), json!("twelve"));
        assert_eq!(draft_value(Section::Item, "count", "3"), json!(3));
        assert_eq!(draft_value(Section::Item, "count", ""), Value::Null);
        assert_eq!(draft_value(Section::Item, "category", "dairy"), json!("Dairy"));
        assert_eq!(draft_value(Section::Item, "tax", "  "), Value::Null);
        assert_eq!(draft_value(Section::Shop, "name", " "), json!(""));
    }

    #[tokio::test]
    async fn test_sample_receipt_flags_total_mismatch() {
        let mut session = ReviewSession::new("alice");
        session.accept_image(image()).unwrap();

        let extractor = CannedExtractor::new("canned", sample_candidate());
        let extraction = run_extraction(&mut session, &extractor, &ExtractionOptions::default())
            .await
            .unwrap();

        assert!(extraction.is_conformant());
        assert_eq!(session.stage(), Stage::Reviewing);
        assert!(session.verdict().unwrap().is_valid());

        let report = session.report().unwrap();
        assert!((report.items_total - 8.0).abs() < 1e-9);
        assert_eq!(report.shop_total, 6.5);
        assert!(matches!(report.result, ReconciliationResult::MajorDiscrepancy { .. }));
        // Advisory only: the record can still be confirmed
        assert!(session.confirmed_receipt().is_ok());

        // Correcting the total balances the receipt
        session.edit("shop.total", "8.00").unwrap();
        assert!(session.report().unwrap().is_balanced());
    }

    #[tokio::test]
    async fn test_failure_stays_in_extracting_and_allows_retry() {
        let mut session = ReviewSession::new("alice");
        session.accept_image(image()).unwrap();

        let result = run_extraction(&mut session, &FailingExtractor, &ExtractionOptions::default()).await;
        assert!(matches!(result, Err(SessionError::Extract(ExtractError::Api { status: 529, .. }))));
        assert_eq!(session.stage(), Stage::Extracting);
        assert!(!session.is_in_flight());
        assert!(session.last_error().unwrap().contains("529"));

        let extractor = CannedExtractor::new("canned", sample_candidate());
        run_extraction(&mut session, &extractor, &ExtractionOptions::default())
            .await
            .unwrap();
        assert_eq!(session.stage(), Stage::Reviewing);
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn test_dropped_extraction_releases_session() {
        let mut session = ReviewSession::new("alice");
        session.accept_image(image()).unwrap();

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            run_extraction(&mut session, &HangingExtractor, &ExtractionOptions::default()),
        )
        .await;
        assert!(timed_out.is_err());

        assert_eq!(session.stage(), Stage::Extracting);
        assert!(!session.is_in_flight());
        assert!(session.last_error().unwrap().contains("cancelled"));

        // Both a retry and a replacement image are accepted again
        session.accept_image(image()).unwrap();
        let extractor = CannedExtractor::new("canned", sample_candidate());
        run_extraction(&mut session, &extractor, &ExtractionOptions::default())
            .await
            .unwrap();
        assert_eq!(session.stage(), Stage::Reviewing);
    }

    #[test]
    fn test_abort_is_noop_without_extraction() {
        let mut session = ReviewSession::new("alice");
        session.accept_image(image()).unwrap();
        session.abort_extraction();
        assert!(session.last_error().is_none());

        session.begin_extraction(&ExtractionOptions::default()).unwrap();
        session.abort_extraction();
        assert!(!session.is_in_flight());
        assert!(session.begin_extraction(&ExtractionOptions::default()).is_ok());
    }

    #[test]
    fn test_second_extraction_refused_while_in_flight() {
        let mut session = ReviewSession::new("alice");
        assert!(matches!(
            session.begin_extraction(&ExtractionOptions::default()),
            Err(SessionError::WrongStage { .. })
        ));

        session.accept_image(image()).unwrap();
        session.begin_extraction(&ExtractionOptions::default()).unwrap();

        assert!(matches!(
            session.begin_extraction(&ExtractionOptions::default()),
            Err(SessionError::Busy)
        ));
        assert!(matches!(session.accept_image(image()), Err(SessionError::Busy)));
    }

    #[test]
    fn test_invalid_extraction_is_editable() {
        let mut session = ReviewSession::new("alice");
        session.accept_image(image()).unwrap();
        session.begin_extraction(&ExtractionOptions::default()).unwrap();

        let mut candidate = sample_candidate();
        candidate["shop"]["total"] = json!("six fifty");
        candidate["items"][1]["price"] = Value::Null;

        let verdict = session.apply_extraction(candidate).unwrap();
        assert_eq!(verdict.errors().len(), 2);
        assert!(session.report().is_none());
        assert!(matches!(session.confirmed_receipt(), Err(SessionError::Invalid(_))));

        session.edit("shop.total", "6,50").unwrap();
        let verdict = session.edit("items[1].price", "2.00").unwrap();
        assert!(verdict.is_valid());
    }

    #[test]
    fn test_unparsable_edit_is_kept_verbatim() {
        let mut session = ReviewSession::from_draft("alice", sample_candidate(), None);

        let verdict = session.edit("items[0].count", "two").unwrap();
        assert_eq!(verdict.errors()[0].field, "items[0].count");
        assert_eq!(session.draft_text("items[0].count").unwrap(), "two");

        session.edit("items[0].count", "").unwrap();
        assert_eq!(session.draft()["items"][0]["count"], Value::Null);
        assert!(session.verdict().unwrap().is_valid());
    }

    #[test]
    fn test_revalidate_is_idempotent() {
        let mut session = ReviewSession::from_draft("alice", sample_candidate(), None);
        session.edit("shop.name", "").unwrap();

        let first = session.revalidate().clone();
        let second = session.revalidate().clone();
        assert_eq!(first, second);
        assert!(!first.is_valid());
    }

    #[test]
    fn test_add_and_remove_items() {
        let mut session = ReviewSession::from_draft("alice", sample_candidate(), None);
        assert_eq!(session.item_count(), 3);

        let index = session.add_item().unwrap();
        assert_eq!(index, 3);
        // A blank item needs a name and price before the record is valid
        assert!(!session.verdict().unwrap().is_valid());

        session.edit("items[3].name", "Eggs").unwrap();
        session.edit("items[3].price", "2.49").unwrap();
        assert!(session.verdict().unwrap().is_valid());

        session.remove_item(0).unwrap();
        assert_eq!(session.item_count(), 3);
        assert_eq!(session.draft_text("items[0].name").unwrap(), "Bread");
        assert!(matches!(session.remove_item(10), Err(SessionError::ItemOutOfRange(10))));
        assert!(matches!(
            session.edit("items[10].name", "x"),
            Err(SessionError::ItemOutOfRange(10))
        ));
        assert!(matches!(session.edit("shop.colour", "x"), Err(SessionError::InvalidPath(_))));
    }

    #[test]
    fn test_edit_builds_structure_for_non_object_candidate() {
        let mut session = ReviewSession::from_draft("alice", json!("the model rambled"), None);
        assert!(!session.verdict().unwrap().is_valid());

        for (path, text) in [
            ("shop.name", "Aldi"),
            ("shop.date_str", "2024-02-02"),
            ("shop.time_str", "18:00"),
            ("shop.total", "1.00"),
        ] {
            session.edit(path, text).unwrap();
        }
        let index = session.add_item().unwrap();
        session.edit(&format!("items[{}].name", index), "Brot").unwrap();
        let verdict = session.edit(&format!("items[{}].price", index), "1").unwrap();

        assert!(verdict.is_valid());
    }

    #[test]
    fn test_cannot_persist_while_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceiptStore::open_in(dir.path(), "alice").unwrap();

        let mut session = ReviewSession::from_draft("alice", sample_candidate(), Some(image()));
        session.edit("items[2].price", "").unwrap();

        assert!(matches!(session.persist(&store), Err(SessionError::Invalid(_))));
        assert_eq!(session.stage(), Stage::Reviewing);
        assert_eq!(store.count().unwrap(), 0);

        session.edit("items[2].price", "1.50").unwrap();
        let stored = session.persist(&store).unwrap().clone();
        assert_eq!(session.stage(), Stage::Persisted);
        assert_eq!(session.view().persisted_id, Some(stored.receipt_uuid.clone()));
        assert_eq!(store.count().unwrap(), 1);

        // Terminal
        assert!(matches!(session.edit("shop.name", "x"), Err(SessionError::WrongStage { .. })));
        assert!(matches!(session.persist(&store), Err(SessionError::WrongStage { .. })));
    }

    #[test]
    fn test_view_serializes() {
        let session = ReviewSession::from_draft("alice", sample_candidate(), Some(image()));
        let view = serde_json::to_value(session.view()).unwrap();

        assert_eq!(view["stage"], "reviewing");
        assert_eq!(view["valid"], true);
        assert_eq!(view["image"]["source_name"], "receipt.jpg");
        assert_eq!(view["report"]["result"]["status"], "major_discrepancy");
    }
}
