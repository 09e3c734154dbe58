// 🤖 Extraction Request - Image + schema → candidate receipt
// One outbound call per request, no retry/backoff

use crate::intake::NormalizedImage;
use crate::receipt::Receipt;
use crate::schema::{SchemaValidator, ValidationError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use thiserror::Error;

pub const EXTRACTION_PROMPT: &str =
    "What shop and items info is in this image of a supermarket receipt?";

/// Name of the single tool the model is forced to call
pub const RECEIPT_TOOL: &str = "record_receipt";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("image is empty, nothing to extract")]
    EmptyImage,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("extraction service returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("response contained no structured receipt")]
    NoStructuredOutput,
}

// ============================================================================
// REQUEST
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub model: String,
    pub max_tokens: u32,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        ExtractionOptions {
            model: "claude-3-haiku-20240307".to_string(),
            max_tokens: 1024,
        }
    }
}

/// Everything an extractor needs for one call, already encoded
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub model: String,
    pub max_tokens: u32,
    pub prompt: String,
    pub media_type: String,
    pub image_base64: String,
    pub schema: Value,
    pub tool_name: String,
}

impl ExtractionRequest {
    pub fn build(
        image: &NormalizedImage,
        schema: &Value,
        options: &ExtractionOptions,
    ) -> Result<Self, ExtractError> {
        if image.bytes.is_empty() {
            return Err(ExtractError::EmptyImage);
        }

        Ok(ExtractionRequest {
            model: options.model.clone(),
            max_tokens: options.max_tokens,
            prompt: EXTRACTION_PROMPT.to_string(),
            media_type: image.media_type.to_string(),
            image_base64: STANDARD.encode(&image.bytes),
            schema: schema.clone(),
            tool_name: RECEIPT_TOOL.to_string(),
        })
    }
}

// ============================================================================
// EXTRACTOR TRAIT
// ============================================================================

/// A structured-output model backend
#[async_trait]
pub trait ReceiptExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the raw candidate record; validation happens in `extract_receipt`
    async fn extract(&self, request: &ExtractionRequest) -> Result<Value, ExtractError>;
}

/// Replays a fixed candidate, e.g. a saved draft or a test fixture
pub struct CannedExtractor {
    name: String,
    candidate: Value,
}

impl CannedExtractor {
    pub fn new(name: impl Into<String>, candidate: Value) -> Self {
        Self {
            name: name.into(),
            candidate,
        }
    }
}

#[async_trait]
impl ReceiptExtractor for CannedExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, _request: &ExtractionRequest) -> Result<Value, ExtractError> {
        Ok(self.candidate.clone())
    }
}

// ============================================================================
// EXTRACTION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Conformant(Receipt),
    /// The model answered but its answer doesn't fit the schema
    Nonconformant {
        candidate: Value,
        errors: Vec<ValidationError>,
    },
}

impl Extraction {
    pub fn is_conformant(&self) -> bool {
        matches!(self, Extraction::Conformant(_))
    }
}

pub async fn extract_receipt(
    extractor: &dyn ReceiptExtractor,
    request: &ExtractionRequest,
    validator: &SchemaValidator,
) -> Result<(Value, Extraction), ExtractError> {
    tracing::info!(extractor = extractor.name(), model = %request.model, "requesting extraction");

    let candidate = extractor.extract(request).await?;

    let extraction = match validator.validate(&candidate) {
        Ok(receipt) => {
            tracing::info!(items = receipt.items.len(), "extraction conforms to schema");
            Extraction::Conformant(receipt)
        }
        Err(errors) => {
            tracing::warn!(errors = errors.len(), "extraction does not conform to schema");
            Extraction::Nonconformant {
                candidate: candidate.clone(),
                errors,
            }
        }
    };

    Ok((candidate, extraction))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::receipt_json_schema;
    use serde_json::json;

    fn image(bytes: Vec<u8>) -> NormalizedImage {
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

    fn request() -> ExtractionRequest {
        ExtractionRequest::build(&image(vec![0xFF, 0xD8, 0xFF]), &receipt_json_schema(), &ExtractionOptions::default())
            .unwrap()
    }

    #[test]
    fn test_build_request() {
        let req = request();

        assert_eq!(req.prompt, EXTRACTION_PROMPT);
        assert_eq!(req.media_type, "image/jpeg");
        assert_eq!(req.image_base64, "/9j/");
        assert_eq!(req.tool_name, RECEIPT_TOOL);
        assert_eq!(req.schema["required"], json!(["shop", "items"]));
    }

    #[test]
    fn test_build_rejects_empty_image() {
        let result = ExtractionRequest::build(&image(Vec::new()), &receipt_json_schema(), &ExtractionOptions::default());
        assert!(matches!(result, Err(ExtractError::EmptyImage)));
    }

    #[tokio::test]
    async fn test_extract_conformant() {
        let extractor = CannedExtractor::new(
            "canned",
            json!({
                "shop": { "name": "Lidl", "date_str": "2024-01-02", "time_str": "09:15", "total": 1.99 },
                "items": [{ "name": "Bananen", "price": 1.99 }]
            }),
        );

        let (_, extraction) = extract_receipt(&extractor, &request(), &SchemaValidator::new())
            .await
            .unwrap();

        match extraction {
            Extraction::Conformant(receipt) => assert_eq!(receipt.items[0].count, Some(1)),
            other => panic!("expected conformant extraction, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_extract_nonconformant_keeps_candidate() {
        let candidate = json!({ "shop": { "name": "Lidl" }, "items": [] });
        let extractor = CannedExtractor::new("canned", candidate.clone());

        let (raw, extraction) = extract_receipt(&extractor, &request(), &SchemaValidator::new())
            .await
            .unwrap();

        assert_eq!(raw, candidate);
        match extraction {
            Extraction::Nonconformant { candidate: kept, errors } => {
                assert_eq!(kept, candidate);
                assert_eq!(errors.len(), 3);
            }
            other => panic!("expected nonconformant extraction, got {:?}", other),
        }
    }
}
