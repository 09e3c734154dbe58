// Receipt Ledger - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod receipt;    // Typed record: Shop, Item, Category
pub mod schema;     // Field table, JSON schema, candidate validation
pub mod reconcile;  // Items-vs-total check and advisories
pub mod intake;     // Upload decoding, rotate/crop/resize
pub mod extract;    // Extraction request + extractor seam
pub mod anthropic;  // Messages API extractor
pub mod review;     // Review session state machine
pub mod store;      // Per-user artifacts + SQLite ledger
pub mod names;      // Item name normalization rules
pub mod collate;    // CSV/xlsx tables + artifact archive
pub mod config;     // app-config.toml + env overrides
pub mod logging;    // tracing subscriber setup

// Only compile the terminal review when the TUI feature is enabled
#[cfg(feature = "tui")]
pub mod tui;

// Re-export commonly used types
pub use receipt::{Category, Item, Receipt, Shop};
pub use schema::{receipt_json_schema, SchemaValidator, ValidationError, ValidationResult};
pub use reconcile::{Advisory, ReconciliationEngine, ReconciliationReport, ReconciliationResult};
pub use intake::{normalize, Adjustments, CropBox, ImageUpload, IntakeError, IntakeOptions, NormalizedImage};
pub use extract::{
    extract_receipt, CannedExtractor, ExtractError, Extraction, ExtractionOptions,
    ExtractionRequest, ReceiptExtractor,
};
pub use anthropic::AnthropicClient;
pub use review::{run_extraction, FieldPath, ReviewSession, SessionError, SessionView, Stage, Verdict};
pub use store::{Draft, Event, ReceiptStore, StoredReceipt};
pub use names::{NameRule, NameRules};
pub use collate::{collect, export, write_csv, Collation, Exports};
pub use config::{ConfigError, Settings};
pub use logging::{init_logging, ConsoleOutput};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
