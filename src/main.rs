// 🧾 Receipt Ledger - Command line
// process → (review) → persist, plus validate/list/collect/schema helpers

use anyhow::{bail, Context as AnyhowContext, Result};
use clap::{Parser, Subcommand};
use receipt_ledger::config::Settings;
use receipt_ledger::intake::{self, Adjustments, CropBox, ImageUpload};
use receipt_ledger::logging::{init_logging, ConsoleOutput};
use receipt_ledger::review::{run_extraction, ReviewSession, Verdict};
use receipt_ledger::schema::{receipt_json_schema, SchemaValidator};
use receipt_ledger::{collate, AnthropicClient, CannedExtractor, NameRules, ReceiptExtractor, ReceiptStore};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "receipt-ledger", version, about = "Turn receipt photos into reviewed, structured records")]
struct Cli {
    /// Config file (defaults to ./app-config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// User whose storage area is used
    #[arg(long, short, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract a receipt photo, review it and save it
    Process {
        image: PathBuf,

        /// Clockwise rotation in degrees (multiple of 90)
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        rotate: i32,

        /// Crop box as x,y,width,height (applied after rotation)
        #[arg(long)]
        crop: Option<String>,

        /// Skip interactive review: save when valid, keep a draft otherwise
        #[arg(long)]
        no_review: bool,

        /// Use a saved candidate JSON instead of calling the extraction service
        #[arg(long)]
        candidate: Option<PathBuf>,
    },

    /// Resume review of a saved draft
    Review { draft: PathBuf },

    /// Validate a receipt JSON file and check its total
    Validate { file: PathBuf },

    /// List persisted receipts
    List,

    /// Write the CSV tables, the workbook and the artifact archive
    Collect,

    /// Print the receipt JSON schema sent to the extraction service
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    // The review screen owns the terminal; logs go to file only
    let interactive = cfg!(feature = "tui")
        && matches!(
            cli.command,
            Command::Process { no_review: false, .. } | Command::Review { .. }
        );
    let console = if interactive {
        ConsoleOutput::Off
    } else {
        ConsoleOutput::Stderr
    };
    init_logging(&settings.logging.level, settings.logging.directory.as_deref(), console)?;

    match cli.command {
        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(&receipt_json_schema())?);
        }
        Command::Validate { file } => run_validate(&settings, &file)?,
        Command::List => {
            let store = open_store(&settings, cli.user.as_deref())?;
            run_list(&store)?;
        }
        Command::Collect => {
            let store = open_store(&settings, cli.user.as_deref())?;
            run_collect(&settings, &store)?;
        }
        Command::Process {
            image,
            rotate,
            crop,
            no_review,
            candidate,
        } => {
            let store = open_store(&settings, cli.user.as_deref())?;
            let adjustments = Adjustments {
                rotation_degrees: rotate,
                crop: match crop {
                    Some(raw) => Some(
                        CropBox::parse(&raw)
                            .with_context(|| format!("Invalid crop box '{}', expected x,y,width,height", raw))?,
                    ),
                    None => None,
                },
            };
            let session = run_process(&settings, &store, &image, &adjustments, candidate.as_deref()).await?;
            finish(&store, session, no_review)?;
        }
        Command::Review { draft } => {
            let store = open_store(&settings, cli.user.as_deref())?;
            let (draft, image) = ReceiptStore::load_draft(&draft)?;
            let session = ReviewSession::from_draft(store.username(), draft.candidate, image)
                .with_engine(settings.reconciliation_engine());
            finish(&store, session, false)?;
        }
    }

    Ok(())
}

fn open_store(settings: &Settings, user: Option<&str>) -> Result<ReceiptStore> {
    let user = settings.resolve_user(user)?;
    ReceiptStore::open(&settings.data, &user)
}

// ============================================================================
// PROCESS
// ============================================================================

async fn run_process(
    settings: &Settings,
    store: &ReceiptStore,
    path: &Path,
    adjustments: &Adjustments,
    candidate: Option<&Path>,
) -> Result<ReviewSession> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read image: {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "receipt".to_string());

    // Bad uploads stop here, before any network call
    let image = intake::normalize(&ImageUpload::new(file_name, bytes), adjustments, &settings.intake_options())?;
    println!("📷 {} → {}x{} ({})", image.source_name, image.width, image.height, &image.original_sha256[..12]);

    let earlier = store.records_for_image(&image.original_sha256)?;
    if !earlier.is_empty() {
        tracing::warn!(sha256 = %image.original_sha256, count = earlier.len(), "image already processed");
        println!("⚠️  This image was already saved {} time(s)", earlier.len());
    }

    let extractor: Box<dyn ReceiptExtractor> = match candidate {
        Some(file) => {
            let raw = fs::read_to_string(file)
                .with_context(|| format!("Failed to read candidate: {}", file.display()))?;
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse candidate: {}", file.display()))?;
            Box::new(CannedExtractor::new("replay", value))
        }
        None => {
            let mut client = AnthropicClient::new(settings.anthropic_key()?);
            if let Some(base_url) = &settings.services.anthropic.base_url {
                client = client.with_base_url(base_url.clone());
            }
            if !client.is_reachable().await {
                tracing::warn!("extraction service status page unreachable");
            }
            Box::new(client)
        }
    };

    let mut session = ReviewSession::new(store.username()).with_engine(settings.reconciliation_engine());
    session.accept_image(image)?;

    println!("🤖 Extracting with {}...", extractor.name());
    let extraction = run_extraction(&mut session, extractor.as_ref(), &settings.extraction_options()).await;
    if let Err(e) = extraction {
        // Keep the normalized image so the receipt can be entered by hand
        keep_draft(store, &session)?;
        bail!("Extraction failed: {}", e);
    }

    Ok(session)
}

/// Review (unless skipped), then persist a valid record or keep a draft
fn finish(store: &ReceiptStore, mut session: ReviewSession, no_review: bool) -> Result<()> {
    print_verdict(&session);

    #[cfg(feature = "tui")]
    {
        use receipt_ledger::tui::{run_review, Outcome};
        if !no_review {
            return match run_review(session, store)? {
                Outcome::Persisted(stored) => {
                    println!("✅ Saved receipt {} → {}", stored.receipt_uuid, stored.record_path().display());
                    Ok(())
                }
                Outcome::Abandoned(session) => keep_draft(store, &session),
            };
        }
    }
    #[cfg(not(feature = "tui"))]
    let _ = no_review;

    if session.verdict().map(Verdict::is_valid).unwrap_or(false) {
        let stored = session.persist(store)?;
        println!("✅ Saved receipt {} → {}", stored.receipt_uuid, stored.record_path().display());
        Ok(())
    } else {
        keep_draft(store, &session)
    }
}

fn keep_draft(store: &ReceiptStore, session: &ReviewSession) -> Result<()> {
    let path = store.save_draft(session.draft(), session.image())?;
    println!("📝 Not saved. Draft kept at {}", path.display());
    println!("   Resume with: receipt-ledger review {}", path.display());
    Ok(())
}

fn print_verdict(session: &ReviewSession) {
    match session.verdict() {
        Some(Verdict::Valid(receipt)) => {
            println!("✓ Valid: {} ({} items)", receipt.shop.name, receipt.items.len());
        }
        Some(Verdict::Invalid(errors)) => {
            println!("✗ {} validation problem(s):", errors.len());
            for error in errors {
                println!("   {}", error);
            }
        }
        None => {}
    }
    if let Some(report) = session.report() {
        println!("{}", report.summary());
        for advisory in &report.advisories {
            println!("   ⚠️  {}", advisory);
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn run_validate(settings: &Settings, file: &Path) -> Result<()> {
    let raw = fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let candidate: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", file.display()))?;

    match SchemaValidator::new().validate(&candidate) {
        Ok(receipt) => {
            println!("✓ {} conforms to the receipt schema", file.display());
            let report = settings.reconciliation_engine().reconcile(&receipt);
            println!("{}", report.summary());
            for advisory in &report.advisories {
                println!("   ⚠️  {}", advisory);
            }
            Ok(())
        }
        Err(errors) => {
            eprintln!("❌ {} has {} validation problem(s):", file.display(), errors.len());
            for error in &errors {
                eprintln!("   {}", error);
            }
            std::process::exit(1);
        }
    }
}

fn run_list(store: &ReceiptStore) -> Result<()> {
    let receipts = store.list()?;
    if receipts.is_empty() {
        println!("No receipts saved for {}", store.username());
        return Ok(());
    }

    println!("{:<36}  {:<10}  {:<24}  {:>8}  {:>5}", "ID", "DATE", "SHOP", "TOTAL", "ITEMS");
    for stored in &receipts {
        let shop = &stored.receipt.shop;
        println!(
            "{:<36}  {:<10}  {:<24}  {:>8.2}  {:>5}",
            stored.receipt_uuid,
            shop.date_str,
            shop.name.chars().take(24).collect::<String>(),
            shop.total,
            stored.receipt.items.len()
        );
    }
    println!("\n{} receipt(s), {} item(s)", receipts.len(), store.item_count()?);
    Ok(())
}

fn run_collect(settings: &Settings, store: &ReceiptStore) -> Result<()> {
    let rules = match &settings.review.names_file {
        Some(path) => NameRules::load_from_file(path)?,
        None => NameRules::defaults(),
    };

    let collation = collate::collect(store, &rules)?;
    let exports = collate::export(&collation, store)?;

    println!("📊 {} receipt(s) → {}", collation.shops.len(), exports.shops_csv.display());
    println!("📊 {} item(s) → {}", collation.items.len(), exports.items_csv.display());
    println!("📗 Workbook → {}", exports.workbook.display());
    println!("🗜️  {} artifact file(s) → {}", exports.archived_files, exports.archive.display());
    Ok(())
}
