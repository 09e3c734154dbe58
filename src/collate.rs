// 📊 Collation - Flatten persisted receipts into tables
// shops.csv: one row per receipt, items.csv: one row per line item
// receipts.xlsx: the same tables as two sheets
// extractions.zip: every extraction artifact of the user

use crate::names::NameRules;
use crate::store::ReceiptStore;
use anyhow::{bail, Context as AnyhowContext, Result};
use chrono::{NaiveDate, NaiveTime};
use rust_xlsxwriter::{Format, Workbook};
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const SHOPS_CSV: &str = "shops.csv";
pub const ITEMS_CSV: &str = "items.csv";
pub const WORKBOOK_FILE: &str = "receipts.xlsx";
pub const ARCHIVE_FILE: &str = "extractions.zip";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShopRow {
    pub receipt_uuid: String,
    pub name: String,
    /// Parsed date when the printed one is recognizable
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub date_str: String,
    pub time_str: String,
    pub total: f64,
    pub items_total: f64,
    pub difference: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemRow {
    pub receipt_uuid: String,
    pub name: String,
    pub normalized_name: String,
    pub price: f64,
    pub count: Option<i64>,
    pub mass: Option<f64>,
    pub tax: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Collation {
    pub shops: Vec<ShopRow>,
    pub items: Vec<ItemRow>,
}

impl Collation {
    pub fn is_empty(&self) -> bool {
        self.shops.is_empty()
    }
}

/// Build the collation tables from everything the user has persisted
pub fn collect(store: &ReceiptStore, rules: &NameRules) -> Result<Collation> {
    let mut collation = Collation::default();

    for stored in store.list()? {
        let receipt = &stored.receipt;
        let items_total = round_cents(receipt.items_total());

        collation.shops.push(ShopRow {
            receipt_uuid: stored.receipt_uuid.clone(),
            name: receipt.shop.name.clone(),
            date: receipt.shop.date(),
            time: receipt.shop.time(),
            date_str: receipt.shop.date_str.clone(),
            time_str: receipt.shop.time_str.clone(),
            total: receipt.shop.total,
            items_total,
            difference: round_cents(items_total - receipt.shop.total),
        });

        for item in &receipt.items {
            // A rule's category only fills a gap, it never overrides the record
            let category = item
                .category
                .or_else(|| rules.suggest_category(&item.name))
                .map(|c| c.label().to_string());

            collation.items.push(ItemRow {
                receipt_uuid: stored.receipt_uuid.clone(),
                name: item.name.clone(),
                normalized_name: rules.normalize(&item.name),
                price: item.price,
                count: item.count,
                mass: item.mass,
                tax: item.tax.clone(),
                category,
            });
        }
    }

    Ok(collation)
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Write `shops.csv` and `items.csv` into `dir`, returning both paths
pub fn write_csv(collation: &Collation, dir: &Path) -> Result<(PathBuf, PathBuf)> {
    if collation.is_empty() {
        bail!("No persisted receipts to collate");
    }

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create collation directory: {}", dir.display()))?;

    let shops_path = dir.join(SHOPS_CSV);
    write_rows(&shops_path, &collation.shops)?;

    let items_path = dir.join(ITEMS_CSV);
    write_rows(&items_path, &collation.items)?;

    info!(
        shops = collation.shops.len(),
        items = collation.items.len(),
        dir = %dir.display(),
        "Collation written"
    );

    Ok((shops_path, items_path))
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;

    for row in rows {
        writer.serialize(row)?;
    }

    writer
        .flush()
        .with_context(|| format!("Failed to write CSV file: {}", path.display()))?;
    Ok(())
}

// ============================================================================
// WORKBOOK
// ============================================================================

enum Cell {
    Text(String),
    Number(f64),
    Money(f64),
    Blank,
}

impl Cell {
    fn text(value: Option<impl ToString>) -> Self {
        value.map(|v| Cell::Text(v.to_string())).unwrap_or(Cell::Blank)
    }
}

/// One worksheet row, columns in CSV header order
trait SheetRow {
    const HEADERS: &'static [&'static str];
    fn cells(&self) -> Vec<Cell>;
}

impl SheetRow for ShopRow {
    const HEADERS: &'static [&'static str] = &[
        "receipt_uuid", "name", "date", "time", "date_str", "time_str", "total", "items_total", "difference",
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Text(self.receipt_uuid.clone()),
            Cell::Text(self.name.clone()),
            Cell::text(self.date),
            Cell::text(self.time),
            Cell::Text(self.date_str.clone()),
            Cell::Text(self.time_str.clone()),
            Cell::Money(self.total),
            Cell::Money(self.items_total),
            Cell::Money(self.difference),
        ]
    }
}

impl SheetRow for ItemRow {
    const HEADERS: &'static [&'static str] = &[
        "receipt_uuid", "name", "normalized_name", "price", "count", "mass", "tax", "category",
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Text(self.receipt_uuid.clone()),
            Cell::Text(self.name.clone()),
            Cell::Text(self.normalized_name.clone()),
            Cell::Money(self.price),
            self.count.map(|c| Cell::Number(c as f64)).unwrap_or(Cell::Blank),
            self.mass.map(Cell::Number).unwrap_or(Cell::Blank),
            Cell::text(self.tax.as_deref()),
            Cell::text(self.category.as_deref()),
        ]
    }
}

/// Write the collation as a workbook with `Shops` and `Items` sheets
pub fn write_workbook(collation: &Collation, path: &Path) -> Result<PathBuf> {
    if collation.is_empty() {
        bail!("No persisted receipts to collate");
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create collation directory: {}", dir.display()))?;
    }

    let mut workbook = Workbook::new();
    write_sheet(&mut workbook, "Shops", &collation.shops)?;
    write_sheet(&mut workbook, "Items", &collation.items)?;
    workbook
        .save(path)
        .with_context(|| format!("Failed to write workbook: {}", path.display()))?;

    info!(path = %path.display(), "Workbook written");
    Ok(path.to_path_buf())
}

fn write_sheet<T: SheetRow>(workbook: &mut Workbook, name: &str, rows: &[T]) -> Result<()> {
    let bold = Format::new().set_bold();
    let money = Format::new().set_num_format("##0.00");

    let sheet = workbook.add_worksheet();
    sheet.set_name(name)?;

    for (col, header) in T::HEADERS.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *header, &bold)?;
    }
    for (index, row) in rows.iter().enumerate() {
        let line = index as u32 + 1;
        for (col, cell) in row.cells().into_iter().enumerate() {
            let col = col as u16;
            match cell {
                Cell::Text(text) => {
                    sheet.write_string(line, col, &text)?;
                }
                Cell::Number(number) => {
                    sheet.write_number(line, col, number)?;
                }
                Cell::Money(amount) => {
                    sheet.write_number_with_format(line, col, amount, &money)?;
                }
                Cell::Blank => {}
            }
        }
    }

    sheet.set_freeze_panes(1, 0)?;
    sheet.autofilter(0, 0, rows.len() as u32, (T::HEADERS.len() - 1) as u16)?;
    sheet.autofit();
    Ok(())
}

// ============================================================================
// ARCHIVE
// ============================================================================

/// Zip every file under `source` into `dest`, paths relative to `source`.
/// Returns the number of files archived.
pub fn write_archive(source: &Path, dest: &Path) -> Result<usize> {
    if !source.is_dir() {
        bail!("Extraction directory does not exist: {}", source.display());
    }
    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create collation directory: {}", dir.display()))?;
    }

    let file = File::create(dest).with_context(|| format!("Failed to create archive: {}", dest.display()))?;
    let mut archive = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut files = 0;
    add_dir(&mut archive, source, source, dest, options, &mut files)?;
    archive
        .finish()
        .with_context(|| format!("Failed to write archive: {}", dest.display()))?;

    info!(files, path = %dest.display(), "Archive written");
    Ok(files)
}

fn add_dir(
    archive: &mut ZipWriter<File>,
    root: &Path,
    dir: &Path,
    dest: &Path,
    options: SimpleFileOptions,
    files: &mut usize,
) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.path());

    for entry in entries {
        let path = entry.path();
        if path == dest {
            continue;
        }
        if path.is_dir() {
            add_dir(archive, root, &path, dest, options, files)?;
            continue;
        }

        archive.start_file(archive_name(root, &path)?, options)?;
        let mut input = File::open(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        std::io::copy(&mut input, archive)?;
        *files += 1;
    }
    Ok(())
}

/// Forward-slash path inside the archive
fn archive_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root)?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

// ============================================================================
// EXPORT
// ============================================================================

/// Everything `collect` writes for one user
#[derive(Debug, Clone, Serialize)]
pub struct Exports {
    pub shops_csv: PathBuf,
    pub items_csv: PathBuf,
    pub workbook: PathBuf,
    pub archive: PathBuf,
    pub archived_files: usize,
}

/// CSV tables, workbook and artifact archive into the collation directory
pub fn export(collation: &Collation, store: &ReceiptStore) -> Result<Exports> {
    let dir = store.collation_dir();
    let (shops_csv, items_csv) = write_csv(collation, dir)?;
    let workbook = write_workbook(collation, &dir.join(WORKBOOK_FILE))?;
    let archive = dir.join(ARCHIVE_FILE);
    let archived_files = write_archive(store.extraction_dir(), &archive)?;

    Ok(Exports {
        shops_csv,
        items_csv,
        workbook,
        archive,
        archived_files,
    })
}
