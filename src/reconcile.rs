// ⚖️ Reconciliation Engine - Check receipt totals against line items
// Advisory only: nothing computed here ever blocks persistence.
//
//   sum(price × count) ≈ shop.total

use crate::receipt::Receipt;
use serde::{Deserialize, Serialize};

// ============================================================================
// TOTAL CHECK
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconciliationResult {
    /// Items add up to the printed total
    Balanced { items_total: f64, shop_total: f64 },

    /// Off by less than the major threshold (rounding, a missed deposit line)
    MinorDiscrepancy {
        items_total: f64,
        shop_total: f64,
        difference: f64,
        tolerance: f64,
    },

    /// Off by at least the major threshold, most likely a misread line
    MajorDiscrepancy {
        items_total: f64,
        shop_total: f64,
        difference: f64,
    },
}

impl ReconciliationResult {
    pub fn is_balanced(&self) -> bool {
        matches!(self, ReconciliationResult::Balanced { .. })
    }

    pub fn has_discrepancy(&self) -> bool {
        !self.is_balanced()
    }

    pub fn is_major(&self) -> bool {
        matches!(self, ReconciliationResult::MajorDiscrepancy { .. })
    }

    /// Absolute difference between item sum and printed total
    pub fn difference(&self) -> f64 {
        match self {
            ReconciliationResult::Balanced { .. } => 0.0,
            ReconciliationResult::MinorDiscrepancy { difference, .. } => *difference,
            ReconciliationResult::MajorDiscrepancy { difference, .. } => *difference,
        }
    }
}

// ============================================================================
// ADVISORIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvisoryKind {
    TotalMismatch,
    CountAndMass,
    NoQuantity,
    NonPositivePrice,
    NonPositiveQuantity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advisory {
    pub kind: AdvisoryKind,
    pub severity: Severity,
    /// Field path the advisory points at (`shop.total`, `items[1].mass`)
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub result: ReconciliationResult,
    pub item_count: usize,
    pub items_total: f64,
    pub shop_total: f64,
    pub advisories: Vec<Advisory>,
}

impl ReconciliationReport {
    pub fn is_balanced(&self) -> bool {
        self.result.is_balanced()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} items sum to {:.2}, receipt total {:.2}, difference {:.2}",
            self.item_count,
            self.items_total,
            self.shop_total,
            self.result.difference()
        )
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ReconciliationEngine {
    /// Differences below this count as balanced (default: 0.01)
    pub tolerance: f64,

    /// Threshold for minor vs major discrepancy (default: 1.00)
    pub major_discrepancy_threshold: f64,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine {
            tolerance: 0.01,
            major_discrepancy_threshold: 1.0,
        }
    }

    pub fn with_thresholds(tolerance: f64, major_threshold: f64) -> Self {
        ReconciliationEngine {
            tolerance,
            major_discrepancy_threshold: major_threshold,
        }
    }

    pub fn reconcile(&self, receipt: &Receipt) -> ReconciliationReport {
        let items_total = receipt.items_total();
        let shop_total = receipt.shop.total;
        let result = self.check_total(items_total, shop_total);

        let mut advisories = Vec::new();
        if result.has_discrepancy() {
            advisories.push(Advisory {
                kind: AdvisoryKind::TotalMismatch,
                severity: if result.is_major() {
                    Severity::Warning
                } else {
                    Severity::Info
                },
                field: "shop.total".to_string(),
                message: format!(
                    "items sum to {:.2} but the receipt total is {:.2}",
                    items_total, shop_total
                ),
            });
        }
        advisories.extend(self.item_advisories(receipt));

        ReconciliationReport {
            result,
            item_count: receipt.items.len(),
            items_total,
            shop_total,
            advisories,
        }
    }

    /// Compare an item sum against the printed total
    pub fn check_total(&self, items_total: f64, shop_total: f64) -> ReconciliationResult {
        let difference = (items_total - shop_total).abs();

        if difference < self.tolerance {
            ReconciliationResult::Balanced {
                items_total,
                shop_total,
            }
        } else if difference < self.major_discrepancy_threshold {
            ReconciliationResult::MinorDiscrepancy {
                items_total,
                shop_total,
                difference,
                tolerance: self.tolerance,
            }
        } else {
            ReconciliationResult::MajorDiscrepancy {
                items_total,
                shop_total,
                difference,
            }
        }
    }

    fn item_advisories(&self, receipt: &Receipt) -> Vec<Advisory> {
        let mut advisories = Vec::new();

        for (index, item) in receipt.items.iter().enumerate() {
            let path = |field: &str| format!("items[{}].{}", index, field);

            match (item.count, item.mass) {
                (Some(_), Some(_)) => advisories.push(Advisory {
                    kind: AdvisoryKind::CountAndMass,
                    severity: Severity::Info,
                    field: path("mass"),
                    message: format!("\"{}\" has both a count and a mass", item.name),
                }),
                (None, None) => advisories.push(Advisory {
                    kind: AdvisoryKind::NoQuantity,
                    severity: Severity::Info,
                    field: path("count"),
                    message: format!("\"{}\" has neither a count nor a mass", item.name),
                }),
                _ => {}
            }

            if item.price <= 0.0 {
                advisories.push(Advisory {
                    kind: AdvisoryKind::NonPositivePrice,
                    severity: Severity::Warning,
                    field: path("price"),
                    message: format!("price {:.2} is not positive", item.price),
                });
            }

            if let Some(count) = item.count.filter(|c| *c <= 0) {
                advisories.push(Advisory {
                    kind: AdvisoryKind::NonPositiveQuantity,
                    severity: Severity::Warning,
                    field: path("count"),
                    message: format!("count {} is not positive", count),
                });
            }

            if let Some(mass) = item.mass.filter(|m| *m <= 0.0) {
                advisories.push(Advisory {
                    kind: AdvisoryKind::NonPositiveQuantity,
                    severity: Severity::Warning,
                    field: path("mass"),
                    message: format!("mass {} is not positive", mass),
                });
            }
        }

        advisories
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
