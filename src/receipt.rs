// 🧾 Receipt Model - Shop, Items, Categories
// The typed record that survives schema validation and gets persisted

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

// ============================================================================
// SHOP
// ============================================================================

/// Shop metadata printed at the top and bottom of a receipt.
///
/// Date and time stay textual: receipts print them in whatever format the
/// chain likes, and the record keeps exactly what was read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shop {
    pub name: String,
    pub date_str: String,
    pub time_str: String,
    /// Total amount of the purchase
    pub total: f64,
}

impl Shop {
    /// Best-effort date: `YYYY-MM-DD` or `DD.MM.YYYY`
    pub fn date(&self) -> Option<NaiveDate> {
        let raw = self.date_str.trim();
        ["%Y-%m-%d", "%d.%m.%Y"]
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
    }

    /// Best-effort time: `HH:MM` or `HH:MM:SS`
    pub fn time(&self) -> Option<NaiveTime> {
        let raw = self.time_str.trim();
        ["%H:%M:%S", "%H:%M"]
            .iter()
            .find_map(|fmt| NaiveTime::parse_from_str(raw, fmt).ok())
    }
}

// ============================================================================
// CATEGORY
// ============================================================================

/// Grocery list categories an item can be filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Fruits")]
    Fruits,
    #[serde(rename = "Vegetables")]
    Vegetables,
    #[serde(rename = "Canned goods")]
    CannedGoods,
    #[serde(rename = "Dairy")]
    Dairy,
    #[serde(rename = "Meat")]
    Meat,
    #[serde(rename = "Fish and seafood")]
    Seafood,
    #[serde(rename = "Deli")]
    Deli,
    #[serde(rename = "Spices")]
    Spices,
    #[serde(rename = "Snacks")]
    Snacks,
    #[serde(rename = "Bread and baked goods")]
    BakedGoods,
    #[serde(rename = "Beverages")]
    Beverages,
    #[serde(rename = "Pasta, rice and cereal")]
    PastaRiceCereal,
    #[serde(rename = "Frozen food")]
    FrozenFood,
    #[serde(rename = "Personal care")]
    PersonalCare,
    #[serde(rename = "Health care")]
    HealthCare,
    #[serde(rename = "Household supplies")]
    Household,
    #[serde(rename = "Baby care items")]
    Baby,
    #[serde(rename = "Pet care items")]
    Pet,
}

impl Category {
    pub const ALL: [Category; 18] = [
        Category::Fruits,
        Category::Vegetables,
        Category::CannedGoods,
        Category::Dairy,
        Category::Meat,
        Category::Seafood,
        Category::Deli,
        Category::Spices,
        Category::Snacks,
        Category::BakedGoods,
        Category::Beverages,
        Category::PastaRiceCereal,
        Category::FrozenFood,
        Category::PersonalCare,
        Category::HealthCare,
        Category::Household,
        Category::Baby,
        Category::Pet,
    ];

    /// Display label, also the serialized form
    pub fn label(&self) -> &'static str {
        match self {
            Category::Fruits => "Fruits",
            Category::Vegetables => "Vegetables",
            Category::CannedGoods => "Canned goods",
            Category::Dairy => "Dairy",
            Category::Meat => "Meat",
            Category::Seafood => "Fish and seafood",
            Category::Deli => "Deli",
            Category::Spices => "Spices",
            Category::Snacks => "Snacks",
            Category::BakedGoods => "Bread and baked goods",
            Category::Beverages => "Beverages",
            Category::PastaRiceCereal => "Pasta, rice and cereal",
            Category::FrozenFood => "Frozen food",
            Category::PersonalCare => "Personal care",
            Category::HealthCare => "Health care",
            Category::Household => "Household supplies",
            Category::Baby => "Baby care items",
            Category::Pet => "Pet care items",
        }
    }

    /// Case-insensitive lookup by label
    pub fn from_label(label: &str) -> Option<Category> {
        let wanted = label.trim();
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.label().eq_ignore_ascii_case(wanted))
    }

    pub fn labels() -> Vec<&'static str> {
        Category::ALL.iter().map(|c| c.label()).collect()
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// ITEM
// ============================================================================

/// One line item. Items sold by piece carry `count`, items sold by weight
/// carry `mass` (kg); nothing forces exactly one of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub price: f64,
    pub count: Option<i64>,
    pub mass: Option<f64>,
    pub tax: Option<String>,
    pub category: Option<Category>,
}

impl Item {
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        Item {
            name: name.into(),
            price,
            count: Some(1),
            mass: None,
            tax: None,
            category: None,
        }
    }

    pub fn with_count(mut self, count: i64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_mass(mut self, mass: f64) -> Self {
        self.mass = Some(mass);
        self
    }

    /// Line amount used for the total check: price × count (count absent → 1)
    pub fn subtotal(&self) -> f64 {
        self.price * self.count.unwrap_or(1) as f64
    }
}

// ============================================================================
// RECEIPT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub shop: Shop,
    pub items: Vec<Item>,
}

impl Receipt {
    /// Sum of item subtotals
    pub fn items_total(&self) -> f64 {
        self.items.iter().map(Item::subtotal).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop(date: &str, time: &str) -> Shop {
        Shop {
            name: "Edeka".to_string(),
            date_str: date.to_string(),
            time_str: time.to_string(),
            total: 12.34,
        }
    }

    #[test]
    fn test_shop_date_formats() {
        assert_eq!(shop("2021-05-13", "").date(), NaiveDate::from_ymd_opt(2021, 5, 13));
        assert_eq!(shop("13.05.2021", "").date(), NaiveDate::from_ymd_opt(2021, 5, 13));
        assert_eq!(shop("13.5.2021", "").date(), NaiveDate::from_ymd_opt(2021, 5, 13));
        assert_eq!(shop("May 13th", "").date(), None);
    }

    #[test]
    fn test_shop_time_formats() {
        assert_eq!(shop("", "16:46").time(), NaiveTime::from_hms_opt(16, 46, 0));
        assert_eq!(shop("", "16:46:47").time(), NaiveTime::from_hms_opt(16, 46, 47));
        assert_eq!(shop("", "quarter past four").time(), None);
    }

    #[test]
    fn test_category_labels_roundtrip_through_serde() {
        for category in Category::ALL {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.label()));
            assert_eq!(Category::from_label(category.label()), Some(category));
        }
        assert_eq!(Category::from_label("fish AND seafood"), Some(Category::Seafood));
        assert_eq!(Category::from_label("Electronics"), None);
    }

    #[test]
    fn test_items_total_uses_count() {
        let receipt = Receipt {
            shop: shop("2024-01-01", "10:00"),
            items: vec![
                Item::new("Milk", 1.5).with_count(2),
                Item::new("Bread", 2.0),
                Item {
                    count: None,
                    ..Item::new("Apples", 3.0).with_mass(1.2)
                },
            ],
        };

        assert!((receipt.items_total() - 8.0).abs() < 1e-9);
    }
}
