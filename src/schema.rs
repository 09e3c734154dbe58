// 📐 Shape Layer - Receipt Schema Validation
// Declares the receipt schema once, derives the JSON Schema handed to the
// model, and coerces/validates candidate records against it

use crate::receipt::{Category, Item, Receipt, Shop};
use serde_json::{json, Map, Value};

// ============================================================================
// FIELD SPECS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    Integer,
    Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Shop,
    Item,
}

impl Section {
    pub fn name(&self) -> &'static str {
        match self {
            Section::Shop => "Shop",
            Section::Item => "Item",
        }
    }

    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            Section::Shop => SHOP_FIELDS,
            Section::Item => ITEM_FIELDS,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub title: &'static str,
    pub examples: &'static [&'static str],
}

pub const SHOP_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "name",
        kind: FieldKind::Text,
        required: true,
        title: "Name of the shop.",
        examples: &["Edeka", "Rewe", "Aldi", "Lidl", "Netto", "dm"],
    },
    FieldSpec {
        name: "date_str",
        kind: FieldKind::Text,
        required: true,
        title: "Date of the purchase.",
        examples: &["2021-05-13", "13.5.2021"],
    },
    FieldSpec {
        name: "time_str",
        kind: FieldKind::Text,
        required: true,
        title: "Time of the purchase.",
        examples: &["16:46", "16:46:47"],
    },
    FieldSpec {
        name: "total",
        kind: FieldKind::Number,
        required: true,
        title: "Total amount of the purchase in Euros.",
        examples: &["12.34", "42"],
    },
];

pub const ITEM_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "name",
        kind: FieldKind::Text,
        required: true,
        title: "Name of the item (in German).",
        examples: &["G&G Tomatens.1l", "Mini Romanasalat", "G&G Laug Brez"],
    },
    FieldSpec {
        name: "price",
        kind: FieldKind::Number,
        required: true,
        title: "Price of the item in Euros.",
        examples: &["1.23", "4.56"],
    },
    FieldSpec {
        name: "count",
        kind: FieldKind::Integer,
        required: false,
        title: "Number of items purchased. Often only provided in receipts if multiple items of the same type were purchased.",
        examples: &["1", "2", "3"],
    },
    FieldSpec {
        name: "mass",
        kind: FieldKind::Number,
        required: false,
        title: "Mass of the item in kilograms. Often only provided in receipts for items sold by weight.",
        examples: &["0.1", "2.5"],
    },
    FieldSpec {
        name: "tax",
        kind: FieldKind::Text,
        required: false,
        title: "Tax rate applied for the items. The tax rate is indicated usually at the end of the line for each item by some symbol. The symbols are usually supermarket chain specific.",
        examples: &["A", "B", "AP", "7%", "19%"],
    },
    FieldSpec {
        name: "category",
        kind: FieldKind::Category,
        required: false,
        title: "Category the grocery item likely belongs to given its name.",
        examples: &[],
    },
];

/// Look up a field spec by section and name
pub fn field_spec(section: Section, name: &str) -> Option<&'static FieldSpec> {
    section.fields().iter().find(|f| f.name == name)
}

// ============================================================================
// JSON SCHEMA
// ============================================================================

fn field_schema(spec: &FieldSpec) -> Value {
    let base = match spec.kind {
        FieldKind::Text => json!({ "type": "string" }),
        FieldKind::Number => json!({ "type": "number" }),
        FieldKind::Integer => json!({ "type": "integer" }),
        FieldKind::Category => json!({ "type": "string", "enum": Category::labels() }),
    };

    let mut obj = Map::new();
    if spec.required {
        if let Value::Object(fields) = base {
            obj.extend(fields);
        }
    } else {
        // Optional fields may be explicitly null
        obj.insert("anyOf".to_string(), json!([base, { "type": "null" }]));
    }
    obj.insert("title".to_string(), json!(spec.title));

    let examples: Vec<Value> = spec
        .examples
        .iter()
        .map(|e| match spec.kind {
            FieldKind::Number | FieldKind::Integer => e
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| json!(e)),
            _ => json!(e),
        })
        .collect();
    if !examples.is_empty() {
        obj.insert("examples".to_string(), Value::Array(examples));
    }

    Value::Object(obj)
}

fn section_schema(section: Section, title: &str) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for spec in section.fields() {
        properties.insert(spec.name.to_string(), field_schema(spec));
        if spec.required {
            required.push(json!(spec.name));
        }
    }

    json!({
        "type": "object",
        "title": title,
        "properties": properties,
        "required": required,
    })
}

/// JSON Schema of a receipt, used to constrain the model's output
pub fn receipt_json_schema() -> Value {
    json!({
        "type": "object",
        "title": "Receipt",
        "properties": {
            "shop": section_schema(Section::Shop, "Shop details."),
            "items": {
                "type": "array",
                "title": "List of items purchased.",
                "items": section_schema(Section::Item, "Item"),
            },
        },
        "required": ["shop", "items"],
    })
}

// ============================================================================
// VALIDATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ValidationError {
    /// Path of the offending field, e.g. `items[2].price`
    pub field: String,
    pub message: String,
    pub context: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>, context: &str) -> Self {
        ValidationError {
            field: field.into(),
            message: message.into(),
            context: context.to_string(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.context, self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult<T> = Result<T, Vec<ValidationError>>;

// ============================================================================
// COERCION
// ============================================================================

/// Lenient number parsing: accepts decimal commas and surrounding blanks
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace(',', ".");
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_integer(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    trimmed
        .parse::<i64>()
        .ok()
        .or_else(|| parse_number(trimmed).and_then(integral))
}

fn integral(v: f64) -> Option<i64> {
    if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {}", b),
        Value::Number(n) => format!("number {}", n),
        Value::String(s) => format!("\"{}\"", s),
        Value::Array(_) => "an array".to_string(),
        Value::Object(_) => "an object".to_string(),
    }
}

fn coerce_text(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(format!("expected text, got {}", describe(other))),
    }
}

fn coerce_number(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("number {} is out of range", n)),
        Value::String(s) => {
            parse_number(s).ok_or_else(|| format!("expected a number, got \"{}\"", s))
        }
        other => Err(format!("expected a number, got {}", describe(other))),
    }
}

fn coerce_integer(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().and_then(integral))
            .ok_or_else(|| format!("expected a whole number, got {}", n)),
        Value::String(s) => {
            parse_integer(s).ok_or_else(|| format!("expected a whole number, got \"{}\"", s))
        }
        other => Err(format!("expected a whole number, got {}", describe(other))),
    }
}

fn coerce_category(value: &Value) -> Result<Category, String> {
    match value {
        Value::String(s) => Category::from_label(s).ok_or_else(|| {
            format!(
                "unknown category \"{}\", expected one of: {}",
                s,
                Category::labels().join(", ")
            )
        }),
        other => Err(format!("expected a category label, got {}", describe(other))),
    }
}

// ============================================================================
// SCHEMA VALIDATOR
// ============================================================================

/// Field reader over one JSON object, collecting errors as it goes
struct FieldReader<'a> {
    obj: &'a Map<String, Value>,
    path: String,
    context: &'static str,
    errors: &'a mut Vec<ValidationError>,
}

impl<'a> FieldReader<'a> {
    fn path_of(&self, name: &str) -> String {
        format!("{}.{}", self.path, name)
    }

    /// Present and non-null value, or record a "required" error
    fn required(&mut self, name: &str) -> Option<&'a Value> {
        match self.obj.get(name) {
            Some(Value::Null) | None => {
                let path = self.path_of(name);
                self.errors
                    .push(ValidationError::new(path, "Required field is missing", self.context));
                None
            }
            Some(v) => Some(v),
        }
    }

    fn fail(&mut self, name: &str, message: String) {
        let path = self.path_of(name);
        self.errors.push(ValidationError::new(path, message, self.context));
    }

    fn text(&mut self, name: &str) -> Option<String> {
        let value = self.required(name)?;
        match coerce_text(value) {
            Ok(s) if s.trim().is_empty() => {
                self.fail(name, "Required field is empty".to_string());
                None
            }
            Ok(s) => Some(s),
            Err(msg) => {
                self.fail(name, msg);
                None
            }
        }
    }

    fn number(&mut self, name: &str) -> Option<f64> {
        let value = self.required(name)?;
        coerce_number(value).map_err(|msg| self.fail(name, msg)).ok()
    }

    /// Optional field: `Ok(None)` when absent, null or blank text
    fn optional<T>(
        &mut self,
        name: &str,
        coerce: impl Fn(&Value) -> Result<T, String>,
    ) -> Result<Option<T>, ()> {
        match self.obj.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(v) => match coerce(v) {
                Ok(t) => Ok(Some(t)),
                Err(msg) => {
                    self.fail(name, msg);
                    Err(())
                }
            },
        }
    }
}

pub struct SchemaValidator {
    schema: Value,
}

impl SchemaValidator {
    pub fn new() -> Self {
        SchemaValidator {
            schema: receipt_json_schema(),
        }
    }

    /// The JSON Schema this validator enforces
    pub fn json_schema(&self) -> &Value {
        &self.schema
    }

    /// Validate and coerce a candidate record into a typed `Receipt`.
    ///
    /// Reports every problem it finds, not just the first one. Pure: the
    /// same candidate always yields the same verdict.
    pub fn validate(&self, candidate: &Value) -> ValidationResult<Receipt> {
        let mut errors = Vec::new();

        let root = match candidate.as_object() {
            Some(obj) => obj,
            None => {
                return Err(vec![ValidationError::new(
                    "receipt",
                    format!("expected an object, got {}", describe(candidate)),
                    "Receipt",
                )]);
            }
        };

        let shop = match root.get("shop") {
            Some(Value::Object(obj)) => self.validate_shop(obj, &mut errors),
            Some(Value::Null) | None => {
                errors.push(ValidationError::new("shop", "Required field is missing", "Receipt"));
                None
            }
            Some(other) => {
                errors.push(ValidationError::new(
                    "shop",
                    format!("expected an object, got {}", describe(other)),
                    "Receipt",
                ));
                None
            }
        };

        let items = match root.get("items") {
            Some(Value::Array(values)) => {
                let mut items = Vec::with_capacity(values.len());
                let mut complete = true;
                for (index, value) in values.iter().enumerate() {
                    match self.validate_item(index, value, &mut errors) {
                        Some(item) => items.push(item),
                        None => complete = false,
                    }
                }
                complete.then_some(items)
            }
            Some(Value::Null) | None => {
                errors.push(ValidationError::new("items", "Required field is missing", "Receipt"));
                None
            }
            Some(other) => {
                errors.push(ValidationError::new(
                    "items",
                    format!("expected a list, got {}", describe(other)),
                    "Receipt",
                ));
                None
            }
        };

        match (shop, items) {
            (Some(shop), Some(items)) if errors.is_empty() => Ok(Receipt { shop, items }),
            _ => Err(errors),
        }
    }

    fn validate_shop(
        &self,
        obj: &Map<String, Value>,
        errors: &mut Vec<ValidationError>,
    ) -> Option<Shop> {
        let mut reader = FieldReader {
            obj,
            path: "shop".to_string(),
            context: "Shop",
            errors,
        };

        let name = reader.text("name");
        let date_str = reader.text("date_str");
        let time_str = reader.text("time_str");
        let total = reader.number("total");

        Some(Shop {
            name: name?,
            date_str: date_str?,
            time_str: time_str?,
            total: total?,
        })
    }

    fn validate_item(
        &self,
        index: usize,
        value: &Value,
        errors: &mut Vec<ValidationError>,
    ) -> Option<Item> {
        let path = format!("items[{}]", index);
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => {
                errors.push(ValidationError::new(
                    path,
                    format!("expected an object, got {}", describe(value)),
                    "Item",
                ));
                return None;
            }
        };

        let mut reader = FieldReader {
            obj,
            path,
            context: "Item",
            errors,
        };

        let name = reader.text("name");
        let price = reader.number("price");
        // A count the model left out means a single piece
        let count = if obj.contains_key("count") {
            reader.optional("count", coerce_integer)
        } else {
            Ok(Some(1))
        };
        let mass = reader.optional("mass", coerce_number);
        let tax = reader.optional("tax", coerce_text);
        let category = reader.optional("category", coerce_category);

        Some(Item {
            name: name?,
            price: price?,
            count: count.ok()?,
            mass: mass.ok()?,
            tax: tax.ok()?,
            category: category.ok()?,
        })
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_candidate() -> Value {
        json!({
            "shop": {
                "name": "My Supermarket",
                "date_str": "2024-03-01",
                "time_str": "12:30",
                "total": 6.5
            },
            "items": [
                { "name": "Milk", "price": 1.5, "count": 2, "mass": null, "tax": "A", "category": "Dairy" },
                { "name": "Bread", "price": 2.0, "count": 1, "mass": null, "tax": "A", "category": "Bread and baked goods" }
            ]
        })
    }

    #[test]
    fn test_validate_valid_candidate() {
        let validator = SchemaValidator::new();
        let receipt = validator.validate(&valid_candidate()).unwrap();

        assert_eq!(receipt.shop.name, "My Supermarket");
        assert_eq!(receipt.items.len(), 2);
        assert_eq!(receipt.items[1].category, Some(Category::BakedGoods));
    }

    #[test]
    fn test_lenient_coercion() {
        let validator = SchemaValidator::new();
        let candidate = json!({
            "shop": { "name": "Rewe", "date_str": "13.5.2021", "time_str": "16:46", "total": "12,34" },
            "items": [
                { "name": "Bananen", "price": "1,99", "count": 2.0, "category": "fruits" },
                { "name": "Tomaten", "price": 0.89, "mass": "0.5", "tax": 7, "extra": true }
            ]
        });

        let receipt = validator.validate(&candidate).unwrap();
        assert!((receipt.shop.total - 12.34).abs() < 1e-9);
        assert!((receipt.items[0].price - 1.99).abs() < 1e-9);
        assert_eq!(receipt.items[0].count, Some(2));
        assert_eq!(receipt.items[0].category, Some(Category::Fruits));
        // count omitted by the model defaults to one piece
        assert_eq!(receipt.items[1].count, Some(1));
        assert_eq!(receipt.items[1].mass, Some(0.5));
        assert_eq!(receipt.items[1].tax.as_deref(), Some("7"));
    }

    #[test]
    fn test_explicit_null_count_stays_empty() {
        let validator = SchemaValidator::new();
        let mut candidate = valid_candidate();
        candidate["items"][0]["count"] = Value::Null;

        let receipt = validator.validate(&candidate).unwrap();
        assert_eq!(receipt.items[0].count, None);
    }

    #[test]
    fn test_collects_all_errors_with_paths() {
        let validator = SchemaValidator::new();
        let candidate = json!({
            "shop": { "name": "  ", "date_str": "2024-03-01", "total": "abc" },
            "items": [
                { "name": "Milk", "price": 1.5 },
                { "name": "Eggs", "price": "two", "count": 1.5, "category": "Electronics" },
                "garbage"
            ]
        });

        let errors = validator.validate(&candidate).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"shop.name"));
        assert!(fields.contains(&"shop.time_str"));
        assert!(fields.contains(&"shop.total"));
        assert!(fields.contains(&"items[1].price"));
        assert!(fields.contains(&"items[1].count"));
        assert!(fields.contains(&"items[1].category"));
        assert!(fields.contains(&"items[2]"));
        assert!(!fields.iter().any(|f| f.starts_with("items[0]")));
    }

    #[test]
    fn test_non_object_candidate() {
        let validator = SchemaValidator::new();
        let errors = validator.validate(&json!("a receipt")).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "receipt");

        let errors = validator.validate(&json!({})).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["shop", "items"]);
    }

    #[test]
    fn test_validation_is_idempotent() {
        let validator = SchemaValidator::new();
        let mut candidate = valid_candidate();
        candidate["shop"]["total"] = json!("not a number");

        let first = validator.validate(&candidate);
        let second = validator.validate(&candidate);
        assert_eq!(first, second);

        let valid = valid_candidate();
        assert_eq!(validator.validate(&valid), validator.validate(&valid));
    }

    #[test]
    fn test_json_schema_shape() {
        let schema = receipt_json_schema();

        assert_eq!(schema["required"], json!(["shop", "items"]));
        assert_eq!(
            schema["properties"]["shop"]["required"],
            json!(["name", "date_str", "time_str", "total"])
        );
        assert_eq!(schema["properties"]["items"]["items"]["required"], json!(["name", "price"]));

        let category = &schema["properties"]["items"]["items"]["properties"]["category"];
        let labels = category["anyOf"][0]["enum"].as_array().unwrap();
        assert_eq!(labels.len(), Category::ALL.len());
        assert_eq!(category["anyOf"][1]["type"], "null");

        assert_eq!(schema["properties"]["shop"]["properties"]["total"]["examples"][0], json!(12.34));
    }

    #[test]
    fn test_field_schema_carries_type_and_title() {
        let name = field_schema(&SHOP_FIELDS[0]);
        assert_eq!(name["type"], "string");
        assert_eq!(name["title"], json!(SHOP_FIELDS[0].title));

        let mass = field_schema(field_spec(Section::Item, "mass").unwrap());
        assert_eq!(mass["anyOf"][0]["type"], "number");
        assert!(mass.get("type").is_none());
    }

    #[test]
    fn test_field_spec_lookup() {
        assert_eq!(field_spec(Section::Shop, "total").unwrap().kind, FieldKind::Number);
        assert_eq!(field_spec(Section::Item, "count").unwrap().kind, FieldKind::Integer);
        assert!(field_spec(Section::Item, "date_str").is_none());
    }
}
