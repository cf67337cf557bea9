//! Core domain model for dealership inventory, VIN logs and CAO rules.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;

pub const CRATE_NAME: &str = "cao-core";

const VIN_LOG_SUFFIX: &str = "_vin_log";
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("unknown vehicle condition `{0}`")]
    UnknownCondition(String),
    #[error("unknown lot status `{0}`")]
    UnknownLotStatus(String),
    #[error("unknown import status `{0}`")]
    UnknownImportStatus(String),
    #[error("unknown output field `{0}`")]
    UnknownOutputField(String),
    #[error("`{0}` cannot be turned into a SQL identifier")]
    InvalidIdentifier(String),
}

/// Cleaned vehicle condition as stored in `normalized_vehicle_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VehicleCondition {
    #[serde(rename = "new")]
    New,
    #[serde(rename = "po")]
    PreOwned,
    #[serde(rename = "cpo")]
    Certified,
}

impl VehicleCondition {
    pub const ALL: [VehicleCondition; 3] = [
        VehicleCondition::New,
        VehicleCondition::PreOwned,
        VehicleCondition::Certified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleCondition::New => "new",
            VehicleCondition::PreOwned => "po",
            VehicleCondition::Certified => "cpo",
        }
    }

    /// Expands a rule token into the conditions it covers. `used` covers both
    /// pre-owned and certified inventory.
    pub fn expand_token(token: &str) -> Option<&'static [VehicleCondition]> {
        match canonical_token(token).as_str() {
            "new" => Some(&[VehicleCondition::New]),
            "used" => Some(&[VehicleCondition::PreOwned, VehicleCondition::Certified]),
            "po" | "pre-owned" | "preowned" => Some(&[VehicleCondition::PreOwned]),
            "cpo" | "certified" | "certified-pre-owned" | "certified-preowned" => {
                Some(&[VehicleCondition::Certified])
            }
            _ => None,
        }
    }
}

impl fmt::Display for VehicleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleCondition {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match canonical_token(s).as_str() {
            "new" => Ok(VehicleCondition::New),
            "po" | "pre-owned" | "preowned" | "used" => Ok(VehicleCondition::PreOwned),
            "cpo" | "certified" | "certified-pre-owned" | "certified-preowned" => {
                Ok(VehicleCondition::Certified)
            }
            _ => Err(DomainError::UnknownCondition(s.to_string())),
        }
    }
}

fn canonical_token(token: &str) -> String {
    token
        .trim()
        .to_ascii_lowercase()
        .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LotStatus {
    #[serde(rename = "onlot")]
    OnLot,
    #[serde(rename = "offlot")]
    OffLot,
}

impl LotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LotStatus::OnLot => "onlot",
            LotStatus::OffLot => "offlot",
        }
    }
}

impl FromStr for LotStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match canonical_token(s).replace('-', "").as_str() {
            "onlot" => Ok(LotStatus::OnLot),
            "offlot" => Ok(LotStatus::OffLot),
            _ => Err(DomainError::UnknownLotStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Active,
    Archived,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Active => "active",
            ImportStatus::Archived => "archived",
        }
    }
}

impl FromStr for ImportStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ImportStatus::Active),
            "archived" => Ok(ImportStatus::Archived),
            _ => Err(DomainError::UnknownImportStatus(s.to_string())),
        }
    }
}

/// One scraped vehicle observation, as parsed from a scraper export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawVehicleDraft {
    pub vin: String,
    pub stock: Option<String>,
    pub vehicle_type: Option<String>,
    pub status: Option<String>,
    pub price: Option<String>,
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub location: String,
    pub date_in_stock: Option<NaiveDate>,
}

/// Persisted `raw_vehicle_data` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawVehicle {
    pub id: i64,
    pub import_id: i64,
    pub vehicle: RawVehicleDraft,
}

/// Derived `normalized_vehicle_data` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedVehicle {
    pub raw_data_id: i64,
    pub vin: String,
    pub stock: Option<String>,
    pub vehicle_condition: Option<VehicleCondition>,
    pub on_lot_status: LotStatus,
    pub price: Option<f64>,
}

/// Raw and normalized data joined for one vehicle of an import; the input of
/// the CAO difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryVehicle {
    pub raw_data_id: i64,
    pub import_id: i64,
    pub vin: String,
    pub stock: Option<String>,
    pub condition: Option<VehicleCondition>,
    pub lot_status: LotStatus,
    pub status: Option<String>,
    pub price: Option<f64>,
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub location: String,
    pub date_in_stock: Option<NaiveDate>,
}

impl InventoryVehicle {
    pub fn export_value(&self, field: OutputField) -> String {
        match field {
            OutputField::Stock => self.stock.clone().unwrap_or_default(),
            OutputField::Vin => self.vin.clone(),
            OutputField::Year => self.year.map(|y| y.to_string()).unwrap_or_default(),
            OutputField::Make => self.make.clone().unwrap_or_default(),
            OutputField::Model => self.model.clone().unwrap_or_default(),
            OutputField::Trim => self.trim.clone().unwrap_or_default(),
            OutputField::Condition => self
                .condition
                .map(|c| c.as_str().to_string())
                .unwrap_or_default(),
            OutputField::Price => self.price.map(|p| format!("{p:.2}")).unwrap_or_default(),
            OutputField::Status => self.status.clone().unwrap_or_default(),
            OutputField::LotStatus => self.lot_status.as_str().to_string(),
            OutputField::Location => self.location.clone(),
            OutputField::DateInStock => self
                .date_in_stock
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
        }
    }
}

/// `scraper_imports` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperImport {
    pub import_id: i64,
    pub status: ImportStatus,
    pub dealerships_list: Vec<String>,
    pub import_date: DateTime<Utc>,
    pub total_vehicles: i32,
    pub source_file: Option<String>,
    pub content_hash: Option<String>,
}

/// A previously processed VIN in a dealership's VIN log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VinLogEntry {
    pub vin: String,
    pub order_number: Option<String>,
    pub processed_date: Option<NaiveDate>,
    pub order_type: Option<String>,
    pub template_type: Option<String>,
}

impl VinLogEntry {
    pub fn new(vin: impl Into<String>) -> Self {
        Self {
            vin: vin.into(),
            order_number: None,
            processed_date: None,
            order_type: None,
            template_type: None,
        }
    }
}

/// Per-dealership inventory filter, read leniently from the `filtering_rules`
/// JSON blob. Every key is optional and unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilteringRules {
    #[serde(alias = "allowed_vehicle_types")]
    pub vehicle_types: Vec<String>,
    pub exclude_conditions: Vec<String>,
    #[serde(alias = "exclude_statuses")]
    pub exclude_status: Vec<String>,
    pub require_stock: bool,
    pub require_on_lot: bool,
    pub min_price: Option<f64>,
    pub exclude_missing_price: bool,
    pub exclude_price_placeholders: bool,
    pub price_placeholders: Vec<f64>,
    pub min_year: Option<i32>,
    pub max_year: Option<i32>,
}

impl Default for FilteringRules {
    fn default() -> Self {
        Self {
            vehicle_types: Vec::new(),
            exclude_conditions: Vec::new(),
            exclude_status: Vec::new(),
            require_stock: true,
            require_on_lot: true,
            min_price: None,
            exclude_missing_price: false,
            exclude_price_placeholders: false,
            price_placeholders: vec![0.0, 1.0, 999_999.0],
            min_year: None,
            max_year: None,
        }
    }
}

impl FilteringRules {
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
    }

    /// Conditions admitted by `vehicle_types`; an empty list admits everything.
    pub fn allowed_conditions(&self) -> BTreeSet<VehicleCondition> {
        if self.vehicle_types.is_empty() {
            return VehicleCondition::ALL.into_iter().collect();
        }
        expand_tokens(&self.vehicle_types)
    }

    pub fn excluded_conditions(&self) -> BTreeSet<VehicleCondition> {
        expand_tokens(&self.exclude_conditions)
    }

    pub fn effective_conditions(&self) -> BTreeSet<VehicleCondition> {
        let excluded = self.excluded_conditions();
        self.allowed_conditions()
            .into_iter()
            .filter(|c| !excluded.contains(c))
            .collect()
    }

    pub fn unknown_condition_tokens(&self) -> Vec<String> {
        self.vehicle_types
            .iter()
            .chain(self.exclude_conditions.iter())
            .filter(|t| VehicleCondition::expand_token(t).is_none())
            .cloned()
            .collect()
    }

    pub fn is_status_excluded(&self, status: &str) -> bool {
        let status = status.trim();
        self.exclude_status
            .iter()
            .any(|s| s.trim().eq_ignore_ascii_case(status))
    }

    pub fn is_price_placeholder(&self, price: f64) -> bool {
        self.price_placeholders
            .iter()
            .any(|p| (p - price).abs() < 0.005)
    }

    /// Rule combinations that make the filter reject every vehicle, or that
    /// reference tokens the filter does not understand.
    pub fn contradictions(&self) -> Vec<String> {
        let mut found = Vec::new();
        for token in self.unknown_condition_tokens() {
            found.push(format!("unknown condition token `{token}`"));
        }
        if self.effective_conditions().is_empty() {
            found.push(format!(
                "vehicle_types {:?} are fully excluded by exclude_conditions {:?}",
                self.vehicle_types, self.exclude_conditions
            ));
        }
        if let (Some(min), Some(max)) = (self.min_year, self.max_year) {
            if min > max {
                found.push(format!("min_year {min} is greater than max_year {max}"));
            }
        }
        if let Some(min_price) = self.min_price {
            if min_price < 0.0 {
                found.push(format!("min_price {min_price} is negative"));
            }
        }
        found
    }
}

fn expand_tokens(tokens: &[String]) -> BTreeSet<VehicleCondition> {
    tokens
        .iter()
        .filter_map(|t| VehicleCondition::expand_token(t))
        .flat_map(|conds| conds.iter().copied())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputField {
    Stock,
    Vin,
    Year,
    Make,
    Model,
    Trim,
    Condition,
    Price,
    Status,
    LotStatus,
    Location,
    DateInStock,
}

impl OutputField {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputField::Stock => "stock",
            OutputField::Vin => "vin",
            OutputField::Year => "year",
            OutputField::Make => "make",
            OutputField::Model => "model",
            OutputField::Trim => "trim",
            OutputField::Condition => "condition",
            OutputField::Price => "price",
            OutputField::Status => "status",
            OutputField::LotStatus => "lot_status",
            OutputField::Location => "location",
            OutputField::DateInStock => "date_in_stock",
        }
    }
}

impl FromStr for OutputField {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "stock" | "stock_number" => Ok(OutputField::Stock),
            "vin" => Ok(OutputField::Vin),
            "year" => Ok(OutputField::Year),
            "make" => Ok(OutputField::Make),
            "model" => Ok(OutputField::Model),
            "trim" => Ok(OutputField::Trim),
            "condition" | "vehicle_condition" | "type" => Ok(OutputField::Condition),
            "price" => Ok(OutputField::Price),
            "status" => Ok(OutputField::Status),
            "lot_status" | "on_lot_status" => Ok(OutputField::LotStatus),
            "location" => Ok(OutputField::Location),
            "date_in_stock" => Ok(OutputField::DateInStock),
            _ => Err(DomainError::UnknownOutputField(s.to_string())),
        }
    }
}

/// CSV formatting rules read from the `output_rules` JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputRules {
    pub template: String,
    pub fields: Vec<String>,
    pub sort_by: Vec<String>,
    pub include_header: bool,
}

impl Default for OutputRules {
    fn default() -> Self {
        Self {
            template: "shortcut_pack".to_string(),
            fields: ["stock", "vin", "year", "make", "model", "trim", "condition", "price"]
                .into_iter()
                .map(String::from)
                .collect(),
            sort_by: vec!["stock".to_string()],
            include_header: true,
        }
    }
}

impl OutputRules {
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
    }

    pub fn output_fields(&self) -> Result<Vec<OutputField>, DomainError> {
        self.fields.iter().map(|f| f.parse()).collect()
    }

    pub fn sort_fields(&self) -> Result<Vec<OutputField>, DomainError> {
        self.sort_by.iter().map(|f| f.parse()).collect()
    }

    pub fn unknown_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .chain(self.sort_by.iter())
            .filter(|f| f.parse::<OutputField>().is_err())
            .cloned()
            .collect()
    }
}

/// `dealership_configs` row with both rule blobs decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealershipConfig {
    pub name: String,
    pub filtering_rules: FilteringRules,
    pub output_rules: OutputRules,
    pub is_active: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DealershipConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filtering_rules: FilteringRules::default(),
            output_rules: OutputRules::default(),
            is_active: true,
            updated_at: None,
        }
    }
}

/// Alias table mapping dealership config names to the scraper's location
/// strings and to known spelling variants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DealershipAliases {
    #[serde(default)]
    pub dealerships: Vec<DealershipAlias>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealershipAlias {
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedDealership {
    pub config_name: String,
    pub location: String,
}

impl DealershipAliases {
    /// Loads the alias table; a missing file yields an empty table.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn resolve(&self, name: &str) -> ResolvedDealership {
        let wanted = name.trim();
        for entry in &self.dealerships {
            let matches = entry.name.eq_ignore_ascii_case(wanted)
                || entry.aliases.iter().any(|a| a.trim().eq_ignore_ascii_case(wanted))
                || entry
                    .location
                    .as_deref()
                    .is_some_and(|l| l.eq_ignore_ascii_case(wanted));
            if matches {
                return ResolvedDealership {
                    config_name: entry.name.clone(),
                    location: entry.location.clone().unwrap_or_else(|| entry.name.clone()),
                };
            }
        }
        ResolvedDealership {
            config_name: wanted.to_string(),
            location: wanted.to_string(),
        }
    }

    /// True when `location` is claimed by some entry, either as its location
    /// string or as its name when no location is given.
    pub fn covers_location(&self, location: &str) -> bool {
        self.dealerships.iter().any(|e| {
            e.location
                .as_deref()
                .unwrap_or(&e.name)
                .eq_ignore_ascii_case(location.trim())
        })
    }
}

pub fn normalize_name_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn name_similarity(a: &str, b: &str) -> f64 {
    jaro_winkler(&normalize_name_fragment(a), &normalize_name_fragment(b))
}

/// Closest candidate to `name` scoring at least `threshold`.
pub fn suggest_name<'a>(
    name: &str,
    candidates: impl IntoIterator<Item = &'a str>,
    threshold: f64,
) -> Option<(String, f64)> {
    candidates
        .into_iter()
        .map(|c| (c, name_similarity(name, c)))
        .filter(|(_, score)| *score >= threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, score)| (c.to_string(), score))
}

pub fn normalize_vin(input: &str) -> Option<String> {
    let vin = input.trim().to_ascii_uppercase();
    if vin.is_empty() {
        None
    } else {
        Some(vin)
    }
}

/// Post-1981 VIN shape: 17 alphanumerics without I, O or Q.
pub fn is_standard_vin(vin: &str) -> bool {
    vin.len() == 17
        && vin
            .chars()
            .all(|c| c.is_ascii_alphanumeric() && !matches!(c.to_ascii_uppercase(), 'I' | 'O' | 'Q'))
}

/// Name of the per-dealership VIN log table.
pub fn vin_log_table_name(dealership: &str) -> Result<String, DomainError> {
    let mut slug = String::new();
    for c in dealership.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    let slug = slug.trim_end_matches('_');
    if slug.is_empty() {
        return Err(DomainError::InvalidIdentifier(dealership.to_string()));
    }
    let mut base = if slug.starts_with(|c: char| c.is_ascii_digit()) {
        format!("d_{slug}")
    } else {
        slug.to_string()
    };
    base.truncate(MAX_IDENTIFIER_LEN - VIN_LOG_SUFFIX.len());
    let name = format!("{}{VIN_LOG_SUFFIX}", base.trim_end_matches('_'));
    validate_identifier(&name)?;
    Ok(name)
}

pub fn validate_identifier(name: &str) -> Result<(), DomainError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LEN
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(DomainError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn used_token_expands_to_both_preowned_conditions() {
        let rules = FilteringRules {
            vehicle_types: vec!["used".into()],
            ..Default::default()
        };
        let allowed = rules.allowed_conditions();
        assert!(allowed.contains(&VehicleCondition::PreOwned));
        assert!(allowed.contains(&VehicleCondition::Certified));
        assert!(!allowed.contains(&VehicleCondition::New));
    }

    #[test]
    fn lenient_rules_accept_missing_and_aliased_keys() {
        let rules = FilteringRules::from_json(&json!({
            "allowed_vehicle_types": ["new"],
            "exclude_statuses": ["In-Transit"],
            "some_future_key": 42
        }))
        .unwrap();
        assert_eq!(rules.vehicle_types, vec!["new".to_string()]);
        assert!(rules.is_status_excluded("in-transit"));
        assert!(rules.require_stock);
        assert!(rules.require_on_lot);

        let defaults = FilteringRules::from_json(&serde_json::Value::Null).unwrap();
        assert_eq!(defaults, FilteringRules::default());
    }

    #[test]
    fn used_with_po_and_cpo_excluded_is_contradictory() {
        let rules = FilteringRules {
            vehicle_types: vec!["used".into()],
            exclude_conditions: vec!["po".into(), "cpo".into()],
            ..Default::default()
        };
        let found = rules.contradictions();
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("fully excluded"));
    }

    #[test]
    fn partial_exclusion_is_not_contradictory() {
        let rules = FilteringRules {
            vehicle_types: vec!["used".into()],
            exclude_conditions: vec!["cpo".into()],
            ..Default::default()
        };
        assert!(rules.contradictions().is_empty());
        assert_eq!(
            rules.effective_conditions().into_iter().collect::<Vec<_>>(),
            vec![VehicleCondition::PreOwned]
        );
    }

    #[test]
    fn condition_parsing_accepts_variants() {
        assert_eq!("Pre-Owned".parse(), Ok(VehicleCondition::PreOwned));
        assert_eq!("certified".parse(), Ok(VehicleCondition::Certified));
        assert_eq!(" NEW ".parse(), Ok(VehicleCondition::New));
        assert!("demo".parse::<VehicleCondition>().is_err());
        assert_eq!("off-lot".parse(), Ok(LotStatus::OffLot));
    }

    #[test]
    fn alias_table_resolves_spelling_variants() {
        let aliases = DealershipAliases::from_yaml_str(
            r#"
dealerships:
  - name: "Dave Sinclair Lincoln South"
    location: "Dave Sinclair Lincoln South"
    aliases: ["Dave Sinclair Lincoln", "Sinclair Lincoln South"]
  - name: "Suntrup Ford Westport"
"#,
        )
        .unwrap();
        let resolved = aliases.resolve("sinclair lincoln south");
        assert_eq!(resolved.config_name, "Dave Sinclair Lincoln South");
        assert_eq!(resolved.location, "Dave Sinclair Lincoln South");

        let fallback = aliases.resolve("Unknown Motors");
        assert_eq!(fallback.config_name, "Unknown Motors");
        assert_eq!(fallback.location, "Unknown Motors");
        assert!(aliases.covers_location("suntrup ford westport"));
    }

    #[test]
    fn missing_alias_file_is_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let aliases = DealershipAliases::load(dir.path().join("nope.yaml")).unwrap();
        assert!(aliases.dealerships.is_empty());
    }

    #[test]
    fn suggestion_prefers_closest_name() {
        let names = ["Columbia Honda", "Columbia BMW", "Dave Sinclair Lincoln"];
        let (best, score) = suggest_name("Columbia Hond", names, 0.85).unwrap();
        assert_eq!(best, "Columbia Honda");
        assert!(score >= 0.85);
        assert!(suggest_name("Zzz", names, 0.85).is_none());
    }

    #[test]
    fn vin_log_table_names_are_safe_identifiers() {
        assert_eq!(
            vin_log_table_name("Dave Sinclair Lincoln South").unwrap(),
            "dave_sinclair_lincoln_south_vin_log"
        );
        assert_eq!(vin_log_table_name("BMW of West St. Louis").unwrap(), "bmw_of_west_st_louis_vin_log");
        assert_eq!(vin_log_table_name("1st Motors").unwrap(), "d_1st_motors_vin_log");
        assert!(vin_log_table_name("  --  ").is_err());
        let long = vin_log_table_name(&"x".repeat(120)).unwrap();
        assert!(long.len() <= 63);
        assert!(validate_identifier("robert'; drop table x").is_err());
    }

    #[test]
    fn vin_shape_check() {
        assert!(is_standard_vin("1FTFW1E50PFA12345"));
        assert!(!is_standard_vin("1FTFW1E50PFA1234O"));
        assert!(!is_standard_vin("SHORT"));
        assert_eq!(normalize_vin("  1ftfw1e50pfa12345 ").as_deref(), Some("1FTFW1E50PFA12345"));
        assert_eq!(normalize_vin("   "), None);
    }

    #[test]
    fn output_rules_report_unknown_fields() {
        let rules = OutputRules::from_json(&json!({"fields": ["stock", "vin", "qr_code"]})).unwrap();
        assert_eq!(rules.unknown_fields(), vec!["qr_code".to_string()]);
        assert!(rules.output_fields().is_err());
        assert_eq!(rules.template, "shortcut_pack");
    }
}
