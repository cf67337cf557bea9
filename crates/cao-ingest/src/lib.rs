//! Scraper export / VIN-log CSV parsing and raw inventory normalization.

use std::collections::{BTreeSet, HashSet};
use std::io::Read;

use cao_core::{
    normalize_vin, LotStatus, NormalizedVehicle, RawVehicle, RawVehicleDraft, VehicleCondition,
    VinLogEntry,
};
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "cao-ingest";

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%Y/%m/%d", "%m-%d-%Y"];

const OFF_LOT_MARKERS: &[&str] = &[
    "transit",
    "onorder",
    "sold",
    "pending",
    "allocat",
    "build",
    "built",
    "production",
    "courtesy",
    "loaner",
    "offlot",
    "incoming",
    "arriving",
    "shipped",
];

const MISSING_STOCK_MARKERS: &[&str] = &["", "n/a", "na", "none", "null", "-", "--", "tbd"];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing required column `{0}`")]
    MissingColumn(&'static str),
}

/// Turns a raw scraped row into its normalized counterpart.
pub trait VehicleNormalizer: Send + Sync {
    fn normalize(&self, raw: &RawVehicle) -> NormalizedVehicle;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StandardNormalizer;

impl VehicleNormalizer for StandardNormalizer {
    fn normalize(&self, raw: &RawVehicle) -> NormalizedVehicle {
        normalize_vehicle(raw)
    }
}

pub fn normalize_vehicle(raw: &RawVehicle) -> NormalizedVehicle {
    let v = &raw.vehicle;
    NormalizedVehicle {
        raw_data_id: raw.id,
        vin: normalize_vin(&v.vin).unwrap_or_default(),
        stock: normalize_stock(v.stock.as_deref()),
        vehicle_condition: v.vehicle_type.as_deref().and_then(normalize_condition),
        on_lot_status: normalize_lot_status(v.status.as_deref()),
        price: parse_price(v.price.as_deref()),
    }
}

fn words(input: &str) -> Vec<String> {
    input
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect()
}

/// Maps scraped "type" text such as `Certified Pre-Owned` or `Used` to a
/// condition. Unrecognized text yields `None`.
pub fn normalize_condition(raw: &str) -> Option<VehicleCondition> {
    let words = words(raw);
    let has = |w: &str| words.iter().any(|x| x == w);
    let pre_owned = has("preowned")
        || has("used")
        || has("po")
        || words.windows(2).any(|pair| pair[0] == "pre" && pair[1] == "owned");

    if has("certified") || has("cpo") {
        Some(VehicleCondition::Certified)
    } else if pre_owned {
        Some(VehicleCondition::PreOwned)
    } else if has("new") {
        Some(VehicleCondition::New)
    } else {
        None
    }
}

/// Scraped availability text to lot status. Missing text counts as on-lot.
pub fn normalize_lot_status(status: Option<&str>) -> LotStatus {
    let Some(status) = status else {
        return LotStatus::OnLot;
    };
    let compact: String = status
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if OFF_LOT_MARKERS.iter().any(|m| compact.contains(m)) {
        LotStatus::OffLot
    } else {
        LotStatus::OnLot
    }
}

pub fn parse_price(text: Option<&str>) -> Option<f64> {
    let cleaned: String = text?
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    let price = cleaned.parse::<f64>().ok()?;
    if price.is_finite() && price >= 0.0 {
        Some(price)
    } else {
        None
    }
}

pub fn normalize_stock(text: Option<&str>) -> Option<String> {
    let stock = text?.trim();
    if MISSING_STOCK_MARKERS.contains(&stock.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(stock.to_string())
    }
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    let date_part = text.split(['T', ' ']).next().unwrap_or(text);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

fn canonical_header(header: &str) -> String {
    header
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

struct Columns {
    headers: Vec<String>,
}

impl Columns {
    fn new(record: &csv::StringRecord) -> Self {
        Self {
            headers: record.iter().map(canonical_header).collect(),
        }
    }

    /// First header matching the aliases, in alias priority order.
    fn find(&self, aliases: &[&str]) -> Option<usize> {
        aliases
            .iter()
            .find_map(|alias| self.headers.iter().position(|h| h == alias))
    }
}

fn field(record: &csv::StringRecord, idx: Option<usize>) -> Option<String> {
    let value = record.get(idx?)?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScraperCsv {
    pub vehicles: Vec<RawVehicleDraft>,
    pub skipped: usize,
}

impl ScraperCsv {
    pub fn locations(&self) -> Vec<String> {
        self.vehicles
            .iter()
            .map(|v| v.location.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Parses a scraper export. Columns are matched by header name; rows without
/// a VIN or a location are skipped and counted.
pub fn parse_scraper_csv<R: Read>(
    reader: R,
    default_location: Option<&str>,
) -> Result<ScraperCsv, IngestError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let columns = Columns::new(rdr.headers()?);

    let vin = columns
        .find(&["vin", "vin_number", "vehicle_vin"])
        .ok_or(IngestError::MissingColumn("vin"))?;
    let location = columns.find(&["location", "dealership", "dealer_name", "dealer"]);
    if location.is_none() && default_location.is_none() {
        return Err(IngestError::MissingColumn("location"));
    }
    let stock = columns.find(&["stock", "stock_number", "stock_no", "stocknumber"]);
    let vehicle_type = columns.find(&["type", "vehicle_type", "condition", "new_used"]);
    let status = columns.find(&["status", "vehicle_status", "availability"]);
    let price = columns.find(&["price", "sale_price", "internet_price", "msrp"]);
    let year = columns.find(&["year", "model_year"]);
    let make = columns.find(&["make"]);
    let model = columns.find(&["model"]);
    let trim = columns.find(&["trim", "trim_level"]);
    let date_in_stock = columns.find(&["date_in_stock", "in_stock_date", "stock_date"]);

    let mut parsed = ScraperCsv::default();
    for (line, record) in rdr.records().enumerate() {
        let record = record?;
        let Some(vin_value) = field(&record, Some(vin)).and_then(|v| normalize_vin(&v)) else {
            debug!(line = line + 2, "skipping scraper row without vin");
            parsed.skipped += 1;
            continue;
        };
        let Some(location_value) =
            field(&record, location).or_else(|| default_location.map(String::from))
        else {
            warn!(line = line + 2, vin = %vin_value, "skipping scraper row without location");
            parsed.skipped += 1;
            continue;
        };

        parsed.vehicles.push(RawVehicleDraft {
            vin: vin_value,
            stock: field(&record, stock),
            vehicle_type: field(&record, vehicle_type),
            status: field(&record, status),
            price: field(&record, price),
            year: field(&record, year).and_then(|y| y.parse().ok()),
            make: field(&record, make),
            model: field(&record, model),
            trim: field(&record, trim),
            location: location_value,
            date_in_stock: field(&record, date_in_stock).and_then(|d| parse_date(&d)),
        });
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VinLogCsv {
    pub entries: Vec<VinLogEntry>,
    pub skipped: usize,
    pub duplicates: usize,
}

/// Parses a VIN-log history export. Only the VIN column is required; the
/// first occurrence of a VIN wins.
pub fn parse_vin_log_csv<R: Read>(reader: R) -> Result<VinLogCsv, IngestError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let columns = Columns::new(rdr.headers()?);

    let vin = columns
        .find(&["vin", "vin_number", "vehicle_vin"])
        .ok_or(IngestError::MissingColumn("vin"))?;
    let order_number = columns.find(&["order_number", "order", "order_no", "order_id"]);
    let processed_date = columns.find(&["processed_date", "date", "order_date", "date_processed"]);
    let order_type = columns.find(&["order_type", "type"]);
    let template_type = columns.find(&["template_type", "template"]);

    let mut parsed = VinLogCsv::default();
    let mut seen = HashSet::new();
    for record in rdr.records() {
        let record = record?;
        let Some(vin_value) = field(&record, Some(vin)).and_then(|v| normalize_vin(&v)) else {
            parsed.skipped += 1;
            continue;
        };
        if !seen.insert(vin_value.clone()) {
            parsed.duplicates += 1;
            continue;
        }
        parsed.entries.push(VinLogEntry {
            vin: vin_value,
            order_number: field(&record, order_number),
            processed_date: field(&record, processed_date).and_then(|d| parse_date(&d)),
            order_type: field(&record, order_type),
            template_type: field(&record, template_type),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(vehicle_type: &str, status: &str, stock: &str, price: &str) -> RawVehicle {
        RawVehicle {
            id: 7,
            import_id: 3,
            vehicle: RawVehicleDraft {
                vin: " 1ftfw1e50pfa12345".into(),
                stock: Some(stock.into()),
                vehicle_type: Some(vehicle_type.into()),
                status: Some(status.into()),
                price: Some(price.into()),
                location: "Columbia Honda".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn condition_text_variants() {
        assert_eq!(normalize_condition("New"), Some(VehicleCondition::New));
        assert_eq!(normalize_condition("Used"), Some(VehicleCondition::PreOwned));
        assert_eq!(normalize_condition("Pre-Owned"), Some(VehicleCondition::PreOwned));
        assert_eq!(normalize_condition("PRE OWNED"), Some(VehicleCondition::PreOwned));
        assert_eq!(
            normalize_condition("Certified Pre-Owned"),
            Some(VehicleCondition::Certified)
        );
        assert_eq!(normalize_condition("CPO"), Some(VehicleCondition::Certified));
        assert_eq!(normalize_condition("Demo"), None);
    }

    #[test]
    fn lot_status_markers() {
        assert_eq!(normalize_lot_status(Some("In Stock")), LotStatus::OnLot);
        assert_eq!(normalize_lot_status(Some("Available")), LotStatus::OnLot);
        assert_eq!(normalize_lot_status(Some("In-Transit")), LotStatus::OffLot);
        assert_eq!(normalize_lot_status(Some("On Order")), LotStatus::OffLot);
        assert_eq!(normalize_lot_status(Some("Sale Pending")), LotStatus::OffLot);
        assert_eq!(normalize_lot_status(Some("Build")), LotStatus::OffLot);
        assert_eq!(normalize_lot_status(Some("Being Built")), LotStatus::OffLot);
        assert_eq!(normalize_lot_status(Some("Build Phase")), LotStatus::OffLot);
        assert_eq!(normalize_lot_status(Some("In Build")), LotStatus::OffLot);
        assert_eq!(normalize_lot_status(None), LotStatus::OnLot);
    }

    #[test]
    fn price_and_stock_cleanup() {
        assert_eq!(parse_price(Some("$32,995")), Some(32995.0));
        assert_eq!(parse_price(Some("41995.50")), Some(41995.5));
        assert_eq!(parse_price(Some("Call for price")), None);
        assert_eq!(parse_price(Some("-5")), None);
        assert_eq!(parse_price(None), None);
        assert_eq!(normalize_stock(Some(" N/A ")), None);
        assert_eq!(normalize_stock(Some("")), None);
        assert_eq!(normalize_stock(Some(" H1234 ")).as_deref(), Some("H1234"));
    }

    #[test]
    fn vehicle_normalization_carries_raw_id() {
        let normalized = StandardNormalizer.normalize(&raw("Certified", "In Transit", "", "$0"));
        assert_eq!(normalized.raw_data_id, 7);
        assert_eq!(normalized.vin, "1FTFW1E50PFA12345");
        assert_eq!(normalized.vehicle_condition, Some(VehicleCondition::Certified));
        assert_eq!(normalized.on_lot_status, LotStatus::OffLot);
        assert_eq!(normalized.stock, None);
        assert_eq!(normalized.price, Some(0.0));
    }

    #[test]
    fn scraper_csv_maps_headers_and_skips_rows_without_vin() {
        let data = "\
VIN,Stock #,Type,Status,Price,Year,Make,Model,Trim,Location,Date In Stock
1HGCV1F34PA000001,H1001,New,In Stock,\"$31,250\",2024,Honda,Accord,EX,Columbia Honda,2024-05-01
,H1002,Used,In Stock,$18000,2019,Honda,Civic,LX,Columbia Honda,
5J6RW2H89PL000003,H1003,Certified Pre-Owned,In Transit,,2023,Honda,CR-V,EX-L,Columbia Honda,05/03/2024
";
        let parsed = parse_scraper_csv(data.as_bytes(), None).unwrap();
        assert_eq!(parsed.vehicles.len(), 2);
        assert_eq!(parsed.skipped, 1);
        let first = &parsed.vehicles[0];
        assert_eq!(first.stock.as_deref(), Some("H1001"));
        assert_eq!(first.price.as_deref(), Some("$31,250"));
        assert_eq!(first.year, Some(2024));
        assert_eq!(first.date_in_stock, NaiveDate::from_ymd_opt(2024, 5, 1));
        assert_eq!(parsed.vehicles[1].date_in_stock, NaiveDate::from_ymd_opt(2024, 5, 3));
        assert_eq!(parsed.locations(), vec!["Columbia Honda".to_string()]);
    }

    #[test]
    fn scraper_csv_requires_location_source() {
        let data = "vin,stock\n1HGCV1F34PA000001,H1\n";
        let err = parse_scraper_csv(data.as_bytes(), None).unwrap_err();
        assert!(matches!(err, IngestError::MissingColumn("location")));

        let parsed = parse_scraper_csv(data.as_bytes(), Some("Columbia Honda")).unwrap();
        assert_eq!(parsed.vehicles[0].location, "Columbia Honda");
    }

    #[test]
    fn vin_log_csv_collapses_duplicates() {
        let data = "\
Order,VIN,Date
5001,1hgcv1f34pa000001,3/14/2024
5002,1HGCV1F34PA000001,3/15/2024
,,
5003,5J6RW2H89PL000003,2024-03-16
";
        let parsed = parse_vin_log_csv(data.as_bytes()).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.duplicates, 1);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.entries[0].vin, "1HGCV1F34PA000001");
        assert_eq!(parsed.entries[0].order_number.as_deref(), Some("5001"));
        assert_eq!(parsed.entries[0].processed_date, NaiveDate::from_ymd_opt(2024, 3, 14));
    }

    #[test]
    fn vin_log_csv_without_vin_column_is_rejected() {
        let err = parse_vin_log_csv("order,date\n1,2024-01-01\n".as_bytes()).unwrap_err();
        assert!(matches!(err, IngestError::MissingColumn("vin")));
    }
}
