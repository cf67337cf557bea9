use std::fs::File;
use std::path::PathBuf;

use cao_core::{LotStatus, RawVehicle, VehicleCondition};
use cao_ingest::{normalize_vehicle, parse_scraper_csv, parse_vin_log_csv};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(name)
}

#[test]
fn scraper_fixture_parses_and_normalizes() {
    let file = File::open(fixture("scraper_export_sample.csv")).expect("fixture");
    let parsed = parse_scraper_csv(file, None).expect("parse");
    assert_eq!(parsed.vehicles.len(), 6);
    assert_eq!(parsed.skipped, 1);
    assert_eq!(
        parsed.locations(),
        vec!["Columbia Honda".to_string(), "Dave Sinclair Lincoln South".to_string()]
    );

    let normalized: Vec<_> = parsed
        .vehicles
        .iter()
        .enumerate()
        .map(|(i, v)| {
            normalize_vehicle(&RawVehicle {
                id: i as i64 + 1,
                import_id: 1,
                vehicle: v.clone(),
            })
        })
        .collect();

    assert_eq!(normalized[1].on_lot_status, LotStatus::OffLot);
    assert_eq!(normalized[2].stock, None);
    assert_eq!(normalized[3].vehicle_condition, Some(VehicleCondition::Certified));
    assert_eq!(normalized[4].price, None);
    assert_eq!(normalized[5].price, Some(48120.0));
}

#[test]
fn vin_log_fixture_parses() {
    let file = File::open(fixture("vin_log_sample.csv")).expect("fixture");
    let parsed = parse_vin_log_csv(file).expect("parse");
    assert_eq!(parsed.entries.len(), 2);
    assert_eq!(parsed.duplicates, 1);
    assert_eq!(parsed.entries[1].vin, "5J6RW2H89PL000004");
    assert_eq!(parsed.entries[1].template_type.as_deref(), Some("shortcut_pack"));
}
