//! CSV rendering per `output_rules` and Parquet snapshots of CAO results.

use std::cmp::Ordering;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use cao_core::{DomainError, InventoryVehicle, OutputField, OutputRules};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Rules(#[from] DomainError),
    #[error("writing csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("flushing csv: {0}")]
    Io(#[from] std::io::Error),
}

fn compare_by(a: &InventoryVehicle, b: &InventoryVehicle, field: OutputField) -> Ordering {
    match field {
        OutputField::Year => a.year.cmp(&b.year),
        OutputField::Price => match (a.price, b.price) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (x, y) => x.is_some().cmp(&y.is_some()),
        },
        _ => a
            .export_value(field)
            .to_ascii_lowercase()
            .cmp(&b.export_value(field).to_ascii_lowercase()),
    }
}

/// Sorts and renders vehicles as CSV with the configured columns.
pub fn render_csv(vehicles: &[InventoryVehicle], rules: &OutputRules) -> Result<Vec<u8>, ExportError> {
    let fields = rules.output_fields()?;
    let sort_fields = rules.sort_fields()?;

    let mut rows: Vec<&InventoryVehicle> = vehicles.iter().collect();
    rows.sort_by(|a, b| {
        sort_fields
            .iter()
            .fold(Ordering::Equal, |acc, f| acc.then_with(|| compare_by(a, b, *f)))
    });

    let mut writer = csv::Writer::from_writer(Vec::new());
    if rules.include_header {
        writer.write_record(fields.iter().map(|f| f.as_str()))?;
    }
    for vehicle in rows {
        writer.write_record(fields.iter().map(|f| vehicle.export_value(*f)))?;
    }
    writer.into_inner().map_err(|e| ExportError::Io(e.into_error()))
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

pub fn write_vehicles_parquet(path: &Path, vehicles: &[InventoryVehicle]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("vin", DataType::Utf8, false),
        ArrowField::new("stock", DataType::Utf8, true),
        ArrowField::new("condition", DataType::Utf8, true),
        ArrowField::new("lot_status", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, true),
        ArrowField::new("price", DataType::Float64, true),
        ArrowField::new("year", DataType::Int32, true),
        ArrowField::new("make", DataType::Utf8, true),
        ArrowField::new("model", DataType::Utf8, true),
        ArrowField::new("trim", DataType::Utf8, true),
        ArrowField::new("location", DataType::Utf8, false),
    ]));

    let text = |f: fn(&InventoryVehicle) -> Option<&str>| {
        StringArray::from(vehicles.iter().map(f).collect::<Vec<_>>())
    };
    let vins = text(|v| Some(v.vin.as_str()));
    let stocks = text(|v| v.stock.as_deref());
    let conditions = text(|v| v.condition.map(|c| c.as_str()));
    let lot_statuses = text(|v| Some(v.lot_status.as_str()));
    let statuses = text(|v| v.status.as_deref());
    let prices = Float64Array::from(vehicles.iter().map(|v| v.price).collect::<Vec<_>>());
    let years = Int32Array::from(vehicles.iter().map(|v| v.year).collect::<Vec<_>>());
    let makes = text(|v| v.make.as_deref());
    let models = text(|v| v.model.as_deref());
    let trims = text(|v| v.trim.as_deref());
    let locations = text(|v| Some(v.location.as_str()));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(vins),
            Arc::new(stocks),
            Arc::new(conditions),
            Arc::new(lot_statuses),
            Arc::new(statuses),
            Arc::new(prices),
            Arc::new(years),
            Arc::new(makes),
            Arc::new(models),
            Arc::new(trims),
            Arc::new(locations),
        ],
    )
    .context("building cao vehicles record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

pub fn manifest_entry(name: &str, base: &Path, path: &Path, rows: usize) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
        rows,
    })
}
