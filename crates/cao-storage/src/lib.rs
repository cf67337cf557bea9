//! PostgreSQL persistence for imports, normalized inventory, dealership
//! configs and VIN logs, plus the immutable export archive.

mod export;
mod vin_log;

use std::str::FromStr;

use cao_core::{
    DealershipConfig, DomainError, FilteringRules, ImportStatus, InventoryVehicle, LotStatus,
    OutputRules, RawVehicle, RawVehicleDraft, ScraperImport, VehicleCondition,
};
use cao_ingest::VehicleNormalizer;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, info};

pub use export::{ExportStore, StoredExport};
pub use vin_log::{
    legacy_column_renames, missing_vin_log_columns, vin_log_ddl, VinLogLayout, VIN_LOG_COLUMNS,
};

pub const CRATE_NAME: &str = "cao-storage";

/// Rows per multi-row INSERT; keeps bind parameters under the Postgres limit.
const INSERT_CHUNK: usize = 1_000;

const IMPORT_COLUMNS: &str =
    "import_id, status, dealerships_list, import_date, total_vehicles, source_file, content_hash";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no active scraper import")]
    NoActiveImport,
    #[error("expected exactly one active scraper import, found {0:?}")]
    MultipleActiveImports(Vec<i64>),
    #[error("scraper import {0} does not exist")]
    UnknownImport(i64),
    #[error("no dealership config named `{0}`")]
    UnknownDealership(String),
    #[error("vin log table `{0}` does not exist")]
    MissingVinLog(String),
    #[error("invalid {kind} rules for `{name}`: {source}")]
    Rules {
        name: String,
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

/// Which JSON blob of a dealership config a patch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulesKind {
    Filtering,
    Output,
}

impl RulesKind {
    fn column(&self) -> &'static str {
        match self {
            RulesKind::Filtering => "filtering_rules",
            RulesKind::Output => "output_rules",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RulesKind::Filtering => "filtering",
            RulesKind::Output => "output",
        }
    }
}

#[derive(Debug, FromRow)]
struct ImportRow {
    import_id: i64,
    status: String,
    dealerships_list: Vec<String>,
    import_date: DateTime<Utc>,
    total_vehicles: i32,
    source_file: Option<String>,
    content_hash: Option<String>,
}

impl TryFrom<ImportRow> for ScraperImport {
    type Error = DomainError;

    fn try_from(row: ImportRow) -> Result<Self, Self::Error> {
        Ok(ScraperImport {
            import_id: row.import_id,
            status: ImportStatus::from_str(&row.status)?,
            dealerships_list: row.dealerships_list,
            import_date: row.import_date,
            total_vehicles: row.total_vehicles,
            source_file: row.source_file,
            content_hash: row.content_hash,
        })
    }
}

#[derive(Debug, FromRow)]
struct RawRow {
    id: i64,
    import_id: i64,
    vin: String,
    stock: Option<String>,
    #[sqlx(rename = "type")]
    vehicle_type: Option<String>,
    status: Option<String>,
    price: Option<String>,
    year: Option<i32>,
    make: Option<String>,
    model: Option<String>,
    trim: Option<String>,
    location: String,
    date_in_stock: Option<NaiveDate>,
}

impl From<RawRow> for RawVehicle {
    fn from(row: RawRow) -> Self {
        RawVehicle {
            id: row.id,
            import_id: row.import_id,
            vehicle: RawVehicleDraft {
                vin: row.vin,
                stock: row.stock,
                vehicle_type: row.vehicle_type,
                status: row.status,
                price: row.price,
                year: row.year,
                make: row.make,
                model: row.model,
                trim: row.trim,
                location: row.location,
                date_in_stock: row.date_in_stock,
            },
        }
    }
}

#[derive(Debug, FromRow)]
struct InventoryRow {
    raw_data_id: i64,
    import_id: i64,
    vin: String,
    stock: Option<String>,
    vehicle_condition: Option<String>,
    on_lot_status: String,
    status: Option<String>,
    price: Option<f64>,
    year: Option<i32>,
    make: Option<String>,
    model: Option<String>,
    trim: Option<String>,
    location: String,
    date_in_stock: Option<NaiveDate>,
}

impl TryFrom<InventoryRow> for InventoryVehicle {
    type Error = DomainError;

    fn try_from(row: InventoryRow) -> Result<Self, Self::Error> {
        Ok(InventoryVehicle {
            raw_data_id: row.raw_data_id,
            import_id: row.import_id,
            vin: row.vin,
            stock: row.stock,
            condition: row
                .vehicle_condition
                .as_deref()
                .map(VehicleCondition::from_str)
                .transpose()?,
            lot_status: LotStatus::from_str(&row.on_lot_status)?,
            status: row.status,
            price: row.price,
            year: row.year,
            make: row.make,
            model: row.model,
            trim: row.trim,
            location: row.location,
            date_in_stock: row.date_in_stock,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConfigRow {
    name: String,
    filtering_rules: serde_json::Value,
    output_rules: serde_json::Value,
    is_active: bool,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConfigRow> for DealershipConfig {
    type Error = StoreError;

    fn try_from(row: ConfigRow) -> Result<Self, Self::Error> {
        let filtering_rules =
            FilteringRules::from_json(&row.filtering_rules).map_err(|source| StoreError::Rules {
                name: row.name.clone(),
                kind: RulesKind::Filtering.label(),
                source,
            })?;
        let output_rules =
            OutputRules::from_json(&row.output_rules).map_err(|source| StoreError::Rules {
                name: row.name.clone(),
                kind: RulesKind::Output.label(),
                source,
            })?;
        Ok(DealershipConfig {
            name: row.name,
            filtering_rules,
            output_rules,
            is_active: row.is_active,
            updated_at: Some(row.updated_at),
        })
    }
}

/// Requires exactly one active import.
pub fn single_active(imports: Vec<ScraperImport>) -> Result<ScraperImport, StoreError> {
    match imports.len() {
        0 => Err(StoreError::NoActiveImport),
        1 => Ok(imports.into_iter().next().ok_or(StoreError::NoActiveImport)?),
        _ => Err(StoreError::MultipleActiveImports(
            imports.iter().map(|i| i.import_id).collect(),
        )),
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    /// Inserts a scrape batch and its rows in one transaction. The new import
    /// starts archived; use [`Store::activate_import`] to make it current.
    pub async fn create_import(
        &self,
        vehicles: &[RawVehicleDraft],
        dealerships: &[String],
        source_file: Option<&str>,
        content_hash: Option<&str>,
    ) -> Result<ScraperImport, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: ImportRow = sqlx::query_as(&format!(
            "INSERT INTO scraper_imports \
             (status, dealerships_list, import_date, total_vehicles, source_file, content_hash) \
             VALUES ('archived', $1, now(), $2, $3, $4) RETURNING {IMPORT_COLUMNS}"
        ))
        .bind(dealerships)
        .bind(i32::try_from(vehicles.len()).unwrap_or(i32::MAX))
        .bind(source_file)
        .bind(content_hash)
        .fetch_one(&mut *tx)
        .await?;
        let import = ScraperImport::try_from(row)?;

        for chunk in vehicles.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO raw_vehicle_data \
                 (import_id, vin, stock, type, status, price, year, make, model, trim, location, date_in_stock) ",
            );
            qb.push_values(chunk, |mut b, v| {
                b.push_bind(import.import_id)
                    .push_bind(v.vin.clone())
                    .push_bind(v.stock.clone())
                    .push_bind(v.vehicle_type.clone())
                    .push_bind(v.status.clone())
                    .push_bind(v.price.clone())
                    .push_bind(v.year)
                    .push_bind(v.make.clone())
                    .push_bind(v.model.clone())
                    .push_bind(v.trim.clone())
                    .push_bind(v.location.clone())
                    .push_bind(v.date_in_stock);
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        info!(
            import_id = import.import_id,
            vehicles = vehicles.len(),
            "scraper import stored"
        );
        Ok(import)
    }

    /// Archives every other import and activates `import_id` atomically.
    pub async fn activate_import(&self, import_id: i64) -> Result<ScraperImport, StoreError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT import_id FROM scraper_imports WHERE import_id = $1 FOR UPDATE")
                .bind(import_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(StoreError::UnknownImport(import_id));
        }

        let archived = sqlx::query(
            "UPDATE scraper_imports SET status = 'archived' WHERE status = 'active' AND import_id <> $1",
        )
        .bind(import_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let row: ImportRow = sqlx::query_as(&format!(
            "UPDATE scraper_imports SET status = 'active' WHERE import_id = $1 RETURNING {IMPORT_COLUMNS}"
        ))
        .bind(import_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(import_id, archived, "scraper import activated");
        Ok(ScraperImport::try_from(row)?)
    }

    pub async fn active_imports(&self) -> Result<Vec<ScraperImport>, StoreError> {
        let rows: Vec<ImportRow> = sqlx::query_as(&format!(
            "SELECT {IMPORT_COLUMNS} FROM scraper_imports WHERE status = 'active' ORDER BY import_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(ScraperImport::try_from)
            .collect::<Result<_, _>>()?)
    }

    pub async fn active_import(&self) -> Result<ScraperImport, StoreError> {
        single_active(self.active_imports().await?)
    }

    pub async fn list_imports(&self, limit: i64) -> Result<Vec<ScraperImport>, StoreError> {
        let rows: Vec<ImportRow> = sqlx::query_as(&format!(
            "SELECT {IMPORT_COLUMNS} FROM scraper_imports ORDER BY import_id DESC LIMIT $1"
        ))
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(ScraperImport::try_from)
            .collect::<Result<_, _>>()?)
    }

    pub async fn find_import_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<ScraperImport>, StoreError> {
        let row: Option<ImportRow> = sqlx::query_as(&format!(
            "SELECT {IMPORT_COLUMNS} FROM scraper_imports WHERE content_hash = $1 \
             ORDER BY import_id DESC LIMIT 1"
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ScraperImport::try_from).transpose()?)
    }

    pub async fn raw_vehicles(&self, import_id: i64) -> Result<Vec<RawVehicle>, StoreError> {
        let rows: Vec<RawRow> = sqlx::query_as(
            "SELECT id, import_id, vin, stock, type, status, price, year, make, model, trim, \
             location, date_in_stock FROM raw_vehicle_data WHERE import_id = $1 ORDER BY id",
        )
        .bind(import_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RawVehicle::from).collect())
    }

    /// Derives (or re-derives) the normalized rows of an import.
    pub async fn normalize_import(
        &self,
        import_id: i64,
        normalizer: &dyn VehicleNormalizer,
    ) -> Result<usize, StoreError> {
        let raw = self.raw_vehicles(import_id).await?;
        let normalized: Vec<_> = raw.iter().map(|r| normalizer.normalize(r)).collect();

        let mut tx = self.pool.begin().await?;
        for chunk in normalized.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO normalized_vehicle_data \
                 (raw_data_id, vin, stock, vehicle_condition, on_lot_status, price) ",
            );
            qb.push_values(chunk, |mut b, n| {
                b.push_bind(n.raw_data_id)
                    .push_bind(n.vin.clone())
                    .push_bind(n.stock.clone())
                    .push_bind(n.vehicle_condition.map(|c| c.as_str()))
                    .push_bind(n.on_lot_status.as_str())
                    .push_bind(n.price);
            });
            qb.push(
                " ON CONFLICT (raw_data_id) DO UPDATE SET vin = EXCLUDED.vin, stock = EXCLUDED.stock, \
                 vehicle_condition = EXCLUDED.vehicle_condition, on_lot_status = EXCLUDED.on_lot_status, \
                 price = EXCLUDED.price, normalized_at = now()",
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(import_id, rows = normalized.len(), "import normalized");
        Ok(normalized.len())
    }

    /// Raw rows of an import that have no normalized counterpart yet.
    pub async fn unnormalized_count(&self, import_id: i64) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM raw_vehicle_data r \
             LEFT JOIN normalized_vehicle_data n ON n.raw_data_id = r.id \
             WHERE r.import_id = $1 AND n.id IS NULL",
        )
        .bind(import_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Vehicles of `import_id` at `location` (case- and whitespace-insensitive).
    pub async fn current_inventory(
        &self,
        import_id: i64,
        location: &str,
    ) -> Result<Vec<InventoryVehicle>, StoreError> {
        let rows: Vec<InventoryRow> = sqlx::query_as(
            "SELECT r.id AS raw_data_id, r.import_id, n.vin, n.stock, n.vehicle_condition, \
             n.on_lot_status, r.status, n.price, r.year, r.make, r.model, r.trim, r.location, \
             r.date_in_stock \
             FROM raw_vehicle_data r \
             JOIN normalized_vehicle_data n ON n.raw_data_id = r.id \
             WHERE r.import_id = $1 AND lower(trim(r.location)) = lower(trim($2)) \
             ORDER BY r.id",
        )
        .bind(import_id)
        .bind(location)
        .fetch_all(&self.pool)
        .await?;
        debug!(import_id, location, rows = rows.len(), "loaded current inventory");
        Ok(rows
            .into_iter()
            .map(InventoryVehicle::try_from)
            .collect::<Result<_, _>>()?)
    }

    /// Distinct locations of an import with their vehicle counts.
    pub async fn import_locations(&self, import_id: i64) -> Result<Vec<(String, i64)>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT location, COUNT(*) FROM raw_vehicle_data WHERE import_id = $1 \
             GROUP BY location ORDER BY location",
        )
        .bind(import_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_config(&self, name: &str) -> Result<Option<DealershipConfig>, StoreError> {
        let row: Option<ConfigRow> = sqlx::query_as(
            "SELECT name, filtering_rules, output_rules, is_active, updated_at \
             FROM dealership_configs WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DealershipConfig::try_from).transpose()
    }

    /// Raw rule blobs, for configs whose JSON no longer decodes.
    pub async fn get_config_json(
        &self,
        name: &str,
    ) -> Result<Option<(serde_json::Value, serde_json::Value)>, StoreError> {
        let row: Option<(serde_json::Value, serde_json::Value)> = sqlx::query_as(
            "SELECT filtering_rules, output_rules FROM dealership_configs WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn config_names(&self) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar("SELECT name FROM dealership_configs ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    /// All configs; each entry carries its own decode result so one broken
    /// blob does not hide the rest.
    pub async fn list_configs(
        &self,
        active_only: bool,
    ) -> Result<Vec<(String, Result<DealershipConfig, StoreError>)>, StoreError> {
        let rows: Vec<ConfigRow> = sqlx::query_as(
            "SELECT name, filtering_rules, output_rules, is_active, updated_at \
             FROM dealership_configs WHERE is_active OR NOT $1 ORDER BY name",
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.name.clone(), DealershipConfig::try_from(row)))
            .collect())
    }

    pub async fn upsert_config(&self, config: &DealershipConfig) -> Result<(), StoreError> {
        let filtering = serde_json::to_value(&config.filtering_rules).map_err(|source| {
            StoreError::Rules {
                name: config.name.clone(),
                kind: RulesKind::Filtering.label(),
                source,
            }
        })?;
        let output =
            serde_json::to_value(&config.output_rules).map_err(|source| StoreError::Rules {
                name: config.name.clone(),
                kind: RulesKind::Output.label(),
                source,
            })?;
        sqlx::query(
            "INSERT INTO dealership_configs (name, filtering_rules, output_rules, is_active, updated_at) \
             VALUES ($1, $2, $3, $4, now()) \
             ON CONFLICT (name) DO UPDATE SET filtering_rules = EXCLUDED.filtering_rules, \
             output_rules = EXCLUDED.output_rules, is_active = EXCLUDED.is_active, updated_at = now()",
        )
        .bind(&config.name)
        .bind(filtering)
        .bind(output)
        .bind(config.is_active)
        .execute(&self.pool)
        .await?;
        info!(dealership = %config.name, "dealership config saved");
        Ok(())
    }

    /// Shallow-merges `patch` into one rule blob. The merged blob must still
    /// decode, otherwise nothing is written.
    pub async fn patch_rules(
        &self,
        name: &str,
        kind: RulesKind,
        patch: &serde_json::Value,
    ) -> Result<DealershipConfig, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current: Option<serde_json::Value> = sqlx::query_scalar(&format!(
            "SELECT {} FROM dealership_configs WHERE name = $1 FOR UPDATE",
            kind.column()
        ))
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(current) = current else {
            return Err(StoreError::UnknownDealership(name.to_string()));
        };

        let merged = merge_json(current, patch);
        let rules_error = |source| StoreError::Rules {
            name: name.to_string(),
            kind: kind.label(),
            source,
        };
        match kind {
            RulesKind::Filtering => {
                FilteringRules::from_json(&merged).map_err(rules_error)?;
            }
            RulesKind::Output => {
                OutputRules::from_json(&merged).map_err(rules_error)?;
            }
        }

        let row: ConfigRow = sqlx::query_as(&format!(
            "UPDATE dealership_configs SET {} = $2, updated_at = now() WHERE name = $1 \
             RETURNING name, filtering_rules, output_rules, is_active, updated_at",
            kind.column()
        ))
        .bind(name)
        .bind(&merged)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(dealership = name, rules = kind.label(), "dealership rules patched");
        DealershipConfig::try_from(row)
    }
}

/// Top-level key merge; `null` in the patch removes the key.
pub fn merge_json(base: serde_json::Value, patch: &serde_json::Value) -> serde_json::Value {
    match (base, patch) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    base.remove(key);
                } else {
                    base.insert(key.clone(), value.clone());
                }
            }
            serde_json::Value::Object(base)
        }
        (_, patch) => patch.clone(),
    }
}
