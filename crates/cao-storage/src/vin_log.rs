//! Per-dealership VIN log tables with one uniform layout.

use std::collections::HashSet;

use cao_core::{validate_identifier, vin_log_table_name, VinLogEntry};
use serde_json::json;
use sqlx::{Postgres, QueryBuilder};
use tracing::{info, warn};

use crate::{Store, StoreError, INSERT_CHUNK};

/// Uniform VIN log columns and their types.
pub const VIN_LOG_COLUMNS: &[(&str, &str)] = &[
    ("vin", "TEXT"),
    ("order_number", "TEXT"),
    ("processed_date", "DATE"),
    ("order_type", "TEXT"),
    ("template_type", "TEXT"),
    ("created_at", "TIMESTAMPTZ NOT NULL DEFAULT now()"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VinLogLayout {
    pub table: String,
    pub created: bool,
    pub added_columns: Vec<String>,
    pub renamed_columns: Vec<(String, String)>,
    pub removed_duplicates: u64,
}

impl VinLogLayout {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "table": self.table,
            "created": self.created,
            "added_columns": self.added_columns,
            "renamed_columns": self.renamed_columns,
            "removed_duplicates": self.removed_duplicates,
        })
    }
}

/// Uniform columns absent from `existing`. Postgres column names are
/// case-sensitive once quoted, so a legacy `"VIN"` does not count as `vin`.
pub fn missing_vin_log_columns(existing: &[String]) -> Vec<&'static str> {
    VIN_LOG_COLUMNS
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| !existing.iter().any(|c| c == name))
        .collect()
}

/// Legacy columns that differ from a missing uniform column only by case,
/// paired with the uniform name they should be renamed to.
pub fn legacy_column_renames(existing: &[String]) -> Vec<(String, &'static str)> {
    missing_vin_log_columns(existing)
        .into_iter()
        .filter_map(|name| {
            existing
                .iter()
                .find(|c| c.eq_ignore_ascii_case(name))
                .map(|legacy| (legacy.clone(), name))
        })
        .collect()
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Statements that create `table` or bring a legacy table to the uniform
/// layout. Every statement is idempotent.
pub fn vin_log_ddl(table: &str) -> Result<Vec<String>, StoreError> {
    validate_identifier(table)?;
    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {table} (vin TEXT NOT NULL, order_number TEXT, \
         processed_date DATE, order_type TEXT, template_type TEXT, \
         created_at TIMESTAMPTZ NOT NULL DEFAULT now())"
    )];
    for (column, ty) in VIN_LOG_COLUMNS {
        statements.push(format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {column} {ty}"));
    }
    statements.push(format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {table}_vin_key ON {table} (vin)"
    ));
    Ok(statements)
}

impl Store {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }

    pub async fn vin_log_exists(&self, dealership: &str) -> Result<bool, StoreError> {
        self.table_exists(&vin_log_table_name(dealership)?).await
    }

    /// Column names of the dealership's VIN log, or `None` if it has none.
    pub async fn vin_log_columns(&self, dealership: &str) -> Result<Option<Vec<String>>, StoreError> {
        let table = vin_log_table_name(dealership)?;
        if !self.table_exists(&table).await? {
            return Ok(None);
        }
        let columns = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 ORDER BY ordinal_position",
        )
        .bind(&table)
        .fetch_all(self.pool())
        .await?;
        Ok(Some(columns))
    }

    /// Creates the VIN log or standardizes an existing one: renames
    /// case-variant legacy columns, adds missing uniform columns, drops
    /// duplicate VIN rows and adds the VIN unique key.
    pub async fn ensure_vin_log(&self, dealership: &str) -> Result<VinLogLayout, StoreError> {
        let table = vin_log_table_name(dealership)?;
        let before = self.vin_log_columns(dealership).await?;
        let created = before.is_none();
        let existing = before.unwrap_or_default();
        let renames = legacy_column_renames(&existing);
        let added_columns = missing_vin_log_columns(&existing)
            .into_iter()
            .filter(|name| !created && !renames.iter().any(|(_, to)| to == name))
            .map(String::from)
            .collect::<Vec<_>>();

        let mut tx = self.pool().begin().await?;
        for (legacy, uniform) in &renames {
            sqlx::query(&format!(
                "ALTER TABLE {table} RENAME COLUMN {} TO {uniform}",
                quote_identifier(legacy)
            ))
            .execute(&mut *tx)
            .await?;
        }
        let mut removed_duplicates = 0;
        let statements = vin_log_ddl(&table)?;
        let (index_stmt, column_stmts) = statements.split_last().ok_or_else(|| {
            StoreError::Domain(cao_core::DomainError::InvalidIdentifier(table.clone()))
        })?;
        for stmt in column_stmts {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        if !created {
            removed_duplicates = sqlx::query(&format!(
                "DELETE FROM {table} a USING {table} b WHERE a.vin = b.vin AND a.ctid > b.ctid"
            ))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        sqlx::query(index_stmt).execute(&mut *tx).await?;
        tx.commit().await?;

        if created {
            info!(dealership, table = %table, "vin log created");
        } else if !added_columns.is_empty() || !renames.is_empty() || removed_duplicates > 0 {
            warn!(
                dealership,
                table = %table,
                added = ?added_columns,
                renamed = ?renames,
                removed_duplicates,
                "vin log standardized"
            );
        }
        Ok(VinLogLayout {
            table,
            created,
            added_columns,
            renamed_columns: renames
                .into_iter()
                .map(|(legacy, uniform)| (legacy, uniform.to_string()))
                .collect(),
            removed_duplicates,
        })
    }

    /// Upper-cased VINs already recorded for the dealership.
    pub async fn logged_vins(&self, dealership: &str) -> Result<HashSet<String>, StoreError> {
        let table = vin_log_table_name(dealership)?;
        if !self.table_exists(&table).await? {
            return Err(StoreError::MissingVinLog(table));
        }
        let vins: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT upper(trim(vin)) FROM {table} WHERE vin IS NOT NULL AND trim(vin) <> ''"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(vins.into_iter().collect())
    }

    pub async fn vin_log_count(&self, dealership: &str) -> Result<i64, StoreError> {
        let table = vin_log_table_name(dealership)?;
        if !self.table_exists(&table).await? {
            return Err(StoreError::MissingVinLog(table));
        }
        let count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Inserts entries, skipping VINs already present. Returns the number of
    /// rows inserted. The log must exist with the uniform layout.
    pub async fn record_vins(
        &self,
        dealership: &str,
        entries: &[VinLogEntry],
    ) -> Result<u64, StoreError> {
        let table = vin_log_table_name(dealership)?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool().begin().await?;
        let mut inserted = 0;
        for chunk in entries.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {table} (vin, order_number, processed_date, order_type, template_type) "
            ));
            qb.push_values(chunk, |mut b, e| {
                b.push_bind(e.vin.to_ascii_uppercase())
                    .push_bind(e.order_number.clone())
                    .push_bind(e.processed_date)
                    .push_bind(e.order_type.clone())
                    .push_bind(e.template_type.clone());
            });
            qb.push(" ON CONFLICT (vin) DO NOTHING");
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        info!(
            dealership,
            table = %table,
            offered = entries.len(),
            inserted,
            "vin log updated"
        );
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_layout_reports_missing_columns() {
        let legacy = vec!["vin".to_string(), "order_date".to_string()];
        assert_eq!(
            missing_vin_log_columns(&legacy),
            vec!["order_number", "processed_date", "order_type", "template_type", "created_at"]
        );
        let uniform: Vec<String> = VIN_LOG_COLUMNS.iter().map(|(c, _)| c.to_string()).collect();
        assert!(missing_vin_log_columns(&uniform).is_empty());
    }

    #[test]
    fn ddl_is_idempotent_and_ends_with_unique_key() {
        let ddl = vin_log_ddl("columbia_honda_vin_log").unwrap();
        assert!(ddl[0].starts_with("CREATE TABLE IF NOT EXISTS columbia_honda_vin_log"));
        assert!(ddl
            .iter()
            .skip(1)
            .take(VIN_LOG_COLUMNS.len())
            .all(|s| s.contains("ADD COLUMN IF NOT EXISTS")));
        assert!(ddl
            .last()
            .unwrap()
            .contains("UNIQUE INDEX IF NOT EXISTS columbia_honda_vin_log_vin_key"));
    }

    #[test]
    fn ddl_refuses_unsafe_table_names() {
        assert!(vin_log_ddl("x; DROP TABLE dealership_configs").is_err());
    }

    #[test]
    fn quoted_uppercase_vin_is_not_uniform_and_gets_renamed() {
        let legacy = vec![
            "VIN".to_string(),
            "Order_Number".to_string(),
            "processed_date".to_string(),
        ];
        let missing = missing_vin_log_columns(&legacy);
        assert!(missing.contains(&"vin"));
        assert!(missing.contains(&"order_number"));
        assert_eq!(
            legacy_column_renames(&legacy),
            vec![
                ("VIN".to_string(), "vin"),
                ("Order_Number".to_string(), "order_number"),
            ]
        );
        assert!(legacy_column_renames(&["vin".to_string(), "VIN".to_string()]).is_empty());
        assert_eq!(quote_identifier("VIN"), "\"VIN\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }
}
