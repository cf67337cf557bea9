//! Consistency checks for the invariants production data keeps breaking.

use cao_core::{
    name_similarity, DealershipAliases, DealershipConfig, ImportStatus, ScraperImport,
};
use cao_storage::{missing_vin_log_columns, Store, StoreError};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub code: &'static str,
    pub subject: String,
    pub message: String,
}

impl Finding {
    fn new(severity: Severity, code: &'static str, subject: impl Into<String>, message: String) -> Self {
        Self {
            severity,
            code,
            subject: subject.into(),
            message,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    pub findings: Vec<Finding>,
}

impl ConsistencyReport {
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }
}

pub fn check_active_imports(active: &[ScraperImport]) -> Vec<Finding> {
    let ids: Vec<i64> = active
        .iter()
        .filter(|i| i.status == ImportStatus::Active)
        .map(|i| i.import_id)
        .collect();
    match ids.len() {
        1 => Vec::new(),
        0 => vec![Finding::new(
            Severity::Error,
            "no_active_import",
            "scraper_imports",
            "no scraper import is active".to_string(),
        )],
        _ => vec![Finding::new(
            Severity::Error,
            "multiple_active_imports",
            "scraper_imports",
            format!("imports {ids:?} are all active"),
        )],
    }
}

/// Pairs of distinct config names that look like spellings of one dealership.
pub fn check_name_variants(names: &[String], threshold: f64) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (i, a) in names.iter().enumerate() {
        for b in &names[i + 1..] {
            let score = name_similarity(a, b);
            if score >= threshold {
                findings.push(Finding::new(
                    Severity::Warning,
                    "dealership_name_variant",
                    a.clone(),
                    format!("`{a}` and `{b}` look like the same dealership (similarity {score:.3})"),
                ));
            }
        }
    }
    findings
}

/// Locations of the active import that no config or alias claims.
pub fn check_unmapped_locations(
    locations: &[(String, i64)],
    config_names: &[String],
    aliases: &DealershipAliases,
) -> Vec<Finding> {
    locations
        .iter()
        .filter(|(location, _)| {
            let resolved = aliases.resolve(location);
            !aliases.covers_location(location)
                && !config_names
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(&resolved.config_name))
        })
        .map(|(location, count)| {
            Finding::new(
                Severity::Warning,
                "unmapped_location",
                location.clone(),
                format!("{count} vehicles at `{location}` match no dealership config or alias"),
            )
        })
        .collect()
}

/// Configs whose alias entry points at a location absent from the active import.
pub fn check_missing_locations(
    configs: &[DealershipConfig],
    locations: &[(String, i64)],
    aliases: &DealershipAliases,
) -> Vec<Finding> {
    configs
        .iter()
        .filter(|c| c.is_active)
        .filter_map(|c| {
            let resolved = aliases.resolve(&c.name);
            let present = locations
                .iter()
                .any(|(l, _)| l.trim().eq_ignore_ascii_case(resolved.location.trim()));
            (!present).then(|| {
                Finding::new(
                    Severity::Info,
                    "location_not_in_import",
                    c.name.clone(),
                    format!("active import has no vehicles at `{}`", resolved.location),
                )
            })
        })
        .collect()
}

pub fn check_rules(config: &DealershipConfig) -> Vec<Finding> {
    let mut findings: Vec<Finding> = config
        .filtering_rules
        .contradictions()
        .into_iter()
        .map(|message| {
            Finding::new(Severity::Error, "contradictory_filter_rules", config.name.clone(), message)
        })
        .collect();
    for field in config.output_rules.unknown_fields() {
        findings.push(Finding::new(
            Severity::Error,
            "unknown_output_field",
            config.name.clone(),
            format!("output_rules references unknown field `{field}`"),
        ));
    }
    findings
}

pub fn check_vin_log_layout(dealership: &str, columns: Option<&[String]>) -> Vec<Finding> {
    match columns {
        None => vec![Finding::new(
            Severity::Warning,
            "missing_vin_log",
            dealership,
            "no vin log table; every filtered vehicle will count as new".to_string(),
        )],
        Some(columns) => {
            let missing = missing_vin_log_columns(columns);
            if missing.is_empty() {
                Vec::new()
            } else {
                vec![Finding::new(
                    Severity::Warning,
                    "nonuniform_vin_log",
                    dealership,
                    format!("vin log lacks columns {missing:?}; run `vin-log standardize`"),
                )]
            }
        }
    }
}

pub async fn run_consistency_checks(
    store: &Store,
    aliases: &DealershipAliases,
    name_threshold: f64,
) -> anyhow::Result<ConsistencyReport> {
    let mut report = ConsistencyReport::default();

    let active = store.active_imports().await?;
    report.findings.extend(check_active_imports(&active));

    let names = store.config_names().await?;
    report.findings.extend(check_name_variants(&names, name_threshold));

    let mut configs = Vec::new();
    for (name, decoded) in store.list_configs(false).await? {
        match decoded {
            Ok(config) => configs.push(config),
            Err(err) => report.findings.push(Finding::new(
                Severity::Error,
                "undecodable_config",
                name,
                err.to_string(),
            )),
        }
    }

    for config in &configs {
        report.findings.extend(check_rules(config));
        match store.vin_log_columns(&config.name).await {
            Ok(columns) => report
                .findings
                .extend(check_vin_log_layout(&config.name, columns.as_deref())),
            Err(StoreError::Domain(err)) => report.findings.push(Finding::new(
                Severity::Error,
                "invalid_dealership_name",
                config.name.clone(),
                err.to_string(),
            )),
            Err(err) => return Err(err.into()),
        }
    }

    // location checks only make sense against a single authoritative import
    if let [import] = active.as_slice() {
        let locations = store.import_locations(import.import_id).await?;
        report
            .findings
            .extend(check_unmapped_locations(&locations, &names, aliases));
        report
            .findings
            .extend(check_missing_locations(&configs, &locations, aliases));
        let pending = store.unnormalized_count(import.import_id).await?;
        if pending > 0 {
            report.findings.push(Finding::new(
                Severity::Error,
                "unnormalized_rows",
                format!("import {}", import.import_id),
                format!("{pending} raw rows have no normalized counterpart"),
            ));
        }
    }

    for finding in &report.findings {
        if finding.severity >= Severity::Warning {
            warn!(code = finding.code, subject = %finding.subject, "{}", finding.message);
        }
    }
    Ok(report)
}
