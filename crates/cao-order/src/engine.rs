//! The CAO filter and the difference against a VIN log.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use cao_core::{FilteringRules, InventoryVehicle, LotStatus, VehicleCondition};
use serde::Serialize;

/// First filter conjunct a vehicle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    MissingCondition,
    ConditionNotAllowed,
    ConditionExcluded,
    OffLot,
    MissingStock,
    ExcludedStatus,
    MissingPrice,
    PricePlaceholder,
    BelowMinPrice,
    YearOutOfRange,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::MissingCondition => "missing_condition",
            Rejection::ConditionNotAllowed => "condition_not_allowed",
            Rejection::ConditionExcluded => "condition_excluded",
            Rejection::OffLot => "off_lot",
            Rejection::MissingStock => "missing_stock",
            Rejection::ExcludedStatus => "excluded_status",
            Rejection::MissingPrice => "missing_price",
            Rejection::PricePlaceholder => "price_placeholder",
            Rejection::BelowMinPrice => "below_min_price",
            Rejection::YearOutOfRange => "year_out_of_range",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CaoOutcome {
    pub inventory_count: usize,
    pub duplicate_vins: usize,
    pub passed_filters: usize,
    pub already_logged: usize,
    pub rejections: BTreeMap<Rejection, usize>,
    pub new_vehicles: Vec<InventoryVehicle>,
}

/// Compiled form of a dealership's filtering rules.
#[derive(Debug, Clone)]
pub struct CaoEngine {
    rules: FilteringRules,
    allowed: BTreeSet<VehicleCondition>,
    excluded: BTreeSet<VehicleCondition>,
}

impl CaoEngine {
    pub fn new(rules: FilteringRules) -> Self {
        Self {
            allowed: rules.allowed_conditions(),
            excluded: rules.excluded_conditions(),
            rules,
        }
    }

    pub fn rules(&self) -> &FilteringRules {
        &self.rules
    }

    fn restricts_condition(&self) -> bool {
        self.allowed.len() < VehicleCondition::ALL.len() || !self.excluded.is_empty()
    }

    pub fn evaluate(&self, vehicle: &InventoryVehicle) -> Result<(), Rejection> {
        match vehicle.condition {
            Some(condition) => {
                if !self.allowed.contains(&condition) {
                    return Err(Rejection::ConditionNotAllowed);
                }
                if self.excluded.contains(&condition) {
                    return Err(Rejection::ConditionExcluded);
                }
            }
            None if self.restricts_condition() => return Err(Rejection::MissingCondition),
            None => {}
        }

        if self.rules.require_on_lot && vehicle.lot_status == LotStatus::OffLot {
            return Err(Rejection::OffLot);
        }

        if self.rules.require_stock
            && vehicle.stock.as_deref().map_or(true, |s| s.trim().is_empty())
        {
            return Err(Rejection::MissingStock);
        }

        if vehicle
            .status
            .as_deref()
            .is_some_and(|s| self.rules.is_status_excluded(s))
        {
            return Err(Rejection::ExcludedStatus);
        }

        match vehicle.price {
            None if self.rules.exclude_missing_price || self.rules.min_price.is_some() => {
                return Err(Rejection::MissingPrice);
            }
            None => {}
            Some(price) => {
                if self.rules.exclude_price_placeholders && self.rules.is_price_placeholder(price) {
                    return Err(Rejection::PricePlaceholder);
                }
                if self.rules.min_price.is_some_and(|min| price < min) {
                    return Err(Rejection::BelowMinPrice);
                }
            }
        }

        if self.rules.min_year.is_some() || self.rules.max_year.is_some() {
            let in_range = vehicle.year.is_some_and(|year| {
                self.rules.min_year.map_or(true, |min| year >= min)
                    && self.rules.max_year.map_or(true, |max| year <= max)
            });
            if !in_range {
                return Err(Rejection::YearOutOfRange);
            }
        }

        Ok(())
    }

    pub fn filter<'a>(&self, inventory: &'a [InventoryVehicle]) -> Vec<&'a InventoryVehicle> {
        inventory.iter().filter(|v| self.evaluate(v).is_ok()).collect()
    }

    /// `filter(inventory) \ logged`, by upper-cased VIN. Repeated VINs in the
    /// inventory are counted once: the first passing row is kept, and a VIN
    /// counts as rejected (for its first row's reason) only when no row passes.
    pub fn difference(
        &self,
        inventory: Vec<InventoryVehicle>,
        logged: &HashSet<String>,
    ) -> CaoOutcome {
        let mut outcome = CaoOutcome {
            inventory_count: inventory.len(),
            ..Default::default()
        };
        let mut seen = HashSet::new();
        let mut passed = HashSet::new();
        let mut rejected: HashMap<String, Rejection> = HashMap::new();

        for vehicle in inventory {
            let key = vehicle.vin.trim().to_ascii_uppercase();
            if !seen.insert(key.clone()) {
                outcome.duplicate_vins += 1;
            }
            if let Err(reason) = self.evaluate(&vehicle) {
                rejected.entry(key).or_insert(reason);
                continue;
            }
            if !passed.insert(key.clone()) {
                continue;
            }
            outcome.passed_filters += 1;
            if logged.contains(&key) {
                outcome.already_logged += 1;
            } else {
                outcome.new_vehicles.push(vehicle);
            }
        }

        for (key, reason) in rejected {
            if !passed.contains(&key) {
                *outcome.rejections.entry(reason).or_default() += 1;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle(vin: &str, condition: Option<VehicleCondition>) -> InventoryVehicle {
        InventoryVehicle {
            raw_data_id: 1,
            import_id: 1,
            vin: vin.to_string(),
            stock: Some(format!("S-{vin}")),
            condition,
            lot_status: LotStatus::OnLot,
            status: Some("In Stock".into()),
            price: Some(25_000.0),
            year: Some(2022),
            make: Some("Honda".into()),
            model: Some("Accord".into()),
            trim: None,
            location: "Columbia Honda".into(),
            date_in_stock: None,
        }
    }

    fn used_only() -> FilteringRules {
        FilteringRules {
            vehicle_types: vec!["used".into()],
            ..Default::default()
        }
    }

    #[test]
    fn condition_allow_and_exclude_lists() {
        let engine = CaoEngine::new(FilteringRules {
            vehicle_types: vec!["used".into()],
            exclude_conditions: vec!["cpo".into()],
            ..Default::default()
        });
        assert_eq!(
            engine.evaluate(&vehicle("A", Some(VehicleCondition::New))),
            Err(Rejection::ConditionNotAllowed)
        );
        assert_eq!(
            engine.evaluate(&vehicle("B", Some(VehicleCondition::Certified))),
            Err(Rejection::ConditionExcluded)
        );
        assert_eq!(engine.evaluate(&vehicle("C", Some(VehicleCondition::PreOwned))), Ok(()));
        assert_eq!(engine.evaluate(&vehicle("D", None)), Err(Rejection::MissingCondition));
    }

    #[test]
    fn unrestricted_rules_admit_unknown_condition() {
        let engine = CaoEngine::new(FilteringRules::default());
        assert_eq!(engine.evaluate(&vehicle("A", None)), Ok(()));
    }

    #[test]
    fn lot_stock_and_status_conjuncts() {
        let engine = CaoEngine::new(FilteringRules {
            exclude_status: vec!["Sold".into()],
            ..Default::default()
        });
        let mut off_lot = vehicle("A", Some(VehicleCondition::New));
        off_lot.lot_status = LotStatus::OffLot;
        assert_eq!(engine.evaluate(&off_lot), Err(Rejection::OffLot));

        let mut no_stock = vehicle("B", Some(VehicleCondition::New));
        no_stock.stock = Some("  ".into());
        assert_eq!(engine.evaluate(&no_stock), Err(Rejection::MissingStock));

        let mut sold = vehicle("C", Some(VehicleCondition::New));
        sold.status = Some(" sold ".into());
        assert_eq!(engine.evaluate(&sold), Err(Rejection::ExcludedStatus));

        let relaxed = CaoEngine::new(FilteringRules {
            require_on_lot: false,
            require_stock: false,
            ..Default::default()
        });
        assert_eq!(relaxed.evaluate(&off_lot), Ok(()));
        assert_eq!(relaxed.evaluate(&no_stock), Ok(()));
    }

    #[test]
    fn price_rules() {
        let engine = CaoEngine::new(FilteringRules {
            min_price: Some(5_000.0),
            exclude_price_placeholders: true,
            ..Default::default()
        });
        let mut placeholder = vehicle("A", Some(VehicleCondition::New));
        placeholder.price = Some(1.0);
        assert_eq!(engine.evaluate(&placeholder), Err(Rejection::PricePlaceholder));

        let mut cheap = vehicle("B", Some(VehicleCondition::New));
        cheap.price = Some(4_999.0);
        assert_eq!(engine.evaluate(&cheap), Err(Rejection::BelowMinPrice));

        let mut unpriced = vehicle("C", Some(VehicleCondition::New));
        unpriced.price = None;
        assert_eq!(engine.evaluate(&unpriced), Err(Rejection::MissingPrice));

        let lenient = CaoEngine::new(FilteringRules::default());
        assert_eq!(lenient.evaluate(&unpriced), Ok(()));
    }

    #[test]
    fn year_range() {
        let engine = CaoEngine::new(FilteringRules {
            min_year: Some(2020),
            max_year: Some(2023),
            ..Default::default()
        });
        let mut old = vehicle("A", Some(VehicleCondition::PreOwned));
        old.year = Some(2015);
        assert_eq!(engine.evaluate(&old), Err(Rejection::YearOutOfRange));
        old.year = None;
        assert_eq!(engine.evaluate(&old), Err(Rejection::YearOutOfRange));
        old.year = Some(2021);
        assert_eq!(engine.evaluate(&old), Ok(()));
    }

    #[test]
    fn difference_is_filtered_inventory_minus_log() {
        let engine = CaoEngine::new(used_only());
        let inventory = vec![
            vehicle("VIN1", Some(VehicleCondition::PreOwned)),
            vehicle("VIN2", Some(VehicleCondition::Certified)),
            vehicle("VIN3", Some(VehicleCondition::New)),
            vehicle("VIN4", Some(VehicleCondition::PreOwned)),
        ];
        let logged: HashSet<String> = ["VIN2".to_string(), "VIN3".to_string()].into();

        let filtered: HashSet<String> = engine
            .filter(&inventory)
            .into_iter()
            .map(|v| v.vin.clone())
            .collect();
        let expected: HashSet<String> = filtered.difference(&logged).cloned().collect();

        let outcome = engine.difference(inventory, &logged);
        let actual: HashSet<String> = outcome.new_vehicles.iter().map(|v| v.vin.clone()).collect();
        assert_eq!(actual, expected);
        assert_eq!(outcome.inventory_count, 4);
        assert_eq!(outcome.passed_filters, 3);
        assert_eq!(outcome.already_logged, 1);
        assert_eq!(outcome.rejections.get(&Rejection::ConditionNotAllowed), Some(&1));
    }

    #[test]
    fn difference_is_idempotent() {
        let engine = CaoEngine::new(used_only());
        let inventory = vec![
            vehicle("VIN1", Some(VehicleCondition::PreOwned)),
            vehicle("VIN5", Some(VehicleCondition::Certified)),
        ];
        let logged = HashSet::from(["VIN1".to_string()]);
        let first = engine.difference(inventory.clone(), &logged);
        let second = engine.difference(inventory, &logged);
        assert_eq!(first.new_vehicles, second.new_vehicles);
        assert_eq!(first.rejections, second.rejections);
    }

    #[test]
    fn vin_matching_ignores_case_and_duplicates() {
        let engine = CaoEngine::new(FilteringRules::default());
        let inventory = vec![
            vehicle("abc123", Some(VehicleCondition::New)),
            vehicle("ABC123", Some(VehicleCondition::New)),
            vehicle("xyz789", Some(VehicleCondition::New)),
        ];
        let logged = HashSet::from(["XYZ789".to_string()]);
        let outcome = engine.difference(inventory, &logged);
        assert_eq!(outcome.duplicate_vins, 1);
        assert_eq!(outcome.already_logged, 1);
        assert_eq!(outcome.new_vehicles.len(), 1);
        assert_eq!(outcome.new_vehicles[0].vin, "abc123");
    }

    #[test]
    fn later_passing_row_wins_over_earlier_rejected_duplicate() {
        let engine = CaoEngine::new(FilteringRules::default());
        let mut in_transit = vehicle("VIN1", Some(VehicleCondition::New));
        in_transit.lot_status = LotStatus::OffLot;
        let on_lot = vehicle("vin1", Some(VehicleCondition::New));
        let inventory = vec![in_transit, on_lot];

        let filtered: HashSet<String> = engine
            .filter(&inventory)
            .into_iter()
            .map(|v| v.vin.to_ascii_uppercase())
            .collect();
        let outcome = engine.difference(inventory, &HashSet::new());
        let actual: HashSet<String> = outcome
            .new_vehicles
            .iter()
            .map(|v| v.vin.to_ascii_uppercase())
            .collect();

        assert_eq!(actual, filtered);
        assert_eq!(outcome.new_vehicles[0].lot_status, LotStatus::OnLot);
        assert_eq!(outcome.passed_filters, 1);
        assert_eq!(outcome.duplicate_vins, 1);
        assert!(outcome.rejections.is_empty());
    }

    #[test]
    fn vin_rejected_on_every_row_is_counted_once() {
        let engine = CaoEngine::new(FilteringRules::default());
        let mut first = vehicle("VIN7", Some(VehicleCondition::New));
        first.lot_status = LotStatus::OffLot;
        let mut second = vehicle("VIN7", Some(VehicleCondition::New));
        second.stock = None;
        let outcome = engine.difference(vec![first, second], &HashSet::new());
        assert!(outcome.new_vehicles.is_empty());
        assert_eq!(outcome.rejections.get(&Rejection::OffLot), Some(&1));
        assert_eq!(outcome.rejections.get(&Rejection::MissingStock), None);
    }
}
