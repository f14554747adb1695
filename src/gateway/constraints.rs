//! Constraint resolution: given a product type's declared provider
//! constraint records and a set of caller-supplied fixed parameters,
//! determine the remaining allowed values for every other queryable.
//!
//! A constraint record is a row mapping provider-facing keys to the
//! single values that are jointly selectable together (the provider's
//! "this processing level is only available with this sensor mode"
//! kind of rule). Resolution narrows the row set to those matching the
//! fixed parameters, then unions the remaining columns.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{EodagError, Result};
use crate::model::Queryables;

pub type ConstraintRecord = BTreeMap<String, Value>;

/// Resolves allowed values for every queryable not already pinned by
/// `fixed_params`, against a provider's constraint table.
///
/// `fixed_params` keys are user-facing queryable names; they are
/// translated to provider keys via `queryables` before matching. An
/// unknown fixed parameter is a `ValidationError`, not a silent no-op.
pub fn resolve_constraints(
    constraints: &[ConstraintRecord],
    queryables: &Queryables,
    fixed_params: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, BTreeSet<Value>>> {
    let mut provider_fixed: BTreeMap<String, Value> = BTreeMap::new();
    for (key, value) in fixed_params {
        let (_, annotation) = queryables
            .get_by_provider_key(key)
            .or_else(|| queryables.properties.get_key_value(key).map(|(k, v)| (k.as_str(), v)))
            .ok_or_else(|| EodagError::validation(format!("unknown queryable parameter: {key}")))?;
        let provider_key = annotation.alias.clone().unwrap_or_else(|| key.clone());
        provider_fixed.insert(provider_key, value.clone());
    }

    let matching: Vec<&ConstraintRecord> = constraints
        .iter()
        .filter(|record| provider_fixed.iter().all(|(key, value)| record.get(key).map(|v| v == value).unwrap_or(false)))
        .collect();

    if matching.is_empty() && !constraints.is_empty() {
        let allowed = describe_allowed_combinations(constraints, &provider_fixed);
        return Err(EodagError::validation(format!(
            "no constraint combination matches the given fixed parameters; allowed combinations: {allowed}"
        )));
    }

    let mut allowed_values: BTreeMap<String, BTreeSet<Value>> = BTreeMap::new();
    for record in matching {
        for (key, value) in record {
            if provider_fixed.contains_key(key) {
                continue;
            }
            allowed_values.entry(key.clone()).or_default().insert(value.clone());
        }
    }
    Ok(allowed_values)
}

fn describe_allowed_combinations(constraints: &[ConstraintRecord], fixed: &BTreeMap<String, Value>) -> String {
    let relevant_keys: BTreeSet<&String> = fixed.keys().collect();
    let mut seen = BTreeSet::new();
    for record in constraints {
        let combo: Vec<String> = relevant_keys
            .iter()
            .filter_map(|key| record.get(key.as_str()).map(|v| format!("{key}={v}")))
            .collect();
        if !combo.is_empty() {
            seen.insert(combo.join(", "));
        }
    }
    seen.into_iter().collect::<Vec<_>>().join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<ConstraintRecord> {
        vec![
            BTreeMap::from([
                ("sensorMode".to_string(), Value::String("SM".to_string())),
                ("processingLevel".to_string(), Value::String("L1".to_string())),
                ("polarisation".to_string(), Value::String("HH".to_string())),
            ]),
            BTreeMap::from([
                ("sensorMode".to_string(), Value::String("IW".to_string())),
                ("processingLevel".to_string(), Value::String("L1".to_string())),
                ("polarisation".to_string(), Value::String("VV".to_string())),
            ]),
            BTreeMap::from([
                ("sensorMode".to_string(), Value::String("IW".to_string())),
                ("processingLevel".to_string(), Value::String("L2".to_string())),
                ("polarisation".to_string(), Value::String("VV+VH".to_string())),
            ]),
        ]
    }

    fn queryables() -> Queryables {
        let mut q = Queryables::default();
        for key in ["sensorMode", "processingLevel", "polarisation"] {
            q.properties.insert(
                key.to_string(),
                crate::model::QueryableAnnotation {
                    base_type: "string".to_string(),
                    alias: None,
                    default: None,
                    required: false,
                    description: None,
                },
            );
        }
        q
    }

    #[test]
    fn narrows_to_matching_rows_and_unions_remaining_columns() {
        let fixed = BTreeMap::from([("sensorMode".to_string(), Value::String("IW".to_string()))]);
        let allowed = resolve_constraints(&records(), &queryables(), &fixed).unwrap();
        let levels: BTreeSet<Value> = allowed["processingLevel"].clone();
        assert_eq!(levels, BTreeSet::from([Value::String("L1".to_string()), Value::String("L2".to_string())]));
    }

    #[test]
    fn unknown_fixed_parameter_is_a_validation_error() {
        let fixed = BTreeMap::from([("notAQueryable".to_string(), Value::String("x".to_string()))]);
        let err = resolve_constraints(&records(), &queryables(), &fixed).unwrap_err();
        assert!(matches!(err, EodagError::Validation { .. }));
    }

    #[test]
    fn impossible_combination_reports_allowed_combinations() {
        let fixed = BTreeMap::from([
            ("sensorMode".to_string(), Value::String("SM".to_string())),
            ("processingLevel".to_string(), Value::String("L2".to_string())),
        ]);
        let err = resolve_constraints(&records(), &queryables(), &fixed).unwrap_err();
        match err {
            EodagError::Validation { message } => assert!(message.contains("allowed combinations")),
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }
}
