//! Cross-field constraint filtering, used by UpdateBuffer.
//!
//! Grounded on `local_tuya/device/constraints.py`'s `Constraints.filter_values`.

use std::collections::HashMap;

use crate::value::{Value, Values};

/// What a constraint forbids for one datapoint while its trigger is active.
#[derive(Debug, Clone)]
pub enum Forbidden {
    All,
    Values(Vec<Value>),
}

impl Forbidden {
    fn union(self, other: &Forbidden) -> Forbidden {
        match (self, other) {
            (Forbidden::All, _) | (_, Forbidden::All) => Forbidden::All,
            (Forbidden::Values(mut a), Forbidden::Values(b)) => {
                for v in b {
                    if !a.contains(v) {
                        a.push(v.clone());
                    }
                }
                Forbidden::Values(a)
            }
        }
    }
}

/// A rule: when `trigger_key` holds `trigger_value`, every `(key, Forbidden)`
/// pair in `forbidden` becomes active.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub trigger_key: String,
    pub trigger_value: Value,
    pub forbidden: Vec<(String, Forbidden)>,
}

impl Constraint {
    pub fn new(trigger_key: impl Into<String>, trigger_value: impl Into<Value>, forbidden: Vec<(String, Forbidden)>) -> Self {
        Self {
            trigger_key: trigger_key.into(),
            trigger_value: trigger_value.into(),
            forbidden,
        }
    }

    fn is_active(&self, context: &Values) -> bool {
        context.get(&self.trigger_key) == Some(&self.trigger_value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Constraints(Vec<Constraint>);

impl Constraints {
    pub fn new(constraints: Vec<Constraint>) -> Self {
        Self(constraints)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only the entries of `candidate` that no active constraint
    /// blacklists, where "active" is judged against `context` (the merged
    /// current-state + pending-update view). Unknown datapoints always pass
    /// through.
    pub fn filter(&self, candidate: &Values, context: &Values) -> Values {
        let mut blacklist: HashMap<String, Forbidden> = HashMap::new();
        for constraint in &self.0 {
            if !constraint.is_active(context) {
                continue;
            }
            for (key, forbidden) in &constraint.forbidden {
                blacklist
                    .entry(key.clone())
                    .and_modify(|existing| {
                        let taken = std::mem::replace(existing, Forbidden::All);
                        *existing = taken.union(forbidden);
                    })
                    .or_insert_with(|| forbidden.clone());
            }
        }

        candidate
            .iter()
            .filter(|(key, value)| match blacklist.get(key.as_str()) {
                None => true,
                Some(Forbidden::All) => false,
                Some(Forbidden::Values(forbidden_values)) => !forbidden_values.contains(value),
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value;

    fn values(pairs: &[(&str, &str)]) -> Values {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::String(v.to_string()))).collect()
    }

    fn dehumidifier_constraints() -> Constraints {
        Constraints::new(vec![Constraint::new(
            "mode",
            "auto",
            vec![
                ("fan".into(), Forbidden::Values(vec![Value::from("turbo")])),
                ("set_point".into(), Forbidden::All),
            ],
        )])
    }

    #[test]
    fn inactive_constraint_passes_everything_through() {
        let constraints = dehumidifier_constraints();
        let current = values(&[("mode", "auto"), ("fan", "low"), ("set_point", "22")]);
        let candidate = values(&[("fan", "turbo"), ("set_point", "24"), ("mode", "cool")]);
        let merged: Values = value::merge(&current, &candidate);

        let filtered = constraints.filter(&candidate, &merged);
        assert_eq!(filtered, candidate);
    }

    #[test]
    fn active_constraint_blocks_forbidden_fields() {
        let constraints = dehumidifier_constraints();
        let current = values(&[("mode", "auto"), ("fan", "low"), ("set_point", "22")]);
        let candidate = values(&[("fan", "turbo"), ("set_point", "24")]);

        let filtered = constraints.filter(&candidate, &current);
        assert!(filtered.is_empty());
    }

    #[test]
    fn unknown_datapoints_are_never_blacklisted() {
        let constraints = dehumidifier_constraints();
        let current = values(&[("mode", "auto")]);
        let candidate = values(&[("humidity_target", "50")]);

        let filtered = constraints.filter(&candidate, &current);
        assert_eq!(filtered, candidate);
    }
}
