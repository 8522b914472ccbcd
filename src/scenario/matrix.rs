//! Generalized option-matrix expansion
//!
//! The four-dimensional scenario matrix is a special case of a more general
//! problem: providers describe their flavor options as an arbitrarily nested
//! map of option-name → list-of-values, and flavor files are generated ahead
//! of time for every combination. [`expand`] walks such a tree (nested maps
//! group options, lists enumerate choices, scalars are a single choice) and
//! produces the cartesian product of all leaf choices, each with a
//! deterministic flattened name.

use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::error::Error;

/// One combination of leaf choices out of an option tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combination {
    /// Sorted `key-value` segments joined by `_`; stable across runs and
    /// usable as a file name
    pub name: String,
    /// The chosen value per leaf option
    pub choices: BTreeMap<String, String>,
}

/// Expand a nested option tree into the cartesian product of its leaves.
///
/// Leaf options and their values are both gathered in sorted order, so the
/// output ordering and every combination name are deterministic for a given
/// tree regardless of how the input file orders them.
pub fn expand(tree: &Value) -> Result<Vec<Combination>, Error> {
    let mut leaves = Vec::new();
    collect_leaves(tree, &mut leaves)?;
    leaves.sort_by(|a, b| a.0.cmp(&b.0));

    let mut combinations = vec![BTreeMap::new()];
    for (key, values) in &leaves {
        let mut next = Vec::with_capacity(combinations.len() * values.len());
        for combination in &combinations {
            for value in values {
                let mut extended: BTreeMap<String, String> = combination.clone();
                extended.insert(key.clone(), value.clone());
                next.push(extended);
            }
        }
        combinations = next;
    }

    Ok(combinations
        .into_iter()
        .map(|choices| Combination {
            name: flattened_name(&choices),
            choices,
        })
        .collect())
}

fn collect_leaves(tree: &Value, leaves: &mut Vec<(String, Vec<String>)>) -> Result<(), Error> {
    let mapping = tree
        .as_mapping()
        .ok_or_else(|| Error::config("option tree root must be a mapping"))?;

    for (key, value) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| Error::config("option names must be strings"))?
            .to_string();

        match value {
            Value::Mapping(_) => collect_leaves(value, leaves)?,
            Value::Sequence(seq) => {
                if seq.is_empty() {
                    return Err(Error::config(format!("option {key:?} has no values")));
                }
                let mut values = seq
                    .iter()
                    .map(|v| scalar_to_string(&key, v))
                    .collect::<Result<Vec<_>, _>>()?;
                values.sort();
                leaves.push((key, values));
            }
            other => {
                // A bare scalar is a single fixed choice
                leaves.push((key.clone(), vec![scalar_to_string(&key, other)?]));
            }
        }
    }

    Ok(())
}

fn scalar_to_string(key: &str, value: &Value) -> Result<String, Error> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(Error::config(format!(
            "option {key:?} has a non-scalar value"
        ))),
    }
}

fn flattened_name(choices: &BTreeMap<String, String>) -> String {
    choices
        .iter()
        .map(|(k, v)| format!("{k}-{v}"))
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn two_by_two_options_expand_to_four_combinations() {
        let combos = expand(&tree(
            r#"
            os: [ubuntu, flatcar]
            disk: [ssd, hdd]
            "#,
        ))
        .unwrap();

        assert_eq!(combos.len(), 4);
        let names: Vec<&str> = combos.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"disk-ssd_os-ubuntu"));
        assert!(names.contains(&"disk-hdd_os-flatcar"));
    }

    #[test]
    fn nested_maps_group_options_without_affecting_names() {
        let combos = expand(&tree(
            r#"
            network:
              cni: [cilium, canal]
            os: [ubuntu]
            "#,
        ))
        .unwrap();

        assert_eq!(combos.len(), 2);
        // Leaf keys flatten regardless of nesting depth
        assert_eq!(combos[0].name, "cni-canal_os-ubuntu");
        assert_eq!(combos[1].name, "cni-cilium_os-ubuntu");
    }

    #[test]
    fn scalars_and_numbers_are_single_fixed_choices() {
        let combos = expand(&tree(
            r#"
            replicas: 3
            os: [ubuntu, flatcar]
            "#,
        ))
        .unwrap();

        assert_eq!(combos.len(), 2);
        for combo in &combos {
            assert_eq!(combo.choices["replicas"], "3");
        }
    }

    #[test]
    fn names_are_sorted_and_deterministic_across_runs() {
        let input = tree(
            r#"
            zone: [a, b]
            arch: [amd64]
            "#,
        );
        let first = expand(&input).unwrap();
        let second = expand(&input).unwrap();
        assert_eq!(first, second);
        // "arch" sorts before "zone" no matter the input order
        assert!(first[0].name.starts_with("arch-amd64_zone-"));
    }

    #[test]
    fn empty_value_list_is_rejected() {
        assert!(expand(&tree("os: []")).is_err());
    }

    #[test]
    fn non_mapping_root_is_rejected() {
        assert!(expand(&tree("[a, b]")).is_err());
    }
}
