//! Random hyperparameter search: one parent config with an `hpsearch` section expands into
//! `n_trials` child configs.
//!
//! ```yaml
//! hpsearch:
//!   type: random_uniform
//!   n_trials: 3
//!   desc: lr_search
//!   params:
//!     - param: optimizer.lr
//!       lo: -5
//!       hi: -1
//!       exponent_base: 10
//! ```

use rand::Rng;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::debug;

pub const SWEEP_KEY: &str = "hpsearch";

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Config has no {SWEEP_KEY} section")]
    Missing,
    #[error("Invalid {SWEEP_KEY} section")]
    Parse(#[from] serde_yaml::Error),
    #[error("Config was itself generated by a search and cannot be expanded again")]
    AlreadyChild,
    #[error("Empty range for {param}: lo {lo} is greater than hi {hi}")]
    EmptyRange { param: String, lo: f64, hi: f64 },
    #[error("Cannot set {path}, `{key}` is not a mapping")]
    NotAMapping { path: String, key: String },
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum SearchKind {
    RandomUniform,
}

#[derive(Deserialize, Debug)]
struct SearchSection {
    #[serde(rename = "type")]
    kind: SearchKind,
    n_trials: usize,
    #[serde(default = "default_desc")]
    desc: String,
    #[serde(default)]
    is_child: bool,
    #[serde(default)]
    params: Vec<ParamRange>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct ParamRange {
    param: String,
    lo: f64,
    hi: f64,
    exponent_base: Option<f64>,
}

fn default_desc() -> String {
    SWEEP_KEY.to_owned()
}

impl ParamRange {
    fn draw<R: Rng>(&self, rng: &mut R) -> f64 {
        let value = rng.gen_range(self.lo..=self.hi);

        match self.exponent_base {
            Some(base) => base.powf(value),
            None => value,
        }
    }
}

pub fn is_sweep(config: &Value) -> bool {
    config.get(SWEEP_KEY).is_some()
}

/// Generate the `(name, config)` pairs of all trials, named `<parent>_<desc>_<index>`
pub fn generate<R: Rng>(
    parent: &Value,
    parent_name: &str,
    rng: &mut R,
) -> Result<Vec<(String, Value)>, SweepError> {
    let section = parent.get(SWEEP_KEY).ok_or(SweepError::Missing)?;
    let search: SearchSection = serde_yaml::from_value(section.clone())?;

    if search.is_child {
        return Err(SweepError::AlreadyChild);
    }
    let SearchKind::RandomUniform = search.kind;

    for range in search.params.iter() {
        if range.lo > range.hi {
            return Err(SweepError::EmptyRange {
                param: range.param.clone(),
                lo: range.lo,
                hi: range.hi,
            });
        }
    }

    (0..search.n_trials)
        .map(|trial| {
            let mut child = parent.clone();
            set_item_at_path(&mut child, &format!("{SWEEP_KEY}.is_child"), Value::Bool(true))?;

            for range in search.params.iter() {
                let value = range.draw(rng);
                debug!(trial = trial, param = %range.param, value = value, "Drew parameter");
                set_item_at_path(&mut child, &range.param, Value::from(value))?;
            }

            Ok((format!("{parent_name}_{}_{trial}", search.desc), child))
        })
        .collect()
}

/// Set a dotted `path` such as `optimizer.lr`, creating missing intermediate mappings
pub fn set_item_at_path(config: &mut Value, path: &str, value: Value) -> Result<(), SweepError> {
    let not_a_mapping = |key: &str| SweepError::NotAMapping {
        path: path.to_owned(),
        key: key.to_owned(),
    };

    let (parents, leaf) = match path.rsplit_once('.') {
        Some((parents, leaf)) => (parents.split('.').collect::<Vec<_>>(), leaf),
        None => (Vec::new(), path),
    };

    let mut current = config;
    for key in parents {
        let Value::Mapping(mapping) = current else {
            return Err(not_a_mapping(key));
        };
        current = mapping
            .entry(Value::from(key))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }

    match current {
        Value::Mapping(mapping) => {
            mapping.insert(Value::from(leaf), value);
            Ok(())
        }
        _ => Err(not_a_mapping(leaf)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    const PARENT: &str = "
training:
  num_epochs: 2
optimizer:
  name: sgd
hpsearch:
  type: random_uniform
  n_trials: 4
  desc: lr
  params:
    - param: optimizer.lr
      lo: -4
      hi: -1
      exponent_base: 10
    - param: model.dropout
      lo: 0.1
      hi: 0.5
";

    #[test]
    fn trials_are_named_and_drawn_in_range() {
        let parent: Value = serde_yaml::from_str(PARENT).unwrap();
        let trials = generate(&parent, "base", &mut StdRng::seed_from_u64(7)).unwrap();

        assert_eq!(
            trials.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
            vec!["base_lr_0", "base_lr_1", "base_lr_2", "base_lr_3"]
        );

        for (_, child) in trials.iter() {
            let lr = child["optimizer"]["lr"].as_f64().unwrap();
            let dropout = child["model"]["dropout"].as_f64().unwrap();

            assert!((1e-4..=1e-1).contains(&lr), "{lr}");
            assert!((0.1..=0.5).contains(&dropout), "{dropout}");
            assert_eq!(child["optimizer"]["name"].as_str(), Some("sgd"));
            assert_eq!(child["hpsearch"]["is_child"].as_bool(), Some(true));
        }

        // the parent is untouched
        assert!(parent["optimizer"].get("lr").is_none());
    }

    #[test]
    fn children_cannot_be_expanded_again() {
        let parent: Value = serde_yaml::from_str(PARENT).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let (_, child) = generate(&parent, "base", &mut rng).unwrap().remove(0);

        assert!(matches!(
            generate(&child, "child", &mut rng),
            Err(SweepError::AlreadyChild)
        ));
    }

    #[test]
    fn invalid_sections_are_rejected() {
        let mut rng = StdRng::seed_from_u64(1);

        let unknown: Value =
            serde_yaml::from_str("hpsearch:\n  type: grid\n  n_trials: 2\n").unwrap();
        assert!(matches!(
            generate(&unknown, "x", &mut rng),
            Err(SweepError::Parse(_))
        ));

        let empty: Value = serde_yaml::from_str(
            "hpsearch:\n  type: random_uniform\n  n_trials: 2\n  params:\n    - {param: a, lo: 2, hi: 1}\n",
        )
        .unwrap();
        assert!(matches!(
            generate(&empty, "x", &mut rng),
            Err(SweepError::EmptyRange { .. })
        ));

        assert!(matches!(
            generate(&Value::Null, "x", &mut rng),
            Err(SweepError::Missing)
        ));
    }

    #[test]
    fn set_item_at_path_creates_and_refuses() {
        let mut config: Value = serde_yaml::from_str("a:\n  b: 1\n").unwrap();

        set_item_at_path(&mut config, "a.c.d", Value::from(2)).unwrap();
        set_item_at_path(&mut config, "top", Value::from("x")).unwrap();

        assert_eq!(config["a"]["b"].as_u64(), Some(1));
        assert_eq!(config["a"]["c"]["d"].as_u64(), Some(2));
        assert_eq!(config["top"].as_str(), Some("x"));
        assert!(matches!(
            set_item_at_path(&mut config, "a.b.c", Value::from(3)),
            Err(SweepError::NotAMapping { .. })
        ));
    }
}
