//! Hyperparameter resolution: fixed presets or seeded samples.
//!
//! The preset table is an immutable value built once at start-up and handed
//! to a [`Resolver`] by reference. Sampling draws only from the generator it
//! is given, so the same seed always resolves to the same record.

use crate::error::{LabError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Optimizer and schedule coefficients of one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterRecord {
    pub beta_1: f64,
    pub beta_2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    pub max_lr: f64,
    /// Fraction of scheduled steps spent ramping up to `max_lr`.
    pub cycle_peak: f64,
}

impl HyperparameterRecord {
    pub fn new(
        beta_1: f64,
        beta_2: f64,
        eps: f64,
        weight_decay: f64,
        max_lr: f64,
        cycle_peak: f64,
    ) -> Result<Self> {
        let record = Self {
            beta_1,
            beta_2,
            eps,
            weight_decay,
            max_lr,
            cycle_peak,
        };
        record.validate()?;
        Ok(record)
    }

    /// Build from base-10 exponents of the first five fields.
    pub fn from_log10(exponents: [f64; 5], cycle_peak: f64) -> Result<Self> {
        let [b1, b2, eps, wd, lr] = exponents.map(|e| 10f64.powf(e));
        Self::new(b1, b2, eps, wd, lr, cycle_peak)
    }

    /// Build from natural-log exponents of the first five fields.
    pub fn from_ln(exponents: [f64; 5], cycle_peak: f64) -> Result<Self> {
        let [b1, b2, eps, wd, lr] = exponents.map(f64::exp);
        Self::new(b1, b2, eps, wd, lr, cycle_peak)
    }

    /// Check every field against its legal range.
    pub fn validate(&self) -> Result<()> {
        let open_unit = |v: f64| v > 0.0 && v < 1.0;
        let checks: [(&'static str, f64, bool); 6] = [
            ("beta_1", self.beta_1, open_unit(self.beta_1)),
            ("beta_2", self.beta_2, open_unit(self.beta_2)),
            ("eps", self.eps, self.eps > 0.0 && self.eps.is_finite()),
            (
                "weight_decay",
                self.weight_decay,
                self.weight_decay >= 0.0 && self.weight_decay.is_finite(),
            ),
            ("max_lr", self.max_lr, self.max_lr > 0.0 && self.max_lr.is_finite()),
            ("cycle_peak", self.cycle_peak, open_unit(self.cycle_peak)),
        ];
        for (field, value, ok) in checks {
            if !ok {
                return Err(LabError::InvalidHyperparameter { field, value });
            }
        }
        Ok(())
    }
}

/// Key of a preset in the fixed table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HyperparamKey {
    Grid(u32),
    Activation(String),
}

impl fmt::Display for HyperparamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grid(id) => write!(f, "{id}"),
            Self::Activation(name) => f.write_str(name),
        }
    }
}

/// How a run obtains its hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SelectionMode {
    Fixed { key: HyperparamKey },
    Sampled,
}

impl SelectionMode {
    /// Label written to the metrics log.
    pub fn label(&self) -> String {
        match self {
            Self::Fixed { key } => key.to_string(),
            Self::Sampled => "sampled".to_string(),
        }
    }
}

/// Grid presets: id, base-10 exponents of (beta_1, beta_2, eps, wd, max_lr), cycle peak.
const GRID_PRESETS: [(u32, [f64; 5], f64); 21] = [
    (0, [-1.891, -0.628, -7.962, -3.985, -3.352], 0.32),
    (1, [-2.279, -1.179, -8.279, -3.921, -3.33], 0.38),
    (2, [-2.252, -1.079, -7.949, -3.923, -3.316], 0.42),
    (3, [-2.152, -1.158, -8.025, -4.065, -3.326], 0.36),
    (4, [-2.294, -1.112, -8.357, -3.936, -3.357], 0.35),
    (5, [-2.081, -0.759, -7.939, -3.91, -3.372], 0.37),
    (6, [-2.068, -1.125, -8.13, -4.022, -3.22], 0.4),
    (7, [-1.709, -1.793, -7.909, -4.086, -3.223], 0.32),
    (8, [-1.906, -0.865, -8.285, -4.044, -3.31], 0.38),
    (9, [-2.142, -0.718, -8.066, -3.874, -3.334], 0.44),
    (10, [-1.6402, -0.9021, -8.4447, -4.171, -3.4708], 0.293),
    (11, [-1.091, -0.88, -8.605, -3.792, -3.564], 0.23),
    (12, [-0.39, -1.253, -8.885, -5.256, -3.944], 0.15),
    (13, [-0.603, -0.588, -9.036, -5.207, -3.569], 0.22),
    (14, [-1.902, -0.554, -8.439, -4.137, -3.617], 0.24),
    (15, [-0.853, -0.57, -8.928, -4.647, -3.585], 0.22),
    (16, [-0.854, -0.787, -8.971, -4.379, -3.611], 0.21),
    (17, [-1.969, -0.895, -8.622, -4.043, -3.574], 0.23),
    (18, [-1.244, -0.736, -8.698, -4.397, -3.604], 0.2),
    (19, [-1.617, -0.608, -8.876, -4.475, -3.588], 0.2),
    (20, [-1.507, -0.755, -8.933, -3.953, -3.619], 0.22),
];

/// Per-activation presets: natural-log exponents, same field order.
const ACTIVATION_PRESETS: [(&str, [f64; 5], f64); 9] = [
    (
        "relu",
        [-2.375018573261741, -6.565065478550015, -19.607731090387627, -11.86635747404571, -5.7662952418075175],
        0.2935155263985412,
    ),
    (
        "cf_relu",
        [-4.44857338551192, -4.669825410890087, -17.69933166220988, -12.283288733512373, -8.563504990329884],
        0.10393251332079881,
    ),
    (
        "multi_relu",
        [-2.859441513546877, -5.617992566623951, -20.559015044774018, -12.693844976989661, -5.802816398828524],
        0.28499869111025217,
    ),
    (
        "combinact",
        [-2.6436039683427253, -7.371516988658699, -16.989022147994522, -12.113778466374383, -5.211973674318645],
        0.4661308739740898,
    ),
    (
        "l2",
        [-2.244614412525641, -5.502197648895974, -16.919215725249092, -13.99956243808541, -5.383090612225605],
        0.35037784343793205,
    ),
    (
        "abs",
        [-3.1576858739457845, -4.165206705873042, -20.430988799955056, -13.049933891070697, -5.809683797646132],
        0.34244342851740034,
    ),
    (
        "cf_abs",
        [-5.453380890632929, -5.879222236954101, -18.303333640483068, -15.152599023560422, -6.604045812173043],
        0.11189158130301018,
    ),
    (
        "l2_lae",
        [-2.4561852034212, -5.176943480470942, -16.032458209235187, -12.860274699438266, -5.540947578537945],
        0.40750994546983904,
    ),
    (
        "max",
        [-2.2169207045481505, -7.793567052557596, -18.23187258333265, -12.867866026516422, -5.416840501318637],
        0.28254869607601146,
    ),
];

/// Immutable preset lookup.
#[derive(Debug, Clone, Default)]
pub struct HyperparamTable {
    presets: BTreeMap<HyperparamKey, HyperparameterRecord>,
}

impl HyperparamTable {
    /// The built-in grid and per-activation presets.
    pub fn builtin() -> Result<Self> {
        let mut presets = BTreeMap::new();
        for (id, exponents, peak) in GRID_PRESETS {
            presets.insert(
                HyperparamKey::Grid(id),
                HyperparameterRecord::from_log10(exponents, peak)?,
            );
        }
        for (name, exponents, peak) in ACTIVATION_PRESETS {
            presets.insert(
                HyperparamKey::Activation(name.to_string()),
                HyperparameterRecord::from_ln(exponents, peak)?,
            );
        }
        Ok(Self { presets })
    }

    pub fn get(&self, key: &HyperparamKey) -> Result<&HyperparameterRecord> {
        self.presets.get(key).ok_or_else(|| LabError::UnknownKey {
            key: key.to_string(),
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &HyperparamKey> {
        self.presets.keys()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

/// Exponent (or value) ranges sampled in [`SelectionMode::Sampled`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    /// Base-10 exponent range of `beta_1`.
    pub beta_1: (f64, f64),
    pub beta_2: (f64, f64),
    pub eps: (f64, f64),
    pub weight_decay: (f64, f64),
    pub max_lr: (f64, f64),
    /// Value range (not exponent) of `cycle_peak`.
    pub cycle_peak: (f64, f64),
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            beta_1: (-2.5, -0.3),
            beta_2: (-2.0, -0.5),
            eps: (-9.5, -7.5),
            weight_decay: (-5.5, -3.5),
            max_lr: (-4.0, -3.0),
            cycle_peak: (0.1, 0.5),
        }
    }
}

impl SearchSpace {
    /// Reject ranges that are empty or can produce illegal records.
    pub fn validate(&self) -> Result<()> {
        let ranges = [
            ("beta_1", self.beta_1, Some(0.0)),
            ("beta_2", self.beta_2, Some(0.0)),
            ("eps", self.eps, None),
            ("weight_decay", self.weight_decay, None),
            ("max_lr", self.max_lr, None),
        ];
        for (field, (lo, hi), upper) in ranges {
            if !(lo < hi) || !lo.is_finite() || !hi.is_finite() {
                return Err(LabError::config(format!(
                    "search space for {field} is empty: [{lo}, {hi})"
                )));
            }
            if upper.is_some_and(|u| hi > u) {
                return Err(LabError::config(format!(
                    "search space for {field} reaches 1.0: exponent {hi} > 0"
                )));
            }
        }
        let (lo, hi) = self.cycle_peak;
        if !(lo > 0.0 && lo < hi && hi < 1.0) {
            return Err(LabError::config(format!(
                "search space for cycle_peak must lie inside (0, 1): [{lo}, {hi})"
            )));
        }
        Ok(())
    }

    /// Draw one record; fields are sampled in declaration order.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<HyperparameterRecord> {
        let mut log_uniform = |(lo, hi): (f64, f64)| 10f64.powf(rng.gen_range(lo..hi));
        let beta_1 = log_uniform(self.beta_1);
        let beta_2 = log_uniform(self.beta_2);
        let eps = log_uniform(self.eps);
        let weight_decay = log_uniform(self.weight_decay);
        let max_lr = log_uniform(self.max_lr);
        let cycle_peak = rng.gen_range(self.cycle_peak.0..self.cycle_peak.1);
        HyperparameterRecord::new(beta_1, beta_2, eps, weight_decay, max_lr, cycle_peak)
    }
}

/// Resolves a [`SelectionMode`] into a concrete record.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    table: &'a HyperparamTable,
    space: SearchSpace,
}

impl<'a> Resolver<'a> {
    pub fn new(table: &'a HyperparamTable, space: SearchSpace) -> Self {
        Self { table, space }
    }

    /// Resolve `mode`. Fixed lookups leave `rng` untouched.
    pub fn resolve<R: Rng + ?Sized>(
        &self,
        mode: &SelectionMode,
        rng: &mut R,
    ) -> Result<HyperparameterRecord> {
        let record = match mode {
            SelectionMode::Fixed { key } => *self.table.get(key)?,
            SelectionMode::Sampled => {
                self.space.validate()?;
                self.space.sample(rng)?
            }
        };
        tracing::debug!(mode = %mode.label(), ?record, "Resolved hyperparameters");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_builtin_table_has_all_presets() {
        let table = HyperparamTable::builtin().unwrap();
        assert_eq!(table.len(), 30);
        for key in table.keys() {
            table.get(key).unwrap().validate().unwrap();
        }
    }

    #[test]
    fn test_fixed_lookup_is_deterministic() {
        let table = HyperparamTable::builtin().unwrap();
        let resolver = Resolver::new(&table, SearchSpace::default());
        let mode = SelectionMode::Fixed {
            key: HyperparamKey::Grid(3),
        };
        let mut rng = StdRng::seed_from_u64(0);
        let a = resolver.resolve(&mode, &mut rng).unwrap();
        let b = resolver.resolve(&mode, &mut rng).unwrap();
        assert_eq!(a, b);
        assert!((a.max_lr - 10f64.powf(-3.326)).abs() < 1e-15);
        assert_eq!(a.cycle_peak, 0.36);
    }

    #[test]
    fn test_activation_presets_use_natural_log() {
        let table = HyperparamTable::builtin().unwrap();
        let relu = table
            .get(&HyperparamKey::Activation("relu".into()))
            .unwrap();
        assert!((relu.max_lr - (-5.7662952418075175f64).exp()).abs() < 1e-15);
    }

    #[test]
    fn test_unknown_key() {
        let table = HyperparamTable::builtin().unwrap();
        let err = table.get(&HyperparamKey::Grid(21)).unwrap_err();
        assert!(matches!(err, LabError::UnknownKey { ref key } if key == "21"));
        let err = table
            .get(&HyperparamKey::Activation("gelu".into()))
            .unwrap_err();
        assert!(err.to_string().contains("gelu"));
    }

    #[test]
    fn test_sampling_is_seed_determined() {
        let table = HyperparamTable::default();
        let resolver = Resolver::new(&table, SearchSpace::default());
        let a = resolver
            .resolve(&SelectionMode::Sampled, &mut StdRng::seed_from_u64(11))
            .unwrap();
        let b = resolver
            .resolve(&SelectionMode::Sampled, &mut StdRng::seed_from_u64(11))
            .unwrap();
        let c = resolver
            .resolve(&SelectionMode::Sampled, &mut StdRng::seed_from_u64(12))
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let err = HyperparameterRecord::new(1.0, 0.5, 1e-8, 0.0, 1e-3, 0.3).unwrap_err();
        assert!(matches!(
            err,
            LabError::InvalidHyperparameter {
                field: "beta_1",
                ..
            }
        ));
        assert!(HyperparameterRecord::new(0.9, 0.5, 1e-8, -1e-4, 1e-3, 0.3).is_err());
        assert!(HyperparameterRecord::new(0.9, 0.5, 1e-8, 0.0, 1e-3, 1.0).is_err());
    }

    #[test]
    fn test_search_space_validation() {
        let space = SearchSpace {
            beta_1: (-1.0, 0.5),
            ..SearchSpace::default()
        };
        assert!(space.validate().is_err());
        assert!(SearchSpace::default().validate().is_ok());
    }

    #[test]
    fn test_key_serde_is_untagged() {
        let grid: HyperparamKey = serde_json::from_str("7").unwrap();
        assert_eq!(grid, HyperparamKey::Grid(7));
        let act: HyperparamKey = serde_json::from_str("\"max\"").unwrap();
        assert_eq!(act, HyperparamKey::Activation("max".into()));
    }
}
