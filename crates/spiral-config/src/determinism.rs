// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

const ENABLED_VAR: &str = "SPIRAL_DETERMINISTIC";
const SEED_VAR: &str = "SPIRAL_DETERMINISTIC_SEED";

/// Seeding policy shared by loaders, probes and synthetic fixtures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterminismConfig {
    /// Whether unseeded components should still derive reproducible seeds.
    pub enabled: bool,
    /// Root seed mixed into every derived component seed.
    pub base_seed: u64,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: 42,
        }
    }
}

impl DeterminismConfig {
    /// Reads `SPIRAL_DETERMINISTIC` and `SPIRAL_DETERMINISTIC_SEED`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let enabled = std::env::var(ENABLED_VAR)
            .ok()
            .map(|v| parse_flag(&v))
            .unwrap_or(defaults.enabled);
        let base_seed = std::env::var(SEED_VAR)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(defaults.base_seed);
        Self { enabled, base_seed }
    }

    /// Seed for a component label such as `"train/task-3"`.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        mix(self.base_seed, label)
    }
}

fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "off" | "no"
    )
}

fn mix<L: Hash>(seed: u64, label: L) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    label.hash(&mut hasher);
    hasher.finish()
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Lazily initialised process configuration.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// Installs `cfg` unless a configuration was already read. Returns the active one.
pub fn configure(cfg: DeterminismConfig) -> &'static DeterminismConfig {
    CONFIG.get_or_init(|| cfg)
}

/// Resolves the seed for a labelled component.
///
/// An explicit seed is mixed with the label so sibling components (one loader
/// per task, say) do not share a stream. Without one, the global policy
/// decides between a reproducible derived seed and operating-system entropy.
pub fn derive_seed(seed: Option<u64>, label: &str) -> u64 {
    match seed {
        Some(value) => mix(value, label),
        None => {
            let cfg = config();
            if cfg.enabled {
                cfg.seed_for(label)
            } else {
                StdRng::from_entropy().gen()
            }
        }
    }
}

/// RNG seeded through [`derive_seed`].
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    StdRng::seed_from_u64(derive_seed(seed, label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
    use std::sync::Mutex;

    fn with_env(vars: &[(&str, Option<&str>)], test: impl FnOnce()) {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        let _lock = GUARD
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let snapshot: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, value)| {
                let previous = std::env::var(key).ok();
                match value {
                    Some(val) => std::env::set_var(key, val),
                    None => std::env::remove_var(key),
                }
                ((*key).to_string(), previous)
            })
            .collect();

        let result = catch_unwind(AssertUnwindSafe(test));

        for (key, value) in snapshot {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }

        if let Err(err) = result {
            resume_unwind(err);
        }
    }

    #[test]
    fn unset_environment_keeps_defaults() {
        with_env(&[(ENABLED_VAR, None), (SEED_VAR, None)], || {
            assert_eq!(DeterminismConfig::from_env(), DeterminismConfig::default());
        });
    }

    #[test]
    fn environment_overrides_seed_and_flag() {
        with_env(&[(ENABLED_VAR, Some("on")), (SEED_VAR, Some("1337"))], || {
            let cfg = DeterminismConfig::from_env();
            assert!(cfg.enabled);
            assert_eq!(cfg.base_seed, 1337);
        });
        with_env(&[(ENABLED_VAR, Some("off"))], || {
            assert!(!DeterminismConfig::from_env().enabled);
        });
    }

    #[test]
    fn explicit_seed_is_stable_and_label_sensitive() {
        let first = derive_seed(Some(7), "train/task-0");
        let again = derive_seed(Some(7), "train/task-0");
        let sibling = derive_seed(Some(7), "train/task-1");
        assert_eq!(first, again);
        assert_ne!(first, sibling);
    }

    #[test]
    fn first_configuration_wins() {
        let active = configure(DeterminismConfig {
            enabled: true,
            base_seed: 11,
        })
        .clone();
        let later = configure(DeterminismConfig {
            enabled: !active.enabled,
            base_seed: active.base_seed.wrapping_add(1),
        });
        assert_eq!(later, &active);
        assert_eq!(config(), &active);
    }

    #[test]
    fn seeded_rngs_replay_the_same_stream() {
        let mut a = rng_from_optional(Some(3), "probe");
        let mut b = rng_from_optional(Some(3), "probe");
        let xs: Vec<u32> = (0..4).map(|_| a.gen()).collect();
        let ys: Vec<u32> = (0..4).map(|_| b.gen()).collect();
        assert_eq!(xs, ys);
    }
}
