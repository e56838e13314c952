// sprout-common/src/formulary.rs
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};
use std::sync::Arc;

use tracing::{debug, warn};

use super::config::Config;
use super::error::{Result, SproutError};
use super::model::formula::Formula;

/// Known formulas keyed by name. Populated once, read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct Formulary {
    formulas: BTreeMap<String, Arc<Formula>>,
}

impl Formulary {
    /// Builds a registry from already-parsed records, rejecting inconsistent sets.
    pub fn from_formulas(formulas: impl IntoIterator<Item = Formula>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for formula in formulas {
            validate_formula(&formula)?;
            let name = formula.name.clone();
            if map.insert(name.clone(), Arc::new(formula)).is_some() {
                return Err(invalid(&name, "defined more than once"));
            }
        }

        for formula in map.values() {
            if let Some(dep) = &formula.runtime_dependency {
                if dep == &formula.name {
                    return Err(invalid(&formula.name, "depends on itself"));
                }
                if !map.contains_key(dep) {
                    return Err(invalid(
                        &formula.name,
                        &format!("depends on unknown formula '{dep}'"),
                    ));
                }
            }
        }

        // Each formula has at most one dependency, so a chain longer than the map is a cycle.
        for formula in map.values() {
            let mut current = formula.runtime_dependency.as_deref();
            let mut steps = 0;
            while let Some(dep) = current {
                steps += 1;
                if dep == formula.name || steps > map.len() {
                    return Err(invalid(&formula.name, "runtime dependency cycle"));
                }
                current = map.get(dep).and_then(|f| f.runtime_dependency.as_deref());
            }
        }

        debug!("Formulary loaded with {} formulas.", map.len());
        Ok(Self { formulas: map })
    }

    /// Loads every `*.json` file in `dir`. Each file holds one formula or an array of them.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            debug!(
                "Formula directory {} not found, starting with an empty formulary.",
                dir.display()
            );
            return Ok(Self::default());
        }

        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| match entry {
                Ok(e) => Some(e.path()),
                Err(e) => {
                    warn!("Error reading entry in {}: {}. Skipping.", dir.display(), e);
                    None
                }
            })
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut formulas = Vec::new();
        for path in paths {
            debug!("Reading formula definitions from {}", path.display());
            let raw = fs::read_to_string(&path)?;
            let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                SproutError::InvalidFormula {
                    name: path.display().to_string(),
                    reason: format!("malformed JSON: {e}"),
                }
            })?;
            let parsed: std::result::Result<Vec<Formula>, _> = if value.is_array() {
                serde_json::from_value(value)
            } else {
                serde_json::from_value(value).map(|f| vec![f])
            };
            formulas.extend(parsed.map_err(|e| SproutError::InvalidFormula {
                name: path.display().to_string(),
                reason: e.to_string(),
            })?);
        }
        Self::from_formulas(formulas)
    }

    pub fn load(config: &Config) -> Result<Self> {
        Self::load_dir(config.formula_dir())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<Formula>> {
        self.formulas
            .get(name)
            .cloned()
            .ok_or_else(|| SproutError::NotFound(format!("No formula named '{name}'")))
    }

    /// Formula names in sorted order.
    pub fn list(&self) -> Vec<&str> {
        self.formulas.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}

fn invalid(name: &str, reason: &str) -> SproutError {
    SproutError::InvalidFormula {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Rejects names that could escape the state or install directories.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
    {
        return Err(invalid(name, "name contains disallowed characters"));
    }
    Ok(())
}

fn validate_formula(formula: &Formula) -> Result<()> {
    let name = formula.name.as_str();
    validate_name(name)?;
    semver::Version::parse(&formula.version).map_err(|e| {
        invalid(
            name,
            &format!("version '{}' is not semantic: {e}", formula.version),
        )
    })?;
    if formula.artifacts.is_empty() {
        return Err(invalid(name, "declares no artifacts"));
    }
    if let Some((arch, _)) = formula
        .artifacts
        .iter()
        .find(|(_, a)| a.url.trim().is_empty())
    {
        return Err(invalid(name, &format!("artifact for '{arch}' has no url")));
    }
    for target in &formula.install_targets {
        let source = Path::new(&target.source);
        let unsafe_source = target.source.is_empty()
            || source
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if unsafe_source {
            return Err(invalid(
                name,
                &format!("install source '{}' is not a plain relative path", target.source),
            ));
        }
        if target.destination.trim().is_empty() {
            return Err(invalid(
                name,
                &format!("install target '{}' has no destination", target.source),
            ));
        }
    }
    if let Some(service) = &formula.service {
        if service.command.is_empty() || service.command[0].trim().is_empty() {
            return Err(invalid(name, "service command is empty"));
        }
    }
    Ok(())
}
