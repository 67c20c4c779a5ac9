//! Step definitions and registry.
//!
//! A step definition lists the ordered phases and substeps of a pipeline
//! bundle. Definitions are read-only at runtime: they order and label the
//! progress tree and decide which success closes a run. They never reject
//! ingested events.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Phases used when a run's bundle has no definition on file.
pub const DEFAULT_PHASES: [&str; 5] = ["PREPARE", "VALIDATE", "EXECUTE", "VERIFY", "FINALIZE"];

pub const DEFAULT_TIMEOUT_SEC: u64 = 300;

/// Bundle name of the built-in definition.
pub const FALLBACK_BUNDLE: &str = "default";

/// Ordered phases and substeps of one bundle.
#[derive(Debug, Clone, Deserialize)]
pub struct StepsDefinition {
    pub version: String,
    pub bundle: String,
    #[serde(default = "default_timeout")]
    pub default_timeout_sec: u64,
    #[serde(default)]
    pub phases: Vec<PhaseDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhaseDef {
    pub name: String,
    #[serde(default)]
    pub substeps: Vec<StepDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepDef {
    pub id: String,
    /// Display name. Falls back to `id`.
    pub name: Option<String>,
    /// Falls back to the definition's `default_timeout_sec`.
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub optional: bool,
}

impl StepDef {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SEC
}

impl StepsDefinition {
    /// The definition applied to bundles with nothing on file.
    pub fn fallback() -> Self {
        Self {
            version: "builtin".to_string(),
            bundle: FALLBACK_BUNDLE.to_string(),
            default_timeout_sec: DEFAULT_TIMEOUT_SEC,
            phases: DEFAULT_PHASES
                .iter()
                .map(|name| PhaseDef {
                    name: (*name).to_string(),
                    substeps: Vec::new(),
                })
                .collect(),
        }
    }

    /// Parse a TOML definition and check its structure.
    pub fn from_toml(content: &str) -> Result<Self> {
        let def: StepsDefinition = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad step definition: {e}")))?;
        def.validate()?;
        Ok(def)
    }

    fn validate(&self) -> Result<()> {
        if self.bundle.trim().is_empty() {
            return Err(Error::Config("step definition has empty bundle".to_string()));
        }
        let mut phases = HashSet::new();
        for phase in &self.phases {
            if !phases.insert(phase.name.as_str()) {
                return Err(Error::Config(format!(
                    "bundle {}: phase {} declared twice",
                    self.bundle, phase.name
                )));
            }
            let mut ids = HashSet::new();
            for step in &phase.substeps {
                if !ids.insert(step.id.as_str()) {
                    return Err(Error::Config(format!(
                        "bundle {}: substep {}/{} declared twice",
                        self.bundle, phase.name, step.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseDef> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn substep(&self, phase: &str, id: &str) -> Option<&StepDef> {
        self.phase(phase)?.substeps.iter().find(|s| s.id == id)
    }

    /// Effective timeout of a substep, in seconds.
    pub fn timeout_for(&self, phase: &str, substep: &str) -> u64 {
        self.substep(phase, substep)
            .and_then(|s| s.timeout_sec)
            .unwrap_or(self.default_timeout_sec)
    }

    /// `(phase, substep)` whose success closes a run, if the last phase declares substeps.
    pub fn final_substep(&self) -> Option<(&str, &str)> {
        let last = self.phases.last()?;
        let step = last.substeps.last()?;
        Some((&last.name, &step.id))
    }

    /// Does a success on this pair complete the run?
    ///
    /// When the last phase declares no substeps, any success in it counts.
    pub fn is_completion(&self, phase: &str, substep: &str) -> bool {
        let Some(last) = self.phases.last() else {
            return false;
        };
        if last.name != phase {
            return false;
        }
        match last.substeps.last() {
            Some(step) => step.id == substep,
            None => true,
        }
    }
}

/// Registry of loaded definitions, indexed by bundle.
#[derive(Debug)]
pub struct StepsRegistry {
    definitions: HashMap<String, Arc<StepsDefinition>>,
    fallback: Arc<StepsDefinition>,
}

impl StepsRegistry {
    /// Registry with no definitions: every bundle resolves to the fallback.
    pub fn empty() -> Self {
        Self {
            definitions: HashMap::new(),
            fallback: Arc::new(StepsDefinition::fallback()),
        }
    }

    /// Build a registry from in-memory definitions.
    pub fn with_definitions(defs: impl IntoIterator<Item = StepsDefinition>) -> Result<Self> {
        let mut registry = Self::empty();
        for def in defs {
            registry.insert(def)?;
        }
        Ok(registry)
    }

    /// Load all `.toml` files from a directory and build the registry.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read steps dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let def = StepsDefinition::from_toml(&content)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
                tracing::debug!(
                    bundle = %def.bundle,
                    version = %def.version,
                    path = %path.display(),
                    "loaded step definition"
                );
                registry.insert(def)?;
            }
        }

        Ok(registry)
    }

    fn insert(&mut self, def: StepsDefinition) -> Result<()> {
        def.validate()?;
        if self.definitions.contains_key(&def.bundle) {
            return Err(Error::Config(format!(
                "bundle {} defined more than once",
                def.bundle
            )));
        }
        self.definitions.insert(def.bundle.clone(), Arc::new(def));
        Ok(())
    }

    /// Look up a bundle's definition.
    pub fn get(&self, bundle: &str) -> Option<&Arc<StepsDefinition>> {
        self.definitions.get(bundle)
    }

    /// The bundle's definition, or the built-in fallback.
    pub fn resolve(&self, bundle: &str) -> Arc<StepsDefinition> {
        self.get(bundle)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn bundles(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl Default for StepsRegistry {
    fn default() -> Self {
        Self::empty()
    }
}
