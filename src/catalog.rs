//! Compiled flows available to new sessions

use crate::flow::{FlowDocument, FlowError};
use crate::machine::Machine;
use crate::registry::Registry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub id: String,
    pub version: String,
    pub initial_step: String,
    pub steps: usize,
    pub diagnostics: usize,
}

#[derive(Default)]
pub struct FlowCatalog {
    flows: BTreeMap<String, Arc<Machine>>,
}

impl FlowCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile every `*.json` file in `dir`; the flow id is the file stem.
    ///
    /// A document that fails to load is logged and skipped. A missing
    /// directory yields an empty catalog.
    pub fn load_dir(dir: &Path, registry: &Registry) -> Result<Self, FlowError> {
        let mut catalog = Self::empty();
        if !dir.is_dir() {
            tracing::warn!(dir = %dir.display(), "Flows directory not found, starting with no flows");
            return Ok(catalog);
        }

        let entries = std::fs::read_dir(dir).map_err(|source| FlowError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match FlowDocument::load(&path).and_then(|doc| Machine::build(&doc, registry)) {
                Ok(machine) => {
                    tracing::info!(
                        flow_id = %id,
                        version = %machine.version(),
                        steps = machine.state_count(),
                        diagnostics = machine.diagnostics().len(),
                        "Loaded flow"
                    );
                    catalog.insert(id, Arc::new(machine));
                }
                Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to load flow"),
            }
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, id: impl Into<String>, machine: Arc<Machine>) {
        self.flows.insert(id.into(), machine);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Machine>> {
        self.flows.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn summaries(&self) -> Vec<FlowSummary> {
        self.flows
            .iter()
            .map(|(id, machine)| FlowSummary {
                id: id.clone(),
                version: machine.version().to_string(),
                initial_step: machine.initial_step().to_string(),
                steps: machine.state_count(),
                diagnostics: machine.diagnostics().len(),
            })
            .collect()
    }
}
