use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DebugError, DebugResult};

/// The two runtime families fathom can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterFamily {
    /// Python under debugpy, spoken to over DAP.
    Python,
    /// Node under its native inspector, spoken to over CDP.
    Node,
}

impl AdapterFamily {
    /// Canonical adapter-type selector, as used in [`LaunchConfig::adapter_type`]
    /// and the session manager's adapter registry.
    pub fn selector(self) -> &'static str {
        match self {
            AdapterFamily::Python => "python",
            AdapterFamily::Node => "node",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "py" => Some(AdapterFamily::Python),
            "js" | "ts" | "mjs" | "cjs" | "tsx" | "jsx" => Some(AdapterFamily::Node),
            _ => None,
        }
    }
}

/// Immutable description of one debuggee launch.
///
/// Exactly one of `program` and `module` identifies the entry point; `module`
/// is meaningful for the Python family only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Adapter selector ("python", "node"). Empty means auto-detect from the
    /// program path extension.
    #[serde(rename = "type")]
    pub adapter_type: String,
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Merged over the parent environment at spawn time; these win.
    pub env: BTreeMap<String, String>,
    pub runtime_executable: Option<String>,
    pub runtime_args: Vec<String>,
    pub python_path: Option<String>,
    pub module: Option<String>,
}

impl LaunchConfig {
    pub fn for_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            ..Self::default()
        }
    }

    /// Check that the config names exactly one entry point.
    pub fn validate(&self) -> DebugResult<()> {
        match (&self.program, &self.module) {
            (Some(_), Some(_)) => Err(DebugError::Configuration(
                "config sets both program and module; pick one entry point".to_string(),
            )),
            (None, None) => Err(DebugError::Configuration(
                "config sets neither program nor module".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Resolve the adapter selector, auto-detecting from the program path
    /// extension when `adapter_type` is empty.
    pub fn resolve_adapter_type(&self) -> DebugResult<String> {
        if !self.adapter_type.is_empty() {
            return Ok(self.adapter_type.clone());
        }
        let family = self
            .program
            .as_deref()
            .and_then(detect_family)
            .ok_or_else(|| {
                DebugError::Configuration(format!(
                    "Cannot auto-detect debugger type for {}; pass an explicit type",
                    self.program
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "<no program>".to_string()),
                ))
            })?;
        Ok(family.selector().to_string())
    }
}

fn detect_family(program: &Path) -> Option<AdapterFamily> {
    let ext = program.extension()?.to_str()?;
    AdapterFamily::from_extension(&ext.to_ascii_lowercase())
}
