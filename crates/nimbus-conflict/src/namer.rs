//! Conflict naming for the losing copy
//!
//! The losing side of a conflict is kept next to the original under
//! `name (conflict).ext`. Further collisions get a counter:
//! `name (conflict 2).ext`, `name (conflict 3).ext`, ...

use nimbus_core::{config::ConflictsConfig, domain::SyncPath};

use crate::error::ConflictError;

/// Upper bound on numbered candidates
const MAX_ATTEMPTS: u32 = 999;

/// Generates conflict copy names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictNamer {
    suffix: String,
}

impl Default for ConflictNamer {
    fn default() -> Self {
        Self::from_config(&ConflictsConfig::default())
    }
}

impl ConflictNamer {
    pub fn new(suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        let suffix = if suffix.trim().is_empty() {
            ConflictsConfig::default().suffix
        } else {
            suffix
        };
        Self { suffix }
    }

    pub fn from_config(config: &ConflictsConfig) -> Self {
        Self::new(config.suffix.clone())
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Conflict name for `original`; `attempt` 1 is the plain form
    ///
    /// Given "report.docx" this yields "report (conflict).docx", then
    /// "report (conflict 2).docx" for attempt 2. The extension is the part
    /// after the last dot; a leading dot (".bashrc") is not an extension.
    pub fn generate(&self, original_name: &str, attempt: u32) -> String {
        let marker = if attempt <= 1 {
            format!("({})", self.suffix)
        } else {
            format!("({} {attempt})", self.suffix)
        };

        match original_name.rfind('.') {
            Some(dot_pos) if dot_pos > 0 => {
                let (stem, ext) = original_name.split_at(dot_pos);
                format!("{stem} {marker}{ext}")
            }
            _ => format!("{original_name} {marker}"),
        }
    }

    /// First conflict path next to `path` for which `exists` is false
    ///
    /// # Errors
    ///
    /// - `Unnamed` if `path` has no file name
    /// - `NamesExhausted` if every candidate is taken
    pub fn conflict_path<F>(&self, path: &SyncPath, mut exists: F) -> Result<SyncPath, ConflictError>
    where
        F: FnMut(&SyncPath) -> bool,
    {
        let name = path
            .file_name()
            .ok_or_else(|| ConflictError::Unnamed(path.to_string()))?;
        let parent = path
            .parent()
            .ok_or_else(|| ConflictError::Unnamed(path.to_string()))?;

        for attempt in 1..=MAX_ATTEMPTS {
            let candidate = parent.join(&self.generate(name, attempt))?;
            if !exists(&candidate) {
                return Ok(candidate);
            }
        }

        Err(ConflictError::NamesExhausted {
            path: path.to_string(),
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Returns true if `name` looks like a conflict copy made by this namer
    pub fn is_conflict_name(&self, name: &str) -> bool {
        let stem = match name.rfind('.') {
            Some(dot_pos) if dot_pos > 0 => &name[..dot_pos],
            _ => name,
        };
        let Some(open) = stem.rfind(" (") else {
            return false;
        };
        let Some(inner) = stem[open + 2..].strip_suffix(')') else {
            return false;
        };
        match inner.strip_prefix(self.suffix.as_str()) {
            Some("") => true,
            Some(rest) => rest
                .strip_prefix(' ')
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())),
            None => false,
        }
    }
}
