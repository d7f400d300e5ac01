//! Static geometry metadata: volume-to-module grouping and sensitive volumes.
//!
//! The catalog is assembled once at startup from [`GeometryConfig`], either
//! from inline maps or from plain-text files with one entry per line.
//! Volume map lines are `<volume> <module>`; sensitive volume lines hold a
//! single volume name. Blank lines and lines starting with `#` are skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::info;

use crate::config::GeometryConfig;

/// Errors that can occur when loading geometry metadata.
#[derive(Debug, thiserror::Error)]
pub enum GeometryError {
    /// A geometry file could not be read.
    #[error("failed to read geometry file {path}: {source}")]
    Io {
        /// The file that failed.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A volume map line did not hold exactly two names.
    #[error("malformed volume map line {line} in {path}")]
    MalformedLine {
        /// The offending file.
        path: String,
        /// One-based line number.
        line: usize,
    },
}

/// Volume-to-module map plus the set of sensitive volume names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeometryCatalog {
    modules: BTreeMap<String, String>,
    sensitive: BTreeSet<String>,
}

impl GeometryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the catalog described by a configuration section.
    ///
    /// Inline entries are applied first, file entries after them.
    pub fn from_config(config: &GeometryConfig) -> Result<Self, GeometryError> {
        let mut catalog = Self::new();
        for (volume, module) in &config.volume_modules {
            catalog.modules.insert(volume.clone(), module.clone());
        }
        catalog
            .sensitive
            .extend(config.sensitive_volumes.iter().cloned());

        if let Some(path) = &config.volume_map_file {
            catalog.load_volume_map(path)?;
        }
        if let Some(path) = &config.sensitive_volume_file {
            catalog.load_sensitive_volumes(path)?;
        }

        info!(
            modules = catalog.modules.len(),
            sensitive = catalog.sensitive.len(),
            "geometry catalog loaded"
        );
        Ok(catalog)
    }

    /// Map a volume name to a module.
    #[must_use]
    pub fn with_module(mut self, volume: &str, module: &str) -> Self {
        self.modules.insert(volume.to_owned(), module.to_owned());
        self
    }

    /// Mark a volume name as sensitive.
    #[must_use]
    pub fn with_sensitive(mut self, volume: &str) -> Self {
        self.sensitive.insert(volume.to_owned());
        self
    }

    /// Module a volume belongs to.
    pub fn module_of(&self, volume: &str) -> Option<&str> {
        self.modules.get(volume).map(String::as_str)
    }

    /// Whether hits are expected in a volume.
    pub fn is_sensitive(&self, volume: &str) -> bool {
        self.sensitive.contains(volume)
    }

    fn load_volume_map(&mut self, path: &Path) -> Result<(), GeometryError> {
        let display = path.display().to_string();
        for (number, line) in read_entries(path)? {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some(volume), Some(module), None) => {
                    self.modules.insert(volume.to_owned(), module.to_owned());
                }
                _ => {
                    return Err(GeometryError::MalformedLine {
                        path: display,
                        line: number,
                    });
                }
            }
        }
        Ok(())
    }

    fn load_sensitive_volumes(&mut self, path: &Path) -> Result<(), GeometryError> {
        for (_, line) in read_entries(path)? {
            self.sensitive.insert(line);
        }
        Ok(())
    }
}

/// Non-empty, non-comment lines of a file with their one-based line numbers.
fn read_entries(path: &Path) -> Result<Vec<(usize, String)>, GeometryError> {
    let contents = std::fs::read_to_string(path).map_err(|source| GeometryError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(contents
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx.saturating_add(1), line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| (number, line.to_owned()))
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn temp_file(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("steplog-geometry-{}.txt", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn inline_config_builds_catalog() {
        let mut config = GeometryConfig::default();
        config
            .volume_modules
            .insert("ITSV".to_owned(), "ITS".to_owned());
        config.sensitive_volumes.push("ITSV".to_owned());

        let catalog = GeometryCatalog::from_config(&config).unwrap();
        assert_eq!(catalog.module_of("ITSV"), Some("ITS"));
        assert!(catalog.is_sensitive("ITSV"));
        assert_eq!(catalog.module_of("cave"), None);
    }

    #[test]
    fn volume_map_file_is_parsed() {
        let path = temp_file("# volume module\nTPC_Drift TPC\n\nFRAME1 FRAME\n");
        let config = GeometryConfig {
            volume_map_file: Some(path.clone()),
            ..GeometryConfig::default()
        };
        let catalog = GeometryCatalog::from_config(&config).unwrap();
        assert_eq!(catalog.module_of("TPC_Drift"), Some("TPC"));
        assert_eq!(catalog.module_of("FRAME1"), Some("FRAME"));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn malformed_volume_map_reports_line() {
        let path = temp_file("TPC_Drift TPC\nlonely\n");
        let config = GeometryConfig {
            volume_map_file: Some(path.clone()),
            ..GeometryConfig::default()
        };
        let err = GeometryCatalog::from_config(&config);
        assert!(matches!(
            err,
            Err(GeometryError::MalformedLine { line: 2, .. })
        ));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_is_io_error() {
        let config = GeometryConfig {
            sensitive_volume_file: Some("/nonexistent/steplog/sensitive.txt".into()),
            ..GeometryConfig::default()
        };
        assert!(matches!(
            GeometryCatalog::from_config(&config),
            Err(GeometryError::Io { .. })
        ));
    }
}
