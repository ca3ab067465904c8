//! CIP XML manifest loading and validation.
//!
//! A manifest is validated in two passes over one accumulator:
//! - structural: element names, required attributes, literal syntax
//! - semantic: uniqueness, references, ranges, type checks
//!
//! Only malformed XML short-circuits; every other violation in a file is
//! collected. Violations confined to one connection exclude that connection
//! and leave the rest of the device runnable.

pub mod document;
mod rules;
mod schema;

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::domain::{ConfigError, DeviceConfig, Violation};

/// Accumulator threaded through both validation passes.
#[derive(Debug, Default)]
pub struct Violations {
    items: Vec<Violation>,
}

impl Violations {
    pub fn push(&mut self, violation: impl Into<Violation>) {
        self.items.push(violation.into());
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn into_vec(self) -> Vec<Violation> {
        self.items
    }
}

/// A manifest that produced a runnable configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedManifest {
    pub path: PathBuf,
    /// SHA-256 hex digest of the manifest text.
    pub digest: String,
    pub config: DeviceConfig,
    /// Connections left out of the configuration because of the
    /// connection-scoped violations below.
    pub excluded_connections: Vec<String>,
    pub violations: Vec<Violation>,
}

impl ValidatedManifest {
    /// No violations at all.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Read access to manifests.
pub trait ConfigSource: Send + Sync {
    /// Resolve a file or directory path to the manifests it names, sorted.
    fn manifests(&self, path: &Path) -> Result<Vec<PathBuf>, ConfigError>;

    /// Read one manifest's text.
    fn read(&self, path: &Path) -> Result<String, ConfigError>;
}

/// Manifests on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsConfigSource;

impl ConfigSource for FsConfigSource {
    fn manifests(&self, path: &Path) -> Result<Vec<PathBuf>, ConfigError> {
        if path.is_file() {
            return Ok(vec![path.to_path_buf()]);
        }
        if !path.is_dir() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let entries = std::fs::read_dir(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_xml(p))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(ConfigError::NoManifests {
                path: path.to_path_buf(),
            });
        }
        Ok(files)
    }

    fn read(&self, path: &Path) -> Result<String, ConfigError> {
        std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Case-insensitive `.xml` extension check.
pub fn is_xml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("xml"))
}

/// Validate manifest text.
pub fn validate_text(path: &Path, text: &str) -> Result<ValidatedManifest, ConfigError> {
    let root = document::parse_document(text).map_err(|error| ConfigError::Malformed {
        path: path.to_path_buf(),
        error,
    })?;

    let mut violations = Violations::default();
    let draft = schema::lower(&root, &mut violations);
    let config = rules::check(draft, &mut violations);
    let violations = violations.into_vec();

    let blocking = violations
        .iter()
        .any(|v| v.excluded_connection().is_none());
    let mut config = match config {
        Some(config) if !blocking => config,
        _ => {
            return Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                violations,
            })
        }
    };

    let excluded: BTreeSet<String> = violations
        .iter()
        .filter_map(|v| v.excluded_connection().map(str::to_string))
        .collect();
    config.connections.retain(|c| !excluded.contains(&c.name));

    Ok(ValidatedManifest {
        path: path.to_path_buf(),
        digest: digest(text),
        config,
        excluded_connections: excluded.into_iter().collect(),
        violations,
    })
}

/// Validate every manifest a path names, in sorted order.
///
/// A failure in one file never prevents validation of its siblings.
pub fn load_path(
    source: &dyn ConfigSource,
    path: &Path,
) -> Vec<Result<ValidatedManifest, ConfigError>> {
    let files = match source.manifests(path) {
        Ok(files) => files,
        Err(e) => return vec![Err(e)],
    };
    files
        .iter()
        .map(|file| {
            let text = source.read(file)?;
            validate_text(file, &text)
        })
        .collect()
}

fn digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"<device vendor_id="0x0001" product_code="42" revision="1.0" name="Unit">
  <timing rpi_ms="10" timeout_ms="100" min_rpi_ms="5"/>
  <object class="0x04" instance="100">
    <attribute id="3" type="usint" access="rw" default="0x10"/>
  </object>
  <connection name="io" producer="0x04:100" consumer="0x04:100" type="point_to_point" trigger="cyclic"/>
</device>"#;

    #[test]
    fn test_valid_manifest_is_clean() {
        let manifest = validate_text(Path::new("unit.xml"), VALID).unwrap();
        assert!(manifest.is_clean());
        assert_eq!(manifest.config.objects.len(), 1);
        assert_eq!(manifest.digest.len(), 64);
    }

    #[test]
    fn test_malformed_short_circuits() {
        let err = validate_text(Path::new("bad.xml"), "<device><timing></device>").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
        assert_eq!(err.violations().len(), 1);
    }

    #[test]
    fn test_connection_violation_excludes_only_connection() {
        let text = VALID.replace(
            r#"type="point_to_point""#,
            r#"rpi_ms="3" type="point_to_point""#,
        );
        let manifest = validate_text(Path::new("unit.xml"), &text).unwrap();
        assert_eq!(manifest.violations.len(), 1);
        assert_eq!(manifest.excluded_connections, vec!["io".to_string()]);
        assert!(manifest.config.connections.is_empty());
        assert_eq!(manifest.config.objects.len(), 1);
    }

    #[test]
    fn test_is_xml_case_insensitive() {
        assert!(is_xml(Path::new("a.XML")));
        assert!(is_xml(Path::new("dir/b.xml")));
        assert!(!is_xml(Path::new("c.xml.bak")));
        assert!(!is_xml(Path::new("xml")));
    }
}
