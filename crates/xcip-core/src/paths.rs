//! Locations of bundled resources.

use std::path::PathBuf;

/// Text of the bundled demonstration manifest.
pub const DEFAULT_MANIFEST: &str = include_str!("../conf/cip_xml_config.xml");

/// Path of the bundled demonstration manifest in the source tree.
pub fn default_config_file() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("conf")
        .join("cip_xml_config.xml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::validate_text;

    #[test]
    fn bundled_manifest_is_clean() {
        let manifest = validate_text(&default_config_file(), DEFAULT_MANIFEST).unwrap();
        assert!(manifest.is_clean(), "{:?}", manifest.violations);
        assert_eq!(manifest.config.connections.len(), 1);
        assert_eq!(manifest.config.exercised_attribute_count(), 3);
    }

    #[test]
    fn bundled_manifest_exists_on_disk() {
        assert!(default_config_file().is_file());
    }
}
