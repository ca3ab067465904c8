//! Manifest validation across files and directories.

use std::path::Path;

use xcip_core::domain::{ObjectRef, SemanticError, StructuralError, Violation};
use xcip_core::fakes::MemoryConfigSource;
use xcip_core::manifest::{load_path, validate_text, FsConfigSource};
use xcip_core::paths::DEFAULT_MANIFEST;
use xcip_core::ConfigError;

const DUPLICATES: &str = r#"<device vendor_id="1" product_code="2" revision="">
  <timing rpi_ms="10" timeout_ms="100" min_rpi_ms="5"/>
  <object class="0x04" instance="100">
    <attribute id="3" type="usint" access="rw" default="300"/>
  </object>
  <object class="0x04" instance="100">
    <attribute id="3" type="usint" access="rw"/>
  </object>
</device>"#;

#[test]
fn test_validation_is_idempotent() {
    let path = Path::new("demo.xml");
    let first = validate_text(path, DEFAULT_MANIFEST).unwrap();
    let second = validate_text(path, DEFAULT_MANIFEST).unwrap();
    assert_eq!(first.config, second.config);
    assert_eq!(first.digest, second.digest);
    assert!(first.violations.is_empty());
}

#[test]
fn test_duplicate_object_names_both_and_keeps_collecting() {
    let err = validate_text(Path::new("dup.xml"), DUPLICATES).unwrap_err();
    let ConfigError::Invalid { violations, .. } = err else {
        panic!("expected invalid manifest");
    };

    let duplicate = violations
        .iter()
        .find_map(|v| match v {
            Violation::Semantic(SemanticError::DuplicateObject {
                object,
                first,
                second,
            }) => Some((*object, first.line, second.line)),
            _ => None,
        })
        .expect("duplicate object reported");
    assert_eq!(duplicate, (ObjectRef::new(4, 100), 3, 6));

    // independent problems in the same file are still reported
    assert!(violations.iter().any(|v| matches!(
        v,
        Violation::Semantic(SemanticError::EmptyIdentity { .. })
    )));
    assert!(violations.iter().any(|v| matches!(
        v,
        Violation::Semantic(SemanticError::DefaultTypeMismatch { .. })
    )));
}

#[test]
fn test_structural_and_semantic_errors_together() {
    let text = r#"<device vendor_id="1" product_code="2" revision="1">
  <timing rpi_ms="10" timeout_ms="100" min_rpi_ms="5"/>
  <object class="4" instance="1"><attribute id="1" type="usint" access="rw"/></object>
  <object class="4" instance="1"/>
  <gadget/>
</device>"#;
    let err = validate_text(Path::new("mixed.xml"), text).unwrap_err();
    let violations = err.violations();
    assert!(violations.iter().any(|v| matches!(
        v,
        Violation::Structural(StructuralError::UnknownElement { .. })
    )));
    assert!(violations.iter().any(|v| matches!(
        v,
        Violation::Semantic(SemanticError::DuplicateObject { .. })
    )));
}

#[test]
fn test_directory_siblings_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a_broken.xml"), "<device><timing>").unwrap();
    std::fs::write(dir.path().join("b_demo.XML"), DEFAULT_MANIFEST).unwrap();
    std::fs::write(dir.path().join("c_dup.xml"), DUPLICATES).unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let results = load_path(&FsConfigSource, dir.path());
    assert_eq!(results.len(), 3);
    assert!(matches!(results[0], Err(ConfigError::Malformed { .. })));
    assert!(results[1].is_ok());
    assert!(matches!(results[2], Err(ConfigError::Invalid { .. })));
}

#[test]
fn test_empty_directory_and_missing_path() {
    let dir = tempfile::tempdir().unwrap();
    let results = load_path(&FsConfigSource, dir.path());
    assert!(matches!(results[..], [Err(ConfigError::NoManifests { .. })]));

    let results = load_path(&FsConfigSource, &dir.path().join("missing"));
    assert!(matches!(results[..], [Err(ConfigError::NotFound { .. })]));
}

#[test]
fn test_memory_source_matches_filesystem() {
    let source = MemoryConfigSource::new().with_file("conf/demo.xml", DEFAULT_MANIFEST);
    let results = load_path(&source, Path::new("conf"));
    let manifest = results.into_iter().next().unwrap().unwrap();
    let expected = validate_text(Path::new("conf/demo.xml"), DEFAULT_MANIFEST).unwrap();
    assert_eq!(manifest.config, expected.config);
}

fn with_assembly(fields: &str) -> String {
    format!(
        r#"<device vendor_id="1" product_code="2" revision="1.0">
  <timing rpi_ms="10" timeout_ms="100" min_rpi_ms="5"/>
  <assembly id="AS" subtype="OT_EO" size="32">
    {fields}
  </assembly>
</device>"#
    )
}

#[test]
fn test_huge_field_length_is_out_of_bounds() {
    for length in ["600000000", "536870912", "4294967295"] {
        let text = with_assembly(&format!(r#"<string id="s" offset="0" length="{length}"/>"#));
        let err = validate_text(Path::new("huge.xml"), &text).unwrap_err();
        let end_bit = err
            .violations()
            .iter()
            .find_map(|v| match v {
                Violation::Semantic(SemanticError::FieldOutOfBounds { end_bit, .. }) => {
                    Some(*end_bit)
                }
                _ => None,
            })
            .expect("field reported out of bounds");
        assert_eq!(end_bit, length.parse::<u64>().unwrap() * 8);
    }
}

#[test]
fn test_huge_field_does_not_stop_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let huge = with_assembly(r#"<string id="s" offset="0" length="600000000"/>"#);
    std::fs::write(dir.path().join("a_huge.xml"), huge).unwrap();
    std::fs::write(dir.path().join("b_demo.xml"), DEFAULT_MANIFEST).unwrap();

    let results = load_path(&FsConfigSource, dir.path());
    assert_eq!(results.len(), 2);
    assert!(matches!(results[0], Err(ConfigError::Invalid { .. })));
    assert!(results[1].is_ok());
}

#[test]
fn test_numeric_fields_take_no_length() {
    let text = with_assembly(r#"<uint id="pair" offset="0" length="2"/>"#);
    let err = validate_text(Path::new("pair.xml"), &text).unwrap_err();
    assert!(err.violations().iter().any(|v| matches!(
        v,
        Violation::Structural(StructuralError::InvalidLiteral { attribute, .. }) if attribute == "length"
    )));
}
