//! Error taxonomy for manifest validation, plan building and execution.

use serde::Serialize;
use std::path::PathBuf;

use super::model::{Location, ObjectRef};
use super::types::DataType;

/// Violations found while turning the raw element tree into typed values.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuralError {
    /// The document is not well-formed XML. Fatal for its file.
    #[error("malformed XML at line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("{location}: <{parent}> is missing required element <{element}>")]
    MissingElement {
        parent: String,
        element: String,
        location: Location,
    },

    #[error("{location}: <{element}> may appear only once inside <{parent}>")]
    RepeatedElement {
        parent: String,
        element: String,
        location: Location,
    },

    #[error("{location}: <{element}> is missing required attribute '{attribute}'")]
    MissingAttribute {
        element: String,
        attribute: String,
        location: Location,
    },

    #[error("{location}: unknown element <{element}> inside <{parent}>")]
    UnknownElement {
        parent: String,
        element: String,
        location: Location,
    },

    #[error("{location}: <{element}> attribute '{attribute}' has invalid value '{value}' (expected {expected})")]
    InvalidLiteral {
        element: String,
        attribute: String,
        value: String,
        expected: String,
        location: Location,
    },
}

/// Rule violations of a structurally sound manifest.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SemanticError {
    #[error("duplicate object {object} declared at {first} and {second}")]
    DuplicateObject {
        object: ObjectRef,
        first: Location,
        second: Location,
    },

    #[error("object {object} declares attribute {attribute} twice, at {first} and {second}")]
    DuplicateAttribute {
        object: ObjectRef,
        attribute: u16,
        first: Location,
        second: Location,
    },

    #[error("connection '{connection}' declared twice, at {first} and {second}")]
    DuplicateConnection {
        connection: String,
        first: Location,
        second: Location,
    },

    #[error("more than one {subtype} assembly, at {first} and {second}")]
    DuplicateAssembly {
        subtype: String,
        first: Location,
        second: Location,
    },

    #[error("{location}: identity field '{field}' is empty")]
    EmptyIdentity { field: String, location: Location },

    #[error("{location}: timing parameter '{field}' must be positive")]
    NonPositiveTiming { field: String, location: Location },

    #[error("{location}: default interval of {rpi_ms} ms is below the device minimum of {min_rpi_ms} ms")]
    DefaultIntervalBelowMinimum {
        rpi_ms: u64,
        min_rpi_ms: u64,
        location: Location,
    },

    #[error("{location}: connection '{connection}' requests {rpi_ms} ms, below the device minimum of {min_rpi_ms} ms")]
    IntervalBelowMinimum {
        connection: String,
        rpi_ms: u64,
        min_rpi_ms: u64,
        location: Location,
    },

    #[error("{location}: connection '{connection}' {role} references undeclared object {object}")]
    DanglingReference {
        connection: String,
        role: String,
        object: ObjectRef,
        location: Location,
    },

    #[error("{location}: object {object} attribute {attribute} default '{value}' does not match type {declared}: {reason}")]
    DefaultTypeMismatch {
        object: ObjectRef,
        attribute: u16,
        declared: DataType,
        value: String,
        reason: String,
        location: Location,
    },

    #[error("{location}: assembly '{assembly}' field '{field}' ends at bit {end_bit}, beyond the assembly size of {size_bits} bits")]
    FieldOutOfBounds {
        assembly: String,
        field: String,
        end_bit: u64,
        size_bits: u32,
        location: Location,
    },

    #[error("{location}: assembly '{assembly}' field '{field}' at bit {offset_bits} is not byte aligned")]
    FieldMisaligned {
        assembly: String,
        field: String,
        offset_bits: u32,
        location: Location,
    },

    #[error("{location}: assembly '{assembly}' field '{field}' overlaps field '{other}'")]
    FieldOverlap {
        assembly: String,
        field: String,
        other: String,
        location: Location,
    },

    #[error("{location}: assembly '{assembly}' size of {size_bits} bits is not a positive multiple of 8")]
    AssemblySize {
        assembly: String,
        size_bits: u32,
        location: Location,
    },

    #[error("{location}: assembly '{assembly}' heartbeat '{field}' is not a usint field of the assembly")]
    HeartbeatField {
        assembly: String,
        field: String,
        location: Location,
    },

    #[error("{location}: multicast address {address} is outside 224.0.0.0/4")]
    MulticastOutOfRange { address: String, location: Location },
}

impl SemanticError {
    /// Connection this violation is confined to, if any.
    ///
    /// Such violations exclude only the named connection from the run.
    pub fn connection(&self) -> Option<&str> {
        match self {
            SemanticError::IntervalBelowMinimum { connection, .. }
            | SemanticError::DanglingReference { connection, .. } => Some(connection),
            _ => None,
        }
    }
}

/// Any violation found while validating a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "pass", content = "error", rename_all = "snake_case")]
pub enum Violation {
    #[error("structural: {0}")]
    Structural(StructuralError),

    #[error("semantic: {0}")]
    Semantic(SemanticError),
}

impl Violation {
    pub fn is_structural(&self) -> bool {
        matches!(self, Violation::Structural(_))
    }

    pub fn excluded_connection(&self) -> Option<&str> {
        match self {
            Violation::Semantic(e) => e.connection(),
            Violation::Structural(_) => None,
        }
    }
}

impl From<StructuralError> for Violation {
    fn from(e: StructuralError) -> Self {
        Violation::Structural(e)
    }
}

impl From<SemanticError> for Violation {
    fn from(e: SemanticError) -> Self {
        Violation::Semantic(e)
    }
}

/// Failure to produce a validated configuration for one input path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("{}: {error}", .path.display())]
    Malformed {
        path: PathBuf,
        error: StructuralError,
    },

    #[error("{}: {} violation(s)", .path.display(), .violations.len())]
    Invalid {
        path: PathBuf,
        violations: Vec<Violation>,
    },

    #[error("{}: cannot read manifest: {message}", .path.display())]
    Unreadable { path: PathBuf, message: String },

    #[error("{}: no .xml manifests found", .path.display())]
    NoManifests { path: PathBuf },

    #[error("{}: not a file or directory", .path.display())]
    NotFound { path: PathBuf },
}

impl ConfigError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            ConfigError::Malformed { path, .. }
            | ConfigError::Invalid { path, .. }
            | ConfigError::Unreadable { path, .. }
            | ConfigError::NoManifests { path }
            | ConfigError::NotFound { path } => path,
        }
    }

    /// Every violation carried by this error.
    pub fn violations(&self) -> Vec<Violation> {
        match self {
            ConfigError::Malformed { error, .. } => vec![Violation::Structural(error.clone())],
            ConfigError::Invalid { violations, .. } => violations.clone(),
            _ => Vec::new(),
        }
    }
}

/// Errors raised while building a traffic plan.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuilderError {
    #[error("connection '{connection}': duration {duration_ms} ms is shorter than one interval of {interval_ms} ms")]
    ZeroCycles {
        connection: String,
        duration_ms: u64,
        interval_ms: u64,
    },

    #[error("assembly '{assembly}' layout: {reason}")]
    Layout { assembly: String, reason: String },
}

/// Errors reported by a network transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportError {
    #[error("no response within {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("request refused: {reason}")]
    Refused { reason: String },

    #[error("channel '{channel}' is not open")]
    ChannelClosed { channel: String },

    #[error("transport failure: {reason}")]
    Io { reason: String },
}

/// Errors reported by a waveform generator. Never fatal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WaveformError {
    #[error("generator unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("invalid waveform parameters: {reason}")]
    InvalidParameters { reason: String },

    #[error("generator rejected command: {reason}")]
    Rejected { reason: String },
}

/// Invalid run settings.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid setting '{field}': {reason}")]
pub struct SettingsError {
    pub field: String,
    pub reason: String,
}

/// Top-level error for XCIP operations.
#[derive(Debug, thiserror::Error)]
pub enum XcipError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("plan error: {0}")]
    Builder(#[from] BuilderError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("waveform error: {0}")]
    Waveform(#[from] WaveformError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for XCIP operations.
pub type Result<T> = std::result::Result<T, XcipError>;
