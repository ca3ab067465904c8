//! Domain models for XCIP.
//!
//! Canonical definitions for the core entities:
//! - `DeviceConfig`: validated CIP device configuration
//! - `DataType` / `AttrValue`: CIP elementary types and values
//! - error taxonomy shared by every stage of a run

pub mod error;
pub mod model;
pub mod types;

pub use error::{
    BuilderError, ConfigError, Result, SemanticError, SettingsError, StructuralError,
    TransportError, Violation, WaveformError, XcipError,
};
pub use model::{
    AccessRule, Assembly, AssemblyDirection, AssemblyField, CipAttribute, CipObject, Connection,
    ConnectionType, DeviceConfig, DeviceIdentity, Location, NetworkSettings, ObjectRef,
    TimingParams, TriggerType,
};
pub use types::{AttrValue, DataType};
