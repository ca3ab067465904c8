//! In-memory implementations of the capability traits.
//!
//! Used for offline runs and tests:
//! - [`SimulatedDevice`]: a well-behaved CIP target built from a manifest
//! - [`ScriptedTransport`]: wraps another transport and injects faults
//! - [`RecordingGenerator`]: records waveform commands
//! - [`MemoryConfigSource`]: manifests held in a map

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::{AccessRule, ConfigError, DeviceConfig, TransportError, WaveformError};
use crate::manifest::{is_xml, ConfigSource};
use crate::plan::{AttributePath, ServiceCode};
use crate::transport::{
    ChannelId, CipRequest, CipResponse, Transport, STATUS_ATTRIBUTE_UNSUPPORTED,
    STATUS_CONNECTION_FAILURE, STATUS_NOT_SETTABLE, STATUS_PATH_UNKNOWN,
};
use crate::waveform::{TriggerEvent, WaveformGenerator, WaveformParams};

/// How long a "silent" peer takes to answer: longer than any sane timeout.
const SILENCE: Duration = Duration::from_secs(3600);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
struct AttributeSlot {
    access: AccessRule,
    value: Vec<u8>,
}

/// A CIP target answering from the attributes and connections a
/// configuration declares.
#[derive(Debug)]
pub struct SimulatedDevice {
    objects: HashSet<crate::domain::ObjectRef>,
    connections: HashSet<String>,
    attributes: Mutex<HashMap<AttributePath, AttributeSlot>>,
    open_channels: Mutex<HashSet<ChannelId>>,
    forward_opened: Mutex<HashSet<String>>,
    latency: Duration,
    strict_access: bool,
}

impl SimulatedDevice {
    pub fn new(config: &DeviceConfig) -> Self {
        let mut attributes = HashMap::new();
        for object in &config.objects {
            for attribute in &object.attributes {
                let value = attribute
                    .default
                    .clone()
                    .unwrap_or_else(|| attribute.data_type.zero_value());
                attributes.insert(
                    AttributePath {
                        object: object.object_ref(),
                        attribute: attribute.id,
                    },
                    AttributeSlot {
                        access: attribute.access,
                        value: value.encode(),
                    },
                );
            }
        }
        Self {
            objects: config.objects.iter().map(|o| o.object_ref()).collect(),
            connections: config.connections.iter().map(|c| c.name.clone()).collect(),
            attributes: Mutex::new(attributes),
            open_channels: Mutex::new(HashSet::new()),
            forward_opened: Mutex::new(HashSet::new()),
            latency: Duration::ZERO,
            strict_access: false,
        }
    }

    /// Delay every response.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Refuse writes to read-only attributes.
    pub fn with_strict_access(mut self, strict: bool) -> Self {
        self.strict_access = strict;
        self
    }

    /// Current encoded value of an attribute.
    pub fn attribute(&self, path: AttributePath) -> Option<Vec<u8>> {
        lock(&self.attributes).get(&path).map(|slot| slot.value.clone())
    }

    pub fn is_forward_opened(&self, connection: &str) -> bool {
        lock(&self.forward_opened).contains(connection)
    }

    fn service(&self, service: ServiceCode, path: AttributePath, payload: &[u8]) -> CipResponse {
        if !self.objects.contains(&path.object) {
            return CipResponse::status(STATUS_PATH_UNKNOWN);
        }
        let mut attributes = lock(&self.attributes);
        let Some(slot) = attributes.get_mut(&path) else {
            return CipResponse::status(STATUS_ATTRIBUTE_UNSUPPORTED);
        };
        match service {
            ServiceCode::GetAttributeSingle => CipResponse::ok(slot.value.clone()),
            ServiceCode::SetAttributeSingle => {
                if self.strict_access && slot.access == AccessRule::ReadOnly {
                    return CipResponse::status(STATUS_NOT_SETTABLE);
                }
                slot.value = payload.to_vec();
                CipResponse::ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl Transport for SimulatedDevice {
    async fn open(&self, channel: &ChannelId) -> Result<(), TransportError> {
        if let ChannelId::Io(name) = channel {
            if !self.connections.contains(name) {
                return Err(TransportError::Refused {
                    reason: format!("unknown connection '{name}'"),
                });
            }
        }
        lock(&self.open_channels).insert(channel.clone());
        Ok(())
    }

    async fn send(
        &self,
        channel: &ChannelId,
        request: &CipRequest,
    ) -> Result<CipResponse, TransportError> {
        if !lock(&self.open_channels).contains(channel) {
            return Err(TransportError::ChannelClosed {
                channel: channel.to_string(),
            });
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let response = match request {
            CipRequest::Service {
                service,
                path,
                payload,
            } => self.service(*service, *path, payload),
            CipRequest::ForwardOpen { connection, .. } => {
                lock(&self.forward_opened).insert(connection.clone());
                CipResponse::ok(Vec::new())
            }
            CipRequest::ForwardClose { connection } => {
                lock(&self.forward_opened).remove(connection);
                CipResponse::ok(Vec::new())
            }
            CipRequest::IoData { connection, .. } => {
                if lock(&self.forward_opened).contains(connection) {
                    CipResponse::ok(Vec::new())
                } else {
                    CipResponse::status(STATUS_CONNECTION_FAILURE)
                }
            }
        };
        Ok(response)
    }

    async fn close(&self, channel: &ChannelId) -> Result<(), TransportError> {
        lock(&self.open_channels).remove(channel);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Faults {
    timeout_every: Option<u32>,
    service_status: Option<u8>,
    refuse_forward_open: HashSet<String>,
    silent_io: HashMap<String, Vec<Range<u32>>>,
    refuse_open: bool,
}

/// Fault-injecting wrapper around another transport.
///
/// Faults that model a silent peer never answer; callers see their own
/// timeout fire.
pub struct ScriptedTransport {
    inner: Arc<dyn Transport>,
    faults: Faults,
    service_count: AtomicU32,
    io_counts: Mutex<HashMap<String, u32>>,
    log: Mutex<Vec<CipRequest>>,
}

impl ScriptedTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            faults: Faults::default(),
            service_count: AtomicU32::new(0),
            io_counts: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Every `n`th explicit service request goes unanswered (1-based).
    pub fn timeout_every(mut self, n: u32) -> Self {
        self.faults.timeout_every = Some(n.max(1));
        self
    }

    /// Answer every explicit service request with `status`.
    pub fn status_for_services(mut self, status: u8) -> Self {
        self.faults.service_status = Some(status);
        self
    }

    pub fn refuse_forward_open(mut self, connection: impl Into<String>) -> Self {
        self.faults.refuse_forward_open.insert(connection.into());
        self
    }

    /// Leave the given I/O cycles of a connection unanswered. Cycles are
    /// counted from 0 across the whole run, re-establishment included.
    pub fn silent_io(mut self, connection: impl Into<String>, cycles: Range<u32>) -> Self {
        self.faults
            .silent_io
            .entry(connection.into())
            .or_default()
            .push(cycles);
        self
    }

    /// Refuse to open any channel.
    pub fn refuse_open(mut self) -> Self {
        self.faults.refuse_open = true;
        self
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<CipRequest> {
        lock(&self.log).clone()
    }

    /// Number of explicit service requests received.
    pub fn service_requests(&self) -> u32 {
        self.service_count.load(Ordering::SeqCst)
    }

    fn is_silent(&self, request: &CipRequest) -> bool {
        match request {
            CipRequest::Service { .. } => {
                let n = self.service_count.fetch_add(1, Ordering::SeqCst) + 1;
                self.faults.timeout_every.is_some_and(|every| n % every == 0)
            }
            CipRequest::IoData { connection, .. } => {
                let mut counts = lock(&self.io_counts);
                let index = counts.entry(connection.clone()).or_insert(0);
                let current = *index;
                *index += 1;
                self.faults
                    .silent_io
                    .get(connection)
                    .is_some_and(|ranges| ranges.iter().any(|r| r.contains(&current)))
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, channel: &ChannelId) -> Result<(), TransportError> {
        if self.faults.refuse_open {
            return Err(TransportError::Refused {
                reason: format!("channel {channel} refused"),
            });
        }
        self.inner.open(channel).await
    }

    async fn send(
        &self,
        channel: &ChannelId,
        request: &CipRequest,
    ) -> Result<CipResponse, TransportError> {
        lock(&self.log).push(request.clone());

        if self.is_silent(request) {
            tokio::time::sleep(SILENCE).await;
            return Err(TransportError::Timeout {
                after_ms: SILENCE.as_millis() as u64,
            });
        }
        match request {
            CipRequest::Service { .. } => {
                if let Some(status) = self.faults.service_status {
                    return Ok(CipResponse::status(status));
                }
            }
            CipRequest::ForwardOpen { connection, .. }
                if self.faults.refuse_forward_open.contains(connection) =>
            {
                return Ok(CipResponse::status(STATUS_CONNECTION_FAILURE));
            }
            _ => {}
        }
        self.inner.send(channel, request).await
    }

    async fn close(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.inner.close(channel).await
    }
}

/// A command received by [`RecordingGenerator`].
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorCommand {
    Configure(WaveformParams),
    Trigger(TriggerEvent),
    Stop,
}

/// Generator that records commands, or fails them all when unreachable.
#[derive(Debug, Default)]
pub struct RecordingGenerator {
    commands: Mutex<Vec<GeneratorCommand>>,
    unreachable: AtomicBool,
}

impl RecordingGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        let generator = Self::default();
        generator.set_unreachable(true);
        generator
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<GeneratorCommand> {
        lock(&self.commands).clone()
    }

    fn accept(&self, command: GeneratorCommand) -> Result<(), WaveformError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(WaveformError::Unreachable {
                reason: "no route to generator".to_string(),
            });
        }
        lock(&self.commands).push(command);
        Ok(())
    }
}

#[async_trait]
impl WaveformGenerator for RecordingGenerator {
    async fn configure(&self, params: &WaveformParams) -> Result<(), WaveformError> {
        self.accept(GeneratorCommand::Configure(*params))
    }

    async fn trigger(&self, event: &TriggerEvent) -> Result<(), WaveformError> {
        self.accept(GeneratorCommand::Trigger(event.clone()))
    }

    async fn stop(&self) -> Result<(), WaveformError> {
        self.accept(GeneratorCommand::Stop)
    }
}

/// Manifests held in memory, keyed by path.
///
/// A path names either one stored file or the directory its direct
/// children live in.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigSource {
    files: BTreeMap<PathBuf, String>,
}

impl MemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        self.files.insert(path.into(), text.into());
        self
    }
}

impl ConfigSource for MemoryConfigSource {
    fn manifests(&self, path: &Path) -> Result<Vec<PathBuf>, ConfigError> {
        if self.files.contains_key(path) {
            return Ok(vec![path.to_path_buf()]);
        }
        let children: Vec<&PathBuf> = self
            .files
            .keys()
            .filter(|p| p.parent() == Some(path))
            .collect();
        if children.is_empty() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let manifests: Vec<PathBuf> = children.into_iter().filter(|p| is_xml(p)).cloned().collect();
        if manifests.is_empty() {
            return Err(ConfigError::NoManifests {
                path: path.to_path_buf(),
            });
        }
        Ok(manifests)
    }

    fn read(&self, path: &Path) -> Result<String, ConfigError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| ConfigError::Unreadable {
                path: path.to_path_buf(),
                message: "no such manifest".to_string(),
            })
    }
}
