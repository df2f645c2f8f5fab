use chrono::Utc;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

use crate::error::CoordError;
use crate::model::{
    AgentId, Availability, Coordinates, FleetDiff, FleetSnapshot, Package, PackageId,
    PackageState, PositionSample, Room,
};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;
pub const HUB_SENDER_ID: &str = "fleet-hub";
/// How far a device clock may run ahead of the hub before its samples are
/// refused.
pub const MAX_SAMPLE_SKEW_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProtocolVersionVisitor;

        impl<'de> Visitor<'de> for ProtocolVersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let version = u16::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))?;
                Ok(ProtocolVersion(version))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                let version = cleaned.parse::<u16>().map_err(|err| {
                    E::custom(format!("invalid protocol version '{value}': {err}"))
                })?;
                Ok(ProtocolVersion(version))
            }
        }

        deserializer.deserialize_any(ProtocolVersionVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(sender_id: impl Into<String>, msg: WireMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            sender_id: sender_id.into(),
            timestamp: Utc::now().to_rfc3339(),
            request_id: None,
            msg,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Milliseconds since the epoch of the envelope timestamp, if it parses.
    pub fn timestamp_ms(&self) -> Option<i64> {
        chrono::DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|at| at.timestamp_millis())
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.sender_id.trim().is_empty() || self.timestamp.is_empty() {
            return Err("missing_required_fields");
        }
        if self.version.0 > CURRENT_PROTOCOL_VERSION {
            return Err("unsupported_version");
        }
        if self.timestamp_ms().is_none() {
            return Err("invalid_timestamp");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum WireMsg {
    #[serde(rename = "hello")]
    Hello(HelloPayload),
    #[serde(rename = "location.update")]
    LocationUpdate(LocationUpdatePayload),
    #[serde(rename = "location.snapshotRequest")]
    SnapshotRequest(SnapshotRequestPayload),
    #[serde(rename = "location.snapshot")]
    LocationSnapshot(LocationSnapshotPayload),
    #[serde(rename = "package.assigned")]
    PackageAssigned(PackageAssignedPayload),
    #[serde(rename = "package.statusChanged")]
    PackageStatusChanged(PackageStatusPayload),
    #[serde(rename = "presence.changed")]
    PresenceChanged(PresencePayload),
    #[serde(rename = "fleet.snapshot")]
    FleetSnapshot(FleetSnapshot),
    #[serde(rename = "fleet.diff")]
    FleetDiff(FleetDiff),
    #[serde(rename = "command")]
    Command(Command),
    #[serde(rename = "command.result")]
    CommandResult(CommandResultPayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl WireMsg {
    pub fn kind(&self) -> EventKind {
        match self {
            WireMsg::Hello(_) => EventKind::Hello,
            WireMsg::LocationUpdate(_) => EventKind::LocationUpdate,
            WireMsg::SnapshotRequest(_) => EventKind::SnapshotRequest,
            WireMsg::LocationSnapshot(_) => EventKind::LocationSnapshot,
            WireMsg::PackageAssigned(_) => EventKind::PackageAssigned,
            WireMsg::PackageStatusChanged(_) => EventKind::PackageStatusChanged,
            WireMsg::PresenceChanged(_) => EventKind::PresenceChanged,
            WireMsg::FleetSnapshot(_) => EventKind::FleetSnapshot,
            WireMsg::FleetDiff(_) => EventKind::FleetDiff,
            WireMsg::Command(_) => EventKind::Command,
            WireMsg::CommandResult(_) => EventKind::CommandResult,
            WireMsg::Error(_) => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Hello,
    LocationUpdate,
    SnapshotRequest,
    LocationSnapshot,
    PackageAssigned,
    PackageStatusChanged,
    PresenceChanged,
    FleetSnapshot,
    FleetDiff,
    Command,
    CommandResult,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Hello => "hello",
            EventKind::LocationUpdate => "location.update",
            EventKind::SnapshotRequest => "location.snapshotRequest",
            EventKind::LocationSnapshot => "location.snapshot",
            EventKind::PackageAssigned => "package.assigned",
            EventKind::PackageStatusChanged => "package.statusChanged",
            EventKind::PresenceChanged => "presence.changed",
            EventKind::FleetSnapshot => "fleet.snapshot",
            EventKind::FleetDiff => "fleet.diff",
            EventKind::Command => "command",
            EventKind::CommandResult => "command.result",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub client_id: String,
    pub room: Room,
}

/// Coordinates arrive from devices as untrusted JSON, so they stay raw until
/// `to_sample` validates them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdatePayload {
    pub agent_id: AgentId,
    #[serde(default)]
    pub lat: Value,
    #[serde(default)]
    pub lng: Value,
    #[serde(default)]
    pub ts: Option<i64>,
}

impl LocationUpdatePayload {
    pub fn from_sample(sample: &PositionSample) -> Self {
        Self {
            agent_id: sample.agent_id,
            lat: Value::from(sample.position.lat),
            lng: Value::from(sample.position.lng),
            ts: Some(sample.ts_ms),
        }
    }

    /// Samples without a source timestamp are stamped with the receipt time.
    /// A timestamp that is not positive, or that runs more than
    /// `MAX_SAMPLE_SKEW_MS` ahead of receipt, is malformed.
    pub fn to_sample(&self, received_at_ms: i64) -> Result<PositionSample, CoordError> {
        let position = Coordinates::from_values(&self.lat, &self.lng)?;
        let ts_ms = match self.ts {
            None => received_at_ms,
            Some(ts) if ts <= 0 => {
                return Err(CoordError::MalformedInput(format!(
                    "ts must be positive, got {ts}"
                )))
            }
            Some(ts) if ts > received_at_ms.saturating_add(MAX_SAMPLE_SKEW_MS) => {
                return Err(CoordError::MalformedInput(format!(
                    "ts {ts} is ahead of the hub clock ({received_at_ms})"
                )))
            }
            Some(ts) => ts,
        };
        Ok(PositionSample {
            agent_id: self.agent_id,
            position,
            ts_ms,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRequestPayload {}

/// Keys are agent ids rendered as strings, the JSON object form of
/// `{agentId -> {lat, lng}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LocationSnapshotPayload {
    #[serde(default)]
    pub positions: BTreeMap<String, Coordinates>,
}

impl LocationSnapshotPayload {
    pub fn from_positions(positions: &BTreeMap<AgentId, Coordinates>) -> Self {
        Self {
            positions: positions
                .iter()
                .map(|(id, position)| (id.to_string(), *position))
                .collect(),
        }
    }

    /// Entries with unparsable agent ids are skipped.
    pub fn to_positions(&self) -> BTreeMap<AgentId, Coordinates> {
        self.positions
            .iter()
            .filter_map(|(id, position)| id.parse::<AgentId>().ok().map(|id| (id, *position)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageAssignedPayload {
    pub package_id: PackageId,
    pub agent_id: AgentId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatusPayload {
    pub package_id: PackageId,
    pub state: PackageState,
    #[serde(default)]
    pub previous: Option<PackageState>,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub agent_id: AgentId,
    pub state: Availability,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Assign {
        #[serde(rename = "packageId")]
        package_id: PackageId,
        #[serde(rename = "agentId")]
        agent_id: AgentId,
    },
    Cancel {
        #[serde(rename = "packageId")]
        package_id: PackageId,
    },
    Deliver {
        #[serde(rename = "packageId")]
        package_id: PackageId,
    },
    ToggleAvailability {
        #[serde(rename = "agentId")]
        agent_id: AgentId,
        available: bool,
    },
    AddPackage {
        destination: String,
    },
}

impl Command {
    pub fn action(&self) -> &'static str {
        match self {
            Command::Assign { .. } => "assign",
            Command::Cancel { .. } => "cancel",
            Command::Deliver { .. } => "deliver",
            Command::ToggleAvailability { .. } => "toggle_availability",
            Command::AddPackage { .. } => "add_package",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResultPayload {
    pub command: String,
    pub status: String,
    #[serde(default)]
    pub error: Option<ErrorPayload>,
    #[serde(default)]
    pub package: Option<Package>,
}

impl CommandResultPayload {
    pub fn ok(command: &Command, package: Option<Package>) -> Self {
        Self {
            command: command.action().to_string(),
            status: "ok".to_string(),
            error: None,
            package,
        }
    }

    pub fn rejected(command: &Command, err: &CoordError) -> Self {
        Self {
            command: command.action().to_string(),
            status: "rejected".to_string(),
            error: Some(ErrorPayload::from(err)),
            package: None,
        }
    }

    /// Rejection decided by the hub before the command reached the coordinator.
    pub fn refused(command: &Command, error: ErrorPayload) -> Self {
        Self {
            command: command.action().to_string(),
            status: "rejected".to_string(),
            error: Some(error),
            package: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<&CoordError> for ErrorPayload {
    fn from(err: &CoordError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_text<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_text<T: DeserializeOwned>(raw: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let trimmed = raw.trim_end_matches(['\r', '\n']);
    if trimmed.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: trimmed.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(trimmed).map_err(|err| FrameError::Decode(err.to_string()))
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Newline-delimited JSON decoder. A bad line is reported and skipped; the
/// lines after it still decode.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut frame = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            frame.pop();
            if frame.ends_with(b"\r") {
                frame.pop();
            }
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            self.decode_raw_frame(&frame, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let final_frame = std::mem::take(&mut self.pending);
        if !final_frame.iter().all(u8::is_ascii_whitespace) {
            self.decode_raw_frame(&final_frame, &mut report);
        }
        report
    }

    fn decode_raw_frame(&self, frame: &[u8], report: &mut DecodeReport<T>) {
        if frame.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(frame) {
            Ok(parsed) => report.frames.push(parsed),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}
