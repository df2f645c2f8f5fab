use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CoordError;

pub type AgentId = i64;
pub type PackageId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Available,
    Busy,
    Inactive,
}

impl Default for Availability {
    fn default() -> Self {
        Self::Inactive
    }
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::Busy => "busy",
            Availability::Inactive => "inactive",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Availability::Inactive)
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Availability {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "available" | "disponible" => Ok(Availability::Available),
            "busy" | "ocupado" => Ok(Availability::Busy),
            "inactive" | "inactivo" => Ok(Availability::Inactive),
            other => Err(format!("Unknown availability: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    Pending,
    InTransit,
    Delivered,
    Cancelled,
}

impl Default for PackageState {
    fn default() -> Self {
        Self::Pending
    }
}

impl PackageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageState::Pending => "pending",
            PackageState::InTransit => "in_transit",
            PackageState::Delivered => "delivered",
            PackageState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PackageState::Delivered | PackageState::Cancelled)
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Ok(PackageState::Pending),
            "in_transit" | "in-transit" | "intransit" => Ok(PackageState::InTransit),
            "delivered" => Ok(PackageState::Delivered),
            "cancelled" | "canceled" => Ok(PackageState::Cancelled),
            other => Err(format!("Unknown package state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Result<Self, CoordError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(CoordError::MalformedInput(
                "coordinates must be finite".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordError::MalformedInput(format!(
                "latitude out of range: {lat}"
            )));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(CoordError::MalformedInput(format!(
                "longitude out of range: {lng}"
            )));
        }
        Ok(Self { lat, lng })
    }

    /// Parses untrusted JSON coordinate fields. Numeric strings are accepted,
    /// anything else is `MalformedInput`.
    pub fn from_values(lat: &Value, lng: &Value) -> Result<Self, CoordError> {
        Self::new(coordinate_value("lat", lat)?, coordinate_value("lng", lng)?)
    }
}

fn coordinate_value(field: &str, value: &Value) -> Result<f64, CoordError> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| CoordError::MalformedInput(format!("{field} is not representable"))),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| CoordError::MalformedInput(format!("{field} is not numeric: {text}"))),
        Value::Null => Err(CoordError::MalformedInput(format!("{field} is missing"))),
        other => Err(CoordError::MalformedInput(format!(
            "{field} has unexpected type: {other}"
        ))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub availability: Availability,
    #[serde(default)]
    pub position: Option<Coordinates>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: PackageId,
    pub destination: String,
    #[serde(default)]
    pub state: PackageState,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

impl Package {
    pub fn pending(id: PackageId, destination: impl Into<String>) -> Self {
        Self {
            id,
            destination: destination.into(),
            state: PackageState::Pending,
            agent_id: None,
        }
    }

    /// Owner is present exactly when the package has been assigned: InTransit,
    /// Delivered, or Cancelled after assignment. A package cancelled while
    /// still Pending never gets an owner.
    pub fn owner_consistent(&self) -> bool {
        match self.state {
            PackageState::Pending => self.agent_id.is_none(),
            PackageState::InTransit | PackageState::Delivered => self.agent_id.is_some(),
            PackageState::Cancelled => true,
        }
    }

    pub fn visible_to(&self, agent_id: AgentId) -> bool {
        self.agent_id == Some(agent_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub agent_id: AgentId,
    pub position: Coordinates,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Room {
    Admin,
    Agent(AgentId),
}

impl Room {
    pub fn agent_id(&self) -> Option<AgentId> {
        match self {
            Room::Admin => None,
            Room::Agent(id) => Some(*id),
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Admin => f.write_str("admin"),
            Room::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

impl FromStr for Room {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        if normalized == "admin" {
            return Ok(Room::Admin);
        }
        match normalized.split_once(':') {
            Some(("agent", id)) => id
                .parse::<AgentId>()
                .map(Room::Agent)
                .map_err(|err| format!("invalid agent room '{input}': {err}")),
            _ => Err(format!("Unknown room: {input}")),
        }
    }
}

impl Serialize for Room {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Room {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEntry {
    pub name: String,
    pub availability: Availability,
    #[serde(default)]
    pub position: Option<Coordinates>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FleetSnapshot {
    pub seq: u64,
    #[serde(default, with = "id_keyed")]
    pub agents: BTreeMap<AgentId, AgentEntry>,
    #[serde(default, with = "id_keyed")]
    pub packages: BTreeMap<PackageId, Package>,
}

/// Integer-keyed maps written with string keys so they decode through the
/// flattened wire envelope, which buffers payloads before typing them.
mod id_keyed {
    use serde::de::{self, Deserialize, DeserializeOwned, Deserializer};
    use serde::ser::{Serialize, SerializeMap, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<V, S>(map: &BTreeMap<i64, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        V: Serialize,
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(&key.to_string(), value)?;
        }
        out.end()
    }

    pub fn deserialize<'de, V, D>(deserializer: D) -> Result<BTreeMap<i64, V>, D::Error>
    where
        V: DeserializeOwned,
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, V>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, value)| {
                key.trim()
                    .parse::<i64>()
                    .map(|id| (id, value))
                    .map_err(|err| de::Error::custom(format!("invalid id key '{key}': {err}")))
            })
            .collect()
    }
}

impl FleetSnapshot {
    pub fn pending(&self) -> Vec<&Package> {
        self.packages
            .values()
            .filter(|package| package.state == PackageState::Pending)
            .collect()
    }

    pub fn packages_for_agent(&self, agent_id: AgentId) -> Vec<&Package> {
        self.packages
            .values()
            .filter(|package| package.visible_to(agent_id))
            .collect()
    }

    pub fn positions(&self) -> BTreeMap<AgentId, Coordinates> {
        self.agents
            .iter()
            .filter_map(|(id, entry)| entry.position.map(|position| (*id, position)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentChange {
    pub op: ChangeOp,
    pub agent_id: AgentId,
    #[serde(default)]
    pub entry: Option<AgentEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageChange {
    pub op: ChangeOp,
    pub package: Package,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FleetDiff {
    pub seq: u64,
    #[serde(default)]
    pub agents: Vec<AgentChange>,
    #[serde(default)]
    pub packages: Vec<PackageChange>,
}

impl FleetDiff {
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.packages.is_empty()
    }
}
