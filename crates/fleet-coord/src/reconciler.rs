//! Canonical per-agent positions from two disagreeing sources: pushed device
//! samples and the periodic pull snapshot.

use fleet_core::model::{AgentId, Coordinates, PositionSample};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(2_000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Which clock the debounce window is measured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PositionPolicy {
    /// Gap between the sample's own timestamp and the last applied one. An
    /// older sample can never replace a newer position.
    #[default]
    SourceTimestamp,
    /// Gap between receipt times. A stale sample arriving late still lands.
    ReceiptTime,
}

impl PositionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionPolicy::SourceTimestamp => "source_timestamp",
            PositionPolicy::ReceiptTime => "receipt_time",
        }
    }
}

impl fmt::Display for PositionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionPolicy {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().replace('-', "_").as_str() {
            "source" | "source_timestamp" => Ok(PositionPolicy::SourceTimestamp),
            "receipt" | "receipt_time" => Ok(PositionPolicy::ReceiptTime),
            other => Err(format!("Unknown position policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    Push,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionChange {
    pub agent_id: AgentId,
    pub position: Option<Coordinates>,
    pub source: PositionSource,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PushOutcome {
    Applied(PositionChange),
    Debounced { since_last_ms: i64 },
}

#[derive(Debug, Clone, Default)]
struct Track {
    position: Option<Coordinates>,
    source: Option<PositionSource>,
    last_push_ts: Option<i64>,
    last_push_received: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct LocationReconciler {
    policy: PositionPolicy,
    debounce_window_ms: i64,
    poll_interval_ms: i64,
    tracks: HashMap<AgentId, Track>,
}

impl Default for LocationReconciler {
    fn default() -> Self {
        Self::new(
            PositionPolicy::default(),
            DEFAULT_DEBOUNCE_WINDOW,
            DEFAULT_POLL_INTERVAL,
        )
    }
}

impl LocationReconciler {
    pub fn new(policy: PositionPolicy, debounce_window: Duration, poll_interval: Duration) -> Self {
        Self {
            policy,
            debounce_window_ms: duration_ms(debounce_window),
            poll_interval_ms: duration_ms(poll_interval),
            tracks: HashMap::new(),
        }
    }

    pub fn policy(&self) -> PositionPolicy {
        self.policy
    }

    /// Applies a pushed sample when it clears the debounce window for its
    /// agent. The first sample for an agent always applies.
    pub fn apply_push(&mut self, sample: PositionSample, received_at_ms: i64) -> PushOutcome {
        let track = self.tracks.entry(sample.agent_id).or_default();
        let (now, last) = match self.policy {
            PositionPolicy::SourceTimestamp => (sample.ts_ms, track.last_push_ts),
            PositionPolicy::ReceiptTime => (received_at_ms, track.last_push_received),
        };
        if let Some(last) = last {
            let since_last_ms = now.saturating_sub(last);
            if since_last_ms <= self.debounce_window_ms {
                return PushOutcome::Debounced { since_last_ms };
            }
        }

        track.position = Some(sample.position);
        track.source = Some(PositionSource::Push);
        track.last_push_ts = Some(sample.ts_ms);
        track.last_push_received = Some(received_at_ms);
        PushOutcome::Applied(PositionChange {
            agent_id: sample.agent_id,
            position: Some(sample.position),
            source: PositionSource::Push,
        })
    }

    /// Merges a full-fleet pull. Agents pushed within the poll interval keep
    /// their pushed position; every other listed agent takes the snapshot
    /// value, including `None`. Agents missing from the snapshot are untouched.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &BTreeMap<AgentId, Option<Coordinates>>,
        now_ms: i64,
    ) -> Vec<PositionChange> {
        let mut changes = Vec::new();
        for (agent_id, position) in snapshot {
            let track = self.tracks.entry(*agent_id).or_default();
            let push_fresh = track
                .last_push_received
                .map(|received| now_ms - received <= self.poll_interval_ms)
                .unwrap_or(false);
            if push_fresh || track.position == *position {
                continue;
            }
            track.position = *position;
            track.source = Some(PositionSource::Snapshot);
            changes.push(PositionChange {
                agent_id: *agent_id,
                position: *position,
                source: PositionSource::Snapshot,
            });
        }
        changes
    }

    pub fn position(&self, agent_id: AgentId) -> Option<Coordinates> {
        self.tracks.get(&agent_id).and_then(|track| track.position)
    }

    pub fn source(&self, agent_id: AgentId) -> Option<PositionSource> {
        self.tracks.get(&agent_id).and_then(|track| track.source)
    }

    pub fn positions(&self) -> BTreeMap<AgentId, Coordinates> {
        self.tracks
            .iter()
            .filter_map(|(id, track)| track.position.map(|position| (*id, position)))
            .collect()
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
