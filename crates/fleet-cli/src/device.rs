//! Device producer: one agent's phone, fed from stdin.
//!
//! Each stdin line is either a geolocation sample `{"lat":..,"lng":..,"ts":..}`
//! or a command object such as `{"action":"deliver","packageId":101}`.

use crate::input::spawn_ndjson_reader;
use anyhow::{bail, Context, Result};
use clap::Args;
use fleet_channel::{ChannelConfig, ChannelEvent, RealtimeChannel};
use fleet_core::model::{AgentId, Room};
use fleet_core::wire::{Command, LocationUpdatePayload, WireMsg};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Agent id this device reports for.
    #[arg(long)]
    pub agent_id: AgentId,
    #[arg(long, default_value = "")]
    pub hub: String,
    #[arg(long, default_value = "")]
    pub client_id: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DeviceLine {
    Command(Command),
    Sample {
        lat: Value,
        lng: Value,
        #[serde(default)]
        ts: Option<i64>,
    },
}

impl DeviceLine {
    pub fn into_msg(self, agent_id: AgentId) -> WireMsg {
        match self {
            DeviceLine::Command(command) => WireMsg::Command(command),
            DeviceLine::Sample { lat, lng, ts } => WireMsg::LocationUpdate(LocationUpdatePayload {
                agent_id,
                lat,
                lng,
                ts,
            }),
        }
    }
}

pub async fn run(args: AgentArgs) -> Result<()> {
    let endpoint = crate::resolve_hub_url(&args.hub)?;
    let client_id = if args.client_id.trim().is_empty() {
        format!("device-{}-{}", args.agent_id, std::process::id())
    } else {
        args.client_id.clone()
    };
    let channel = RealtimeChannel::connect(ChannelConfig::new(
        endpoint.clone(),
        client_id,
        Room::Agent(args.agent_id),
    ))
    .await
    .with_context(|| format!("Failed to connect to {endpoint}"))?;
    info!(event = "device_started", agent_id = args.agent_id, hub = %endpoint);

    let mut inbound = channel.subscribe_all();
    let (tx, mut lines) = mpsc::channel::<DeviceLine>(64);
    spawn_ndjson_reader(tokio::io::stdin(), tx);

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => {
                    let msg = line.into_msg(args.agent_id);
                    channel.publish(msg).await.context("Hub channel closed")?;
                }
                None => break,
            },
            event = inbound.recv() => match event {
                Some(ChannelEvent::Message(envelope)) => {
                    println!("{}", serde_json::to_string(&envelope)?);
                }
                Some(ChannelEvent::Reconnecting { attempt, error, .. }) => {
                    warn!(event = "device_reconnecting", attempt, error = %error);
                }
                Some(ChannelEvent::Reconnected { .. }) => {}
                Some(ChannelEvent::Lost { attempts, error }) => {
                    bail!("Lost connection to hub after {attempts} attempts: {error}");
                }
                None => bail!("Hub channel closed"),
            },
        }
    }

    channel.disconnect().await;
    Ok(())
}
