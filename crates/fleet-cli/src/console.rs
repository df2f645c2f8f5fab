use crate::input::spawn_ndjson_reader;
use anyhow::{bail, Context, Result};
use clap::Args;
use fleet_channel::{ChannelConfig, ChannelEvent, RealtimeChannel};
use fleet_coord::apply_diff;
use fleet_core::model::{AgentEntry, AgentId, ChangeOp, FleetSnapshot, Package, Room};
use fleet_core::wire::{Command, SnapshotRequestPayload, WireMsg};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Args, Debug)]
pub struct ConsoleArgs {
    #[arg(long, default_value = "")]
    pub hub: String,
    #[arg(long, default_value = "")]
    pub client_id: String,
}

/// Local replica of the fleet projection, kept current from `fleet.snapshot`
/// and `fleet.diff` messages.
#[derive(Debug, Default)]
pub struct ConsoleState {
    snapshot: Option<FleetSnapshot>,
}

#[derive(Debug, Default, PartialEq)]
pub struct ConsoleUpdate {
    pub lines: Vec<String>,
    /// The replica fell behind and needs a fresh `fleet.snapshot`.
    pub resync: bool,
}

impl ConsoleState {
    pub fn snapshot(&self) -> Option<&FleetSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn apply(&mut self, msg: &WireMsg) -> ConsoleUpdate {
        let mut update = ConsoleUpdate::default();
        match msg {
            WireMsg::FleetSnapshot(snapshot) => {
                if self
                    .snapshot
                    .as_ref()
                    .is_some_and(|current| current.seq > snapshot.seq)
                {
                    return update;
                }
                update.lines.push(format!(
                    "fleet seq={} agents={} packages={} pending={}",
                    snapshot.seq,
                    snapshot.agents.len(),
                    snapshot.packages.len(),
                    snapshot.pending().len()
                ));
                for (agent_id, entry) in &snapshot.agents {
                    update.lines.push(agent_line(*agent_id, entry));
                }
                for package in snapshot.packages.values() {
                    update.lines.push(package_line(package));
                }
                self.snapshot = Some(snapshot.clone());
            }
            WireMsg::FleetDiff(diff) => {
                let Some(snapshot) = self.snapshot.as_mut() else {
                    update.resync = true;
                    return update;
                };
                if diff.seq <= snapshot.seq {
                    return update;
                }
                if !apply_diff(snapshot, diff) {
                    update.resync = true;
                    return update;
                }
                for change in &diff.agents {
                    match (&change.op, &change.entry) {
                        (ChangeOp::Removed, _) | (_, None) => {
                            update.lines.push(format!("agent {} removed", change.agent_id))
                        }
                        (_, Some(entry)) => update.lines.push(agent_line(change.agent_id, entry)),
                    }
                }
                for change in &diff.packages {
                    update.lines.push(package_line(&change.package));
                }
            }
            WireMsg::CommandResult(result) => match &result.error {
                None => update.lines.push(format!("{} ok", result.command)),
                Some(error) => update.lines.push(format!(
                    "{} {}: {} ({})",
                    result.command, result.status, error.code, error.message
                )),
            },
            WireMsg::Error(error) => {
                update
                    .lines
                    .push(format!("error {}: {}", error.code, error.message));
            }
            _ => {}
        }
        update
    }
}

fn agent_line(agent_id: AgentId, entry: &AgentEntry) -> String {
    match entry.position {
        Some(position) => format!(
            "agent {agent_id} {} {} at {:.5},{:.5}",
            entry.name, entry.availability, position.lat, position.lng
        ),
        None => format!("agent {agent_id} {} {}", entry.name, entry.availability),
    }
}

fn package_line(package: &Package) -> String {
    match package.agent_id {
        Some(agent_id) => format!(
            "package {} {} -> agent {agent_id} ({})",
            package.id, package.state, package.destination
        ),
        None => format!("package {} {} ({})", package.id, package.state, package.destination),
    }
}

pub async fn run(args: ConsoleArgs) -> Result<()> {
    let endpoint = crate::resolve_hub_url(&args.hub)?;
    let client_id = if args.client_id.trim().is_empty() {
        format!("console-{}", std::process::id())
    } else {
        args.client_id.clone()
    };
    let channel = RealtimeChannel::connect(ChannelConfig::new(endpoint.clone(), client_id, Room::Admin))
        .await
        .with_context(|| format!("Failed to connect to {endpoint}"))?;
    info!(event = "console_started", hub = %endpoint);

    let mut inbound = channel.subscribe_all();
    // The join snapshot may have arrived before the subscription.
    channel
        .publish(WireMsg::SnapshotRequest(SnapshotRequestPayload::default()))
        .await
        .context("Hub channel closed")?;

    let (tx, mut commands) = mpsc::channel::<Command>(16);
    spawn_ndjson_reader(tokio::io::stdin(), tx);
    let mut commands_open = true;
    let mut request_seq: u64 = 0;
    let mut state = ConsoleState::default();

    loop {
        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                Some(command) => {
                    request_seq += 1;
                    let request_id = format!("cmd-{request_seq}");
                    debug!(event = "command_sent", action = command.action(), request_id = %request_id);
                    channel
                        .publish_request(WireMsg::Command(command), Some(request_id))
                        .await
                        .context("Hub channel closed")?;
                }
                None => commands_open = false,
            },
            event = inbound.recv() => match event {
                Some(ChannelEvent::Message(envelope)) => {
                    let update = state.apply(&envelope.msg);
                    for line in &update.lines {
                        println!("{line}");
                    }
                    if update.resync {
                        channel
                            .publish(WireMsg::SnapshotRequest(SnapshotRequestPayload::default()))
                            .await
                            .context("Hub channel closed")?;
                    }
                }
                Some(ChannelEvent::Reconnecting { attempt, error, .. }) => {
                    warn!(event = "console_reconnecting", attempt, error = %error);
                }
                Some(ChannelEvent::Reconnected { .. }) => {
                    channel
                        .publish(WireMsg::SnapshotRequest(SnapshotRequestPayload::default()))
                        .await
                        .context("Hub channel closed")?;
                }
                Some(ChannelEvent::Lost { attempts, error }) => {
                    bail!("Lost connection to hub after {attempts} attempts: {error}");
                }
                None => bail!("Hub channel closed"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    channel.disconnect().await;
    Ok(())
}
