// Licence: GNU GPLv3
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Full-duplex WebSocket transport for rich UI clients (spec §4.7).
//!
//! One task per connection reads inbound JSON commands and forwards
//! them to the [`CoordinatorHandle`]; a second task per connection
//! drains the shared [`LiveEvent`] broadcast and writes it out. This is
//! the bidirectional generalization of the teacher's one-filter-chain-
//! per-concern `WebInterface::run`.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::coordinator::{CoordinatorHandle, LiveEvent};
use crate::fixture::registry::FixtureExport;
use crate::fixture::{CanvasLayout, ChannelBinding, ColorMode, FixtureId};
use crate::preset::{PresetId, PresetPatch};
use crate::transmitter::TransmitterStatus;

#[derive(Debug, Deserialize)]
struct ChannelValue {
    channel: u32,
    value: u8,
}

// `rename_all` on the enum itself only renames variant tags, not
// struct-variant field names, so every multi-word field gets its own
// camelCase wire name (spec §4.7) the same way `fixture_type` below
// already gets one to dodge the `type` tag key.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum InboundMessage {
    #[serde(rename = "dmx:set-channel")]
    DmxSetChannel { channel: u32, value: u8 },
    #[serde(rename = "dmx:set-channels")]
    DmxSetChannels { values: Vec<ChannelValue> },
    #[serde(rename = "dmx:master")]
    DmxMaster { value: u8 },
    #[serde(rename = "dmx:blackout")]
    DmxBlackout {
        #[serde(default, rename = "fadeTime")]
        fade_time: Option<u64>,
    },
    #[serde(rename = "preset:recall")]
    PresetRecall {
        id: PresetId,
        #[serde(default, rename = "fadeTime")]
        fade_time: Option<u64>,
    },
    #[serde(rename = "preset:save")]
    PresetSave {
        name: String,
        #[serde(rename = "fadeTime")]
        fade_time: u64,
        color: String,
    },
    #[serde(rename = "preset:update")]
    PresetUpdate {
        id: PresetId,
        #[serde(flatten)]
        patch: PresetPatch,
    },
    #[serde(rename = "preset:delete")]
    PresetDelete { id: PresetId },
    #[serde(rename = "fixture:create")]
    FixtureCreate {
        name: String,
        #[serde(rename = "fixtureType")]
        fixture_type: String,
        channels: Vec<ChannelBinding>,
        #[serde(rename = "colorMode")]
        color_mode: ColorMode,
    },
    #[serde(rename = "fixture:update")]
    FixtureUpdate {
        id: FixtureId,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        channels: Option<Vec<ChannelBinding>>,
        #[serde(default)]
        canvas: Option<Option<CanvasLayout>>,
    },
    #[serde(rename = "fixture:delete")]
    FixtureDelete { id: FixtureId },
    #[serde(rename = "fixture:create-from-profile")]
    FixtureCreateFromProfile {
        name: String,
        #[serde(rename = "profileId")]
        profile_id: String,
        #[serde(rename = "startAddress")]
        start_address: u32,
    },
    #[serde(rename = "fixture:set-mode")]
    FixtureSetMode {
        #[serde(rename = "fixtureId")]
        fixture_id: FixtureId,
        #[serde(rename = "modeName")]
        mode_name: String,
    },
    #[serde(rename = "fixture:trigger-start")]
    FixtureTriggerStart { channel: u32 },
    #[serde(rename = "fixture:trigger-end")]
    FixtureTriggerEnd { channel: u32 },
    #[serde(rename = "fixture:get-profiles")]
    FixtureGetProfiles,
    #[serde(rename = "fixture:export")]
    FixtureExportRequest,
    #[serde(rename = "fixture:import")]
    FixtureImport {
        export: FixtureExport,
        #[serde(default)]
        merge: bool,
    },
}

/// Serve the live-client WebSocket listener until the process shuts
/// down. The listener is bound by the caller so a bind failure (spec
/// §7, fatal at startup) surfaces before the process reports itself as
/// running.
pub async fn serve(
    listener: TcpListener,
    coordinator: CoordinatorHandle,
    events: broadcast::Sender<LiveEvent>,
    transmitter_status: watch::Receiver<TransmitterStatus>,
) -> std::io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "live-client server listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::warn!(%error, "failed to accept live-client connection");
                continue;
            }
        };
        let coordinator = coordinator.clone();
        let events = events.subscribe();
        let transmitter_status = transmitter_status.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, coordinator, events, transmitter_status).await {
                tracing::debug!(%peer, %error, "live-client connection closed");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    coordinator: CoordinatorHandle,
    mut events: broadcast::Receiver<LiveEvent>,
    transmitter_status: watch::Receiver<TransmitterStatus>,
) -> anyhow::Result<()> {
    let websocket = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = websocket.split();
    let (direct_tx, mut direct_rx) = tokio::sync::mpsc::unbounded_channel::<LiveEvent>();

    send_connect_sequence(&mut write, &coordinator, &transmitter_status).await?;

    loop {
        tokio::select! {
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&text, &coordinator, &direct_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {} // binary/ping/pong frames carry no commands
                    Some(Err(error)) => {
                        tracing::debug!(%error, "live-client read error");
                        return Ok(());
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => send_event(&mut write, &event).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "live-client fell behind the event broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }

            direct = direct_rx.recv() => {
                match direct {
                    Some(event) => send_event(&mut write, &event).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}

async fn send_connect_sequence<S>(
    write: &mut S,
    coordinator: &CoordinatorHandle,
    transmitter_status: &watch::Receiver<TransmitterStatus>,
) -> anyhow::Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let (channels, master) = coordinator.get_state().await;
    send_event(write, &LiveEvent::DmxState { channels, master }).await?;

    // Read directly off the watch channel rather than waiting for the
    // next transition (spec §4.7 order: `dmx:status` is the second
    // connect message regardless of how long the transmitter has been
    // in its current state).
    let status = transmitter_status.borrow().clone();
    let connected = matches!(status, TransmitterStatus::Connected { .. });
    let port = status.connected_port().map(|p| p.to_string());
    send_event(write, &LiveEvent::DmxStatus { connected, port }).await?;

    let presets = coordinator.get_presets().await;
    send_event(write, &LiveEvent::PresetsList { presets }).await?;

    let fixtures = coordinator.export_fixtures().await.fixtures;
    send_event(write, &LiveEvent::FixturesList { fixtures }).await?;

    let profiles = coordinator.get_profiles().await;
    send_event(write, &LiveEvent::FixturesProfiles { profiles }).await?;

    let conflicts = coordinator.get_conflicts().await;
    if !conflicts.is_empty() {
        send_event(write, &LiveEvent::FixturesConflicts { conflicts }).await?;
    }

    Ok(())
}

async fn send_event<S>(write: &mut S, event: &LiveEvent) -> anyhow::Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(event)?;
    write.send(Message::Text(text)).await?;
    Ok(())
}

async fn handle_inbound(
    text: &str,
    coordinator: &CoordinatorHandle,
    direct_tx: &tokio::sync::mpsc::UnboundedSender<LiveEvent>,
) {
    let message: InboundMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(error) => {
            tracing::warn!(%error, "ignoring malformed live-client message");
            return;
        }
    };

    match message {
        InboundMessage::DmxSetChannel { channel, value } => coordinator.set_channel(channel, value).await,
        InboundMessage::DmxSetChannels { values } => {
            coordinator
                .set_channels(values.into_iter().map(|cv| (cv.channel, cv.value)).collect())
                .await
        }
        InboundMessage::DmxMaster { value } => coordinator.set_master(value).await,
        InboundMessage::DmxBlackout { fade_time } => coordinator.blackout(fade_time).await,
        InboundMessage::PresetRecall { id, fade_time } => {
            coordinator.recall_preset_no_reply(id, fade_time).await;
        }
        InboundMessage::PresetSave { name, fade_time, color } => {
            coordinator.save_preset(name, fade_time, color).await;
        }
        InboundMessage::PresetUpdate { id, patch } => {
            if let Err(error) = coordinator.update_preset(id, patch).await {
                tracing::warn!(%error, "preset:update failed");
            }
        }
        InboundMessage::PresetDelete { id } => {
            coordinator.delete_preset(id).await;
        }
        InboundMessage::FixtureCreate { name, fixture_type, channels, color_mode } => {
            coordinator.create_fixture(name, fixture_type, channels, color_mode).await;
        }
        InboundMessage::FixtureUpdate { id, name, channels, canvas } => {
            if let Err(error) = coordinator.update_fixture(id, name, channels, canvas).await {
                tracing::warn!(%error, "fixture:update failed");
            }
        }
        InboundMessage::FixtureDelete { id } => {
            coordinator.delete_fixture(id).await;
        }
        InboundMessage::FixtureCreateFromProfile { name, profile_id, start_address } => {
            if let Err(error) = coordinator.create_fixture_from_profile(name, profile_id, start_address).await {
                tracing::warn!(%error, "fixture:create-from-profile failed");
            }
        }
        InboundMessage::FixtureSetMode { fixture_id, mode_name } => {
            if let Err(error) = coordinator.set_fixture_mode(fixture_id, mode_name).await {
                tracing::warn!(%error, "fixture:set-mode failed");
            }
        }
        InboundMessage::FixtureTriggerStart { channel } => coordinator.trigger_start(channel).await,
        InboundMessage::FixtureTriggerEnd { channel } => coordinator.trigger_end(channel).await,
        InboundMessage::FixtureGetProfiles => {
            let profiles = coordinator.get_profiles().await;
            direct_tx.send(LiveEvent::FixturesProfiles { profiles }).ok();
        }
        InboundMessage::FixtureExportRequest => {
            let export = coordinator.export_fixtures().await;
            direct_tx.send(LiveEvent::FixtureExportResult { export }).ok();
        }
        InboundMessage::FixtureImport { export, merge } => {
            let result = coordinator.import_fixtures(export, merge).await;
            direct_tx
                .send(LiveEvent::FixtureImportResult {
                    added: result.added,
                    skipped: result.skipped,
                    conflicts: result.conflicts,
                })
                .ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_struct_variant_fields_parse_camel_case() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"type":"fixture:create-from-profile","name":"Light","profileId":"tester","startAddress":10}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::FixtureCreateFromProfile { name, profile_id, start_address } => {
                assert_eq!(name, "Light");
                assert_eq!(profile_id, "tester");
                assert_eq!(start_address, 10);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn fixture_create_type_field_does_not_collide_with_the_tag() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"type":"fixture:create","name":"Light","fixtureType":"Par64","channels":[],"colorMode":"rgb"}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::FixtureCreate { fixture_type, .. } => assert_eq!(fixture_type, "Par64"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
