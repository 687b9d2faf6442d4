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

//! Raw, newline-delimited JSON transport for scripted/automation
//! clients (spec §4.8). Every frame is one action; every action gets
//! exactly one response, plus the process may push unsolicited
//! broadcast events at any time.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec};

use crate::coordinator::{AutomationEvent, CoordinatorHandle};
use crate::preset::PresetId;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Action {
    RecallPreset {
        id: PresetId,
        #[serde(default)]
        fade_time: Option<u64>,
    },
    Blackout {
        #[serde(default)]
        fade_time: Option<u64>,
    },
    SetChannel {
        channel: u32,
        value: u8,
    },
    MasterDimmer {
        value: u8,
    },
    SetMode {
        fixture_id: crate::fixture::FixtureId,
        mode_name: String,
    },
    Trigger {
        channel: u32,
        state: TriggerState,
    },
    GetState,
    ListPresets,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TriggerState {
    On,
    Off,
}

/// The response envelope for every inbound action (spec §4.8) and,
/// with `status: "event"`, for unsolicited broadcasts too — the same
/// three-field shape covers both, so automation clients parse one
/// schema regardless of whether a frame answers their own command or
/// announces someone else's.
#[derive(Debug, Serialize)]
struct Envelope {
    status: &'static str,
    action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl Envelope {
    fn ok(action: &str, data: Option<Value>) -> Self {
        Envelope { status: "ok", action: action.to_string(), data, message: None }
    }

    fn error(action: &str, message: impl Into<String>) -> Self {
        Envelope { status: "error", action: action.to_string(), data: None, message: Some(message.into()) }
    }

    fn event(name: &str, data: Value) -> Self {
        Envelope { status: "event", action: name.to_string(), data: Some(data), message: None }
    }
}

pub async fn serve(
    listener: TcpListener,
    coordinator: CoordinatorHandle,
    events: broadcast::Sender<AutomationEvent>,
) -> std::io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "automation server listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::warn!(%error, "failed to accept automation connection");
                continue;
            }
        };
        let coordinator = coordinator.clone();
        let events = events.subscribe();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, coordinator, events).await {
                tracing::debug!(%peer, %error, "automation connection closed");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    coordinator: CoordinatorHandle,
    mut events: broadcast::Receiver<AutomationEvent>,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new());

    loop {
        tokio::select! {
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(line)) => {
                        let envelope = handle_line(&line, &coordinator).await;
                        let text = serde_json::to_string(&envelope)?;
                        framed.send(text).await?;
                    }
                    Some(Err(error)) => {
                        tracing::debug!(%error, "automation connection read error");
                        return Ok(());
                    }
                    None => return Ok(()),
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let envelope = automation_event_envelope(event);
                        let text = serde_json::to_string(&envelope)?;
                        framed.send(text).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "automation client fell behind the event broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

async fn handle_line(line: &str, coordinator: &CoordinatorHandle) -> Envelope {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(%error, "malformed automation frame");
            return Envelope::error("unknown", format!("malformed request: {error}"));
        }
    };

    // The action name is read out ahead of the full parse so an error
    // in the action's own arguments can still echo it (spec §4.8):
    // only a frame with no recognizable `action` field falls back to
    // "unknown".
    let action_name = value.get("action").and_then(Value::as_str).unwrap_or("unknown").to_string();

    let action: Action = match serde_json::from_value(value) {
        Ok(action) => action,
        Err(error) => {
            tracing::warn!(%error, action = %action_name, "invalid automation action arguments");
            return Envelope::error(&action_name, format!("invalid arguments: {error}"));
        }
    };

    match action {
        Action::RecallPreset { id, fade_time } => match coordinator.recall_preset(id, fade_time).await {
            Ok(()) => Envelope::ok("recall_preset", None),
            Err(error) => Envelope::error("recall_preset", error.to_string()),
        },
        Action::Blackout { fade_time } => {
            coordinator.blackout(fade_time).await;
            Envelope::ok("blackout", None)
        }
        Action::SetChannel { channel, value } => {
            coordinator.set_channel(channel, value).await;
            Envelope::ok("set_channel", None)
        }
        Action::MasterDimmer { value } => {
            coordinator.set_master(value).await;
            Envelope::ok("master_dimmer", None)
        }
        Action::SetMode { fixture_id, mode_name } => match coordinator.set_fixture_mode(fixture_id, mode_name).await {
            Ok(()) => Envelope::ok("set_mode", None),
            Err(error) => Envelope::error("set_mode", error.to_string()),
        },
        Action::Trigger { channel, state } => {
            match state {
                TriggerState::On => coordinator.trigger_start(channel).await,
                TriggerState::Off => coordinator.trigger_end(channel).await,
            }
            Envelope::ok("trigger", None)
        }
        Action::GetState => {
            let (channels, master) = coordinator.get_state().await;
            Envelope::ok("get_state", Some(serde_json::json!({ "channels": channels, "master": master })))
        }
        Action::ListPresets => {
            let presets = coordinator.list_presets().await;
            Envelope::ok("list_presets", Some(serde_json::to_value(presets).unwrap_or(Value::Null)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::profile::ProfileLoader;

    fn test_handle() -> CoordinatorHandle {
        crate::coordinator::spawn(ProfileLoader::default(), Some("/dev/nonexistent-dmxd-test".into())).handle
    }

    #[tokio::test]
    async fn malformed_json_reports_unknown_action() {
        let handle = test_handle();
        let envelope = handle_line("not json at all", &handle).await;
        assert_eq!(envelope.status, "error");
        assert_eq!(envelope.action, "unknown");
    }

    #[tokio::test]
    async fn missing_argument_echoes_the_real_action_name() {
        let handle = test_handle();
        let envelope = handle_line(r#"{"action":"set_channel","channel":1}"#, &handle).await;
        assert_eq!(envelope.status, "error");
        assert_eq!(envelope.action, "set_channel");
    }

    #[tokio::test]
    async fn well_formed_action_succeeds() {
        let handle = test_handle();
        let envelope = handle_line(r#"{"action":"set_channel","channel":1,"value":200}"#, &handle).await;
        assert_eq!(envelope.status, "ok");
        assert_eq!(envelope.action, "set_channel");
    }
}

fn automation_event_envelope(event: AutomationEvent) -> Envelope {
    match event {
        AutomationEvent::DmxStatus { connected } => {
            Envelope::event("dmx_status", serde_json::json!({ "connected": connected }))
        }
        AutomationEvent::PresetActivated { id, name } => {
            Envelope::event("preset_activated", serde_json::json!({ "id": id, "name": name }))
        }
        AutomationEvent::PresetsUpdated { presets } => {
            Envelope::event("presets_updated", serde_json::to_value(presets).unwrap_or(Value::Null))
        }
    }
}
