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

//! The single-writer actor (spec §4.9, §5): one task owns the
//! Universe, the Fixture Registry, and the Preset Store. Every other
//! task — both network servers, the Fade Engine's completion path —
//! reaches them only by sending a [`CoordinatorCommand`], the same
//! shape as the teacher's `SystemInterface::run`/`run_once` split over
//! a single `GeneralUpdateType` channel.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::fade::FadeEngine;
use crate::fixture::profile::ProfileEntry;
use crate::fixture::registry::{FixtureExport, ImportResult, RegistryError};
use crate::fixture::{CanvasLayout, ChannelBinding, ColorMode, Fixture, FixtureId, FixtureRegistry, ProfileLoader};
use crate::preset::{Preset, PresetError, PresetId, PresetPatch, PresetStore};
use crate::transmitter::{Transmitter, TransmitterStatus};
use crate::universe::{Snapshot, Universe, UniverseState, DMX_CHANNELS};

const PRESET_LIST_CAPACITY: usize = 64;
const FIXTURE_LIST_CAPACITY: usize = 64;
const CONFLICT_CAPACITY: usize = 16;
const LIVE_EVENT_CAPACITY: usize = 256;
const AUTOMATION_EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 256;
const THROTTLE_PERIOD: Duration = Duration::from_millis(crate::config::THROTTLE_PERIOD_MS);

/// A thin, `Clone`-able summary of a preset for the `presets:list` /
/// `presets_updated` broadcasts, avoiding a full channel array on the
/// wire when only identity and playback metadata are needed.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetSummary {
    pub id: PresetId,
    pub name: String,
    pub fade_time_ms: u64,
    pub color: String,
}

impl From<&Preset> for PresetSummary {
    fn from(preset: &Preset) -> Self {
        PresetSummary {
            id: preset.id,
            name: preset.name.clone(),
            fade_time_ms: preset.fade_time_ms,
            color: preset.color.clone(),
        }
    }
}

/// Unthrottled and throttled events fanned out to live-client
/// connections (spec §4.7, §6).
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum LiveEvent {
    #[serde(rename = "dmx:state")]
    DmxState { channels: Vec<u8>, master: u8 },
    #[serde(rename = "dmx:status")]
    DmxStatus { connected: bool, port: Option<String> },
    #[serde(rename = "presets:list")]
    PresetsList { presets: Vec<Preset> },
    #[serde(rename = "preset:activated")]
    PresetActivated { id: PresetId, name: String },
    #[serde(rename = "fixtures:list")]
    FixturesList { fixtures: Vec<Fixture> },
    #[serde(rename = "fixtures:conflicts")]
    FixturesConflicts { conflicts: Vec<String> },
    #[serde(rename = "fixtures:profiles")]
    FixturesProfiles { profiles: Vec<ProfileEntry> },
    #[serde(rename = "fixture:export-result")]
    FixtureExportResult { export: FixtureExport },
    #[serde(rename = "fixture:import-result")]
    FixtureImportResult {
        added: usize,
        skipped: usize,
        conflicts: Vec<String>,
    },
}

/// Unsolicited events fanned out to automation clients (spec §4.8).
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationEvent {
    DmxStatus { connected: bool },
    PresetActivated { id: PresetId, name: String },
    PresetsUpdated { presets: Vec<PresetSummary> },
}

enum CoordinatorCommand {
    SetChannel { channel: u32, value: u8 },
    SetChannels { values: Vec<(u32, u8)> },
    SetMaster { value: u8 },
    Blackout { fade_time_ms: Option<u64> },
    TriggerStart { channel: u32 },
    TriggerEnd { channel: u32 },
    RecallPreset {
        id: PresetId,
        fade_time_ms: Option<u64>,
        reply: Option<oneshot::Sender<Result<(), PresetError>>>,
    },
    SavePreset {
        name: String,
        fade_time_ms: u64,
        color: String,
        reply: oneshot::Sender<PresetId>,
    },
    UpdatePreset {
        id: PresetId,
        patch: PresetPatch,
        reply: oneshot::Sender<Result<(), PresetError>>,
    },
    DeletePreset {
        id: PresetId,
        reply: oneshot::Sender<bool>,
    },
    ListPresets {
        reply: oneshot::Sender<Vec<PresetSummary>>,
    },
    GetPresets {
        reply: oneshot::Sender<Vec<Preset>>,
    },
    CreateFixture {
        name: String,
        fixture_type: String,
        channels: Vec<ChannelBinding>,
        color_mode: ColorMode,
        reply: oneshot::Sender<FixtureId>,
    },
    CreateFixtureFromProfile {
        name: String,
        profile_id: String,
        start_address: u32,
        reply: oneshot::Sender<Result<FixtureId, RegistryError>>,
    },
    UpdateFixture {
        id: FixtureId,
        name: Option<String>,
        channels: Option<Vec<ChannelBinding>>,
        canvas: Option<Option<CanvasLayout>>,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    DeleteFixture {
        id: FixtureId,
        reply: oneshot::Sender<bool>,
    },
    SetFixtureMode {
        id: FixtureId,
        mode_name: String,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    GetProfiles {
        reply: oneshot::Sender<Vec<ProfileEntry>>,
    },
    GetConflicts {
        reply: oneshot::Sender<Vec<String>>,
    },
    ExportFixtures {
        reply: oneshot::Sender<FixtureExport>,
    },
    ImportFixtures {
        export: FixtureExport,
        merge: bool,
        reply: oneshot::Sender<ImportResult>,
    },
    GetState {
        reply: oneshot::Sender<(Vec<u8>, u8)>,
    },
    /// A single interpolated (or instant) frame from the Fade Engine,
    /// forwarded non-blockingly via `try_send` (design note "Fade
    /// frames never block the single-writer queue").
    ApplyFadeFrame(Snapshot),
    Shutdown,
}

/// Handle used by both network servers to reach the single-writer
/// task. Cloned freely; every clone shares the same bounded queue.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    pub async fn set_channel(&self, channel: u32, value: u8) {
        self.tx.send(CoordinatorCommand::SetChannel { channel, value }).await.ok();
    }

    pub async fn set_channels(&self, values: Vec<(u32, u8)>) {
        self.tx.send(CoordinatorCommand::SetChannels { values }).await.ok();
    }

    pub async fn set_master(&self, value: u8) {
        self.tx.send(CoordinatorCommand::SetMaster { value }).await.ok();
    }

    pub async fn blackout(&self, fade_time_ms: Option<u64>) {
        self.tx.send(CoordinatorCommand::Blackout { fade_time_ms }).await.ok();
    }

    pub async fn trigger_start(&self, channel: u32) {
        self.tx.send(CoordinatorCommand::TriggerStart { channel }).await.ok();
    }

    pub async fn trigger_end(&self, channel: u32) {
        self.tx.send(CoordinatorCommand::TriggerEnd { channel }).await.ok();
    }

    pub async fn recall_preset(&self, id: PresetId, fade_time_ms: Option<u64>) -> Result<(), PresetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::RecallPreset { id, fade_time_ms, reply: Some(reply_tx) })
            .await
            .ok();
        reply_rx.await.unwrap_or(Err(PresetError::UnknownPreset(id)))
    }

    /// Fire-and-forget variant for the live-client server, which only
    /// relies on the broadcast that follows, not a direct reply.
    pub async fn recall_preset_no_reply(&self, id: PresetId, fade_time_ms: Option<u64>) {
        self.tx
            .send(CoordinatorCommand::RecallPreset { id, fade_time_ms, reply: None })
            .await
            .ok();
    }

    pub async fn save_preset(&self, name: String, fade_time_ms: u64, color: String) -> PresetId {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::SavePreset { name, fade_time_ms, color, reply: reply_tx })
            .await
            .ok();
        reply_rx.await.expect("coordinator task dropped reply sender")
    }

    pub async fn update_preset(&self, id: PresetId, patch: PresetPatch) -> Result<(), PresetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::UpdatePreset { id, patch, reply: reply_tx })
            .await
            .ok();
        reply_rx.await.unwrap_or(Err(PresetError::UnknownPreset(id)))
    }

    pub async fn delete_preset(&self, id: PresetId) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(CoordinatorCommand::DeletePreset { id, reply: reply_tx }).await.ok();
        reply_rx.await.unwrap_or(false)
    }

    pub async fn list_presets(&self) -> Vec<PresetSummary> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(CoordinatorCommand::ListPresets { reply: reply_tx }).await.ok();
        reply_rx.await.unwrap_or_default()
    }

    /// Full preset records (including the 512-byte channel array), used
    /// for the live-client `presets:list` event.
    pub async fn get_presets(&self) -> Vec<Preset> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(CoordinatorCommand::GetPresets { reply: reply_tx }).await.ok();
        reply_rx.await.unwrap_or_default()
    }

    pub async fn create_fixture(
        &self,
        name: String,
        fixture_type: String,
        channels: Vec<ChannelBinding>,
        color_mode: ColorMode,
    ) -> FixtureId {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::CreateFixture { name, fixture_type, channels, color_mode, reply: reply_tx })
            .await
            .ok();
        reply_rx.await.expect("coordinator task dropped reply sender")
    }

    pub async fn create_fixture_from_profile(
        &self,
        name: String,
        profile_id: String,
        start_address: u32,
    ) -> Result<FixtureId, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::CreateFixtureFromProfile { name, profile_id, start_address, reply: reply_tx })
            .await
            .ok();
        reply_rx
            .await
            .unwrap_or_else(|_| Err(RegistryError::UnknownProfile("<coordinator dropped>".into())))
    }

    pub async fn update_fixture(
        &self,
        id: FixtureId,
        name: Option<String>,
        channels: Option<Vec<ChannelBinding>>,
        canvas: Option<Option<CanvasLayout>>,
    ) -> Result<(), RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::UpdateFixture { id, name, channels, canvas, reply: reply_tx })
            .await
            .ok();
        reply_rx.await.unwrap_or(Err(RegistryError::UnknownFixture(id)))
    }

    pub async fn delete_fixture(&self, id: FixtureId) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(CoordinatorCommand::DeleteFixture { id, reply: reply_tx }).await.ok();
        reply_rx.await.unwrap_or(false)
    }

    pub async fn set_fixture_mode(&self, id: FixtureId, mode_name: String) -> Result<(), RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::SetFixtureMode { id, mode_name, reply: reply_tx })
            .await
            .ok();
        reply_rx.await.unwrap_or(Err(RegistryError::UnknownFixture(id)))
    }

    pub async fn get_profiles(&self) -> Vec<ProfileEntry> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(CoordinatorCommand::GetProfiles { reply: reply_tx }).await.ok();
        reply_rx.await.unwrap_or_default()
    }

    pub async fn get_conflicts(&self) -> Vec<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(CoordinatorCommand::GetConflicts { reply: reply_tx }).await.ok();
        reply_rx.await.unwrap_or_default()
    }

    pub async fn export_fixtures(&self) -> FixtureExport {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(CoordinatorCommand::ExportFixtures { reply: reply_tx }).await.ok();
        reply_rx.await.expect("coordinator task dropped reply sender")
    }

    pub async fn import_fixtures(&self, export: FixtureExport, merge: bool) -> ImportResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::ImportFixtures { export, merge, reply: reply_tx })
            .await
            .ok();
        reply_rx.await.unwrap_or_default()
    }

    pub async fn get_state(&self) -> (Vec<u8>, u8) {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(CoordinatorCommand::GetState { reply: reply_tx }).await.ok();
        reply_rx.await.unwrap_or((vec![0; DMX_CHANNELS], 255))
    }

    pub async fn shutdown(&self) {
        self.tx.send(CoordinatorCommand::Shutdown).await.ok();
    }
}

/// Every channel a caller needs to wire up the two network servers and
/// the transmitter, handed back by [`spawn`].
pub struct CoordinatorChannels {
    pub handle: CoordinatorHandle,
    pub universe_rx: watch::Receiver<UniverseState>,
    pub transmitter: Transmitter,
    pub transmitter_status_rx: watch::Receiver<TransmitterStatus>,
    pub live_events: broadcast::Sender<LiveEvent>,
    pub automation_events: broadcast::Sender<AutomationEvent>,
}

struct Coordinator {
    universe: Universe,
    registry: FixtureRegistry,
    presets: PresetStore,
    fade: FadeEngine,
    live_events: broadcast::Sender<LiveEvent>,
    automation_events: broadcast::Sender<AutomationEvent>,
    commands: mpsc::Receiver<CoordinatorCommand>,
}

/// Spawn the single-writer task plus its satellite background tasks
/// (the universe throttle gate and the transmitter status bridge).
/// Returns immediately; the coordinator keeps running until
/// `CoordinatorHandle::shutdown` is called.
pub fn spawn(profiles: ProfileLoader, forced_serial_port: Option<String>) -> CoordinatorChannels {
    let (universe, universe_rx) = Universe::new();
    let registry = FixtureRegistry::new(profiles);
    let presets = PresetStore::new();

    let (transmitter_status_tx, transmitter_status_rx) = watch::channel(TransmitterStatus::Idle);
    let transmitter = Transmitter::spawn(universe_rx.clone(), transmitter_status_tx, forced_serial_port);

    let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);

    let fade_apply_tx = command_tx.clone();
    let fade_get_raw_rx = universe_rx.clone();
    let fade = FadeEngine::spawn(
        move || fade_get_raw_rx.borrow().raw,
        move |snapshot| {
            fade_apply_tx.try_send(CoordinatorCommand::ApplyFadeFrame(snapshot)).ok();
        },
    );

    let (live_events, _) = broadcast::channel(LIVE_EVENT_CAPACITY);
    let (automation_events, _) = broadcast::channel(AUTOMATION_EVENT_CAPACITY);

    let coordinator = Coordinator {
        universe,
        registry,
        presets,
        fade,
        live_events: live_events.clone(),
        automation_events: automation_events.clone(),
        commands,
    };

    tokio::spawn(coordinator.run());
    tokio::spawn(run_throttle_gate(universe_rx.clone(), live_events.clone()));
    tokio::spawn(run_status_bridge(
        transmitter_status_rx.clone(),
        live_events.clone(),
        automation_events.clone(),
    ));

    CoordinatorChannels {
        handle: CoordinatorHandle { tx: command_tx },
        universe_rx,
        transmitter,
        transmitter_status_rx,
        live_events,
        automation_events,
    }
}

/// Samples the universe's watch channel at ~30 Hz and broadcasts
/// `dmx:state` only when something changed since the last tick. A
/// `watch` channel already coalesces to "latest value", which is
/// exactly the throttle semantics spec §4.7 asks for: never suppress
/// the final state after a quiescent pause, never send more than once
/// per tick.
async fn run_throttle_gate(mut universe_rx: watch::Receiver<UniverseState>, live_events: broadcast::Sender<LiveEvent>) {
    let mut ticker = tokio::time::interval(THROTTLE_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if universe_rx.has_changed().unwrap_or(false) {
            let state = universe_rx.borrow_and_update().clone();
            live_events
                .send(LiveEvent::DmxState { channels: state.effective.to_vec(), master: state.master })
                .ok();
        }
    }
}

async fn run_status_bridge(
    mut status_rx: watch::Receiver<TransmitterStatus>,
    live_events: broadcast::Sender<LiveEvent>,
    automation_events: broadcast::Sender<AutomationEvent>,
) {
    loop {
        if status_rx.changed().await.is_err() {
            return;
        }
        let status = status_rx.borrow().clone();
        let connected = matches!(status, TransmitterStatus::Connected { .. });
        let port = status.connected_port().map(|p| p.to_string());
        live_events.send(LiveEvent::DmxStatus { connected, port }).ok();
        automation_events.send(AutomationEvent::DmxStatus { connected }).ok();
    }
}

impl Coordinator {
    async fn run(mut self) {
        loop {
            if !self.run_once().await {
                break;
            }
        }
    }

    async fn run_once(&mut self) -> bool {
        match self.commands.recv().await {
            Some(command) => self.handle_command(command).await,
            None => false,
        }
    }

    async fn handle_command(&mut self, command: CoordinatorCommand) -> bool {
        match command {
            CoordinatorCommand::SetChannel { channel, value } => {
                self.universe.set_channel(channel, value);
            }
            CoordinatorCommand::SetChannels { values } => {
                self.universe.set_channels(&values);
            }
            CoordinatorCommand::SetMaster { value } => {
                self.universe.set_master_dimmer(value);
            }
            CoordinatorCommand::Blackout { fade_time_ms } => {
                self.perform_blackout(fade_time_ms).await;
            }
            CoordinatorCommand::TriggerStart { channel } => {
                self.universe.set_channel(channel, 255);
            }
            CoordinatorCommand::TriggerEnd { channel } => {
                self.universe.set_channel(channel, 0);
            }
            CoordinatorCommand::RecallPreset { id, fade_time_ms, reply } => {
                let result = self.recall_preset(id, fade_time_ms).await;
                if let Some(reply) = reply {
                    reply.send(result).ok();
                }
            }
            CoordinatorCommand::SavePreset { name, fade_time_ms, color, reply } => {
                let fixture_modes = self.current_fixture_modes();
                let raw = self.universe.get_raw();
                let id = self.presets.capture(name, raw, fade_time_ms, color, fixture_modes);
                self.broadcast_presets_updated();
                reply.send(id).ok();
            }
            CoordinatorCommand::UpdatePreset { id, patch, reply } => {
                let result = self.presets.update(id, patch);
                if result.is_ok() {
                    self.broadcast_presets_updated();
                }
                reply.send(result).ok();
            }
            CoordinatorCommand::DeletePreset { id, reply } => {
                let removed = self.presets.delete(id);
                if removed {
                    self.broadcast_presets_updated();
                }
                reply.send(removed).ok();
            }
            CoordinatorCommand::ListPresets { reply } => {
                let summaries = self.presets.list().iter().map(PresetSummary::from).collect();
                reply.send(summaries).ok();
            }
            CoordinatorCommand::GetPresets { reply } => {
                reply.send(self.presets.list()).ok();
            }
            CoordinatorCommand::CreateFixture { name, fixture_type, channels, color_mode, reply } => {
                let id = self.registry.create(name, fixture_type, channels, color_mode);
                self.broadcast_fixtures_list();
                reply.send(id).ok();
            }
            CoordinatorCommand::CreateFixtureFromProfile { name, profile_id, start_address, reply } => {
                let result = self.registry.create_from_profile(name, &profile_id, start_address);
                if let Ok(id) = result {
                    self.apply_default_mode_writes(id);
                    self.broadcast_fixtures_list();
                }
                reply.send(result).ok();
            }
            CoordinatorCommand::UpdateFixture { id, name, channels, canvas, reply } => {
                let result = self.registry.update_flat(id, name, channels);
                if result.is_ok() {
                    if let Some(canvas) = canvas {
                        self.registry.set_canvas(id, canvas);
                    }
                    self.broadcast_fixtures_list();
                }
                reply.send(result).ok();
            }
            CoordinatorCommand::DeleteFixture { id, reply } => {
                let removed = self.registry.delete(id);
                if removed {
                    self.broadcast_fixtures_list();
                }
                reply.send(removed).ok();
            }
            CoordinatorCommand::SetFixtureMode { id, mode_name, reply } => {
                let result = self.apply_mode_switch(id, &mode_name);
                reply.send(result).ok();
            }
            CoordinatorCommand::GetProfiles { reply } => {
                reply.send(self.registry.profiles().list_profiles()).ok();
            }
            CoordinatorCommand::GetConflicts { reply } => {
                reply.send(self.registry.validate_channel_conflicts()).ok();
            }
            CoordinatorCommand::ExportFixtures { reply } => {
                reply.send(self.registry.export()).ok();
            }
            CoordinatorCommand::ImportFixtures { export, merge, reply } => {
                let result = if merge {
                    self.registry.import_merge(export)
                } else {
                    self.registry.import_replace(export)
                };
                self.broadcast_fixtures_list();
                reply.send(result).ok();
            }
            CoordinatorCommand::GetState { reply } => {
                reply.send((self.universe.get_effective().to_vec(), self.universe.get_master())).ok();
            }
            CoordinatorCommand::ApplyFadeFrame(snapshot) => {
                self.universe.apply_snapshot(&snapshot);
            }
            CoordinatorCommand::Shutdown => {
                return false;
            }
        }
        true
    }

    /// Preset recall, spec §4.6 steps 1-5.
    async fn recall_preset(&mut self, id: PresetId, fade_time_ms: Option<u64>) -> Result<(), PresetError> {
        let preset = self.presets.get(id).cloned().ok_or(PresetError::UnknownPreset(id))?;
        let fade_time_ms = fade_time_ms.unwrap_or(preset.fade_time_ms);

        if fade_time_ms > 0 {
            self.fade
                .fade_to(preset.channels, Duration::from_millis(fade_time_ms))
                .await;
        } else {
            self.universe.apply_snapshot(&preset.channels);
        }

        for (fixture_id, mode_name) in &preset.fixture_modes {
            match self.registry.set_active_mode(*fixture_id, mode_name) {
                Ok(writes) => {
                    self.universe.set_channels(&writes);
                    let hygiene = self.registry.mode_hygiene_writes(*fixture_id, mode_name);
                    if !hygiene.is_empty() {
                        self.universe.set_channels(&hygiene);
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, fixture = ?fixture_id, "preset recall: fixture mode switch failed, continuing");
                }
            }
        }

        self.live_events
            .send(LiveEvent::PresetActivated { id: preset.id, name: preset.name.clone() })
            .ok();
        self.automation_events
            .send(AutomationEvent::PresetActivated { id: preset.id, name: preset.name })
            .ok();

        Ok(())
    }

    async fn perform_blackout(&mut self, fade_time_ms: Option<u64>) {
        match fade_time_ms {
            Some(ms) if ms > 0 => {
                self.fade.fade_to_blackout(Duration::from_millis(ms)).await;
            }
            _ => self.universe.blackout(),
        }
    }

    fn apply_mode_switch(&mut self, id: FixtureId, mode_name: &str) -> Result<(), RegistryError> {
        let writes = self.registry.set_active_mode(id, mode_name)?;
        self.universe.set_channels(&writes);
        let hygiene = self.registry.mode_hygiene_writes(id, mode_name);
        if !hygiene.is_empty() {
            self.universe.set_channels(&hygiene);
        }
        self.broadcast_fixtures_list();
        Ok(())
    }

    fn apply_default_mode_writes(&mut self, id: FixtureId) {
        if let Some(fixture) = self.registry.get(id) {
            if let Some(binding) = &fixture.profile_binding {
                if let Some(mode_name) = binding.active_mode.clone() {
                    if let Ok(writes) = self.registry.set_active_mode(id, &mode_name) {
                        self.universe.set_channels(&writes);
                    }
                }
            }
        }
    }

    fn current_fixture_modes(&mut self) -> std::collections::BTreeMap<FixtureId, String> {
        self.registry
            .list()
            .into_iter()
            .filter_map(|fixture| {
                fixture
                    .profile_binding
                    .and_then(|binding| binding.active_mode)
                    .map(|mode| (fixture.id, mode))
            })
            .collect()
    }

    fn broadcast_presets_updated(&self) {
        let summaries = self.presets.list().iter().map(PresetSummary::from).collect();
        self.automation_events.send(AutomationEvent::PresetsUpdated { presets: summaries }).ok();
        self.live_events.send(LiveEvent::PresetsList { presets: self.presets.list() }).ok();
    }

    fn broadcast_fixtures_list(&mut self) {
        let fixtures = self.registry.list();
        self.live_events.send(LiveEvent::FixturesList { fixtures }).ok();
        let conflicts = self.registry.validate_channel_conflicts();
        if !conflicts.is_empty() {
            self.live_events.send(LiveEvent::FixturesConflicts { conflicts }).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tester_profile_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("dmxd-coordinator-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("tester.json"),
            r#"{
                "fixture": "Tester",
                "channelCount": 2,
                "channels": {
                    "01-dimmer": {"role": "dimmer", "label": "Dimmer"},
                    "02-mode": {"role": "mode-select", "label": "Mode"}
                },
                "modeChannel": "02-mode",
                "modes": [
                    {"name": "M1", "channelValue": 10, "controls": {}, "defaults": {}},
                    {"name": "M2", "channelValue": 20, "controls": {}, "defaults": {}}
                ]
            }"#,
        )
        .unwrap();
        dir
    }

    /// Scenario S6: preset recall restores channels and the captured
    /// fixture mode, even after the fixture has since moved to a
    /// different mode.
    #[tokio::test]
    async fn preset_recall_restores_channels_and_active_mode() {
        let dir = tester_profile_dir();
        let profiles = ProfileLoader::load_dir(&dir).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        let channels = spawn(profiles, Some("/dev/nonexistent-dmxd-test".into()));
        let handle = channels.handle.clone();

        let fixture_id = handle
            .create_fixture_from_profile("Light".into(), "tester", 10)
            .await
            .unwrap();

        handle.set_fixture_mode(fixture_id, "M1".into()).await.unwrap();
        let preset_id = handle.save_preset("Warm".into(), 0, "#fff".into()).await;

        handle.set_channel(1, 99).await;
        handle.set_fixture_mode(fixture_id, "M2".into()).await.unwrap();

        handle.recall_preset(preset_id, Some(0)).await.unwrap();

        // Mode-select channel is DMX 11 (start_address 10 + index 1 of
        // the lexicographically-sorted channel keys), address 11 is
        // effective[10] zero-indexed.
        let (effective, _master) = handle.get_state().await;
        assert_eq!(effective[10], 10);

        let export = handle.export_fixtures().await;
        let fixture = export.fixtures.iter().find(|f| f.id == fixture_id).unwrap();
        assert_eq!(
            fixture.profile_binding.as_ref().unwrap().active_mode.as_deref(),
            Some("M1")
        );

        handle.shutdown().await;
    }

    /// Spec §4.5: conflicting DMX addresses across fixtures surface as
    /// a non-empty `fixtures:conflicts` broadcast without blocking the
    /// creation that caused them.
    #[tokio::test]
    async fn conflicting_fixtures_are_reported_without_blocking_creation() {
        let channels = spawn(ProfileLoader::default(), Some("/dev/nonexistent-dmxd-test".into()));
        let handle = channels.handle.clone();
        let mut live_rx = channels.live_events.subscribe();

        handle
            .create_fixture(
                "A".into(),
                "Flat".into(),
                vec![ChannelBinding { name: "ch".into(), dmx_channel: 5 }],
                ColorMode::Rgb,
            )
            .await;
        handle
            .create_fixture(
                "B".into(),
                "Flat".into(),
                vec![ChannelBinding { name: "ch2".into(), dmx_channel: 5 }],
                ColorMode::Rgb,
            )
            .await;

        let conflicts = handle.get_conflicts().await;
        assert_eq!(conflicts.len(), 1);

        let mut saw_conflict_event = false;
        while let Ok(event) = live_rx.try_recv() {
            if matches!(event, LiveEvent::FixturesConflicts { .. }) {
                saw_conflict_event = true;
            }
        }
        assert!(saw_conflict_event);

        handle.shutdown().await;
    }

    /// Scenario S9: driving many rapid channel writes yields at most a
    /// couple of throttled broadcasts, and the last one reflects the
    /// final state.
    #[tokio::test(start_paused = true)]
    async fn throttle_gate_bounds_broadcast_rate_and_delivers_final_state() {
        let (mut universe, universe_rx) = Universe::new();
        let (live_events, mut rx) = broadcast::channel(64);
        tokio::spawn(run_throttle_gate(universe_rx, live_events));

        for i in 0..1000u32 {
            universe.set_channel(1, (i % 256) as u8);
        }

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        let mut received = 0;
        let mut last_value = None;
        while let Ok(LiveEvent::DmxState { channels, .. }) = rx.try_recv() {
            received += 1;
            last_value = Some(channels[0]);
        }

        assert!(received <= 2, "expected at most 2 broadcasts in a 50ms window, got {received}");
        assert_eq!(last_value, Some((999u32 % 256) as u8));
    }
}
