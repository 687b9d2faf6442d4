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

//! Fixture CRUD, profile binding, mode activation, conflict
//! detection, and import/export (spec §4.5).
//!
//! The registry never writes to the Universe itself: `set_active_mode`
//! returns the writes the caller (the Coordinator) must apply, keeping
//! the Universe the sole mutation point (design note "Mode hygiene
//! split").

use chrono::Local;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::profile::ProfileLoader;
use super::{CanvasLayout, ChannelBinding, ColorMode, ConflictReport, Fixture, FixtureId, ProfileBinding};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown profile id {0}")]
    UnknownProfile(String),
    #[error("start address {start} with channel count {count} does not fit in 1..512")]
    InvalidAddress { start: u32, count: usize },
    #[error("unknown fixture {0:?}")]
    UnknownFixture(FixtureId),
    #[error("fixture {0:?} is not profile-based")]
    NotProfileFixture(FixtureId),
    #[error("unknown mode {mode} on fixture {fixture:?}")]
    UnknownMode { fixture: FixtureId, mode: String },
}

/// One `(dmx_channel, value)` write the caller must apply to the
/// Universe after a mode switch.
pub type ModeWrites = Vec<(u32, u8)>;

/// Result of an import operation (spec §4.5 "Import/export").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImportResult {
    pub added: usize,
    pub skipped: usize,
    pub conflicts: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureExport {
    pub version: u32,
    pub exported_at: chrono::DateTime<Local>,
    pub fixtures: Vec<Fixture>,
}

pub struct FixtureRegistry {
    fixtures: FnvHashMap<FixtureId, Fixture>,
    profiles: ProfileLoader,
}

impl FixtureRegistry {
    pub fn new(profiles: ProfileLoader) -> Self {
        FixtureRegistry {
            fixtures: FnvHashMap::default(),
            profiles,
        }
    }

    pub fn profiles(&self) -> &ProfileLoader {
        &self.profiles
    }

    /// Create a flat (non-profile) fixture.
    pub fn create(
        &mut self,
        name: String,
        fixture_type: String,
        channels: Vec<ChannelBinding>,
        color_mode: ColorMode,
    ) -> FixtureId {
        let now = Local::now();
        let fixture = Fixture {
            id: FixtureId::new(),
            name,
            fixture_type,
            color_mode,
            channels,
            created_at: now,
            updated_at: now,
            profile_binding: None,
            canvas: None,
        };
        let id = fixture.id;
        self.fixtures.insert(id, fixture);
        id
    }

    /// Create a fixture bound to a bundled profile, assigning
    /// contiguous DMX addresses starting at `start_address` (spec
    /// §4.5, "Create (from profile)").
    pub fn create_from_profile(
        &mut self,
        name: String,
        profile_id: &str,
        start_address: u32,
    ) -> Result<FixtureId, RegistryError> {
        let profile = self
            .profiles
            .get_profile(profile_id)
            .ok_or_else(|| RegistryError::UnknownProfile(profile_id.to_string()))?
            .clone();

        if start_address < 1
            || start_address as usize + profile.channel_count - 1 > 512
        {
            return Err(RegistryError::InvalidAddress {
                start: start_address,
                count: profile.channel_count,
            });
        }

        let channels: Vec<ChannelBinding> = profile
            .ordered_keys()
            .iter()
            .enumerate()
            .map(|(index, key)| ChannelBinding {
                name: profile.channels[*key].label.clone(),
                dmx_channel: start_address + index as u32,
            })
            .collect();

        let active_mode = profile.modes.first().map(|m| m.name.clone());

        let now = Local::now();
        let fixture = Fixture {
            id: FixtureId::new(),
            name,
            fixture_type: profile.fixture.clone(),
            color_mode: ColorMode::Rgb,
            channels,
            created_at: now,
            updated_at: now,
            profile_binding: Some(ProfileBinding {
                profile,
                start_address,
                active_mode,
            }),
            canvas: None,
        };
        let id = fixture.id;
        self.fixtures.insert(id, fixture);
        Ok(id)
    }

    /// Activate a mode on a profile-based fixture. Returns the writes
    /// the caller must apply to the Universe; does not touch the
    /// Universe itself (spec §4.5).
    pub fn set_active_mode(
        &mut self,
        fixture_id: FixtureId,
        mode_name: &str,
    ) -> Result<ModeWrites, RegistryError> {
        let fixture = self
            .fixtures
            .get_mut(&fixture_id)
            .ok_or(RegistryError::UnknownFixture(fixture_id))?;

        let binding = fixture
            .profile_binding
            .as_mut()
            .ok_or(RegistryError::NotProfileFixture(fixture_id))?;

        let mode = binding
            .profile
            .mode(mode_name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownMode {
                fixture: fixture_id,
                mode: mode_name.to_string(),
            })?;

        let mut writes = ModeWrites::new();

        if let Some(mode_channel_key) = &binding.profile.mode_channel {
            if let Some(index) = binding.profile.index_of_key(mode_channel_key) {
                writes.push((binding.start_address + index as u32, mode.channel_value));
            }
        }

        for (key, value) in &mode.defaults {
            if let Some(index) = binding.profile.index_of_key(key) {
                writes.push((binding.start_address + index as u32, *value));
            }
        }

        binding.active_mode = Some(mode.name.clone());
        fixture.updated_at = Local::now();

        Ok(writes)
    }

    /// The mode-switch channel hygiene pass (spec §4.5): for every
    /// `dynamic` channel with no control entry in the new mode, zero
    /// its DMX address, except channels named by `defaults` or by
    /// `colorWheelGroup`.
    pub fn mode_hygiene_writes(&self, fixture_id: FixtureId, mode_name: &str) -> ModeWrites {
        use super::profile::ChannelRole;

        let Some(fixture) = self.fixtures.get(&fixture_id) else {
            return ModeWrites::new();
        };
        let Some(binding) = &fixture.profile_binding else {
            return ModeWrites::new();
        };
        let Some(mode) = binding.profile.mode(mode_name) else {
            return ModeWrites::new();
        };

        let exempt: std::collections::HashSet<&str> = mode
            .defaults
            .keys()
            .map(|k| k.as_str())
            .chain(
                mode.color_wheel_group
                    .iter()
                    .flat_map(|g| {
                        let mut keys = vec![g.hue.as_str(), g.saturation.as_str()];
                        if let Some(b) = &g.brightness {
                            keys.push(b.as_str());
                        }
                        keys
                    }),
            )
            .collect();

        let mut writes = ModeWrites::new();
        for (index, key) in binding.profile.ordered_keys().iter().enumerate() {
            let def = &binding.profile.channels[*key];
            if def.role != ChannelRole::Dynamic {
                continue;
            }
            if exempt.contains(key.as_str()) {
                continue;
            }
            if mode.controls.get(*key).map(|c| c.is_some()).unwrap_or(false) {
                continue;
            }
            writes.push((binding.start_address + index as u32, 0));
        }
        writes
    }

    pub fn get(&self, id: FixtureId) -> Option<&Fixture> {
        self.fixtures.get(&id)
    }

    pub fn set_canvas(&mut self, id: FixtureId, canvas: Option<CanvasLayout>) {
        if let Some(fixture) = self.fixtures.get_mut(&id) {
            fixture.canvas = canvas;
            fixture.updated_at = Local::now();
        }
    }

    pub fn update_flat(
        &mut self,
        id: FixtureId,
        name: Option<String>,
        channels: Option<Vec<ChannelBinding>>,
    ) -> Result<(), RegistryError> {
        let fixture = self
            .fixtures
            .get_mut(&id)
            .ok_or(RegistryError::UnknownFixture(id))?;
        if let Some(name) = name {
            fixture.name = name;
        }
        if let Some(channels) = channels {
            fixture.channels = channels;
        }
        fixture.updated_at = Local::now();
        Ok(())
    }

    pub fn delete(&mut self, id: FixtureId) -> bool {
        // Open question 1: channels left non-zero by a deleted fixture
        // are not cleared (preserved from the source).
        self.fixtures.remove(&id).is_some()
    }

    /// Refresh every fixture whose stored profile has drifted from the
    /// bundled document of the same name, overwriting the stored copy
    /// (spec §4.5, "Profile drift refresh"). Preserves id, address,
    /// active mode, and layout.
    pub fn refresh_profile_drift(&mut self) {
        let mut updates = Vec::new();
        for (id, fixture) in self.fixtures.iter() {
            if let Some(binding) = &fixture.profile_binding {
                if let Some(bundled) = self.profiles.find_by_fixture_name(&binding.profile.fixture) {
                    if bundled != &binding.profile {
                        updates.push((*id, bundled.clone()));
                    }
                }
            }
        }
        for (id, bundled) in updates {
            if let Some(fixture) = self.fixtures.get_mut(&id) {
                if let Some(binding) = &mut fixture.profile_binding {
                    binding.profile = bundled;
                    fixture.updated_at = Local::now();
                }
            }
        }
    }

    /// All fixtures, with profile drift refreshed first (spec: "whenever
    /// the Registry is queried").
    pub fn list(&mut self) -> Vec<Fixture> {
        self.refresh_profile_drift();
        self.fixtures.values().cloned().collect()
    }

    /// Iterate all DMX addresses across all bindings; the first
    /// `(fixture, channel name)` to claim an address wins, later
    /// claims are reported as conflicts (spec §4.5).
    pub fn validate_channel_conflicts(&self) -> ConflictReport {
        let mut owners: FnvHashMap<u32, (&str, &str)> = FnvHashMap::default();
        let mut conflicts = Vec::new();

        for fixture in self.fixtures.values() {
            for binding in &fixture.channels {
                match owners.get(&binding.dmx_channel) {
                    Some((owner_name, owner_channel)) => {
                        conflicts.push(format!(
                            "DMX {}: '{}' ({}) conflicts with '{}' ({})",
                            binding.dmx_channel, owner_name, owner_channel, fixture.name, binding.name
                        ));
                    }
                    None => {
                        owners.insert(binding.dmx_channel, (&fixture.name, &binding.name));
                    }
                }
            }
        }
        conflicts
    }

    pub fn export(&self) -> FixtureExport {
        FixtureExport {
            version: 1,
            exported_at: Local::now(),
            fixtures: self.fixtures.values().cloned().collect(),
        }
    }

    pub fn import_replace(&mut self, export: FixtureExport) -> ImportResult {
        let added = export.fixtures.len();
        self.fixtures = export
            .fixtures
            .into_iter()
            .map(|fixture| (fixture.id, fixture))
            .collect();
        ImportResult {
            added,
            skipped: 0,
            conflicts: Vec::new(),
        }
    }

    pub fn import_merge(&mut self, export: FixtureExport) -> ImportResult {
        let mut result = ImportResult::default();

        'fixtures: for incoming in export.fixtures {
            if self.fixtures.contains_key(&incoming.id) {
                result.skipped += 1;
                result
                    .conflicts
                    .push(format!("fixture id {:?} already exists", incoming.id));
                continue;
            }

            for binding in &incoming.channels {
                for existing in self.fixtures.values() {
                    for existing_binding in &existing.channels {
                        if existing_binding.dmx_channel == binding.dmx_channel {
                            result.skipped += 1;
                            result.conflicts.push(format!(
                                "DMX {} of '{}' overlaps existing fixture '{}'",
                                binding.dmx_channel, incoming.name, existing.name
                            ));
                            continue 'fixtures;
                        }
                    }
                }
            }

            result.added += 1;
            self.fixtures.insert(incoming.id, incoming);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::profile::{ChannelDef, ChannelRole, ControlDescriptor, Mode, Profile};
    use std::collections::BTreeMap;

    fn sample_profile() -> Profile {
        let mut channels = BTreeMap::new();
        channels.insert(
            "01-dimmer".to_string(),
            ChannelDef { role: ChannelRole::Dimmer, label: "Dimmer".into() },
        );
        channels.insert(
            "02-mode".to_string(),
            ChannelDef { role: ChannelRole::ModeSelect, label: "Mode".into() },
        );
        channels.insert(
            "03-fader".to_string(),
            ChannelDef { role: ChannelRole::Custom, label: "Fader".into() },
        );
        channels.insert(
            "04-default".to_string(),
            ChannelDef { role: ChannelRole::Custom, label: "Hidden".into() },
        );
        channels.insert(
            "05-dynamic".to_string(),
            ChannelDef { role: ChannelRole::Dynamic, label: "Dynamic".into() },
        );

        let mut controls = BTreeMap::new();
        controls.insert("03-fader".to_string(), Some(ControlDescriptor::Fader));

        let mut defaults = BTreeMap::new();
        defaults.insert("04-default".to_string(), 50u8);

        let mode_m = Mode {
            name: "M".to_string(),
            channel_value: 128,
            controls,
            color_wheel_group: None,
            defaults,
        };

        Profile {
            fixture: "Tester".to_string(),
            channel_count: 5,
            channels,
            mode_channel: Some("02-mode".to_string()),
            modes: vec![mode_m],
        }
    }

    fn registry_with_profile() -> (FixtureRegistry, String) {
        let mut loader = ProfileLoader::default();
        // exercise load through the public API shape via a temp dir
        let dir = std::env::temp_dir().join(format!("dmxd-registry-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let json = serde_json::to_string(&sample_profile()).unwrap();
        std::fs::write(dir.join("tester.json"), json).unwrap();
        loader = ProfileLoader::load_dir(&dir).unwrap_or(loader);
        std::fs::remove_dir_all(&dir).ok();
        (FixtureRegistry::new(loader), "tester".to_string())
    }

    #[test]
    fn create_from_profile_assigns_contiguous_addresses_and_default_mode() {
        let (mut registry, profile_id) = registry_with_profile();
        let id = registry
            .create_from_profile("Light 1".into(), &profile_id, 10)
            .unwrap();
        let fixture = registry.get(id).unwrap();
        assert_eq!(fixture.channels.len(), 5);
        assert_eq!(fixture.channels[0].dmx_channel, 10);
        assert_eq!(fixture.channels[4].dmx_channel, 14);
        assert_eq!(
            fixture.profile_binding.as_ref().unwrap().active_mode.as_deref(),
            Some("M")
        );
    }

    #[test]
    fn invalid_start_address_is_rejected() {
        let (mut registry, profile_id) = registry_with_profile();
        let result = registry.create_from_profile("Light 1".into(), &profile_id, 510);
        assert!(matches!(result, Err(RegistryError::InvalidAddress { .. })));
    }

    #[test]
    fn set_active_mode_and_hygiene_pass_match_scenario_s5() {
        let (mut registry, profile_id) = registry_with_profile();
        let id = registry
            .create_from_profile("Light 1".into(), &profile_id, 10)
            .unwrap();

        let writes = registry.set_active_mode(id, "M").unwrap();
        // mode channel is index 1 -> address 11; default is index 3 -> address 13
        assert_eq!(writes, vec![(11, 128), (13, 50)]);

        let hygiene = registry.mode_hygiene_writes(id, "M");
        // dynamic channel is index 4 -> address 14, no control/default/colorwheel
        assert_eq!(hygiene, vec![(14, 0)]);
    }

    #[test]
    fn conflict_report_names_both_fixtures() {
        let mut registry = FixtureRegistry::new(ProfileLoader::default());
        registry.create(
            "A".into(),
            "Flat".into(),
            vec![ChannelBinding { name: "ch".into(), dmx_channel: 5 }],
            ColorMode::Rgb,
        );
        registry.create(
            "B".into(),
            "Flat".into(),
            vec![ChannelBinding { name: "ch2".into(), dmx_channel: 5 }],
            ColorMode::Rgb,
        );
        let conflicts = registry.validate_channel_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].contains("A"));
        assert!(conflicts[0].contains("B"));
    }

    #[test]
    fn no_conflicts_when_addresses_distinct() {
        let mut registry = FixtureRegistry::new(ProfileLoader::default());
        registry.create(
            "A".into(),
            "Flat".into(),
            vec![ChannelBinding { name: "ch".into(), dmx_channel: 5 }],
            ColorMode::Rgb,
        );
        registry.create(
            "B".into(),
            "Flat".into(),
            vec![ChannelBinding { name: "ch2".into(), dmx_channel: 6 }],
            ColorMode::Rgb,
        );
        assert!(registry.validate_channel_conflicts().is_empty());
    }

    #[test]
    fn import_merge_skips_overlapping_addresses() {
        let mut registry = FixtureRegistry::new(ProfileLoader::default());
        registry.create(
            "A".into(),
            "Flat".into(),
            vec![ChannelBinding { name: "ch".into(), dmx_channel: 5 }],
            ColorMode::Rgb,
        );

        let incoming_export = FixtureExport {
            version: 1,
            exported_at: Local::now(),
            fixtures: vec![Fixture {
                id: FixtureId::new(),
                name: "B".into(),
                fixture_type: "Flat".into(),
                color_mode: ColorMode::Rgb,
                channels: vec![ChannelBinding { name: "ch2".into(), dmx_channel: 5 }],
                created_at: Local::now(),
                updated_at: Local::now(),
                profile_binding: None,
                canvas: None,
            }],
        };

        let result = registry.import_merge(incoming_export);
        assert_eq!(result.added, 0);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.conflicts.len(), 1);
    }
}
