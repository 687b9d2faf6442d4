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

//! Snapshot capture/recall with per-fixture mode restoration.
//!
//! Recall itself is performed by the Coordinator, not this module
//! (spec §4.6) so that the Fade Engine and Registry writes can be
//! sequenced against the Universe, the sole mutation point.

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::fixture::FixtureId;
use crate::universe::{Snapshot, DMX_CHANNELS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresetId(pub Uuid);

impl PresetId {
    pub fn new() -> Self {
        PresetId(Uuid::new_v4())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: PresetId,
    pub name: String,
    #[serde(with = "channel_array")]
    pub channels: Snapshot,
    pub fade_time_ms: u64,
    pub color: String,
    #[serde(default)]
    pub fixture_modes: BTreeMap<FixtureId, String>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

/// `[u8; 512]` doesn't implement `Serialize`/`Deserialize` directly;
/// bridge through a `Vec<u8>` the way the teacher's `DmxUniverse`
/// exposes `as_bytes()` for its own wire/storage boundary.
mod channel_array {
    use super::{Snapshot, DMX_CHANNELS};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Snapshot, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(value.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Snapshot, D::Error> {
        let vec: Vec<u8> = Vec::deserialize(deserializer)?;
        Ok(pad_or_trim(&vec))
    }

    fn pad_or_trim(values: &[u8]) -> Snapshot {
        let mut out = [0u8; DMX_CHANNELS];
        for (slot, value) in out.iter_mut().zip(values.iter()) {
            *slot = *value;
        }
        out
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetPatch {
    pub name: Option<String>,
    pub channels: Option<Vec<u8>>,
    pub fade_time_ms: Option<u64>,
    pub color: Option<String>,
    pub fixture_modes: Option<BTreeMap<FixtureId, String>>,
}

#[derive(Debug, Error)]
pub enum PresetError {
    #[error("unknown preset {0:?}")]
    UnknownPreset(PresetId),
}

fn pad_or_trim(values: &[u8]) -> Snapshot {
    let mut out = [0u8; DMX_CHANNELS];
    for (slot, value) in out.iter_mut().zip(values.iter()) {
        *slot = *value;
    }
    out
}

pub struct PresetStore {
    presets: FnvHashMap<PresetId, Preset>,
}

impl PresetStore {
    pub fn new() -> Self {
        PresetStore {
            presets: FnvHashMap::default(),
        }
    }

    /// Always stores exactly 512 bytes, trimming or zero-padding the
    /// input (spec §4.6, design note "Preset channel padding").
    pub fn create(
        &mut self,
        name: String,
        channels: &[u8],
        fade_time_ms: u64,
        color: String,
        fixture_modes: BTreeMap<FixtureId, String>,
    ) -> PresetId {
        let now = Local::now();
        let preset = Preset {
            id: PresetId::new(),
            name,
            channels: pad_or_trim(channels),
            fade_time_ms,
            color,
            fixture_modes,
            created_at: now,
            updated_at: now,
        };
        let id = preset.id;
        self.presets.insert(id, preset);
        id
    }

    /// Capture is `create` seeded from the universe's current raw
    /// state (spec §4.6).
    pub fn capture(
        &mut self,
        name: String,
        universe_raw: Snapshot,
        fade_time_ms: u64,
        color: String,
        fixture_modes: BTreeMap<FixtureId, String>,
    ) -> PresetId {
        self.create(name, &universe_raw, fade_time_ms, color, fixture_modes)
    }

    pub fn update(&mut self, id: PresetId, patch: PresetPatch) -> Result<(), PresetError> {
        let preset = self
            .presets
            .get_mut(&id)
            .ok_or(PresetError::UnknownPreset(id))?;
        if let Some(name) = patch.name {
            preset.name = name;
        }
        if let Some(channels) = patch.channels {
            preset.channels = pad_or_trim(&channels);
        }
        if let Some(fade_time_ms) = patch.fade_time_ms {
            preset.fade_time_ms = fade_time_ms;
        }
        if let Some(color) = patch.color {
            preset.color = color;
        }
        if let Some(fixture_modes) = patch.fixture_modes {
            preset.fixture_modes = fixture_modes;
        }
        preset.updated_at = Local::now();
        Ok(())
    }

    pub fn delete(&mut self, id: PresetId) -> bool {
        self.presets.remove(&id).is_some()
    }

    pub fn get(&self, id: PresetId) -> Option<&Preset> {
        self.presets.get(&id)
    }

    pub fn list(&self) -> Vec<Preset> {
        self.presets.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_pads_short_channel_arrays_to_512() {
        let mut store = PresetStore::new();
        let id = store.create(
            "Warm".into(),
            &[10, 20, 30],
            1000,
            "#ffaa00".into(),
            BTreeMap::new(),
        );
        let preset = store.get(id).unwrap();
        assert_eq!(preset.channels.len(), DMX_CHANNELS);
        assert_eq!(preset.channels[0], 10);
        assert_eq!(preset.channels[3], 0);
    }

    #[test]
    fn create_trims_long_channel_arrays_to_512() {
        let mut store = PresetStore::new();
        let long = vec![7u8; 600];
        let id = store.create("Long".into(), &long, 0, "#fff".into(), BTreeMap::new());
        assert_eq!(store.get(id).unwrap().channels.len(), DMX_CHANNELS);
    }

    #[test]
    fn update_preserves_id_and_created_at() {
        let mut store = PresetStore::new();
        let id = store.create("A".into(), &[1, 2, 3], 500, "#000".into(), BTreeMap::new());
        let created_at = store.get(id).unwrap().created_at;

        store
            .update(
                id,
                PresetPatch {
                    name: Some("B".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let preset = store.get(id).unwrap();
        assert_eq!(preset.id, id);
        assert_eq!(preset.created_at, created_at);
        assert_eq!(preset.name, "B");
    }

    #[test]
    fn delete_reports_whether_anything_was_removed() {
        let mut store = PresetStore::new();
        let id = store.create("A".into(), &[], 0, "#000".into(), BTreeMap::new());
        assert!(store.delete(id));
        assert!(!store.delete(id));
    }
}
