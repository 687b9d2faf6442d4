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

//! The fixture model: named logical groupings of DMX channels, with
//! optional profile-defined layout and mode activation.

pub mod profile;
pub mod registry;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use profile::{ChannelRole, ControlDescriptor, Mode, Profile, ProfileError, ProfileLoader};
pub use registry::{FixtureRegistry, RegistryError};

/// Opaque unique id for a fixture, newtype-wrapped per the teacher's
/// `ItemId`-over-raw-id convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FixtureId(pub Uuid);

impl FixtureId {
    pub fn new() -> Self {
        FixtureId(Uuid::new_v4())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    Rgb,
    Hsb,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBinding {
    pub name: String,
    pub dmx_channel: u32,
}

/// Canvas layout fields are carried through opaquely; the core only
/// validates bounds (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasLayout {
    pub x: f64,
    pub y: f64,
    pub rotation: f64,
    pub width: f64,
    pub height: f64,
    pub on_canvas: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileBinding {
    pub profile: Profile,
    pub start_address: u32,
    pub active_mode: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    pub id: FixtureId,
    pub name: String,
    #[serde(rename = "type")]
    pub fixture_type: String,
    pub color_mode: ColorMode,
    pub channels: Vec<ChannelBinding>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_binding: Option<ProfileBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas: Option<CanvasLayout>,
}

impl Fixture {
    pub fn is_profile_based(&self) -> bool {
        self.profile_binding.is_some()
    }
}

/// A list of human-readable conflict descriptions, one per overlapping
/// DMX address across distinct fixture bindings.
pub type ConflictReport = Vec<String>;
