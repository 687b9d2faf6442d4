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

//! Loads and validates bundled fixture profile documents.
//!
//! Profiles are immutable once loaded; the registry compares against
//! the bundled copy on every read and refreshes drifted fixtures (spec
//! §4.5, "Profile drift refresh").

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The semantic role of one profile channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelRole {
    Dimmer,
    Temperature,
    Hue,
    Saturation,
    Brightness,
    Red,
    Green,
    Blue,
    ModeSelect,
    Dynamic,
    Custom,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDef {
    pub role: ChannelRole,
    pub label: String,
}

/// Tagged control descriptor variants (design note: "a better fit than
/// the source's optional-field dictionary").
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlDescriptor {
    Fader,
    Momentary,
    Toggle,
    Stepped {
        steps: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "extraButtons")]
        extra_buttons: Option<Vec<String>>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorWheelGroup {
    pub hue: String,
    pub saturation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mode {
    pub name: String,
    pub channel_value: u8,
    /// `None` means the control is suppressed in this mode.
    #[serde(default)]
    pub controls: BTreeMap<String, Option<ControlDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_wheel_group: Option<ColorWheelGroup>,
    #[serde(default)]
    pub defaults: BTreeMap<String, u8>,
}

/// An immutable, externally authored fixture template. `channels` is a
/// `BTreeMap` so iteration order is always the lexicographic
/// channel-key order the spec requires for address assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub fixture: String,
    pub channel_count: usize,
    pub channels: BTreeMap<String, ChannelDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_channel: Option<String>,
    #[serde(default)]
    pub modes: Vec<Mode>,
}

impl Profile {
    /// The channel keys in the order they are assigned DMX addresses.
    pub fn ordered_keys(&self) -> Vec<&String> {
        self.channels.keys().collect()
    }

    pub fn index_of_key(&self, key: &str) -> Option<usize> {
        self.ordered_keys().iter().position(|k| k.as_str() == key)
    }

    pub fn mode(&self, name: &str) -> Option<&Mode> {
        self.modes.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profile document {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse profile document {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("profile {path} has channelCount {declared} but {actual} channel keys")]
    ChannelCountMismatch {
        path: PathBuf,
        declared: usize,
        actual: usize,
    },
    #[error("profile {path} has an empty channels map")]
    EmptyChannels { path: PathBuf },
    #[error("unknown profile id {0}")]
    UnknownProfile(String),
}

/// A loaded profile document, keyed by the document's filename stem.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileEntry {
    pub id: String,
    pub profile: Profile,
}

/// Holds every bundled profile document, parsed and validated once at
/// startup.
#[derive(Clone, Default)]
pub struct ProfileLoader {
    profiles: BTreeMap<String, Profile>,
}

impl ProfileLoader {
    /// Scan `dir` for `*.json` profile documents. A document that fails
    /// to parse or validate is skipped with a logged warning; it does
    /// not abort the scan.
    pub fn load_dir(dir: &Path) -> Result<ProfileLoader, ProfileError> {
        let mut profiles = BTreeMap::new();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(source) => {
                return Err(ProfileError::Io {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load_one(&path) {
                Ok((id, profile)) => {
                    profiles.insert(id, profile);
                }
                Err(error) => {
                    tracing::warn!(%error, path = %path.display(), "skipping invalid profile document");
                }
            }
        }

        Ok(ProfileLoader { profiles })
    }

    fn load_one(path: &Path) -> Result<(String, Profile), ProfileError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let profile: Profile =
            serde_json::from_str(&contents).map_err(|source| ProfileError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if profile.channels.is_empty() {
            return Err(ProfileError::EmptyChannels {
                path: path.to_path_buf(),
            });
        }
        if profile.channels.len() != profile.channel_count {
            return Err(ProfileError::ChannelCountMismatch {
                path: path.to_path_buf(),
                declared: profile.channel_count,
                actual: profile.channels.len(),
            });
        }

        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        Ok((id, profile))
    }

    pub fn list_profiles(&self) -> Vec<ProfileEntry> {
        self.profiles
            .iter()
            .map(|(id, profile)| ProfileEntry {
                id: id.clone(),
                profile: profile.clone(),
            })
            .collect()
    }

    pub fn get_profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.get(id)
    }

    /// Find the bundled profile document for a fixture type name, used
    /// by the registry's drift refresh.
    pub fn find_by_fixture_name(&self, fixture_name: &str) -> Option<&Profile> {
        self.profiles.values().find(|p| p.fixture == fixture_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile_json() -> &'static str {
        r#"{
            "fixture": "Par64",
            "channelCount": 3,
            "channels": {
                "01-dimmer": {"role": "dimmer", "label": "Dimmer"},
                "02-red": {"role": "red", "label": "Red"},
                "03-green": {"role": "green", "label": "Green"}
            }
        }"#
    }

    #[test]
    fn parses_well_formed_profile() {
        let profile: Profile = serde_json::from_str(sample_profile_json()).unwrap();
        assert_eq!(profile.fixture, "Par64");
        assert_eq!(profile.ordered_keys(), vec!["01-dimmer", "02-red", "03-green"]);
    }

    #[test]
    fn rejects_channel_count_mismatch() {
        let dir = tempdir();
        std::fs::write(
            dir.join("bad.json"),
            r#"{"fixture":"Bad","channelCount":5,"channels":{"a":{"role":"custom","label":"A"}}}"#,
        )
        .unwrap();
        let loader = ProfileLoader::load_dir(&dir).unwrap();
        assert!(loader.list_profiles().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn loads_valid_profile_from_directory() {
        let dir = tempdir();
        std::fs::write(dir.join("par64.json"), sample_profile_json()).unwrap();
        let loader = ProfileLoader::load_dir(&dir).unwrap();
        let entries = loader.list_profiles();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "par64");
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("dmxd-profile-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
