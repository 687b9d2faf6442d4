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

//! Program-wide constants and commandline arguments.

use tracing::Level;

pub const DEFAULT_LOGLEVEL: Level = Level::INFO;
pub const LOG_FOLDER: &str = "log/";
pub const DEFAULT_PROFILES_DIR: &str = "profiles/";

/// Live-client server default (spec §6).
pub const DEFAULT_LIVE_ADDRESS: &str = "0.0.0.0:9090";
/// Automation server default (spec §6).
pub const DEFAULT_AUTOMATION_ADDRESS: &str = "0.0.0.0:9091";

/// Live-client broadcast throttle period (spec §4.7, ~30 Hz).
pub const THROTTLE_PERIOD_MS: u64 = 33;

#[derive(clap::Parser, Debug)]
#[command(author, version, about = "DMX512 lighting control engine")]
pub struct Arguments {
    /// Directory to scan for bundled fixture profile documents
    #[arg(long, default_value = DEFAULT_PROFILES_DIR)]
    pub profiles_dir: String,

    /// Listen address for the live-client (full-duplex) server
    #[arg(long, default_value = DEFAULT_LIVE_ADDRESS)]
    pub live_addr: String,

    /// Listen address for the automation (request/response) server
    #[arg(long, default_value = DEFAULT_AUTOMATION_ADDRESS)]
    pub automation_addr: String,

    /// Force a specific serial device path instead of auto-discovery
    #[arg(long)]
    pub serial_port: Option<String>,
}
