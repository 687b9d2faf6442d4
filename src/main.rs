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

//! The main module of `dmxd`, which wires the Coordinator, Transmitter,
//! and the two network servers together and drives them until shutdown.

mod config;
mod coordinator;
mod fade;
mod fixture;
mod logging;
mod live_server;
mod automation_server;
mod preset;
mod transmitter;
mod universe;

use clap::Parser;

use crate::config::Arguments;
use crate::fixture::profile::ProfileLoader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let arguments = Arguments::parse();

    let _log_guard = logging::init(std::path::Path::new(config::LOG_FOLDER));

    let profiles_dir = std::path::PathBuf::from(&arguments.profiles_dir);
    if !profiles_dir.exists() {
        tracing::warn!(dir = %profiles_dir.display(), "profiles directory does not exist, creating it");
        std::fs::create_dir_all(&profiles_dir)?;
    }
    let profiles = ProfileLoader::load_dir(&profiles_dir).unwrap_or_else(|error| {
        tracing::warn!(%error, "failed to scan profiles directory, starting with no profiles");
        ProfileLoader::default()
    });
    tracing::info!(count = profiles.list_profiles().len(), "loaded fixture profiles");

    let channels = coordinator::spawn(profiles, arguments.serial_port.clone());

    // Fatal-only startup condition (spec §7): failure to bind either
    // server port. Both listeners are bound eagerly so a misconfigured
    // address is reported before any client can connect to the other.
    let live_listener = tokio::net::TcpListener::bind(&arguments.live_addr).await?;
    let automation_listener = tokio::net::TcpListener::bind(&arguments.automation_addr).await?;

    let live_task = {
        let coordinator = channels.handle.clone();
        let live_events = channels.live_events.clone();
        let transmitter_status = channels.transmitter_status_rx.clone();
        tokio::spawn(async move {
            if let Err(error) = live_server::serve(live_listener, coordinator, live_events, transmitter_status).await {
                tracing::error!(%error, "live-client server task ended");
            }
        })
    };

    let automation_task = {
        let coordinator = channels.handle.clone();
        let automation_events = channels.automation_events.clone();
        tokio::spawn(async move {
            if let Err(error) = automation_server::serve(automation_listener, coordinator, automation_events).await {
                tracing::error!(%error, "automation server task ended");
            }
        })
    };

    tracing::info!(
        live = %arguments.live_addr,
        automation = %arguments.automation_addr,
        "dmxd is running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    // Shutdown order per spec §4.9: automation server, then live-client
    // server, then transmitter. Both servers are simple accept loops
    // with no in-flight-drain protocol, so abort is the teacher's own
    // style of "stop accepting, let the process exit" rather than a
    // negotiated close.
    automation_task.abort();
    live_task.abort();
    channels.transmitter.shutdown().await;
    channels.handle.shutdown().await;

    Ok(())
}
