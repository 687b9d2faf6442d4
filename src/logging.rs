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

//! Logging setup: stdout plus a daily-rolling file, in the same shape
//! as the teacher's `Minerva::setup_logging`.

use tracing_subscriber::prelude::*;

use crate::config::DEFAULT_LOGLEVEL;

/// Initialize tracing. The returned guard must be held for the
/// lifetime of the process; dropping it stops the non-blocking file
/// writer from flushing.
pub fn init(log_dir: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
            DEFAULT_LOGLEVEL,
        ));

    let file_appender = tracing_appender::rolling::daily(log_dir, "dmxd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false);

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}
