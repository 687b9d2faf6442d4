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

//! The single source of truth for the 512-channel DMX universe.
//!
//! This module holds the only mutable copy of channel state in the
//! process. All mutators fan out exactly one change notification per
//! call, matching the at-most-once-per-batch guarantee required by the
//! throttled broadcasters downstream.

use tokio::sync::watch;

/// The number of channels in a single DMX universe.
pub const DMX_CHANNELS: usize = 512;

/// A full 512-byte channel snapshot, raw or effective.
pub type Snapshot = [u8; DMX_CHANNELS];

/// The raw channel state plus the scaled (master-applied) state sent
/// to listeners on every change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniverseState {
    pub raw: Snapshot,
    pub effective: Snapshot,
    pub master: u8,
}

impl UniverseState {
    fn blank() -> Self {
        UniverseState {
            raw: [0; DMX_CHANNELS],
            effective: [0; DMX_CHANNELS],
            master: 255,
        }
    }
}

/// Scale a raw channel byte by the master dimmer, rounding to the
/// nearest integer per spec §3.
fn scale(raw: u8, master: u8) -> u8 {
    ((raw as u32 * master as u32 + 127) / 255) as u8
}

/// A listener invoked with the current effective snapshot on every
/// change. A listener that panics is caught so the remaining listeners
/// still run (spec §4.1, §7 ListenerException).
pub type Listener = Box<dyn Fn(&Snapshot) + Send + Sync>;

/// The authoritative 512-channel universe: one instance per process.
pub struct Universe {
    state: UniverseState,
    listeners: Vec<Listener>,
    watch_tx: watch::Sender<UniverseState>,
}

impl Universe {
    /// Create a new, blacked-out universe with master at full.
    pub fn new() -> (Universe, watch::Receiver<UniverseState>) {
        let state = UniverseState::blank();
        let (watch_tx, watch_rx) = watch::channel(state.clone());
        (
            Universe {
                state,
                listeners: Vec::new(),
                watch_tx,
            },
            watch_rx,
        )
    }

    /// Subscribe a listener; it is invoked once per change from here on.
    pub fn subscribe(&mut self, listener: Listener) {
        self.listeners.push(listener);
    }

    /// Set a single channel (1-indexed). Out-of-range channels are
    /// ignored with a warning; in-range values are clamped to u8 (the
    /// type already bounds them to [0,255]).
    pub fn set_channel(&mut self, channel: u32, value: u8) {
        match Self::index_of(channel) {
            Some(idx) => {
                self.state.raw[idx] = value;
                self.recompute_effective();
                self.notify();
            }
            None => {
                tracing::warn!(channel, "channel out of range 1..512, ignoring");
            }
        }
    }

    /// Apply a batch of channel writes, emitting exactly one change
    /// notification at the end (spec §4.1, invariant 3).
    pub fn set_channels(&mut self, values: &[(u32, u8)]) {
        let mut touched = false;
        for &(channel, value) in values {
            match Self::index_of(channel) {
                Some(idx) => {
                    self.state.raw[idx] = value;
                    touched = true;
                }
                None => tracing::warn!(channel, "channel out of range 1..512, ignoring"),
            }
        }
        if touched {
            self.recompute_effective();
            self.notify();
        }
    }

    /// Set the master dimmer (already a u8, so implicitly clamped).
    pub fn set_master_dimmer(&mut self, value: u8) {
        self.state.master = value;
        self.recompute_effective();
        self.notify();
    }

    /// Overwrite the raw channel state from an arbitrary-length slice;
    /// entries beyond 512 are ignored, missing entries become 0.
    pub fn apply_snapshot(&mut self, values: &[u8]) {
        for (idx, slot) in self.state.raw.iter_mut().enumerate() {
            *slot = values.get(idx).copied().unwrap_or(0);
        }
        self.recompute_effective();
        self.notify();
    }

    /// Zero all channels, leaving master untouched (spec open question 3).
    pub fn blackout(&mut self) {
        self.state.raw = [0; DMX_CHANNELS];
        self.recompute_effective();
        self.notify();
    }

    pub fn get_raw(&self) -> Snapshot {
        self.state.raw
    }

    pub fn get_effective(&self) -> Snapshot {
        self.state.effective
    }

    pub fn get_master(&self) -> u8 {
        self.state.master
    }

    fn recompute_effective(&mut self) {
        let master = self.state.master;
        for (eff, raw) in self.state.effective.iter_mut().zip(self.state.raw.iter()) {
            *eff = scale(*raw, master);
        }
    }

    fn notify(&mut self) {
        // The watch always holds the latest value regardless of how many
        // mutations occurred since the last read; this is fine for the
        // Transmitter which only ever samples "now".
        self.watch_tx.send_replace(self.state.clone());

        for listener in &self.listeners {
            // Isolate a panicking listener from the rest (spec §7).
            let effective = self.state.effective;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(&effective);
            }));
            if result.is_err() {
                tracing::error!("universe change listener panicked");
            }
        }
    }

    fn index_of(channel: u32) -> Option<usize> {
        if (1..=DMX_CHANNELS as u32).contains(&channel) {
            Some((channel - 1) as usize)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn set_channel_clamps_and_scales() {
        let (mut universe, _rx) = Universe::new();
        universe.set_channel(1, 200);
        universe.set_master_dimmer(128);
        assert_eq!(universe.get_raw()[0], 200);
        assert_eq!(universe.get_effective()[0], scale(200, 128));
        assert_eq!(universe.get_effective()[0], 100);
    }

    #[test]
    fn out_of_range_channel_is_ignored() {
        let (mut universe, _rx) = Universe::new();
        universe.set_channel(0, 255);
        universe.set_channel(513, 255);
        assert_eq!(universe.get_raw(), [0u8; DMX_CHANNELS]);
    }

    #[test]
    fn batch_emits_one_notification() {
        let (mut universe, _rx) = Universe::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        universe.subscribe(Box::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        universe.set_channels(&[(1, 10), (2, 20), (3, 30)]);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        universe.set_channel(4, 40);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        universe.apply_snapshot(&[1, 2, 3]);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn blackout_preserves_master() {
        let (mut universe, _rx) = Universe::new();
        universe.set_master_dimmer(128);
        universe.set_channel(5, 255);
        universe.blackout();
        assert_eq!(universe.get_raw(), [0u8; DMX_CHANNELS]);
        assert_eq!(universe.get_master(), 128);
    }

    #[test]
    fn effective_matches_rounding_rule() {
        let (mut universe, _rx) = Universe::new();
        universe.set_channel(10, 200);
        universe.set_master_dimmer(255);
        assert_eq!(universe.get_effective()[9], 200);
    }
}
