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

//! Cancellable, frame-synchronous linear interpolation between two
//! universe snapshots.
//!
//! Only one fade may be in flight per engine instance. Starting a new
//! fade implicitly cancels whatever is running; `cancel()` stops the
//! current fade wherever it is, with no rollback (spec §4.3).

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};

use crate::universe::{Snapshot, DMX_CHANNELS};

/// The tick period must match the transmitter's refresh period so the
/// transmitter never samples mid-interpolation-step (spec §4.3, design
/// note "Fade engine and transmitter coupling").
const FADE_TICK: Duration = Duration::from_millis(25);

enum FadeCommand {
    FadeTo {
        target: Snapshot,
        duration: Duration,
        done: oneshot::Sender<()>,
    },
    Cancel,
}

/// A handle to the background fade task. Applies snapshots to the
/// universe via the provided callback on every tick.
pub struct FadeEngine {
    commands: mpsc::Sender<FadeCommand>,
}

impl FadeEngine {
    /// `apply` is called with each interpolated (or immediate) snapshot
    /// on the single-writer context; it should forward straight to
    /// `Universe::apply_snapshot`.
    pub fn spawn<F>(get_raw: F, apply: impl Fn(Snapshot) + Send + 'static) -> FadeEngine
    where
        F: Fn() -> Snapshot + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(run_fade_engine(rx, get_raw, apply));
        FadeEngine { commands: tx }
    }

    /// Fade to `target` over `duration`. A `duration` of zero (or less)
    /// applies the snapshot immediately. Returns once the prior fade
    /// (if any) has been cancelled; await the returned receiver to know
    /// when this fade completes.
    pub async fn fade_to(&self, target: Snapshot, duration: Duration) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(FadeCommand::FadeTo {
                target,
                duration,
                done: done_tx,
            })
            .await
            .ok();
        done_rx
    }

    pub async fn fade_to_blackout(&self, duration: Duration) -> oneshot::Receiver<()> {
        self.fade_to([0u8; DMX_CHANNELS], duration).await
    }

    pub async fn cancel(&self) {
        self.commands.send(FadeCommand::Cancel).await.ok();
    }
}

struct ActiveFade {
    start: Snapshot,
    target: Snapshot,
    started_at: Instant,
    duration: Duration,
    done: oneshot::Sender<()>,
}

async fn run_fade_engine<F>(
    mut commands: mpsc::Receiver<FadeCommand>,
    get_raw: F,
    apply: impl Fn(Snapshot) + Send + 'static,
) where
    F: Fn() -> Snapshot + Send + 'static,
{
    let mut active: Option<ActiveFade> = None;
    let mut ticker = interval(FADE_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            command = commands.recv() => {
                match command {
                    None => return,
                    Some(FadeCommand::Cancel) => {
                        if let Some(fade) = active.take() {
                            fade.done.send(()).ok();
                        }
                    }
                    Some(FadeCommand::FadeTo { target, duration, done }) => {
                        if let Some(previous) = active.take() {
                            previous.done.send(()).ok();
                        }
                        if duration.is_zero() {
                            apply(target);
                            done.send(()).ok();
                        } else {
                            active = Some(ActiveFade {
                                start: get_raw(),
                                target,
                                started_at: Instant::now(),
                                duration,
                                done,
                            });
                        }
                    }
                }
            }

            _ = ticker.tick(), if active.is_some() => {
                let fade = active.as_ref().unwrap();
                let elapsed = fade.started_at.elapsed();
                let progress = (elapsed.as_secs_f64() / fade.duration.as_secs_f64()).min(1.0);

                let mut out = [0u8; DMX_CHANNELS];
                for i in 0..DMX_CHANNELS {
                    let start = fade.start[i] as f64;
                    let target = fade.target[i] as f64;
                    let value = start + (target - start) * progress;
                    out[i] = value.round().clamp(0.0, 255.0) as u8;
                }
                apply(out);

                if progress >= 1.0 {
                    let fade = active.take().unwrap();
                    fade.done.send(()).ok();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn test_engine() -> (FadeEngine, Arc<Mutex<Snapshot>>) {
        let state = Arc::new(Mutex::new([0u8; DMX_CHANNELS]));
        let state_read = state.clone();
        let state_write = state.clone();
        let engine = FadeEngine::spawn(
            move || *state_read.lock().unwrap(),
            move |snapshot| *state_write.lock().unwrap() = snapshot,
        );
        (engine, state)
    }

    #[tokio::test]
    async fn instant_fade_applies_immediately() {
        let (engine, state) = test_engine();
        let mut target = [0u8; DMX_CHANNELS];
        target[0] = 255;
        engine.fade_to(target, Duration::ZERO).await;
        tokio::task::yield_now().await;
        // Instant fades are applied before the done signal is even awaited.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state.lock().unwrap()[0], 255);
    }

    #[tokio::test(start_paused = true)]
    async fn crossfade_reaches_target_and_interpolates_linearly() {
        let (engine, state) = test_engine();
        let mut target = [0u8; DMX_CHANNELS];
        target[0] = 255;
        let done = engine.fade_to(target, Duration::from_millis(100)).await;

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        let mid = state.lock().unwrap()[0];
        assert!((mid as i32 - 128).abs() <= 2, "mid value was {mid}");

        tokio::time::advance(Duration::from_millis(60)).await;
        done.await.ok();
        assert_eq!(state.lock().unwrap()[0], 255);
    }

    #[tokio::test(start_paused = true)]
    async fn second_fade_to_cancels_first_and_resolves_it() {
        let (engine, state) = test_engine();
        let mut a = [0u8; DMX_CHANNELS];
        a[0] = 200;
        let first_done = engine.fade_to(a, Duration::from_millis(1000)).await;

        tokio::time::advance(Duration::from_millis(300)).await;
        tokio::task::yield_now().await;

        let mut b = [0u8; DMX_CHANNELS];
        b[0] = 50;
        let second_done = engine.fade_to(b, Duration::from_millis(1000)).await;

        // The first fade's completion resolves right away (no rollback).
        first_done.await.ok();

        tokio::time::advance(Duration::from_millis(1000)).await;
        second_done.await.ok();
        assert_eq!(state.lock().unwrap()[0], 50);
    }
}
