//! Traffic Poller (C6): samples cumulative interface byte counters at a
//! 1-second cadence and derives per-second throughput and session totals
//! for the TUN and physical default interfaces.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pingtunnel_types::state::{ConnectionStats, InterfaceCounters};

use crate::cancel::CancellationToken;
use crate::os::OsBindings;

const TICK: Duration = Duration::from_secs(1);

struct Baseline {
    tun: (u64, u64),
    physical: (u64, u64),
}

/// Runs the periodic sampling loop and publishes derived throughput into
/// a shared [`ConnectionStats`], notifying a `watch` channel on every
/// update (the stats-changed notification the UI consumes).
pub struct TrafficPoller {
    os: Arc<dyn OsBindings>,
    tun_interface_index: u32,
    physical_interface_index: u32,
    stats: Arc<Mutex<ConnectionStats>>,
    stats_tx: tokio::sync::watch::Sender<ConnectionStats>,
    cancel: CancellationToken,
    armed: AtomicBool,
}

impl TrafficPoller {
    pub fn new(
        os: Arc<dyn OsBindings>,
        tun_interface_index: u32,
        physical_interface_index: u32,
        stats: Arc<Mutex<ConnectionStats>>,
    ) -> (Self, tokio::sync::watch::Receiver<ConnectionStats>) {
        let initial = stats.lock().unwrap().clone();
        let (stats_tx, stats_rx) = tokio::sync::watch::channel(initial);
        (
            TrafficPoller {
                os,
                tun_interface_index,
                physical_interface_index,
                stats,
                stats_tx,
                cancel: CancellationToken::new(),
                armed: AtomicBool::new(true),
            },
            stats_rx,
        )
    }

    pub fn shutdown(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub async fn run(self: Arc<Self>) {
        let mut baseline: Option<Baseline> = None;
        let mut previous: Option<(Instant, (u64, u64), (u64, u64))> = None;
        let mut tick = tokio::time::interval(TICK);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            if !self.armed.load(Ordering::SeqCst) {
                break;
            }

            let tun = match self.os.read_interface_counters(self.tun_interface_index) {
                Ok(c) => (c.rx_bytes, c.tx_bytes),
                Err(e) => {
                    log::debug!("traffic poller: failed to read TUN counters: {}", e);
                    continue;
                }
            };
            let physical = match self.os.read_interface_counters(self.physical_interface_index) {
                Ok(c) => (c.rx_bytes, c.tx_bytes),
                Err(e) => {
                    log::debug!("traffic poller: failed to read physical counters: {}", e);
                    continue;
                }
            };

            let now = Instant::now();
            if baseline.is_none() {
                baseline = Some(Baseline { tun, physical });
            }
            let baseline = baseline.as_ref().unwrap();

            let mut stats = self.stats.lock().unwrap();
            if let Some((prev_time, prev_tun, prev_physical)) = previous {
                let elapsed = now.duration_since(prev_time).as_secs_f64().max(f64::EPSILON);
                stats.tun = InterfaceCounters {
                    rx_bytes_per_sec: clamp_rate(tun.0, prev_tun.0, elapsed),
                    tx_bytes_per_sec: clamp_rate(tun.1, prev_tun.1, elapsed),
                    rx_session_total: clamp_delta(tun.0, baseline.tun.0),
                    tx_session_total: clamp_delta(tun.1, baseline.tun.1),
                };
                stats.physical = InterfaceCounters {
                    rx_bytes_per_sec: clamp_rate(physical.0, prev_physical.0, elapsed),
                    tx_bytes_per_sec: clamp_rate(physical.1, prev_physical.1, elapsed),
                    rx_session_total: clamp_delta(physical.0, baseline.physical.0),
                    tx_session_total: clamp_delta(physical.1, baseline.physical.1),
                };
            }
            let snapshot = stats.clone();
            drop(stats);
            let _ = self.stats_tx.send(snapshot);

            previous = Some((now, tun, physical));
        }
    }
}

/// Counter differences can go negative on rollover/reset; clamp to zero
/// rather than reporting a spurious rate.
fn clamp_rate(current: u64, previous: u64, elapsed_secs: f64) -> u64 {
    let delta = current.saturating_sub(previous);
    (delta as f64 / elapsed_secs) as u64
}

fn clamp_delta(current: u64, baseline: u64) -> u64 {
    current.saturating_sub(baseline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_rate_is_zero_on_counter_rollover() {
        assert_eq!(clamp_rate(5, 100, 1.0), 0);
    }

    #[test]
    fn clamp_rate_divides_delta_by_elapsed_time() {
        assert_eq!(clamp_rate(2000, 1000, 2.0), 500);
    }

    #[test]
    fn clamp_delta_is_zero_when_below_baseline() {
        assert_eq!(clamp_delta(10, 100), 0);
    }
}
