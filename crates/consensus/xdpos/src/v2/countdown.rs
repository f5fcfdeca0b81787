//! Round countdown.
//!
//! The timer only records when the current round started. The timeout is
//! evaluated against the parameters in force when the driver checks it, and
//! grows exponentially while rounds pass without a new QC:
//!
//! `timeout_period * expo_timeout_base ^ min(current_round - highest_qc_round - 1, max_timeout_exponent)`

use super::{Round, XDPoSV2Engine};
use crate::{chain::ChainReader, config::V2RoundConfig};
use alloc::sync::Arc;
use core::time::Duration;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, trace};

/// Start time of the current round's countdown
#[derive(Debug)]
pub struct CountdownTimer {
    started: Mutex<(Instant, Round)>,
    notify: Notify,
}

impl Default for CountdownTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl CountdownTimer {
    /// Timer for round 0, started now
    pub fn new() -> Self {
        Self { started: Mutex::new((Instant::now(), 0)), notify: Notify::new() }
    }

    /// Restart the countdown for `round` and wake the driver
    pub fn reset(&self, round: Round) {
        *self.started.lock() = (Instant::now(), round);
        self.notify.notify_one();
    }

    /// When the countdown started and for which round
    pub fn started(&self) -> (Instant, Round) {
        *self.started.lock()
    }

    /// Wait for the next reset
    pub async fn reset_notified(&self) {
        self.notify.notified().await;
    }
}

/// Timeout of `current_round` given the round of the highest QC.
pub fn timeout_duration(params: &V2RoundConfig, current_round: Round, highest_qc_round: Round) -> Duration {
    let exponent = current_round
        .saturating_sub(highest_qc_round)
        .saturating_sub(1)
        .min(u64::from(params.max_timeout_exponent)) as u32;
    let multiplier = params.expo_timeout_base.max(1).saturating_pow(exponent);
    Duration::from_secs(params.timeout_period.saturating_mul(multiplier))
}

impl XDPoSV2Engine {
    /// Timeout of the current round under the parameters in force now
    pub fn current_timeout(&self) -> Duration {
        let (current_round, highest_qc_round) = {
            let state = self.round_state.lock();
            (state.current_round, state.highest_quorum_cert.round())
        };
        timeout_duration(&self.params(), current_round, highest_qc_round)
    }
}

/// Drive the countdown: fire [`XDPoSV2Engine::on_countdown_timeout`] whenever a
/// round outlives its timeout. Runs until the task is dropped.
pub async fn run_countdown(engine: Arc<XDPoSV2Engine>, chain: Arc<dyn ChainReader>) {
    loop {
        let (started_at, round) = engine.countdown.started();
        let deadline = started_at + engine.current_timeout();
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                trace!(target: "consensus::xdpos", round, "Countdown expired");
                if let Err(err) = engine.on_countdown_timeout(chain.as_ref(), round) {
                    debug!(target: "consensus::xdpos", round, %err, "Countdown timeout not handled");
                }
            }
            _ = engine.countdown.reset_notified() => {}
        }
    }
}

/// Purge stale pool entries every `period`. Runs until the task is dropped.
pub async fn run_pool_hygiene(engine: Arc<XDPoSV2Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        engine.hygiene_pools();
    }
}
