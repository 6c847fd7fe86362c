//! Time-binned reward rate estimation.
//!
//! Each pool keeps one [`RateBin`]. Stake and reward movements are weighted by
//! the rounds left in the current bin; when a bin closes the accumulated
//! reward over average stake becomes an annualized rate that is blended into
//! an exponential moving average.

use codec::{Decode, Encode, MaxEncodedLen};
use scale_info::TypeInfo;
use sp_core::U256;
use sp_runtime::RuntimeDebug;
use stakepool_primitives::{
    Balance, Round, APR_ALPHA_HIGH, APR_ALPHA_LOW, APR_HIGH_STAKE_THRESHOLD, CLOCK_SAMPLES, MILLIS_PER_DAY,
};

use crate::LOG_TARGET;

#[derive(Encode, Decode, Clone, Default, PartialEq, Eq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
pub struct RateBin {
    pub bin_start: Round,
    /// Estimated rounds per day when the bin opened.
    pub bin_length: u64,
    /// Σ balance × rounds remaining in bin.
    pub stake_accumulator: U256,
    /// Reward credited since the bin opened.
    pub reward_accumulator: Balance,
    /// Smoothed APR in hundredths of a percent.
    pub moving_average: u128,
}

/// What happened when a closed bin was rolled.
#[derive(Clone, Copy, PartialEq, Eq, RuntimeDebug)]
pub struct BinRolled {
    /// `None` when the bin had no average stake to rate against.
    pub apr: Option<u128>,
    pub moving_average: u128,
    pub next_bin_length: u64,
}

impl RateBin {
    pub fn new(now: Round, rounds_per_day: u64) -> Self {
        let bin_length = rounds_per_day.max(1);
        Self {
            bin_start: now - now % bin_length,
            bin_length,
            ..Default::default()
        }
    }

    pub fn rounds_left(&self, now: Round) -> u64 {
        self.bin_start.saturating_add(self.bin_length).saturating_sub(now)
    }

    pub fn is_closed(&self, now: Round) -> bool {
        now >= self.bin_start.saturating_add(self.bin_length)
    }

    pub fn accrue_stake_added(&mut self, amount: Balance, now: Round) {
        let weighted = U256::from(amount).saturating_mul(U256::from(self.rounds_left(now)));
        self.stake_accumulator = self.stake_accumulator.saturating_add(weighted);
    }

    pub fn accrue_stake_removed(&mut self, amount: Balance, now: Round) {
        let weighted = U256::from(amount).saturating_mul(U256::from(self.rounds_left(now)));
        self.stake_accumulator = self.stake_accumulator.saturating_sub(weighted);
    }

    /// Reward compounds into stake, so it feeds both accumulators.
    pub fn accrue_reward(&mut self, amount: Balance, now: Round) {
        self.accrue_stake_added(amount, now);
        self.reward_accumulator = self.reward_accumulator.saturating_add(amount);
    }

    /// Rolls the bin if `now` is past its end. Calling it again inside the
    /// freshly opened bin is a no-op.
    pub fn roll_if_closed(&mut self, now: Round, total_staked: Balance, rounds_per_day: u64) -> Option<BinRolled> {
        if !self.is_closed(now) {
            return None;
        }

        let bin_length = U256::from(self.bin_length.max(1));
        let avg_stake = self.stake_accumulator / bin_length;
        let mut apr = None;
        if !avg_stake.is_zero() {
            let rounds_per_year = bin_length.saturating_mul(U256::from(365u32));
            let rate = U256::from(self.reward_accumulator).saturating_mul(U256::from(1_000_000u32)) / avg_stake;
            let annualized = narrow(rate.saturating_mul(rounds_per_year / bin_length) / U256::from(100u32));

            let alpha = if avg_stake > U256::from(APR_HIGH_STAKE_THRESHOLD) { APR_ALPHA_HIGH } else { APR_ALPHA_LOW };
            self.moving_average = if self.moving_average == 0 {
                annualized
            } else {
                self.moving_average.saturating_mul(100 - alpha) / 100 + annualized.saturating_mul(alpha) / 100
            };
            apr = Some(annualized);
        }

        let next_bin_length = rounds_per_day.max(1);
        self.bin_length = next_bin_length;
        self.stake_accumulator = U256::from(total_staked).saturating_mul(U256::from(next_bin_length));
        self.reward_accumulator = 0;
        self.bin_start = now - now % next_bin_length;

        log::debug!(
            target: LOG_TARGET,
            "rate bin rolled at {}: apr={:?} ewma={} next_length={}",
            now,
            apr,
            self.moving_average,
            next_bin_length,
        );

        Some(BinRolled { apr, moving_average: self.moving_average, next_bin_length })
    }
}

fn narrow(value: U256) -> u128 {
    if value > U256::from(u128::MAX) {
        u128::MAX
    } else {
        value.low_u128()
    }
}

/// Estimates rounds per day from the oldest and newest of the recent block
/// timestamps (milliseconds). Falls back to `default` when the window is not
/// yet full or the samples are degenerate.
pub fn rounds_per_day(samples: &[u64], default: u64) -> u64 {
    if samples.len() < CLOCK_SAMPLES as usize {
        return default;
    }
    let (Some(oldest), Some(newest)) = (samples.first(), samples.last()) else {
        return default;
    };
    let elapsed = newest.saturating_sub(*oldest);
    if elapsed == 0 {
        log::warn!(target: LOG_TARGET, "clock samples have no spread, using default bin length {}", default);
        return default;
    }

    let intervals = samples.len() as u64 - 1;
    match MILLIS_PER_DAY.saturating_mul(intervals) / elapsed {
        0 => default,
        estimate => estimate,
    }
}
