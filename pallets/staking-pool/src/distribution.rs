//! Epoch reward distribution.
//!
//! [`split_reward`] takes commission or saturation burn off the primary
//! surplus. [`distribute`] then credits what is left to stakers in two passes:
//! partial-epoch stakers are paid a time-weighted share of the original
//! reward, and full-epoch stakers split whatever remains against the stake
//! that was not paid in the first pass.

use frame_support::traits::Get;
use sp_runtime::{ArithmeticError, RuntimeDebug};
use stakepool_primitives::{wide_ratio, Balance, BudgetMeter, Round, RATIO_DENOMINATOR};

use crate::ledger::{LedgerError, StakerLedger};

/// Budget units charged per slot in the partial-epoch pass.
pub const PARTIAL_PASS_COST: u32 = 400;
/// Budget units charged per slot in the full-epoch pass.
pub const FULL_PASS_COST: u32 = 200;

/// Time fraction precision, in tenths of a percent.
const TIME_PRECISION: u128 = 1000;

/// How the primary surplus of one epoch is divided.
#[derive(Clone, Copy, Default, PartialEq, Eq, RuntimeDebug)]
pub struct RewardSplit {
    pub to_stakers: Balance,
    pub commission: Balance,
    pub burned: Balance,
}

/// Validator stake against the protocol's soft saturation level.
#[derive(Clone, Copy, PartialEq, Eq, RuntimeDebug)]
pub struct Saturation {
    pub level: Balance,
    pub validator_stake: Balance,
}

impl Saturation {
    pub fn is_saturated(&self) -> bool {
        self.validator_stake > self.level
    }
}

/// Splits `reward` into staker share, validator commission and burn.
///
/// A saturated validator earns no commission. Its stakers receive
/// `reward * level / validator_stake`, never more than they would have after
/// normal commission, and the rest is burned.
pub fn split_reward(reward: Balance, commission_rate: u64, saturation: Saturation) -> Result<RewardSplit, ArithmeticError> {
    let normal_commission = wide_ratio(&[reward, commission_rate as u128], &[RATIO_DENOMINATOR])?;

    if saturation.is_saturated() {
        let diminished = wide_ratio(&[reward, saturation.level], &[saturation.validator_stake])?
            .min(reward.saturating_sub(normal_commission));
        return Ok(RewardSplit {
            to_stakers: diminished,
            commission: 0,
            burned: reward - diminished,
        });
    }

    Ok(RewardSplit {
        to_stakers: reward.saturating_sub(normal_commission),
        commission: normal_commission,
        burned: 0,
    })
}

/// Part of the commission diverted to the manager account when it is running
/// low on spendable funds.
pub fn manager_top_off(
    commission: Balance,
    manager_spendable: Balance,
    limit: Balance,
    manager_is_commission_address: bool,
) -> Balance {
    if manager_is_commission_address || manager_spendable >= limit {
        return 0;
    }
    commission.min(limit)
}

/// Inputs of one two-pass distribution.
#[derive(Clone, Copy, PartialEq, Eq, RuntimeDebug)]
pub struct EpochInputs {
    /// Start of the epoch window the payout belongs to.
    pub epoch_begin: Round,
    pub epoch_length: u64,
    /// Primary reward left for stakers after commission or burn.
    pub reward: Balance,
    /// This pool's share of the secondary token reward.
    pub token_reward: Balance,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, RuntimeDebug)]
pub struct Distribution {
    pub increased_stake: Balance,
    pub token_paid_out: Balance,
    /// Stake excluded from the second pass.
    pub partial_stake: Balance,
}

/// Credits `inputs.reward` and `inputs.token_reward` to stakers.
///
/// Proportions are taken against the ledger total as it stood on entry. Any
/// integer remainder is left undistributed.
pub fn distribute<AccountId, S>(
    ledger: &mut StakerLedger<'_, AccountId, S>,
    inputs: &EpochInputs,
    meter: &mut impl BudgetMeter,
) -> Result<Distribution, LedgerError>
where
    AccountId: Clone + PartialEq,
    S: Get<u32>,
{
    let mut outcome = Distribution::default();
    let total_staked = ledger.total_staked();
    if (inputs.reward == 0 && inputs.token_reward == 0) || total_staked == 0 {
        return Ok(outcome);
    }

    let epoch_length = inputs.epoch_length.max(1);
    let mut reward_left = inputs.reward;
    let mut token_left = inputs.token_reward;

    for idx in 0..ledger.capacity() {
        meter.checkpoint(PARTIAL_PASS_COST);
        let Some(record) = ledger.get(idx).filter(|r| !r.is_empty()) else {
            continue;
        };
        let balance = record.balance;

        if record.entry_round >= inputs.epoch_begin {
            // forward-dated entry, no time in this epoch
            outcome.partial_stake = outcome.partial_stake.saturating_add(balance);
            continue;
        }
        let time_in_pool = inputs.epoch_begin - record.entry_round;
        if time_in_pool >= epoch_length {
            continue;
        }

        outcome.partial_stake = outcome.partial_stake.saturating_add(balance);
        let time_pct = (time_in_pool as u128) * TIME_PRECISION / epoch_length as u128;

        if inputs.token_reward > 0 {
            let token_share =
                wide_ratio(&[balance, inputs.token_reward, time_pct], &[total_staked, TIME_PRECISION])?;
            token_left = token_left.checked_sub(token_share).ok_or(ArithmeticError::Underflow)?;
            ledger.credit_secondary_reward(idx, token_share)?;
            outcome.token_paid_out += token_share;
        }

        let share = wide_ratio(&[balance, inputs.reward, time_pct], &[total_staked, TIME_PRECISION])?;
        reward_left = reward_left.checked_sub(share).ok_or(ArithmeticError::Underflow)?;
        ledger.credit_reward(idx, share)?;
        outcome.increased_stake += share;
    }

    let full_stake = total_staked.saturating_sub(outcome.partial_stake);
    if full_stake == 0 {
        return Ok(outcome);
    }

    for idx in 0..ledger.capacity() {
        meter.checkpoint(FULL_PASS_COST);
        let Some(record) = ledger.get(idx).filter(|r| !r.is_empty()) else {
            continue;
        };
        if record.entry_round >= inputs.epoch_begin || inputs.epoch_begin - record.entry_round < epoch_length {
            continue;
        }
        // token share is taken on the balance before this epoch's reward
        let balance = record.balance;

        if token_left > 0 {
            let token_share = wide_ratio(&[balance, token_left], &[full_stake])?;
            ledger.credit_secondary_reward(idx, token_share)?;
            outcome.token_paid_out += token_share;
        }
        if reward_left > 0 {
            let share = wide_ratio(&[balance, reward_left], &[full_stake])?;
            ledger.credit_reward(idx, share)?;
            outcome.increased_stake += share;
        }
    }

    Ok(outcome)
}
