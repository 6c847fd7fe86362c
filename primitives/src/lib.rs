//! Pooled Staking Primitives
//!
//! Types, protocol constants and coordination traits shared by the staking-pool
//! pallet and the validator-registry pallet. Neither pallet depends on the
//! other: pools talk to the registry through [`ValidatorRegistryInterface`] and
//! the registry talks to pools through [`StakingPoolInterface`].

#![cfg_attr(not(feature = "std"), no_std)]

use codec::{Decode, Encode, MaxEncodedLen};
use scale_info::TypeInfo;
use sp_core::U256;
use sp_runtime::{ArithmeticError, DispatchError, DispatchResult, RuntimeDebug};

/// Amounts in the smallest currency denomination.
pub type Balance = u128;

/// Validator identifier, assigned sequentially by the registry starting at 1.
pub type ValidatorId = u64;

/// 1-based pool index within a validator.
pub type PoolIndex = u64;

/// Time index (block number) used for epochs, entry rounds and rate bins.
pub type Round = u64;

/// The treasury pool holds the validator's reward token and is the only pool
/// that may disburse it.
pub const TREASURY_POOL: PoolIndex = 1;

/// Maximum number of pools a single validator may run.
pub const MAX_POOLS_PER_VALIDATOR: usize = 24;

/// Denominator for commission rates and pool percentages (four decimals).
/// 50_000 == 5%.
pub const RATIO_DENOMINATOR: u128 = 1_000_000;

/// Highest commission a validator may take (100%).
pub const MAX_COMMISSION: u64 = 1_000_000;

/// Protocol floor for any pool's minimum entry stake.
pub const MIN_ENTRY_STAKE: Balance = 1_000_000;

/// Epoch length bounds, in rounds.
pub const MIN_EPOCH_LENGTH: u64 = 1;
pub const MAX_EPOCH_LENGTH: u64 = 1_000_000;

/// Share of online stake (permille) above which a validator is saturated and
/// its rewards are diminished.
pub const SOFT_SATURATION_PERMILLE: u128 = 100;

/// Share of online stake (permille) a validator may never exceed.
pub const HARD_SATURATION_PERMILLE: u128 = 150;

/// Protocol ceiling on stake held by one pool.
pub const MAX_STAKE_PER_POOL: Balance = 70_000_000_000_000;

/// Average stake (in the smallest denomination) above which the rate estimate
/// tracks new samples quickly.
pub const APR_HIGH_STAKE_THRESHOLD: u128 = 300_000_000_000;

/// Smoothing factors, in percent, applied below and above the threshold.
pub const APR_ALPHA_LOW: u128 = 10;
pub const APR_ALPHA_HIGH: u128 = 90;

/// Number of recent block timestamps used to estimate rounds per day.
pub const CLOCK_SAMPLES: u32 = 11;

pub const MILLIS_PER_DAY: u64 = 86_400_000;

/// Computes `Π numerators / Π denominators` with a 256-bit intermediate.
///
/// Every proportional reward, commission and ratio calculation goes through
/// here so `a * b` never overflows before the division.
pub fn wide_ratio(numerators: &[u128], denominators: &[u128]) -> Result<u128, ArithmeticError> {
    let mut numerator = U256::one();
    for factor in numerators {
        numerator = numerator
            .checked_mul(U256::from(*factor))
            .ok_or(ArithmeticError::Overflow)?;
    }

    let mut denominator = U256::one();
    for factor in denominators {
        denominator = denominator
            .checked_mul(U256::from(*factor))
            .ok_or(ArithmeticError::Overflow)?;
    }

    if denominator.is_zero() {
        return Err(ArithmeticError::DivisionByZero);
    }

    let ratio = numerator / denominator;
    if ratio > U256::from(u128::MAX) {
        return Err(ArithmeticError::Overflow);
    }
    Ok(ratio.low_u128())
}

/// Soft saturation level for a given total online stake.
pub fn saturation_level(online_stake: Balance) -> Balance {
    wide_ratio(&[online_stake, SOFT_SATURATION_PERMILLE], &[1000]).unwrap_or(Balance::MAX)
}

/// Hard cap on stake for one validator for a given total online stake.
pub fn max_validator_stake(online_stake: Balance) -> Balance {
    wide_ratio(&[online_stake, HARD_SATURATION_PERMILLE], &[1000]).unwrap_or(Balance::MAX)
}

/// Identifies one pool of one validator.
#[derive(
    Encode, Decode, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, RuntimeDebug, TypeInfo, MaxEncodedLen,
)]
pub struct PoolKey {
    pub validator_id: ValidatorId,
    pub pool_id: PoolIndex,
}

impl PoolKey {
    pub const fn new(validator_id: ValidatorId, pool_id: PoolIndex) -> Self {
        Self { validator_id, pool_id }
    }

    pub fn is_treasury(&self) -> bool {
        self.pool_id == TREASURY_POOL
    }

    /// Key of the treasury pool of the same validator.
    pub fn treasury(&self) -> Self {
        Self::new(self.validator_id, TREASURY_POOL)
    }

    /// Zero-based position of this pool in per-validator arrays.
    pub fn slot(&self) -> Option<usize> {
        let idx = usize::try_from(self.pool_id).ok()?.checked_sub(1)?;
        (idx < MAX_POOLS_PER_VALIDATOR).then_some(idx)
    }
}

/// Validator configuration as held by the registry.
#[derive(Encode, Decode, Clone, PartialEq, Eq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
pub struct ValidatorConfig<AccountId, AssetId> {
    pub owner: AccountId,
    /// Operator identity allowed to manage pools and trigger payouts.
    pub manager: AccountId,
    /// Receives the validator commission.
    pub commission_address: AccountId,
    /// Commission in millionths (50_000 == 5%).
    pub commission: u64,
    /// Epoch length in rounds.
    pub epoch_length: u64,
    /// Optional secondary reward token, held by the treasury pool.
    pub reward_token: Option<AssetId>,
    /// Secondary token amount paid out per epoch across all pools.
    pub reward_per_payout: Balance,
    pub min_entry_stake: Balance,
    /// Per-pool stake ceiling; zero means the protocol maximum.
    pub max_stake_per_pool: Balance,
    /// Round after which the validator accepts no new stake (zero = never).
    pub sunsetting_on: Round,
    /// Validator stakers are asked to move to once sunset.
    pub sunsetting_to: ValidatorId,
}

/// Cross-pool aggregates the registry maintains for each validator.
#[derive(Encode, Decode, Clone, Default, PartialEq, Eq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
pub struct ValidatorState {
    pub num_pools: u32,
    pub total_stakers: u64,
    pub total_staked: Balance,
    /// Reward tokens already assigned to stakers but not yet paid out.
    pub token_held_back: Balance,
}

/// Snapshot of each pool's share of validator stake, used to divide the
/// secondary reward between pools.
#[derive(Encode, Decode, Clone, Default, PartialEq, Eq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
pub struct TokenPayoutRatio {
    /// Millionths of validator stake held by each pool, indexed by slot.
    pub pool_pct_of_whole: [u64; MAX_POOLS_PER_VALIDATOR],
    pub updated_for_payout: Round,
}

impl TokenPayoutRatio {
    pub fn pct_for(&self, key: &PoolKey) -> u64 {
        key.slot().map(|idx| self.pool_pct_of_whole[idx]).unwrap_or(0)
    }
}

/// Net result of one epoch distribution, reported back to the registry.
#[derive(Encode, Decode, Clone, Default, PartialEq, Eq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
pub struct EpochReport {
    pub increased_stake: Balance,
    pub token_paid_out: Balance,
    pub commission_paid_out: Balance,
    pub burned_to_sink: Balance,
}

/// What a pool consumes from its registry.
pub trait ValidatorRegistryInterface<AccountId, AssetId> {
    /// Account the registry uses when it calls into pools.
    fn registry_account() -> AccountId;

    fn validator_config(validator_id: ValidatorId) -> Result<ValidatorConfig<AccountId, AssetId>, DispatchError>;

    fn validator_state(validator_id: ValidatorId) -> Result<ValidatorState, DispatchError>;

    fn owner_and_manager(validator_id: ValidatorId) -> Result<(AccountId, AccountId), DispatchError>;

    /// Authoritative account of a validator's pool.
    fn pool_account(validator_id: ValidatorId, pool_id: PoolIndex) -> Result<AccountId, DispatchError>;

    /// Refreshes the validator's payout ratio snapshot. Only the treasury pool
    /// account may call this.
    fn set_token_payout_ratio(caller: &AccountId, validator_id: ValidatorId) -> Result<TokenPayoutRatio, DispatchError>;

    fn stake_removed(
        caller: &AccountId,
        key: PoolKey,
        staker: &AccountId,
        amount_removed: Balance,
        reward_removed: Balance,
        staker_removed: bool,
    ) -> DispatchResult;

    fn stake_updated_via_rewards(caller: &AccountId, key: PoolKey, report: &EpochReport) -> DispatchResult;
}

/// What the registry consumes from the pools.
pub trait StakingPoolInterface<AccountId, AssetId> {
    /// Creates pool state and returns the pool's account.
    fn create_pool(key: PoolKey, min_entry_stake: Balance) -> Result<AccountId, DispatchError>;

    fn pool_account(key: PoolKey) -> AccountId;

    /// Credits already-transferred stake to `staker`. Returns the entry round.
    fn add_stake(caller: &AccountId, key: PoolKey, staker: &AccountId, amount: Balance) -> Result<Round, DispatchError>;

    /// `(staker_count, total_staked)` of a pool.
    fn pool_totals(key: PoolKey) -> Result<(u32, Balance), DispatchError>;

    /// Pays reward tokens out of the treasury pool.
    fn pay_token_reward(
        caller: &AccountId,
        key: PoolKey,
        receiver: &AccountId,
        token: AssetId,
        amount: Balance,
    ) -> DispatchResult;
}

/// Cooperative budget checkpoint invoked once per ledger slot visited.
///
/// Metered hosts can charge or yield here; the unit implementation is a no-op.
pub trait BudgetMeter {
    fn checkpoint(&mut self, units: u32);
}

impl BudgetMeter for () {
    fn checkpoint(&mut self, _units: u32) {}
}

/// Meter that only counts checkpoints.
#[derive(Clone, Copy, Default, PartialEq, Eq, RuntimeDebug)]
pub struct StepMeter {
    pub steps: u32,
    pub units: u64,
}

impl BudgetMeter for StepMeter {
    fn checkpoint(&mut self, units: u32) {
        self.steps = self.steps.saturating_add(1);
        self.units = self.units.saturating_add(units as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_ratio_avoids_overflow() {
        let big = u64::MAX as u128 * 1_000;
        assert_eq!(wide_ratio(&[big, big], &[big]), Ok(big));
        assert_eq!(wide_ratio(&[u128::MAX, 2], &[4]), Ok(u128::MAX / 2));
    }

    #[test]
    fn test_wide_ratio_truncates() {
        // 100 * 50_000 / 1_000_000 = 5
        assert_eq!(wide_ratio(&[100, 50_000], &[RATIO_DENOMINATOR]), Ok(5));
        assert_eq!(wide_ratio(&[7], &[2]), Ok(3));
    }

    #[test]
    fn test_wide_ratio_errors() {
        assert_eq!(wide_ratio(&[1], &[0]), Err(ArithmeticError::DivisionByZero));
        assert_eq!(wide_ratio(&[u128::MAX, u128::MAX], &[1]), Err(ArithmeticError::Overflow));
    }

    #[test]
    fn test_saturation_levels() {
        assert_eq!(saturation_level(2_000_000), 200_000);
        assert_eq!(max_validator_stake(2_000_000), 300_000);
    }

    #[test]
    fn test_pool_key_slots() {
        let key = PoolKey::new(3, 2);
        assert_eq!(key.slot(), Some(1));
        assert!(!key.is_treasury());
        assert_eq!(key.treasury(), PoolKey::new(3, TREASURY_POOL));
        assert_eq!(PoolKey::new(3, 0).slot(), None);
        assert_eq!(PoolKey::new(3, 25).slot(), None);
    }

    #[test]
    fn test_payout_ratio_lookup() {
        let mut ratio = TokenPayoutRatio::default();
        ratio.pool_pct_of_whole[1] = 250_000;
        assert_eq!(ratio.pct_for(&PoolKey::new(1, 2)), 250_000);
        assert_eq!(ratio.pct_for(&PoolKey::new(1, 0)), 0);
    }

    #[test]
    fn test_step_meter_counts() {
        let mut meter = StepMeter::default();
        meter.checkpoint(300);
        meter.checkpoint(200);
        assert_eq!(meter.steps, 2);
        assert_eq!(meter.units, 500);
    }
}
