//! # Validator Registry Pallet
//!
//! Keeps the validator set for pooled staking and coordinates the pools that
//! run on their behalf.
//!
//! ## How it works:
//! 1. An owner registers a validator with its commission, epoch length and
//!    optional reward token, then adds pools (pool 1 is the treasury pool)
//! 2. Stakers call `add_stake`; the registry picks a pool, moves the funds to
//!    the pool account and credits them through [`StakingPoolInterface`]
//! 3. Pools report back through [`ValidatorRegistryInterface`]: removed stake,
//!    compounded rewards, and requests for the per-pool token payout ratio
//!
//! ## Aggregates:
//! - Per pool: stakers and stake
//! - Per validator: pools, stakers, stake and reward tokens held back for
//!   stakers
//! - Global: distinct stakers and total stake

#![cfg_attr(not(feature = "std"), no_std)]

pub use pallet::*;

#[cfg(test)]
mod mock;

use codec::{Decode, Encode, MaxEncodedLen};
use scale_info::TypeInfo;
use sp_runtime::RuntimeDebug;
use stakepool_primitives::{Balance, Round};

pub const LOG_TARGET: &str = "runtime::validator-registry";

/// Registry view of one pool.
#[derive(Encode, Decode, Clone, PartialEq, Eq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
pub struct PoolInfo<AccountId> {
    pub account: AccountId,
    pub total_stakers: u32,
    pub total_staked: Balance,
}

/// Protocol limits as seen by clients.
#[derive(Encode, Decode, Clone, PartialEq, Eq, RuntimeDebug, TypeInfo)]
pub struct Constraints {
    pub epoch_length_min: Round,
    pub epoch_length_max: Round,
    pub max_commission: u64,
    pub min_entry_stake: Balance,
    pub max_stake_per_pool: Balance,
    pub max_stake_per_validator: Balance,
    pub saturation_level: Balance,
    pub max_pools_per_validator: u32,
    pub max_stakers_per_pool: u32,
    pub max_pools_per_staker: u32,
}

#[frame_support::pallet]
pub mod pallet {
    use super::*;
    use frame_support::{
        pallet_prelude::*,
        storage::with_storage_layer,
        traits::{fungibles, Currency, ExistenceRequirement},
        PalletId,
    };
    use frame_system::pallet_prelude::*;
    use sp_runtime::traits::{AccountIdConversion, SaturatedConversion};
    use stakepool_primitives::{
        max_validator_stake, saturation_level, wide_ratio, EpochReport, PoolIndex, PoolKey, StakingPoolInterface,
        TokenPayoutRatio, ValidatorConfig, ValidatorId, ValidatorRegistryInterface, ValidatorState, MAX_COMMISSION,
        MAX_EPOCH_LENGTH, MAX_POOLS_PER_VALIDATOR, MAX_STAKE_PER_POOL, MIN_ENTRY_STAKE, MIN_EPOCH_LENGTH,
        RATIO_DENOMINATOR, TREASURY_POOL,
    };

    pub type MaxPools = ConstU32<{ MAX_POOLS_PER_VALIDATOR as u32 }>;

    pub type ConfigOf<T> = ValidatorConfig<<T as frame_system::Config>::AccountId, <T as Config>::AssetId>;

    pub type PoolsOf<T> = BoundedVec<PoolInfo<<T as frame_system::Config>::AccountId>, MaxPools>;

    #[pallet::config]
    pub trait Config: frame_system::Config {
        type RuntimeEvent: From<Event<Self>> + IsType<<Self as frame_system::Config>::RuntimeEvent>;

        type Currency: Currency<Self::AccountId>;

        type AssetId: Parameter + Copy + MaxEncodedLen;

        /// Reward tokens held by treasury pools.
        type Assets: fungibles::Inspect<Self::AccountId, AssetId = Self::AssetId>;

        type Pools: StakingPoolInterface<Self::AccountId, Self::AssetId>;

        /// Total online stake of the consensus layer.
        type OnlineStake: Get<Balance>;

        #[pallet::constant]
        type PalletId: Get<PalletId>;

        /// Ledger capacity of each pool.
        #[pallet::constant]
        type MaxStakersPerPool: Get<u32>;

        /// Pools a single account may be staked in across all validators.
        #[pallet::constant]
        type MaxPoolsPerStaker: Get<u32>;
    }

    #[pallet::pallet]
    pub struct Pallet<T>(_);

    #[pallet::storage]
    #[pallet::getter(fn num_validators)]
    pub type NumValidators<T: Config> = StorageValue<_, ValidatorId, ValueQuery>;

    #[pallet::storage]
    #[pallet::getter(fn validators)]
    pub type Validators<T: Config> = StorageMap<_, Blake2_128Concat, ValidatorId, ConfigOf<T>, OptionQuery>;

    #[pallet::storage]
    #[pallet::getter(fn states)]
    pub type ValidatorStates<T: Config> = StorageMap<_, Blake2_128Concat, ValidatorId, ValidatorState, ValueQuery>;

    #[pallet::storage]
    #[pallet::getter(fn validator_pools)]
    pub type ValidatorPools<T: Config> = StorageMap<_, Blake2_128Concat, ValidatorId, PoolsOf<T>, ValueQuery>;

    #[pallet::storage]
    #[pallet::getter(fn token_payout_ratio)]
    pub type PayoutRatios<T: Config> = StorageMap<_, Blake2_128Concat, ValidatorId, TokenPayoutRatio, ValueQuery>;

    /// Pools each staker has stake in.
    #[pallet::storage]
    #[pallet::getter(fn staked_pools)]
    pub type StakerPools<T: Config> =
        StorageMap<_, Blake2_128Concat, T::AccountId, BoundedVec<PoolKey, T::MaxPoolsPerStaker>, ValueQuery>;

    /// Accounts with stake in at least one pool.
    #[pallet::storage]
    #[pallet::getter(fn num_stakers)]
    pub type NumStakers<T: Config> = StorageValue<_, u64, ValueQuery>;

    #[pallet::storage]
    #[pallet::getter(fn total_staked)]
    pub type TotalStaked<T: Config> = StorageValue<_, Balance, ValueQuery>;

    #[pallet::event]
    #[pallet::generate_deposit(pub(super) fn deposit_event)]
    pub enum Event<T: Config> {
        ValidatorAdded { validator_id: ValidatorId, owner: T::AccountId },
        ManagerChanged { validator_id: ValidatorId, manager: T::AccountId },
        CommissionAddressChanged { validator_id: ValidatorId, commission_address: T::AccountId },
        RewardInfoChanged { validator_id: ValidatorId, reward_per_payout: Balance },
        SunsetInfoChanged { validator_id: ValidatorId, sunsetting_on: Round, sunsetting_to: ValidatorId },
        PoolAdded { key: PoolKey, account: T::AccountId },
        StakeAdded { key: PoolKey, staker: T::AccountId, amount: Balance, entry_round: Round },
        StakeRemoved {
            key: PoolKey,
            staker: T::AccountId,
            amount: Balance,
            reward_removed: Balance,
            staker_removed: bool,
        },
        RewardsCompounded {
            key: PoolKey,
            increased_stake: Balance,
            token_paid_out: Balance,
            commission_paid_out: Balance,
            burned_to_sink: Balance,
        },
        PayoutRatioUpdated { validator_id: ValidatorId, round: Round },
        TokenRewardsEmptied { validator_id: ValidatorId, receiver: T::AccountId, amount: Balance },
    }

    #[pallet::error]
    pub enum Error<T> {
        ValidatorNotFound,
        /// Caller lacks the owner, manager or pool role required
        Unauthorized,
        /// Epoch length outside the protocol bounds
        InvalidEpochLength,
        /// Commission above 100%
        InvalidCommission,
        /// Stake below the validator's minimum entry stake
        EntryStakeTooLow,
        /// Per-pool maximum above the protocol ceiling
        PoolStakeTooHigh,
        TooManyPools,
        PoolNotFound,
        /// Validator no longer accepts stake
        ValidatorSunset,
        /// Stake would push the validator past the hard cap
        ExceedsValidatorCap,
        /// No pool has room for this stake
        NoPoolAvailable,
        /// Staker is already in the maximum number of pools
        TooManyStakedPools,
        /// Pool report with nothing in it
        NothingToReport,
        NoRewardToken,
        /// Treasury pool has no unassigned reward tokens
        NoTokensAvailable,
        ZeroStake,
    }

    #[pallet::call]
    impl<T: Config> Pallet<T> {
        /// Register a validator. The caller must be the configured owner.
        #[pallet::call_index(0)]
        #[pallet::weight(Weight::from_parts(50_000_000, 0))]
        pub fn add_validator(origin: OriginFor<T>, config: ConfigOf<T>) -> DispatchResult {
            let who = ensure_signed(origin)?;
            ensure!(who == config.owner, Error::<T>::Unauthorized);
            Self::validate_config(&config)?;

            let validator_id = NumValidators::<T>::get().saturating_add(1);
            NumValidators::<T>::put(validator_id);
            Validators::<T>::insert(validator_id, config);

            Self::deposit_event(Event::ValidatorAdded { validator_id, owner: who });
            log::info!(target: LOG_TARGET, "validator {} registered", validator_id);
            Ok(())
        }

        #[pallet::call_index(1)]
        #[pallet::weight(Weight::from_parts(20_000_000, 0))]
        pub fn change_validator_manager(
            origin: OriginFor<T>,
            validator_id: ValidatorId,
            manager: T::AccountId,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;
            Self::mutate_as_owner(&who, validator_id, |config| config.manager = manager.clone())?;
            Self::deposit_event(Event::ManagerChanged { validator_id, manager });
            Ok(())
        }

        #[pallet::call_index(2)]
        #[pallet::weight(Weight::from_parts(20_000_000, 0))]
        pub fn change_validator_commission_address(
            origin: OriginFor<T>,
            validator_id: ValidatorId,
            commission_address: T::AccountId,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;
            Self::mutate_as_owner(&who, validator_id, |config| {
                config.commission_address = commission_address.clone()
            })?;
            Self::deposit_event(Event::CommissionAddressChanged { validator_id, commission_address });
            Ok(())
        }

        #[pallet::call_index(3)]
        #[pallet::weight(Weight::from_parts(20_000_000, 0))]
        pub fn change_validator_reward_info(
            origin: OriginFor<T>,
            validator_id: ValidatorId,
            reward_per_payout: Balance,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;
            Self::mutate_as_owner(&who, validator_id, |config| config.reward_per_payout = reward_per_payout)?;
            Self::deposit_event(Event::RewardInfoChanged { validator_id, reward_per_payout });
            Ok(())
        }

        /// Stop accepting stake from round `sunsetting_on` (0 clears it),
        /// pointing stakers at `sunsetting_to`.
        #[pallet::call_index(4)]
        #[pallet::weight(Weight::from_parts(20_000_000, 0))]
        pub fn change_validator_sunset_info(
            origin: OriginFor<T>,
            validator_id: ValidatorId,
            sunsetting_on: Round,
            sunsetting_to: ValidatorId,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;
            if sunsetting_to != 0 {
                ensure!(Validators::<T>::contains_key(sunsetting_to), Error::<T>::ValidatorNotFound);
            }
            Self::mutate_as_owner(&who, validator_id, |config| {
                config.sunsetting_on = sunsetting_on;
                config.sunsetting_to = sunsetting_to;
            })?;
            Self::deposit_event(Event::SunsetInfoChanged { validator_id, sunsetting_on, sunsetting_to });
            Ok(())
        }

        /// Create the validator's next pool. Owner or manager only.
        #[pallet::call_index(5)]
        #[pallet::weight(Weight::from_parts(80_000_000, 0))]
        pub fn add_pool(origin: OriginFor<T>, validator_id: ValidatorId) -> DispatchResult {
            let who = ensure_signed(origin)?;
            with_storage_layer(|| Self::do_add_pool(&who, validator_id))
        }

        /// Stake `amount` with a validator. The registry picks the pool.
        #[pallet::call_index(6)]
        #[pallet::weight(Weight::from_parts(150_000_000, 0))]
        pub fn add_stake(origin: OriginFor<T>, validator_id: ValidatorId, amount: Balance) -> DispatchResult {
            let who = ensure_signed(origin)?;
            with_storage_layer(|| Self::do_add_stake(&who, validator_id, amount))
        }

        /// Send the treasury pool's unassigned reward tokens to `receiver`.
        /// Owner only.
        #[pallet::call_index(7)]
        #[pallet::weight(Weight::from_parts(80_000_000, 0))]
        pub fn empty_token_rewards(
            origin: OriginFor<T>,
            validator_id: ValidatorId,
            receiver: T::AccountId,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;
            with_storage_layer(|| Self::do_empty_token_rewards(&who, validator_id, &receiver))
        }
    }

    impl<T: Config> Pallet<T> {
        pub fn registry_account() -> T::AccountId {
            T::PalletId::get().into_account_truncating()
        }

        pub fn current_round() -> Round {
            frame_system::Pallet::<T>::block_number().saturated_into::<u64>()
        }

        /// Stake one pool of `validator_id` may currently hold: the configured
        /// (or protocol) per-pool maximum, capped by the validator hard cap
        /// split across its pools.
        pub fn max_stake_per_pool(validator_id: ValidatorId) -> Result<Balance, DispatchError> {
            let config = Validators::<T>::get(validator_id).ok_or(Error::<T>::ValidatorNotFound)?;
            let num_pools = ValidatorPools::<T>::decode_len(validator_id).unwrap_or(0).max(1) as u128;
            let configured = match config.max_stake_per_pool {
                0 => MAX_STAKE_PER_POOL,
                max => max,
            };
            Ok(configured.min(max_validator_stake(T::OnlineStake::get()) / num_pools))
        }

        pub fn protocol_constraints() -> Constraints {
            let online = T::OnlineStake::get();
            Constraints {
                epoch_length_min: MIN_EPOCH_LENGTH,
                epoch_length_max: MAX_EPOCH_LENGTH,
                max_commission: MAX_COMMISSION,
                min_entry_stake: MIN_ENTRY_STAKE,
                max_stake_per_pool: MAX_STAKE_PER_POOL,
                max_stake_per_validator: max_validator_stake(online),
                saturation_level: saturation_level(online),
                max_pools_per_validator: MAX_POOLS_PER_VALIDATOR as u32,
                max_stakers_per_pool: T::MaxStakersPerPool::get(),
                max_pools_per_staker: T::MaxPoolsPerStaker::get(),
            }
        }

        fn validate_config(config: &ConfigOf<T>) -> DispatchResult {
            ensure!(
                (MIN_EPOCH_LENGTH..=MAX_EPOCH_LENGTH).contains(&config.epoch_length),
                Error::<T>::InvalidEpochLength
            );
            ensure!(config.commission <= MAX_COMMISSION, Error::<T>::InvalidCommission);
            ensure!(config.min_entry_stake >= MIN_ENTRY_STAKE, Error::<T>::EntryStakeTooLow);
            ensure!(config.max_stake_per_pool <= MAX_STAKE_PER_POOL, Error::<T>::PoolStakeTooHigh);
            Ok(())
        }

        fn mutate_as_owner(
            who: &T::AccountId,
            validator_id: ValidatorId,
            f: impl FnOnce(&mut ConfigOf<T>),
        ) -> DispatchResult {
            Validators::<T>::try_mutate(validator_id, |maybe| -> DispatchResult {
                let config = maybe.as_mut().ok_or(Error::<T>::ValidatorNotFound)?;
                ensure!(*who == config.owner, Error::<T>::Unauthorized);
                f(config);
                Ok(())
            })
        }

        fn do_add_pool(who: &T::AccountId, validator_id: ValidatorId) -> DispatchResult {
            let config = Validators::<T>::get(validator_id).ok_or(Error::<T>::ValidatorNotFound)?;
            ensure!(*who == config.owner || *who == config.manager, Error::<T>::Unauthorized);

            let mut pools = ValidatorPools::<T>::get(validator_id);
            ensure!(pools.len() < MAX_POOLS_PER_VALIDATOR, Error::<T>::TooManyPools);
            let key = PoolKey::new(validator_id, pools.len() as PoolIndex + 1);

            let account = T::Pools::create_pool(key, config.min_entry_stake)?;
            pools
                .try_push(PoolInfo { account: account.clone(), total_stakers: 0, total_staked: 0 })
                .map_err(|_| Error::<T>::TooManyPools)?;
            ValidatorPools::<T>::insert(validator_id, pools);
            ValidatorStates::<T>::mutate(validator_id, |state| state.num_pools = state.num_pools.saturating_add(1));

            Self::deposit_event(Event::PoolAdded { key, account });
            Ok(())
        }

        fn do_add_stake(who: &T::AccountId, validator_id: ValidatorId, amount: Balance) -> DispatchResult {
            ensure!(amount > 0, Error::<T>::ZeroStake);
            let config = Validators::<T>::get(validator_id).ok_or(Error::<T>::ValidatorNotFound)?;
            if config.sunsetting_on != 0 {
                ensure!(Self::current_round() < config.sunsetting_on, Error::<T>::ValidatorSunset);
            }

            let mut state = ValidatorStates::<T>::get(validator_id);
            let new_total = state.total_staked.saturating_add(amount);
            ensure!(new_total <= max_validator_stake(T::OnlineStake::get()), Error::<T>::ExceedsValidatorCap);

            let (key, new_to_pool) = Self::find_pool_for_staker(validator_id, who, amount, &config)?;
            let Some(slot) = key.slot() else {
                return Err(Error::<T>::PoolNotFound.into());
            };
            let mut pools = ValidatorPools::<T>::get(validator_id);
            let pool_account = pools.get(slot).map(|p| p.account.clone()).ok_or(Error::<T>::PoolNotFound)?;

            T::Currency::transfer(who, &pool_account, amount.saturated_into(), ExistenceRequirement::KeepAlive)?;
            let entry_round = T::Pools::add_stake(&Self::registry_account(), key, who, amount)?;

            if new_to_pool {
                let first_pool = StakerPools::<T>::get(who).is_empty();
                StakerPools::<T>::try_mutate(who, |keys| keys.try_push(key))
                    .map_err(|_| Error::<T>::TooManyStakedPools)?;
                if first_pool {
                    NumStakers::<T>::mutate(|n| *n = n.saturating_add(1));
                }
                state.total_stakers = state.total_stakers.saturating_add(1);
            }
            if let Some(pool) = pools.get_mut(slot) {
                pool.total_staked = pool.total_staked.saturating_add(amount);
                if new_to_pool {
                    pool.total_stakers = pool.total_stakers.saturating_add(1);
                }
            }
            state.total_staked = new_total;
            ValidatorPools::<T>::insert(validator_id, pools);
            ValidatorStates::<T>::insert(validator_id, state);
            TotalStaked::<T>::mutate(|total| *total = total.saturating_add(amount));

            Self::deposit_event(Event::StakeAdded { key, staker: who.clone(), amount, entry_round });
            Ok(())
        }

        /// Picks the pool for new stake: a pool the staker is already in if it
        /// has room, else the first pool with a free slot and room. Returns the
        /// pool and whether the staker is new to it.
        pub fn find_pool_for_staker(
            validator_id: ValidatorId,
            staker: &T::AccountId,
            amount: Balance,
            config: &ConfigOf<T>,
        ) -> Result<(PoolKey, bool), DispatchError> {
            let pools = ValidatorPools::<T>::get(validator_id);
            ensure!(!pools.is_empty(), Error::<T>::NoPoolAvailable);
            let max_per_pool = Self::max_stake_per_pool(validator_id)?;
            let has_room = |pool: &PoolInfo<T::AccountId>| pool.total_staked.saturating_add(amount) <= max_per_pool;

            let staked = StakerPools::<T>::get(staker);
            for key in staked.iter().filter(|k| k.validator_id == validator_id) {
                if key.slot().and_then(|slot| pools.get(slot)).is_some_and(|pool| has_room(pool)) {
                    return Ok((*key, false));
                }
            }

            ensure!(amount >= config.min_entry_stake, Error::<T>::EntryStakeTooLow);
            ensure!((staked.len() as u32) < T::MaxPoolsPerStaker::get(), Error::<T>::TooManyStakedPools);
            for (idx, pool) in pools.iter().enumerate() {
                let key = PoolKey::new(validator_id, idx as PoolIndex + 1);
                if staked.contains(&key) {
                    continue;
                }
                if pool.total_stakers < T::MaxStakersPerPool::get() && has_room(pool) {
                    return Ok((key, true));
                }
            }
            Err(Error::<T>::NoPoolAvailable.into())
        }

        fn do_empty_token_rewards(
            who: &T::AccountId,
            validator_id: ValidatorId,
            receiver: &T::AccountId,
        ) -> DispatchResult {
            let config = Validators::<T>::get(validator_id).ok_or(Error::<T>::ValidatorNotFound)?;
            ensure!(*who == config.owner, Error::<T>::Unauthorized);
            let token = config.reward_token.ok_or(Error::<T>::NoRewardToken)?;

            let treasury = PoolKey::new(validator_id, TREASURY_POOL);
            let held_back = ValidatorStates::<T>::get(validator_id).token_held_back;
            let treasury_account = Self::treasury_account(validator_id)?;
            let held = <T::Assets as fungibles::Inspect<T::AccountId>>::balance(token, &treasury_account)
                .saturated_into::<u128>();
            let amount = held.saturating_sub(held_back);
            ensure!(amount > 0, Error::<T>::NoTokensAvailable);

            T::Pools::pay_token_reward(&Self::registry_account(), treasury, receiver, token, amount)?;
            Self::deposit_event(Event::TokenRewardsEmptied { validator_id, receiver: receiver.clone(), amount });
            Ok(())
        }

        fn treasury_account(validator_id: ValidatorId) -> Result<T::AccountId, DispatchError> {
            <Self as ValidatorRegistryInterface<T::AccountId, T::AssetId>>::pool_account(validator_id, TREASURY_POOL)
        }

        fn ensure_pool_caller(caller: &T::AccountId, key: PoolKey) -> Result<usize, DispatchError> {
            let slot = key.slot().ok_or(Error::<T>::PoolNotFound)?;
            let pools = ValidatorPools::<T>::get(key.validator_id);
            let pool = pools.get(slot).ok_or(Error::<T>::PoolNotFound)?;
            ensure!(pool.account == *caller, Error::<T>::Unauthorized);
            Ok(slot)
        }
    }

    impl<T: Config> ValidatorRegistryInterface<T::AccountId, T::AssetId> for Pallet<T> {
        fn registry_account() -> T::AccountId {
            Self::registry_account()
        }

        fn validator_config(validator_id: ValidatorId) -> Result<ConfigOf<T>, DispatchError> {
            Validators::<T>::get(validator_id).ok_or_else(|| Error::<T>::ValidatorNotFound.into())
        }

        fn validator_state(validator_id: ValidatorId) -> Result<ValidatorState, DispatchError> {
            ensure!(Validators::<T>::contains_key(validator_id), Error::<T>::ValidatorNotFound);
            Ok(ValidatorStates::<T>::get(validator_id))
        }

        fn owner_and_manager(validator_id: ValidatorId) -> Result<(T::AccountId, T::AccountId), DispatchError> {
            let config = Validators::<T>::get(validator_id).ok_or(Error::<T>::ValidatorNotFound)?;
            Ok((config.owner, config.manager))
        }

        fn pool_account(validator_id: ValidatorId, pool_id: PoolIndex) -> Result<T::AccountId, DispatchError> {
            let slot = PoolKey::new(validator_id, pool_id).slot().ok_or(Error::<T>::PoolNotFound)?;
            ValidatorPools::<T>::get(validator_id)
                .get(slot)
                .map(|pool| pool.account.clone())
                .ok_or_else(|| Error::<T>::PoolNotFound.into())
        }

        /// Snapshot of each pool's share of validator stake. Taken at most once
        /// per epoch; later calls in the same round or epoch return the stored
        /// snapshot so every pool divides the same token reward.
        fn set_token_payout_ratio(caller: &T::AccountId, validator_id: ValidatorId) -> Result<TokenPayoutRatio, DispatchError> {
            let config = Validators::<T>::get(validator_id).ok_or(Error::<T>::ValidatorNotFound)?;
            ensure!(*caller == Self::treasury_account(validator_id)?, Error::<T>::Unauthorized);

            let now = Self::current_round();
            let stored = PayoutRatios::<T>::get(validator_id);
            let last = stored.updated_for_payout;
            if last != 0 {
                let epoch_length = config.epoch_length.max(1);
                if last == now || last - last % epoch_length == now - now % epoch_length {
                    return Ok(stored);
                }
            }

            let state = ValidatorStates::<T>::get(validator_id);
            let mut ratio = TokenPayoutRatio { updated_for_payout: now, ..Default::default() };
            if state.total_staked > 0 {
                for (idx, pool) in ValidatorPools::<T>::get(validator_id).iter().enumerate() {
                    let pct = wide_ratio(&[pool.total_staked, RATIO_DENOMINATOR], &[state.total_staked])?;
                    if let Some(slot) = ratio.pool_pct_of_whole.get_mut(idx) {
                        *slot = pct.saturated_into::<u64>();
                    }
                }
            }
            PayoutRatios::<T>::insert(validator_id, ratio.clone());

            Self::deposit_event(Event::PayoutRatioUpdated { validator_id, round: now });
            log::debug!(target: LOG_TARGET, "validator {} payout ratio refreshed at {}", validator_id, now);
            Ok(ratio)
        }

        fn stake_removed(
            caller: &T::AccountId,
            key: PoolKey,
            staker: &T::AccountId,
            amount_removed: Balance,
            reward_removed: Balance,
            staker_removed: bool,
        ) -> DispatchResult {
            let slot = Self::ensure_pool_caller(caller, key)?;
            ensure!(amount_removed > 0 || reward_removed > 0, Error::<T>::NothingToReport);

            let mut pools = ValidatorPools::<T>::get(key.validator_id);
            let mut state = ValidatorStates::<T>::get(key.validator_id);
            if let Some(pool) = pools.get_mut(slot) {
                pool.total_staked = pool.total_staked.saturating_sub(amount_removed);
                if staker_removed {
                    pool.total_stakers = pool.total_stakers.saturating_sub(1);
                }
            }
            state.total_staked = state.total_staked.saturating_sub(amount_removed);
            TotalStaked::<T>::mutate(|total| *total = total.saturating_sub(amount_removed));

            if reward_removed > 0 {
                state.token_held_back = state.token_held_back.saturating_sub(reward_removed);
                if !key.is_treasury() {
                    // only the treasury pool holds the token
                    let token = Validators::<T>::get(key.validator_id)
                        .and_then(|config| config.reward_token)
                        .ok_or(Error::<T>::NoRewardToken)?;
                    T::Pools::pay_token_reward(&Self::registry_account(), key.treasury(), staker, token, reward_removed)?;
                }
            }

            if staker_removed {
                state.total_stakers = state.total_stakers.saturating_sub(1);
                let now_empty = StakerPools::<T>::mutate(staker, |keys| {
                    keys.retain(|k| *k != key);
                    keys.is_empty()
                });
                if now_empty {
                    StakerPools::<T>::remove(staker);
                    NumStakers::<T>::mutate(|n| *n = n.saturating_sub(1));
                }
            }

            ValidatorPools::<T>::insert(key.validator_id, pools);
            ValidatorStates::<T>::insert(key.validator_id, state);
            Self::deposit_event(Event::StakeRemoved {
                key,
                staker: staker.clone(),
                amount: amount_removed,
                reward_removed,
                staker_removed,
            });
            Ok(())
        }

        fn stake_updated_via_rewards(caller: &T::AccountId, key: PoolKey, report: &EpochReport) -> DispatchResult {
            let slot = Self::ensure_pool_caller(caller, key)?;

            ValidatorPools::<T>::mutate(key.validator_id, |pools| {
                if let Some(pool) = pools.get_mut(slot) {
                    pool.total_staked = pool.total_staked.saturating_add(report.increased_stake);
                }
            });
            ValidatorStates::<T>::mutate(key.validator_id, |state| {
                state.total_staked = state.total_staked.saturating_add(report.increased_stake);
                state.token_held_back = state.token_held_back.saturating_add(report.token_paid_out);
            });
            TotalStaked::<T>::mutate(|total| *total = total.saturating_add(report.increased_stake));

            Self::deposit_event(Event::RewardsCompounded {
                key,
                increased_stake: report.increased_stake,
                token_paid_out: report.token_paid_out,
                commission_paid_out: report.commission_paid_out,
                burned_to_sink: report.burned_to_sink,
            });
            Ok(())
        }
    }
}
