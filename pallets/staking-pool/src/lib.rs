//! # Staking Pool Pallet
//!
//! Capacity-bounded staking pools run on behalf of validators.
//!
//! One pallet instance hosts every pool, keyed by [`PoolKey`]. Each pool owns
//! a fixed-size staker ledger, a rate estimation bin and an account holding
//! the staked funds. Rewards land in that account as surplus over the tracked
//! stake and are credited to stakers once per epoch.
//!
//! ## How it works:
//! 1. The registry creates a pool, someone calls `init_storage` to allocate
//!    its ledger and fund the account reserve
//! 2. Stake is moved into the pool account by the registry, which then calls
//!    `add_stake` through [`StakingPoolInterface`]
//! 3. Anyone may call `epoch_balance_update` once per epoch window. Commission
//!    (or the saturation burn) is paid out and the rest is compounded into
//!    staker balances
//! 4. Stakers leave with `remove_stake` and collect the secondary reward token
//!    with `claim_tokens`. The token only ever leaves from the validator's
//!    treasury pool (pool 1)
//!
//! Every call runs inside its own storage layer: a failure at any step,
//! including a failing registry notification, leaves no trace.

#![cfg_attr(not(feature = "std"), no_std)]

pub use pallet::*;

pub mod distribution;
pub mod ledger;
pub mod rate;

#[cfg(test)]
mod mock;

use codec::{Decode, Encode, MaxEncodedLen};
use frame_support::{traits::Get, PalletId};
use scale_info::TypeInfo;
use sp_runtime::{
    traits::{AccountIdConversion, Convert},
    RuntimeDebug,
};
use sp_std::marker::PhantomData;
use stakepool_primitives::{Balance, PoolKey, Round};

pub const LOG_TARGET: &str = "runtime::staking-pool";

/// Per-pool bookkeeping that lives beside the ledger.
#[derive(Encode, Decode, Clone, Default, PartialEq, Eq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
pub struct PoolState {
    pub min_entry_stake: Balance,
    /// Always equal to the sum of ledger balances.
    pub total_staked: Balance,
    pub staker_count: u32,
    /// Round of the last epoch update (pool creation before the first one).
    pub last_payout: Round,
    pub epoch_number: u64,
}

/// Derives pool accounts as sub-accounts of a pallet id.
pub struct PoolSubAccount<P, AccountId>(PhantomData<(P, AccountId)>);

impl<P, AccountId> Convert<PoolKey, AccountId> for PoolSubAccount<P, AccountId>
where
    P: Get<PalletId>,
    AccountId: Encode + Decode,
{
    fn convert(key: PoolKey) -> AccountId {
        P::get().into_sub_account_truncating(key)
    }
}

#[frame_support::pallet]
pub mod pallet {
    use super::*;
    use crate::{
        distribution::{distribute, manager_top_off, split_reward, EpochInputs, Saturation},
        ledger::{empty_slots, LedgerError, StakerLedger, StakerRecord},
        rate::{rounds_per_day, RateBin},
    };
    use frame_support::{
        pallet_prelude::*,
        storage::with_storage_layer,
        traits::{
            fungibles,
            tokens::Preservation,
            Currency, ExistenceRequirement,
        },
    };
    use frame_system::pallet_prelude::*;
    use sp_runtime::traits::{SaturatedConversion, Saturating, Zero};
    use stakepool_primitives::{
        saturation_level, wide_ratio, BudgetMeter, EpochReport, StakingPoolInterface, TokenPayoutRatio,
        ValidatorRegistryInterface, CLOCK_SAMPLES, RATIO_DENOMINATOR, TREASURY_POOL,
    };

    pub type BalanceOf<T> =
        <<T as Config>::Currency as Currency<<T as frame_system::Config>::AccountId>>::Balance;

    pub type LedgerOf<T> =
        BoundedVec<StakerRecord<<T as frame_system::Config>::AccountId>, <T as Config>::MaxStakersPerPool>;

    #[pallet::config]
    pub trait Config: frame_system::Config + pallet_timestamp::Config {
        type RuntimeEvent: From<Event<Self>> + IsType<<Self as frame_system::Config>::RuntimeEvent>;

        /// Primary staking currency.
        type Currency: Currency<Self::AccountId>;

        type AssetId: Parameter + Copy + MaxEncodedLen;

        /// Secondary reward tokens.
        type Assets: fungibles::Inspect<Self::AccountId, AssetId = Self::AssetId> + fungibles::Mutate<Self::AccountId>;

        type Registry: ValidatorRegistryInterface<Self::AccountId, Self::AssetId>;

        /// Account holding a pool's funds.
        type PoolAccount: Convert<PoolKey, Self::AccountId>;

        /// Total online stake of the consensus layer.
        type OnlineStake: Get<Balance>;

        /// Receives the reward burned from saturated validators.
        type FeeSink: Get<Self::AccountId>;

        /// Budget checkpoint hook for ledger scans.
        type Meter: BudgetMeter + Default;

        #[pallet::constant]
        type PalletId: Get<PalletId>;

        /// Ledger capacity of every pool.
        #[pallet::constant]
        type MaxStakersPerPool: Get<u32>;

        /// Rounds new stake is forward dated by before it counts.
        #[pallet::constant]
        type StakingDelay: Get<u64>;

        /// Bin length used while the clock estimate is unavailable.
        #[pallet::constant]
        type DefaultRoundsPerDay: Get<u64>;

        /// Smallest primary surplus worth distributing when there is no token
        /// reward.
        #[pallet::constant]
        type MinimumPayout: Get<Balance>;

        /// Spendable balance the manager account is kept topped up to.
        #[pallet::constant]
        type ManagerTopOff: Get<Balance>;
    }

    #[pallet::pallet]
    pub struct Pallet<T>(_);

    #[pallet::storage]
    #[pallet::getter(fn pools)]
    pub type Pools<T: Config> = StorageMap<_, Blake2_128Concat, PoolKey, PoolState, OptionQuery>;

    /// Staker slots, present once `init_storage` has run.
    #[pallet::storage]
    pub type Ledgers<T: Config> = StorageMap<_, Blake2_128Concat, PoolKey, LedgerOf<T>, OptionQuery>;

    #[pallet::storage]
    #[pallet::getter(fn rate_bins)]
    pub type RateBins<T: Config> = StorageMap<_, Blake2_128Concat, PoolKey, RateBin, OptionQuery>;

    /// Timestamps (ms) of the most recent blocks, oldest first.
    #[pallet::storage]
    pub type ClockSamples<T: Config> = StorageValue<_, BoundedVec<u64, ConstU32<CLOCK_SAMPLES>>, ValueQuery>;

    #[pallet::event]
    #[pallet::generate_deposit(pub(super) fn deposit_event)]
    pub enum Event<T: Config> {
        PoolCreated { key: PoolKey, account: T::AccountId },
        LedgerInitialized { key: PoolKey },
        StakeAdded { key: PoolKey, staker: T::AccountId, amount: Balance, entry_round: Round },
        StakeRemoved {
            key: PoolKey,
            staker: T::AccountId,
            amount: Balance,
            token_removed: Balance,
            staker_removed: bool,
        },
        TokensClaimed { key: PoolKey, staker: T::AccountId, amount: Balance },
        TokenRewardPaid { key: PoolKey, receiver: T::AccountId, amount: Balance },
        EpochDistributed {
            key: PoolKey,
            epoch: u64,
            increased_stake: Balance,
            token_paid_out: Balance,
            commission_paid_out: Balance,
            burned_to_sink: Balance,
        },
        /// Nothing worth paying this epoch; the epoch still counts.
        EpochSkipped { key: PoolKey, epoch: u64 },
        ManagerToppedUp { key: PoolKey, manager: T::AccountId, amount: Balance },
        RateBinRolled { key: PoolKey, apr: Option<u128>, moving_average: u128 },
    }

    #[pallet::error]
    pub enum Error<T> {
        /// Caller fails the identity or role check
        Unauthorized,
        /// No empty ledger slot left
        PoolFull,
        /// Stake below the pool minimum
        BelowMinimum,
        /// Withdrawal exceeds the recorded balance
        InsufficientBalance,
        /// Account has no slot in this pool
        NotFound,
        AlreadyInitialized,
        NotInitialized,
        /// Epoch window already paid out
        EpochAlreadyPaid,
        /// Token ratio relay called by a non-sibling or by the treasury pool
        InvalidCallerContext,
        PoolNotFound,
        PoolAlreadyExists,
        /// Pool index outside 1..=24
        InvalidPoolId,
        NotTreasuryPool,
        NoRewardToken,
        /// Pool account does not hold the stake being credited
        StakeNotFunded,
    }

    #[pallet::hooks]
    impl<T: Config> Hooks<BlockNumberFor<T>> for Pallet<T> {
        fn on_initialize(_n: BlockNumberFor<T>) -> Weight {
            // accounts for the clock sample written in on_finalize
            T::DbWeight::get().reads_writes(1, 1)
        }

        fn on_finalize(_n: BlockNumberFor<T>) {
            let now_ms: u64 = pallet_timestamp::Pallet::<T>::get().saturated_into::<u64>();
            Self::record_clock_sample(now_ms);
        }
    }

    #[pallet::call]
    impl<T: Config> Pallet<T> {
        /// Allocate the ledger of a created pool. The caller covers whatever the
        /// pool account is missing of the existential deposit.
        #[pallet::call_index(0)]
        #[pallet::weight(Weight::from_parts(50_000_000, 0))]
        pub fn init_storage(origin: OriginFor<T>, key: PoolKey) -> DispatchResult {
            let who = ensure_signed(origin)?;
            with_storage_layer(|| Self::do_init_storage(&who, key))
        }

        /// Remove `amount` of `staker`'s stake (0 = everything), paying any
        /// pending reward tokens along with it.
        ///
        /// Callable by the staker, or by the validator's owner or manager.
        #[pallet::call_index(1)]
        #[pallet::weight(Weight::from_parts(100_000_000, 0))]
        pub fn remove_stake(
            origin: OriginFor<T>,
            key: PoolKey,
            staker: T::AccountId,
            amount: Balance,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;
            with_storage_layer(|| Self::do_remove_stake(&who, key, &staker, amount))
        }

        /// Collect the caller's pending reward tokens. No-op when there are none.
        #[pallet::call_index(2)]
        #[pallet::weight(Weight::from_parts(60_000_000, 0))]
        pub fn claim_tokens(origin: OriginFor<T>, key: PoolKey) -> DispatchResult {
            let who = ensure_signed(origin)?;
            with_storage_layer(|| Self::do_claim_tokens(&who, key))
        }

        /// Distribute the pool's reward surplus for the current epoch. Anyone
        /// may call this.
        #[pallet::call_index(3)]
        #[pallet::weight(Weight::from_parts(250_000_000, 0))]
        pub fn epoch_balance_update(origin: OriginFor<T>, key: PoolKey) -> DispatchResult {
            ensure_signed(origin)?;
            with_storage_layer(|| Self::do_epoch_balance_update(key))
        }
    }

    impl<T: Config> Pallet<T> {
        pub fn pool_account(key: PoolKey) -> T::AccountId {
            T::PoolAccount::convert(key)
        }

        pub fn current_round() -> Round {
            frame_system::Pallet::<T>::block_number().saturated_into::<u64>()
        }

        /// Ledger entry of `who` in `key`.
        pub fn staker_info(key: PoolKey, who: &T::AccountId) -> Result<StakerRecord<T::AccountId>, DispatchError> {
            let mut pool = Pools::<T>::get(key).ok_or(Error::<T>::PoolNotFound)?;
            let mut slots = Ledgers::<T>::get(key).ok_or(Error::<T>::NotInitialized)?;
            let ledger = StakerLedger::new(&mut slots, &mut pool);
            let idx = ledger.position(who, &mut T::Meter::default()).map_err(Self::ledger_error)?;
            ledger.get(idx).cloned().ok_or_else(|| Error::<T>::NotFound.into())
        }

        /// Rounds per day estimated from recent block times.
        pub fn rounds_per_day() -> u64 {
            rounds_per_day(&ClockSamples::<T>::get(), T::DefaultRoundsPerDay::get())
        }

        /// Relays a sibling pool's token ratio refresh through the treasury pool.
        ///
        /// `caller` must be the registered account of `claimed`, a non-treasury
        /// pool of the same validator as `treasury`.
        pub fn proxied_set_token_payout_ratio(
            caller: &T::AccountId,
            treasury: PoolKey,
            claimed: PoolKey,
        ) -> Result<TokenPayoutRatio, DispatchError> {
            ensure!(treasury.is_treasury(), Error::<T>::NotTreasuryPool);
            ensure!(
                claimed.validator_id == treasury.validator_id && !claimed.is_treasury(),
                Error::<T>::InvalidCallerContext
            );
            let registered = T::Registry::pool_account(claimed.validator_id, claimed.pool_id)?;
            ensure!(registered == *caller, Error::<T>::Unauthorized);

            T::Registry::set_token_payout_ratio(&Self::pool_account(treasury), treasury.validator_id)
        }

        fn do_init_storage(who: &T::AccountId, key: PoolKey) -> DispatchResult {
            ensure!(Pools::<T>::contains_key(key), Error::<T>::PoolNotFound);
            ensure!(!Ledgers::<T>::contains_key(key), Error::<T>::AlreadyInitialized);

            let account = Self::pool_account(key);
            let reserve = T::Currency::minimum_balance();
            let missing = reserve.saturating_sub(T::Currency::free_balance(&account));
            if !missing.is_zero() {
                T::Currency::transfer(who, &account, missing, ExistenceRequirement::KeepAlive)?;
            }

            Ledgers::<T>::insert(key, empty_slots::<T::AccountId, T::MaxStakersPerPool>());
            Self::deposit_event(Event::LedgerInitialized { key });
            log::info!(
                target: LOG_TARGET,
                "ledger for pool {}/{} initialized with {} slots",
                key.validator_id,
                key.pool_id,
                T::MaxStakersPerPool::get(),
            );
            Ok(())
        }

        fn do_add_stake(
            caller: &T::AccountId,
            key: PoolKey,
            staker: &T::AccountId,
            amount: Balance,
        ) -> Result<Round, DispatchError> {
            ensure!(*caller == T::Registry::registry_account(), Error::<T>::Unauthorized);
            let mut pool = Pools::<T>::get(key).ok_or(Error::<T>::PoolNotFound)?;
            let mut slots = Ledgers::<T>::get(key).ok_or(Error::<T>::NotInitialized)?;
            let mut bin = RateBins::<T>::get(key).ok_or(Error::<T>::PoolNotFound)?;

            let now = Self::current_round();
            Self::roll_bin(key, &mut bin, now, pool.total_staked);

            let held = Self::spendable(&Self::pool_account(key));
            ensure!(held >= pool.total_staked.saturating_add(amount), Error::<T>::StakeNotFunded);

            let entry_round = now.saturating_add(T::StakingDelay::get());
            let mut ledger = StakerLedger::new(&mut slots, &mut pool);
            let lookup = ledger.find(staker, &mut T::Meter::default());
            match lookup.found {
                Some(idx) => ledger.add_to_existing(idx, amount, entry_round),
                None => ledger.insert(lookup.first_empty, staker.clone(), amount, entry_round).map(|_| ()),
            }
            .map_err(Self::ledger_error)?;
            bin.accrue_stake_added(amount, now);

            Pools::<T>::insert(key, pool);
            Ledgers::<T>::insert(key, slots);
            RateBins::<T>::insert(key, bin);

            Self::deposit_event(Event::StakeAdded { key, staker: staker.clone(), amount, entry_round });
            Ok(entry_round)
        }

        fn do_remove_stake(
            caller: &T::AccountId,
            key: PoolKey,
            staker: &T::AccountId,
            amount: Balance,
        ) -> DispatchResult {
            if caller != staker {
                let (owner, manager) = T::Registry::owner_and_manager(key.validator_id)?;
                ensure!(*caller == owner || *caller == manager, Error::<T>::Unauthorized);
            }

            let mut pool = Pools::<T>::get(key).ok_or(Error::<T>::PoolNotFound)?;
            let mut slots = Ledgers::<T>::get(key).ok_or(Error::<T>::NotInitialized)?;
            let mut bin = RateBins::<T>::get(key).ok_or(Error::<T>::PoolNotFound)?;

            let now = Self::current_round();
            Self::roll_bin(key, &mut bin, now, pool.total_staked);

            let mut ledger = StakerLedger::new(&mut slots, &mut pool);
            let idx = ledger.position(staker, &mut T::Meter::default()).map_err(Self::ledger_error)?;
            let balance = ledger.get(idx).map(|r| r.balance).ok_or(Error::<T>::NotFound)?;
            let amount = if amount == 0 { balance } else { amount };
            ensure!(amount <= balance, Error::<T>::InsufficientBalance);

            // pending tokens always leave in full together with any stake
            let token_removed = ledger.claim_secondary_reward(idx).map_err(Self::ledger_error)?;
            let staker_removed = ledger.withdraw(idx, amount).map_err(Self::ledger_error)?;
            bin.accrue_stake_removed(amount, now);

            Pools::<T>::insert(key, pool);
            Ledgers::<T>::insert(key, slots);
            RateBins::<T>::insert(key, bin);

            let pool_account = Self::pool_account(key);
            if token_removed > 0 && key.is_treasury() {
                Self::pay_tokens_from_treasury(key, staker, token_removed)?;
            }
            T::Currency::transfer(&pool_account, staker, amount.saturated_into(), ExistenceRequirement::KeepAlive)?;
            T::Registry::stake_removed(&pool_account, key, staker, amount, token_removed, staker_removed)?;

            Self::deposit_event(Event::StakeRemoved {
                key,
                staker: staker.clone(),
                amount,
                token_removed,
                staker_removed,
            });
            Ok(())
        }

        fn do_claim_tokens(staker: &T::AccountId, key: PoolKey) -> DispatchResult {
            let mut pool = Pools::<T>::get(key).ok_or(Error::<T>::PoolNotFound)?;
            let mut slots = Ledgers::<T>::get(key).ok_or(Error::<T>::NotInitialized)?;

            let mut ledger = StakerLedger::new(&mut slots, &mut pool);
            let idx = ledger.position(staker, &mut T::Meter::default()).map_err(Self::ledger_error)?;
            let owed = ledger.claim_secondary_reward(idx).map_err(Self::ledger_error)?;
            if owed == 0 {
                return Ok(());
            }
            let staker_removed = ledger.get(idx).map_or(true, |r| r.is_empty());

            Pools::<T>::insert(key, pool);
            Ledgers::<T>::insert(key, slots);

            if key.is_treasury() {
                Self::pay_tokens_from_treasury(key, staker, owed)?;
            }
            T::Registry::stake_removed(&Self::pool_account(key), key, staker, 0, owed, staker_removed)?;

            Self::deposit_event(Event::TokensClaimed { key, staker: staker.clone(), amount: owed });
            Ok(())
        }

        fn do_epoch_balance_update(key: PoolKey) -> DispatchResult {
            let mut pool = Pools::<T>::get(key).ok_or(Error::<T>::PoolNotFound)?;
            let mut slots = Ledgers::<T>::get(key).ok_or(Error::<T>::NotInitialized)?;
            let mut bin = RateBins::<T>::get(key).ok_or(Error::<T>::PoolNotFound)?;
            let config = T::Registry::validator_config(key.validator_id)?;

            let now = Self::current_round();
            let epoch_length = config.epoch_length.max(1);
            let epoch_begin = now - now % epoch_length;
            let last_paid_epoch = pool.last_payout - pool.last_payout % epoch_length;
            ensure!(epoch_begin > last_paid_epoch, Error::<T>::EpochAlreadyPaid);

            Self::roll_bin(key, &mut bin, now, pool.total_staked);
            pool.last_payout = now;
            pool.epoch_number = pool.epoch_number.saturating_add(1);
            let epoch = pool.epoch_number;

            let pool_account = Self::pool_account(key);
            let payout_ratio = match config.reward_token {
                Some(_) if key.is_treasury() => {
                    Some(T::Registry::set_token_payout_ratio(&pool_account, key.validator_id)?)
                }
                Some(_) => Some(Self::proxied_set_token_payout_ratio(&pool_account, key.treasury(), key)?),
                None => None,
            };
            let state = T::Registry::validator_state(key.validator_id)?;

            let reward = Self::spendable(&pool_account).saturating_sub(pool.total_staked);
            let mut token_reward = 0;
            if let (Some(token), Some(ratio)) = (config.reward_token, payout_ratio) {
                let treasury_account = T::Registry::pool_account(key.validator_id, TREASURY_POOL)?;
                let available = <T::Assets as fungibles::Inspect<T::AccountId>>::balance(token, &treasury_account)
                    .saturated_into::<u128>()
                    .saturating_sub(state.token_held_back);
                if available >= config.reward_per_payout {
                    token_reward = wide_ratio(
                        &[config.reward_per_payout, ratio.pct_for(&key) as u128],
                        &[RATIO_DENOMINATOR],
                    )?;
                }
            }

            if token_reward == 0 && reward < T::MinimumPayout::get() {
                Pools::<T>::insert(key, pool);
                RateBins::<T>::insert(key, bin);
                Self::deposit_event(Event::EpochSkipped { key, epoch });
                log::debug!(
                    target: LOG_TARGET,
                    "pool {}/{} epoch {}: surplus {} below payout minimum",
                    key.validator_id,
                    key.pool_id,
                    epoch,
                    reward,
                );
                return Ok(());
            }

            let saturation = Saturation {
                level: saturation_level(T::OnlineStake::get()),
                validator_stake: state.total_staked,
            };
            let split = split_reward(reward, config.commission, saturation)?;

            if split.burned > 0 {
                T::Currency::transfer(
                    &pool_account,
                    &T::FeeSink::get(),
                    split.burned.saturated_into(),
                    ExistenceRequirement::KeepAlive,
                )?;
            }
            if split.commission > 0 {
                let top_off = manager_top_off(
                    split.commission,
                    Self::spendable(&config.manager),
                    T::ManagerTopOff::get(),
                    config.manager == config.commission_address,
                );
                if top_off > 0 {
                    T::Currency::transfer(
                        &pool_account,
                        &config.manager,
                        top_off.saturated_into(),
                        ExistenceRequirement::KeepAlive,
                    )?;
                    Self::deposit_event(Event::ManagerToppedUp {
                        key,
                        manager: config.manager.clone(),
                        amount: top_off,
                    });
                }
                let remainder = split.commission - top_off;
                if remainder > 0 {
                    T::Currency::transfer(
                        &pool_account,
                        &config.commission_address,
                        remainder.saturated_into(),
                        ExistenceRequirement::KeepAlive,
                    )?;
                }
            }

            let inputs = EpochInputs { epoch_begin, epoch_length, reward: split.to_stakers, token_reward };
            let mut ledger = StakerLedger::new(&mut slots, &mut pool);
            let outcome = distribute(&mut ledger, &inputs, &mut T::Meter::default()).map_err(Self::ledger_error)?;
            bin.accrue_reward(outcome.increased_stake, now);

            Pools::<T>::insert(key, pool);
            Ledgers::<T>::insert(key, slots);
            RateBins::<T>::insert(key, bin);

            let report = EpochReport {
                increased_stake: outcome.increased_stake,
                token_paid_out: outcome.token_paid_out,
                commission_paid_out: split.commission,
                burned_to_sink: split.burned,
            };
            T::Registry::stake_updated_via_rewards(&pool_account, key, &report)?;

            Self::deposit_event(Event::EpochDistributed {
                key,
                epoch,
                increased_stake: report.increased_stake,
                token_paid_out: report.token_paid_out,
                commission_paid_out: report.commission_paid_out,
                burned_to_sink: report.burned_to_sink,
            });
            log::info!(
                target: LOG_TARGET,
                "pool {}/{} epoch {}: +{} stake, {} tokens, {} commission, {} burned",
                key.validator_id,
                key.pool_id,
                epoch,
                report.increased_stake,
                report.token_paid_out,
                report.commission_paid_out,
                report.burned_to_sink,
            );
            Ok(())
        }

        fn pay_tokens_from_treasury(key: PoolKey, receiver: &T::AccountId, amount: Balance) -> DispatchResult {
            let config = T::Registry::validator_config(key.validator_id)?;
            let token = config.reward_token.ok_or(Error::<T>::NoRewardToken)?;
            <T::Assets as fungibles::Mutate<T::AccountId>>::transfer(
                token,
                &Self::pool_account(key),
                receiver,
                amount.saturated_into(),
                Preservation::Expendable,
            )?;
            Ok(())
        }

        fn roll_bin(key: PoolKey, bin: &mut RateBin, now: Round, total_staked: Balance) {
            if !bin.is_closed(now) {
                return;
            }
            if let Some(rolled) = bin.roll_if_closed(now, total_staked, Self::rounds_per_day()) {
                Self::deposit_event(Event::RateBinRolled {
                    key,
                    apr: rolled.apr,
                    moving_average: rolled.moving_average,
                });
            }
        }

        /// Free balance above the existential deposit.
        fn spendable(who: &T::AccountId) -> Balance {
            let free: u128 = T::Currency::free_balance(who).saturated_into();
            let reserve: u128 = T::Currency::minimum_balance().saturated_into();
            free.saturating_sub(reserve)
        }

        fn record_clock_sample(now_ms: u64) {
            ClockSamples::<T>::mutate(|samples| {
                if samples.is_full() {
                    samples.remove(0);
                }
                samples.force_push(now_ms);
            });
        }

        fn ledger_error(err: LedgerError) -> DispatchError {
            match err {
                LedgerError::PoolFull => Error::<T>::PoolFull.into(),
                LedgerError::BelowMinimum => Error::<T>::BelowMinimum.into(),
                LedgerError::InsufficientBalance => Error::<T>::InsufficientBalance.into(),
                LedgerError::NotFound => Error::<T>::NotFound.into(),
                LedgerError::Arithmetic(err) => err.into(),
            }
        }
    }

    impl<T: Config> StakingPoolInterface<T::AccountId, T::AssetId> for Pallet<T> {
        fn create_pool(key: PoolKey, min_entry_stake: Balance) -> Result<T::AccountId, DispatchError> {
            ensure!(key.slot().is_some(), Error::<T>::InvalidPoolId);
            ensure!(!Pools::<T>::contains_key(key), Error::<T>::PoolAlreadyExists);

            let now = Self::current_round();
            Pools::<T>::insert(key, PoolState { min_entry_stake, last_payout: now, ..Default::default() });
            RateBins::<T>::insert(key, RateBin::new(now, Self::rounds_per_day()));

            let account = Self::pool_account(key);
            Self::deposit_event(Event::PoolCreated { key, account: account.clone() });
            log::info!(
                target: LOG_TARGET,
                "created pool {}/{} (min entry {})",
                key.validator_id,
                key.pool_id,
                min_entry_stake,
            );
            Ok(account)
        }

        fn pool_account(key: PoolKey) -> T::AccountId {
            Self::pool_account(key)
        }

        fn add_stake(
            caller: &T::AccountId,
            key: PoolKey,
            staker: &T::AccountId,
            amount: Balance,
        ) -> Result<Round, DispatchError> {
            with_storage_layer(|| Self::do_add_stake(caller, key, staker, amount))
        }

        fn pool_totals(key: PoolKey) -> Result<(u32, Balance), DispatchError> {
            let pool = Pools::<T>::get(key).ok_or(Error::<T>::PoolNotFound)?;
            Ok((pool.staker_count, pool.total_staked))
        }

        fn pay_token_reward(
            caller: &T::AccountId,
            key: PoolKey,
            receiver: &T::AccountId,
            token: T::AssetId,
            amount: Balance,
        ) -> DispatchResult {
            ensure!(*caller == T::Registry::registry_account(), Error::<T>::Unauthorized);
            ensure!(key.is_treasury(), Error::<T>::NotTreasuryPool);
            ensure!(Pools::<T>::contains_key(key), Error::<T>::PoolNotFound);
            let config = T::Registry::validator_config(key.validator_id)?;
            ensure!(config.reward_token == Some(token), Error::<T>::NoRewardToken);

            <T::Assets as fungibles::Mutate<T::AccountId>>::transfer(
                token,
                &Self::pool_account(key),
                receiver,
                amount.saturated_into(),
                Preservation::Expendable,
            )?;
            Self::deposit_event(Event::TokenRewardPaid { key, receiver: receiver.clone(), amount });
            Ok(())
        }
    }
}
