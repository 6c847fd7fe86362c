use crate as pallet_staking_pool;
use frame_support::{
    derive_impl, parameter_types,
    traits::{
        fungibles::{self, Mutate as _},
        AsEnsureOriginWithArg, ConstU128, ConstU32, ConstU64, Currency, ExistenceRequirement,
    },
    PalletId,
};
use frame_system::{EnsureRoot, EnsureSigned};
use sp_runtime::{
    traits::{Convert, IdentityLookup},
    BuildStorage, DispatchError, DispatchResult,
};
use stakepool_primitives::{
    Balance, EpochReport, PoolIndex, PoolKey, StakingPoolInterface, TokenPayoutRatio, ValidatorConfig, ValidatorId,
    ValidatorRegistryInterface, ValidatorState,
};
use std::cell::RefCell;

type Block = frame_system::mocking::MockBlock<Test>;

pub type AccountId = u64;
pub type AssetId = u32;

pub const REGISTRY: AccountId = 999;
pub const OWNER: AccountId = 10;
pub const MANAGER: AccountId = 11;
pub const COMMISSION: AccountId = 12;
pub const FEE_SINK: AccountId = 13;
pub const TOKEN: AssetId = 7;

pub const VALIDATOR: ValidatorId = 1;
pub const EPOCH: u64 = 100;
pub const MIN_STAKE: Balance = 1_000_000;

frame_support::construct_runtime!(
    pub enum Test {
        System: frame_system,
        Timestamp: pallet_timestamp,
        Balances: pallet_balances,
        Assets: pallet_assets,
        StakingPool: pallet_staking_pool,
    }
);

#[derive_impl(frame_system::config_preludes::TestDefaultConfig)]
impl frame_system::Config for Test {
    type Block = Block;
    type AccountId = AccountId;
    type Lookup = IdentityLookup<Self::AccountId>;
    type AccountData = pallet_balances::AccountData<Balance>;
}

impl pallet_timestamp::Config for Test {
    type Moment = u64;
    type OnTimestampSet = ();
    type MinimumPeriod = ConstU64<1>;
    type WeightInfo = ();
}

#[derive_impl(pallet_balances::config_preludes::TestDefaultConfig)]
impl pallet_balances::Config for Test {
    type Balance = Balance;
    type ExistentialDeposit = ConstU128<1>;
    type AccountStore = System;
}

#[derive_impl(pallet_assets::config_preludes::TestDefaultConfig)]
impl pallet_assets::Config for Test {
    type Currency = Balances;
    type CreateOrigin = AsEnsureOriginWithArg<EnsureSigned<AccountId>>;
    type ForceOrigin = EnsureRoot<AccountId>;
    type Freezer = ();
    type AssetDeposit = ConstU128<1>;
    type AssetAccountDeposit = ConstU128<10>;
    type MetadataDepositBase = ConstU128<1>;
    type MetadataDepositPerByte = ConstU128<1>;
    type ApprovalDeposit = ConstU128<1>;
}

/// Pool accounts `1000 + validator * 100 + pool`.
pub struct TestPoolAccount;

impl Convert<PoolKey, AccountId> for TestPoolAccount {
    fn convert(key: PoolKey) -> AccountId {
        1_000 + key.validator_id * 100 + key.pool_id
    }
}

parameter_types! {
    pub const StakingPoolPalletId: PalletId = PalletId(*b"py/stkpl");
    pub const FeeSinkAccount: AccountId = FEE_SINK;
    pub static OnlineStake: Balance = 1_000_000_000_000_000;
}

impl pallet_staking_pool::Config for Test {
    type RuntimeEvent = RuntimeEvent;
    type Currency = Balances;
    type AssetId = AssetId;
    type Assets = Assets;
    type Registry = MockRegistry;
    type PoolAccount = TestPoolAccount;
    type OnlineStake = OnlineStake;
    type FeeSink = FeeSinkAccount;
    type Meter = ();
    type PalletId = StakingPoolPalletId;
    type MaxStakersPerPool = ConstU32<4>;
    type StakingDelay = ConstU64<10>;
    type DefaultRoundsPerDay = ConstU64<1_000>;
    type MinimumPayout = ConstU128<10_000>;
    type ManagerTopOff = ConstU128<2_100_000>;
}

/// Calls the pool pallet made into the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    StakeRemoved { key: PoolKey, staker: AccountId, amount: Balance, reward: Balance, removed: bool },
    Rewards { key: PoolKey, report: EpochReport },
    RatioRefreshed { validator: ValidatorId },
}

thread_local! {
    static CONFIG: RefCell<ValidatorConfig<AccountId, AssetId>> = RefCell::new(default_config());
    static STATE: RefCell<ValidatorState> = RefCell::new(ValidatorState::default());
    static RATIO: RefCell<TokenPayoutRatio> = RefCell::new(TokenPayoutRatio::default());
    static NOTIFICATIONS: RefCell<Vec<Notification>> = RefCell::new(Vec::new());
    static REJECT_REPORTS: RefCell<bool> = RefCell::new(false);
}

pub fn default_config() -> ValidatorConfig<AccountId, AssetId> {
    ValidatorConfig {
        owner: OWNER,
        manager: MANAGER,
        commission_address: COMMISSION,
        commission: 50_000,
        epoch_length: EPOCH,
        reward_token: None,
        reward_per_payout: 0,
        min_entry_stake: MIN_STAKE,
        max_stake_per_pool: 0,
        sunsetting_on: 0,
        sunsetting_to: 0,
    }
}

pub fn set_config(f: impl FnOnce(&mut ValidatorConfig<AccountId, AssetId>)) {
    CONFIG.with(|c| f(&mut c.borrow_mut()));
}

pub fn set_state(f: impl FnOnce(&mut ValidatorState)) {
    STATE.with(|s| f(&mut s.borrow_mut()));
}

pub fn validator_state() -> ValidatorState {
    STATE.with(|s| s.borrow().clone())
}

pub fn set_pool_pct(pool_id: PoolIndex, pct: u64) {
    RATIO.with(|r| r.borrow_mut().pool_pct_of_whole[pool_id as usize - 1] = pct);
}

/// Makes the registry refuse epoch reports.
pub fn reject_reports(reject: bool) {
    REJECT_REPORTS.with(|r| *r.borrow_mut() = reject);
}

pub fn notifications() -> Vec<Notification> {
    NOTIFICATIONS.with(|n| n.borrow().clone())
}

fn notify(notification: Notification) {
    NOTIFICATIONS.with(|n| n.borrow_mut().push(notification));
}

/// Stand-in registry for a single validator.
pub struct MockRegistry;

impl ValidatorRegistryInterface<AccountId, AssetId> for MockRegistry {
    fn registry_account() -> AccountId {
        REGISTRY
    }

    fn validator_config(validator_id: ValidatorId) -> Result<ValidatorConfig<AccountId, AssetId>, DispatchError> {
        if validator_id != VALIDATOR {
            return Err(DispatchError::Other("unknown validator"));
        }
        Ok(CONFIG.with(|c| c.borrow().clone()))
    }

    fn validator_state(validator_id: ValidatorId) -> Result<ValidatorState, DispatchError> {
        if validator_id != VALIDATOR {
            return Err(DispatchError::Other("unknown validator"));
        }
        Ok(validator_state())
    }

    fn owner_and_manager(validator_id: ValidatorId) -> Result<(AccountId, AccountId), DispatchError> {
        let config = Self::validator_config(validator_id)?;
        Ok((config.owner, config.manager))
    }

    fn pool_account(validator_id: ValidatorId, pool_id: PoolIndex) -> Result<AccountId, DispatchError> {
        if validator_id != VALIDATOR || PoolKey::new(validator_id, pool_id).slot().is_none() {
            return Err(DispatchError::Other("unknown pool"));
        }
        Ok(TestPoolAccount::convert(PoolKey::new(validator_id, pool_id)))
    }

    fn set_token_payout_ratio(caller: &AccountId, validator_id: ValidatorId) -> Result<TokenPayoutRatio, DispatchError> {
        if *caller != Self::pool_account(validator_id, 1)? {
            return Err(DispatchError::Other("not the treasury pool"));
        }
        notify(Notification::RatioRefreshed { validator: validator_id });
        Ok(RATIO.with(|r| r.borrow().clone()))
    }

    fn stake_removed(
        caller: &AccountId,
        key: PoolKey,
        staker: &AccountId,
        amount_removed: Balance,
        reward_removed: Balance,
        staker_removed: bool,
    ) -> DispatchResult {
        if *caller != Self::pool_account(key.validator_id, key.pool_id)? {
            return Err(DispatchError::Other("not a registered pool"));
        }
        notify(Notification::StakeRemoved {
            key,
            staker: *staker,
            amount: amount_removed,
            reward: reward_removed,
            removed: staker_removed,
        });
        set_state(|s| {
            s.total_staked = s.total_staked.saturating_sub(amount_removed);
            s.token_held_back = s.token_held_back.saturating_sub(reward_removed);
        });
        if reward_removed > 0 && !key.is_treasury() {
            let token = Self::validator_config(key.validator_id)?
                .reward_token
                .ok_or(DispatchError::Other("no reward token"))?;
            StakingPool::pay_token_reward(&REGISTRY, key.treasury(), staker, token, reward_removed)?;
        }
        Ok(())
    }

    fn stake_updated_via_rewards(caller: &AccountId, key: PoolKey, report: &EpochReport) -> DispatchResult {
        if *caller != Self::pool_account(key.validator_id, key.pool_id)? {
            return Err(DispatchError::Other("not a registered pool"));
        }
        if REJECT_REPORTS.with(|r| *r.borrow()) {
            return Err(DispatchError::Other("registry unavailable"));
        }
        notify(Notification::Rewards { key, report: report.clone() });
        set_state(|s| {
            s.total_staked += report.increased_stake;
            s.token_held_back += report.token_paid_out;
        });
        Ok(())
    }
}

pub fn pool(pool_id: PoolIndex) -> PoolKey {
    PoolKey::new(VALIDATOR, pool_id)
}

pub fn pool_account(pool_id: PoolIndex) -> AccountId {
    TestPoolAccount::convert(pool(pool_id))
}

/// Creates and initializes a pool of the test validator.
pub fn setup_pool(pool_id: PoolIndex) -> PoolKey {
    let key = pool(pool_id);
    StakingPool::create_pool(key, MIN_STAKE).expect("pool is created");
    StakingPool::init_storage(RuntimeOrigin::signed(OWNER), key).expect("ledger is allocated");
    key
}

/// Moves stake into the pool account and credits it the way the registry does.
pub fn stake(key: PoolKey, who: AccountId, amount: Balance) -> Result<u64, DispatchError> {
    Balances::transfer(&who, &StakingPool::pool_account(key), amount, ExistenceRequirement::KeepAlive)?;
    let entry = StakingPool::add_stake(&REGISTRY, key, &who, amount)?;
    set_state(|s| s.total_staked += amount);
    Ok(entry)
}

/// Simulates reward arriving in the pool account.
pub fn deposit_reward(key: PoolKey, amount: Balance) {
    let _ = Balances::deposit_creating(&StakingPool::pool_account(key), amount);
}

pub fn mint_tokens(who: AccountId, amount: u64) {
    Assets::mint_into(TOKEN, &who, amount).expect("token exists");
}

pub fn token_balance(who: AccountId) -> u64 {
    Assets::balance(TOKEN, who)
}

pub fn free(who: AccountId) -> Balance {
    Balances::free_balance(who)
}

pub fn run_to_block(n: u64) {
    System::set_block_number(n);
}

pub fn new_test_ext() -> sp_io::TestExternalities {
    let mut t = frame_system::GenesisConfig::<Test>::default()
        .build_storage()
        .unwrap();

    pallet_balances::GenesisConfig::<Test> {
        balances: vec![
            (1, 100_000_000_000),
            (2, 100_000_000_000),
            (3, 100_000_000_000),
            (4, 100_000_000_000),
            (5, 100_000_000_000),
            (OWNER, 10_000_000),
            (MANAGER, 10_000_000),
            (COMMISSION, 1),
        ],
        ..Default::default()
    }
    .assimilate_storage(&mut t)
    .unwrap();

    let mut ext: sp_io::TestExternalities = t.into();
    ext.execute_with(|| {
        System::set_block_number(1);
        <Assets as fungibles::Create<AccountId>>::create(TOKEN, OWNER, true, 1).unwrap();
        CONFIG.with(|c| *c.borrow_mut() = default_config());
        STATE.with(|s| *s.borrow_mut() = ValidatorState::default());
        RATIO.with(|r| *r.borrow_mut() = TokenPayoutRatio::default());
        NOTIFICATIONS.with(|n| n.borrow_mut().clear());
        REJECT_REPORTS.with(|r| *r.borrow_mut() = false);
        OnlineStake::set(1_000_000_000_000_000);
    });
    ext
}
