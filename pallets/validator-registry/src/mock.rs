use crate as pallet_validator_registry;
use frame_support::{
    assert_ok, derive_impl, parameter_types,
    traits::{
        fungibles::{self, Mutate as _},
        AsEnsureOriginWithArg, ConstU128, ConstU32, ConstU64, Currency,
    },
    PalletId,
};
use frame_system::{EnsureRoot, EnsureSigned};
use sp_runtime::{
    traits::{Convert, IdentityLookup},
    BuildStorage,
};
use stakepool_primitives::{Balance, PoolIndex, PoolKey, ValidatorConfig, ValidatorId};

type Block = frame_system::mocking::MockBlock<Test>;

pub type AccountId = u64;
pub type AssetId = u32;

pub const OWNER: AccountId = 10;
pub const MANAGER: AccountId = 11;
pub const COMMISSION: AccountId = 12;
pub const FEE_SINK: AccountId = 13;
pub const TOKEN: AssetId = 7;

pub const EPOCH: u64 = 100;
pub const MIN_STAKE: Balance = 1_000_000;
pub const INITIAL: Balance = 100_000_000_000;

frame_support::construct_runtime!(
    pub enum Test {
        System: frame_system,
        Timestamp: pallet_timestamp,
        Balances: pallet_balances,
        Assets: pallet_assets,
        StakingPool: pallet_staking_pool,
        ValidatorRegistry: pallet_validator_registry,
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
    pub const RegistryPalletId: PalletId = PalletId(*b"py/vlreg");
    pub const FeeSinkAccount: AccountId = FEE_SINK;
    pub static OnlineStake: Balance = 1_000_000_000_000_000;
}

impl pallet_staking_pool::Config for Test {
    type RuntimeEvent = RuntimeEvent;
    type Currency = Balances;
    type AssetId = AssetId;
    type Assets = Assets;
    type Registry = ValidatorRegistry;
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

impl pallet_validator_registry::Config for Test {
    type RuntimeEvent = RuntimeEvent;
    type Currency = Balances;
    type AssetId = AssetId;
    type Assets = Assets;
    type Pools = StakingPool;
    type OnlineStake = OnlineStake;
    type PalletId = RegistryPalletId;
    type MaxStakersPerPool = ConstU32<4>;
    type MaxPoolsPerStaker = ConstU32<6>;
}

pub fn validator_config() -> ValidatorConfig<AccountId, AssetId> {
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

/// Registers a validator owned by `OWNER` and returns its id.
pub fn register(f: impl FnOnce(&mut ValidatorConfig<AccountId, AssetId>)) -> ValidatorId {
    let mut config = validator_config();
    f(&mut config);
    assert_ok!(ValidatorRegistry::add_validator(RuntimeOrigin::signed(OWNER), config));
    ValidatorRegistry::num_validators()
}

/// Adds `count` pools to a validator and allocates their ledgers.
pub fn add_pools(validator_id: ValidatorId, count: u64) {
    for _ in 0..count {
        assert_ok!(ValidatorRegistry::add_pool(RuntimeOrigin::signed(OWNER), validator_id));
        let pool_id = ValidatorRegistry::validator_pools(validator_id).len() as PoolIndex;
        assert_ok!(StakingPool::init_storage(RuntimeOrigin::signed(OWNER), PoolKey::new(validator_id, pool_id)));
    }
}

pub fn stake(who: AccountId, validator_id: ValidatorId, amount: Balance) -> sp_runtime::DispatchResult {
    ValidatorRegistry::add_stake(RuntimeOrigin::signed(who), validator_id, amount)
}

pub fn key(validator_id: ValidatorId, pool_id: PoolIndex) -> PoolKey {
    PoolKey::new(validator_id, pool_id)
}

pub fn pool_account(validator_id: ValidatorId, pool_id: PoolIndex) -> AccountId {
    TestPoolAccount::convert(key(validator_id, pool_id))
}

pub fn mint_tokens(who: AccountId, amount: u64) {
    Assets::mint_into(TOKEN, &who, amount).expect("token exists");
}

pub fn token_balance(who: AccountId) -> u64 {
    Assets::balance(TOKEN, who)
}

pub fn deposit_reward(account: AccountId, amount: Balance) {
    let _ = Balances::deposit_creating(&account, amount);
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

    let mut balances: Vec<(AccountId, Balance)> = (1..=8).map(|who| (who, INITIAL)).collect();
    balances.extend([(OWNER, 10_000_000), (MANAGER, 10_000_000), (COMMISSION, 1)]);
    pallet_balances::GenesisConfig::<Test> { balances, ..Default::default() }
        .assimilate_storage(&mut t)
        .unwrap();

    let mut ext: sp_io::TestExternalities = t.into();
    ext.execute_with(|| {
        System::set_block_number(1);
        <Assets as fungibles::Create<AccountId>>::create(TOKEN, OWNER, true, 1).unwrap();
        OnlineStake::set(1_000_000_000_000_000);
    });
    ext
}
