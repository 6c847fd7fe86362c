//! Fixed-capacity staker ledger.
//!
//! A pool holds at most `MaxStakersPerPool` stakers in a slot array that is
//! allocated once by `init_storage` and never resized. Lookups are linear
//! scans that hit a budget checkpoint on every slot visited. Emptied slots are
//! reset in place and reused by later stakers.

use codec::{Decode, Encode, MaxEncodedLen};
use frame_support::{traits::Get, BoundedVec};
use scale_info::TypeInfo;
use sp_runtime::{ArithmeticError, RuntimeDebug};
use stakepool_primitives::{Balance, BudgetMeter, Round};

use crate::PoolState;

/// Budget units charged per slot visited during a scan.
pub const SCAN_COST: u32 = 300;

/// One ledger slot.
#[derive(Encode, Decode, Clone, PartialEq, Eq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
pub struct StakerRecord<AccountId> {
    /// `None` marks an empty slot.
    pub account: Option<AccountId>,
    /// Principal plus compounded reward.
    pub balance: Balance,
    /// Lifetime primary reward credited.
    pub total_rewarded: Balance,
    /// Secondary token reward owed but not yet paid out.
    pub secondary_reward_balance: Balance,
    /// Round from which the current balance counts for proration.
    pub entry_round: Round,
}

impl<AccountId> StakerRecord<AccountId> {
    pub const fn empty() -> Self {
        Self {
            account: None,
            balance: 0,
            total_rewarded: 0,
            secondary_reward_balance: 0,
            entry_round: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.account.is_none()
    }
}

impl<AccountId> Default for StakerRecord<AccountId> {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, RuntimeDebug)]
pub enum LedgerError {
    PoolFull,
    BelowMinimum,
    InsufficientBalance,
    NotFound,
    Arithmetic(ArithmeticError),
}

impl From<ArithmeticError> for LedgerError {
    fn from(err: ArithmeticError) -> Self {
        LedgerError::Arithmetic(err)
    }
}

/// Result of a single scan.
#[derive(Clone, Copy, Default, PartialEq, Eq, RuntimeDebug)]
pub struct Lookup {
    /// Slot holding the account, first match wins.
    pub found: Option<usize>,
    /// First empty slot seen before the scan stopped.
    pub first_empty: Option<usize>,
}

/// Ledger view over a pool's slots and the totals that must track them.
///
/// Every mutation keeps `pool.total_staked` equal to the sum of slot balances
/// and `pool.staker_count` equal to the number of occupied slots.
pub struct StakerLedger<'a, AccountId, S: Get<u32>> {
    slots: &'a mut BoundedVec<StakerRecord<AccountId>, S>,
    pool: &'a mut PoolState,
}

impl<'a, AccountId, S> StakerLedger<'a, AccountId, S>
where
    AccountId: Clone + PartialEq,
    S: Get<u32>,
{
    pub fn new(slots: &'a mut BoundedVec<StakerRecord<AccountId>, S>, pool: &'a mut PoolState) -> Self {
        Self { slots, pool }
    }

    /// Number of slots, occupied or not.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, idx: usize) -> Option<&StakerRecord<AccountId>> {
        self.slots.get(idx)
    }

    pub fn total_staked(&self) -> Balance {
        self.pool.total_staked
    }

    pub fn staker_count(&self) -> u32 {
        self.pool.staker_count
    }

    pub fn min_entry_stake(&self) -> Balance {
        self.pool.min_entry_stake
    }

    /// Scans for `who`, remembering the first empty slot on the way.
    pub fn find(&self, who: &AccountId, meter: &mut impl BudgetMeter) -> Lookup {
        let mut lookup = Lookup::default();
        for (idx, record) in self.slots.iter().enumerate() {
            meter.checkpoint(SCAN_COST);
            match &record.account {
                Some(account) if account == who => {
                    lookup.found = Some(idx);
                    return lookup;
                }
                None if lookup.first_empty.is_none() => lookup.first_empty = Some(idx),
                _ => {}
            }
        }
        lookup
    }

    pub fn position(&self, who: &AccountId, meter: &mut impl BudgetMeter) -> Result<usize, LedgerError> {
        self.find(who, meter).found.ok_or(LedgerError::NotFound)
    }

    /// Places a new staker into `slot` (normally `Lookup::first_empty`).
    pub fn insert(
        &mut self,
        slot: Option<usize>,
        who: AccountId,
        amount: Balance,
        entry_round: Round,
    ) -> Result<usize, LedgerError> {
        let idx = slot.ok_or(LedgerError::PoolFull)?;
        if amount < self.pool.min_entry_stake {
            return Err(LedgerError::BelowMinimum);
        }
        let record = self.slots.get_mut(idx).ok_or(LedgerError::PoolFull)?;
        if !record.is_empty() {
            return Err(LedgerError::PoolFull);
        }
        let total = self.pool.total_staked.checked_add(amount).ok_or(ArithmeticError::Overflow)?;

        *record = StakerRecord {
            account: Some(who),
            balance: amount,
            total_rewarded: 0,
            secondary_reward_balance: 0,
            entry_round,
        };
        self.pool.total_staked = total;
        self.pool.staker_count = self.pool.staker_count.saturating_add(1);
        Ok(idx)
    }

    /// Adds stake to an existing staker. The combined balance is re-aged from
    /// `entry_round`.
    pub fn add_to_existing(&mut self, idx: usize, amount: Balance, entry_round: Round) -> Result<(), LedgerError> {
        let total = self.pool.total_staked.checked_add(amount).ok_or(ArithmeticError::Overflow)?;
        let record = self.occupied_mut(idx)?;
        record.balance = record.balance.checked_add(amount).ok_or(ArithmeticError::Overflow)?;
        record.entry_round = record.entry_round.max(entry_round);
        self.pool.total_staked = total;
        Ok(())
    }

    /// Removes `amount` from a staker. A nonzero remainder must still meet the
    /// pool minimum. Returns `true` if the slot was cleared.
    pub fn withdraw(&mut self, idx: usize, amount: Balance) -> Result<bool, LedgerError> {
        let min_entry_stake = self.pool.min_entry_stake;
        let record = self.occupied_mut(idx)?;
        let remaining = record.balance.checked_sub(amount).ok_or(LedgerError::InsufficientBalance)?;
        if remaining != 0 && remaining < min_entry_stake {
            return Err(LedgerError::BelowMinimum);
        }

        record.balance = remaining;
        self.pool.total_staked = self.pool.total_staked.saturating_sub(amount);
        Ok(self.clear_if_drained(idx))
    }

    /// Credits primary reward to a staker's balance.
    pub fn credit_reward(&mut self, idx: usize, amount: Balance) -> Result<(), LedgerError> {
        let total = self.pool.total_staked.checked_add(amount).ok_or(ArithmeticError::Overflow)?;
        let record = self.occupied_mut(idx)?;
        record.balance = record.balance.checked_add(amount).ok_or(ArithmeticError::Overflow)?;
        record.total_rewarded = record.total_rewarded.saturating_add(amount);
        self.pool.total_staked = total;
        Ok(())
    }

    pub fn credit_secondary_reward(&mut self, idx: usize, amount: Balance) -> Result<(), LedgerError> {
        let record = self.occupied_mut(idx)?;
        record.secondary_reward_balance =
            record.secondary_reward_balance.checked_add(amount).ok_or(ArithmeticError::Overflow)?;
        Ok(())
    }

    /// Zeroes and returns the staker's secondary reward.
    pub fn claim_secondary_reward(&mut self, idx: usize) -> Result<Balance, LedgerError> {
        let record = self.occupied_mut(idx)?;
        let owed = core::mem::take(&mut record.secondary_reward_balance);
        self.clear_if_drained(idx);
        Ok(owed)
    }

    #[cfg(test)]
    pub fn sum_of_balances(&self) -> Balance {
        self.slots.iter().filter(|r| !r.is_empty()).map(|r| r.balance).sum()
    }

    fn occupied_mut(&mut self, idx: usize) -> Result<&mut StakerRecord<AccountId>, LedgerError> {
        match self.slots.get_mut(idx) {
            Some(record) if !record.is_empty() => Ok(record),
            _ => Err(LedgerError::NotFound),
        }
    }

    fn clear_if_drained(&mut self, idx: usize) -> bool {
        let Some(record) = self.slots.get_mut(idx) else {
            return false;
        };
        if record.is_empty() || record.balance != 0 || record.secondary_reward_balance != 0 {
            return false;
        }
        *record = StakerRecord::empty();
        self.pool.staker_count = self.pool.staker_count.saturating_sub(1);
        true
    }
}

/// Allocates `capacity` empty slots.
pub fn empty_slots<AccountId: Clone, S: Get<u32>>() -> BoundedVec<StakerRecord<AccountId>, S> {
    let slots = sp_std::vec![StakerRecord::empty(); S::get() as usize];
    BoundedVec::truncate_from(slots)
}
