// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Wallet storage and locked ledger transactions.
//!
//! The [`WalletStore`] indexes wallets by id and by `(user, currency)`.
//! Balances are mutated only inside a [`LedgerTxn`], which holds the row
//! locks of every wallet it touches:
//!
//! ```text
//!  lock([a, b])  ── sort by WalletId ──► try_lock_for(a) ─► try_lock_for(b)
//!       │                                      │ timeout            │ timeout
//!       │                                      └───────► LockTimeout ◄┘
//!       ▼
//!  adjust_balance(..)*  ── commit() ──► effects kept, locks released
//!       │
//!       └── drop without commit ──► undo log replayed, locks released
//! ```
//!
//! Acquiring locks in ascending id order means two scopes over the same
//! wallets can never wait on each other in a cycle.

use crate::base::{CurrencyCode, UserId, WalletId};
use crate::error::StoreError;
use crate::wallet::{Checkpoint, Wallet, WalletState};
use dashmap::DashMap;
use parking_lot::MutexGuard;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

/// Concurrent wallet storage.
#[derive(Debug)]
pub struct WalletStore {
    /// Wallets indexed by wallet ID.
    wallets: DashMap<WalletId, Arc<Wallet>>,
    /// Unique `(owner, currency)` index.
    by_owner: DashMap<(UserId, CurrencyCode), Arc<Wallet>>,
    lock_timeout: Duration,
}

impl WalletStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            wallets: DashMap::new(),
            by_owner: DashMap::new(),
            lock_timeout,
        }
    }

    /// Returns the user's wallet in `currency`, creating an empty one on
    /// first use. Concurrent callers always observe the same wallet.
    pub fn open_wallet(&self, user: &UserId, currency: CurrencyCode) -> Arc<Wallet> {
        // The index entry guard makes check-and-create atomic per pair.
        let entry = self
            .by_owner
            .entry((user.clone(), currency))
            .or_insert_with(|| {
                let wallet = Arc::new(Wallet::new(user.clone(), currency));
                self.wallets.insert(wallet.id(), Arc::clone(&wallet));
                wallet
            });
        Arc::clone(entry.value())
    }

    /// Looks up the user's wallet in `currency`.
    pub fn get_wallet(&self, user: &UserId, currency: CurrencyCode) -> Option<Arc<Wallet>> {
        self.by_owner
            .get(&(user.clone(), currency))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn wallet(&self, id: &WalletId) -> Result<Arc<Wallet>, StoreError> {
        self.wallets
            .get(id)
            .map(|wallet| Arc::clone(wallet.value()))
            .ok_or(StoreError::WalletNotFound(*id))
    }

    /// All wallets owned by `user`, ordered by currency.
    pub fn wallets_for(&self, user: &UserId) -> Vec<Arc<Wallet>> {
        let mut wallets: Vec<Arc<Wallet>> = self
            .wallets
            .iter()
            .filter(|entry| entry.value().owner() == user)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        wallets.sort_by_key(|wallet| wallet.currency());
        wallets
    }

    /// Every wallet in the store, ordered by owner then currency.
    pub fn all(&self) -> Vec<Arc<Wallet>> {
        let mut wallets: Vec<Arc<Wallet>> = self
            .wallets
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        wallets.sort_by(|a, b| {
            a.owner()
                .cmp(b.owner())
                .then_with(|| a.currency().cmp(&b.currency()))
        });
        wallets
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    /// Locks `wallets` for a multi-step mutation.
    ///
    /// Locks are taken in ascending [`WalletId`] order, each with a bounded
    /// wait. Duplicate entries are locked once.
    ///
    /// # Errors
    ///
    /// [`StoreError::LockTimeout`] if any lock is not acquired in time; locks
    /// already taken are released before returning.
    pub fn lock<'a>(&self, wallets: &[&'a Arc<Wallet>]) -> Result<LedgerTxn<'a>, StoreError> {
        let mut ordered: Vec<&'a Arc<Wallet>> = wallets.to_vec();
        ordered.sort_by_key(|wallet| wallet.id());
        ordered.dedup_by_key(|wallet| wallet.id());

        let mut guards = Vec::with_capacity(ordered.len());
        for wallet in ordered {
            let guard = wallet
                .state
                .try_lock_for(self.lock_timeout)
                .ok_or(StoreError::LockTimeout)?;
            guards.push((wallet.id(), guard));
        }

        Ok(LedgerTxn {
            guards,
            undo: Vec::new(),
            committed: false,
        })
    }

    /// Applies `delta` to one wallet, conditioned on its balance still being
    /// `expected_prior`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ConcurrentModification`] - the balance moved since it was read.
    /// - [`StoreError::NegativeBalance`] - the result would be below zero.
    /// - [`StoreError::WalletNotFound`], [`StoreError::LockTimeout`], [`StoreError::Overflow`].
    pub fn adjust_balance(
        &self,
        id: &WalletId,
        delta: Decimal,
        expected_prior: Decimal,
    ) -> Result<Decimal, StoreError> {
        let wallet = self.wallet(id)?;
        let mut txn = self.lock(&[&wallet])?;
        let balance = txn.adjust_balance(id, delta, expected_prior)?;
        txn.commit();
        Ok(balance)
    }
}

impl Default for WalletStore {
    fn default() -> Self {
        Self::new(crate::EngineConfig::DEFAULT_LOCK_TIMEOUT)
    }
}

/// An open ledger transaction holding the locks of its wallets.
///
/// Effects become permanent on [`commit`](Self::commit). Dropping the
/// transaction first restores every touched wallet, so an error, early
/// return or panic between two adjustments leaves no partial effect.
pub struct LedgerTxn<'a> {
    guards: Vec<(WalletId, MutexGuard<'a, WalletState>)>,
    /// Pre-images in application order; replayed in reverse on rollback.
    undo: Vec<(usize, Checkpoint)>,
    committed: bool,
}

impl LedgerTxn<'_> {
    fn slot(&self, id: &WalletId) -> Result<usize, StoreError> {
        self.guards
            .iter()
            .position(|(wallet_id, _)| wallet_id == id)
            .ok_or(StoreError::NotInTransaction(*id))
    }

    /// Current balance of a locked wallet.
    pub fn balance(&self, id: &WalletId) -> Result<Decimal, StoreError> {
        let slot = self.slot(id)?;
        Ok(self.guards[slot].1.balance)
    }

    /// Conditionally adjusts a locked wallet. See
    /// [`WalletStore::adjust_balance`].
    pub fn adjust_balance(
        &mut self,
        id: &WalletId,
        delta: Decimal,
        expected_prior: Decimal,
    ) -> Result<Decimal, StoreError> {
        let slot = self.slot(id)?;
        let state = &mut self.guards[slot].1;
        let checkpoint = state.checkpoint();
        let balance = state.adjust(delta, expected_prior)?;
        self.undo.push((slot, checkpoint));
        Ok(balance)
    }

    /// Number of adjustments applied so far.
    pub fn pending_writes(&self) -> usize {
        self.undo.len()
    }

    /// Keeps all effects and releases the locks.
    pub fn commit(mut self) {
        self.committed = true;
    }

    fn rollback(&mut self) {
        while let Some((slot, checkpoint)) = self.undo.pop() {
            self.guards[slot].1.restore(checkpoint);
        }
    }
}

impl Drop for LedgerTxn<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn user(name: &str) -> UserId {
        UserId::new(name)
    }

    fn ngn() -> CurrencyCode {
        "NGN".parse().unwrap()
    }

    fn funded(store: &WalletStore, name: &str, amount: Decimal) -> Arc<Wallet> {
        let wallet = store.open_wallet(&user(name), ngn());
        store
            .adjust_balance(&wallet.id(), amount, Decimal::ZERO)
            .unwrap();
        wallet
    }

    #[test]
    fn open_wallet_is_idempotent() {
        let store = WalletStore::default();
        let first = store.open_wallet(&user("alice"), ngn());
        let second = store.open_wallet(&user("alice"), ngn());
        assert_eq!(first.id(), second.id());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn get_wallet_requires_existing_pair() {
        let store = WalletStore::default();
        assert!(store.get_wallet(&user("alice"), ngn()).is_none());
        let wallet = store.open_wallet(&user("alice"), ngn());
        assert_eq!(store.get_wallet(&user("alice"), ngn()).unwrap().id(), wallet.id());
    }

    #[test]
    fn uncommitted_transaction_rolls_back() {
        let store = WalletStore::default();
        let a = funded(&store, "alice", dec!(100));
        let b = funded(&store, "bob", dec!(0));

        {
            let mut txn = store.lock(&[&a, &b]).unwrap();
            txn.adjust_balance(&a.id(), dec!(-40), dec!(100)).unwrap();
            txn.adjust_balance(&b.id(), dec!(40), dec!(0)).unwrap();
            assert_eq!(txn.pending_writes(), 2);
        }

        assert_eq!(a.balance(), dec!(100));
        assert_eq!(b.balance(), dec!(0));
        assert_eq!(a.version(), 1);
    }

    #[test]
    fn committed_transaction_keeps_effects() {
        let store = WalletStore::default();
        let a = funded(&store, "alice", dec!(100));
        let b = funded(&store, "bob", dec!(0));

        let mut txn = store.lock(&[&b, &a]).unwrap();
        txn.adjust_balance(&a.id(), dec!(-40), dec!(100)).unwrap();
        txn.adjust_balance(&b.id(), dec!(40), dec!(0)).unwrap();
        txn.commit();

        assert_eq!(a.balance(), dec!(60));
        assert_eq!(b.balance(), dec!(40));
    }

    #[test]
    fn lock_times_out_when_wallet_is_held() {
        let store = WalletStore::new(Duration::from_millis(10));
        let a = funded(&store, "alice", dec!(1));

        let _held = store.lock(&[&a]).unwrap();
        let result = store.lock(&[&a]);
        assert!(matches!(result, Err(StoreError::LockTimeout)));
    }

    #[test]
    fn adjusting_an_unlocked_wallet_is_rejected() {
        let store = WalletStore::default();
        let a = funded(&store, "alice", dec!(1));
        let b = funded(&store, "bob", dec!(1));

        let mut txn = store.lock(&[&a]).unwrap();
        assert_eq!(
            txn.adjust_balance(&b.id(), dec!(1), dec!(1)),
            Err(StoreError::NotInTransaction(b.id()))
        );
    }

    #[test]
    fn duplicate_wallets_are_locked_once() {
        let store = WalletStore::default();
        let a = funded(&store, "alice", dec!(5));
        let txn = store.lock(&[&a, &a]).unwrap();
        assert_eq!(txn.balance(&a.id()), Ok(dec!(5)));
    }
}
