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

//! Wallet records.
//!
//! A wallet is the balance one user holds in one currency. Its identity
//! fields are immutable; the balance lives behind a [`Mutex`] and is only
//! changed through a [`LedgerTxn`](crate::store::LedgerTxn).
//!
//! # Example
//!
//! ```
//! use remit_ledger::{UserId, Wallet};
//! use rust_decimal_macros::dec;
//!
//! let wallet = Wallet::new(UserId::new("alice"), "NGN".parse().unwrap());
//! assert_eq!(wallet.balance(), dec!(0));
//! ```

use crate::base::{CurrencyCode, UserId, WalletId};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use serde::ser::{SerializeStruct, Serializer};

#[derive(Debug)]
pub(crate) struct WalletState {
    pub(crate) balance: Decimal,
    /// Bumped on every applied mutation.
    pub(crate) version: u64,
    pub(crate) updated_at: DateTime<Utc>,
}

impl WalletState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            balance: Decimal::ZERO,
            version: 0,
            updated_at: now,
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.balance >= Decimal::ZERO,
            "Invariant violated: wallet balance went negative: {}",
            self.balance
        );
    }

    /// Applies `delta` if the current balance still equals `expected_prior`.
    ///
    /// Returns the new balance.
    pub(crate) fn adjust(
        &mut self,
        delta: Decimal,
        expected_prior: Decimal,
    ) -> Result<Decimal, StoreError> {
        if self.balance != expected_prior {
            return Err(StoreError::ConcurrentModification {
                expected: expected_prior,
                actual: self.balance,
            });
        }
        let next = self
            .balance
            .checked_add(delta)
            .ok_or(StoreError::Overflow)?;
        if next < Decimal::ZERO {
            return Err(StoreError::NegativeBalance);
        }
        self.balance = next;
        self.version += 1;
        self.updated_at = Utc::now();
        self.assert_invariants();
        Ok(next)
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            balance: self.balance,
            version: self.version,
            updated_at: self.updated_at,
        }
    }

    /// Puts back state captured before a rolled-back adjustment.
    pub(crate) fn restore(&mut self, checkpoint: Checkpoint) {
        self.balance = checkpoint.balance;
        self.version = checkpoint.version;
        self.updated_at = checkpoint.updated_at;
        self.assert_invariants();
    }
}

/// Pre-image of a wallet's state, kept in a transaction's undo log.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkpoint {
    balance: Decimal,
    version: u64,
    updated_at: DateTime<Utc>,
}

/// A per-user, per-currency balance.
#[derive(Debug)]
pub struct Wallet {
    id: WalletId,
    owner: UserId,
    currency: CurrencyCode,
    created_at: DateTime<Utc>,
    pub(crate) state: Mutex<WalletState>,
}

impl Wallet {
    /// Output precision for serialized balances.
    pub const DECIMAL_PRECISION: u32 = 4;

    pub fn new(owner: UserId, currency: CurrencyCode) -> Self {
        let now = Utc::now();
        Self {
            id: WalletId::new(),
            owner,
            currency,
            created_at: now,
            state: Mutex::new(WalletState::new(now)),
        }
    }

    pub fn id(&self) -> WalletId {
        self.id
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    pub fn currency(&self) -> CurrencyCode {
        self.currency
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn balance(&self) -> Decimal {
        self.state.lock().balance
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Consistent point-in-time copy of the wallet.
    pub fn snapshot(&self) -> WalletSnapshot {
        let state = self.state.lock();
        WalletSnapshot {
            wallet_id: self.id,
            user: self.owner.clone(),
            currency: self.currency,
            balance: state.balance,
            version: state.version,
            updated_at: state.updated_at,
        }
    }
}

impl Serialize for Wallet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let balance = self.balance();
        let mut state = serializer.serialize_struct("Wallet", 3)?;
        state.serialize_field("user", &self.owner)?;
        state.serialize_field("currency", &self.currency)?;
        state.serialize_field("balance", &balance.round_dp(Wallet::DECIMAL_PRECISION))?;
        state.end()
    }
}

/// Detached copy of a wallet's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletSnapshot {
    pub wallet_id: WalletId,
    pub user: UserId,
    pub currency: CurrencyCode,
    pub balance: Decimal,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Read-path projection returned by `wallet_balances`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletBalance {
    pub wallet_id: WalletId,
    pub currency: CurrencyCode,
    pub balance: Decimal,
}
