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

//! Transfer engine.
//!
//! The [`TransferEngine`] is the only writer of wallet balances. Every
//! operation follows the same shape:
//!
//! 1. Write a `pending` journal record (claiming the idempotency key).
//! 2. Validate preconditions and resolve a conversion rate if needed.
//! 3. Lock the affected wallets, re-read balances, mutate, mark the record
//!    `completed`, commit.
//! 4. On failure, finalize the record `failed`; on storage exhaustion,
//!    leave it `pending` for reconciliation.
//!
//! # Thread Safety
//!
//! The engine is `Send + Sync` and meant to be shared behind an [`Arc`].
//! No wallet lock is held across an `.await`: rate resolution completes
//! before the locked scope starts.

use crate::base::{CurrencyCode, IdempotencyKey, TransactionId, UserId, WalletId};
use crate::config::EngineConfig;
use crate::error::{StoreError, TransferError};
use crate::journal::{Begin, EntryKind, Journal, TransferRecord, TransferStatus};
use crate::rates::{RateBook, RateProvider};
use crate::store::{LedgerTxn, WalletStore};
use crate::wallet::{Wallet, WalletBalance, WalletSnapshot};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Request to move `amount` from one wallet to another.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransferRequest {
    pub source_wallet_id: WalletId,
    pub destination_wallet_id: WalletId,
    /// Debit amount, in the source wallet's currency.
    pub amount: Decimal,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
}

impl TransferRequest {
    pub fn new(
        source_wallet_id: WalletId,
        destination_wallet_id: WalletId,
        amount: Decimal,
    ) -> Self {
        Self {
            source_wallet_id,
            destination_wallet_id,
            amount,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(IdempotencyKey::new(key));
        self
    }
}

/// Proof of a completed journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    pub transaction_id: TransactionId,
    pub kind: EntryKind,
    /// Amount taken from the source, in its currency (zero for funding).
    pub debited: Decimal,
    /// Amount added to the destination, in its currency.
    pub credited: Decimal,
    pub rate: Option<Decimal>,
    pub completed_at: DateTime<Utc>,
}

impl TransferReceipt {
    /// Receipt for a completed record; `None` for any other status.
    pub fn from_record(record: &TransferRecord) -> Option<Self> {
        if record.status != TransferStatus::Completed {
            return None;
        }
        let debited = match record.kind {
            EntryKind::Transfer => record.amount,
            EntryKind::Funding => Decimal::ZERO,
        };
        Some(Self {
            transaction_id: record.transaction_id,
            kind: record.kind,
            debited,
            credited: record.credited_amount?,
            rate: record.rate,
            completed_at: record.completed_at?,
        })
    }
}

/// Wire-level transfer result.
///
/// ```json
/// {"success": true, "transaction_id": "6f1c..."}
/// {"success": false, "message": "insufficient funds"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransferResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<Result<TransferReceipt, TransferError>> for TransferResult {
    fn from(result: Result<TransferReceipt, TransferError>) -> Self {
        match result {
            Ok(receipt) => Self {
                success: true,
                transaction_id: Some(receipt.transaction_id),
                message: None,
            },
            Err(err) => Self {
                success: false,
                transaction_id: None,
                message: Some(err.to_string()),
            },
        }
    }
}

/// Verified external funding event, credited without a paired debit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingCredit {
    pub user: UserId,
    pub currency: CurrencyCode,
    pub amount: Decimal,
    /// Gateway reference; repeated deliveries of one reference credit once.
    pub reference: String,
}

/// Ledger transfer engine that owns wallets, journal, and rates.
///
/// # Invariants
///
/// - Wallet balances never go negative.
/// - A transfer's debit, credit and `completed` journal mark land together or
///   not at all.
/// - A failed result implies no balance changed.
pub struct TransferEngine {
    wallets: WalletStore,
    journal: Journal,
    rates: RateBook,
    config: EngineConfig,
}

impl TransferEngine {
    /// Creates an engine with default configuration.
    pub fn new(provider: Arc<dyn RateProvider>) -> Self {
        Self::with_config(provider, EngineConfig::default())
    }

    pub fn with_config(provider: Arc<dyn RateProvider>, config: EngineConfig) -> Self {
        Self {
            wallets: WalletStore::new(config.lock_timeout),
            journal: Journal::new(),
            rates: RateBook::new(provider, config.rate_ttl),
            config,
        }
    }

    pub fn wallets(&self) -> &WalletStore {
        &self.wallets
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn rates(&self) -> &RateBook {
        &self.rates
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the user's wallet in `currency`, creating it on first use.
    pub fn open_wallet(&self, user: &UserId, currency: CurrencyCode) -> WalletSnapshot {
        self.wallets.open_wallet(user, currency).snapshot()
    }

    /// Balances of every wallet the user owns, ordered by currency.
    pub fn wallet_balances(&self, user: &UserId) -> Vec<WalletBalance> {
        self.wallets
            .wallets_for(user)
            .iter()
            .map(|wallet| WalletBalance {
                wallet_id: wallet.id(),
                currency: wallet.currency(),
                balance: wallet.balance(),
            })
            .collect()
    }

    /// Moves funds between two wallets on behalf of `caller`.
    ///
    /// # Errors
    ///
    /// Checked in this order:
    ///
    /// - [`TransferError::InvalidAmount`] - amount is not positive, or the
    ///   converted credit rounds to zero.
    /// - [`TransferError::SelfTransfer`] - source equals destination.
    /// - [`TransferError::PermissionDenied`] - source missing or not owned by `caller`.
    /// - [`TransferError::RecipientWalletNotFound`] - destination missing.
    /// - [`TransferError::RateUnavailable`] - currencies differ and no rate is available.
    /// - [`TransferError::InsufficientFunds`] - source balance below the amount.
    ///
    /// Plus [`TransferError::TransferInProgress`] for a key still in flight,
    /// [`TransferError::IdempotencyKeyReused`] for a key already bound to a
    /// different transfer, and [`TransferError::StorageUnavailable`] when the
    /// wallet locks stay contended through every retry.
    pub async fn transfer(
        &self,
        caller: &UserId,
        request: TransferRequest,
    ) -> Result<TransferReceipt, TransferError> {
        let record = TransferRecord::transfer(
            caller.clone(),
            request.source_wallet_id,
            request.destination_wallet_id,
            request.amount,
            request.idempotency_key.clone(),
        );
        let id = match self.journal.begin(record) {
            Begin::Fresh(id) => id,
            Begin::Replay(prior) => {
                debug!(
                    transaction_id = %prior.transaction_id,
                    "replaying transfer for idempotency key"
                );
                return replay(&prior);
            }
            Begin::InFlight(_) => return Err(TransferError::TransferInProgress),
            Begin::Conflict(existing) => {
                warn!(
                    transaction_id = %existing,
                    "idempotency key reused for a different transfer"
                );
                return Err(TransferError::IdempotencyKeyReused);
            }
        };

        let result = self.execute(&id, caller, &request).await;
        if let Ok(receipt) = &result {
            info!(
                transaction_id = %id,
                debited = %receipt.debited,
                credited = %receipt.credited,
                "transfer completed"
            );
        }
        self.conclude(&id, result)
    }

    async fn execute(
        &self,
        id: &TransactionId,
        caller: &UserId,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, TransferError> {
        let amount = request.amount;
        if amount <= Decimal::ZERO {
            return Err(TransferError::InvalidAmount);
        }
        if request.source_wallet_id == request.destination_wallet_id {
            return Err(TransferError::SelfTransfer);
        }

        // Ownership comes from the store, never from the request.
        let source = self
            .wallets
            .wallet(&request.source_wallet_id)
            .ok()
            .filter(|wallet| wallet.owner() == caller)
            .ok_or(TransferError::PermissionDenied)?;
        let destination = self
            .wallets
            .wallet(&request.destination_wallet_id)
            .map_err(|_| TransferError::RecipientWalletNotFound)?;
        self.journal
            .record_currencies(id, source.currency(), destination.currency())?;

        let (credit, rate) = if source.currency() == destination.currency() {
            (amount, None)
        } else {
            let rate = self
                .rates
                .rate(source.currency(), destination.currency())
                .await?;
            (convert(amount, rate)?, Some(rate))
        };

        self.settle(id, &source, &destination, amount, credit, rate)
    }

    /// The atomic scope: re-read, check, debit, credit, complete, commit.
    fn settle(
        &self,
        id: &TransactionId,
        source: &Arc<Wallet>,
        destination: &Arc<Wallet>,
        amount: Decimal,
        credit: Decimal,
        rate: Option<Decimal>,
    ) -> Result<TransferReceipt, TransferError> {
        let record = self.locked(&[source, destination], |txn| {
            let available = txn.balance(&source.id())?;
            if available < amount {
                return Err(TransferError::InsufficientFunds);
            }
            txn.adjust_balance(&source.id(), -amount, available)?;

            let prior = txn.balance(&destination.id())?;
            txn.adjust_balance(&destination.id(), credit, prior)?;

            Ok(self.journal.complete(id, credit, rate)?)
        })?;
        TransferReceipt::from_record(&record).ok_or(TransferError::StorageUnavailable)
    }

    /// Credits a verified external funding event.
    ///
    /// The wallet is created if the user has none in that currency. A
    /// reference that was already credited replays its original receipt.
    pub fn credit_funding(&self, credit: FundingCredit) -> Result<TransferReceipt, TransferError> {
        let wallet = self.wallets.open_wallet(&credit.user, credit.currency);
        let record = TransferRecord::funding(
            credit.user.clone(),
            wallet.id(),
            credit.currency,
            credit.amount,
            credit.reference.clone(),
        );
        let id = match self.journal.begin(record) {
            Begin::Fresh(id) => id,
            Begin::Replay(prior) => {
                debug!(reference = %credit.reference, "funding reference already processed");
                return replay(&prior);
            }
            Begin::InFlight(_) => return Err(TransferError::TransferInProgress),
            Begin::Conflict(existing) => {
                warn!(
                    transaction_id = %existing,
                    reference = %credit.reference,
                    "funding reference reused with different details"
                );
                return Err(TransferError::IdempotencyKeyReused);
            }
        };

        let result = if credit.amount <= Decimal::ZERO {
            Err(TransferError::InvalidAmount)
        } else {
            self.locked(&[&wallet], |txn| {
                let prior = txn.balance(&wallet.id())?;
                txn.adjust_balance(&wallet.id(), credit.amount, prior)?;
                Ok(self.journal.complete(&id, credit.amount, None)?)
            })
            .and_then(|record| {
                TransferReceipt::from_record(&record).ok_or(TransferError::StorageUnavailable)
            })
        };
        if result.is_ok() {
            info!(
                transaction_id = %id,
                user = %credit.user,
                currency = %credit.currency,
                amount = %credit.amount,
                "funding credited"
            );
        }
        self.conclude(&id, result)
    }

    /// Runs `apply` inside a ledger transaction over `wallets`, committing on
    /// success.
    ///
    /// Lock timeouts and concurrent modifications are retried up to
    /// `max_retries` attempts, after which the attempt is reported as
    /// [`TransferError::StorageUnavailable`]. Any other error rolls back and
    /// is returned as is.
    fn locked<T>(
        &self,
        wallets: &[&Arc<Wallet>],
        mut apply: impl FnMut(&mut LedgerTxn<'_>) -> Result<T, TransferError>,
    ) -> Result<T, TransferError> {
        for attempt in 1..=self.config.max_retries {
            let mut txn = match self.wallets.lock(wallets) {
                Ok(txn) => txn,
                Err(StoreError::LockTimeout) => {
                    debug!(attempt, "wallet lock contention, retrying");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            match apply(&mut txn) {
                Ok(value) => {
                    txn.commit();
                    return Ok(value);
                }
                Err(TransferError::ConcurrentModification) => {
                    debug!(attempt, "concurrent wallet modification, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(TransferError::StorageUnavailable)
    }

    /// Finalizes the journal record for a finished attempt.
    fn conclude(
        &self,
        id: &TransactionId,
        result: Result<TransferReceipt, TransferError>,
    ) -> Result<TransferReceipt, TransferError> {
        match result {
            Ok(receipt) => Ok(receipt),
            Err(TransferError::StorageUnavailable | TransferError::ConcurrentModification) => {
                warn!(transaction_id = %id, "storage unavailable, journal record left pending");
                self.journal.release_key(id);
                Err(TransferError::StorageUnavailable)
            }
            Err(err) => {
                warn!(transaction_id = %id, error = %err, "transfer rejected");
                if let Err(journal_err) = self.journal.fail(id, err.clone()) {
                    warn!(
                        transaction_id = %id,
                        error = %journal_err,
                        "could not finalize journal record"
                    );
                }
                Err(err)
            }
        }
    }
}

/// Outcome recorded for a terminal journal entry.
fn replay(record: &TransferRecord) -> Result<TransferReceipt, TransferError> {
    match record.status {
        TransferStatus::Completed => {
            TransferReceipt::from_record(record).ok_or(TransferError::StorageUnavailable)
        }
        _ => Err(record
            .failure
            .clone()
            .unwrap_or(TransferError::StorageUnavailable)),
    }
}

/// Converts a source amount at `rate`, rounding half-to-even to the wallet
/// precision.
fn convert(amount: Decimal, rate: Decimal) -> Result<Decimal, TransferError> {
    let credit = amount
        .checked_mul(rate)
        .ok_or(TransferError::InvalidAmount)?
        .round_dp_with_strategy(Wallet::DECIMAL_PRECISION, RoundingStrategy::MidpointNearestEven);
    if credit <= Decimal::ZERO {
        return Err(TransferError::InvalidAmount);
    }
    Ok(credit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::StaticRates;
    use rust_decimal_macros::dec;

    #[test]
    fn convert_rounds_half_to_even() {
        assert_eq!(convert(dec!(1000), dec!(0.0075)), Ok(dec!(7.5)));
        assert_eq!(convert(dec!(1), dec!(0.00005)), Err(TransferError::InvalidAmount));
        assert_eq!(convert(dec!(1), dec!(0.00015)), Ok(dec!(0.0002)));
    }

    #[test]
    fn convert_rejects_overflow() {
        assert_eq!(convert(Decimal::MAX, dec!(2)), Err(TransferError::InvalidAmount));
    }

    #[test]
    fn transfer_result_projection() {
        let ok: TransferResult = Err(TransferError::InsufficientFunds).into();
        assert!(!ok.success);
        assert_eq!(ok.message.as_deref(), Some("insufficient funds"));
        assert_eq!(ok.transaction_id, None);

        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "message": "insufficient funds"}));
    }

    #[test]
    fn locked_scope_gives_up_after_max_retries() {
        let engine = TransferEngine::with_config(
            Arc::new(StaticRates::new()),
            EngineConfig::default()
                .with_lock_timeout(std::time::Duration::from_millis(5))
                .with_max_retries(2),
        );
        let wallet = engine
            .wallets()
            .open_wallet(&UserId::new("alice"), "NGN".parse().unwrap());

        let _held = engine.wallets().lock(&[&wallet]).unwrap();
        let result = engine.locked(&[&wallet], |_| Ok(()));
        assert_eq!(result, Err(TransferError::StorageUnavailable));
    }
}
