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

//! Error types for transfers, storage and rate lookups.

use crate::base::{CurrencyCode, TransactionId, WalletId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Transfer failures reported to callers.
///
/// Display strings are user-facing: callers show them verbatim, so they never
/// carry wallet or transaction identifiers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Amount is zero, negative, or unrepresentable after conversion
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Source and destination are the same wallet
    #[error("cannot transfer to the same wallet")]
    SelfTransfer,

    /// Source wallet is missing or not owned by the caller
    #[error("invalid source wallet or permission denied")]
    PermissionDenied,

    /// Destination wallet does not exist
    #[error("recipient wallet not found")]
    RecipientWalletNotFound,

    /// No fresh conversion rate could be obtained
    #[error("exchange rate {from}->{to} is unavailable")]
    RateUnavailable { from: CurrencyCode, to: CurrencyCode },

    /// Source balance is lower than the debit
    #[error("insufficient funds")]
    InsufficientFunds,

    /// Balance changed between read and write; retried internally
    #[error("wallet was modified concurrently")]
    ConcurrentModification,

    /// Storage could not complete the attempt; safe for the caller to retry
    #[error("transfer could not be completed, please try again")]
    StorageUnavailable,

    /// Another attempt with the same idempotency key is still running
    #[error("a transfer with this idempotency key is already in progress")]
    TransferInProgress,

    /// The idempotency key was already used for a different request
    #[error("idempotency key was already used for a different request")]
    IdempotencyKeyReused,

    /// Bulk payout request contained no items
    #[error("payout batch must contain at least one payout")]
    EmptyBatch,
}

impl TransferError {
    /// Stable machine-readable code, used by HTTP surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::SelfTransfer => "SELF_TRANSFER",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::RecipientWalletNotFound => "RECIPIENT_WALLET_NOT_FOUND",
            Self::RateUnavailable { .. } => "RATE_UNAVAILABLE",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::ConcurrentModification => "CONCURRENT_MODIFICATION",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::TransferInProgress => "TRANSFER_IN_PROGRESS",
            Self::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
            Self::EmptyBatch => "EMPTY_BATCH",
        }
    }
}

/// Wallet store and journal errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("wallet {0} not found")]
    WalletNotFound(WalletId),

    /// Optimistic check failed: the balance is no longer the one observed.
    #[error("wallet balance changed (expected {expected}, found {actual})")]
    ConcurrentModification { expected: Decimal, actual: Decimal },

    #[error("balance would become negative")]
    NegativeBalance,

    #[error("balance overflow")]
    Overflow,

    /// A wallet lock could not be acquired within the configured timeout.
    #[error("timed out waiting for wallet lock")]
    LockTimeout,

    /// The wallet is not part of the locked transaction scope.
    #[error("wallet {0} is not locked by this transaction")]
    NotInTransaction(WalletId),

    #[error("journal record {0} not found")]
    RecordNotFound(TransactionId),

    /// Terminal journal records are immutable.
    #[error("journal record {0} is already finalized")]
    AlreadyFinalized(TransactionId),
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrentModification { .. } => TransferError::ConcurrentModification,
            StoreError::NegativeBalance => TransferError::InsufficientFunds,
            StoreError::Overflow => TransferError::InvalidAmount,
            StoreError::WalletNotFound(_)
            | StoreError::LockTimeout
            | StoreError::NotInTransaction(_)
            | StoreError::RecordNotFound(_)
            | StoreError::AlreadyFinalized(_) => TransferError::StorageUnavailable,
        }
    }
}

/// Rate provider failures. The engine reports all of them as
/// [`TransferError::RateUnavailable`].
#[derive(Error, Debug)]
pub enum RateError {
    #[error("rate provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate provider returned an error: {0}")]
    Provider(String),

    #[error("conversion rate missing from provider response")]
    MissingRate,

    #[error("conversion rate must be positive, got {0}")]
    NonPositive(Decimal),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            TransferError::InvalidAmount.to_string(),
            "invalid amount (must be positive)"
        );
        assert_eq!(
            TransferError::SelfTransfer.to_string(),
            "cannot transfer to the same wallet"
        );
        assert_eq!(
            TransferError::PermissionDenied.to_string(),
            "invalid source wallet or permission denied"
        );
        assert_eq!(
            TransferError::RecipientWalletNotFound.to_string(),
            "recipient wallet not found"
        );
        assert_eq!(
            TransferError::RateUnavailable {
                from: "NGN".parse().unwrap(),
                to: "GHS".parse().unwrap(),
            }
            .to_string(),
            "exchange rate NGN->GHS is unavailable"
        );
        assert_eq!(TransferError::InsufficientFunds.to_string(), "insufficient funds");
        assert_eq!(
            TransferError::StorageUnavailable.to_string(),
            "transfer could not be completed, please try again"
        );
    }

    #[test]
    fn store_errors_map_to_transfer_errors() {
        assert_eq!(
            TransferError::from(StoreError::NegativeBalance),
            TransferError::InsufficientFunds
        );
        assert_eq!(
            TransferError::from(StoreError::LockTimeout),
            TransferError::StorageUnavailable
        );
        assert_eq!(
            TransferError::from(StoreError::ConcurrentModification {
                expected: Decimal::ONE,
                actual: Decimal::TWO,
            }),
            TransferError::ConcurrentModification
        );
        assert_eq!(
            TransferError::from(StoreError::Overflow),
            TransferError::InvalidAmount
        );
    }

    #[test]
    fn errors_are_cloneable() {
        let error = TransferError::InsufficientFunds;
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
