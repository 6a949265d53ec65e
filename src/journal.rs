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

//! Append-only transfer journal with idempotency index.
//!
//! Records follow a one-way state machine:
//!
//! ```text
//!  Pending ──complete──► Completed
//!     │
//!     └─────fail───────► Failed
//! ```
//!
//! A record is written as `Pending` before any balance is touched, and is
//! never removed.

use crate::base::{CurrencyCode, IdempotencyKey, TransactionId, UserId, WalletId};
use crate::error::{StoreError, TransferError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Wallet-to-wallet transfer.
    Transfer,
    /// One-sided credit from an external funding source.
    Funding,
}

/// A journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    pub transaction_id: TransactionId,
    /// Journal insertion order.
    pub seq: u64,
    pub kind: EntryKind,
    pub initiated_by: UserId,
    /// `None` for external funding.
    pub source_wallet_id: Option<WalletId>,
    pub destination_wallet_id: WalletId,
    /// Debited amount, in the source currency.
    pub amount: Decimal,
    pub source_currency: Option<CurrencyCode>,
    pub destination_currency: Option<CurrencyCode>,
    /// Credited amount, in the destination currency. Set on completion.
    pub credited_amount: Option<Decimal>,
    /// Conversion rate applied, for cross-currency transfers.
    pub rate: Option<Decimal>,
    pub idempotency_key: Option<IdempotencyKey>,
    /// Payment gateway reference for funding credits.
    pub external_reference: Option<String>,
    pub status: TransferStatus,
    pub failure_reason: Option<String>,
    #[serde(skip)]
    pub failure: Option<TransferError>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransferRecord {
    /// New pending transfer entry.
    pub fn transfer(
        initiated_by: UserId,
        source_wallet_id: WalletId,
        destination_wallet_id: WalletId,
        amount: Decimal,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Self {
        Self {
            transaction_id: TransactionId::new(),
            seq: 0,
            kind: EntryKind::Transfer,
            initiated_by,
            source_wallet_id: Some(source_wallet_id),
            destination_wallet_id,
            amount,
            source_currency: None,
            destination_currency: None,
            credited_amount: None,
            rate: None,
            idempotency_key,
            external_reference: None,
            status: TransferStatus::Pending,
            failure_reason: None,
            failure: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// New pending funding entry, keyed by the gateway reference.
    pub fn funding(
        user: UserId,
        destination_wallet_id: WalletId,
        currency: CurrencyCode,
        amount: Decimal,
        reference: String,
    ) -> Self {
        let mut record = Self::transfer(
            user,
            destination_wallet_id,
            destination_wallet_id,
            amount,
            Some(IdempotencyKey::new(reference.clone())),
        );
        record.kind = EntryKind::Funding;
        record.source_wallet_id = None;
        record.destination_currency = Some(currency);
        record.external_reference = Some(reference);
        record
    }

    /// Whether `other` asks for the same movement of funds as this record.
    pub fn same_request(&self, other: &TransferRecord) -> bool {
        self.kind == other.kind
            && self.initiated_by == other.initiated_by
            && self.source_wallet_id == other.source_wallet_id
            && self.destination_wallet_id == other.destination_wallet_id
            && self.amount == other.amount
    }

    fn key_slot(&self) -> Option<KeySlot> {
        let key = self.idempotency_key.clone()?;
        Some((self.initiated_by.clone(), self.kind, key))
    }
}

/// Idempotency keys are scoped per initiating user and per entry kind, so a
/// transfer key can never answer for a funding reference or the reverse.
type KeySlot = (UserId, EntryKind, IdempotencyKey);

/// Outcome of [`Journal::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// A new pending record was written.
    Fresh(TransactionId),
    /// The idempotency key already has a terminal record.
    Replay(Box<TransferRecord>),
    /// The idempotency key belongs to an attempt that is still pending.
    InFlight(TransactionId),
    /// The idempotency key is bound to a record for a different request.
    Conflict(TransactionId),
}

/// Thread-safe append-only journal.
///
/// Records live in a [`DashMap`] for O(1) lookup; an atomic counter assigns
/// the insertion sequence used for ordered listing.
#[derive(Debug, Default)]
pub struct Journal {
    records: DashMap<TransactionId, TransferRecord>,
    keys: DashMap<KeySlot, TransactionId>,
    next_seq: AtomicU64,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a pending record, claiming its idempotency key if it has one.
    ///
    /// Key claim and record insertion happen under the key's map entry, so
    /// two concurrent attempts with the same key cannot both start.
    pub fn begin(&self, mut record: TransferRecord) -> Begin {
        record.status = TransferStatus::Pending;
        record.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let id = record.transaction_id;

        let Some(slot) = record.key_slot() else {
            self.records.insert(id, record);
            return Begin::Fresh(id);
        };

        match self.keys.entry(slot) {
            Entry::Occupied(entry) => {
                let existing = *entry.get();
                match self.records.get(&existing) {
                    Some(prior) if !prior.same_request(&record) => Begin::Conflict(existing),
                    Some(prior) if prior.status.is_terminal() => {
                        Begin::Replay(Box::new(prior.value().clone()))
                    }
                    _ => Begin::InFlight(existing),
                }
            }
            Entry::Vacant(entry) => {
                self.records.insert(id, record);
                entry.insert(id);
                Begin::Fresh(id)
            }
        }
    }

    /// Stamps the currencies of a pending record once its wallets are known.
    pub fn record_currencies(
        &self,
        id: &TransactionId,
        source: CurrencyCode,
        destination: CurrencyCode,
    ) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or(StoreError::RecordNotFound(*id))?;
        if record.status.is_terminal() {
            return Err(StoreError::AlreadyFinalized(*id));
        }
        record.source_currency = Some(source);
        record.destination_currency = Some(destination);
        Ok(())
    }

    /// Marks a pending record completed.
    pub fn complete(
        &self,
        id: &TransactionId,
        credited_amount: Decimal,
        rate: Option<Decimal>,
    ) -> Result<TransferRecord, StoreError> {
        self.finalize(id, |record| {
            record.status = TransferStatus::Completed;
            record.credited_amount = Some(credited_amount);
            record.rate = rate;
        })
    }

    /// Marks a pending record failed with `reason`.
    pub fn fail(
        &self,
        id: &TransactionId,
        reason: TransferError,
    ) -> Result<TransferRecord, StoreError> {
        self.finalize(id, |record| {
            record.status = TransferStatus::Failed;
            record.failure_reason = Some(reason.to_string());
            record.failure = Some(reason);
        })
    }

    fn finalize(
        &self,
        id: &TransactionId,
        apply: impl FnOnce(&mut TransferRecord),
    ) -> Result<TransferRecord, StoreError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or(StoreError::RecordNotFound(*id))?;
        if record.status.is_terminal() {
            return Err(StoreError::AlreadyFinalized(*id));
        }
        apply(&mut record);
        record.completed_at = Some(Utc::now());
        Ok(record.clone())
    }

    /// Drops the key claim held by `id`, letting the caller retry with the
    /// same key. The pending record itself stays in the journal.
    pub fn release_key(&self, id: &TransactionId) {
        let Some(slot) = self.records.get(id).and_then(|record| record.key_slot()) else {
            return;
        };
        self.keys.remove_if(&slot, |_, claimed| claimed == id);
    }

    pub fn get(&self, id: &TransactionId) -> Option<TransferRecord> {
        self.records.get(id).map(|record| record.value().clone())
    }

    /// Record currently bound to an idempotency key.
    pub fn by_key(
        &self,
        initiated_by: &UserId,
        kind: EntryKind,
        key: &IdempotencyKey,
    ) -> Option<TransferRecord> {
        let id = *self.keys.get(&(initiated_by.clone(), kind, key.clone()))?;
        self.get(&id)
    }

    /// All records in insertion order.
    pub fn records(&self) -> Vec<TransferRecord> {
        let mut records: Vec<TransferRecord> = self
            .records
            .iter()
            .map(|record| record.value().clone())
            .collect();
        records.sort_by_key(|record| record.seq);
        records
    }

    /// Records that have not reached a terminal state, oldest first.
    pub fn pending(&self) -> Vec<TransferRecord> {
        let mut pending: Vec<TransferRecord> = self
            .records
            .iter()
            .filter(|record| record.status == TransferStatus::Pending)
            .map(|record| record.value().clone())
            .collect();
        pending.sort_by_key(|record| record.seq);
        pending
    }

    /// Fails every pending record created before `cutoff`.
    ///
    /// Completion and the balance commit share one locked scope, so a record
    /// still pending has no balance effect and can be closed as abandoned.
    /// Returns the ids that were closed.
    pub fn reconcile_pending(&self, cutoff: DateTime<Utc>) -> Vec<TransactionId> {
        let stale: Vec<TransactionId> = self
            .pending()
            .into_iter()
            .filter(|record| record.created_at < cutoff)
            .map(|record| record.transaction_id)
            .collect();

        stale
            .into_iter()
            .filter(|id| self.fail(id, TransferError::StorageUnavailable).is_ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
