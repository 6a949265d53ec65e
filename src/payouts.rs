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

//! Bulk business payouts.
//!
//! A batch is a list of same-currency transfers out of the business's
//! wallets. Items run in order and independently: one failing item does not
//! stop the batch or undo earlier items.

use crate::base::{CurrencyCode, TransactionId, UserId};
use crate::engine::{TransferEngine, TransferRequest};
use crate::error::TransferError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PayoutItem {
    pub recipient: UserId,
    pub amount: Decimal,
    pub currency: CurrencyCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PayoutOutcome {
    pub recipient: UserId,
    pub status: PayoutStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PayoutOutcome {
    fn from_result(recipient: UserId, result: Result<TransactionId, TransferError>) -> Self {
        match result {
            Ok(id) => Self {
                recipient,
                status: PayoutStatus::Success,
                transaction_id: Some(id),
                reason: None,
            },
            Err(err) => Self {
                recipient,
                status: PayoutStatus::Failed,
                transaction_id: None,
                reason: Some(err.to_string()),
            },
        }
    }
}

impl TransferEngine {
    /// Pays every item from `business`'s wallet in the item's currency.
    ///
    /// With a `batch_key`, item `i` is submitted under idempotency key
    /// `"{batch_key}:{i}"`, so resubmitting the batch replays finished items
    /// instead of paying them twice.
    ///
    /// # Errors
    ///
    /// [`TransferError::EmptyBatch`] when `items` is empty. Per-item failures
    /// are reported in the returned outcomes.
    pub async fn payout_batch(
        &self,
        business: &UserId,
        items: &[PayoutItem],
        batch_key: Option<&str>,
    ) -> Result<Vec<PayoutOutcome>, TransferError> {
        if items.is_empty() {
            return Err(TransferError::EmptyBatch);
        }

        let mut outcomes = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let key = batch_key.map(|batch| format!("{batch}:{index}"));
            let result = self.payout_one(business, item, key).await;
            outcomes.push(PayoutOutcome::from_result(item.recipient.clone(), result));
        }

        let paid = outcomes
            .iter()
            .filter(|outcome| outcome.status == PayoutStatus::Success)
            .count();
        info!(business = %business, items = items.len(), paid, "payout batch processed");
        Ok(outcomes)
    }

    async fn payout_one(
        &self,
        business: &UserId,
        item: &PayoutItem,
        key: Option<String>,
    ) -> Result<TransactionId, TransferError> {
        let source = self
            .wallets()
            .get_wallet(business, item.currency)
            .ok_or(TransferError::PermissionDenied)?;
        let destination = self
            .wallets()
            .get_wallet(&item.recipient, item.currency)
            .ok_or(TransferError::RecipientWalletNotFound)?;

        let mut request = TransferRequest::new(source.id(), destination.id(), item.amount);
        if let Some(key) = key {
            request = request.with_idempotency_key(key);
        }
        let receipt = self.transfer(business, request).await?;
        Ok(receipt.transaction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FundingCredit;
    use crate::rates::StaticRates;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn ngn() -> CurrencyCode {
        "NGN".parse().unwrap()
    }

    fn engine_with_business(balance: Decimal) -> TransferEngine {
        let engine = TransferEngine::new(Arc::new(StaticRates::new()));
        engine
            .credit_funding(FundingCredit {
                user: UserId::new("acme"),
                currency: ngn(),
                amount: balance,
                reference: "seed".to_string(),
            })
            .unwrap();
        engine
    }

    fn item(recipient: &str, amount: Decimal) -> PayoutItem {
        PayoutItem {
            recipient: UserId::new(recipient),
            amount,
            currency: ngn(),
        }
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let engine = engine_with_business(dec!(100));
        assert_eq!(
            engine.payout_batch(&UserId::new("acme"), &[], None).await,
            Err(TransferError::EmptyBatch)
        );
    }

    #[tokio::test]
    async fn items_fail_independently() {
        let engine = engine_with_business(dec!(100));
        engine.open_wallet(&UserId::new("ada"), ngn());
        engine.open_wallet(&UserId::new("kofi"), ngn());

        let items = [
            item("ada", dec!(60)),
            item("ghost", dec!(10)),
            item("kofi", dec!(60)),
            item("kofi", dec!(40)),
        ];
        let outcomes = engine
            .payout_batch(&UserId::new("acme"), &items, None)
            .await
            .unwrap();

        let statuses: Vec<PayoutStatus> = outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![
                PayoutStatus::Success,
                PayoutStatus::Failed,
                PayoutStatus::Failed,
                PayoutStatus::Success,
            ]
        );
        assert_eq!(outcomes[1].reason.as_deref(), Some("recipient wallet not found"));
        assert_eq!(outcomes[2].reason.as_deref(), Some("insufficient funds"));
        assert_eq!(
            engine.wallet_balances(&UserId::new("acme"))[0].balance,
            dec!(0)
        );
    }

    #[tokio::test]
    async fn resubmitted_batch_is_not_paid_twice() {
        let engine = engine_with_business(dec!(100));
        engine.open_wallet(&UserId::new("ada"), ngn());
        let items = [item("ada", dec!(30))];

        let first = engine
            .payout_batch(&UserId::new("acme"), &items, Some("batch-7"))
            .await
            .unwrap();
        let second = engine
            .payout_batch(&UserId::new("acme"), &items, Some("batch-7"))
            .await
            .unwrap();

        assert_eq!(first[0].transaction_id, second[0].transaction_id);
        assert_eq!(
            engine.wallet_balances(&UserId::new("ada"))[0].balance,
            dec!(30)
        );
    }

    #[tokio::test]
    async fn resubmitted_batch_with_changed_amount_is_rejected() {
        let engine = engine_with_business(dec!(100));
        engine.open_wallet(&UserId::new("ada"), ngn());
        let acme = UserId::new("acme");

        engine
            .payout_batch(&acme, &[item("ada", dec!(30))], Some("batch-8"))
            .await
            .unwrap();
        let changed = engine
            .payout_batch(&acme, &[item("ada", dec!(60))], Some("batch-8"))
            .await
            .unwrap();

        assert_eq!(changed[0].status, PayoutStatus::Failed);
        assert_eq!(
            changed[0].reason.as_deref(),
            Some("idempotency key was already used for a different request")
        );
        assert_eq!(engine.wallet_balances(&UserId::new("ada"))[0].balance, dec!(30));
    }

    #[tokio::test]
    async fn business_without_wallet_in_currency_is_denied() {
        let engine = engine_with_business(dec!(100));
        engine.open_wallet(&UserId::new("ada"), "GHS".parse().unwrap());
        let items = [PayoutItem {
            recipient: UserId::new("ada"),
            amount: dec!(5),
            currency: "GHS".parse().unwrap(),
        }];

        let outcomes = engine
            .payout_batch(&UserId::new("acme"), &items, None)
            .await
            .unwrap();
        assert_eq!(outcomes[0].status, PayoutStatus::Failed);
        assert_eq!(
            outcomes[0].reason.as_deref(),
            Some("invalid source wallet or permission denied")
        );
    }
}
