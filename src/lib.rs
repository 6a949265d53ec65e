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
//! # Remit Ledger
//!
//! An atomic ledger transfer engine for a multi-currency remittance wallet.
//! Users hold one wallet per currency and move value between wallets,
//! across currencies, through a single engine that keeps every balance
//! consistent under concurrent, retried, and partially failing requests.
//!
//! ## Core Components
//!
//! - [`TransferEngine`]: validates, converts, and settles transfers atomically
//! - [`WalletStore`]: per-user, per-currency wallets and locked ledger transactions
//! - [`Journal`]: write-ahead transfer records and the idempotency index
//! - [`RateBook`]: time-boxed conversion rate cache in front of a [`RateProvider`]
//! - [`funding`]: signed payment gateway webhooks turned into wallet credits
//! - [`payouts`]: bulk business payouts
//!
//! ## Example
//!
//! ```
//! use remit_ledger::{
//!     CurrencyCode, FundingCredit, StaticRates, TransferEngine, TransferRequest, UserId,
//! };
//! use rust_decimal_macros::dec;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let ngn: CurrencyCode = "NGN".parse().unwrap();
//! let ghs: CurrencyCode = "GHS".parse().unwrap();
//! let rates = StaticRates::new().with_rate(ngn, ghs, dec!(0.0075));
//! let engine = TransferEngine::new(Arc::new(rates));
//!
//! let ada = UserId::new("ada");
//! let kofi = UserId::new("kofi");
//! engine
//!     .credit_funding(FundingCredit {
//!         user: ada.clone(),
//!         currency: ngn,
//!         amount: dec!(5000),
//!         reference: "ps_ref_1".to_string(),
//!     })
//!     .unwrap();
//! let source = engine.open_wallet(&ada, ngn);
//! let destination = engine.open_wallet(&kofi, ghs);
//!
//! let receipt = engine
//!     .transfer(&ada, TransferRequest::new(source.wallet_id, destination.wallet_id, dec!(1000)))
//!     .await
//!     .unwrap();
//! assert_eq!(receipt.credited, dec!(7.5));
//! assert_eq!(engine.wallet_balances(&ada)[0].balance, dec!(4000));
//! # });
//! ```
//!
//! ## Thread Safety
//!
//! The engine is shared behind an `Arc` by concurrent request handlers.
//! Wallets are locked in a global order for each transfer, so transfers on
//! disjoint wallets run in parallel and opposing transfers cannot deadlock.

mod base;
mod config;
pub mod engine;
pub mod error;
pub mod funding;
pub mod journal;
pub mod payouts;
pub mod rates;
pub mod store;
pub mod wallet;

pub use base::{CurrencyCode, IdempotencyKey, InvalidCurrency, TransactionId, UserId, WalletId};
pub use config::EngineConfig;
pub use engine::{FundingCredit, TransferEngine, TransferReceipt, TransferRequest, TransferResult};
pub use error::{RateError, StoreError, TransferError};
pub use journal::{Begin, EntryKind, Journal, TransferRecord, TransferStatus};
pub use payouts::{PayoutItem, PayoutOutcome, PayoutStatus};
pub use rates::{ExchangeRateApi, RateBook, RateCache, RateProvider, StaticRates};
pub use store::{LedgerTxn, WalletStore};
pub use wallet::{Wallet, WalletBalance, WalletSnapshot};
