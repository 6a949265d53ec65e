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

//! Payment gateway funding events.
//!
//! The gateway signs each webhook body with HMAC-SHA512 under the merchant
//! secret and sends the hex digest in a header. Only verified
//! `charge.success` events turn into [`FundingCredit`]s.

use crate::base::{CurrencyCode, UserId};
use crate::engine::FundingCredit;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha512;
use thiserror::Error;

type HmacSha512 = Hmac<Sha512>;

/// Header carrying the hex-encoded body signature.
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is not valid hex")]
    InvalidFormat,
    #[error("webhook secret is not usable as an HMAC key")]
    InvalidSecret,
    #[error("signature does not match body")]
    Mismatch,
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("malformed gateway event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Currency(#[from] crate::base::InvalidCurrency),
}

/// Checks `signature_hex` against the HMAC-SHA512 of `body`.
///
/// The digest comparison is constant time.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    signature_hex: &str,
) -> Result<(), SignatureError> {
    let expected = hex::decode(signature_hex.trim()).map_err(|_| SignatureError::InvalidFormat)?;
    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
}

/// Hex signature of `body`, as the gateway computes it.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawCharge {
    reference: String,
    /// Minor units (kobo, pesewas, cents).
    amount: i64,
    currency: String,
    customer: RawCustomer,
}

#[derive(Debug, Deserialize)]
struct RawCustomer {
    email: String,
}

/// A successful charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeSuccess {
    pub reference: String,
    /// Major units.
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub customer_email: String,
}

impl ChargeSuccess {
    /// Credit for `user`, the account resolved from the customer email.
    pub fn into_credit(self, user: UserId) -> FundingCredit {
        FundingCredit {
            user,
            currency: self.currency,
            amount: self.amount,
            reference: self.reference,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    ChargeSuccess(ChargeSuccess),
    /// Any other event type; acknowledged and not acted on.
    Ignored(String),
}

impl GatewayEvent {
    pub const CHARGE_SUCCESS: &'static str = "charge.success";

    /// Parses a verified webhook body.
    pub fn parse(body: &[u8]) -> Result<Self, EventError> {
        let raw: RawEvent = serde_json::from_slice(body)?;
        if raw.event != Self::CHARGE_SUCCESS {
            return Ok(Self::Ignored(raw.event));
        }
        let charge: RawCharge = serde_json::from_value(raw.data)?;
        Ok(Self::ChargeSuccess(ChargeSuccess {
            reference: charge.reference,
            amount: Decimal::new(charge.amount, 2),
            currency: charge.currency.parse()?,
            customer_email: charge.customer.email,
        }))
    }
}
