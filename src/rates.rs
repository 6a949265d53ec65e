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

//! Currency conversion rates.
//!
//! - [`RateCache`]: time-boxed cache keyed by currency pair.
//! - [`RateProvider`]: seam for external rate lookups.
//! - [`RateBook`]: serves fresh cache hits, otherwise fetches and caches.
//!
//! Freshness is evaluated at read time: an entry written at `T` is served
//! for reads up to and including `T + ttl`; after that it is never read,
//! only overwritten by the next fetch.

use crate::base::CurrencyCode;
use crate::error::{RateError, TransferError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateCacheEntry {
    pub rate: Decimal,
    pub last_updated_at: DateTime<Utc>,
}

/// Concurrent rate cache. Writers overwrite without coordination: the last
/// writer wins.
#[derive(Debug)]
pub struct RateCache {
    entries: DashMap<(CurrencyCode, CurrencyCode), RateCacheEntry>,
    ttl: chrono::Duration,
}

impl RateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Fresh rate for the pair as of `now`, if any.
    pub fn get(
        &self,
        source: CurrencyCode,
        target: CurrencyCode,
        now: DateTime<Utc>,
    ) -> Option<Decimal> {
        let entry = self.entries.get(&(source, target))?;
        (now - entry.last_updated_at <= self.ttl).then_some(entry.rate)
    }

    /// Upserts the pair's rate, stamped with `now`.
    pub fn put(
        &self,
        source: CurrencyCode,
        target: CurrencyCode,
        rate: Decimal,
        now: DateTime<Utc>,
    ) {
        self.entries.insert(
            (source, target),
            RateCacheEntry {
                rate,
                last_updated_at: now,
            },
        );
    }

    /// Raw entry, stale or not.
    pub fn entry(&self, source: CurrencyCode, target: CurrencyCode) -> Option<RateCacheEntry> {
        self.entries.get(&(source, target)).map(|entry| *entry)
    }
}

/// External source of conversion rates.
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Units of `target` per one unit of `source`.
    async fn fetch_rate(
        &self,
        source: CurrencyCode,
        target: CurrencyCode,
    ) -> Result<Decimal, RateError>;
}

/// Fixed rate table.
#[derive(Debug, Default, Clone)]
pub struct StaticRates {
    rates: HashMap<(CurrencyCode, CurrencyCode), Decimal>,
}

impl StaticRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, source: CurrencyCode, target: CurrencyCode, rate: Decimal) -> Self {
        self.insert(source, target, rate);
        self
    }

    pub fn insert(&mut self, source: CurrencyCode, target: CurrencyCode, rate: Decimal) {
        self.rates.insert((source, target), rate);
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

#[async_trait]
impl RateProvider for StaticRates {
    async fn fetch_rate(
        &self,
        source: CurrencyCode,
        target: CurrencyCode,
    ) -> Result<Decimal, RateError> {
        self.rates
            .get(&(source, target))
            .copied()
            .ok_or_else(|| {
                RateError::Provider(format!("no rate configured for {source}->{target}"))
            })
    }
}

/// [ExchangeRate-API](https://www.exchangerate-api.com) pair endpoint client.
#[derive(Debug, Clone)]
pub struct ExchangeRateApi {
    http: Client,
    base_url: String,
    api_key: String,
}

impl ExchangeRateApi {
    pub const DEFAULT_BASE_URL: &'static str = "https://v6.exchangerate-api.com";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(api_key: impl Into<String>) -> Result<Self, RateError> {
        Self::with_base_url(Self::DEFAULT_BASE_URL, api_key)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, RateError> {
        Self::with_timeout(base_url, api_key, Self::DEFAULT_TIMEOUT)
    }

    /// Client whose requests fail with [`RateError::Http`] once `timeout`
    /// elapses without a complete response.
    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RateError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn pair_url(&self, source: CurrencyCode, target: CurrencyCode) -> String {
        format!(
            "{}/v6/{}/pair/{}/{}",
            self.base_url, self.api_key, source, target
        )
    }
}

#[async_trait]
impl RateProvider for ExchangeRateApi {
    async fn fetch_rate(
        &self,
        source: CurrencyCode,
        target: CurrencyCode,
    ) -> Result<Decimal, RateError> {
        let response = self
            .http
            .get(self.pair_url(source, target))
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        parse_pair_response(&body)
    }
}

/// Extracts `conversion_rate` from a pair response without a round trip
/// through binary floating point.
fn parse_pair_response(body: &serde_json::Value) -> Result<Decimal, RateError> {
    if let Some(result) = body.get("result").and_then(|value| value.as_str()) {
        if result != "success" {
            let kind = body
                .get("error-type")
                .and_then(|value| value.as_str())
                .unwrap_or(result);
            return Err(RateError::Provider(kind.to_string()));
        }
    }

    let raw = match body.get("conversion_rate") {
        Some(serde_json::Value::Number(number)) => number.to_string(),
        Some(serde_json::Value::String(text)) => text.clone(),
        _ => return Err(RateError::MissingRate),
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| RateError::MissingRate)
}

/// Rate cache in front of a provider.
pub struct RateBook {
    cache: RateCache,
    provider: Arc<dyn RateProvider>,
}

impl RateBook {
    pub fn new(provider: Arc<dyn RateProvider>, ttl: Duration) -> Self {
        Self {
            cache: RateCache::new(ttl),
            provider,
        }
    }

    pub fn cache(&self) -> &RateCache {
        &self.cache
    }

    /// Current rate for the pair.
    ///
    /// # Errors
    ///
    /// [`TransferError::RateUnavailable`] when the cache has no fresh entry
    /// and the provider fails or returns a non-positive rate.
    pub async fn rate(
        &self,
        source: CurrencyCode,
        target: CurrencyCode,
    ) -> Result<Decimal, TransferError> {
        self.rate_at(source, target, Utc::now()).await
    }

    /// [`rate`](Self::rate) evaluated at an explicit instant.
    pub async fn rate_at(
        &self,
        source: CurrencyCode,
        target: CurrencyCode,
        now: DateTime<Utc>,
    ) -> Result<Decimal, TransferError> {
        if source == target {
            return Ok(Decimal::ONE);
        }
        if let Some(rate) = self.cache.get(source, target, now) {
            debug!(%source, %target, %rate, "rate cache hit");
            return Ok(rate);
        }

        debug!(%source, %target, "rate cache miss, fetching from provider");
        let unavailable = TransferError::RateUnavailable {
            from: source,
            to: target,
        };
        let rate = match self.provider.fetch_rate(source, target).await {
            Ok(rate) if rate > Decimal::ZERO => rate,
            Ok(rate) => {
                warn!(
                    %source,
                    %target,
                    error = %RateError::NonPositive(rate),
                    "rejected provider rate"
                );
                return Err(unavailable);
            }
            Err(err) => {
                warn!(%source, %target, error = %err, "rate provider failed");
                return Err(unavailable);
            }
        };

        self.cache.put(source, target, rate, now);
        Ok(rate)
    }
}
