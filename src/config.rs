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

//! Engine tunables.

use crate::error::RateError;
use crate::rates::ExchangeRateApi;
use std::time::Duration;

/// Runtime configuration for [`TransferEngine`](crate::TransferEngine).
///
/// | Setting | Default | Meaning |
/// |---------|---------|---------|
/// | `rate_ttl` | 5 minutes | How long a cached conversion rate stays fresh |
/// | `lock_timeout` | 250 ms | Bounded wait for each wallet lock acquisition |
/// | `max_retries` | 3 | Attempts on lock contention or concurrent modification |
/// | `rate_fetch_timeout` | 10 s | Request timeout for HTTP rate providers |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub rate_ttl: Duration,
    pub lock_timeout: Duration,
    pub max_retries: u32,
    pub rate_fetch_timeout: Duration,
}

impl EngineConfig {
    pub const DEFAULT_RATE_TTL: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(250);
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_RATE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn with_rate_ttl(mut self, rate_ttl: Duration) -> Self {
        self.rate_ttl = rate_ttl;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Sets the attempt budget. Zero is treated as a single attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_rate_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.rate_fetch_timeout = timeout;
        self
    }

    /// [`ExchangeRateApi`] client bounded by `rate_fetch_timeout`.
    pub fn exchange_rate_api(
        &self,
        api_key: impl Into<String>,
    ) -> Result<ExchangeRateApi, RateError> {
        ExchangeRateApi::with_timeout(
            ExchangeRateApi::DEFAULT_BASE_URL,
            api_key,
            self.rate_fetch_timeout,
        )
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_ttl: Self::DEFAULT_RATE_TTL,
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            rate_fetch_timeout: Self::DEFAULT_RATE_FETCH_TIMEOUT,
        }
    }
}
