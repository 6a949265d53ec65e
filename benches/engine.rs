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
//! Benchmarks for the transfer engine.
//!
//! Run with: cargo bench
//!
//! Benchmarks include:
//! - Single-threaded funding and transfers
//! - Cross-currency transfers through the rate cache
//! - Parallel transfers over disjoint and shared wallets
//! - Idempotent replays

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use futures::executor::block_on;
use rayon::prelude::*;
use remit_ledger::{
    CurrencyCode, EngineConfig, FundingCredit, StaticRates, TransferEngine, TransferRequest,
    UserId, WalletId,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// =============================================================================
// Helper Functions
// =============================================================================

fn ngn() -> CurrencyCode {
    "NGN".parse().unwrap()
}

fn ghs() -> CurrencyCode {
    "GHS".parse().unwrap()
}

fn engine() -> TransferEngine {
    let rates = StaticRates::new().with_rate(ngn(), ghs(), Decimal::new(75, 4));
    TransferEngine::with_config(
        Arc::new(rates),
        EngineConfig::default().with_lock_timeout(Duration::from_secs(1)),
    )
}

static REFERENCE: AtomicU64 = AtomicU64::new(0);

fn fund(engine: &TransferEngine, user: &str, currency: CurrencyCode, amount: i64) -> WalletId {
    let reference = REFERENCE.fetch_add(1, Ordering::Relaxed);
    engine
        .credit_funding(FundingCredit {
            user: UserId::new(user),
            currency,
            amount: Decimal::new(amount, 4),
            reference: format!("bench-{reference}"),
        })
        .unwrap();
    engine.open_wallet(&UserId::new(user), currency).wallet_id
}

fn send(engine: &TransferEngine, caller: &UserId, from: WalletId, to: WalletId, amount: i64) {
    let request = TransferRequest::new(from, to, Decimal::new(amount, 4));
    let _ = block_on(engine.transfer(caller, request));
}

// =============================================================================
// Single-Threaded Benchmarks
// =============================================================================

fn bench_single_funding(c: &mut Criterion) {
    let engine = engine();
    c.bench_function("single_funding", |b| {
        b.iter(|| black_box(fund(&engine, "ada", ngn(), 10000)))
    });
}

fn bench_single_transfer(c: &mut Criterion) {
    let engine = engine();
    let ada = UserId::new("ada");
    let from = fund(&engine, "ada", ngn(), i64::MAX / 2);
    let to = engine.open_wallet(&UserId::new("bob"), ngn()).wallet_id;

    c.bench_function("single_transfer", |b| {
        b.iter(|| send(&engine, &ada, black_box(from), black_box(to), 10000))
    });
}

fn bench_cross_currency_transfer(c: &mut Criterion) {
    let engine = engine();
    let ada = UserId::new("ada");
    let from = fund(&engine, "ada", ngn(), i64::MAX / 2);
    let to = engine.open_wallet(&UserId::new("kofi"), ghs()).wallet_id;

    c.bench_function("cross_currency_transfer", |b| {
        b.iter(|| send(&engine, &ada, black_box(from), black_box(to), 1_000_000))
    });
}

fn bench_idempotent_replay(c: &mut Criterion) {
    let engine = engine();
    let ada = UserId::new("ada");
    let from = fund(&engine, "ada", ngn(), 1_000_000);
    let to = engine.open_wallet(&UserId::new("bob"), ngn()).wallet_id;
    let request = TransferRequest::new(from, to, Decimal::ONE).with_idempotency_key("replayed");
    block_on(engine.transfer(&ada, request.clone())).unwrap();

    c.bench_function("idempotent_replay", |b| {
        b.iter(|| black_box(block_on(engine.transfer(&ada, request.clone()))))
    });
}

fn bench_transfer_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer_throughput");

    for count in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let engine = engine();
                let ada = UserId::new("ada");
                let from = fund(&engine, "ada", ngn(), 1_000_000_000);
                let to = engine.open_wallet(&UserId::new("bob"), ngn()).wallet_id;
                for _ in 0..count {
                    send(&engine, &ada, from, to, 100);
                }
                black_box(&engine);
            })
        });
    }
    group.finish();
}

// =============================================================================
// Multi-Threaded Benchmarks
// =============================================================================

fn bench_parallel_disjoint_pairs(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_disjoint_pairs");

    for pairs in [10, 100, 1_000].iter() {
        let transfers_per_pair = 100;
        group.throughput(Throughput::Elements((*pairs * transfers_per_pair) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(pairs), pairs, |b, &pairs| {
            let engine = Arc::new(engine());
            let wallets: Vec<(UserId, WalletId, WalletId)> = (0..pairs)
                .map(|i| {
                    let sender = format!("sender-{i}");
                    let from = fund(&engine, &sender, ngn(), i64::MAX / 4);
                    let to = engine
                        .open_wallet(&UserId::new(format!("receiver-{i}")), ngn())
                        .wallet_id;
                    (UserId::new(sender), from, to)
                })
                .collect();

            b.iter(|| {
                wallets.par_iter().for_each(|(caller, from, to)| {
                    for _ in 0..transfers_per_pair {
                        send(&engine, caller, *from, *to, 100);
                    }
                });
            })
        });
    }
    group.finish();
}

/// Every thread debits the same wallet.
fn bench_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("contention");

    for count in [1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let engine = Arc::new(engine());
            let ada = UserId::new("ada");
            let from = fund(&engine, "ada", ngn(), i64::MAX / 2);
            let to = engine.open_wallet(&UserId::new("bob"), ngn()).wallet_id;

            b.iter(|| {
                (0..count).into_par_iter().for_each(|_| {
                    send(&engine, &ada, from, to, 100);
                });
            })
        });
    }
    group.finish();
}

/// Transfers in both directions between two wallets.
fn bench_opposing_transfers(c: &mut Criterion) {
    let engine = Arc::new(engine());
    let ada = UserId::new("ada");
    let bob = UserId::new("bob");
    let a = fund(&engine, "ada", ngn(), i64::MAX / 4);
    let b_wallet = fund(&engine, "bob", ngn(), i64::MAX / 4);

    c.bench_function("opposing_transfers_1000", |b| {
        b.iter(|| {
            (0..1_000).into_par_iter().for_each(|i| {
                if i % 2 == 0 {
                    send(&engine, &ada, a, b_wallet, 100);
                } else {
                    send(&engine, &bob, b_wallet, a, 100);
                }
            });
        })
    });
}

fn bench_wallet_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("wallet_creation");

    for count in [1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let engine = engine();
                (0..count).into_par_iter().for_each(|i| {
                    engine.open_wallet(&UserId::new(format!("user-{i}")), ngn());
                });
                black_box(engine.wallets().len());
            })
        });
    }
    group.finish();
}

// =============================================================================
// Criterion Groups
// =============================================================================

criterion_group!(
    single_threaded,
    bench_single_funding,
    bench_single_transfer,
    bench_cross_currency_transfer,
    bench_idempotent_replay,
    bench_transfer_throughput,
);

criterion_group!(
    multi_threaded,
    bench_parallel_disjoint_pairs,
    bench_contention,
    bench_opposing_transfers,
);

criterion_group!(memory, bench_wallet_creation,);

criterion_main!(single_threaded, multi_threaded, memory);
