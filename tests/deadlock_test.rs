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
//! Concurrency tests using parking_lot's built-in deadlock detector.
//!
//! These tests drive the engine from many OS threads at once and verify that
//! the wallet locking discipline neither deadlocks nor overdraws, and that
//! money is conserved.
//!
//! The dev profile enables parking_lot's `deadlock_detection` feature, so a
//! background thread can inspect the lock graph for cycles.

use futures::executor::block_on;
use parking_lot::deadlock;
use remit_ledger::{
    CurrencyCode, EngineConfig, FundingCredit, StaticRates, TransferEngine, TransferError,
    TransferRequest, UserId, WalletSnapshot,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

// === Helpers ===

fn ngn() -> CurrencyCode {
    "NGN".parse().unwrap()
}

/// Engine with a generous lock timeout so contention never exhausts retries.
fn engine() -> Arc<TransferEngine> {
    Arc::new(TransferEngine::with_config(
        Arc::new(StaticRates::new()),
        EngineConfig::default()
            .with_lock_timeout(Duration::from_secs(2))
            .with_max_retries(5),
    ))
}

fn funded(engine: &TransferEngine, name: &str, amount: Decimal) -> WalletSnapshot {
    engine
        .credit_funding(FundingCredit {
            user: UserId::new(name),
            currency: ngn(),
            amount,
            reference: format!("seed-{name}"),
        })
        .unwrap();
    engine.open_wallet(&UserId::new(name), ngn())
}

fn total(engine: &TransferEngine) -> Decimal {
    engine.wallets().all().iter().map(|w| w.balance()).sum()
}

/// Starts a background thread that checks for deadlocks.
/// Returns a handle to stop the checker.
fn start_deadlock_detector() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                panic!("Deadlock detected! See output above for details.");
            }
        }
    });

    running
}

// === Tests ===

/// N concurrent transfers of A from a balance B: exactly floor(B/A) succeed.
#[test]
fn concurrent_transfers_never_overdraw() {
    let detector = start_deadlock_detector();
    let engine = engine();
    let source = funded(&engine, "ada", dec!(100));
    let destination = engine.open_wallet(&UserId::new("bob"), ngn());

    let successes = Arc::new(AtomicU32::new(0));
    let handles: Vec<_> = (0..50)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let successes = Arc::clone(&successes);
            thread::spawn(move || {
                let request =
                    TransferRequest::new(source.wallet_id, destination.wallet_id, dec!(7));
                match block_on(engine.transfer(&UserId::new("ada"), request)) {
                    Ok(_) => {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => assert_eq!(err, TransferError::InsufficientFunds),
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    detector.store(false, Ordering::SeqCst);

    assert_eq!(successes.load(Ordering::SeqCst), 14);
    let ada = engine.wallets().wallet(&source.wallet_id).unwrap();
    let bob = engine.wallets().wallet(&destination.wallet_id).unwrap();
    assert_eq!(ada.balance(), dec!(2));
    assert_eq!(bob.balance(), dec!(98));
}

/// Opposite-direction transfers between the same two wallets must not
/// deadlock: locks are taken in wallet id order regardless of direction.
#[test]
fn opposite_direction_transfers_do_not_deadlock() {
    let detector = start_deadlock_detector();
    let engine = engine();
    let ada = funded(&engine, "ada", dec!(1000));
    let bob = funded(&engine, "bob", dec!(1000));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let (caller, from, to) = if i % 2 == 0 {
                    ("ada", ada.wallet_id, bob.wallet_id)
                } else {
                    ("bob", bob.wallet_id, ada.wallet_id)
                };
                for _ in 0..200 {
                    let request = TransferRequest::new(from, to, dec!(3.5));
                    match block_on(engine.transfer(&UserId::new(caller), request)) {
                        Ok(_) | Err(TransferError::InsufficientFunds) => {}
                        Err(err) => panic!("unexpected failure: {err}"),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    detector.store(false, Ordering::SeqCst);

    assert_eq!(total(&engine), dec!(2000));
    for wallet in engine.wallets().all() {
        assert!(wallet.balance() >= Decimal::ZERO);
    }
}

/// Transfers around a ring of wallets, each thread moving money clockwise.
#[test]
fn ring_transfers_conserve_money() {
    let detector = start_deadlock_detector();
    let engine = engine();
    let names: Vec<String> = (0..6).map(|i| format!("user-{i}")).collect();
    let wallets: Vec<WalletSnapshot> = names
        .iter()
        .map(|name| funded(&engine, name, dec!(500)))
        .collect();

    let handles: Vec<_> = (0..wallets.len())
        .map(|i| {
            let engine = Arc::clone(&engine);
            let caller = UserId::new(names[i].clone());
            let from = wallets[i].wallet_id;
            let to = wallets[(i + 1) % wallets.len()].wallet_id;
            thread::spawn(move || {
                for step in 0..300u32 {
                    let amount = Decimal::from(step % 9 + 1);
                    let request = TransferRequest::new(from, to, amount);
                    let _ = block_on(engine.transfer(&caller, request));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    detector.store(false, Ordering::SeqCst);

    assert_eq!(total(&engine), dec!(3000));
}

/// Concurrent submissions of one idempotency key execute at most once.
#[test]
fn concurrent_duplicate_keys_execute_once() {
    let detector = start_deadlock_detector();
    let engine = engine();
    let ada = funded(&engine, "ada", dec!(100));
    let bob = engine.open_wallet(&UserId::new("bob"), ngn());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let request = TransferRequest::new(ada.wallet_id, bob.wallet_id, dec!(10))
                    .with_idempotency_key("pay-once");
                block_on(engine.transfer(&UserId::new("ada"), request))
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    detector.store(false, Ordering::SeqCst);

    let ids: HashSet<_> = results
        .iter()
        .filter_map(|result| result.as_ref().ok().map(|receipt| receipt.transaction_id))
        .collect();
    assert_eq!(ids.len(), 1);
    for result in &results {
        if let Err(err) = result {
            assert_eq!(*err, TransferError::TransferInProgress);
        }
    }
    let bob = engine.wallets().wallet(&bob.wallet_id).unwrap();
    assert_eq!(bob.balance(), dec!(10));
}

/// Redelivered gateway events credit exactly once.
#[test]
fn concurrent_funding_redelivery_credits_once() {
    let detector = start_deadlock_detector();
    let engine = engine();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine.credit_funding(FundingCredit {
                    user: UserId::new("ada"),
                    currency: ngn(),
                    amount: dec!(250),
                    reference: "ps_ref_dup".to_string(),
                })
            })
        })
        .collect();
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) | Err(TransferError::TransferInProgress) => {}
            Err(err) => panic!("unexpected failure: {err}"),
        }
    }
    detector.store(false, Ordering::SeqCst);

    assert_eq!(engine.wallet_balances(&UserId::new("ada"))[0].balance, dec!(250));
}
