//! Concurrency tests for the transfer transaction
//!
//! Many tasks hit the same pair of accounts at once. Results come back over
//! a channel; each task owns only its own result.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use bank_ledger::{Account, LedgerError, Store, TransferTxParams, TransferTxResult};
use tokio::sync::mpsc;

use common::{balance_of, create_random_account, setup_store};

/// Spawn one task per params and fan the results back in
async fn run_concurrent(
    store: &Store,
    transfers: Vec<TransferTxParams>,
) -> Vec<Result<TransferTxResult, LedgerError>> {
    let n = transfers.len();
    let (tx, mut rx) = mpsc::channel(n);

    for params in transfers {
        let store = store.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = store.transfer_tx(params).await;
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    let mut results = Vec::with_capacity(n);
    while let Some(result) = rx.recv().await {
        results.push(result);
    }
    assert_eq!(results.len(), n, "every worker should report back");
    results
}

fn assert_result_matches(
    result: &TransferTxResult,
    sender: &Account,
    receiver: &Account,
    amount: i64,
) {
    let transfer = &result.transfer;
    assert_eq!(transfer.from_account_id, sender.id);
    assert_eq!(transfer.to_account_id, receiver.id);
    assert_eq!(transfer.amount, amount);
    assert!(transfer.id > 0);

    assert_eq!(result.from_entry.account_id, sender.id);
    assert_eq!(result.from_entry.amount, -amount);
    assert!(result.from_entry.id > 0);

    assert_eq!(result.to_entry.account_id, receiver.id);
    assert_eq!(result.to_entry.amount, amount);
    assert!(result.to_entry.id > 0);

    assert_eq!(result.from_account.id, sender.id);
    assert_eq!(result.to_account.id, receiver.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL database"]
async fn test_concurrent_transfers_same_direction() {
    let store = setup_store().await;
    let sender = create_random_account(&store).await;
    let receiver = create_random_account(&store).await;

    let n: i64 = 5;
    let amount: i64 = 10;

    let params = TransferTxParams::new(sender.id, receiver.id, amount);
    let results = run_concurrent(&store, vec![params; n as usize]).await;

    let mut existed = HashSet::new();
    for result in results {
        let result = result.expect("concurrent transfer should succeed");
        assert_result_matches(&result, &sender, &receiver, amount);

        // Everything the transaction wrote is readable after commit
        let transfer = store.get_transfer(result.transfer.id).await.unwrap();
        assert_eq!(transfer.as_ref(), Some(&result.transfer));
        let from_entry = store.get_entry(result.from_entry.id).await.unwrap();
        assert_eq!(from_entry.as_ref(), Some(&result.from_entry));
        let to_entry = store.get_entry(result.to_entry.id).await.unwrap();
        assert_eq!(to_entry.as_ref(), Some(&result.to_entry));

        // Each transaction saw a distinct post-balance: k transfers applied
        let sender_diff = sender.balance - result.from_account.balance;
        let receiver_diff = result.to_account.balance - receiver.balance;
        assert_eq!(sender_diff, receiver_diff);
        assert!(sender_diff > 0);
        assert_eq!(sender_diff % amount, 0);

        let k = sender_diff / amount;
        assert!((1..=n).contains(&k), "k = {k} out of range");
        assert!(existed.insert(k), "k = {k} observed twice: lost update");
    }

    assert_eq!(balance_of(&store, &sender).await, sender.balance - n * amount);
    assert_eq!(
        balance_of(&store, &receiver).await,
        receiver.balance + n * amount
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL database"]
async fn test_concurrent_transfers_opposite_directions() {
    let store = setup_store().await;
    let first = create_random_account(&store).await;
    let second = create_random_account(&store).await;

    let n = 10;
    let amount = 10;

    let transfers = (0..n)
        .map(|i| {
            if i % 2 == 1 {
                TransferTxParams::new(second.id, first.id, amount)
            } else {
                TransferTxParams::new(first.id, second.id, amount)
            }
        })
        .collect();

    // PostgreSQL aborts one side of a deadlock after deadlock_timeout, so a
    // deadlock shows up as an error; the outer timeout catches a hang.
    let results = tokio::time::timeout(Duration::from_secs(30), run_concurrent(&store, transfers))
        .await
        .expect("opposite-direction transfers should not hang");

    for result in results {
        if let Err(e) = result {
            panic!("transfer failed ({}): {e}", e.code());
        }
    }

    assert_eq!(balance_of(&store, &first).await, first.balance);
    assert_eq!(balance_of(&store, &second).await, second.balance);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL database"]
async fn test_concurrent_transfers_across_many_pairs() {
    let store = setup_store().await;
    let mut accounts = Vec::new();
    for _ in 0..4 {
        accounts.push(create_random_account(&store).await);
    }

    // Every ordered pair in both directions, twice over
    let amount = 7;
    let mut transfers = Vec::new();
    for _ in 0..2 {
        for from in &accounts {
            for to in &accounts {
                if from.id != to.id {
                    transfers.push(TransferTxParams::new(from.id, to.id, amount));
                }
            }
        }
    }

    let results = tokio::time::timeout(Duration::from_secs(60), run_concurrent(&store, transfers))
        .await
        .expect("transfers should not hang");
    assert!(results.iter().all(Result::is_ok));

    // Each account sent and received the same total
    for account in &accounts {
        assert_eq!(balance_of(&store, account).await, account.balance);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL database"]
async fn test_concurrent_overdraft_is_refused() {
    let store = setup_store().await;
    let sender = store.create_account(50).await.unwrap();
    let receiver = create_random_account(&store).await;

    let amount = 10;
    let params = TransferTxParams::new(sender.id, receiver.id, amount);
    let results = run_concurrent(&store, vec![params; 8]).await;

    let succeeded = results.iter().filter(|r| r.is_ok()).count() as i64;
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
        .count() as i64;

    assert_eq!(succeeded, 5, "only the funded transfers go through");
    assert_eq!(refused, 3);
    assert_eq!(balance_of(&store, &sender).await, 0);
    assert_eq!(
        balance_of(&store, &receiver).await,
        receiver.balance + succeeded * amount
    );
}
