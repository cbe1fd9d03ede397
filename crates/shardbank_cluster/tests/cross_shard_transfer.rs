//! End-to-end transfers through `ShardBank` without crashes.

mod common;

use common::*;
use shardbank_common::error::{BankError, StorageError};
use shardbank_common::types::ShardId;
use shardbank_cluster::{ShardOp, ShardBank};

#[test]
fn test_cross_shard_transfer_moves_funds() {
    let bank = open_bank(2);
    let alice = name_on_shard(&bank, 0, "alice");
    let bob = name_on_shard(&bank, 1, "bob");
    bank.new_account(&alice, 100).unwrap();
    bank.new_account(&bob, 50).unwrap();

    let receipt = bank.transfer(&alice, &bob, 30).unwrap();
    assert!(receipt.finalized);
    assert_eq!(receipt.branches.len(), 2);
    assert_eq!(receipt.branches[0].shard_id, ShardId(1));
    assert_eq!(receipt.branches[1].shard_id, ShardId(0));
    assert!(receipt.branches.iter().all(|b| b.txn_id == receipt.txn_id));

    assert_eq!(bank.balance(&alice).unwrap(), 70);
    assert_eq!(bank.balance(&bob).unwrap(), 80);
    assert_eq!(bank.total_liabilities().unwrap(), 150);
    assert!(bank.intent_log().is_empty());
    assert_eq!(prepared_total(&bank), 0);
}

#[test]
fn test_insufficient_funds_changes_nothing() {
    let bank = open_bank(2);
    let alice = name_on_shard(&bank, 0, "alice");
    let bob = name_on_shard(&bank, 1, "bob");
    bank.new_account(&alice, 20).unwrap();
    bank.new_account(&bob, 50).unwrap();

    let err = bank.transfer(&alice, &bob, 30).unwrap_err();
    assert!(matches!(
        err,
        BankError::PrepareFailure {
            shard: ShardId(0),
            source: StorageError::InsufficientFunds { .. },
            ..
        }
    ));
    assert!(err.is_user_error());
    assert_eq!(bank.balance(&alice).unwrap(), 20);
    assert_eq!(bank.balance(&bob).unwrap(), 50);
    assert_eq!(prepared_total(&bank), 0);
    assert!(bank.intent_log().is_empty());
    assert_eq!(bank.coordinator().total_aborted(), 1);
}

#[test]
fn test_unknown_destination_aborts() {
    let bank = open_bank(2);
    let alice = name_on_shard(&bank, 0, "alice");
    bank.new_account(&alice, 100).unwrap();
    let err = bank.transfer(&alice, "nobody", 10).unwrap_err();
    assert!(matches!(
        err,
        BankError::PrepareFailure { source: StorageError::AccountNotFound(_), .. }
    ));
    assert_eq!(bank.balance(&alice).unwrap(), 100);
    assert_eq!(prepared_total(&bank), 0);
}

#[test]
fn test_many_transfers_conserve_total() {
    let bank = open_bank(4);
    let names: Vec<String> = (0..8).map(|i| format!("acct{}", i)).collect();
    for name in &names {
        bank.new_account(name, 1_000).unwrap();
    }
    for i in 0..40 {
        let from = &names[i % names.len()];
        let to = &names[(i * 3 + 1) % names.len()];
        if from == to {
            continue;
        }
        bank.transfer(from, to, (i as i64 % 7) + 1).unwrap();
    }
    assert_eq!(bank.total_liabilities().unwrap(), 8_000);
    assert!(bank.intent_log().is_empty());
    assert_eq!(prepared_total(&bank), 0);
}

#[test]
fn test_same_shard_transfer_single_branch() {
    let bank = open_bank(2);
    let a = name_on_shard(&bank, 1, "carol");
    let b = name_on_shard(&bank, 1, "dave");
    bank.new_account(&a, 40).unwrap();
    bank.new_account(&b, 0).unwrap();

    let receipt = bank.transfer(&a, &b, 40).unwrap();
    assert_eq!(receipt.branches.len(), 1);
    assert_eq!(receipt.branches[0].shard_id, ShardId(1));
    assert_eq!(bank.balance(&a).unwrap(), 0);
    assert_eq!(bank.balance(&b).unwrap(), 40);
}

#[test]
fn test_policy_rejections() {
    let bank = open_bank(2);
    bank.new_account("alice", 10).unwrap();
    bank.new_account("bob", 10).unwrap();
    for amount in [0, -1] {
        let err = bank.transfer("alice", "bob", amount).unwrap_err();
        assert!(matches!(err, BankError::InvalidTransfer(_)));
    }
    assert!(matches!(
        bank.transfer("alice", "alice", 1).unwrap_err(),
        BankError::InvalidTransfer(_)
    ));
    assert_eq!(bank.intent_log().commits(), 0);
    assert_eq!(bank.total_liabilities().unwrap(), 20);
}

#[test]
fn test_source_prepare_failure_rolls_back_destination() {
    let (bank, faults) = open_faulty(test_config(2));
    let alice = name_on_shard(&bank, 0, "alice");
    let bob = name_on_shard(&bank, 1, "bob");
    bank.new_account(&alice, 100).unwrap();
    bank.new_account(&bob, 50).unwrap();

    faults.fail_next(ShardId(0), ShardOp::Prepare, 1);
    let err = bank.transfer(&alice, &bob, 30).unwrap_err();
    assert!(matches!(
        err,
        BankError::PrepareFailure { shard: ShardId(0), source: StorageError::Unavailable(_), .. }
    ));
    assert_eq!(prepared_total(&bank), 0);
    assert_eq!(bank.balance(&bob).unwrap(), 50);

    // The next attempt goes through.
    bank.transfer(&alice, &bob, 30).unwrap();
    assert_eq!(bank.balance(&bob).unwrap(), 80);
}

#[test]
fn test_lost_prepare_reply_rolls_back_both_branches() {
    let (bank, faults) = open_faulty(test_config(2));
    let alice = name_on_shard(&bank, 0, "alice");
    let bob = name_on_shard(&bank, 1, "bob");
    bank.new_account(&alice, 100).unwrap();
    bank.new_account(&bob, 50).unwrap();

    // Shard 0 prepares the debit but the coordinator never hears back.
    faults.lose_reply(ShardId(0), ShardOp::Prepare, 1);
    let err = bank.transfer(&alice, &bob, 30).unwrap_err();
    assert!(matches!(
        err,
        BankError::PrepareFailure { shard: ShardId(0), source: StorageError::Unavailable(_), .. }
    ));
    assert_eq!(faults.faults_fired(), 1);
    assert_eq!(prepared_total(&bank), 0);
    assert!(bank.intent_log().is_empty());
    assert_eq!(bank.balance(&alice).unwrap(), 100);
    assert_eq!(bank.balance(&bob).unwrap(), 50);

    // The rows the lost branch held are free again.
    bank.transfer(&alice, &bob, 30).unwrap();
    assert_eq!(bank.balance(&alice).unwrap(), 70);
}

#[test]
fn test_lost_commit_reply_is_retried_to_already_committed() {
    let (bank, faults) = open_faulty(test_config(2));
    let alice = name_on_shard(&bank, 0, "alice");
    let bob = name_on_shard(&bank, 1, "bob");
    bank.new_account(&alice, 100).unwrap();
    bank.new_account(&bob, 50).unwrap();

    faults.lose_reply(ShardId(1), ShardOp::CommitPrepared, 1);
    let receipt = bank.transfer(&alice, &bob, 30).unwrap();
    assert!(receipt.finalized);
    assert_eq!(bank.balance(&alice).unwrap(), 70);
    assert_eq!(bank.balance(&bob).unwrap(), 80);
    assert_eq!(bank.sweeper().metrics().retries, 1);
    assert!(bank.intent_log().is_empty());
}

#[test]
fn test_intent_log_write_failure_leaves_no_trace() {
    let (bank, faults) = open_faulty(test_config(2));
    let alice = name_on_shard(&bank, 0, "alice");
    let bob = name_on_shard(&bank, 1, "bob");
    bank.new_account(&alice, 100).unwrap();
    bank.new_account(&bob, 50).unwrap();

    faults.arm_intent_commit_failure();
    let err = bank.transfer(&alice, &bob, 30).unwrap_err();
    assert!(matches!(err, BankError::LogWriteFailure { .. }));
    assert!(err.is_transient());
    assert!(bank.intent_log().is_empty());
    assert_eq!(prepared_total(&bank), 0);
    assert_eq!(bank.balance(&alice).unwrap(), 100);
    assert_eq!(bank.balance(&bob).unwrap(), 50);
}

#[test]
fn test_open_from_toml() {
    let config = shardbank_common::config::BankConfig::from_toml_str(
        r#"
        [coordinator]
        txn_id_prefix = "ledger"

        [[shards]]
        [[shards]]
        [[shards]]
        "#,
    )
    .unwrap();
    let bank = ShardBank::open(config).unwrap();
    assert_eq!(bank.num_shards(), 3);
    bank.new_account("x", 5).unwrap();
    bank.new_account("y", 5).unwrap();
    let receipt = bank.transfer("x", "y", 5).unwrap();
    assert!(receipt.txn_id.as_str().starts_with("ledger_"));
}
