//! `ShardBank`: the caller-facing ledger API over a set of shards.
//!
//! Wires the router, the shard stores, the intent log, the coordinator and
//! the recovery sweeper together from one `BankConfig`. Several banks can
//! live in one process; nothing is global except the optional metrics
//! exporter.

use std::sync::Arc;

use shardbank_common::config::BankConfig;
use shardbank_common::error::{BankError, BankResult, StorageError};
use shardbank_common::types::{Amount, ShardId};
use shardbank_storage::{IntentLog, ShardStore, Statement};

use crate::fault_injection::{FaultInjector, FaultyShardStore};
use crate::recovery::{RecoveryReport, RecoverySweeper, SweeperHandle};
use crate::sharded_engine::ShardedEngine;
use crate::two_phase::{TransferReceipt, TwoPhaseCoordinator};

pub struct ShardBank {
    config: BankConfig,
    engine: Arc<ShardedEngine>,
    intent_log: Arc<IntentLog>,
    sweeper: Arc<RecoverySweeper>,
    coordinator: TwoPhaseCoordinator,
    faults: Arc<FaultInjector>,
    background: Option<SweeperHandle>,
}

impl ShardBank {
    /// Open every store named by `config` and recover.
    pub fn open(config: BankConfig) -> BankResult<Self> {
        config.validate()?;
        let engine = ShardedEngine::open(&config.shards)?;
        let intent_log = open_intent_log(&config)?;
        Self::assemble(config, engine, intent_log, Arc::new(FaultInjector::new()))
    }

    /// Like `open`, with every shard store wrapped in a `FaultyShardStore`
    /// driven by `faults`.
    pub fn open_with_faults(config: BankConfig, faults: Arc<FaultInjector>) -> BankResult<Self> {
        config.validate()?;
        let stores = ShardedEngine::open(&config.shards)?.stores().to_vec();
        let intent_log = open_intent_log(&config)?;
        Self::with_stores(config, stores, intent_log, faults)
    }

    /// Explicit wiring: `stores[i]` serves shard `i`.
    pub fn with_stores(
        config: BankConfig,
        stores: Vec<Arc<dyn ShardStore>>,
        intent_log: IntentLog,
        faults: Arc<FaultInjector>,
    ) -> BankResult<Self> {
        let stores = stores
            .into_iter()
            .map(|s| Arc::new(FaultyShardStore::new(s, Arc::clone(&faults))) as Arc<dyn ShardStore>)
            .collect();
        let engine = ShardedEngine::new(stores)?;
        Self::assemble(config, engine, intent_log, faults)
    }

    fn assemble(
        config: BankConfig,
        engine: ShardedEngine,
        intent_log: IntentLog,
        faults: Arc<FaultInjector>,
    ) -> BankResult<Self> {
        let engine = Arc::new(engine);
        let intent_log = Arc::new(intent_log);
        let sweeper = RecoverySweeper::new(Arc::clone(&engine), Arc::clone(&intent_log), &config.recovery);
        let coordinator = TwoPhaseCoordinator::new(
            Arc::clone(&engine),
            Arc::clone(&intent_log),
            Arc::clone(&sweeper),
            config.transfer.clone(),
            Arc::clone(&faults),
        );

        if !config.logging.metrics_listen_addr.is_empty() {
            if let Err(e) = shardbank_observability::init_metrics(&config.logging.metrics_listen_addr) {
                tracing::warn!("metrics exporter not started: {}", e);
            }
        }

        tracing::info!(
            shards = engine.num_shards(),
            epoch = intent_log.epoch(),
            durable = intent_log.is_durable(),
            "shard bank opened"
        );

        if config.recovery.reconcile_on_open {
            let report = sweeper.sweep();
            for e in &report.errors {
                tracing::warn!(error = %e, "startup recovery reported an error");
            }
        }

        let background = if config.recovery.background {
            Some(sweeper.start()?)
        } else {
            None
        };

        Ok(Self {
            config,
            engine,
            intent_log,
            sweeper,
            coordinator,
            faults,
            background,
        })
    }

    /// Create `name` on its shard with `initial_balance`.
    pub fn new_account(&self, name: &str, initial_balance: Amount) -> BankResult<()> {
        let shard = self.engine.shard_for(name);
        self.engine
            .execute(
                shard,
                &Statement::InsertAccount { name: name.to_string(), balance: initial_balance },
            )
            .map_err(|source| BankError::Storage { shard, source })?;
        Ok(())
    }

    /// Committed balance of `name`.
    pub fn balance(&self, name: &str) -> BankResult<Amount> {
        let shard = self.engine.shard_for(name);
        let result = self
            .engine
            .execute(shard, &Statement::SelectBalance { name: name.to_string() })
            .map_err(|source| BankError::Storage { shard, source })?;
        scalar(shard, result.scalar())
    }

    /// Sum of all committed balances on all shards, read under the intent
    /// log lock so no transfer is half-finalized while it runs.
    pub fn total_liabilities(&self) -> BankResult<Amount> {
        let _serialized = self.intent_log.begin();
        let mut total: Amount = 0;
        for shard in self.engine.shard_ids() {
            let result = self
                .engine
                .execute(shard, &Statement::SumBalances)
                .map_err(|source| BankError::Storage { shard, source })?;
            let sum = scalar(shard, result.scalar())?;
            total = total.checked_add(sum).ok_or_else(|| BankError::Storage {
                shard,
                source: StorageError::BalanceOverflow("total liabilities".into()),
            })?;
        }
        Ok(total)
    }

    /// Atomically move `amount` from `source` to `dest`.
    pub fn transfer(&self, source: &str, dest: &str, amount: Amount) -> BankResult<TransferReceipt> {
        self.coordinator.transfer(source, dest, amount)
    }

    /// Run one recovery sweep now.
    pub fn reconcile(&self) -> BankResult<RecoveryReport> {
        self.sweeper.reconcile()
    }

    pub fn shard_for(&self, name: &str) -> ShardId {
        self.engine.shard_for(name)
    }

    pub fn num_shards(&self) -> usize {
        self.engine.num_shards()
    }

    pub fn config(&self) -> &BankConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ShardedEngine> {
        &self.engine
    }

    pub fn intent_log(&self) -> &Arc<IntentLog> {
        &self.intent_log
    }

    pub fn sweeper(&self) -> &Arc<RecoverySweeper> {
        &self.sweeper
    }

    pub fn coordinator(&self) -> &TwoPhaseCoordinator {
        &self.coordinator
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    /// Stop the background sweeper, if running.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.background.take() {
            handle.stop();
        }
    }
}

fn open_intent_log(config: &BankConfig) -> BankResult<IntentLog> {
    IntentLog::open(&config.coordinator).map_err(|source| BankError::LogWriteFailure {
        context: format!("open intent log in '{}'", config.coordinator.data_dir),
        source,
    })
}

fn scalar(shard: ShardId, value: Option<Amount>) -> BankResult<Amount> {
    value.ok_or_else(|| {
        BankError::internal_bug(
            "E-BANK-001",
            "shard returned a row count for a scalar query",
            shard.to_string(),
        )
    })
}
