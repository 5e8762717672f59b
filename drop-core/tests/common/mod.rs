#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use drop_core::{
    BackoffConfig, ChainClient, ChainError, ConsistencyGuard, ContractCall, ContractView, FeeBid,
    FeeData, FeePolicy, FeePolicyConfig, ManualClock, MemoryStore, MintMetrics, MintQueue,
    PhaseDefaults, PhaseStore, RecordSink, SubmissionConfig, SubmissionEngine, SupplyRefresh,
    TxReceipt,
};
use ethers::abi::Token;
use ethers::types::{Address, H256, U256};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CONTRACT: &str = "0x00000000000000000000000000000000000000d7";

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, 0).unwrap()
}

pub fn wallet(n: u8) -> Address {
    Address::repeat_byte(n)
}

pub fn contract() -> Address {
    CONTRACT.parse().unwrap()
}

/// What the scripted chain does with one submission.
#[derive(Debug, Clone)]
pub enum Step {
    Confirm,
    Revert(String),
    /// Never confirms within the wait and is not found afterwards.
    Timeout,
    /// Times out while waiting but the direct lookup finds it mined.
    LateConfirm,
    /// Never seen while it is the latest transaction; mined once another
    /// submission has been attempted after it.
    MinedAfterReplacement,
    SubmitError(ChainError),
    FeeError(ChainError),
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub call: ContractCall,
    pub bid: FeeBid,
    pub replaces: Option<H256>,
    pub tx_hash: H256,
}

/// Chain client that plays back a script, one step per attempt. Once the
/// script runs out every attempt confirms.
pub struct ScriptedChain {
    script: Mutex<VecDeque<Step>>,
    outcomes: Mutex<HashMap<H256, (Step, u64)>>,
    submissions: Mutex<Vec<Submission>>,
    fees: Mutex<VecDeque<FeeData>>,
    fee: FeeData,
    next_hash: AtomicU64,
    submit_calls: AtomicU64,
    pub fee_calls: AtomicU32,
}

impl ScriptedChain {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            outcomes: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            fees: Mutex::new(VecDeque::new()),
            fee: FeeData {
                base_fee_per_gas: U256::from(10_000_000_000u64),
                max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            },
            next_hash: AtomicU64::new(1),
            submit_calls: AtomicU64::new(0),
            fee_calls: AtomicU32::new(0),
        }
    }

    /// Fee snapshots handed out one per estimate before falling back to the
    /// default.
    pub fn with_fees(self, fees: Vec<FeeData>) -> Self {
        *self.fees.lock().unwrap() = fees.into();
        self
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    fn receipt(tx_hash: H256, success: bool, revert_reason: Option<String>) -> TxReceipt {
        TxReceipt {
            tx_hash,
            block_number: Some(100),
            gas_used: Some(U256::from(90_000u64)),
            effective_gas_price: Some(U256::from(11_000_000_000u64)),
            success,
            revert_reason,
        }
    }

    fn outcome(&self, tx_hash: H256) -> Step {
        match self.outcomes.lock().unwrap().get(&tx_hash).cloned() {
            Some((Step::MinedAfterReplacement, sent_at))
                if self.submit_calls.load(Ordering::SeqCst) > sent_at =>
            {
                Step::Confirm
            }
            Some((Step::MinedAfterReplacement, _)) => Step::Timeout,
            Some((step, _)) => step,
            None => Step::Confirm,
        }
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn fee_estimate(&self) -> Result<FeeData, ChainError> {
        self.fee_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        if let Some(Step::FeeError(e)) = script.front().cloned() {
            script.pop_front();
            return Err(e);
        }
        Ok(self.fees.lock().unwrap().pop_front().unwrap_or(self.fee))
    }

    async fn submit_transaction(
        &self,
        call: &ContractCall,
        bid: &FeeBid,
        replaces: Option<H256>,
    ) -> Result<H256, ChainError> {
        let call_index = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Confirm);
        if let Step::SubmitError(e) = step {
            return Err(e);
        }

        let tx_hash = H256::from_low_u64_be(self.next_hash.fetch_add(1, Ordering::SeqCst));
        self.outcomes.lock().unwrap().insert(tx_hash, (step, call_index));
        self.submissions.lock().unwrap().push(Submission {
            call: call.clone(),
            bid: *bid,
            replaces,
            tx_hash,
        });
        Ok(tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        _confirmations: u64,
        timeout: Duration,
    ) -> Result<TxReceipt, ChainError> {
        match self.outcome(tx_hash) {
            Step::Revert(reason) => Ok(Self::receipt(tx_hash, false, Some(reason))),
            Step::Timeout | Step::LateConfirm => Err(ChainError::Timeout {
                operation: "receipt".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            _ => Ok(Self::receipt(tx_hash, true, None)),
        }
    }

    async fn receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, ChainError> {
        match self.outcome(tx_hash) {
            Step::Timeout => Ok(None),
            Step::Revert(reason) => Ok(Some(Self::receipt(tx_hash, false, Some(reason)))),
            _ => Ok(Some(Self::receipt(tx_hash, true, None))),
        }
    }

    async fn read_contract_state(&self, _view: &ContractView) -> Result<Vec<Token>, ChainError> {
        Ok(vec![Token::Uint(U256::zero())])
    }
}

/// Keeps every action name it is handed.
#[derive(Default)]
pub struct RecordingSink {
    pub actions: Mutex<Vec<(String, Value)>>,
}

impl RecordingSink {
    pub fn names(&self) -> Vec<String> {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl RecordSink for RecordingSink {
    fn record_action(&self, _actor: &str, action: &str, payload: Value) {
        self.actions
            .lock()
            .unwrap()
            .push((action.to_string(), payload));
    }
}

#[derive(Default)]
pub struct CountingRefresh {
    pub calls: AtomicU32,
}

#[async_trait]
impl SupplyRefresh for CountingRefresh {
    async fn on_mint_confirmed(&self, _collection: &str, _receipt: &TxReceipt) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn fast_submission(max_attempts: u32) -> SubmissionConfig {
    SubmissionConfig {
        max_attempts,
        fee_timeout_ms: 1_000,
        confirmation_timeout_ms: 200,
        tuning_window: 2,
        ..Default::default()
    }
}

pub fn no_backoff() -> BackoffConfig {
    BackoffConfig {
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter: false,
    }
}

pub struct EngineParts {
    pub chain: Arc<ScriptedChain>,
    pub guard: Arc<ConsistencyGuard>,
    pub records: Arc<RecordingSink>,
    pub refresh: Arc<CountingRefresh>,
    pub engine: Arc<SubmissionEngine>,
}

pub fn engine_with(script: Vec<Step>, max_attempts: u32, guard: Arc<ConsistencyGuard>) -> EngineParts {
    engine_on(ScriptedChain::new(script), max_attempts, guard)
}

pub fn engine_on(chain: ScriptedChain, max_attempts: u32, guard: Arc<ConsistencyGuard>) -> EngineParts {
    let chain = Arc::new(chain);
    let records = Arc::new(RecordingSink::default());
    let refresh = Arc::new(CountingRefresh::default());

    let engine = SubmissionEngine::new(
        chain.clone(),
        Arc::new(MintQueue::new()),
        Arc::new(FeePolicy::new(FeePolicyConfig::default())),
        Arc::new(MintMetrics::new()),
        guard.clone(),
        contract(),
        fast_submission(max_attempts),
        no_backoff(),
    )
    .with_records(records.clone())
    .with_refresh(refresh.clone())
    .with_actor("tester");

    EngineParts {
        chain,
        guard,
        records,
        refresh,
        engine: Arc::new(engine),
    }
}

pub fn engine(script: Vec<Step>, max_attempts: u32) -> EngineParts {
    engine_with(script, max_attempts, Arc::new(ConsistencyGuard::new()))
}

pub fn defaults(total_supply: u64) -> PhaseDefaults {
    PhaseDefaults {
        total_supply,
        ..Default::default()
    }
}

pub async fn memory_store(
    total_supply: u64,
    clock: Arc<ManualClock>,
    guard: Arc<ConsistencyGuard>,
) -> (Arc<MemoryStore>, PhaseStore) {
    let kv = Arc::new(MemoryStore::new());
    let store = PhaseStore::open("apes", kv.clone(), guard, clock, defaults(total_supply))
        .await
        .unwrap();
    (kv, store)
}
