//! # Drop Core - Phased Drop Launchpad Logic
//!
//! Off-chain core of a timed, multi-phase NFT drop: allow-list commitments,
//! the phase schedule with its allocation rules, and the engine that gets
//! mint transactions included under contention.
//!
//! ## Modules
//!
//! - [`address`] - Address normalization and list parsing
//! - [`merkle`] - Merkle commitments compatible with OpenZeppelin `MerkleProof`
//! - [`phases`] - Phase store, window clamp, allocation reconciler, halt guard
//! - [`queue`] - Priority mint request queue
//! - [`fee`] - Fee escalation policy
//! - [`submission`] - Bounded-retry submission engine
//! - [`session`] - Client-side mint session and drain worker
//! - [`storage`] - Key-value persistence and action records
//! - [`metrics`] - Mint outcome metrics
//! - [`chain`] - Chain client and supply refresh seams
//! - [`config`] - Configuration structures
//! - [`error`] - Typed error handling with thiserror

pub mod address;
pub mod chain;
pub mod config;
pub mod error;
pub mod fee;
pub mod merkle;
pub mod metrics;
pub mod phases;
pub mod queue;
pub mod session;
pub mod storage;
pub mod submission;
pub(crate) mod utils;

pub use address::{normalize, normalize_all, parse_address_list, NormalizedAddresses};
pub use chain::{
    ChainClient, ContractCall, ContractView, NoopSupplyRefresh, SupplyRefresh, TxReceipt,
};
pub use config::{BackoffConfig, DropConfig, FeePolicyConfig, PhaseDefaults, SubmissionConfig};
pub use error::{
    AddressError, ChainError, ConfigError, CoreError, MintError, PhaseError, QueueError,
    RevertKind, SessionError, StoreError,
};
pub use fee::{gwei_to_wei, FeeBid, FeeData, FeePolicy};
pub use merkle::{MerkleCommitment, ZERO_ROOT};
pub use metrics::{MetricsSnapshot, MintMetrics};
pub use phases::{
    Adjustment, AllowListUpdate, Clock, ConsistencyGuard, ManualClock, Phase, PhaseChange,
    PhaseEvent, PhaseKey, PhaseRemoval, PhaseStatus, PhaseStore, PhaseUpdate, SystemClock,
};
pub use queue::{MintQueue, MintRequest, Priority, RequestId};
pub use session::MintSession;
pub use storage::{
    KeyValueStore, MemoryStore, NoopRecordSink, RecordSink, RecordSinkConfig, SqliteRecordSink,
    SqliteStore,
};
pub use submission::{SubmissionEngine, SubmissionEvent};

pub use utils::{setup_logger, MINT_RESULT_TARGET};

pub use utils::retry::{is_transient_error, pressure_delay, with_retry, RetryConfig};
