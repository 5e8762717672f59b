//! # Core Error Types
//!
//! Centralized error definitions for the drop-core crate.
//! All errors implement `std::error::Error` and `std::fmt::Display`.

use crate::phases::PhaseKey;
use crate::queue::RequestId;
use thiserror::Error;

/// Unified error type for drop-core operations.
///
/// This enum wraps all specific error types and provides a unified
/// error interface for the application layer.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Config(ConfigError),

    #[error(transparent)]
    Address(AddressError),

    #[error(transparent)]
    Phase(PhaseError),

    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error(transparent)]
    Queue(QueueError),

    #[error(transparent)]
    Mint(MintError),

    #[error(transparent)]
    Session(SessionError),
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e)
    }
}

impl From<AddressError> for CoreError {
    fn from(e: AddressError) -> Self {
        CoreError::Address(e)
    }
}

impl From<PhaseError> for CoreError {
    fn from(e: PhaseError) -> Self {
        CoreError::Phase(e)
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::Store(e)
    }
}

impl From<QueueError> for CoreError {
    fn from(e: QueueError) -> Self {
        CoreError::Queue(e)
    }
}

impl From<MintError> for CoreError {
    fn from(e: MintError) -> Self {
        CoreError::Mint(e)
    }
}

impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        CoreError::Session(e)
    }
}

/// Configuration-related errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid RPC URL format: '{url}'")]
    InvalidRpcUrl { url: String },

    #[error("Missing required configuration field: '{field}'")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("I/O error reading {path}: {msg}")]
    IoError { path: String, msg: String },
}

/// Address parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Malformed address '{input}': {reason}")]
    Malformed { input: String, reason: String },
}

/// Phase store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhaseError {
    #[error("Phase '{key}' is the catch-all phase and cannot be removed")]
    ProtectedPhase { key: PhaseKey },

    #[error("Phase '{key}' is not enabled")]
    NotFound { key: PhaseKey },

    #[error("Phase '{key}' is public and has no allow-list")]
    NotGated { key: PhaseKey },

    #[error("Invalid price '{input}': {reason}")]
    InvalidPrice { input: String, reason: String },
}

/// Key-value persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Backend failure for key '{key}': {msg}")]
    Backend { key: String, msg: String },

    #[error("Corrupt record at '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode record for '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Mint request queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Request {id} not found")]
    NotFound { id: RequestId },

    #[error("Request {id} was already submitted and can no longer be cancelled")]
    AlreadySubmitted { id: RequestId },
}

/// Errors reported by a chain client implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("No signer available")]
    WalletUnavailable,

    #[error("Connected to chain {actual}, expected {expected}")]
    WrongChain { expected: u64, actual: u64 },

    #[error("Insufficient funds: {message}")]
    InsufficientFunds { message: String },

    #[error("Transaction rejected by signer: {message}")]
    Rejected { message: String },

    #[error("Execution reverted: {reason}")]
    Reverted { reason: String },

    /// The node refused the transaction because its nonce was already used
    /// ("nonce too low", "already known").
    #[error("Nonce already used: {message}")]
    NonceConsumed { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },
}

/// Revert reasons the drop contract signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevertKind {
    WhitelistProofInvalid,
    WalletLimitExceeded,
    SupplyExhausted,
    Other,
}

impl RevertKind {
    /// Classify a revert reason string (custom error name or require message).
    pub fn classify(reason: &str) -> Self {
        let reason = reason.to_lowercase();

        let proof_patterns = ["invalidproof", "invalid proof", "not whitelisted", "merkle"];
        let limit_patterns = [
            "walletlimit",
            "wallet limit",
            "max per wallet",
            "exceeds wallet",
            "mint limit",
        ];
        let supply_patterns = ["soldout", "sold out", "exceeds supply", "max supply", "supply"];

        if proof_patterns.iter().any(|p| reason.contains(p)) {
            RevertKind::WhitelistProofInvalid
        } else if limit_patterns.iter().any(|p| reason.contains(p)) {
            RevertKind::WalletLimitExceeded
        } else if supply_patterns.iter().any(|p| reason.contains(p)) {
            RevertKind::SupplyExhausted
        } else {
            RevertKind::Other
        }
    }
}

impl std::fmt::Display for RevertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RevertKind::WhitelistProofInvalid => "allow-list proof rejected",
            RevertKind::WalletLimitExceeded => "wallet limit exceeded",
            RevertKind::SupplyExhausted => "supply exhausted",
            RevertKind::Other => "contract reverted",
        };
        f.write_str(s)
    }
}

/// Terminal submission failures surfaced to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MintError {
    #[error("Wallet not connected")]
    WalletNotConnected,

    #[error("Wrong network: connected to chain {actual}, expected {expected}")]
    NetworkMismatch { expected: u64, actual: u64 },

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Transaction rejected by user")]
    UserRejected,

    #[error("On-chain revert ({kind}): {reason}")]
    OnChainRevert { kind: RevertKind, reason: String },

    #[error("Timed out waiting for confirmation")]
    Timeout,

    #[error("Phase '{phase}' is halted until its commitment is rebuilt")]
    PhaseHalted { phase: PhaseKey },

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

impl MintError {
    /// Whether another attempt with an escalated fee can change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MintError::Timeout | MintError::Unknown { .. })
    }

    /// Short machine-readable label used in logs and action records.
    pub fn kind(&self) -> &'static str {
        match self {
            MintError::WalletNotConnected => "wallet_not_connected",
            MintError::NetworkMismatch { .. } => "network_mismatch",
            MintError::InsufficientFunds => "insufficient_funds",
            MintError::UserRejected => "user_rejected",
            MintError::OnChainRevert { .. } => "on_chain_revert",
            MintError::Timeout => "timeout",
            MintError::PhaseHalted { .. } => "phase_halted",
            MintError::Unknown { .. } => "unknown",
        }
    }
}

impl From<ChainError> for MintError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::Timeout { .. } => MintError::Timeout,
            ChainError::WalletUnavailable => MintError::WalletNotConnected,
            ChainError::WrongChain { expected, actual } => {
                MintError::NetworkMismatch { expected, actual }
            }
            ChainError::InsufficientFunds { .. } => MintError::InsufficientFunds,
            ChainError::Rejected { .. } => MintError::UserRejected,
            ChainError::Reverted { reason } => MintError::OnChainRevert {
                kind: RevertKind::classify(&reason),
                reason,
            },
            ChainError::NonceConsumed { message } | ChainError::Transport { message } => {
                MintError::Unknown { message }
            }
        }
    }
}

/// Errors from the client-side mint session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No phase is active right now")]
    NoActivePhase,

    #[error("Quantity must be at least 1")]
    ZeroQuantity,

    #[error("No wallet connected to this session")]
    WalletNotConnected,

    #[error("Wallet {address} is not on the allow-list for phase '{phase}'")]
    NotEligible { phase: PhaseKey, address: String },

    #[error("Phase '{phase}' is halted until its commitment is rebuilt")]
    PhaseHalted { phase: PhaseKey },

    #[error("Stored proof for {address} does not match the '{phase}' root")]
    CommitmentMismatch { phase: PhaseKey, address: String },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}
