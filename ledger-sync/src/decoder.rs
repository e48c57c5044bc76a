//! Event decoder
//!
//! Classifies a [`RawLog`] by `topics[0]` and ABI-decodes it into a
//! [`ChainEvent`]. Indexed `string` topics only carry `keccak256(assetId)`,
//! so asset ids are looked up through an [`AssetIdResolver`].

use crate::error::DecodeError;
use crate::types::RawLog;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolEvent};
use serde::Serialize;
use std::sync::Arc;

/// Token contract ABI
#[allow(missing_docs)]
pub mod abi {
    use super::sol;

    sol! {
        event AssetMinted(string indexed assetId, address indexed issuer, uint256 amount, string assetType);
        event AssetBurned(string indexed assetId, address indexed burner, uint256 amount);
        event Transfer(address indexed from, address indexed to, uint256 value);

        function mint(address to, uint256 amount, string assetId, string assetType, string issuer) external;
        function burn(address from, uint256 amount, string assetId) external;
        function balanceOf(address account) external view returns (uint256);
    }
}

use abi::{AssetBurned, AssetMinted, Transfer};

/// Maps `keccak256(assetId)` back to the asset id
pub trait AssetIdResolver: Send + Sync {
    /// Asset id for `hash`, if known
    fn resolve(&self, hash: &B256) -> Option<String>;
}

/// Kind of event a live filter subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// AssetMinted
    Minted,
    /// AssetBurned
    Burned,
    /// Transfer
    Transferred,
}

impl EventKind {
    /// All kinds, one live filter each
    pub const ALL: [EventKind; 3] = [EventKind::Minted, EventKind::Burned, EventKind::Transferred];

    /// Signature hash used as `topics[0]`
    pub fn topic0(&self) -> B256 {
        match self {
            EventKind::Minted => AssetMinted::SIGNATURE_HASH,
            EventKind::Burned => AssetBurned::SIGNATURE_HASH,
            EventKind::Transferred => Transfer::SIGNATURE_HASH,
        }
    }

    /// Label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Minted => "minted",
            EventKind::Burned => "burned",
            EventKind::Transferred => "transferred",
        }
    }
}

/// Decoded contract event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum ChainEvent {
    /// Supply created and credited to `issuer`
    Minted {
        /// Asset id (resolved from the indexed hash)
        asset_id: String,
        /// Credited address
        issuer: Address,
        /// Amount minted
        amount: U256,
        /// Asset class
        asset_type: String,
    },
    /// Supply destroyed from `burner`
    Burned {
        /// Asset id (resolved from the indexed hash)
        asset_id: String,
        /// Debited address
        burner: Address,
        /// Amount burned
        amount: U256,
    },
    /// Plain token transfer
    Transferred {
        /// Sender (zero on mint)
        from: Address,
        /// Receiver (zero on burn)
        to: Address,
        /// Amount moved
        amount: U256,
    },
    /// Log from this contract with an unrecognised signature
    Unknown {
        /// The unrecognised `topics[0]`
        topic0: B256,
    },
}

impl ChainEvent {
    /// Event name as stored in the audit record
    pub fn name(&self) -> &'static str {
        match self {
            ChainEvent::Minted { .. } => "AssetMinted",
            ChainEvent::Burned { .. } => "AssetBurned",
            ChainEvent::Transferred { .. } => "Transfer",
            ChainEvent::Unknown { .. } => "Unknown",
        }
    }

    /// Kind, or `None` for [`ChainEvent::Unknown`]
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            ChainEvent::Minted { .. } => Some(EventKind::Minted),
            ChainEvent::Burned { .. } => Some(EventKind::Burned),
            ChainEvent::Transferred { .. } => Some(EventKind::Transferred),
            ChainEvent::Unknown { .. } => None,
        }
    }

    /// JSON payload for the audit record
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Stateless decoder over the contract ABI
#[derive(Clone)]
pub struct EventDecoder {
    resolver: Arc<dyn AssetIdResolver>,
}

impl EventDecoder {
    /// Create a decoder resolving asset hashes through `resolver`
    pub fn new(resolver: Arc<dyn AssetIdResolver>) -> Self {
        Self { resolver }
    }

    /// Decode one log
    pub fn decode(&self, log: &RawLog) -> Result<ChainEvent, DecodeError> {
        let topic0 = *log.topic0().ok_or(DecodeError::MissingTopics)?;

        if topic0 == AssetMinted::SIGNATURE_HASH {
            let ev: AssetMinted = decode_event(log, "AssetMinted", 3)?;
            Ok(ChainEvent::Minted {
                asset_id: self.asset_id(&ev.assetId),
                issuer: ev.issuer,
                amount: ev.amount,
                asset_type: ev.assetType,
            })
        } else if topic0 == AssetBurned::SIGNATURE_HASH {
            let ev: AssetBurned = decode_event(log, "AssetBurned", 3)?;
            Ok(ChainEvent::Burned {
                asset_id: self.asset_id(&ev.assetId),
                burner: ev.burner,
                amount: ev.amount,
            })
        } else if topic0 == Transfer::SIGNATURE_HASH {
            let ev: Transfer = decode_event(log, "Transfer", 3)?;
            Ok(ChainEvent::Transferred {
                from: ev.from,
                to: ev.to,
                amount: ev.value,
            })
        } else {
            Ok(ChainEvent::Unknown { topic0 })
        }
    }

    /// Unregistered hashes fall back to their hex form
    fn asset_id(&self, hash: &B256) -> String {
        self.resolver
            .resolve(hash)
            .unwrap_or_else(|| hash.to_string())
    }
}

fn decode_event<E: SolEvent>(
    log: &RawLog,
    event: &'static str,
    expected_topics: usize,
) -> Result<E, DecodeError> {
    if log.topics.len() != expected_topics {
        return Err(DecodeError::TopicCount {
            event,
            expected: expected_topics,
            actual: log.topics.len(),
        });
    }
    E::decode_raw_log(log.topics.iter().copied(), &log.data, true).map_err(|e| DecodeError::Abi {
        event,
        reason: e.to_string(),
    })
}

/// Position of a log on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    /// Emitting contract
    pub contract: Address,
    /// Emitting transaction
    pub transaction_hash: B256,
    /// Block
    pub block_number: u64,
    /// Index in block
    pub log_index: u64,
}

fn raw_log<E: SolEvent>(at: LogPosition, event: &E) -> RawLog {
    let encoded = event.encode_log_data();
    RawLog {
        address: at.contract,
        topics: encoded.topics().to_vec(),
        data: encoded.data.clone(),
        block_number: at.block_number,
        transaction_hash: at.transaction_hash,
        log_index: at.log_index,
    }
}

/// Encode an `AssetMinted` log
pub fn minted_log(
    at: LogPosition,
    asset_id: &str,
    issuer: Address,
    amount: U256,
    asset_type: &str,
) -> RawLog {
    raw_log(
        at,
        &AssetMinted {
            assetId: keccak256(asset_id.as_bytes()),
            issuer,
            amount,
            assetType: asset_type.to_string(),
        },
    )
}

/// Encode an `AssetBurned` log
pub fn burned_log(at: LogPosition, asset_id: &str, burner: Address, amount: U256) -> RawLog {
    raw_log(
        at,
        &AssetBurned {
            assetId: keccak256(asset_id.as_bytes()),
            burner,
            amount,
        },
    )
}

/// Encode a `Transfer` log
pub fn transfer_log(at: LogPosition, from: Address, to: Address, amount: U256) -> RawLog {
    raw_log(
        at,
        &Transfer {
            from,
            to,
            value: amount,
        },
    )
}

/// Empty-data log with an arbitrary signature
pub fn foreign_log(at: LogPosition, topic0: B256) -> RawLog {
    RawLog {
        address: at.contract,
        topics: vec![topic0],
        data: Bytes::new(),
        block_number: at.block_number,
        transaction_hash: at.transaction_hash,
        log_index: at.log_index,
    }
}
