//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `assets` - Asset rows (key: asset_id)
//! - `holders` - AssetHolder rows (key: asset_id || 0x1f || holder address)
//! - `transactions` - Transaction rows (key: transaction hash)
//! - `events` - BlockchainEvent dedup/audit records (key: tx hash || log index)
//! - `indices` - Secondary indices for fast lookups
//! - `meta` - Replay checkpoint

use crate::{
    decoder::AssetIdResolver,
    error::{Error, Result},
    types::{Asset, AssetHolder, BlockchainEvent, EventKey, Transaction},
    Config,
};
use alloy_primitives::{keccak256, Address, B256};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Column family names
const CF_ASSETS: &str = "assets";
const CF_HOLDERS: &str = "holders";
const CF_TRANSACTIONS: &str = "transactions";
const CF_EVENTS: &str = "events";
const CF_INDICES: &str = "indices";
const CF_META: &str = "meta";

const ALL_CFS: [&str; 6] = [
    CF_ASSETS,
    CF_HOLDERS,
    CF_TRANSACTIONS,
    CF_EVENTS,
    CF_INDICES,
    CF_META,
];

/// Index namespaces inside `indices`
const IDX_ASSET_TYPE: &[u8] = b"asset_type";
const IDX_HOLDINGS: &[u8] = b"holdings";
const IDX_TX_BY_ASSET: &[u8] = b"tx_by_asset";
const IDX_ASSET_HASH: &[u8] = b"asset_hash";
const IDX_UNRESOLVED: &[u8] = b"unresolved";

const META_REPLAY_CHECKPOINT: &[u8] = b"replay_checkpoint";

const SEP: u8 = 0x1f;

/// Storage wrapper for RocksDB
#[derive(Clone)]
pub struct Storage {
    db: Arc<DB>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            "Opened RocksDB at {:?} with {} column families",
            path,
            ALL_CFS.len()
        );

        Ok(Self { db: Arc::new(db) })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            CF_EVENTS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            CF_INDICES => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                // Point lookups on asset hashes
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Keys of `cf` starting with `prefix`, in key order
    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    // Asset operations

    /// Get asset by id
    pub fn get_asset(&self, asset_id: &str) -> Result<Option<Asset>> {
        self.get_json(CF_ASSETS, asset_id.as_bytes())
    }

    /// All assets, ordered by id
    pub fn list_assets(&self) -> Result<Vec<Asset>> {
        self.scan_prefix(CF_ASSETS, &[])?
            .into_iter()
            .map(|(_, value)| Ok(serde_json::from_slice(&value)?))
            .collect()
    }

    /// Assets of one type
    pub fn assets_by_type(&self, asset_type: &str) -> Result<Vec<Asset>> {
        let prefix = index_key(IDX_ASSET_TYPE, &[asset_type.as_bytes()], true);
        let mut assets = Vec::new();
        for (key, _) in self.scan_prefix(CF_INDICES, &prefix)? {
            let asset_id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            if let Some(asset) = self.get_asset(&asset_id)? {
                assets.push(asset);
            }
        }
        Ok(assets)
    }

    // Holder operations

    /// Get holder row
    pub fn get_holder(&self, asset_id: &str, holder: &Address) -> Result<Option<AssetHolder>> {
        self.get_json(CF_HOLDERS, &holder_key(asset_id, holder))
    }

    /// All holder rows of one asset
    pub fn holders_of_asset(&self, asset_id: &str) -> Result<Vec<AssetHolder>> {
        let mut prefix = asset_id.as_bytes().to_vec();
        prefix.push(SEP);
        self.scan_prefix(CF_HOLDERS, &prefix)?
            .into_iter()
            .filter(|(key, _)| key.len() == prefix.len() + 20)
            .map(|(_, value)| Ok(serde_json::from_slice(&value)?))
            .collect()
    }

    /// All holder rows of one address, across assets
    pub fn holdings_by_address(&self, holder: &Address) -> Result<Vec<AssetHolder>> {
        let prefix = index_key(IDX_HOLDINGS, &[holder.as_slice()], true);
        let mut holdings = Vec::new();
        for (key, _) in self.scan_prefix(CF_INDICES, &prefix)? {
            let asset_id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            if let Some(row) = self.get_holder(&asset_id, holder)? {
                holdings.push(row);
            }
        }
        Ok(holdings)
    }

    // Transaction operations

    /// Get transaction by hash
    pub fn get_transaction(&self, tx_hash: &B256) -> Result<Option<Transaction>> {
        self.get_json(CF_TRANSACTIONS, tx_hash.as_slice())
    }

    /// Transactions of one asset, oldest first
    pub fn transactions_by_asset(&self, asset_id: &str) -> Result<Vec<Transaction>> {
        let prefix = index_key(IDX_TX_BY_ASSET, &[asset_id.as_bytes()], true);
        let mut txs = Vec::new();
        for (key, _) in self.scan_prefix(CF_INDICES, &prefix)? {
            let hash = B256::try_from(&key[prefix.len()..])
                .map_err(|e| Error::Storage(format!("Corrupt transaction index: {}", e)))?;
            if let Some(tx) = self.get_transaction(&hash)? {
                txs.push(tx);
            }
        }
        txs.sort_by_key(|tx| (tx.created_at, tx.block_number));
        Ok(txs)
    }

    // Event operations

    /// Get dedup record
    pub fn get_event(&self, key: &EventKey) -> Result<Option<BlockchainEvent>> {
        self.get_json(CF_EVENTS, &key.to_bytes())
    }

    /// Events observed but not yet applied
    pub fn unresolved_events(&self) -> Result<Vec<BlockchainEvent>> {
        self.unresolved_under(&index_key(IDX_UNRESOLVED, &[], false))
    }

    /// Unresolved events that move `asset_id`
    pub fn unresolved_events_for_asset(&self, asset_id: &str) -> Result<Vec<BlockchainEvent>> {
        self.unresolved_under(&index_key(IDX_UNRESOLVED, &[asset_id.as_bytes()], true))
    }

    fn unresolved_under(&self, prefix: &[u8]) -> Result<Vec<BlockchainEvent>> {
        let mut events = Vec::new();
        for (_, event_key) in self.scan_prefix(CF_INDICES, prefix)? {
            match self.get_json::<BlockchainEvent>(CF_EVENTS, &event_key)? {
                Some(event) if !event.processed => events.push(event),
                _ => {}
            }
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    // Asset id hashes

    /// Remember `keccak256(asset_id)` so indexed topics resolve back to the id
    pub fn register_asset_id(&self, asset_id: &str) -> Result<B256> {
        let hash = keccak256(asset_id.as_bytes());
        let cf = self.cf_handle(CF_INDICES)?;
        self.db.put_cf(
            cf,
            index_key(IDX_ASSET_HASH, &[hash.as_slice()], false),
            asset_id.as_bytes(),
        )?;
        Ok(hash)
    }

    /// Asset id whose keccak256 is `hash`, if registered
    pub fn resolve_asset_hash(&self, hash: &B256) -> Result<Option<String>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let key = index_key(IDX_ASSET_HASH, &[hash.as_slice()], false);
        Ok(self
            .db
            .get_cf(cf, key)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    // Replay checkpoint

    /// Last block covered by a completed replay
    pub fn replay_checkpoint(&self) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, META_REPLAY_CHECKPOINT)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("Corrupt replay checkpoint".to_string()))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Persist replay checkpoint
    pub fn set_replay_checkpoint(&self, block: u64) -> Result<()> {
        let cf = self.cf_handle(CF_META)?;
        self.db.put_cf(cf, META_REPLAY_CHECKPOINT, block.to_be_bytes())?;
        Ok(())
    }

    // Batch operations (atomic)

    /// Commit every row of `batch` in one RocksDB write
    pub fn write(&self, batch: LedgerBatch) -> Result<()> {
        if batch.ops.is_empty() {
            return Ok(());
        }

        let mut wb = WriteBatch::default();
        for op in &batch.ops {
            match op {
                BatchOp::Put { cf, key, value } => wb.put_cf(self.cf_handle(cf)?, key, value),
                BatchOp::Delete { cf, key } => wb.delete_cf(self.cf_handle(cf)?, key),
            }
        }

        self.db.write(wb)?;
        Ok(())
    }

    // Statistics

    /// Approximate row counts
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            assets: self.approximate_count(CF_ASSETS)?,
            holders: self.approximate_count(CF_HOLDERS)?,
            transactions: self.approximate_count(CF_TRANSACTIONS)?,
            events: self.approximate_count(CF_EVENTS)?,
        })
    }

    fn approximate_count(&self, name: &str) -> Result<u64> {
        let cf = self.cf_handle(name)?;
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(prop)
    }
}

impl AssetIdResolver for Storage {
    fn resolve(&self, hash: &B256) -> Option<String> {
        match self.resolve_asset_hash(hash) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(hash = %hash, error = %e, "Asset hash lookup failed");
                None
            }
        }
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Asset rows
    pub assets: u64,
    /// Holder rows
    pub holders: u64,
    /// Transaction rows
    pub transactions: u64,
    /// Dedup records
    pub events: u64,
}

#[derive(Debug, Clone)]
enum BatchOp {
    Put {
        cf: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: &'static str,
        key: Vec<u8>,
    },
}

/// Rows written together by one reconciliation
#[derive(Debug, Clone, Default)]
pub struct LedgerBatch {
    ops: Vec<BatchOp>,
}

impl LedgerBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued writes
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Nothing queued
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn put(&mut self, cf: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { cf, key, value });
    }

    /// Asset row and its type index
    pub fn put_asset(&mut self, asset: &Asset) -> Result<()> {
        self.put(
            CF_ASSETS,
            asset.asset_id.as_bytes().to_vec(),
            serde_json::to_vec(asset)?,
        );
        self.put(
            CF_INDICES,
            index_key(
                IDX_ASSET_TYPE,
                &[asset.asset_type.as_bytes(), asset.asset_id.as_bytes()],
                false,
            ),
            Vec::new(),
        );
        Ok(())
    }

    /// Holder row and its by-address index
    pub fn put_holder(&mut self, holder: &AssetHolder) -> Result<()> {
        self.put(
            CF_HOLDERS,
            holder_key(&holder.asset_id, &holder.holder_address),
            serde_json::to_vec(holder)?,
        );
        self.put(
            CF_INDICES,
            index_key(
                IDX_HOLDINGS,
                &[holder.holder_address.as_slice(), holder.asset_id.as_bytes()],
                false,
            ),
            Vec::new(),
        );
        Ok(())
    }

    /// Transaction row and its by-asset index
    pub fn put_transaction(&mut self, tx: &Transaction) -> Result<()> {
        self.put(
            CF_TRANSACTIONS,
            tx.transaction_hash.to_vec(),
            serde_json::to_vec(tx)?,
        );
        self.put(
            CF_INDICES,
            index_key(
                IDX_TX_BY_ASSET,
                &[tx.asset_id.as_bytes(), tx.transaction_hash.as_slice()],
                false,
            ),
            Vec::new(),
        );
        Ok(())
    }

    /// Dedup record; keeps the unresolved index in step with `processed`
    pub fn put_event(&mut self, event: &BlockchainEvent) -> Result<()> {
        let key = event.key().to_bytes();
        let asset = event.asset_id.as_deref().unwrap_or_default();
        let unresolved = index_key(IDX_UNRESOLVED, &[asset.as_bytes(), &key], false);
        if event.processed || event.unresolved_reason.is_none() {
            self.ops.push(BatchOp::Delete {
                cf: CF_INDICES,
                key: unresolved,
            });
        } else {
            self.put(CF_INDICES, unresolved, key.clone());
        }
        self.put(CF_EVENTS, key, serde_json::to_vec(event)?);
        Ok(())
    }
}

fn holder_key(asset_id: &str, holder: &Address) -> Vec<u8> {
    let mut key = asset_id.as_bytes().to_vec();
    key.push(SEP);
    key.extend_from_slice(holder.as_slice());
    key
}

/// `namespace || SEP || part0 || SEP || part1 ...`, optionally with a trailing SEP
fn index_key(namespace: &[u8], parts: &[&[u8]], trailing_sep: bool) -> Vec<u8> {
    let mut key = namespace.to_vec();
    key.push(SEP);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(SEP);
        }
        key.extend_from_slice(part);
    }
    if trailing_sep {
        key.push(SEP);
    }
    key
}
