//! Read-only ledger queries

use crate::{
    error::{Error, InvariantViolation, Result},
    storage::Storage,
    types::{Asset, AssetHolder, BlockchainEvent, SupplyCheck, Transaction},
};
use alloy_primitives::{Address, B256, U256};

/// Read side of the ledger
#[derive(Clone)]
pub struct LedgerQueries {
    storage: Storage,
}

impl LedgerQueries {
    /// Create queries over `storage`
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Asset by id
    pub fn asset(&self, asset_id: &str) -> Result<Option<Asset>> {
        self.storage.get_asset(asset_id)
    }

    /// All assets
    pub fn assets(&self) -> Result<Vec<Asset>> {
        self.storage.list_assets()
    }

    /// Assets of one class
    pub fn assets_by_type(&self, asset_type: &str) -> Result<Vec<Asset>> {
        self.storage.assets_by_type(asset_type)
    }

    /// Transaction history of an asset, oldest first
    pub fn transactions_by_asset(&self, asset_id: &str) -> Result<Vec<Transaction>> {
        if self.storage.get_asset(asset_id)?.is_none() {
            return Err(Error::NotFound(format!("asset {}", asset_id)));
        }
        self.storage.transactions_by_asset(asset_id)
    }

    /// Transaction by hash
    pub fn transaction(&self, tx_hash: &B256) -> Result<Option<Transaction>> {
        self.storage.get_transaction(tx_hash)
    }

    /// Tracked balance; zero when the holder has no row
    pub fn holder_balance(&self, asset_id: &str, holder: &Address) -> Result<U256> {
        Ok(self
            .storage
            .get_holder(asset_id, holder)?
            .map_or(U256::ZERO, |h| h.balance))
    }

    /// Non-zero holdings of an address
    pub fn holdings_by_address(&self, holder: &Address) -> Result<Vec<AssetHolder>> {
        let mut holdings = self.storage.holdings_by_address(holder)?;
        holdings.retain(|h| !h.balance.is_zero());
        Ok(holdings)
    }

    /// Holders of an asset with a positive balance
    pub fn holders_of_asset(&self, asset_id: &str) -> Result<Vec<AssetHolder>> {
        let mut holders = self.storage.holders_of_asset(asset_id)?;
        holders.retain(|h| !h.balance.is_zero());
        Ok(holders)
    }

    /// Events that could not be applied yet
    pub fn unresolved_events(&self) -> Result<Vec<BlockchainEvent>> {
        self.storage.unresolved_events()
    }

    /// Compare total supply with the sum of holder balances
    pub fn supply_check(&self, asset_id: &str) -> Result<SupplyCheck> {
        let asset = self
            .storage
            .get_asset(asset_id)?
            .ok_or_else(|| Error::NotFound(format!("asset {}", asset_id)))?;

        let mut holder_sum = U256::ZERO;
        for holder in self.storage.holders_of_asset(asset_id)? {
            holder_sum = holder_sum.checked_add(holder.balance).ok_or_else(|| {
                Error::InvariantViolation(InvariantViolation::Overflow(format!(
                    "holder sum of {}",
                    asset_id
                )))
            })?;
        }

        Ok(SupplyCheck {
            asset_id: asset.asset_id,
            total_supply: asset.total_supply,
            holder_sum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::state::{Movement, MovementKind, Origin};
    use crate::Config;
    use tempfile::TempDir;

    const ALICE: Address = Address::repeat_byte(0xaa);
    const BOB: Address = Address::repeat_byte(0xbb);

    fn setup() -> (Ledger, LedgerQueries, TempDir) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let storage = Storage::open(&config).unwrap();
        (Ledger::new(storage.clone()), LedgerQueries::new(storage), temp)
    }

    fn movement(tx: u8, kind: MovementKind, amount: u64) -> Movement {
        Movement {
            transaction_hash: B256::repeat_byte(tx),
            asset_id: "BOND-1".to_string(),
            kind,
            amount: U256::from(amount),
            asset_type: Some("CORPORATE_BOND".to_string()),
            issuer: Some("Acme".to_string()),
            contract: Address::repeat_byte(0xcc),
            origin: Origin::Chain {
                block_number: tx as u64,
                log_index: 0,
            },
        }
    }

    #[test]
    fn test_unknown_asset() {
        let (_ledger, queries, _temp) = setup();
        assert!(queries.asset("NOPE").unwrap().is_none());
        assert_eq!(
            queries.transactions_by_asset("NOPE").unwrap_err().kind(),
            "not_found"
        );
        assert_eq!(queries.holder_balance("NOPE", &ALICE).unwrap(), U256::ZERO);
    }

    #[test]
    fn test_holdings_skip_emptied_rows() {
        let (ledger, queries, _temp) = setup();
        ledger
            .commit_movement(&movement(1, MovementKind::Mint { to: ALICE }, 100), None)
            .unwrap();
        ledger
            .commit_movement(
                &movement(2, MovementKind::Transfer { from: ALICE, to: BOB }, 100),
                None,
            )
            .unwrap();

        assert!(queries.holdings_by_address(&ALICE).unwrap().is_empty());
        assert_eq!(queries.holdings_by_address(&BOB).unwrap().len(), 1);
        assert_eq!(queries.holders_of_asset("BOND-1").unwrap().len(), 1);
        assert_eq!(queries.transactions_by_asset("BOND-1").unwrap().len(), 2);

        let check = queries.supply_check("BOND-1").unwrap();
        assert!(check.is_consistent());
        assert_eq!(check.total_supply, U256::from(100u64));
    }
}
