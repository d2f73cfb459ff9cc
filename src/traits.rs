use async_trait::async_trait;

use crate::types::{AddressType, CoinId, Result, SubmitRequest, SubmitResponse, Utxo};

/// Read-only view of the UTXO indexer. Amounts are exact integers; rune
/// balances come back annotated on the UTXOs themselves.
#[async_trait]
pub trait UtxoSource: Send + Sync {
    async fn fetch_btc_utxos(&self, address: &str) -> Result<Vec<Utxo>>;
    async fn fetch_rune_utxos(&self, address: &str, rune_id: CoinId) -> Result<Vec<Utxo>>;
}

/// Remote fee estimation. Must behave as a pure function of its arguments as
/// far as the builder can observe.
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    async fn estimate_fee(
        &self,
        input_types: &[AddressType],
        pool_addresses: &[String],
        output_types: &[AddressType],
    ) -> Result<u64>;
}

/// Endpoint that executes a finished intention set against the exchange.
#[async_trait]
pub trait IntentionSubmitter: Send + Sync {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse>;
}
