use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;
use bitcoin::{
    address::NetworkUnchecked, hashes::Hash, Address, CompressedPublicKey, Network, Txid,
};

use crate::{
    traits::{FeeEstimator, IntentionSubmitter, UtxoSource},
    types::{
        AddressType, ClientError, CoinAmount, CoinId, InputCoin, Intention, OutputCoin, Result,
        SubmitRequest, SubmitResponse, Utxo,
    },
};

/// Regtest p2wpkh address derived from a fixed public key, playing the role
/// of the initiator's payment address.
pub fn payment_address() -> String {
    let bytes =
        hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
            .expect("valid hex");
    let pubkey = CompressedPublicKey(
        bitcoin::secp256k1::PublicKey::from_slice(&bytes).expect("valid public key"),
    );
    Address::p2wpkh(&pubkey, Network::Regtest).to_string()
}

pub fn pool_address() -> String {
    "bcrt1pxqkh0g270lucjafgngmwv7vtgc8mk9j5y4j8fnrxm77yunuh398qfv8tqp".to_string()
}

pub fn user_address() -> String {
    "bcrt1pv6dtdf0vrrj6ntas926v8vw9u0j3mga29vmfnxh39zfxya83p89qz9ze3l".to_string()
}

/// BTC-only UTXO at a synthetic txid built from `tag`.
pub fn utxo(address: &str, tag: u8, vout: u32, sats: u64) -> Utxo {
    let parsed: Address<NetworkUnchecked> = address.parse().expect("valid test address");
    Utxo {
        txid: Txid::from_slice(&[tag; 32]).expect("32 bytes"),
        vout,
        value: sats,
        address: address.to_string(),
        script_pubkey: parsed.assume_checked().script_pubkey(),
        rune_balances: Vec::new(),
    }
}

/// UTXO carrying `amount` of one rune on top of its sats.
pub fn rune_utxo(
    address: &str,
    tag: u8,
    vout: u32,
    sats: u64,
    rune: CoinId,
    amount: u128,
) -> Utxo {
    let mut out = utxo(address, tag, vout, sats);
    out.rune_balances = vec![CoinAmount::new(rune, amount)];
    out
}

pub fn intention(
    pool: &str,
    action: &str,
    input_coins: Vec<InputCoin>,
    output_coins: Vec<OutputCoin>,
) -> Intention {
    Intention {
        exchange_id: "EXCHANGE_1".to_string(),
        action: action.to_string(),
        action_params: None,
        pool_address: pool.to_string(),
        nonce: 0,
        input_coins,
        output_coins,
    }
}

/// In-memory indexer stand-in keyed exactly the way the builder asks.
#[derive(Debug, Default)]
pub struct MockUtxoSource {
    btc: HashMap<String, Vec<Utxo>>,
    runes: HashMap<(String, CoinId), Vec<Utxo>>,
    fail_addresses: HashSet<String>,
}

impl MockUtxoSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_btc(mut self, address: &str, utxos: Vec<Utxo>) -> Self {
        self.btc.insert(address.to_string(), utxos);
        self
    }

    pub fn with_runes(mut self, address: &str, rune: CoinId, utxos: Vec<Utxo>) -> Self {
        self.runes.insert((address.to_string(), rune), utxos);
        self
    }

    pub fn with_failure(mut self, address: &str) -> Self {
        self.fail_addresses.insert(address.to_string());
        self
    }
}

#[async_trait]
impl UtxoSource for MockUtxoSource {
    async fn fetch_btc_utxos(&self, address: &str) -> Result<Vec<Utxo>> {
        if self.fail_addresses.contains(address) {
            return Err(ClientError::UtxoFetchFailed(format!(
                "indexer unavailable for {address}"
            )));
        }
        Ok(self.btc.get(address).cloned().unwrap_or_default())
    }

    async fn fetch_rune_utxos(&self, address: &str, rune_id: CoinId) -> Result<Vec<Utxo>> {
        if self.fail_addresses.contains(address) {
            return Err(ClientError::UtxoFetchFailed(format!(
                "indexer unavailable for {address}"
            )));
        }
        Ok(self
            .runes
            .get(&(address.to_string(), rune_id))
            .cloned()
            .unwrap_or_default())
    }
}

/// Arguments of one `estimate_fee` call, captured for assertions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeeCall {
    pub input_types: Vec<AddressType>,
    pub pool_addresses: Vec<String>,
    pub output_types: Vec<AddressType>,
}

/// Flat-fee estimator that records every call it sees.
#[derive(Debug)]
pub struct RecordingFeeEstimator {
    fee: u64,
    calls: Mutex<Vec<FeeCall>>,
}

impl RecordingFeeEstimator {
    pub fn new(fee: u64) -> Self {
        Self {
            fee,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<FeeCall> {
        self.calls.lock().expect("fee call log poisoned").clone()
    }
}

#[async_trait]
impl FeeEstimator for RecordingFeeEstimator {
    async fn estimate_fee(
        &self,
        input_types: &[AddressType],
        pool_addresses: &[String],
        output_types: &[AddressType],
    ) -> Result<u64> {
        self.calls.lock().expect("fee call log poisoned").push(FeeCall {
            input_types: input_types.to_vec(),
            pool_addresses: pool_addresses.to_vec(),
            output_types: output_types.to_vec(),
        });
        Ok(self.fee)
    }
}

/// Submitter that replies with a canned response and keeps the last request.
#[derive(Debug)]
pub struct MockSubmitter {
    response: SubmitResponse,
    requests: Mutex<Vec<SubmitRequest>>,
}

impl MockSubmitter {
    pub fn accepting(txid: &str) -> Self {
        Self {
            response: SubmitResponse::Accepted {
                txid: txid.to_string(),
            },
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(response: SubmitResponse) -> Self {
        Self {
            response,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<SubmitRequest> {
        self.requests.lock().expect("request log poisoned").clone()
    }
}

#[async_trait]
impl IntentionSubmitter for MockSubmitter {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse> {
        self.requests
            .lock()
            .expect("request log poisoned")
            .push(request.clone());
        Ok(self.response.clone())
    }
}
