use std::{fmt, str::FromStr};

pub use bitcoin::Network;
use bitcoin::{OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum value of a standalone output. Anything strictly between zero and
/// this is non-standard and must never be emitted.
pub const DUST_THRESHOLD: u64 = 546;

/// Identifier of a coin moved by an intention: either native BTC or a Rune
/// etched at `block:tx`. The canonical text form is `"0:0"` for BTC and
/// `"{block}:{tx}"` for runes; serde uses the text form on the wire.
///
/// The `Ord` derive puts BTC first and sorts runes by `(block, tx)`; rune
/// output emission relies on this order being stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoinId {
    Btc,
    Rune { block: u64, tx: u32 },
}

impl CoinId {
    pub const fn rune(block: u64, tx: u32) -> Self {
        CoinId::Rune { block, tx }
    }

    pub fn is_btc(&self) -> bool {
        matches!(self, CoinId::Btc)
    }
}

impl fmt::Display for CoinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinId::Btc => write!(f, "0:0"),
            CoinId::Rune { block, tx } => write!(f, "{block}:{tx}"),
        }
    }
}

impl FromStr for CoinId {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        let (block, tx) = s
            .split_once(':')
            .ok_or_else(|| ClientError::InvalidCoinId(s.to_string()))?;
        let block: u64 = block
            .parse()
            .map_err(|_| ClientError::InvalidCoinId(s.to_string()))?;
        let tx: u32 = tx
            .parse()
            .map_err(|_| ClientError::InvalidCoinId(s.to_string()))?;
        if block == 0 && tx == 0 {
            Ok(CoinId::Btc)
        } else {
            Ok(CoinId::Rune { block, tx })
        }
    }
}

impl Serialize for CoinId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CoinId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An exact amount of one coin, in its smallest unit. No floats anywhere on
/// the build path; the wire form is a decimal string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinAmount {
    pub id: CoinId,
    #[serde(with = "string_u128")]
    pub value: u128,
}

impl CoinAmount {
    pub fn new(id: CoinId, value: u128) -> Self {
        Self { id, value }
    }
}

/// A spendable output as reported by the indexer. Immutable snapshot: the
/// owning address is whatever the indexer said at fetch time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    /// Satoshis, string-encoded on the wire to avoid precision loss.
    #[serde(with = "string_u64")]
    pub value: u64,
    pub address: String,
    pub script_pubkey: ScriptBuf,
    #[serde(default)]
    pub rune_balances: Vec<CoinAmount>,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }

    /// Balance this UTXO carries for one rune, zero if absent.
    pub fn rune_amount(&self, id: CoinId) -> u128 {
        self.rune_balances
            .iter()
            .find(|b| b.id == id)
            .map(|b| b.value)
            .unwrap_or(0)
    }

    pub fn has_runes(&self) -> bool {
        self.rune_balances.iter().any(|b| b.value > 0)
    }
}

/// Value flowing from `from` into the intention's pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputCoin {
    pub coin: CoinAmount,
    pub from: String,
}

/// Value flowing out of the intention's pool to `to`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputCoin {
    pub coin: CoinAmount,
    pub to: String,
}

/// One declarative operation against a pool. The action string is opaque to
/// the builder and passed through to the submission endpoint untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intention {
    pub exchange_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_params: Option<String>,
    pub pool_address: String,
    pub nonce: u64,
    pub input_coins: Vec<InputCoin>,
    pub output_coins: Vec<OutputCoin>,
}

/// The intention list as assembled at send time, together with the converged
/// fee and the initiator's refund address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentionSet {
    pub initiator_address: String,
    #[serde(with = "string_u64")]
    pub fee_in_sats: u64,
    pub intentions: Vec<Intention>,
}

/// Wire payload handed to the submission endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(rename = "feeInSmallestUnit", with = "string_u64")]
    pub fee_in_smallest_unit: u64,
    pub initiator_address: String,
    pub intentions: Vec<Intention>,
    pub signed_transaction_hex: String,
}

/// Structured rejection returned by the submission endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionDetails {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_step_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmitResponse {
    Accepted { txid: String },
    Rejected(RejectionDetails),
}

/// Script-type tag used for input/output size accounting only. Real locking
/// scripts always come from the UTXO or the parsed address, never from this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    P2pkh,
    P2sh,
    P2shP2wpkh,
    P2wpkh,
    P2wsh,
    P2tr,
    /// Data-carrying output; the payload is the full script length in bytes.
    OpReturn(usize),
    Unknown,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("insufficient btc funds for {address}: need {need} sats, have {have} sats")]
    InsufficientFunds {
        address: String,
        need: u64,
        have: u64,
    },

    #[error("insufficient rune {rune} funds for {address}: need {need}, have {have}")]
    InsufficientRuneFunds {
        address: String,
        rune: CoinId,
        need: u128,
        have: u128,
    },

    #[error("no intentions added to the transaction")]
    NoIntentions,

    #[error("pool {pool} balance for {coin} would go negative: required {required}, available {available}")]
    PoolBalanceViolation {
        pool: String,
        coin: CoinId,
        required: u128,
        available: u128,
    },

    #[error("fee estimation did not converge after {0} iterations")]
    FeeDidNotConverge(u32),

    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid coin id: {0}")]
    InvalidCoinId(String),

    #[error("fee estimation error: {0}")]
    FeeEstimationFailed(String),

    #[error("utxo fetch error: {0}")]
    UtxoFetchFailed(String),

    #[error("transaction building error: {0}")]
    TransactionBuildingError(String),

    #[error("psbt error: {0}")]
    Psbt(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<bitcoin::address::ParseError> for ClientError {
    fn from(error: bitcoin::address::ParseError) -> Self {
        ClientError::InvalidAddress(error.to_string())
    }
}

impl From<bitcoin::psbt::Error> for ClientError {
    fn from(error: bitcoin::psbt::Error) -> Self {
        ClientError::Psbt(error.to_string())
    }
}

pub(crate) mod string_u64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

pub(crate) mod string_u128 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coin_id_round_trip() {
        assert_eq!("0:0".parse::<CoinId>().unwrap(), CoinId::Btc);
        assert_eq!(
            "840000:3".parse::<CoinId>().unwrap(),
            CoinId::rune(840000, 3)
        );
        assert_eq!(CoinId::Btc.to_string(), "0:0");
        assert_eq!(CoinId::rune(840000, 3).to_string(), "840000:3");
        assert!("840000".parse::<CoinId>().is_err());
        assert!("a:b".parse::<CoinId>().is_err());
    }

    #[test]
    fn test_coin_id_ordering() {
        let mut coins = vec![
            CoinId::rune(840000, 3),
            CoinId::Btc,
            CoinId::rune(840000, 1),
            CoinId::rune(2, 0),
        ];
        coins.sort();
        assert_eq!(
            coins,
            vec![
                CoinId::Btc,
                CoinId::rune(2, 0),
                CoinId::rune(840000, 1),
                CoinId::rune(840000, 3),
            ]
        );
    }

    #[test]
    fn test_submit_request_wire_shape() {
        let request = SubmitRequest {
            fee_in_smallest_unit: 1000,
            initiator_address: "bcrt1qexample".to_string(),
            intentions: vec![Intention {
                exchange_id: "RICH_SWAP".to_string(),
                action: "deposit".to_string(),
                action_params: None,
                pool_address: "bcrt1pexample".to_string(),
                nonce: 7,
                input_coins: vec![InputCoin {
                    coin: CoinAmount::new(CoinId::Btc, 10_000),
                    from: "bcrt1qexample".to_string(),
                }],
                output_coins: vec![],
            }],
            signed_transaction_hex: "02000000".to_string(),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["feeInSmallestUnit"], "1000");
        assert_eq!(json["initiatorAddress"], "bcrt1qexample");
        assert_eq!(json["intentions"][0]["poolAddress"], "bcrt1pexample");
        assert_eq!(json["intentions"][0]["inputCoins"][0]["coin"]["id"], "0:0");
        assert_eq!(
            json["intentions"][0]["inputCoins"][0]["coin"]["value"],
            "10000"
        );

        let back: SubmitRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }
}
