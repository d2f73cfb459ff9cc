use async_trait::async_trait;

use crate::{
    traits::FeeEstimator,
    types::{AddressType, Result},
};

// Transaction envelope sizes.
// https://bitcoinops.org/en/tools/calc-size/
// https://en.bitcoin.it/wiki/Protocol_documentation#Common_structures
const VERSION_SIZE: usize = 4;
const INPUT_COUNT_SIZE: usize = 1;
const OUTPUT_COUNT_SIZE: usize = 1;
const LOCKTIME_SIZE: usize = 4;
const MARKER_FLAGS_SIZE: usize = 1; // 1/2

// p2wpkh input base size
// out point (36) txid + vout of the output being spent
// scriptSig length (1), scriptSig (0) - empty for segwit spends
// sequence number (4)
// Witness item count (1/4)
// witness item (27)
//     ( (73) signature + (34) public key ) / 4
// 36 + 1 + 0 + 4 + 1 + 27 = 69
const P2WPKH_INPUT_SIZE: usize = 69;

// p2tr input base size
// out point (36), scriptSig length (1), scriptSig (0), sequence (4)
// Witness item count (3) + (65) schnorr signature / 4 = 17
// 36 + 1 + 0 + 4 + 3 + 17 = 61
const P2TR_INPUT_SIZE: usize = 61;

// Legacy p2pkh input: out point (36) + scriptSig length (1) +
// scriptSig (107: signature + pubkey, no witness discount) + sequence (4)
const P2PKH_INPUT_SIZE: usize = 148;

// p2sh-p2wpkh input: legacy fields (36 + 1 + 23 + 4) + witness / 4 (27)
const P2SH_P2WPKH_INPUT_SIZE: usize = 91;

// p2wsh input priced for a single-key witness script; multisig scripts are
// larger, but the remote estimator is the authority for those.
const P2WSH_INPUT_SIZE: usize = 105;

// value (8) + scriptPubKey length (1) + scriptPubKey
const P2PKH_OUTPUT_SIZE: usize = 34; // 25-byte script
const P2SH_OUTPUT_SIZE: usize = 32; // 23-byte script
const P2WPKH_OUTPUT_SIZE: usize = 31; // 22-byte script
const P2WSH_OUTPUT_SIZE: usize = 43; // 34-byte script
const P2TR_OUTPUT_SIZE: usize = 43; // 34-byte script

fn input_vsize(address_type: AddressType) -> usize {
    match address_type {
        AddressType::P2pkh => P2PKH_INPUT_SIZE,
        AddressType::P2sh => P2SH_P2WPKH_INPUT_SIZE,
        AddressType::P2shP2wpkh => P2SH_P2WPKH_INPUT_SIZE,
        AddressType::P2wpkh => P2WPKH_INPUT_SIZE,
        AddressType::P2wsh => P2WSH_INPUT_SIZE,
        AddressType::P2tr => P2TR_INPUT_SIZE,
        // Data outputs are never spent; unknown scripts get the worst case.
        AddressType::OpReturn(_) => 0,
        AddressType::Unknown => P2PKH_INPUT_SIZE,
    }
}

fn output_vsize(address_type: AddressType) -> usize {
    match address_type {
        AddressType::P2pkh => P2PKH_OUTPUT_SIZE,
        AddressType::P2sh | AddressType::P2shP2wpkh => P2SH_OUTPUT_SIZE,
        AddressType::P2wpkh => P2WPKH_OUTPUT_SIZE,
        AddressType::P2wsh => P2WSH_OUTPUT_SIZE,
        AddressType::P2tr => P2TR_OUTPUT_SIZE,
        AddressType::OpReturn(script_len) => 8 + 1 + script_len,
        AddressType::Unknown => P2TR_OUTPUT_SIZE,
    }
}

/// Virtual size of a transaction with the given input and output shapes.
pub fn estimate_vsize(input_types: &[AddressType], output_types: &[AddressType]) -> usize {
    let base =
        VERSION_SIZE + INPUT_COUNT_SIZE + OUTPUT_COUNT_SIZE + LOCKTIME_SIZE + MARKER_FLAGS_SIZE;
    let inputs: usize = input_types.iter().map(|t| input_vsize(*t)).sum();
    let outputs: usize = output_types.iter().map(|t| output_vsize(*t)).sum();
    base + inputs + outputs
}

/// Local size-table fee estimator: vsize times a flat sat/vB rate. The default
/// `FeeEstimator` when no remote service is wired in, and the workhorse for
/// tests that need a fee that actually grows with input count.
#[derive(Debug, Clone, Copy)]
pub struct SizeFeeEstimator {
    fee_rate: u64,
}

impl SizeFeeEstimator {
    pub fn new(fee_rate: u64) -> Self {
        Self { fee_rate }
    }
}

#[async_trait]
impl FeeEstimator for SizeFeeEstimator {
    async fn estimate_fee(
        &self,
        input_types: &[AddressType],
        _pool_addresses: &[String],
        output_types: &[AddressType],
    ) -> Result<u64> {
        let vsize = estimate_vsize(input_types, output_types);
        Ok(vsize as u64 * self.fee_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_vsize() {
        // 11 base + 69 input + 31 + 31 outputs
        assert_eq!(
            estimate_vsize(
                &[AddressType::P2wpkh],
                &[AddressType::P2wpkh, AddressType::P2wpkh]
            ),
            142
        );
    }

    #[test]
    fn test_vsize_grows_with_inputs() {
        let one = estimate_vsize(&[AddressType::P2tr], &[AddressType::P2wpkh]);
        let two = estimate_vsize(
            &[AddressType::P2tr, AddressType::P2wpkh],
            &[AddressType::P2wpkh],
        );
        assert_eq!(two - one, 69);
    }

    #[tokio::test]
    async fn test_size_fee_estimator() {
        let estimator = SizeFeeEstimator::new(2);
        let fee = estimator
            .estimate_fee(&[AddressType::P2wpkh], &[], &[AddressType::P2wpkh])
            .await
            .unwrap();
        assert_eq!(fee, 2 * (11 + 69 + 31));
    }
}
