use std::collections::HashSet;

use bitcoin::{
    absolute, address::NetworkUnchecked, transaction, Address, Amount, Network, OutPoint, Psbt,
    ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use crate::{
    address::classify_script,
    types::{AddressType, Result, Utxo},
};

/// Owns the evolving transaction: inputs deduplicated by outpoint, outputs in
/// emission order with the data-carrying output (if any) always first.
/// Script-type lists are derived from this authoritative state on demand, so
/// they cannot drift out of sync with the real inputs/outputs.
#[derive(Debug)]
pub(crate) struct TxAssembler {
    network: Network,
    inputs: Vec<Utxo>,
    seen: HashSet<OutPoint>,
    outputs: Vec<TxOut>,
}

impl TxAssembler {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            inputs: Vec::new(),
            seen: HashSet::new(),
            outputs: Vec::new(),
        }
    }

    /// Adds an input, ignoring duplicates of the same outpoint.
    pub fn add_input(&mut self, utxo: Utxo) -> bool {
        if !self.seen.insert(utxo.outpoint()) {
            return false;
        }
        self.inputs.push(utxo);
        true
    }

    pub fn add_output(&mut self, address: &str, value: u64) -> Result<()> {
        let script_pubkey = self.script_for(address)?;
        self.outputs.push(TxOut {
            value: Amount::from_sat(value),
            script_pubkey,
        });
        Ok(())
    }

    /// Zero-value data-carrying output; always lands at index 0.
    pub fn add_data_output(&mut self, script: ScriptBuf) {
        self.outputs.insert(
            0,
            TxOut {
                value: Amount::ZERO,
                script_pubkey: script,
            },
        );
    }

    pub fn script_for(&self, address: &str) -> Result<ScriptBuf> {
        let parsed: Address<NetworkUnchecked> = address.parse()?;
        Ok(parsed.require_network(self.network)?.script_pubkey())
    }

    pub fn input_types(&self) -> Vec<AddressType> {
        self.inputs
            .iter()
            .map(|utxo| classify_script(&utxo.script_pubkey))
            .collect()
    }

    pub fn output_types(&self) -> Vec<AddressType> {
        self.outputs
            .iter()
            .map(|out| classify_script(&out.script_pubkey))
            .collect()
    }

    pub fn contains_input(&self, outpoint: &OutPoint) -> bool {
        self.seen.contains(outpoint)
    }

    pub fn inputs(&self) -> &[Utxo] {
        &self.inputs
    }

    pub fn total_input_sats(&self) -> u64 {
        self.inputs.iter().map(|utxo| utxo.value).sum()
    }

    pub fn unsigned_tx(&self) -> Transaction {
        let input: Vec<TxIn> = self
            .inputs
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint(),
                script_sig: ScriptBuf::default(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            })
            .collect();

        Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input,
            output: self.outputs.clone(),
        }
    }

    /// Finalizes into a PSBT with per-input witness data attached.
    pub fn into_psbt(self) -> Result<(Psbt, Transaction)> {
        let tx = self.unsigned_tx();
        let mut psbt = Psbt::from_unsigned_tx(tx.clone())?;
        for (index, utxo) in self.inputs.iter().enumerate() {
            psbt.inputs[index].witness_utxo = Some(TxOut {
                value: Amount::from_sat(utxo.value),
                script_pubkey: utxo.script_pubkey.clone(),
            });
        }
        Ok((psbt, tx))
    }
}
