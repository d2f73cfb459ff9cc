use std::{
    collections::HashSet,
    sync::Arc,
};

use bitcoin::{Network, Psbt, Transaction, Txid};
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::{
    address::classify_script,
    ledger::{self, UtxoCandidates},
    metrics::{BuildOutcomeLabel, METRICS},
    runes,
    selector::select_btc,
    traits::{FeeEstimator, IntentionSubmitter, UtxoSource},
    types::{
        ClientError, CoinId, Intention, IntentionSet, Result, SubmitRequest, SubmitResponse,
        Utxo, DUST_THRESHOLD,
    },
};

mod assembler;
pub mod test_utils;

use assembler::TxAssembler;

/// Fee and funding must stabilize within this many estimator round trips.
const MAX_FEE_ITERATIONS: u32 = 10;

/// Finished build: an unsigned transaction ready for the initiator's wallet,
/// plus the intention set to submit alongside the signed hex.
#[derive(Debug)]
pub struct BuiltTransaction {
    pub psbt: Psbt,
    pub unsigned_tx: Transaction,
    pub txid: Txid,
    /// True on-chain fee, discarded dust included.
    pub fee_in_sats: u64,
    pub consumed_utxos: Vec<Utxo>,
    pub intention_set: IntentionSet,
}

/// Turns a batch of intentions into one transaction that consumes the
/// involved pools, reissues them with their post-trade balances, routes rune
/// edicts, and funds the remainder from the initiator's payment address.
pub struct TransactionBuilder {
    utxo_source: Arc<dyn UtxoSource>,
    fee_estimator: Arc<dyn FeeEstimator>,
    submitter: Arc<dyn IntentionSubmitter>,
    network: Network,
    payment_address: String,
    /// When set, the initiator's own rune outputs absorb their BTC credit
    /// instead of getting a separate change-style output.
    merge_self_outputs: bool,
    intentions: Vec<Intention>,
    intention_set: Option<IntentionSet>,
}

impl TransactionBuilder {
    pub fn new(
        utxo_source: Arc<dyn UtxoSource>,
        fee_estimator: Arc<dyn FeeEstimator>,
        submitter: Arc<dyn IntentionSubmitter>,
        network: Network,
        payment_address: String,
        merge_self_outputs: bool,
    ) -> Self {
        Self {
            utxo_source,
            fee_estimator,
            submitter,
            network,
            payment_address,
            merge_self_outputs,
            intentions: Vec::new(),
            intention_set: None,
        }
    }

    pub fn add_intention(&mut self, intention: Intention) {
        self.intentions.push(intention);
    }

    pub fn intentions(&self) -> &[Intention] {
        &self.intentions
    }

    #[instrument(skip(self), fields(intentions = self.intentions.len()))]
    pub async fn build(&mut self) -> Result<BuiltTransaction> {
        METRICS.builds_started.inc();
        let result = self.build_inner().await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        METRICS.builds_finished[&BuildOutcomeLabel { outcome }].inc();
        result
    }

    async fn build_inner(&mut self) -> Result<BuiltTransaction> {
        if self.intentions.is_empty() {
            return Err(ClientError::NoIntentions);
        }

        let candidates = self.resolve_utxos().await;
        let settlement = ledger::settle(&self.intentions, &self.payment_address, &candidates)?;
        let mut credits = settlement.credits;

        let transfer =
            runes::encode_rune_outputs(&mut credits, &self.payment_address, self.merge_self_outputs)?;

        // The payment address never gets a credit output of its own; incoming
        // BTC offsets what the fee loop has to raise.
        let mut net_required = settlement.net_btc_required;
        if let Some(coins) = credits.get_mut(&self.payment_address) {
            if let Some(value) = coins.remove(&CoinId::Btc) {
                net_required -= value as i128;
            }
        }

        let mut assembler = TxAssembler::new(self.network);
        for input in settlement.inputs {
            assembler.add_input(input);
        }

        // Sats the outputs need beyond the ledger's gross credits (dust
        // floors).
        let mut dust_budget: u64 = 0;

        if let Some(transfer) = &transfer {
            for (address, value) in &transfer.recipients {
                assembler.add_output(address, *value)?;
            }
            assembler.add_data_output(transfer.op_return_script.clone());
            dust_budget += transfer.extra_dust;
        }

        let pool_set: HashSet<&str> = settlement.pools.iter().map(String::as_str).collect();
        for (address, coins) in &credits {
            let Some(&value) = coins.get(&CoinId::Btc) else {
                continue;
            };
            let sats = to_sats(value)?;
            if sats >= DUST_THRESHOLD {
                assembler.add_output(address, sats)?;
            } else if pool_set.contains(address.as_str()) {
                // A drained pool must still be reissued so it stays locatable.
                dust_budget += DUST_THRESHOLD - sats;
                assembler.add_output(address, DUST_THRESHOLD)?;
            } else {
                // Too small to be worth an output; the sats stay behind as
                // part of the fee.
                debug!(%address, sats, "dropping sub-dust credit");
            }
        }

        // Sats the payment selection has to raise, before the fee itself.
        let target_base: i128 =
            net_required + dust_budget as i128 - settlement.covered_sats as i128;

        let payment_candidates: Vec<Utxo> = candidates
            .btc
            .get(&self.payment_address)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .filter(|utxo| !assembler.contains_input(&utxo.outpoint()))
            .cloned()
            .collect();
        let change_type = classify_script(&assembler.script_for(&self.payment_address)?);
        let base_output_types = assembler.output_types();

        let mut fee: u64 = 0;
        let mut selected: Vec<Utxo> = Vec::new();
        let mut converged = false;

        for iteration in 0..MAX_FEE_ITERATIONS {
            let target = target_base + fee as i128;
            let need = to_sats_signed(target.max(0))?;
            let selected_total: u64 = selected.iter().map(|utxo| utxo.value).sum();
            if selected_total < need {
                // Greedy in-order selection is monotone, so re-selecting from
                // scratch only ever extends the previous pick.
                selected = select_btc(&payment_candidates, need, false, &self.payment_address)?;
            }
            let selected_total: u64 = selected.iter().map(|utxo| utxo.value).sum();

            let mut input_types = assembler.input_types();
            input_types.extend(selected.iter().map(|utxo| classify_script(&utxo.script_pubkey)));
            let mut output_types = base_output_types.clone();
            if selected_total as i128 - target > DUST_THRESHOLD as i128 {
                output_types.push(change_type);
            }

            let new_fee = self
                .fee_estimator
                .estimate_fee(&input_types, &settlement.pools, &output_types)
                .await?;
            debug!(iteration, fee = new_fee, selected = selected.len(), "fee loop pass");

            if new_fee <= fee {
                fee = new_fee;
                converged = true;
                METRICS.fee_loop_iterations.observe(iteration as usize + 1);
                break;
            }
            fee = new_fee;
        }
        if !converged {
            return Err(ClientError::FeeDidNotConverge(MAX_FEE_ITERATIONS));
        }

        let selected_total: u64 = selected.iter().map(|utxo| utxo.value).sum();
        for utxo in selected {
            assembler.add_input(utxo);
        }
        // Non-negative: the selection covered this target at a fee at least
        // as large as the converged one.
        let change = to_sats_signed(selected_total as i128 - (target_base + fee as i128))?;
        if change > DUST_THRESHOLD {
            assembler.add_output(&self.payment_address, change)?;
        }

        let consumed_utxos = assembler.inputs().to_vec();
        let inputs_total = assembler.total_input_sats();
        let (psbt, unsigned_tx) = assembler.into_psbt()?;
        let outputs_total: u64 = unsigned_tx
            .output
            .iter()
            .map(|out| out.value.to_sat())
            .sum();
        let fee_in_sats = inputs_total - outputs_total;
        let txid = unsigned_tx.compute_txid();

        let intention_set = IntentionSet {
            initiator_address: self.payment_address.clone(),
            fee_in_sats,
            intentions: self.intentions.clone(),
        };
        self.intention_set = Some(intention_set.clone());

        debug!(%txid, fee_in_sats, inputs = consumed_utxos.len(), "transaction built");

        Ok(BuiltTransaction {
            psbt,
            unsigned_tx,
            txid,
            fee_in_sats,
            consumed_utxos,
            intention_set,
        })
    }

    /// Submits the signed transaction together with the intention set from
    /// the last successful build.
    #[instrument(skip(self, signed_transaction_hex))]
    pub async fn send(&self, signed_transaction_hex: &str) -> Result<String> {
        if self.intentions.is_empty() {
            return Err(ClientError::NoIntentions);
        }
        let intention_set = self.intention_set.as_ref().ok_or_else(|| {
            ClientError::TransactionBuildingError("send called before build".to_string())
        })?;

        let request = SubmitRequest {
            fee_in_smallest_unit: intention_set.fee_in_sats,
            initiator_address: intention_set.initiator_address.clone(),
            intentions: intention_set.intentions.clone(),
            signed_transaction_hex: signed_transaction_hex.to_string(),
        };

        match self.submitter.submit(&request).await? {
            SubmitResponse::Accepted { txid } => {
                debug!(%txid, "intention set accepted");
                Ok(txid)
            }
            SubmitResponse::Rejected(details) => {
                let message = match &details.execution_step_error {
                    Some(step_error) => step_error.clone(),
                    None => serde_json::to_string(&details).unwrap_or(details.kind.clone()),
                };
                Err(ClientError::SubmissionRejected(message))
            }
        }
    }

    /// Fetches every UTXO set one build can touch: pool holdings and payment
    /// BTC via the BTC index, per-rune candidates for other spenders. A failed
    /// fetch degrades to an empty set; the ledger raises the precise shortfall.
    async fn resolve_utxos(&self) -> UtxoCandidates {
        let mut btc_addresses: Vec<String> = Vec::new();
        let mut seen_btc: HashSet<String> = HashSet::new();
        let mut rune_requests: Vec<(String, CoinId)> = Vec::new();
        let mut seen_runes: HashSet<(String, CoinId)> = HashSet::new();

        let mut want_btc = |address: &str,
                            addresses: &mut Vec<String>,
                            seen: &mut HashSet<String>| {
            if seen.insert(address.to_string()) {
                addresses.push(address.to_string());
            }
        };

        for intention in &self.intentions {
            want_btc(&intention.pool_address, &mut btc_addresses, &mut seen_btc);
        }
        want_btc(&self.payment_address, &mut btc_addresses, &mut seen_btc);

        for intention in &self.intentions {
            for input in &intention.input_coins {
                if input.from == intention.pool_address {
                    continue;
                }
                if input.coin.id.is_btc() {
                    want_btc(&input.from, &mut btc_addresses, &mut seen_btc);
                } else {
                    let key = (input.from.clone(), input.coin.id);
                    if seen_runes.insert(key.clone()) {
                        rune_requests.push(key);
                    }
                }
            }
        }

        let mut candidates = UtxoCandidates::default();

        let btc_results = join_all(
            btc_addresses
                .iter()
                .map(|address| self.utxo_source.fetch_btc_utxos(address)),
        )
        .await;
        for (address, result) in btc_addresses.into_iter().zip(btc_results) {
            match result {
                Ok(utxos) => {
                    candidates.btc.insert(address, utxos);
                }
                Err(error) => {
                    warn!(%address, %error, "utxo fetch failed, treating as empty");
                    candidates.btc.insert(address, Vec::new());
                }
            }
        }

        let rune_results = join_all(
            rune_requests
                .iter()
                .map(|(address, rune)| self.utxo_source.fetch_rune_utxos(address, *rune)),
        )
        .await;
        for (key, result) in rune_requests.into_iter().zip(rune_results) {
            match result {
                Ok(utxos) => {
                    candidates.runes.insert(key, utxos);
                }
                Err(error) => {
                    warn!(address = %key.0, rune = %key.1, %error, "utxo fetch failed, treating as empty");
                    candidates.runes.insert(key, Vec::new());
                }
            }
        }

        candidates
    }
}

fn to_sats(value: u128) -> Result<u64> {
    value
        .try_into()
        .map_err(|_| ClientError::TransactionBuildingError("btc amount exceeds u64".to_string()))
}

fn to_sats_signed(value: i128) -> Result<u64> {
    value
        .try_into()
        .map_err(|_| ClientError::TransactionBuildingError("btc amount out of range".to_string()))
}
