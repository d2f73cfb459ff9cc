use std::collections::BTreeSet;

use bitcoin::ScriptBuf;
use ordinals::{Edict, RuneId, Runestone};
use tracing::debug;

use crate::{
    ledger::CreditMap,
    types::{ClientError, CoinId, Result, DUST_THRESHOLD},
};

/// The rune leg of a transaction: a zero-value runestone output at index 0
/// and one recipient output per edict, starting at index 1.
#[derive(Debug)]
pub(crate) struct RuneTransfer {
    pub op_return_script: ScriptBuf,
    /// `(address, sats)` in edict order.
    pub recipients: Vec<(String, u64)>,
    /// Dust the fee loop must fund on top of the net BTC requirement.
    pub extra_dust: u64,
}

/// Drains every rune credit from the map into edicts and recipient outputs.
///
/// Runes iterate in `CoinId` order; within a rune, recipients follow the
/// credit map's address order (lexicographic). Output indices are assigned in
/// that traversal order, starting at 1 because index 0 carries the runestone
/// itself.
///
/// A recipient output reuses the address's positive BTC credit when merging
/// is allowed; the initiator's own outputs stay at the dust value unless
/// `merge_self_outputs` is set. Consumed BTC credits are removed from the map
/// so the builder does not emit them twice.
pub(crate) fn encode_rune_outputs(
    credits: &mut CreditMap,
    payment_address: &str,
    merge_self_outputs: bool,
) -> Result<Option<RuneTransfer>> {
    let rune_ids: BTreeSet<CoinId> = credits
        .values()
        .flat_map(|coins| coins.iter())
        .filter(|(coin, value)| !coin.is_btc() && **value > 0)
        .map(|(coin, _)| *coin)
        .collect();

    if rune_ids.is_empty() {
        return Ok(None);
    }

    let mut triples: Vec<(String, CoinId, u128)> = Vec::new();
    for rune in &rune_ids {
        for (address, coins) in credits.iter() {
            if let Some(value) = coins.get(rune) {
                if *value > 0 {
                    triples.push((address.clone(), *rune, *value));
                }
            }
        }
    }

    let mut edicts = Vec::with_capacity(triples.len());
    let mut recipients = Vec::with_capacity(triples.len());
    let mut extra_dust: u64 = 0;

    for (index, (address, rune, amount)) in triples.iter().enumerate() {
        let CoinId::Rune { block, tx } = rune else {
            unreachable!("btc filtered out of rune credits");
        };
        edicts.push(Edict {
            id: RuneId {
                block: *block,
                tx: *tx,
            },
            amount: *amount,
            output: (index + 1) as u32,
        });

        let merge_allowed = merge_self_outputs || address != payment_address;
        let btc_credit = credits
            .get(address)
            .and_then(|coins| coins.get(&CoinId::Btc))
            .copied()
            .unwrap_or(0);

        let value = if merge_allowed && btc_credit > 0 {
            let sats: u64 = btc_credit.try_into().map_err(|_| {
                ClientError::TransactionBuildingError("btc amount exceeds u64".to_string())
            })?;
            if let Some(coins) = credits.get_mut(address) {
                coins.remove(&CoinId::Btc);
            }
            if sats < DUST_THRESHOLD {
                // The output must exist to carry the runes; top it up.
                extra_dust += DUST_THRESHOLD - sats;
                DUST_THRESHOLD
            } else {
                sats
            }
        } else {
            extra_dust += DUST_THRESHOLD;
            DUST_THRESHOLD
        };
        recipients.push((address.clone(), value));

        if let Some(coins) = credits.get_mut(address) {
            coins.remove(rune);
        }
    }

    // Per-rune totals referenced by the edicts must equal the credits they
    // were built from; anything else is a bug upstream, not a runtime state.
    debug_assert!(credits
        .values()
        .flat_map(|coins| coins.keys())
        .all(CoinId::is_btc));

    let op_return_script = Runestone {
        edicts,
        etching: None,
        mint: None,
        pointer: None,
    }
    .encipher();

    debug!(
        recipients = recipients.len(),
        extra_dust,
        runestone_len = op_return_script.len(),
        "encoded rune transfer"
    );

    Ok(Some(RuneTransfer {
        op_return_script,
        recipients,
        extra_dust,
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bitcoin::{absolute, transaction, Amount, Transaction, TxOut};
    use ordinals::Artifact;

    use super::*;
    use crate::builder::test_utils::{payment_address, pool_address, user_address};

    const RUNE_X: CoinId = CoinId::rune(840000, 3);
    const RUNE_Y: CoinId = CoinId::rune(845000, 1);

    fn credit(map: &mut CreditMap, address: &str, coin: CoinId, value: u128) {
        map.entry(address.to_string())
            .or_default()
            .insert(coin, value);
    }

    /// Minimal transaction with the runestone at index 0 and a placeholder
    /// output per recipient, enough for `Runestone::decipher`.
    fn decipher_tx(transfer: &RuneTransfer) -> Transaction {
        let mut output = vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: transfer.op_return_script.clone(),
        }];
        for (_, value) in &transfer.recipients {
            output.push(TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: bitcoin::ScriptBuf::new(),
            });
        }
        Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![],
            output,
        }
    }

    #[test]
    fn test_pure_btc_skips_runestone() {
        let mut credits = CreditMap::new();
        credit(&mut credits, &pool_address(), CoinId::Btc, 60_000);
        let transfer =
            encode_rune_outputs(&mut credits, &payment_address(), false).unwrap();
        assert!(transfer.is_none());
        assert_eq!(credits[&pool_address()][&CoinId::Btc], 60_000);
    }

    #[test]
    fn test_recipient_order_and_merging() {
        let pool = pool_address();
        let user = user_address();
        let mut credits = CreditMap::new();
        credit(&mut credits, &pool, CoinId::Btc, 40_000);
        credit(&mut credits, &pool, RUNE_X, 3_000);
        credit(&mut credits, &user, RUNE_X, 12_000);

        let transfer = encode_rune_outputs(&mut credits, &payment_address(), false)
            .unwrap()
            .unwrap();

        // Addresses iterate lexicographically; the user address sorts first.
        assert!(user < pool);
        assert_eq!(transfer.recipients.len(), 2);
        assert_eq!(transfer.recipients[0], (user.clone(), DUST_THRESHOLD));
        // The pool's BTC credit merges into its rune output.
        assert_eq!(transfer.recipients[1], (pool.clone(), 40_000));
        assert_eq!(transfer.extra_dust, DUST_THRESHOLD);

        // All credits consumed.
        assert!(credits.is_empty() || credits.values().all(|c| c.is_empty()));

        // Round-trip through the consensus decoder: edict totals per rune
        // match the credits they encode. The decoder treats edicts pointing
        // past the output list as a cenotaph, so recipient outputs must be
        // present.
        let tx = decipher_tx(&transfer);
        let Some(Artifact::Runestone(runestone)) = Runestone::decipher(&tx) else {
            panic!("runestone did not decipher");
        };
        assert_eq!(runestone.edicts.len(), 2);
        assert_eq!(runestone.edicts[0].amount, 12_000);
        assert_eq!(runestone.edicts[0].output, 1);
        assert_eq!(runestone.edicts[1].amount, 3_000);
        assert_eq!(runestone.edicts[1].output, 2);
    }

    #[test]
    fn test_self_outputs_kept_separate() {
        let payment = payment_address();
        let mut credits = CreditMap::new();
        credit(&mut credits, &payment, CoinId::Btc, 20_000);
        credit(&mut credits, &payment, RUNE_X, 1_000);

        let transfer = encode_rune_outputs(&mut credits, &payment, false)
            .unwrap()
            .unwrap();
        // Without merging, the rune output gets dust and the BTC credit stays.
        assert_eq!(transfer.recipients[0], (payment.clone(), DUST_THRESHOLD));
        assert_eq!(transfer.extra_dust, DUST_THRESHOLD);
        assert_eq!(credits[&payment][&CoinId::Btc], 20_000);

        let mut credits = CreditMap::new();
        credit(&mut credits, &payment, CoinId::Btc, 20_000);
        credit(&mut credits, &payment, RUNE_X, 1_000);
        let transfer = encode_rune_outputs(&mut credits, &payment, true)
            .unwrap()
            .unwrap();
        assert_eq!(transfer.recipients[0], (payment.clone(), 20_000));
        assert_eq!(transfer.extra_dust, 0);
    }

    #[test]
    fn test_multiple_runes_iterate_in_coin_order() {
        let user = user_address();
        let mut credits = CreditMap::new();
        credit(&mut credits, &user, RUNE_Y, 7);
        credit(&mut credits, &user, RUNE_X, 5);

        let transfer = encode_rune_outputs(&mut credits, &payment_address(), false)
            .unwrap()
            .unwrap();
        assert_eq!(transfer.recipients.len(), 2);

        let tx = decipher_tx(&transfer);
        let Some(Artifact::Runestone(runestone)) = Runestone::decipher(&tx) else {
            panic!("runestone did not decipher");
        };
        // RUNE_X (840000:3) sorts before RUNE_Y (845000:1).
        assert_eq!(runestone.edicts[0].amount, 5);
        assert_eq!(runestone.edicts[1].amount, 7);
    }

    #[test]
    fn test_sub_dust_btc_credit_topped_up() {
        let user = user_address();
        let mut credits: CreditMap = BTreeMap::new();
        credit(&mut credits, &user, CoinId::Btc, 300);
        credit(&mut credits, &user, RUNE_X, 5);

        let transfer = encode_rune_outputs(&mut credits, &payment_address(), false)
            .unwrap()
            .unwrap();
        assert_eq!(transfer.recipients[0], (user, DUST_THRESHOLD));
        assert_eq!(transfer.extra_dust, DUST_THRESHOLD - 300);
    }
}
