use crate::types::{ClientError, CoinId, Result, Utxo};

/// Walks the candidate list once, in the order supplied by the caller, and
/// accumulates until the target is covered. UTXOs carrying rune balances are
/// skipped unless `allow_rune_bearing` is set (pools co-mingle BTC and rune
/// value, so selection from a pool's own set must take everything offered).
pub fn select_btc(
    candidates: &[Utxo],
    target: u64,
    allow_rune_bearing: bool,
    address: &str,
) -> Result<Vec<Utxo>> {
    if target == 0 {
        return Ok(Vec::new());
    }

    let mut selected = Vec::new();
    let mut total: u64 = 0;

    for utxo in candidates {
        if !allow_rune_bearing && utxo.has_runes() {
            continue;
        }
        total = total.saturating_add(utxo.value);
        selected.push(utxo.clone());
        if total >= target {
            return Ok(selected);
        }
    }

    Err(ClientError::InsufficientFunds {
        address: address.to_string(),
        need: target,
        have: total,
    })
}

/// Rune selection prefers a single UTXO whose balance for `rune_id` matches
/// the target exactly, which avoids a change output entirely. Failing that it
/// accumulates in caller order, summing only the matching rune's balance.
pub fn select_rune(
    candidates: &[Utxo],
    rune_id: CoinId,
    target: u128,
    address: &str,
) -> Result<Vec<Utxo>> {
    if target == 0 {
        return Ok(Vec::new());
    }

    if let Some(exact) = candidates
        .iter()
        .find(|utxo| utxo.rune_amount(rune_id) == target)
    {
        return Ok(vec![exact.clone()]);
    }

    let mut selected = Vec::new();
    let mut total: u128 = 0;

    for utxo in candidates {
        let amount = utxo.rune_amount(rune_id);
        if amount == 0 {
            continue;
        }
        total = total.saturating_add(amount);
        selected.push(utxo.clone());
        if total >= target {
            return Ok(selected);
        }
    }

    Err(ClientError::InsufficientRuneFunds {
        address: address.to_string(),
        rune: rune_id,
        need: target,
        have: total,
    })
}
