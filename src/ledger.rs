use std::collections::{BTreeMap, HashMap, HashSet};

use bitcoin::OutPoint;
use tracing::debug;

use crate::{
    selector::{select_btc, select_rune},
    types::{ClientError, CoinId, Intention, Result, Utxo},
};

/// UTXO candidates fetched for one build, keyed the way the indexer was
/// asked. Pool holdings live under `btc` (pool UTXOs come back with their
/// rune balances annotated); `runes` holds per-(address, rune) candidates for
/// user addresses.
#[derive(Debug, Default)]
pub(crate) struct UtxoCandidates {
    pub btc: HashMap<String, Vec<Utxo>>,
    pub runes: HashMap<(String, CoinId), Vec<Utxo>>,
}

impl UtxoCandidates {
    fn btc_for(&self, address: &str) -> &[Utxo] {
        self.btc.get(address).map(Vec::as_slice).unwrap_or(&[])
    }

    fn runes_for(&self, address: &str, rune: CoinId) -> &[Utxo] {
        self.runes
            .get(&(address.to_string(), rune))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Per-address, per-coin value map. BTreeMap on both levels so iteration is
/// the documented order: addresses lexicographic, coins in `CoinId` order.
pub(crate) type CreditMap = BTreeMap<String, BTreeMap<CoinId, u128>>;

/// Net result of running all intentions through the ledger.
#[derive(Debug)]
pub(crate) struct Settlement {
    /// Inputs consumed on behalf of pools and non-payment user addresses.
    pub inputs: Vec<Utxo>,
    /// Value owed to each address after the transaction, fee not yet applied.
    pub credits: CreditMap,
    /// Signed BTC requirement of the payment address, fee excluded. Positive
    /// means the fee loop must fund it; negative means the user is a net
    /// receiver.
    pub net_btc_required: i128,
    /// Sats already carried into the transaction by the payment address's
    /// rune-bearing inputs; they offset the fee-loop target.
    pub covered_sats: u64,
    /// Pool addresses involved, in first-reference order.
    pub pools: Vec<String>,
}

fn add_value(map: &mut CreditMap, address: &str, coin: CoinId, value: u128) {
    if value == 0 {
        return;
    }
    *map.entry(address.to_string())
        .or_default()
        .entry(coin)
        .or_insert(0) += value;
}

fn sub_value(map: &mut CreditMap, address: &str, coin: CoinId, value: u128) -> Result<()> {
    let balance = map
        .get_mut(address)
        .and_then(|coins| coins.get_mut(&coin))
        .ok_or_else(|| {
            ClientError::TransactionBuildingError(format!(
                "ledger underflow for {address} {coin}"
            ))
        })?;
    *balance = balance.checked_sub(value).ok_or_else(|| {
        ClientError::TransactionBuildingError(format!("ledger underflow for {address} {coin}"))
    })?;
    Ok(())
}

fn prune_zeroes(map: &mut CreditMap) {
    for coins in map.values_mut() {
        coins.retain(|_, value| *value > 0);
    }
    map.retain(|_, coins| !coins.is_empty());
}

fn btc_u64(value: u128) -> Result<u64> {
    value
        .try_into()
        .map_err(|_| ClientError::TransactionBuildingError("btc amount exceeds u64".to_string()))
}

/// Total value held by a UTXO set, per coin.
fn holdings_of(utxos: &[Utxo]) -> BTreeMap<CoinId, u128> {
    let mut held: BTreeMap<CoinId, u128> = BTreeMap::new();
    for utxo in utxos {
        *held.entry(CoinId::Btc).or_insert(0) += utxo.value as u128;
        for balance in &utxo.rune_balances {
            if balance.value > 0 {
                *held.entry(balance.id).or_insert(0) += balance.value;
            }
        }
    }
    held
}

/// Turns the intention list into consumed inputs and per-address credits.
///
/// Gross debits come from input_coins (by `from`) plus each pool's outflow
/// (its intentions' output_coins); gross credits from output_coins (by `to`)
/// plus each pool's inflow. A same-address passthrough (`from` equal to the
/// intention's own pool) is excluded from the gross sums and flagged, so the
/// pool's holdings flow through exactly once.
///
/// Pools are always fully consumed and fully reissued: every fetched pool
/// UTXO becomes an input and the pool is credited `holdings + inflow -
/// outflow` per coin, after the balance check. Non-pool addresses go through
/// the selectors per coin debit; everything a consumed UTXO carries beyond
/// the debit is credited back to its owner.
pub(crate) fn settle(
    intentions: &[Intention],
    payment_address: &str,
    candidates: &UtxoCandidates,
) -> Result<Settlement> {
    let mut debits: CreditMap = BTreeMap::new();
    let mut credits: CreditMap = BTreeMap::new();
    let mut pools: Vec<String> = Vec::new();
    let mut passthrough_pools: HashSet<String> = HashSet::new();

    for intention in intentions {
        let pool = &intention.pool_address;
        if !pools.contains(pool) {
            pools.push(pool.clone());
        }
        for input in &intention.input_coins {
            if input.from == *pool {
                // Pool-to-pool passthrough: the pool's holdings are carried
                // through untouched by the full-consumption rule below, so
                // the declared amount must not enter the gross sums.
                passthrough_pools.insert(pool.clone());
                continue;
            }
            add_value(&mut debits, &input.from, input.coin.id, input.coin.value);
            add_value(&mut credits, pool, input.coin.id, input.coin.value);
        }
        for output in &intention.output_coins {
            add_value(&mut credits, &output.to, output.coin.id, output.coin.value);
            add_value(&mut debits, pool, output.coin.id, output.coin.value);
        }
    }

    let pool_set: HashSet<&str> = pools.iter().map(String::as_str).collect();
    let mut inputs: Vec<Utxo> = Vec::new();
    let mut consumed: HashSet<OutPoint> = HashSet::new();

    // Pools: full consumption, full reissue.
    for pool in &pools {
        let holdings = candidates.btc_for(pool);
        let held = holdings_of(holdings);
        let empty = BTreeMap::new();
        let outflow = debits.get(pool).unwrap_or(&empty);
        let inflow = credits.get(pool).cloned().unwrap_or_default();

        for (coin, required) in outflow {
            let available =
                held.get(coin).copied().unwrap_or(0) + inflow.get(coin).copied().unwrap_or(0);
            if *required > available {
                return Err(ClientError::PoolBalanceViolation {
                    pool: pool.clone(),
                    coin: *coin,
                    required: *required,
                    available,
                });
            }
        }

        for utxo in holdings {
            if consumed.insert(utxo.outpoint()) {
                inputs.push(utxo.clone());
            }
        }
        for (coin, amount) in held {
            add_value(&mut credits, pool, coin, amount);
        }
        for (coin, required) in outflow.clone() {
            sub_value(&mut credits, pool, coin, required)?;
        }
        if passthrough_pools.contains(pool) {
            debug!(pool = %pool, "pool handled as passthrough");
        }
    }

    // Everyone else: per-coin selection, full value of consumed UTXOs
    // credited back to the owner.
    let mut net_btc_required: i128 = 0;
    let mut covered_sats: u64 = 0;

    for (address, coin_debits) in &debits {
        if pool_set.contains(address.as_str()) {
            continue;
        }
        let is_payment = address == payment_address;
        let mut consumed_value: BTreeMap<CoinId, u128> = BTreeMap::new();

        for (coin, required) in coin_debits {
            let already = consumed_value.get(coin).copied().unwrap_or(0);
            let remaining = required.saturating_sub(already);

            match coin {
                CoinId::Btc if is_payment => {
                    // Deferred: the payment address's BTC is resolved by the
                    // fee loop together with the fee itself.
                    net_btc_required += *required as i128;
                }
                CoinId::Btc => {
                    let available: Vec<Utxo> = candidates
                        .btc_for(address)
                        .iter()
                        .filter(|u| !consumed.contains(&u.outpoint()))
                        .cloned()
                        .collect();
                    let selected = select_btc(&available, btc_u64(remaining)?, false, address)?;
                    for utxo in selected {
                        if consumed.insert(utxo.outpoint()) {
                            *consumed_value.entry(CoinId::Btc).or_insert(0) +=
                                utxo.value as u128;
                            inputs.push(utxo);
                        }
                    }
                }
                rune => {
                    let available: Vec<Utxo> = candidates
                        .runes_for(address, *rune)
                        .iter()
                        .filter(|u| !consumed.contains(&u.outpoint()))
                        .cloned()
                        .collect();
                    let selected = select_rune(&available, *rune, remaining, address)?;
                    for utxo in selected {
                        if consumed.insert(utxo.outpoint()) {
                            *consumed_value.entry(CoinId::Btc).or_insert(0) +=
                                utxo.value as u128;
                            for balance in &utxo.rune_balances {
                                *consumed_value.entry(balance.id).or_insert(0) += balance.value;
                            }
                            inputs.push(utxo);
                        }
                    }
                }
            }
        }

        for (coin, value) in consumed_value {
            if is_payment && coin.is_btc() {
                covered_sats += btc_u64(value)?;
            } else {
                add_value(&mut credits, address, coin, value);
            }
        }
        for (coin, required) in coin_debits {
            if is_payment && coin.is_btc() {
                continue;
            }
            sub_value(&mut credits, address, *coin, *required)?;
        }
    }

    // The payment address's incoming BTC offsets its requirement rather than
    // becoming an output of its own; whatever the rune encoder doesn't merge
    // is folded in by the builder.
    prune_zeroes(&mut credits);

    debug!(
        inputs = inputs.len(),
        net_btc_required,
        covered_sats,
        pools = pools.len(),
        "ledger settled"
    );

    Ok(Settlement {
        inputs,
        credits,
        net_btc_required,
        covered_sats,
        pools,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::test_utils::{
        intention, payment_address, pool_address, rune_utxo, user_address, utxo,
    };
    use crate::types::{CoinAmount, InputCoin, OutputCoin};

    const RUNE_X: CoinId = CoinId::rune(840000, 3);

    fn candidates() -> UtxoCandidates {
        UtxoCandidates::default()
    }

    #[test]
    fn test_deposit_consumes_and_reissues_pool() {
        let payment = payment_address();
        let pool = pool_address();
        let deposit = intention(
            &pool,
            "deposit",
            vec![InputCoin {
                coin: CoinAmount::new(CoinId::Btc, 10_000),
                from: payment.clone(),
            }],
            vec![],
        );

        let mut candidates = candidates();
        candidates.btc.insert(pool.clone(), vec![utxo(&pool, 9, 0, 50_000)]);
        candidates
            .btc
            .insert(payment.clone(), vec![utxo(&payment, 1, 0, 120_000)]);

        let settlement = settle(&[deposit], &payment, &candidates).unwrap();

        // The pool's single UTXO is consumed and reissued with the deposit.
        assert_eq!(settlement.inputs.len(), 1);
        assert_eq!(settlement.credits[&pool][&CoinId::Btc], 60_000);
        assert_eq!(settlement.net_btc_required, 10_000);
        assert_eq!(settlement.covered_sats, 0);
        assert_eq!(settlement.pools, vec![pool]);
    }

    #[test]
    fn test_withdraw_leaves_rune_change_with_pool() {
        let payment = payment_address();
        let pool = pool_address();
        let user = user_address();
        let swap = intention(
            &pool,
            "swap",
            vec![InputCoin {
                coin: CoinAmount::new(CoinId::Btc, 10_000),
                from: payment.clone(),
            }],
            vec![OutputCoin {
                coin: CoinAmount::new(RUNE_X, 12_000),
                to: user.clone(),
            }],
        );

        let mut candidates = candidates();
        candidates.btc.insert(
            pool.clone(),
            vec![
                rune_utxo(&pool, 9, 0, 10_000, RUNE_X, 10_000),
                rune_utxo(&pool, 9, 1, 20_000, RUNE_X, 5_000),
            ],
        );

        let settlement = settle(&[swap], &payment, &candidates).unwrap();

        assert_eq!(settlement.inputs.len(), 2);
        // 30_000 sats holdings + 10_000 inflow, all reissued.
        assert_eq!(settlement.credits[&pool][&CoinId::Btc], 40_000);
        // 15_000 held - 12_000 outflow.
        assert_eq!(settlement.credits[&pool][&RUNE_X], 3_000);
        assert_eq!(settlement.credits[&user][&RUNE_X], 12_000);
        assert_eq!(settlement.net_btc_required, 10_000);
    }

    #[test]
    fn test_pool_balance_violation() {
        let payment = payment_address();
        let pool = pool_address();
        let user = user_address();
        let withdraw = intention(
            &pool,
            "withdraw",
            vec![],
            vec![OutputCoin {
                coin: CoinAmount::new(RUNE_X, 12_000),
                to: user,
            }],
        );

        let mut candidates = candidates();
        candidates
            .btc
            .insert(pool.clone(), vec![rune_utxo(&pool, 9, 0, 546, RUNE_X, 5_000)]);

        let err = settle(&[withdraw], &payment, &candidates).unwrap_err();
        match err {
            ClientError::PoolBalanceViolation {
                pool: p,
                coin,
                required,
                available,
            } => {
                assert_eq!(p, pool);
                assert_eq!(coin, RUNE_X);
                assert_eq!(required, 12_000);
                assert_eq!(available, 5_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_passthrough_pool_not_double_counted() {
        let payment = payment_address();
        let pool = pool_address();
        let donate = intention(
            &pool,
            "donate",
            vec![
                InputCoin {
                    coin: CoinAmount::new(CoinId::Btc, 5_000),
                    from: payment.clone(),
                },
                // The pool's own holdings declared back to itself.
                InputCoin {
                    coin: CoinAmount::new(RUNE_X, 15_000),
                    from: pool.clone(),
                },
            ],
            vec![],
        );

        let mut candidates = candidates();
        candidates.btc.insert(
            pool.clone(),
            vec![rune_utxo(&pool, 9, 0, 30_000, RUNE_X, 15_000)],
        );

        let settlement = settle(&[donate], &payment, &candidates).unwrap();

        // Holdings flow through exactly once: 15_000, not 30_000.
        assert_eq!(settlement.credits[&pool][&RUNE_X], 15_000);
        assert_eq!(settlement.credits[&pool][&CoinId::Btc], 35_000);
        assert_eq!(settlement.net_btc_required, 5_000);
    }

    #[test]
    fn test_payment_rune_debit_covers_sats() {
        let payment = payment_address();
        let pool = pool_address();
        let deposit = intention(
            &pool,
            "deposit",
            vec![InputCoin {
                coin: CoinAmount::new(RUNE_X, 9_000),
                from: payment.clone(),
            }],
            vec![],
        );

        let mut candidates = candidates();
        candidates.runes.insert(
            (payment.clone(), RUNE_X),
            vec![rune_utxo(&payment, 2, 0, 546, RUNE_X, 10_000)],
        );
        candidates.btc.insert(pool.clone(), vec![]);

        let settlement = settle(&[deposit], &payment, &candidates).unwrap();

        // The rune-bearing input's sats count toward fee-loop funding.
        assert_eq!(settlement.covered_sats, 546);
        // 10_000 consumed - 9_000 deposited stays with the payment address.
        assert_eq!(settlement.credits[&payment][&RUNE_X], 1_000);
        assert_eq!(settlement.credits[&pool][&RUNE_X], 9_000);
        assert_eq!(settlement.inputs.len(), 1);
    }

    #[test]
    fn test_missing_pool_fetch_degrades_to_inflow_only() {
        let payment = payment_address();
        let pool = pool_address();
        let deposit = intention(
            &pool,
            "deposit",
            vec![InputCoin {
                coin: CoinAmount::new(CoinId::Btc, 10_000),
                from: payment.clone(),
            }],
            vec![],
        );

        let settlement = settle(&[deposit], &payment, &candidates()).unwrap();
        assert!(settlement.inputs.is_empty());
        assert_eq!(settlement.credits[&pool][&CoinId::Btc], 10_000);
    }

    #[test]
    fn test_conservation_across_coins() {
        let payment = payment_address();
        let pool = pool_address();
        let user = user_address();
        let swap = intention(
            &pool,
            "swap",
            vec![InputCoin {
                coin: CoinAmount::new(CoinId::Btc, 10_000),
                from: payment.clone(),
            }],
            vec![OutputCoin {
                coin: CoinAmount::new(RUNE_X, 12_000),
                to: user,
            }],
        );

        let mut candidates = candidates();
        candidates.btc.insert(
            pool.clone(),
            vec![
                rune_utxo(&pool, 9, 0, 10_000, RUNE_X, 10_000),
                rune_utxo(&pool, 9, 1, 20_000, RUNE_X, 5_000),
            ],
        );

        let settlement = settle(&[swap], &payment, &candidates).unwrap();

        // Rune conservation: consumed pool runes reappear in full.
        let consumed_runes: u128 = settlement
            .inputs
            .iter()
            .map(|u| u.rune_amount(RUNE_X))
            .sum();
        let credited_runes: u128 = settlement
            .credits
            .values()
            .filter_map(|coins| coins.get(&RUNE_X))
            .sum();
        assert_eq!(consumed_runes, credited_runes);

        // BTC conservation: consumed sats + payment requirement all credited.
        let consumed_sats: u128 = settlement.inputs.iter().map(|u| u.value as u128).sum();
        let credited_sats: u128 = settlement
            .credits
            .values()
            .filter_map(|coins| coins.get(&CoinId::Btc))
            .sum();
        assert_eq!(
            consumed_sats + settlement.net_btc_required as u128,
            credited_sats
        );
    }
}
