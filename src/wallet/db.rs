//! Allocation ledger keyed by (broker, wallet, symbol, trader).

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::trace;

/// One trader's claim on one symbol of one wallet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WalletKey {
    pub broker: String,
    pub wallet: String,
    pub symbol: String,
    pub trader_uid: u32,
}

impl WalletKey {
    pub fn new(broker: &str, wallet: &str, symbol: &str, trader_uid: u32) -> Self {
        Self {
            broker: broker.to_string(),
            wallet: wallet.to_string(),
            symbol: symbol.to_string(),
            trader_uid,
        }
    }

    fn same_pool(&self, other: &WalletKey) -> bool {
        self.broker == other.broker && self.wallet == other.wallet && self.symbol == other.symbol
    }
}

/// Claims on one (broker, wallet, symbol) split by owner.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Allocation {
    pub this_trader: f64,
    pub other_traders: f64,
}

impl Allocation {
    pub fn total(&self) -> f64 {
        self.this_trader + self.other_traders
    }
}

/// Thread-safe allocation ledger. Every call is a short critical section.
#[derive(Debug, Default)]
pub struct WalletDb {
    entries: Mutex<HashMap<WalletKey, f64>>,
}

impl WalletDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the claim for `key`; an amount of exactly zero removes it.
    pub fn alloc(&self, key: WalletKey, amount: f64) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        trace!(broker = %key.broker, wallet = %key.wallet, symbol = %key.symbol,
               uid = key.trader_uid, %amount, "Wallet allocation");
        if amount == 0.0 {
            entries.remove(&key);
        } else {
            entries.insert(key, amount);
        }
    }

    /// Sum the claims sharing `key`'s wallet and symbol.
    pub fn query(&self, key: &WalletKey) -> Allocation {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|(k, _)| k.same_pool(key))
            .fold(Allocation::default(), |mut acc, (k, v)| {
                if k.trader_uid == key.trader_uid {
                    acc.this_trader += v;
                } else {
                    acc.other_traders += v;
                }
                acc
            })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
