//! Ownership of (broker, wallet, pair) by a single trader.

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConflictKey {
    pub broker: String,
    pub wallet: String,
    pub pair: String,
}

impl ConflictKey {
    pub fn new(broker: &str, wallet: &str, pair: &str) -> Self {
        Self {
            broker: broker.to_string(),
            wallet: wallet.to_string(),
            pair: pair.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("pair {pair} on {broker}/{wallet} is already traded by {owner}")]
pub struct ConflictError {
    pub broker: String,
    pub wallet: String,
    pub pair: String,
    pub owner: String,
}

/// Registry of which trader owns a pair on a wallet.
#[derive(Debug, Default)]
pub struct ConflictMap {
    owners: Mutex<HashMap<ConflictKey, String>>,
}

impl ConflictMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `trader_id`. Re-registering the same owner succeeds.
    pub fn register(&self, key: ConflictKey, trader_id: &str) -> Result<(), ConflictError> {
        let mut owners = self.owners.lock().unwrap_or_else(|e| e.into_inner());
        match owners.get(&key) {
            Some(owner) if owner != trader_id => Err(ConflictError {
                broker: key.broker.clone(),
                wallet: key.wallet.clone(),
                pair: key.pair.clone(),
                owner: owner.clone(),
            }),
            _ => {
                owners.insert(key, trader_id.to_string());
                Ok(())
            }
        }
    }

    /// Release `key` if `trader_id` owns it.
    pub fn release(&self, key: &ConflictKey, trader_id: &str) {
        let mut owners = self.owners.lock().unwrap_or_else(|e| e.into_inner());
        if owners.get(key).is_some_and(|owner| owner == trader_id) {
            owners.remove(key);
        }
    }

    pub fn owner(&self, key: &ConflictKey) -> Option<String> {
        self.owners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}
