//! Client-side wallet core for receiving Lightning payments through
//! server-mediated incoming submarine swaps.
//!
//! The crate manages pre-registered invoice secrets (preimage, payment
//! secret, derivation path, synthetic short channel id), builds and signs
//! BOLT-11 invoices from them, and co-signs the on-chain fulfillment
//! transaction that claims the backing HTLC once a payment arrives.

use std::path::PathBuf;

pub mod error;
pub mod invoice;
pub mod keys;
pub mod lightning;
pub mod logging;
pub mod swap;

pub use error::WalletError;

/// Where the wallet keeps its durable state. Every entry point opens its
/// own database handle under this directory and releases it on return.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub data_dir: PathBuf,
}

impl WalletConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn wallet_db_path(&self) -> PathBuf {
        self.data_dir.join("wallet.db")
    }
}
