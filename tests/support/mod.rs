#![allow(dead_code)]

use bitcoin::Network;
use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::secp256k1::Secp256k1;

use ln_swap_wallet::WalletConfig;
use ln_swap_wallet::invoice::{InvoiceSecretsBundle, generate_invoice_secrets, persist_invoice_secrets};
use ln_swap_wallet::keys::{HdPrivateKey, HdPublicKey, KeyPath};

/// The hardened schema prefix every wallet root is derived to.
pub const ROOT_PATH: &str = "m/schema:1'/recovery:1'";

/// A deterministic wallet root at the schema prefix.
pub fn hd_root(seed: u8) -> HdPrivateKey {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(Network::Regtest, &[seed; 32]).expect("master key");
    let prefix = [
        ChildNumber::from_hardened_idx(1).expect("hardened 1"),
        ChildNumber::from_hardened_idx(1).expect("hardened 1"),
    ];
    let key = master.derive_priv(&secp, &prefix).expect("derive prefix");
    HdPrivateKey::new(key, KeyPath::parse(ROOT_PATH).expect("root path"))
}

pub struct TestWallet {
    pub dir: tempfile::TempDir,
    pub cfg: WalletConfig,
    pub user_key: HdPrivateKey,
    pub muun_key: HdPrivateKey,
}

impl TestWallet {
    pub fn new() -> Self {
        ln_swap_wallet::logging::init().ok();

        let dir = tempfile::tempdir().expect("create tempdir");
        let cfg = WalletConfig::new(dir.path());
        Self {
            dir,
            cfg,
            user_key: hd_root(0xA1),
            muun_key: hd_root(0xB2),
        }
    }

    pub fn muun_public(&self) -> HdPublicKey {
        self.muun_key.public()
    }

    /// Generates and persists a full replenishment of secrets.
    pub fn seed_secrets(&self) -> InvoiceSecretsBundle {
        let bundle =
            generate_invoice_secrets(&self.cfg, &self.user_key.public(), &self.muun_public())
                .expect("generate secrets");
        persist_invoice_secrets(&self.cfg, &bundle).expect("persist secrets");
        bundle
    }
}
