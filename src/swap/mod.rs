pub mod htlc;

use anyhow::{Context as _, anyhow};
use bitcoin::Network;
use bitcoin::Transaction;
use bitcoin::consensus::encode::{deserialize, serialize};
use serde::{Deserialize, Serialize};

use crate::WalletConfig;
use crate::error::WalletError;
use crate::invoice::store::InvoiceDb;
use crate::invoice::{HTLC_KEY_CHILD_INDEX, IDENTITY_KEY_CHILD_INDEX, InvoiceRecord};
use crate::keys::{HdPrivateKey, HdPublicKey, KeyPath};
use crate::lightning::sphinx;

use htlc::IncomingSwapCoin;

/// An incoming payment reported by the server, to be verified and
/// fulfilled by this wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingSwap {
    /// Absent for full-debt swaps, which have no on-chain leg.
    pub htlc: Option<IncomingSwapHtlc>,
    /// Empty when the swap variant carries no onion.
    pub sphinx_packet: Vec<u8>,
    pub payment_hash: Vec<u8>,
    pub payment_amount_sat: i64,
    /// Fee the server deducts from the fulfillment output.
    pub collect_sat: i64,
}

/// The on-chain leg of an incoming swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingSwapHtlc {
    /// Raw transaction holding the htlc output.
    pub htlc_tx: Vec<u8>,
    pub expiration_height: i64,
    pub swap_server_public_key: Vec<u8>,
}

/// Server-proposed fulfillment transaction plus its co-signature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingSwapFulfillmentData {
    /// Serialized without witnesses; exactly one input and one output.
    pub fulfillment_tx: Vec<u8>,
    /// DER-encoded co-signature over the htlc input.
    pub muun_signature: Vec<u8>,
    pub output_version: i32,      // unused
    pub output_path: String,      // unused
    pub merkle_tree: Vec<u8>,     // unused
    pub htlc_block: Vec<u8>,      // unused
    pub block_height: i64,        // unused
    pub confirmation_target: i64, // to validate fee rate, unused for now
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingSwapFulfillmentResult {
    /// Fully signed, witness-serialized; empty for full-debt swaps.
    pub fulfillment_tx: Vec<u8>,
    pub preimage: Vec<u8>,
}

impl IncomingSwap {
    /// Checks that this swap matches a stored invoice and may be
    /// fulfilled: the payment hash is known, the paid amount covers the
    /// invoiced amount (overpayment is tolerated, underpayment is not),
    /// and the onion, when present, terminates here with the right
    /// payment secret and amount.
    pub fn verify_fulfillable(
        &self,
        cfg: &WalletConfig,
        user_key: &HdPrivateKey,
    ) -> Result<(), WalletError> {
        if self.payment_hash.len() != 32 {
            return Err(WalletError::UnfulfillableSwap(anyhow!(
                "received invalid payment hash of {} bytes",
                self.payment_hash.len()
            )));
        }

        let invoice = self.find_invoice(cfg)?;

        let key_path = KeyPath::parse(&invoice.key_path)
            .with_context(|| format!("parse stored key path {:?}", invoice.key_path))
            .map_err(WalletError::Crypto)?;
        let node_key = user_key
            .derive_to(&key_path.child(IDENTITY_KEY_CHILD_INDEX))
            .context("derive invoice identity key")
            .map_err(WalletError::Crypto)?
            .ec_private_key();

        // The payer is allowed to send a few extra sats, never fewer.
        if invoice.amount_sat != 0 && invoice.amount_sat > self.payment_amount_sat {
            return Err(WalletError::UnfulfillableSwap(anyhow!(
                "payment amount ({}) does not match invoice amount ({})",
                self.payment_amount_sat,
                invoice.amount_sat
            )));
        }

        if self.sphinx_packet.is_empty() {
            return Ok(());
        }

        let amount_msat = self.payment_amount_sat as u64 * 1000;
        sphinx::validate(
            &self.sphinx_packet,
            &self.payment_hash,
            &invoice.payment_secret,
            &node_key,
            amount_msat,
        )
        .context("invalid sphinx")
        .map_err(WalletError::UnfulfillableSwap)
    }

    /// Verifies the swap, counter-signs the server-proposed fulfillment
    /// transaction, and reveals the preimage.
    pub fn fulfill(
        &self,
        cfg: &WalletConfig,
        data: &IncomingSwapFulfillmentData,
        user_key: &HdPrivateKey,
        muun_key: &HdPublicKey,
        network: Network,
    ) -> Result<IncomingSwapFulfillmentResult, WalletError> {
        let Some(swap_htlc) = &self.htlc else {
            return Err(WalletError::UnfulfillableSwap(anyhow!(
                "missing swap htlc data"
            )));
        };

        self.verify_fulfillable(cfg, user_key)?;

        let mut tx: Transaction = deserialize(&data.fulfillment_tx)
            .context("deserialize fulfillment tx")
            .map_err(WalletError::UnfulfillableSwap)?;
        if tx.input.len() != 1 {
            return Err(WalletError::UnfulfillableSwap(anyhow!(
                "expected fulfillment tx to have exactly 1 input, found {}",
                tx.input.len()
            )));
        }
        if tx.output.len() != 1 {
            return Err(WalletError::UnfulfillableSwap(anyhow!(
                "expected fulfillment tx to have exactly 1 output, found {}",
                tx.output.len()
            )));
        }

        let invoice = self.find_invoice(cfg)?;
        let (user_htlc_key, muun_htlc_key) =
            derive_htlc_keys(&invoice, user_key, muun_key).map_err(WalletError::Crypto)?;
        let preimage: [u8; 32] = invoice
            .preimage
            .as_slice()
            .try_into()
            .context("stored preimage is not 32 bytes")
            .map_err(WalletError::Storage)?;
        let payment_hash: [u8; 32] = self
            .payment_hash
            .as_slice()
            .try_into()
            .expect("length checked in verify_fulfillable");

        // Sign the htlc input; there is only one, at index 0.
        let coin = IncomingSwapCoin {
            network,
            muun_signature: &data.muun_signature,
            htlc_tx: &swap_htlc.htlc_tx,
            payment_hash,
            swap_server_public_key: &swap_htlc.swap_server_public_key,
            expiration_height: swap_htlc.expiration_height,
            collect_sat: self.collect_sat,
            verify_output_amount: true,
        };
        coin.sign_input(
            0,
            &mut tx,
            &user_htlc_key.ec_private_key(),
            &muun_htlc_key.public_key(),
            &preimage,
        )
        .map_err(WalletError::UnfulfillableSwap)?;

        tracing::info!(
            payment_hash = %hex::encode(&self.payment_hash),
            txid = %tx.compute_txid(),
            "fulfilled incoming swap"
        );
        Ok(IncomingSwapFulfillmentResult {
            fulfillment_tx: serialize(&tx),
            preimage: invoice.preimage,
        })
    }

    /// Reveals the preimage for a swap with no on-chain leg: the server
    /// settles the payment off-chain from collateral, so revealing the
    /// preimage is the whole fulfillment.
    pub fn fulfill_full_debt(
        &self,
        cfg: &WalletConfig,
    ) -> Result<IncomingSwapFulfillmentResult, WalletError> {
        let invoice = self.find_invoice(cfg)?;

        Ok(IncomingSwapFulfillmentResult {
            fulfillment_tx: Vec::new(),
            preimage: invoice.preimage,
        })
    }

    fn find_invoice(&self, cfg: &WalletConfig) -> Result<InvoiceRecord, WalletError> {
        let db = InvoiceDb::open(cfg.wallet_db_path()).map_err(WalletError::Storage)?;
        let found = db
            .find_by_payment_hash(&self.payment_hash)
            .map_err(WalletError::Storage)?;
        db.close();

        found.ok_or_else(|| WalletError::NotFound {
            payment_hash: hex::encode(&self.payment_hash),
        })
    }
}

fn derive_htlc_keys(
    invoice: &InvoiceRecord,
    user_key: &HdPrivateKey,
    muun_key: &HdPublicKey,
) -> anyhow::Result<(HdPrivateKey, HdPublicKey)> {
    let key_path = KeyPath::parse(&invoice.key_path)
        .with_context(|| format!("parse stored key path {:?}", invoice.key_path))?;
    let htlc_path = key_path.child(HTLC_KEY_CHILD_INDEX);

    let user_htlc_key = user_key
        .derive_to(&htlc_path)
        .context("derive user htlc key")?;
    let muun_htlc_key = muun_key
        .derive_to(&htlc_path)
        .context("derive muun htlc key")?;
    Ok((user_htlc_key, muun_htlc_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::bip32::{ChildNumber, Xpriv};
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    use crate::invoice::{generate_invoice_secrets, persist_invoice_secrets};
    use crate::lightning::sphinx::test_onion::{build_single_hop_onion, final_hop_tlv};

    fn test_root(seed: u8) -> HdPrivateKey {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(Network::Regtest, &[seed; 32]).unwrap();
        let prefix = [
            ChildNumber::from_hardened_idx(1).unwrap(),
            ChildNumber::from_hardened_idx(1).unwrap(),
        ];
        let key = master.derive_priv(&secp, &prefix).unwrap();
        HdPrivateKey::new(key, KeyPath::parse("m/schema:1'/recovery:1'").unwrap())
    }

    fn seeded_wallet() -> (tempfile::TempDir, WalletConfig, HdPrivateKey, InvoiceRecord) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WalletConfig::new(dir.path());
        let user_key = test_root(0x51);
        let muun_key = test_root(0x52).public();

        let bundle = generate_invoice_secrets(&cfg, &user_key.public(), &muun_key).unwrap();
        persist_invoice_secrets(&cfg, &bundle).unwrap();

        let db = InvoiceDb::open(cfg.wallet_db_path()).unwrap();
        let invoice = db.find_first_unused().unwrap().unwrap();
        (dir, cfg, user_key, invoice)
    }

    fn onion_for(
        user_key: &HdPrivateKey,
        invoice: &InvoiceRecord,
        amount_msat: u64,
    ) -> Vec<u8> {
        let key_path = KeyPath::parse(&invoice.key_path).unwrap();
        let node_pubkey = user_key
            .derive_to(&key_path.child(IDENTITY_KEY_CHILD_INDEX))
            .unwrap()
            .ec_public_key();

        let payment_secret: [u8; 32] = invoice.payment_secret.as_slice().try_into().unwrap();
        let session_key = SecretKey::from_slice(&[0x13; 32]).unwrap();
        let tlv = final_hop_tlv(amount_msat, 800_000, &payment_secret, amount_msat);
        build_single_hop_onion(&session_key, &node_pubkey, &invoice.payment_hash, &tlv)
    }

    #[test]
    fn verify_fulfillable_accepts_a_matching_onion() {
        let (_dir, cfg, user_key, invoice) = seeded_wallet();

        let swap = IncomingSwap {
            htlc: None,
            sphinx_packet: onion_for(&user_key, &invoice, 250_000),
            payment_hash: invoice.payment_hash.clone(),
            payment_amount_sat: 250,
            collect_sat: 0,
        };
        swap.verify_fulfillable(&cfg, &user_key).unwrap();
    }

    #[test]
    fn verify_fulfillable_rejects_an_onion_amount_mismatch() {
        let (_dir, cfg, user_key, invoice) = seeded_wallet();

        let swap = IncomingSwap {
            htlc: None,
            sphinx_packet: onion_for(&user_key, &invoice, 100_000),
            payment_hash: invoice.payment_hash.clone(),
            payment_amount_sat: 250,
            collect_sat: 0,
        };
        let err = swap.verify_fulfillable(&cfg, &user_key).unwrap_err();
        assert!(matches!(err, WalletError::UnfulfillableSwap(_)), "{err}");
    }

    #[test]
    fn verify_fulfillable_rejects_a_bad_hash_length() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WalletConfig::new(dir.path());
        let user_key = test_root(0x53);

        let swap = IncomingSwap {
            htlc: None,
            sphinx_packet: Vec::new(),
            payment_hash: vec![0; 31],
            payment_amount_sat: 250,
            collect_sat: 0,
        };
        let err = swap.verify_fulfillable(&cfg, &user_key).unwrap_err();
        assert!(matches!(err, WalletError::UnfulfillableSwap(_)), "{err}");
    }
}
