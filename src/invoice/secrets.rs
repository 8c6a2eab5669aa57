use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, sha256};
use rand::RngCore as _;
use rand::rngs::OsRng;

use crate::WalletConfig;
use crate::error::WalletError;
use crate::keys::{HdPublicKey, KeyPath};

use super::store::InvoiceDb;
use super::{
    HTLC_KEY_CHILD_INDEX, IDENTITY_KEY_CHILD_INDEX, INVOICE_BASE_PATH, InvoiceRecord,
    InvoiceSecrets, InvoiceSecretsBundle, MAX_UNUSED_SECRETS, SHORT_CHAN_ID_HIGH_BIT,
};

/// Generates fresh invoice secrets, replenishing the store's stock of
/// unused secrets up to [`MAX_UNUSED_SECRETS`].
///
/// Nothing is persisted here: the caller first registers the bundle with
/// the remote server and then hands it to [`persist_invoice_secrets`].
/// Returns an empty bundle when the stock is already full.
pub fn generate_invoice_secrets(
    cfg: &WalletConfig,
    user_key: &HdPublicKey,
    muun_key: &HdPublicKey,
) -> Result<InvoiceSecretsBundle, WalletError> {
    let db = InvoiceDb::open(cfg.wallet_db_path()).map_err(WalletError::Storage)?;
    let unused = db.count_unused().map_err(WalletError::Storage)?;
    db.close();

    if unused >= MAX_UNUSED_SECRETS {
        return Ok(InvoiceSecretsBundle::default());
    }
    let num = MAX_UNUSED_SECRETS - unused;

    let mut secrets = Vec::with_capacity(num as usize);
    for _ in 0..num {
        secrets.push(generate_one(user_key, muun_key).map_err(WalletError::Crypto)?);
    }

    tracing::debug!(count = secrets.len(), "generated invoice secrets");
    Ok(InvoiceSecretsBundle::from(secrets))
}

/// Stores secrets that have been registered with the remote server. Each
/// entry becomes a Registered record, ready to back a new invoice.
pub fn persist_invoice_secrets(
    cfg: &WalletConfig,
    bundle: &InvoiceSecretsBundle,
) -> Result<(), WalletError> {
    let mut db = InvoiceDb::open(cfg.wallet_db_path()).map_err(WalletError::Storage)?;

    for secret in bundle {
        let mut record = InvoiceRecord::registered(
            secret.preimage.to_vec(),
            secret.payment_hash.to_vec(),
            secret.payment_secret.to_vec(),
            secret.key_path.to_string(),
            secret.short_chan_id,
        );
        db.create(&mut record).map_err(WalletError::Storage)?;
    }

    db.close();
    Ok(())
}

fn generate_one(user_key: &HdPublicKey, muun_key: &HdPublicKey) -> Result<InvoiceSecrets> {
    let preimage = random_bytes::<32>()?;
    let payment_secret = random_bytes::<32>()?;
    let payment_hash = sha256::Hash::hash(&preimage).to_byte_array();

    let levels = random_bytes::<8>()?;
    let l1 = u32::from_le_bytes(levels[..4].try_into().expect("4 bytes")) & 0x7FFF_FFFF;
    let l2 = u32::from_le_bytes(levels[4..].try_into().expect("4 bytes")) & 0x7FFF_FFFF;

    let key_path = KeyPath::parse(INVOICE_BASE_PATH)
        .expect("invoice base path is static and valid")
        .child(l1)
        .child(l2);

    let identity_key = user_key
        .derive_to(&key_path.child(IDENTITY_KEY_CHILD_INDEX))
        .context("derive identity key")?;
    let user_htlc_key = user_key
        .derive_to(&key_path.child(HTLC_KEY_CHILD_INDEX))
        .context("derive user htlc key")?;
    let muun_htlc_key = muun_key
        .derive_to(&key_path.child(HTLC_KEY_CHILD_INDEX))
        .context("derive muun htlc key")?;

    let short_chan_id = u64::from_le_bytes(random_bytes::<8>()?) | SHORT_CHAN_ID_HIGH_BIT;

    Ok(InvoiceSecrets {
        preimage,
        payment_secret,
        key_path,
        payment_hash,
        identity_key,
        user_htlc_key,
        muun_htlc_key,
        short_chan_id,
    })
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    OsRng
        .try_fill_bytes(&mut buf)
        .context("read system entropy")?;
    Ok(buf)
}
