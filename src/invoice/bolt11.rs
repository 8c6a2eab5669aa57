use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use bitcoin::Network;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use lightning_invoice::{InvoiceBuilder, PaymentSecret, RouteHint, RouteHintHop, RoutingFees};

use crate::WalletConfig;
use crate::error::WalletError;
use crate::keys::{HdPrivateKey, KeyPath};

use super::store::InvoiceDb;
use super::{IDENTITY_KEY_CHILD_INDEX, InvoiceOptions, InvoiceRecord, RouteHints};

/// Block count the payer must leave between the htlc expiry and the chain
/// tip, roughly half a day.
const MIN_FINAL_CLTV_EXPIRY_DELTA: u64 = 72;

const INVOICE_EXPIRY: Duration = Duration::from_secs(3600);

/// Builds and signs a BOLT-11 invoice from the first unused stored secret.
///
/// Returns the empty string when every secret has been used; that is the
/// signal to replenish with
/// [`generate_invoice_secrets`](super::generate_invoice_secrets), not an
/// error. The backing record is marked Used before the bech32 string is
/// returned, so a returned invoice is always settleable by the server.
pub fn create_invoice(
    cfg: &WalletConfig,
    network: Network,
    user_key: &HdPrivateKey,
    route_hints: &RouteHints,
    opts: &InvoiceOptions,
) -> Result<String, WalletError> {
    let mut db = InvoiceDb::open(cfg.wallet_db_path()).map_err(WalletError::Storage)?;

    let Some(invoice) = db.find_first_unused().map_err(WalletError::Storage)? else {
        return Ok(String::new());
    };

    let identity_key = derive_identity_key(user_key, &invoice).map_err(WalletError::Crypto)?;

    let bech32 = encode_invoice(network, &identity_key, &invoice, route_hints, opts)
        .map_err(WalletError::Encoding)?;

    // The invoice string is about to become known externally; failing to
    // record the transition would leave a secret the server can never
    // settle, so this is fatal.
    db.mark_used(invoice.id, opts.amount_sat)
        .map_err(WalletError::Storage)?;
    db.close();

    tracing::info!(
        payment_hash = %hex::encode(&invoice.payment_hash),
        amount_sat = opts.amount_sat,
        "created invoice"
    );
    Ok(bech32)
}

fn derive_identity_key(user_key: &HdPrivateKey, invoice: &InvoiceRecord) -> Result<HdPrivateKey> {
    let key_path = KeyPath::parse(&invoice.key_path)
        .with_context(|| format!("parse stored key path {:?}", invoice.key_path))?;
    user_key
        .derive_to(&key_path.child(IDENTITY_KEY_CHILD_INDEX))
        .context("derive invoice identity key")
}

fn encode_invoice(
    network: Network,
    identity_key: &HdPrivateKey,
    invoice: &InvoiceRecord,
    route_hints: &RouteHints,
    opts: &InvoiceOptions,
) -> Result<String> {
    let payment_hash = sha256::Hash::from_slice(&invoice.payment_hash)
        .context("stored payment hash is not 32 bytes")?;
    let payment_secret: [u8; 32] = invoice
        .payment_secret
        .as_slice()
        .try_into()
        .context("stored payment secret is not 32 bytes")?;

    let node_id =
        PublicKey::from_slice(&route_hints.node_pubkey).context("parse route hint pubkey")?;
    let hop = RouteHintHop {
        src_node_id: node_id,
        short_channel_id: invoice.short_chan_id,
        fees: RoutingFees {
            base_msat: u32::try_from(route_hints.fee_base_msat).context("route hint base fee")?,
            proportional_millionths: u32::try_from(route_hints.fee_proportional_millionths)
                .context("route hint proportional fee")?,
        },
        cltv_expiry_delta: u16::try_from(route_hints.cltv_expiry_delta)
            .context("route hint cltv delta")?,
        htlc_minimum_msat: None,
        htlc_maximum_msat: None,
    };

    let mut builder = InvoiceBuilder::new(network.into())
        .description(opts.description.clone())
        .payment_hash(payment_hash)
        .payment_secret(PaymentSecret(payment_secret))
        .current_timestamp()
        .min_final_cltv_expiry_delta(MIN_FINAL_CLTV_EXPIRY_DELTA)
        .expiry_time(INVOICE_EXPIRY)
        .private_route(RouteHint(vec![hop]));

    if opts.amount_sat != 0 {
        let amount_sat = u64::try_from(opts.amount_sat).context("invoice amount is negative")?;
        builder = builder.amount_milli_satoshis(amount_sat * 1000);
    }

    let secp = Secp256k1::new();
    let signing_key = identity_key.ec_private_key();
    let signed = builder
        .build_signed(|digest| secp.sign_ecdsa_recoverable(digest, &signing_key))
        .map_err(|e| anyhow!("encode invoice: {e}"))?;

    Ok(signed.to_string())
}
