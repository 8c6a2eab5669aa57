pub mod bolt11;
pub mod secrets;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::{HdPublicKey, KeyPath};

pub use bolt11::create_invoice;
pub use secrets::{generate_invoice_secrets, persist_invoice_secrets};

/// Ceiling on the number of Registered secrets kept on hand; the
/// generator replenishes up to this many.
pub const MAX_UNUSED_SECRETS: i64 = 5;

/// Synthetic short channel ids carry this bit so they can never collide
/// with a real channel id. It is cleared on disk and restored on read.
pub const SHORT_CHAN_ID_HIGH_BIT: u64 = 1 << 63;

pub(crate) const IDENTITY_KEY_CHILD_INDEX: u32 = 0;
pub(crate) const HTLC_KEY_CHILD_INDEX: u32 = 1;

pub(crate) const INVOICE_BASE_PATH: &str = "m/schema:1'/recovery:1'/invoices:4";

/// Lifecycle of a persisted invoice secret. The only legal transition is
/// `Registered` to `Used`; records are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceState {
    Registered,
    Used,
}

/// A persisted invoice secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRecord {
    /// Rowid; zero until the record has been inserted.
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub preimage: Vec<u8>,
    /// SHA-256 of the preimage. Indexed.
    pub payment_hash: Vec<u8>,
    pub payment_secret: Vec<u8>,
    pub key_path: String,
    /// Always carries the high bit in memory.
    pub short_chan_id: u64,
    /// Zero for amountless invoices; set when the invoice is used.
    pub amount_sat: i64,
    pub state: InvoiceState,
    pub used_at: Option<DateTime<Utc>>,
}

impl InvoiceRecord {
    /// A fresh Registered record, not yet inserted.
    pub fn registered(
        preimage: Vec<u8>,
        payment_hash: Vec<u8>,
        payment_secret: Vec<u8>,
        key_path: String,
        short_chan_id: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            created_at: now,
            updated_at: now,
            preimage,
            payment_hash,
            payment_secret,
            key_path,
            short_chan_id,
            amount_sat: 0,
            state: InvoiceState::Registered,
            used_at: None,
        }
    }
}

/// Route hint parameters returned by the remote server, combined with a
/// stored secret into the invoice's single private route hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteHints {
    /// 33-byte compressed secp256k1 point.
    pub node_pubkey: Vec<u8>,
    pub fee_base_msat: i64,
    pub fee_proportional_millionths: i64,
    pub cltv_expiry_delta: i32,
}

/// Caller-supplied invoice options. A zero amount produces an amountless
/// invoice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceOptions {
    pub description: String,
    pub amount_sat: i64,
}

/// A freshly generated secret awaiting registration with the remote
/// server. The private parts stay internal until persistence.
#[derive(Debug, Clone)]
pub struct InvoiceSecrets {
    pub(crate) preimage: [u8; 32],
    pub(crate) payment_secret: [u8; 32],
    pub(crate) key_path: KeyPath,
    pub payment_hash: [u8; 32],
    pub identity_key: HdPublicKey,
    pub user_htlc_key: HdPublicKey,
    pub muun_htlc_key: HdPublicKey,
    pub short_chan_id: u64,
}

/// An ordered batch of generated secrets, to be registered with the
/// server and then passed to [`persist_invoice_secrets`].
#[derive(Debug, Clone, Default)]
pub struct InvoiceSecretsBundle {
    secrets: Vec<InvoiceSecrets>,
}

impl InvoiceSecretsBundle {
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&InvoiceSecrets> {
        self.secrets.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InvoiceSecrets> {
        self.secrets.iter()
    }
}

impl From<Vec<InvoiceSecrets>> for InvoiceSecretsBundle {
    fn from(secrets: Vec<InvoiceSecrets>) -> Self {
        Self { secrets }
    }
}

impl<'a> IntoIterator for &'a InvoiceSecretsBundle {
    type Item = &'a InvoiceSecrets;
    type IntoIter = std::slice::Iter<'a, InvoiceSecrets>;

    fn into_iter(self) -> Self::IntoIter {
        self.secrets.iter()
    }
}
