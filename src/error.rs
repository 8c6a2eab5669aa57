use thiserror::Error;

/// Errors surfaced by the wallet core entry points.
///
/// Every failure carries its kind plus the wrapped cause; there is no
/// silent recovery. The absence of an unused invoice secret is not an
/// error and is reported as an empty string by
/// [`crate::invoice::create_invoice`].
#[derive(Debug, Error)]
pub enum WalletError {
    /// The backing store failed (I/O, migration, query).
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),

    /// No invoice matches the given payment hash. This indicates a
    /// protocol violation upstream: the server reported a payment for a
    /// hash this wallet never registered.
    #[error("no invoice matches payment hash {payment_hash}")]
    NotFound { payment_hash: String },

    /// The swap failed validation and must not be fulfilled. Callers
    /// respond by asking the server to expire the invoice, not by
    /// retrying.
    #[error("swap cannot be fulfilled: {0:#}")]
    UnfulfillableSwap(anyhow::Error),

    /// Key parsing, derivation, or signing failed.
    #[error("key operation failed: {0:#}")]
    Crypto(anyhow::Error),

    /// Bech32, DER, or transaction serialization failed.
    #[error("encoding failure: {0:#}")]
    Encoding(anyhow::Error),
}
