mod support;

use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, sha256};

use ln_swap_wallet::invoice::store::InvoiceDb;
use ln_swap_wallet::invoice::{
    InvoiceSecretsBundle, InvoiceState, MAX_UNUSED_SECRETS, SHORT_CHAN_ID_HIGH_BIT,
    generate_invoice_secrets, persist_invoice_secrets,
};

use support::TestWallet;

#[test]
fn generates_a_full_bundle_with_sound_secrets() -> Result<()> {
    let wallet = TestWallet::new();

    let bundle =
        generate_invoice_secrets(&wallet.cfg, &wallet.user_key.public(), &wallet.muun_public())
            .context("generate")?;
    assert_eq!(bundle.len(), MAX_UNUSED_SECRETS as usize);

    for secret in &bundle {
        assert_ne!(
            secret.short_chan_id & SHORT_CHAN_ID_HIGH_BIT,
            0,
            "synthetic channel ids carry the high bit"
        );
        assert_ne!(
            secret.identity_key.public_key(),
            secret.user_htlc_key.public_key(),
            "identity and htlc keys live at distinct children"
        );
    }

    // Nothing hits the store until the caller persists.
    let db = InvoiceDb::open(wallet.cfg.wallet_db_path())?;
    assert_eq!(db.count_unused()?, 0);

    Ok(())
}

#[test]
fn persisted_records_uphold_the_hash_invariants() -> Result<()> {
    let wallet = TestWallet::new();
    let bundle = wallet.seed_secrets();

    let db = InvoiceDb::open(wallet.cfg.wallet_db_path())?;
    for secret in &bundle {
        let record = db
            .find_by_payment_hash(&secret.payment_hash)?
            .context("persisted record missing")?;

        assert_eq!(record.preimage.len(), 32);
        assert_eq!(record.payment_secret.len(), 32);
        assert_eq!(record.payment_hash.len(), 32);
        assert_eq!(
            sha256::Hash::hash(&record.preimage).to_byte_array().to_vec(),
            record.payment_hash,
            "payment hash commits to the preimage"
        );
        assert_eq!(record.state, InvoiceState::Registered);
        assert_eq!(record.short_chan_id, secret.short_chan_id);

        let base = "m/schema:1'/recovery:1'/invoices:4/";
        assert!(
            record.key_path.starts_with(base),
            "unexpected key path {}",
            record.key_path
        );
        let levels: Vec<u32> = record.key_path[base.len()..]
            .split('/')
            .map(|level| level.parse().expect("numeric level"))
            .collect();
        assert_eq!(levels.len(), 2);
        assert!(levels.iter().all(|level| *level < 1 << 31));
    }

    Ok(())
}

#[test]
fn generation_replenishes_up_to_the_cap() -> Result<()> {
    let wallet = TestWallet::new();
    let user = wallet.user_key.public();
    let muun = wallet.muun_public();

    let first = generate_invoice_secrets(&wallet.cfg, &user, &muun).context("first generate")?;
    assert_eq!(first.len(), 5);

    // Register only three of them.
    let partial: Vec<_> = (0..3).map(|i| first.get(i).unwrap().clone()).collect();
    persist_invoice_secrets(&wallet.cfg, &InvoiceSecretsBundle::from(partial))?;

    let db = InvoiceDb::open(wallet.cfg.wallet_db_path())?;
    assert_eq!(db.count_unused()?, 3);
    db.close();

    let second = generate_invoice_secrets(&wallet.cfg, &user, &muun).context("second generate")?;
    assert_eq!(second.len(), 2, "generation tops the stock back up to 5");

    persist_invoice_secrets(&wallet.cfg, &second)?;
    let db = InvoiceDb::open(wallet.cfg.wallet_db_path())?;
    assert_eq!(db.count_unused()?, 5);
    db.close();

    let third = generate_invoice_secrets(&wallet.cfg, &user, &muun).context("third generate")?;
    assert!(third.is_empty(), "a full stock yields an empty bundle");

    Ok(())
}

#[test]
fn secrets_are_pairwise_distinct() -> Result<()> {
    let wallet = TestWallet::new();
    let bundle = wallet.seed_secrets();

    for i in 0..bundle.len() {
        for j in i + 1..bundle.len() {
            let a = bundle.get(i).unwrap();
            let b = bundle.get(j).unwrap();
            assert_ne!(a.payment_hash, b.payment_hash);
            assert_ne!(a.short_chan_id, b.short_chan_id);
            assert_ne!(
                a.identity_key.public_key(),
                b.identity_key.public_key()
            );
        }
    }

    Ok(())
}
