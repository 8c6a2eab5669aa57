pub mod path;

use anyhow::{Context as _, Result, bail};
use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

pub use path::KeyPath;

use path::PathSegment;

/// An extended public key together with the path it is rooted at.
///
/// Root keys arrive already derived to the hardened schema prefix
/// (`m/schema:1'/recovery:1'`); everything below it is non-hardened so the
/// server can mirror the derivation from the matching xpub.
#[derive(Debug, Clone)]
pub struct HdPublicKey {
    key: Xpub,
    path: KeyPath,
}

impl HdPublicKey {
    pub fn new(key: Xpub, path: KeyPath) -> Self {
        Self { key, path }
    }

    pub fn path(&self) -> &KeyPath {
        &self.path
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key
    }

    /// Derives the key at `target`, which must extend this key's own path
    /// with non-hardened components only.
    pub fn derive_to(&self, target: &KeyPath) -> Result<HdPublicKey> {
        let children = derivation_suffix(&self.path, target)?;
        let secp = Secp256k1::verification_only();
        let key = self
            .key
            .derive_pub(&secp, &children)
            .with_context(|| format!("derive public key to {target}"))?;
        Ok(HdPublicKey {
            key,
            path: target.clone(),
        })
    }
}

/// An extended private key together with the path it is rooted at.
#[derive(Debug, Clone)]
pub struct HdPrivateKey {
    key: Xpriv,
    path: KeyPath,
}

impl HdPrivateKey {
    pub fn new(key: Xpriv, path: KeyPath) -> Self {
        Self { key, path }
    }

    pub fn path(&self) -> &KeyPath {
        &self.path
    }

    pub fn public(&self) -> HdPublicKey {
        let secp = Secp256k1::new();
        HdPublicKey {
            key: Xpub::from_priv(&secp, &self.key),
            path: self.path.clone(),
        }
    }

    pub fn ec_private_key(&self) -> SecretKey {
        self.key.private_key
    }

    pub fn ec_public_key(&self) -> PublicKey {
        let secp = Secp256k1::new();
        self.key.private_key.public_key(&secp)
    }

    /// Derives the key at `target`. Hardened components beyond this key's
    /// own path are rejected: the schema prefix is the only hardened
    /// region, and the server must be able to mirror the derivation over
    /// public keys.
    pub fn derive_to(&self, target: &KeyPath) -> Result<HdPrivateKey> {
        let children = derivation_suffix(&self.path, target)?;
        let secp = Secp256k1::new();
        let key = self
            .key
            .derive_priv(&secp, &children)
            .with_context(|| format!("derive private key to {target}"))?;
        Ok(HdPrivateKey {
            key,
            path: target.clone(),
        })
    }
}

fn derivation_suffix(base: &KeyPath, target: &KeyPath) -> Result<Vec<ChildNumber>> {
    let Some(suffix) = target.strip_prefix(base) else {
        bail!("path {target} is not a descendant of the key root {base}");
    };
    suffix
        .iter()
        .map(|segment| child_number(segment, target))
        .collect()
}

fn child_number(segment: &PathSegment, target: &KeyPath) -> Result<ChildNumber> {
    if segment.hardened {
        bail!("path {target} contains a hardened child beyond the key root");
    }
    path::segment_child_number(segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;

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

    #[test]
    fn private_and_public_derivation_agree() {
        let root = test_root(0x11);
        let target = KeyPath::parse("m/schema:1'/recovery:1'/invoices:4/17/91/0").unwrap();

        let derived_priv = root.derive_to(&target).unwrap();
        let derived_pub = root.public().derive_to(&target).unwrap();

        assert_eq!(derived_priv.ec_public_key(), derived_pub.public_key());
        assert_eq!(derived_priv.path(), &target);
    }

    #[test]
    fn rejects_non_descendant_target() {
        let root = test_root(0x22);
        let target = KeyPath::parse("m/schema:2'/recovery:1'/invoices:4/1/2").unwrap();
        assert!(root.derive_to(&target).is_err());
    }

    #[test]
    fn rejects_hardened_suffix() {
        let root = test_root(0x33);
        let target = KeyPath::parse("m/schema:1'/recovery:1'/invoices:4'/1/2").unwrap();

        let err = root.derive_to(&target).unwrap_err();
        assert!(err.to_string().contains("hardened"));
        assert!(root.public().derive_to(&target).is_err());
    }

    #[test]
    fn distinct_paths_yield_distinct_keys() {
        let root = test_root(0x44);
        let base = KeyPath::parse("m/schema:1'/recovery:1'/invoices:4/5/6").unwrap();

        let identity = root.derive_to(&base.child(0)).unwrap();
        let htlc = root.derive_to(&base.child(1)).unwrap();
        assert_ne!(identity.ec_public_key(), htlc.ec_public_key());
    }
}
