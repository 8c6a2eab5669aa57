use anyhow::{Context as _, Result, ensure};
use bitcoin::consensus::encode::deserialize;
use bitcoin::hashes::Hash as _;
use bitcoin::opcodes;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey, ecdsa};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Address, Network, OutPoint, ScriptBuf, Transaction, Witness};

/// The submarine-swap HTLC locking an incoming payment on-chain.
///
/// Spend paths:
/// - preimage + user signature + server co-signature (fulfillment), or
/// - user signature alone once the chain passes `expiration_height`.
#[derive(Debug, Clone)]
pub struct HtlcSpec {
    pub payment_hash: [u8; 32],
    pub user_pubkey: PublicKey,
    pub muun_pubkey: PublicKey,
    pub expiration_height: i64,
}

impl HtlcSpec {
    pub fn witness_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(opcodes::all::OP_DUP)
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(self.payment_hash)
            .push_opcode(opcodes::all::OP_EQUAL)
            .push_opcode(opcodes::all::OP_IF)
            .push_opcode(opcodes::all::OP_DROP)
            .push_slice(self.muun_pubkey.serialize())
            .push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
            .push_opcode(opcodes::all::OP_ELSE)
            .push_int(self.expiration_height)
            .push_opcode(opcodes::all::OP_CLTV)
            .push_opcode(opcodes::all::OP_2DROP)
            .push_opcode(opcodes::all::OP_ENDIF)
            .push_slice(self.user_pubkey.serialize())
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .into_script()
    }
}

/// The on-chain side of an incoming swap, everything needed to validate
/// and counter-sign the server-proposed fulfillment transaction.
pub(crate) struct IncomingSwapCoin<'a> {
    pub network: Network,
    pub muun_signature: &'a [u8],
    pub htlc_tx: &'a [u8],
    pub payment_hash: [u8; 32],
    pub swap_server_public_key: &'a [u8],
    pub expiration_height: i64,
    pub collect_sat: i64,
    pub verify_output_amount: bool,
}

impl IncomingSwapCoin<'_> {
    /// Validates the htlc input of `tx` and fills in its witness.
    ///
    /// The muun co-signature must already verify against the BIP-143
    /// sighash; on success the input carries the full fulfillment witness
    /// `[user sig, muun sig, preimage, script]`.
    pub fn sign_input(
        &self,
        index: usize,
        tx: &mut Transaction,
        user_key: &SecretKey,
        muun_pubkey: &PublicKey,
        preimage: &[u8; 32],
    ) -> Result<()> {
        // The server's per-swap key rides along in the payload; it has to
        // be a valid point even though the script commits to the derived
        // cosigner key.
        PublicKey::from_slice(self.swap_server_public_key)
            .context("parse swap server public key")?;

        let secp = Secp256k1::new();
        let spec = HtlcSpec {
            payment_hash: self.payment_hash,
            user_pubkey: user_key.public_key(&secp),
            muun_pubkey: *muun_pubkey,
            expiration_height: self.expiration_height,
        };
        let witness_script = spec.witness_script();

        let htlc_tx: Transaction = deserialize(self.htlc_tx).context("deserialize htlc tx")?;
        let htlc_address = Address::p2wsh(&witness_script, self.network);
        let htlc_script_pubkey = htlc_address.script_pubkey();

        let htlc_output_index = htlc_tx
            .output
            .iter()
            .position(|out| out.script_pubkey == htlc_script_pubkey)
            .with_context(|| {
                format!("htlc tx pays no output to the expected htlc address {htlc_address}")
            })?;
        let htlc_output = &htlc_tx.output[htlc_output_index];

        let expected_outpoint = OutPoint {
            txid: htlc_tx.compute_txid(),
            vout: htlc_output_index as u32,
        };
        ensure!(
            tx.input[index].previous_output == expected_outpoint,
            "fulfillment tx spends {}, expected the htlc outpoint {expected_outpoint}",
            tx.input[index].previous_output
        );

        if self.verify_output_amount {
            let expected_sat = htlc_output.value.to_sat() as i64 - self.collect_sat;
            let actual_sat = tx.output[0].value.to_sat() as i64;
            ensure!(
                actual_sat == expected_sat,
                "fulfillment tx pays {actual_sat} sat, expected {expected_sat}"
            );
        }

        let sighash = SighashCache::new(&*tx)
            .p2wsh_signature_hash(
                index,
                &witness_script,
                htlc_output.value,
                EcdsaSighashType::All,
            )
            .context("compute htlc sighash")?;
        let digest = Message::from_digest(sighash.to_byte_array());

        let muun_signature =
            ecdsa::Signature::from_der(self.muun_signature).context("parse muun signature")?;
        secp.verify_ecdsa(&digest, &muun_signature, muun_pubkey)
            .context("muun signature does not verify against the htlc")?;

        let user_signature = secp.sign_ecdsa(&digest, user_key);

        tx.input[index].witness = Witness::from_slice(&[
            with_sighash_type(&user_signature),
            with_sighash_type(&muun_signature),
            preimage.to_vec(),
            witness_script.to_bytes(),
        ]);
        Ok(())
    }
}

fn with_sighash_type(signature: &ecdsa::Signature) -> Vec<u8> {
    let mut bytes = signature.serialize_der().to_vec();
    bytes.push(EcdsaSighashType::All.to_u32() as u8);
    bytes
}
