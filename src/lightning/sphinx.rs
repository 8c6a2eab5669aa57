//! Destination-side validation of BOLT-4 onion packets.
//!
//! Only the final-hop checks a receiving wallet needs: HMAC authenticity
//! under the shared secret, the payment secret bound into the final TLV
//! payload, and the declared amount. No forwarding, no error packet
//! construction.

use anyhow::{Context as _, Result, bail, ensure};
use bitcoin::hashes::{Hash as _, HashEngine as _, Hmac, HmacEngine, sha256};
use bitcoin::secp256k1::ecdh::SharedSecret;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit as _, StreamCipher as _};

const HOP_PAYLOADS_LEN: usize = 1300;
/// version byte + ephemeral pubkey + hop payloads + hmac
const ONION_PACKET_LEN: usize = 1 + 33 + HOP_PAYLOADS_LEN + 32;

const AMT_TO_FORWARD_TYPE: u64 = 2;
const OUTGOING_CLTV_TYPE: u64 = 4;
const PAYMENT_DATA_TYPE: u64 = 8;

/// Parses `packet` as this node and verifies it terminates here with the
/// expected payment secret and amount. Returns nothing on success; every
/// failure is a descriptive error.
pub fn validate(
    packet: &[u8],
    payment_hash: &[u8],
    payment_secret: &[u8],
    node_key: &SecretKey,
    amount_msat: u64,
) -> Result<()> {
    ensure!(
        packet.len() == ONION_PACKET_LEN,
        "onion packet has {} bytes, expected {ONION_PACKET_LEN}",
        packet.len()
    );
    ensure!(packet[0] == 0, "unknown onion packet version {}", packet[0]);

    let ephemeral_key =
        PublicKey::from_slice(&packet[1..34]).context("parse onion ephemeral key")?;
    let hop_payloads = &packet[34..34 + HOP_PAYLOADS_LEN];
    let packet_hmac = &packet[34 + HOP_PAYLOADS_LEN..];

    let shared_secret = SharedSecret::new(&ephemeral_key, node_key).secret_bytes();
    let (rho, mu) = gen_rho_mu_from_shared_secret(&shared_secret);

    let mut mac = HmacEngine::<sha256::Hash>::new(&mu);
    mac.input(hop_payloads);
    mac.input(payment_hash);
    let expected_hmac = Hmac::from_engine(mac).to_byte_array();
    ensure!(
        fixed_time_eq(&expected_hmac, packet_hmac),
        "onion hmac does not verify"
    );

    let mut payloads = hop_payloads.to_vec();
    // The protocol keys ChaCha20 with an all-zero nonce. With a zero
    // nonce the 96-bit-nonce variant used here emits the same keystream
    // as the 64-bit-nonce original until the counter passes 2^32 blocks,
    // far beyond the 1300-byte payload.
    ChaCha20::new(&rho.into(), &[0u8; 12].into()).apply_keystream(&mut payloads);

    let (payload_len, len_bytes) =
        read_bigsize(&payloads).context("read onion payload length")?;
    ensure!(
        payload_len > 1,
        "onion payload uses the legacy format, expected tlv"
    );
    let payload_len = usize::try_from(payload_len).context("onion payload length")?;
    let payload_end = len_bytes
        .checked_add(payload_len)
        .filter(|end| *end <= HOP_PAYLOADS_LEN - 32)
        .context("onion payload length exceeds the packet")?;

    let next_hmac = &payloads[payload_end..payload_end + 32];
    ensure!(
        next_hmac.iter().all(|b| *b == 0),
        "onion does not terminate at this node"
    );

    let payload = FinalHopPayload::parse(&payloads[len_bytes..payload_end])
        .context("parse final hop payload")?;
    let payment_data = payload
        .payment_data
        .context("final hop payload carries no payment data")?;

    ensure!(
        fixed_time_eq(&payment_data.payment_secret, payment_secret),
        "onion payment secret does not match the invoice"
    );
    ensure!(
        payload.amt_to_forward == amount_msat,
        "onion declares {} msat, expected {amount_msat}",
        payload.amt_to_forward
    );
    ensure!(
        payment_data.total_msat == amount_msat,
        "onion declares a total of {} msat, expected {amount_msat}",
        payment_data.total_msat
    );

    Ok(())
}

struct FinalHopPayload {
    amt_to_forward: u64,
    #[allow(dead_code)]
    outgoing_cltv: u32,
    payment_data: Option<PaymentData>,
}

struct PaymentData {
    payment_secret: [u8; 32],
    total_msat: u64,
}

impl FinalHopPayload {
    fn parse(tlv: &[u8]) -> Result<FinalHopPayload> {
        let mut amt_to_forward = None;
        let mut outgoing_cltv = None;
        let mut payment_data = None;

        let mut offset = 0;
        let mut last_type = None;
        while offset < tlv.len() {
            let (record_type, consumed) =
                read_bigsize(&tlv[offset..]).context("read tlv type")?;
            offset += consumed;
            let (length, consumed) = read_bigsize(&tlv[offset..]).context("read tlv length")?;
            offset += consumed;

            let length = usize::try_from(length).context("tlv length")?;
            ensure!(length <= tlv.len() - offset, "tlv record exceeds payload");
            let value = &tlv[offset..offset + length];
            offset += length;

            ensure!(
                last_type.is_none_or(|last| record_type > last),
                "tlv records are not strictly increasing"
            );
            last_type = Some(record_type);

            match record_type {
                AMT_TO_FORWARD_TYPE => {
                    amt_to_forward = Some(read_truncated_u64(value).context("amt_to_forward")?);
                }
                OUTGOING_CLTV_TYPE => {
                    let cltv = read_truncated_u64(value).context("outgoing_cltv_value")?;
                    outgoing_cltv =
                        Some(u32::try_from(cltv).context("outgoing_cltv_value overflows u32")?);
                }
                PAYMENT_DATA_TYPE => {
                    ensure!(value.len() >= 32, "payment data record is too short");
                    let payment_secret: [u8; 32] =
                        value[..32].try_into().expect("32 bytes");
                    let total_msat = read_truncated_u64(&value[32..]).context("total_msat")?;
                    payment_data = Some(PaymentData {
                        payment_secret,
                        total_msat,
                    });
                }
                unknown if unknown % 2 == 0 => {
                    bail!("unknown even tlv type {unknown} in final hop payload");
                }
                _ => {}
            }
        }

        Ok(FinalHopPayload {
            amt_to_forward: amt_to_forward.context("final hop payload misses amt_to_forward")?,
            outgoing_cltv: outgoing_cltv.context("final hop payload misses outgoing_cltv")?,
            payment_data,
        })
    }
}

/// BOLT-1 BigSize: 1, 3, 5, or 9 bytes, canonical minimal encoding.
fn read_bigsize(buf: &[u8]) -> Result<(u64, usize)> {
    ensure!(!buf.is_empty(), "bigsize is empty");
    match buf[0] {
        0xff => {
            ensure!(buf.len() >= 9, "truncated bigsize");
            let value = u64::from_be_bytes(buf[1..9].try_into().expect("8 bytes"));
            ensure!(value > u32::MAX as u64, "non-canonical bigsize");
            Ok((value, 9))
        }
        0xfe => {
            ensure!(buf.len() >= 5, "truncated bigsize");
            let value = u32::from_be_bytes(buf[1..5].try_into().expect("4 bytes")) as u64;
            ensure!(value > u16::MAX as u64, "non-canonical bigsize");
            Ok((value, 5))
        }
        0xfd => {
            ensure!(buf.len() >= 3, "truncated bigsize");
            let value = u16::from_be_bytes(buf[1..3].try_into().expect("2 bytes")) as u64;
            ensure!(value >= 0xfd, "non-canonical bigsize");
            Ok((value, 3))
        }
        small => Ok((small as u64, 1)),
    }
}

/// Truncated big-endian u64 as used by tlv integer records: up to 8 bytes,
/// no leading zero bytes.
fn read_truncated_u64(value: &[u8]) -> Result<u64> {
    ensure!(value.len() <= 8, "truncated integer is too long");
    ensure!(
        value.first() != Some(&0),
        "truncated integer has leading zeroes"
    );
    let mut out = 0u64;
    for byte in value {
        out = out << 8 | *byte as u64;
    }
    Ok(out)
}

// Key derivation per BOLT-4: rho keys the payload stream cipher, mu keys
// the packet hmac.
fn gen_rho_mu_from_shared_secret(shared_secret: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    (
        hmac_sha256(b"rho", shared_secret),
        hmac_sha256(b"mu", shared_secret),
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut engine = HmacEngine::<sha256::Hash>::new(key);
    engine.input(data);
    Hmac::from_engine(engine).to_byte_array()
}

fn fixed_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}
