//! Conversation-key encryption (NIP-44 v2) and payment preimage checks.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::{ecdh, PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::event::Keypair;

/// Payload format version.
const VERSION: u8 = 2;
/// HKDF salt binding the conversation key to this scheme.
const HKDF_SALT: &[u8] = b"nip44-v2";
/// Random per-message nonce length.
const NONCE_LEN: usize = 32;
/// HMAC-SHA256 tag length.
const MAC_LEN: usize = 32;
/// Longest plaintext the padding scheme can carry.
const MAX_PLAINTEXT_LEN: usize = 65535;

type HmacSha256 = Hmac<Sha256>;

fn crypto_err(msg: &str) -> Error {
    Error::Crypto(msg.to_string())
}

/// Lift an x-only hex public key to a compressed even-parity point.
fn parse_xonly(pub_hex: &str) -> Result<PublicKey> {
    let bytes = hex::decode(pub_hex).map_err(|_| crypto_err("bad pubkey hex"))?;
    if bytes.len() != 32 {
        return Err(crypto_err("bad pubkey length"));
    }
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(&bytes);
    PublicKey::from_slice(&compressed).map_err(|_| crypto_err("invalid pubkey"))
}

/// Derive the pairwise conversation key shared by `(keys, their_pub)`.
///
/// The key is the raw HKDF-extract PRK over the ECDH x-coordinate.
/// Symmetric in the pair: key(a, pub(b)) == key(b, pub(a)).
fn conversation_key(keys: &Keypair, their_pub_hex: &str) -> Result<[u8; 32]> {
    let pk = parse_xonly(their_pub_hex)?;
    let secret: SecretKey = keys.secret_key();
    let shared = ecdh::shared_secret_point(&pk, &secret);
    let (prk, _) = Hkdf::<Sha256>::extract(Some(HKDF_SALT), &shared[..32]);
    let mut key = [0u8; 32];
    key.copy_from_slice(&prk);
    Ok(key)
}

/// Expand the per-message ChaCha20 key/nonce and HMAC key from a nonce.
///
/// HKDF-expand straight from the conversation key as PRK, info = nonce.
fn message_keys(conv_key: &[u8; 32], nonce: &[u8; 32]) -> Result<([u8; 32], [u8; 12], [u8; 32])> {
    let hk =
        Hkdf::<Sha256>::from_prk(conv_key).map_err(|_| crypto_err("bad conversation key"))?;
    let mut out = [0u8; 76];
    hk.expand(nonce, &mut out)
        .map_err(|_| crypto_err("hkdf expand failed"))?;
    let mut chacha_key = [0u8; 32];
    let mut chacha_nonce = [0u8; 12];
    let mut hmac_key = [0u8; 32];
    chacha_key.copy_from_slice(&out[0..32]);
    chacha_nonce.copy_from_slice(&out[32..44]);
    hmac_key.copy_from_slice(&out[44..76]);
    Ok((chacha_key, chacha_nonce, hmac_key))
}

/// Padded length for a prefixed plaintext: power-of-two buckets up to 256,
/// then multiples of 32, 32-byte minimum.
fn padded_len(unpadded: usize) -> usize {
    if unpadded <= 32 {
        32
    } else if unpadded <= 256 {
        unpadded.next_power_of_two()
    } else {
        unpadded.div_ceil(32) * 32
    }
}

/// Prefix the plaintext with its big-endian u16 length and zero-pad.
fn pad(plaintext: &str) -> Result<Vec<u8>> {
    let bytes = plaintext.as_bytes();
    if bytes.is_empty() {
        return Err(crypto_err("empty plaintext"));
    }
    if bytes.len() > MAX_PLAINTEXT_LEN {
        return Err(crypto_err("plaintext too long"));
    }
    let mut padded = vec![0u8; padded_len(2 + bytes.len())];
    padded[0] = (bytes.len() >> 8) as u8;
    padded[1] = (bytes.len() & 0xff) as u8;
    padded[2..2 + bytes.len()].copy_from_slice(bytes);
    Ok(padded)
}

/// Validate padding and recover the plaintext.
fn unpad(padded: &[u8]) -> Result<String> {
    if padded.len() < 2 {
        return Err(crypto_err("bad padding"));
    }
    let len = ((padded[0] as usize) << 8) | padded[1] as usize;
    if len == 0 || len > MAX_PLAINTEXT_LEN || padded.len() < 2 + len {
        return Err(crypto_err("bad padding"));
    }
    if padded.len() != padded_len(2 + len) {
        return Err(crypto_err("bad padding"));
    }
    if padded[2 + len..].iter().any(|&b| b != 0) {
        return Err(crypto_err("bad padding"));
    }
    String::from_utf8(padded[2..2 + len].to_vec()).map_err(|_| crypto_err("bad padding"))
}

/// Encrypt `plaintext` for the holder of `their_pub_hex`.
///
/// Output is base64 of `version || nonce || ciphertext || mac`.
pub fn encrypt(plaintext: &str, keys: &Keypair, their_pub_hex: &str) -> Result<String> {
    let conv_key = conversation_key(keys, their_pub_hex)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let (chacha_key, chacha_nonce, hmac_key) = message_keys(&conv_key, &nonce)?;

    let mut ciphertext = pad(plaintext)?;
    let mut cipher = ChaCha20::new(&chacha_key.into(), &chacha_nonce.into());
    cipher.apply_keystream(&mut ciphertext);

    let mut mac = HmacSha256::new_from_slice(&hmac_key).map_err(|_| crypto_err("bad mac key"))?;
    mac.update(&nonce);
    mac.update(&ciphertext);
    let tag = mac.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len() + MAC_LEN);
    payload.push(VERSION);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&tag);
    Ok(BASE64.encode(payload))
}

/// Decrypt a payload produced by the counterparty with the mirrored key pair.
pub fn decrypt(payload: &str, keys: &Keypair, their_pub_hex: &str) -> Result<String> {
    let decoded = BASE64
        .decode(payload)
        .map_err(|_| crypto_err("bad base64"))?;
    if decoded.len() < 1 + NONCE_LEN + 32 + MAC_LEN {
        return Err(crypto_err("payload too short"));
    }
    if decoded[0] != VERSION {
        return Err(crypto_err("unsupported version"));
    }
    let nonce: [u8; 32] = decoded[1..1 + NONCE_LEN].try_into().unwrap();
    let ciphertext = &decoded[1 + NONCE_LEN..decoded.len() - MAC_LEN];
    let received_mac = &decoded[decoded.len() - MAC_LEN..];

    let conv_key = conversation_key(keys, their_pub_hex)?;
    let (chacha_key, chacha_nonce, hmac_key) = message_keys(&conv_key, &nonce)?;

    let mut mac = HmacSha256::new_from_slice(&hmac_key).map_err(|_| crypto_err("bad mac key"))?;
    mac.update(&nonce);
    mac.update(ciphertext);
    mac.verify_slice(received_mac)
        .map_err(|_| crypto_err("mac mismatch"))?;

    let mut plaintext = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&chacha_key.into(), &chacha_nonce.into());
    cipher.apply_keystream(&mut plaintext);
    unpad(&plaintext)
}

/// Whether SHA-256 of the hex preimage equals the hex payment hash.
pub fn preimage_matches(preimage_hex: &str, payment_hash_hex: &str) -> bool {
    let (Ok(preimage), Ok(hash)) = (hex::decode(preimage_hex), hex::decode(payment_hash_hex))
    else {
        return false;
    };
    Sha256::digest(&preimage).as_slice() == hash.as_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_len_buckets() {
        assert_eq!(padded_len(1), 32);
        assert_eq!(padded_len(32), 32);
        assert_eq!(padded_len(33), 64);
        assert_eq!(padded_len(256), 256);
        assert_eq!(padded_len(257), 288);
        assert_eq!(padded_len(1000), 1024);
    }

    #[test]
    fn pad_unpad_round_trip() {
        let padded = pad("hello there").unwrap();
        assert_eq!(padded.len(), 32);
        assert_eq!(unpad(&padded).unwrap(), "hello there");
    }

    #[test]
    fn unpad_rejects_nonzero_padding() {
        let mut padded = pad("test").unwrap();
        let last = padded.len() - 1;
        padded[last] = 1;
        assert!(unpad(&padded).is_err());
    }

    #[test]
    fn conversation_key_is_the_raw_extract_prk() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let key = conversation_key(&a, &b.public_hex()).unwrap();
        // HKDF-extract is HMAC(salt, ikm); the key must be that PRK verbatim.
        let pk = parse_xonly(&b.public_hex()).unwrap();
        let secret = a.secret_key();
        let shared = ecdh::shared_secret_point(&pk, &secret);
        let mut mac = HmacSha256::new_from_slice(HKDF_SALT).unwrap();
        mac.update(&shared[..32]);
        let expected = mac.finalize().into_bytes();
        assert_eq!(key.as_slice(), expected.as_slice());
    }

    #[test]
    fn encrypt_decrypt_is_symmetric_in_the_pair() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let ct = encrypt("the answer is 42", &a, &b.public_hex()).unwrap();
        assert_ne!(ct, "the answer is 42");
        let pt = decrypt(&ct, &b, &a.public_hex()).unwrap();
        assert_eq!(pt, "the answer is 42");
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let ct = encrypt("payload", &a, &b.public_hex()).unwrap();
        let mut raw = BASE64.decode(&ct).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(decrypt(&tampered, &b, &a.public_hex()).is_err());
    }

    #[test]
    fn decrypt_rejects_wrong_version() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let ct = encrypt("payload", &a, &b.public_hex()).unwrap();
        let mut raw = BASE64.decode(&ct).unwrap();
        raw[0] = 1;
        let wrong = BASE64.encode(raw);
        assert!(decrypt(&wrong, &b, &a.public_hex()).is_err());
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let c = Keypair::generate();
        let ct = encrypt("payload", &a, &b.public_hex()).unwrap();
        assert!(decrypt(&ct, &c, &a.public_hex()).is_err());
    }

    #[test]
    fn preimage_check() {
        let preimage = hex::encode(b"secret-preimage");
        let hash = hex::encode(Sha256::digest(b"secret-preimage"));
        assert!(preimage_matches(&preimage, &hash));
        assert!(!preimage_matches(&preimage, &hex::encode([0u8; 32])));
        assert!(!preimage_matches("not hex", &hash));
    }
}
