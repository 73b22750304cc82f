//! Nostr event model and signing codec.

use secp256k1::{schnorr::Signature, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Public request for bids, tagged with topics and addressed experts.
pub const KIND_ASK: u32 = 20174;
/// Outer bid envelope, ephemeral-signed, content is ciphertext.
pub const KIND_BID: u32 = 20175;
/// Inner expert-signed offer carried inside a bid.
pub const KIND_BID_PAYLOAD: u32 = 20176;
/// Encrypted question referencing the current context id.
pub const KIND_QUESTION: u32 = 20177;
/// Encrypted answer referencing the question id.
pub const KIND_ANSWER: u32 = 20178;

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a two-field tag such as `["e", <id>]`.
    pub fn pair(name: &str, value: &str) -> Self {
        Tag(vec![name.to_string(), value.to_string()])
    }
}

/// Core Nostr event exchanged with relays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (x-only hex).
    pub pubkey: String,
    /// Kind number, e.g. `20174`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|Tag(fields)| match fields.as_slice() {
            [n, v, ..] if n == name => Some(v.as_str()),
            _ => None,
        })
    }

    /// All values carried by tags named `name`.
    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter_map(|Tag(fields)| match fields.as_slice() {
                [n, v, ..] if n == name => Some(v.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Unsigned fields of an event about to be finalized.
#[derive(Debug, Clone)]
pub struct EventTemplate {
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

/// Signing identity holding a secp256k1 keypair.
#[derive(Clone)]
pub struct Keypair {
    pair: secp256k1::Keypair,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        Self {
            pair: secp256k1::Keypair::new(&secp, &mut rand::thread_rng()),
        }
    }

    /// Load a keypair from a 32-byte hex secret.
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret)?;
        let secp = Secp256k1::new();
        let pair = secp256k1::Keypair::from_seckey_slice(&secp, &bytes)?;
        Ok(Self { pair })
    }

    /// X-only public key as lowercase hex.
    pub fn public_hex(&self) -> String {
        hex::encode(self.pair.x_only_public_key().0.serialize())
    }

    /// Raw secret scalar bytes.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.pair.secret_bytes()
    }

    pub(crate) fn secret_key(&self) -> SecretKey {
        SecretKey::from_keypair(&self.pair)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_hex())
            .finish()
    }
}

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Build the canonical id and signature for `tmpl`, signed by `keys`.
pub fn finalize(tmpl: EventTemplate, keys: &Keypair) -> Result<Event> {
    let mut ev = Event {
        id: String::new(),
        pubkey: keys.public_hex(),
        kind: tmpl.kind,
        created_at: tmpl.created_at,
        tags: tmpl.tags,
        content: tmpl.content,
        sig: String::new(),
    };
    let hash = event_hash(&ev)?;
    ev.id = hex::encode(hash);
    let secp = Secp256k1::new();
    let msg = Message::from_digest_slice(&hash)?;
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &keys.pair);
    ev.sig = hex::encode(sig.as_ref());
    Ok(ev)
}

/// Verify an event's id and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(Error::Validation("id mismatch".into()));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: String::new(),
            pubkey: "00".repeat(32),
            kind: KIND_ASK,
            created_at: 1,
            tags: vec![
                Tag::pair("t", "bitcoin"),
                Tag::pair("t", "lightning"),
                Tag::pair("p", &"ab".repeat(32)),
            ],
            content: "anyone?".into(),
            sig: String::new(),
        }
    }

    #[test]
    fn tag_lookup() {
        let ev = sample_event();
        assert_eq!(ev.tag_value("t"), Some("bitcoin"));
        assert_eq!(ev.tag_values("t"), vec!["bitcoin", "lightning"]);
        assert!(ev.tag_value("e").is_none());
    }

    #[test]
    fn finalize_and_verify_round_trip() {
        let keys = Keypair::generate();
        let ev = finalize(
            EventTemplate {
                kind: KIND_BID_PAYLOAD,
                created_at: 42,
                tags: vec![Tag::pair("invoice", "lnbc1...")],
                content: "offer".into(),
            },
            &keys,
        )
        .unwrap();
        assert_eq!(ev.pubkey, keys.public_hex());
        assert_eq!(ev.id.len(), 64);
        verify_event(&ev).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_id() {
        let keys = Keypair::generate();
        let mut ev = finalize(
            EventTemplate {
                kind: 1,
                created_at: 1,
                tags: vec![],
                content: String::new(),
            },
            &keys,
        )
        .unwrap();
        let flip = if &ev.id[0..2] == "ff" { "00" } else { "ff" };
        ev.id.replace_range(0..2, flip);
        assert!(verify_event(&ev).is_err());
    }

    #[test]
    fn verify_rejects_tampered_sig() {
        let keys = Keypair::generate();
        let mut ev = finalize(
            EventTemplate {
                kind: 1,
                created_at: 1,
                tags: vec![],
                content: "x".into(),
            },
            &keys,
        )
        .unwrap();
        let flip = if &ev.sig[0..2] == "ff" { "00" } else { "ff" };
        ev.sig.replace_range(0..2, flip);
        assert!(verify_event(&ev).is_err());
    }

    #[test]
    fn event_hash_matches_reference() {
        let ev = sample_event();
        let expected = {
            let obj =
                serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_vec(&obj).unwrap());
            let bytes = hasher.finalize();
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&bytes);
            arr
        };
        assert_eq!(event_hash(&ev).unwrap(), expected);
    }

    #[test]
    fn keypair_secret_hex_round_trip() {
        let keys = Keypair::generate();
        let restored = Keypair::from_secret_hex(&hex::encode(keys.secret_bytes())).unwrap();
        assert_eq!(keys.public_hex(), restored.public_hex());
    }

    #[test]
    fn keypair_rejects_bad_hex() {
        assert!(Keypair::from_secret_hex("zz").is_err());
        assert!(Keypair::from_secret_hex("00").is_err());
    }
}
