//! Three-message establishment protocol between the app and a web client.
//!
//! Primitives:
//!   KEM        — X25519 DHKEM: ciphertext = ephemeral public key,
//!                key = HKDF(DH(eph, peer) || eph_pub || peer_pub)
//!   Commitment — BLAKE3(tag || r || value), decommitment = r || value
//!   SAS        — 4 decimal digits from BLAKE3(app_seed || browser_seed || browser_pub)
//!
//! Flow (the browser's public key reaches the app out of band, e.g. a QR code):
//!
//!   app  -> browser : 1. { identifier, app_pub, kem_ct_A, commit(app_pub; kem_ct_A || seed_A) }
//!   browser -> app  : 2. { seed_B, kem_ct_B }
//!   app  -> browser : 3. { decommitment }
//!
//!   Both sides: SAS(seed_A, seed_B, browser_pub), key = KDF(combine(K_A, K_B))
//!
//! Non-negotiable:
//!   - The decommitment is only released after message 2 was accepted.
//!   - A failed step poisons the session; a new attempt starts from scratch.

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{aead::SymmetricKey, error::CryptoError, hash, kdf};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SEED_LEN: usize = 32;
pub const SAS_LENGTH: usize = 4;

const COMMITMENT_NONCE_LEN: usize = 32;

// ── Wire messages ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstMessage {
    pub connection_identifier: String,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub kem_ciphertext: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub commitment: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondMessage {
    #[serde(with = "serde_bytes")]
    pub seed: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub kem_ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThirdMessage {
    #[serde(with = "serde_bytes")]
    pub decommitment: Vec<u8>,
}

// ── Primitives ───────────────────────────────────────────────────────────────

/// Decode a compact (raw 32-byte) X25519 public key.
pub fn decode_public_key(bytes: &[u8]) -> Result<X25519Public, CryptoError> {
    let arr: [u8; PUBLIC_KEY_LEN] =
        bytes
            .try_into()
            .map_err(|_| CryptoError::PublicKeyDecoding {
                expected: PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
    Ok(X25519Public::from(arr))
}

fn kem_key(shared: &[u8; 32], ciphertext: &[u8], recipient: &X25519Public) -> Result<[u8; 32], CryptoError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(96));
    ikm.extend_from_slice(shared);
    ikm.extend_from_slice(ciphertext);
    ikm.extend_from_slice(recipient.as_bytes());
    let mut key = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(b"ib-kem-v1"), b"kem-shared-key", &mut key)?;
    Ok(key)
}

/// Encapsulate a fresh key to `recipient`. Returns (ciphertext, key).
pub fn encapsulate(recipient: &X25519Public) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
    let eph = StaticSecret::random_from_rng(OsRng);
    let eph_pub = X25519Public::from(&eph);
    let shared = eph.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::Encapsulation("low-order peer public key".into()));
    }
    let ciphertext = eph_pub.as_bytes().to_vec();
    let key = kem_key(shared.as_bytes(), &ciphertext, recipient)?;
    Ok((ciphertext, key))
}

/// Recover the key encapsulated to `secret` in `ciphertext`.
pub fn decapsulate(secret: &StaticSecret, ciphertext: &[u8]) -> Result<[u8; 32], CryptoError> {
    let eph_pub = decode_public_key(ciphertext)
        .map_err(|_| CryptoError::Decapsulation("ciphertext is not a public key".into()))?;
    let shared = secret.diffie_hellman(&eph_pub);
    if !shared.was_contributory() {
        return Err(CryptoError::Decapsulation("low-order ephemeral key".into()));
    }
    kem_key(shared.as_bytes(), ciphertext, &X25519Public::from(secret))
}

fn commitment_digest(tag: &[u8], nonce: &[u8], value: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"ib-commit-v1\x00");
    hasher.update(&(tag.len() as u64).to_le_bytes());
    hasher.update(tag);
    hasher.update(nonce);
    hasher.update(value);
    hasher.finalize().into()
}

/// Commit to `value` under `tag`. Returns (commitment, decommitment).
pub fn commit(tag: &[u8], value: &[u8]) -> ([u8; 32], Vec<u8>) {
    let mut nonce = [0u8; COMMITMENT_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let commitment = commitment_digest(tag, &nonce, value);
    let mut decommitment = Vec::with_capacity(COMMITMENT_NONCE_LEN + value.len());
    decommitment.extend_from_slice(&nonce);
    decommitment.extend_from_slice(value);
    (commitment, decommitment)
}

/// Check a decommitment against `commitment` and return the committed value.
pub fn open(tag: &[u8], commitment: &[u8], decommitment: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if decommitment.len() < COMMITMENT_NONCE_LEN {
        return Err(CryptoError::CommitmentMismatch);
    }
    let (nonce, value) = decommitment.split_at(COMMITMENT_NONCE_LEN);
    if commitment_digest(tag, nonce, value).as_slice() != commitment {
        return Err(CryptoError::CommitmentMismatch);
    }
    Ok(value.to_vec())
}

/// Short authentication string shown on both screens.
pub fn sas_code(app_seed: &[u8; SEED_LEN], browser_seed: &[u8; SEED_LEN], browser_public: &[u8]) -> String {
    let mut input = Vec::with_capacity(2 * SEED_LEN + browser_public.len() + 10);
    input.extend_from_slice(b"ib-sas-v1\x00");
    input.extend_from_slice(app_seed);
    input.extend_from_slice(browser_seed);
    input.extend_from_slice(browser_public);
    let digest = hash::hash(&input);
    let value = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{:0width$}", value % 10u32.pow(SAS_LENGTH as u32), width = SAS_LENGTH)
}

fn random_seed() -> [u8; SEED_LEN] {
    let mut seed = [0u8; SEED_LEN];
    OsRng.fill_bytes(&mut seed);
    seed
}

fn to_seed(bytes: &[u8]) -> Result<[u8; SEED_LEN], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte seed".into()))
}

// ── App side ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppStep {
    Init,
    FirstSent,
    SecondHandled,
    ThirdSent,
    Failed,
}

impl AppStep {
    fn name(self) -> &'static str {
        match self {
            AppStep::Init => "init",
            AppStep::FirstSent => "first-sent",
            AppStep::SecondHandled => "second-handled",
            AppStep::ThirdSent => "third-sent",
            AppStep::Failed => "failed",
        }
    }
}

/// Per-attempt handshake state held by the app.
pub struct AppEstablishment {
    secret: StaticSecret,
    public: X25519Public,
    seed: [u8; SEED_LEN],
    peer_public: Option<X25519Public>,
    peer_seed: Option<[u8; SEED_LEN]>,
    decommitment: Option<Vec<u8>>,
    local_derived: Option<[u8; 32]>,
    peer_derived: Option<[u8; 32]>,
    step: AppStep,
}

impl AppEstablishment {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            secret,
            public,
            seed: random_seed(),
            peer_public: None,
            peer_seed: None,
            decommitment: None,
            local_derived: None,
            peer_derived: None,
            step: AppStep::Init,
        }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }

    fn expect_step(&self, expected: AppStep, attempted: &'static str) -> Result<(), CryptoError> {
        match self.step {
            AppStep::Failed => Err(CryptoError::SessionPoisoned),
            s if s == expected => Ok(()),
            s => Err(CryptoError::OutOfOrderStep { attempted, current: s.name() }),
        }
    }

    fn fail<T>(&mut self, err: CryptoError) -> Result<T, CryptoError> {
        self.step = AppStep::Failed;
        Err(err)
    }

    pub fn prepare_first_message(
        &mut self,
        peer_public_key: &[u8],
        connection_identifier: &str,
    ) -> Result<FirstMessage, CryptoError> {
        self.expect_step(AppStep::Init, "prepare-first-message")?;
        let peer_public = match decode_public_key(peer_public_key) {
            Ok(pk) => pk,
            Err(e) => return self.fail(e),
        };
        let (kem_ciphertext, local_derived) = match encapsulate(&peer_public) {
            Ok(out) => out,
            Err(e) => return self.fail(e),
        };

        let mut committed = Vec::with_capacity(kem_ciphertext.len() + SEED_LEN);
        committed.extend_from_slice(&kem_ciphertext);
        committed.extend_from_slice(&self.seed);
        let (commitment, decommitment) = commit(self.public.as_bytes(), &committed);
        committed.zeroize();

        self.peer_public = Some(peer_public);
        self.local_derived = Some(local_derived);
        self.decommitment = Some(decommitment);
        self.step = AppStep::FirstSent;

        Ok(FirstMessage {
            connection_identifier: connection_identifier.to_string(),
            public_key: self.public.as_bytes().to_vec(),
            kem_ciphertext,
            commitment: commitment.to_vec(),
        })
    }

    pub fn handle_second_message(&mut self, msg: &SecondMessage) -> Result<(), CryptoError> {
        self.expect_step(AppStep::FirstSent, "handle-second-message")?;
        let peer_seed = match to_seed(&msg.seed) {
            Ok(s) => s,
            Err(e) => return self.fail(e),
        };
        let peer_derived = match decapsulate(&self.secret, &msg.kem_ciphertext) {
            Ok(k) => k,
            Err(e) => return self.fail(e),
        };
        self.peer_seed = Some(peer_seed);
        self.peer_derived = Some(peer_derived);
        self.step = AppStep::SecondHandled;
        Ok(())
    }

    pub fn prepare_third_message(&mut self) -> Result<ThirdMessage, CryptoError> {
        self.expect_step(AppStep::SecondHandled, "prepare-third-message")?;
        let decommitment = match self.decommitment.take() {
            Some(d) => d,
            None => return self.fail(CryptoError::MissingDerivedKey("decommitment")),
        };
        self.step = AppStep::ThirdSent;
        Ok(ThirdMessage { decommitment })
    }

    pub fn compute_sas_code(&self) -> Result<String, CryptoError> {
        let peer_seed = self
            .peer_seed
            .as_ref()
            .ok_or(CryptoError::MissingDerivedKey("peer seed"))?;
        let peer_public = self
            .peer_public
            .as_ref()
            .ok_or(CryptoError::MissingDerivedKey("peer public key"))?;
        Ok(sas_code(&self.seed, peer_seed, peer_public.as_bytes()))
    }

    pub fn derive_shared_key(&self) -> Result<SymmetricKey, CryptoError> {
        let local = self
            .local_derived
            .as_ref()
            .ok_or(CryptoError::MissingDerivedKey("local KEM key"))?;
        let peer = self
            .peer_derived
            .as_ref()
            .ok_or(CryptoError::MissingDerivedKey("peer KEM key"))?;
        let mut seed = kdf::combine_seeds(local, peer)?;
        let key = kdf::derive_symmetric_key(&seed);
        seed.zeroize();
        key
    }
}

impl Default for AppEstablishment {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AppEstablishment {
    fn drop(&mut self) {
        self.seed.zeroize();
        if let Some(k) = self.local_derived.as_mut() {
            k.zeroize();
        }
        if let Some(k) = self.peer_derived.as_mut() {
            k.zeroize();
        }
    }
}

// ── Browser side ─────────────────────────────────────────────────────────────

/// Peer role: the web client that displays its public key and verifies the
/// app's commitment.
pub struct BrowserEstablishment {
    secret: StaticSecret,
    public: X25519Public,
    seed: [u8; SEED_LEN],
    first: Option<FirstMessage>,
    app_seed: Option<[u8; SEED_LEN]>,
    app_derived: Option<[u8; 32]>,
    browser_derived: Option<[u8; 32]>,
}

impl BrowserEstablishment {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            secret,
            public,
            seed: random_seed(),
            first: None,
            app_seed: None,
            app_derived: None,
            browser_derived: None,
        }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }

    pub fn handle_first_message(&mut self, msg: FirstMessage) -> Result<SecondMessage, CryptoError> {
        if self.first.is_some() {
            return Err(CryptoError::OutOfOrderStep {
                attempted: "handle-first-message",
                current: "first-handled",
            });
        }
        let app_public = decode_public_key(&msg.public_key)?;
        let app_derived = decapsulate(&self.secret, &msg.kem_ciphertext)?;
        let (kem_ciphertext, browser_derived) = encapsulate(&app_public)?;
        self.app_derived = Some(app_derived);
        self.browser_derived = Some(browser_derived);
        self.first = Some(msg);
        Ok(SecondMessage {
            seed: self.seed.to_vec(),
            kem_ciphertext,
        })
    }

    pub fn handle_third_message(&mut self, msg: &ThirdMessage) -> Result<(), CryptoError> {
        let first = self.first.as_ref().ok_or(CryptoError::OutOfOrderStep {
            attempted: "handle-third-message",
            current: "init",
        })?;
        let value = open(&first.public_key, &first.commitment, &msg.decommitment)?;
        if value.len() != first.kem_ciphertext.len() + SEED_LEN
            || value[..first.kem_ciphertext.len()] != first.kem_ciphertext[..]
        {
            return Err(CryptoError::CommitmentMismatch);
        }
        self.app_seed = Some(to_seed(&value[first.kem_ciphertext.len()..])?);
        Ok(())
    }

    pub fn compute_sas_code(&self) -> Result<String, CryptoError> {
        let app_seed = self
            .app_seed
            .as_ref()
            .ok_or(CryptoError::MissingDerivedKey("app seed"))?;
        Ok(sas_code(app_seed, &self.seed, self.public.as_bytes()))
    }

    pub fn derive_shared_key(&self) -> Result<SymmetricKey, CryptoError> {
        let app = self
            .app_derived
            .as_ref()
            .ok_or(CryptoError::MissingDerivedKey("app KEM key"))?;
        let browser = self
            .browser_derived
            .as_ref()
            .ok_or(CryptoError::MissingDerivedKey("browser KEM key"))?;
        let mut seed = kdf::combine_seeds(app, browser)?;
        let key = kdf::derive_symmetric_key(&seed);
        seed.zeroize();
        key
    }
}

impl Default for BrowserEstablishment {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead;

    fn run_handshake() -> (AppEstablishment, BrowserEstablishment) {
        let mut browser = BrowserEstablishment::new();
        let mut app = AppEstablishment::new();
        let first = app
            .prepare_first_message(&browser.public_key(), "conn-1")
            .unwrap();
        let second = browser.handle_first_message(first).unwrap();
        app.handle_second_message(&second).unwrap();
        let third = app.prepare_third_message().unwrap();
        browser.handle_third_message(&third).unwrap();
        (app, browser)
    }

    #[test]
    fn both_sides_agree_on_sas_and_key() {
        let (app, browser) = run_handshake();
        let sas = app.compute_sas_code().unwrap();
        assert_eq!(sas.len(), SAS_LENGTH);
        assert!(sas.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(sas, browser.compute_sas_code().unwrap());
        assert_eq!(sas, app.compute_sas_code().unwrap(), "SAS must be stable");

        let app_key = app.derive_shared_key().unwrap();
        let browser_key = browser.derive_shared_key().unwrap();
        let ct = aead::encrypt(&app_key, b"relay frame", b"").unwrap();
        assert_eq!(&aead::decrypt(&browser_key, &ct, b"").unwrap()[..], b"relay frame");
    }

    #[test]
    fn sas_is_a_pure_function_of_its_inputs() {
        let a = [1u8; SEED_LEN];
        let b = [2u8; SEED_LEN];
        let pk = [3u8; PUBLIC_KEY_LEN];
        assert_eq!(sas_code(&a, &b, &pk), sas_code(&a, &b, &pk));
        assert_ne!(sas_code(&a, &b, &pk), sas_code(&b, &a, &pk));
    }

    #[test]
    fn malformed_peer_key_fails_first_step() {
        let mut app = AppEstablishment::new();
        let err = app.prepare_first_message(&[0u8; 31], "conn").unwrap_err();
        assert!(matches!(err, CryptoError::PublicKeyDecoding { actual: 31, .. }));
        // poisoned: no retry with stale state
        let browser = BrowserEstablishment::new();
        assert!(matches!(
            app.prepare_first_message(&browser.public_key(), "conn"),
            Err(CryptoError::SessionPoisoned)
        ));
    }

    #[test]
    fn low_order_peer_key_fails_encapsulation() {
        let mut app = AppEstablishment::new();
        assert!(matches!(
            app.prepare_first_message(&[0u8; 32], "conn"),
            Err(CryptoError::Encapsulation(_))
        ));
    }

    #[test]
    fn decommitment_is_not_released_before_second_message() {
        let browser = BrowserEstablishment::new();
        let mut app = AppEstablishment::new();
        app.prepare_first_message(&browser.public_key(), "conn").unwrap();
        assert!(matches!(
            app.prepare_third_message(),
            Err(CryptoError::OutOfOrderStep { .. })
        ));
        assert!(app.derive_shared_key().is_err());
    }

    #[test]
    fn bad_second_message_leaves_no_partial_state() {
        let browser = BrowserEstablishment::new();
        let mut app = AppEstablishment::new();
        app.prepare_first_message(&browser.public_key(), "conn").unwrap();
        let bogus = SecondMessage {
            seed: vec![0u8; SEED_LEN],
            kem_ciphertext: vec![1u8; 7],
        };
        assert!(app.handle_second_message(&bogus).is_err());
        assert!(app.compute_sas_code().is_err());
        assert!(matches!(
            app.prepare_third_message(),
            Err(CryptoError::SessionPoisoned)
        ));
    }

    #[test]
    fn tampered_decommitment_is_rejected() {
        let mut browser = BrowserEstablishment::new();
        let mut app = AppEstablishment::new();
        let first = app.prepare_first_message(&browser.public_key(), "c").unwrap();
        let second = browser.handle_first_message(first).unwrap();
        app.handle_second_message(&second).unwrap();
        let mut third = app.prepare_third_message().unwrap();
        let last = third.decommitment.len() - 1;
        third.decommitment[last] ^= 0x01;
        assert!(matches!(
            browser.handle_third_message(&third),
            Err(CryptoError::CommitmentMismatch)
        ));
    }

    #[test]
    fn commitment_roundtrip_and_tag_binding() {
        let (c, d) = commit(b"tag", b"value");
        assert_eq!(open(b"tag", &c, &d).unwrap(), b"value");
        assert!(open(b"other", &c, &d).is_err());
    }
}
