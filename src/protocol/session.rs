//! Session crypto context.
//!
//! One [`SessionCrypto`] lives per connection, shared by that connection's
//! receive and send drivers behind a mutex. It owns the current key epoch,
//! both direction counters, and any in-flight rekey.
//!
//! Encrypt path: random 16-byte IV, AES-256-CTR, HMAC-SHA256 over
//! seq‖timestamp‖iv‖ciphertext, then the send counter advances. Decrypt
//! path: the sequence check fails closed first, the tag is verified in
//! constant time before the ciphertext is touched, then the receive counter
//! advances. On an ordered transport a sequence gap is as fatal as a repeat.
//!
//! Rekey runs inside the encrypted session: the initiator offers fresh key
//! material, the responder answers, and both swap atomically. Both
//! counters reset to 0 and the old keys are zeroized.

use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::time::Instant;
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ChatError, Result};
use crate::protocol::envelope::{Envelope, IV_LEN, TAG_LEN};
use crate::protocol::handshake::{
    derive_session_keys, rsa_receive_secret, rsa_transport_secret, SessionKeys, SERVER_NONCE_LEN,
};
use crate::protocol::message::unix_millis;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Who holds what for future rekeys on this session.
pub enum RekeyAuthority {
    /// Server side of an RSA-transport session: wraps fresh secrets to the
    /// client's key.
    RsaServer(RsaPublicKey),
    /// Client side of an RSA-transport session: unwraps the server's fresh
    /// secrets.
    RsaClient(RsaPrivateKey),
    /// X25519 session: both sides contribute fresh ephemerals.
    X25519,
}

/// Fields of an outbound rekey offer, carried in a `system` control message.
pub struct RekeyInit {
    /// Initiator key material: X25519 public key or OAEP-wrapped secret
    pub material: Vec<u8>,
    /// Fresh KDF salt for the new epoch
    pub nonce: Vec<u8>,
}

/// Fields of the rekey answer.
pub struct RekeyDone {
    /// Responder key material: X25519 public key, empty for RSA transport
    pub material: Vec<u8>,
}

enum RekeyState {
    Idle,
    /// Initiator waiting for the responder's answer
    AwaitingDone {
        ephemeral: Option<EphemeralSecret>,
        nonce: Vec<u8>,
        /// RSA transport derives before the answer arrives
        derived: Option<SessionKeys>,
    },
    /// Responder derived new keys but must send its answer under the old ones
    Staged(SessionKeys),
}

/// Per-connection session cryptography state.
pub struct SessionCrypto {
    keys: SessionKeys,
    send_seq: u64,
    recv_next: u64,
    authority: RekeyAuthority,
    rekey: RekeyState,
    last_rekey: Instant,
}

impl SessionCrypto {
    /// Wrap freshly exchanged keys.
    pub fn new(keys: SessionKeys, authority: RekeyAuthority) -> Self {
        Self {
            keys,
            send_seq: 0,
            recv_next: 0,
            authority,
            rekey: RekeyState::Idle,
            last_rekey: Instant::now(),
        }
    }

    /// Next sequence number that will be stamped on an outbound envelope.
    pub fn send_seq(&self) -> u64 {
        self.send_seq
    }

    /// When the current key epoch was installed.
    pub fn last_rekey(&self) -> Instant {
        self.last_rekey
    }

    /// Whether a rekey exchange is in flight.
    pub fn rekey_in_progress(&self) -> bool {
        !matches!(self.rekey, RekeyState::Idle)
    }

    /// Encrypt one plaintext into an envelope and advance the send counter.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Envelope> {
        if plaintext.len() > MAX_PAYLOAD_SIZE {
            return Err(ChatError::Protocol(format!(
                "plaintext of {} bytes exceeds envelope capacity",
                plaintext.len()
            )));
        }

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut ciphertext = plaintext.to_vec();
        Aes256Ctr::new((&self.keys.cipher).into(), (&iv).into())
            .apply_keystream(&mut ciphertext);

        let timestamp_ms = unix_millis();
        let tag = compute_tag(&self.keys.mac, self.send_seq, timestamp_ms, &iv, &ciphertext);

        let envelope = Envelope {
            seq: self.send_seq,
            timestamp_ms,
            iv,
            ciphertext,
            tag,
        };
        self.send_seq += 1;
        Ok(envelope)
    }

    /// Verify and decrypt one envelope, advancing the receive counter.
    ///
    /// The tag check runs before the ciphertext is used; any failure here is
    /// fatal to the connection.
    pub fn decrypt(&mut self, envelope: &Envelope) -> Result<Vec<u8>> {
        if envelope.seq != self.recv_next {
            return Err(ChatError::ReplayDetected {
                expected: self.recv_next,
                got: envelope.seq,
            });
        }

        let expected = compute_tag(
            &self.keys.mac,
            envelope.seq,
            envelope.timestamp_ms,
            &envelope.iv,
            &envelope.ciphertext,
        );
        if expected.ct_eq(&envelope.tag).unwrap_u8() == 0 {
            return Err(ChatError::IntegrityFailed);
        }

        let mut plaintext = envelope.ciphertext.clone();
        Aes256Ctr::new((&self.keys.cipher).into(), (&envelope.iv).into())
            .apply_keystream(&mut plaintext);

        self.recv_next = envelope.seq + 1;
        Ok(plaintext)
    }

    /// Start a rekey as initiator. Returns the offer to carry to the peer
    /// inside the current session.
    pub fn begin_rekey(&mut self) -> Result<RekeyInit> {
        if self.rekey_in_progress() {
            return Err(ChatError::KeyExchangeFailed("rekey already in flight".into()));
        }

        let mut nonce = vec![0u8; SERVER_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        match &self.authority {
            RekeyAuthority::X25519 => {
                let secret = EphemeralSecret::random_from_rng(OsRng);
                let material = PublicKey::from(&secret).as_bytes().to_vec();
                self.rekey = RekeyState::AwaitingDone {
                    ephemeral: Some(secret),
                    nonce: nonce.clone(),
                    derived: None,
                };
                Ok(RekeyInit { material, nonce })
            }
            RekeyAuthority::RsaServer(client_key) => {
                let (keys, wrapped) = rsa_transport_secret(client_key, &nonce)?;
                self.rekey = RekeyState::AwaitingDone {
                    ephemeral: None,
                    nonce: nonce.clone(),
                    derived: Some(keys),
                };
                Ok(RekeyInit {
                    material: wrapped,
                    nonce,
                })
            }
            RekeyAuthority::RsaClient(_) => Err(ChatError::KeyExchangeFailed(
                "RSA-transport rekeys are initiated by the key-wrapping side".into(),
            )),
        }
    }

    /// Complete a rekey as initiator once the peer's answer arrives. Swaps
    /// keys and resets both counters.
    pub fn complete_rekey(&mut self, done: &RekeyDone) -> Result<()> {
        let state = std::mem::replace(&mut self.rekey, RekeyState::Idle);
        let new_keys = match state {
            RekeyState::AwaitingDone {
                ephemeral: Some(secret),
                nonce,
                ..
            } => {
                let peer: [u8; 32] = done.material.as_slice().try_into().map_err(|_| {
                    ChatError::KeyExchangeFailed("rekey answer must carry a 32-byte key".into())
                })?;
                let shared = secret.diffie_hellman(&PublicKey::from(peer));
                derive_session_keys(shared.as_bytes(), &nonce)
            }
            RekeyState::AwaitingDone {
                derived: Some(keys),
                ..
            } => keys,
            _ => {
                return Err(ChatError::KeyExchangeFailed(
                    "no rekey in flight to complete".into(),
                ))
            }
        };
        self.install(new_keys);
        Ok(())
    }

    /// Answer a rekey offer as responder. The returned answer must be
    /// encrypted under the OLD keys; call [`SessionCrypto::activate_staged`]
    /// immediately after it is sealed.
    pub fn respond_rekey(&mut self, init: &RekeyInit) -> Result<RekeyDone> {
        if self.rekey_in_progress() {
            return Err(ChatError::KeyExchangeFailed("rekey already in flight".into()));
        }

        match &self.authority {
            RekeyAuthority::X25519 => {
                let peer: [u8; 32] = init.material.as_slice().try_into().map_err(|_| {
                    ChatError::KeyExchangeFailed("rekey offer must carry a 32-byte key".into())
                })?;
                let secret = EphemeralSecret::random_from_rng(OsRng);
                let material = PublicKey::from(&secret).as_bytes().to_vec();
                let shared = secret.diffie_hellman(&PublicKey::from(peer));
                self.rekey = RekeyState::Staged(derive_session_keys(shared.as_bytes(), &init.nonce));
                Ok(RekeyDone { material })
            }
            RekeyAuthority::RsaClient(private_key) => {
                let keys = rsa_receive_secret(private_key, &init.material, &init.nonce)?;
                self.rekey = RekeyState::Staged(keys);
                Ok(RekeyDone {
                    material: Vec::new(),
                })
            }
            RekeyAuthority::RsaServer(_) => Err(ChatError::KeyExchangeFailed(
                "key-wrapping side does not answer rekey offers".into(),
            )),
        }
    }

    /// Install staged responder keys after the answer went out.
    pub fn activate_staged(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.rekey, RekeyState::Idle) {
            RekeyState::Staged(keys) => {
                self.install(keys);
                Ok(())
            }
            other => {
                self.rekey = other;
                Err(ChatError::KeyExchangeFailed("no staged rekey to activate".into()))
            }
        }
    }

    /// Atomic swap: new keys in, both counters to 0, old keys zeroized on
    /// drop.
    fn install(&mut self, keys: SessionKeys) {
        self.keys = keys;
        self.send_seq = 0;
        self.recv_next = 0;
        self.last_rekey = Instant::now();
    }
}

fn compute_tag(
    mac_key: &[u8; 32],
    seq: u64,
    timestamp_ms: u64,
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
) -> [u8; TAG_LEN] {
    let mut mac = HmacSha256::new_from_slice(mac_key)
        .expect("HMAC-SHA256 accepts 32-byte keys");
    mac.update(&seq.to_be_bytes());
    mac.update(&timestamp_ms.to_be_bytes());
    mac.update(iv);
    mac.update(ciphertext);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handshake::{respond_to_hello, CipherSuite, ClientHandshake};

    fn session_pair() -> (SessionCrypto, SessionCrypto) {
        let (client, hello) =
            ClientHandshake::initiate(CipherSuite::X25519Aes256HmacSha256).unwrap();
        let exchange = respond_to_hello(&hello).unwrap();
        let (client_keys, _) = client.complete(&exchange.reply).unwrap();

        (
            SessionCrypto::new(exchange.keys, RekeyAuthority::X25519),
            SessionCrypto::new(client_keys, RekeyAuthority::X25519),
        )
    }

    #[test]
    fn roundtrip_and_sequence_advance() {
        let (mut server, mut client) = session_pair();
        for i in 0..5u64 {
            let env = server.encrypt(format!("msg {i}").as_bytes()).unwrap();
            assert_eq!(env.seq, i);
            let plain = client.decrypt(&env).unwrap();
            assert_eq!(plain, format!("msg {i}").as_bytes());
        }
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let (mut server, _) = session_pair();
        let a = server.encrypt(b"same").unwrap();
        let b = server.encrypt(b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn replayed_envelope_rejected() {
        let (mut server, mut client) = session_pair();
        let env = server.encrypt(b"once").unwrap();
        client.decrypt(&env).unwrap();

        match client.decrypt(&env) {
            Err(ChatError::ReplayDetected { expected, got }) => {
                assert_eq!(expected, 1);
                assert_eq!(got, 0);
            }
            other => panic!("expected replay rejection, got {other:?}"),
        }
    }

    #[test]
    fn sequence_gap_rejected() {
        let (mut server, mut client) = session_pair();
        let _skipped = server.encrypt(b"never delivered").unwrap();
        let env = server.encrypt(b"arrives first").unwrap();
        assert!(matches!(
            client.decrypt(&env),
            Err(ChatError::ReplayDetected { expected: 0, got: 1 })
        ));
    }

    #[test]
    fn tampered_tag_rejected() {
        let (mut server, mut client) = session_pair();
        let mut env = server.encrypt(b"sensitive").unwrap();
        env.tag[0] ^= 0x01;
        assert!(matches!(client.decrypt(&env), Err(ChatError::IntegrityFailed)));
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (mut server, mut client) = session_pair();
        let mut env = server.encrypt(b"sensitive").unwrap();
        env.ciphertext[0] ^= 0x01;
        assert!(matches!(client.decrypt(&env), Err(ChatError::IntegrityFailed)));
    }

    #[test]
    fn tampered_sequence_rejected() {
        let (mut server, mut client) = session_pair();
        let mut env = server.encrypt(b"sensitive").unwrap();
        env.seq = 5;
        assert!(client.decrypt(&env).is_err());
    }

    #[test]
    fn x25519_rekey_resets_counters_and_roundtrips() {
        let (mut server, mut client) = session_pair();

        for _ in 0..10 {
            let env = server.encrypt(b"pre-rekey").unwrap();
            client.decrypt(&env).unwrap();
        }
        assert_eq!(server.send_seq(), 10);

        // Initiator offer travels encrypted; here we exercise the state
        // machine directly.
        let init = server.begin_rekey().unwrap();
        let done = client.respond_rekey(&init).unwrap();
        client.activate_staged().unwrap();
        server.complete_rekey(&done).unwrap();

        let env = server.encrypt(b"post-rekey").unwrap();
        assert_eq!(env.seq, 0);
        assert_eq!(client.decrypt(&env).unwrap(), b"post-rekey");

        let back = client.encrypt(b"reverse direction").unwrap();
        assert_eq!(back.seq, 0);
        assert_eq!(server.decrypt(&back).unwrap(), b"reverse direction");
    }

    #[test]
    fn old_key_frame_fails_after_rekey() {
        let (mut server, mut client) = session_pair();

        let stale = server.encrypt(b"sealed under old keys").unwrap();

        let init = server.begin_rekey().unwrap();
        let done = client.respond_rekey(&init).unwrap();
        client.activate_staged().unwrap();
        server.complete_rekey(&done).unwrap();

        assert!(matches!(
            client.decrypt(&stale),
            Err(ChatError::IntegrityFailed)
        ));
    }

    #[test]
    fn rsa_rekey_flows_server_to_client() {
        let key = rsa::RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let (client_hs, hello) = ClientHandshake::initiate_rsa_with_key(key).unwrap();
        let exchange = respond_to_hello(&hello).unwrap();
        let (client_keys, client_key) = client_hs.complete(&exchange.reply).unwrap();

        let mut server = SessionCrypto::new(
            exchange.keys,
            RekeyAuthority::RsaServer(exchange.client_rsa_key.unwrap()),
        );
        let mut client = SessionCrypto::new(
            client_keys,
            RekeyAuthority::RsaClient(client_key.unwrap()),
        );

        let env = server.encrypt(b"before").unwrap();
        client.decrypt(&env).unwrap();

        let init = server.begin_rekey().unwrap();
        let done = client.respond_rekey(&init).unwrap();
        assert!(done.material.is_empty());
        client.activate_staged().unwrap();
        server.complete_rekey(&done).unwrap();

        let env = server.encrypt(b"after").unwrap();
        assert_eq!(env.seq, 0);
        assert_eq!(client.decrypt(&env).unwrap(), b"after");
    }

    #[test]
    fn double_begin_rekey_rejected() {
        let (mut server, _) = session_pair();
        server.begin_rekey().unwrap();
        assert!(server.begin_rekey().is_err());
    }
}
