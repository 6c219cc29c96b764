//! Session key exchange.
//!
//! Before any envelope flows, client and server trade two plaintext frames
//! (version byte 0, JSON bodies, binary fields hex-encoded):
//!
//! - `HELLO` client → server: protocol version, supported cipher suites, and
//!   the client's public key.
//! - `HELLO_ACK` server → client: the chosen suite, the server's key
//!   material, and a fresh nonce salting the KDF.
//!
//! The server is always the responder. Two suites are negotiated on the
//! wire: X25519 ECDH (both sides contribute an ephemeral key) and RSA-2048
//! key transport (the server draws the shared secret and wraps it to the
//! client's RSA key with OAEP). Either way both sides end up with a 32-byte
//! shared secret, which HKDF-SHA256 stretches into a confidentiality key and
//! an HMAC key.
//!
//! Handshake state is session-scoped and zeroized on drop; nothing here is
//! shared between connections.

use bytes::{BufMut, Bytes, BytesMut};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ChatError, Result};
use crate::protocol::envelope::HANDSHAKE_VERSION;

/// Protocol version expected in HELLO.
pub const HELLO_PROTO_VERSION: u8 = 1;

/// KDF salt length sent as the server nonce.
pub const SERVER_NONCE_LEN: usize = 16;

/// RSA modulus size accepted from clients.
pub const RSA_KEY_BITS: usize = 2048;

/// Negotiable cipher suites, in server preference order.
pub const SUPPORTED_SUITES: [CipherSuite; 2] =
    [CipherSuite::X25519Aes256HmacSha256, CipherSuite::RsaAes256HmacSha256];

/// One negotiable algorithm bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// RSA-2048-OAEP key transport, AES-256-CTR, HMAC-SHA256
    RsaAes256HmacSha256,
    /// X25519 ECDH, AES-256-CTR, HMAC-SHA256
    X25519Aes256HmacSha256,
}

impl CipherSuite {
    /// Wire identifier used in handshake frames.
    pub fn wire_name(&self) -> &'static str {
        match self {
            CipherSuite::RsaAes256HmacSha256 => "RSA-AES256-HMACSHA256",
            CipherSuite::X25519Aes256HmacSha256 => "X25519-AES256-HMACSHA256",
        }
    }

    /// Parse a wire identifier.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "RSA-AES256-HMACSHA256" => Some(CipherSuite::RsaAes256HmacSha256),
            "X25519-AES256-HMACSHA256" => Some(CipherSuite::X25519Aes256HmacSha256),
            _ => None,
        }
    }
}

/// Hex-string encoding for binary JSON fields.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(|e| serde::de::Error::custom(format!("invalid hex: {e}")))
    }
}

/// Pre-session frames exchanged with version byte 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame")]
pub enum HandshakeFrame {
    /// Client opener.
    #[serde(rename = "HELLO")]
    Hello {
        /// Wire protocol version the client speaks
        #[serde(rename = "protoVersion")]
        proto_version: u8,
        /// Suites the client accepts, most preferred first
        #[serde(rename = "supportedCipherSuites")]
        supported_cipher_suites: Vec<String>,
        /// X25519 public key (32 bytes) or RSA SPKI DER, per the offered suite
        #[serde(rename = "clientPublicKey", with = "hex_bytes")]
        client_public_key: Vec<u8>,
    },

    /// Server response; after this both sides derive keys and switch to
    /// envelopes.
    #[serde(rename = "HELLO_ACK")]
    HelloAck {
        /// The suite the server selected from the client's list
        #[serde(rename = "chosenCipherSuite")]
        chosen_cipher_suite: String,
        /// Server X25519 public key, or the OAEP-wrapped shared secret
        #[serde(rename = "serverPublicKey", with = "hex_bytes")]
        server_public_key: Vec<u8>,
        /// KDF salt
        #[serde(rename = "serverNonce", with = "hex_bytes")]
        server_nonce: Vec<u8>,
    },
}

impl HandshakeFrame {
    /// Serialize as a frame payload: version byte 0 followed by the JSON
    /// body.
    pub fn to_frame_bytes(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(self)?;
        let mut buf = BytesMut::with_capacity(1 + body.len());
        buf.put_u8(HANDSHAKE_VERSION);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Parse a frame payload carrying a handshake frame.
    pub fn from_frame_bytes(payload: &[u8]) -> Result<Self> {
        match payload.split_first() {
            Some((&HANDSHAKE_VERSION, body)) => serde_json::from_slice(body)
                .map_err(|e| ChatError::KeyExchangeFailed(format!("malformed handshake frame: {e}"))),
            _ => Err(ChatError::KeyExchangeFailed(
                "expected handshake frame".into(),
            )),
        }
    }
}

/// Derived symmetric key pair for one session epoch.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// AES-256-CTR confidentiality key
    pub cipher: [u8; 32],
    /// HMAC-SHA256 integrity key
    pub mac: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// Stretch a shared secret into the session key pair.
///
/// HKDF-SHA256 with the server nonce as salt and distinct info labels for
/// the two outputs.
pub fn derive_session_keys(shared_secret: &[u8], server_nonce: &[u8]) -> SessionKeys {
    let hk = Hkdf::<Sha256>::new(Some(server_nonce), shared_secret);
    let mut cipher = [0u8; 32];
    let mut mac = [0u8; 32];
    hk.expand(b"securechat v1 cipher key", &mut cipher)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    hk.expand(b"securechat v1 mac key", &mut mac)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    SessionKeys { cipher, mac }
}

/// What the responder learned from a completed exchange.
pub struct ServerKeyExchange {
    /// Derived session keys
    pub keys: SessionKeys,
    /// HELLO_ACK to send back
    pub reply: HandshakeFrame,
    /// The negotiated suite
    pub suite: CipherSuite,
    /// Client RSA key retained for rekey wrapping (RSA suite only)
    pub client_rsa_key: Option<RsaPublicKey>,
}

/// Respond to a client HELLO: negotiate the suite, run the exchange, derive
/// keys.
pub fn respond_to_hello(hello: &HandshakeFrame) -> Result<ServerKeyExchange> {
    let (proto_version, offered, client_public_key) = match hello {
        HandshakeFrame::Hello {
            proto_version,
            supported_cipher_suites,
            client_public_key,
        } => (*proto_version, supported_cipher_suites, client_public_key),
        HandshakeFrame::HelloAck { .. } => {
            return Err(ChatError::KeyExchangeFailed(
                "unexpected HELLO_ACK from client".into(),
            ))
        }
    };

    if proto_version != HELLO_PROTO_VERSION {
        return Err(ChatError::KeyExchangeFailed(format!(
            "unsupported protocol version {proto_version}"
        )));
    }

    // Client preference order wins among the suites we support.
    let suite = offered
        .iter()
        .find_map(|name| CipherSuite::from_wire_name(name))
        .ok_or_else(|| {
            ChatError::KeyExchangeFailed(format!("no common cipher suite in {offered:?}"))
        })?;

    let mut server_nonce = vec![0u8; SERVER_NONCE_LEN];
    OsRng.fill_bytes(&mut server_nonce);

    let (keys, server_public_key, client_rsa_key) = match suite {
        CipherSuite::X25519Aes256HmacSha256 => {
            let peer: [u8; 32] = client_public_key.as_slice().try_into().map_err(|_| {
                ChatError::KeyExchangeFailed("X25519 public key must be 32 bytes".into())
            })?;
            let secret = EphemeralSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&secret);
            let shared = secret.diffie_hellman(&PublicKey::from(peer));
            let keys = derive_session_keys(shared.as_bytes(), &server_nonce);
            (keys, public.as_bytes().to_vec(), None)
        }
        CipherSuite::RsaAes256HmacSha256 => {
            let client_key =
                RsaPublicKey::from_public_key_der(client_public_key).map_err(|e| {
                    ChatError::KeyExchangeFailed(format!("invalid RSA public key DER: {e}"))
                })?;
            if client_key.size() * 8 < RSA_KEY_BITS {
                return Err(ChatError::KeyExchangeFailed(format!(
                    "RSA key below {RSA_KEY_BITS} bits"
                )));
            }
            let (keys, wrapped) = rsa_transport_secret(&client_key, &server_nonce)?;
            (keys, wrapped, Some(client_key))
        }
    };

    let reply = HandshakeFrame::HelloAck {
        chosen_cipher_suite: suite.wire_name().to_string(),
        server_public_key,
        server_nonce,
    };

    Ok(ServerKeyExchange {
        keys,
        reply,
        suite,
        client_rsa_key,
    })
}

/// Draw a fresh 32-byte secret, wrap it to the client's RSA key, and derive
/// session keys from it. Shared by the initial exchange and RSA rekeys.
pub fn rsa_transport_secret(
    client_key: &RsaPublicKey,
    nonce: &[u8],
) -> Result<(SessionKeys, Vec<u8>)> {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);

    let wrapped = client_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &secret)
        .map_err(|e| ChatError::KeyExchangeFailed(format!("RSA wrap failed: {e}")))?;

    let keys = derive_session_keys(&secret, nonce);
    secret.zeroize();
    Ok((keys, wrapped))
}

/// Unwrap an RSA-transported secret and derive session keys from it.
pub fn rsa_receive_secret(
    private_key: &RsaPrivateKey,
    wrapped: &[u8],
    nonce: &[u8],
) -> Result<SessionKeys> {
    let mut secret = private_key
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|e| ChatError::KeyExchangeFailed(format!("RSA unwrap failed: {e}")))?;
    let keys = derive_session_keys(&secret, nonce);
    secret.zeroize();
    Ok(keys)
}

/// Client-side handshake state, consumed on completion.
pub enum ClientHandshake {
    /// Waiting for the ECDH response
    X25519(EphemeralSecret),
    /// Waiting for the wrapped secret
    Rsa(RsaPrivateKey),
}

impl ClientHandshake {
    /// Build a HELLO for the given suite, generating fresh key material.
    ///
    /// RSA key generation is slow; callers that already hold a key should
    /// use [`ClientHandshake::initiate_rsa_with_key`].
    pub fn initiate(suite: CipherSuite) -> Result<(Self, HandshakeFrame)> {
        match suite {
            CipherSuite::X25519Aes256HmacSha256 => {
                let secret = EphemeralSecret::random_from_rng(OsRng);
                let public = PublicKey::from(&secret);
                let hello = Self::hello_frame(suite, public.as_bytes().to_vec());
                Ok((ClientHandshake::X25519(secret), hello))
            }
            CipherSuite::RsaAes256HmacSha256 => {
                let key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS).map_err(|e| {
                    ChatError::KeyExchangeFailed(format!("RSA key generation failed: {e}"))
                })?;
                Ok(Self::initiate_rsa_with_key(key)?)
            }
        }
    }

    /// Build a HELLO offering RSA key transport with an existing key.
    pub fn initiate_rsa_with_key(key: RsaPrivateKey) -> Result<(Self, HandshakeFrame)> {
        let der = RsaPublicKey::from(&key)
            .to_public_key_der()
            .map_err(|e| ChatError::KeyExchangeFailed(format!("RSA DER encoding failed: {e}")))?;
        let hello = Self::hello_frame(
            CipherSuite::RsaAes256HmacSha256,
            der.as_bytes().to_vec(),
        );
        Ok((ClientHandshake::Rsa(key), hello))
    }

    fn hello_frame(suite: CipherSuite, client_public_key: Vec<u8>) -> HandshakeFrame {
        HandshakeFrame::Hello {
            proto_version: HELLO_PROTO_VERSION,
            supported_cipher_suites: vec![suite.wire_name().to_string()],
            client_public_key,
        }
    }

    /// Consume the HELLO_ACK and derive the session keys.
    ///
    /// For the RSA suite the private key is returned so the caller can
    /// unwrap future rekeys.
    pub fn complete(self, ack: &HandshakeFrame) -> Result<(SessionKeys, Option<RsaPrivateKey>)> {
        let (chosen, server_public_key, server_nonce) = match ack {
            HandshakeFrame::HelloAck {
                chosen_cipher_suite,
                server_public_key,
                server_nonce,
            } => (chosen_cipher_suite, server_public_key, server_nonce),
            HandshakeFrame::Hello { .. } => {
                return Err(ChatError::KeyExchangeFailed(
                    "unexpected HELLO from server".into(),
                ))
            }
        };

        match (self, CipherSuite::from_wire_name(chosen)) {
            (ClientHandshake::X25519(secret), Some(CipherSuite::X25519Aes256HmacSha256)) => {
                let peer: [u8; 32] = server_public_key.as_slice().try_into().map_err(|_| {
                    ChatError::KeyExchangeFailed("server X25519 key must be 32 bytes".into())
                })?;
                let shared = secret.diffie_hellman(&PublicKey::from(peer));
                Ok((derive_session_keys(shared.as_bytes(), server_nonce), None))
            }
            (ClientHandshake::Rsa(key), Some(CipherSuite::RsaAes256HmacSha256)) => {
                let keys = rsa_receive_secret(&key, server_public_key, server_nonce)?;
                Ok((keys, Some(key)))
            }
            _ => Err(ChatError::KeyExchangeFailed(format!(
                "server chose unexpected suite '{chosen}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x25519_exchange_agrees() {
        let (client, hello) =
            ClientHandshake::initiate(CipherSuite::X25519Aes256HmacSha256).unwrap();
        let exchange = respond_to_hello(&hello).unwrap();
        assert_eq!(exchange.suite, CipherSuite::X25519Aes256HmacSha256);
        assert!(exchange.client_rsa_key.is_none());

        let (client_keys, rsa_key) = client.complete(&exchange.reply).unwrap();
        assert!(rsa_key.is_none());
        assert_eq!(client_keys.cipher, exchange.keys.cipher);
        assert_eq!(client_keys.mac, exchange.keys.mac);
        assert_ne!(client_keys.cipher, client_keys.mac);
    }

    #[test]
    fn rsa_exchange_agrees() {
        let key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS).unwrap();
        let (client, hello) = ClientHandshake::initiate_rsa_with_key(key).unwrap();
        let exchange = respond_to_hello(&hello).unwrap();
        assert_eq!(exchange.suite, CipherSuite::RsaAes256HmacSha256);
        assert!(exchange.client_rsa_key.is_some());

        let (client_keys, rsa_key) = client.complete(&exchange.reply).unwrap();
        assert!(rsa_key.is_some());
        assert_eq!(client_keys.cipher, exchange.keys.cipher);
        assert_eq!(client_keys.mac, exchange.keys.mac);
    }

    #[test]
    fn two_exchanges_yield_distinct_keys() {
        let (c1, h1) = ClientHandshake::initiate(CipherSuite::X25519Aes256HmacSha256).unwrap();
        let (c2, h2) = ClientHandshake::initiate(CipherSuite::X25519Aes256HmacSha256).unwrap();
        let e1 = respond_to_hello(&h1).unwrap();
        let e2 = respond_to_hello(&h2).unwrap();

        let (k1, _) = c1.complete(&e1.reply).unwrap();
        let (k2, _) = c2.complete(&e2.reply).unwrap();
        assert_ne!(k1.cipher, k2.cipher);
        assert_ne!(k1.mac, k2.mac);
    }

    #[test]
    fn unknown_suites_rejected() {
        let hello = HandshakeFrame::Hello {
            proto_version: HELLO_PROTO_VERSION,
            supported_cipher_suites: vec!["ROT13-HMACCRC32".into()],
            client_public_key: vec![0u8; 32],
        };
        assert!(matches!(
            respond_to_hello(&hello),
            Err(ChatError::KeyExchangeFailed(_))
        ));
    }

    #[test]
    fn wrong_protocol_version_rejected() {
        let hello = HandshakeFrame::Hello {
            proto_version: 9,
            supported_cipher_suites: vec![
                CipherSuite::X25519Aes256HmacSha256.wire_name().to_string()
            ],
            client_public_key: vec![0u8; 32],
        };
        assert!(respond_to_hello(&hello).is_err());
    }

    #[test]
    fn frame_bytes_roundtrip_with_version_byte() {
        let (_, hello) = ClientHandshake::initiate(CipherSuite::X25519Aes256HmacSha256).unwrap();
        let bytes = hello.to_frame_bytes().unwrap();
        assert_eq!(bytes[0], HANDSHAKE_VERSION);

        let parsed = HandshakeFrame::from_frame_bytes(&bytes).unwrap();
        match (hello, parsed) {
            (
                HandshakeFrame::Hello {
                    client_public_key: a,
                    ..
                },
                HandshakeFrame::Hello {
                    client_public_key: b,
                    ..
                },
            ) => assert_eq!(a, b),
            _ => panic!("wrong frame variant"),
        }
    }

    #[test]
    fn envelope_bytes_are_not_a_handshake_frame() {
        assert!(HandshakeFrame::from_frame_bytes(&[1, 2, 3]).is_err());
    }
}
