//! Legacy AirPlay pairing (pair-setup / pair-verify), receiver side
//!
//! Pair-verify is a signed X25519 exchange: each side signs both
//! ephemeral public keys with its long-term Ed25519 key and sends the
//! signature encrypted under AES-128-CTR keyed from the shared secret.

use std::sync::Arc;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::protocol::crypto::{
    CryptoError, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature, EphemeralKeyPair,
    SharedSecret, SignatureCipher, X25519PublicKey, lengths,
};

/// Length of both pair-verify requests: 4-byte flag header plus 64 bytes
pub const VERIFY_MESSAGE_LEN: usize = 68;

/// Flag byte opening the first pair-verify request
const VERIFY_START: u8 = 0x01;
/// Flag byte opening the second pair-verify request
const VERIFY_FINISH: u8 = 0x00;

/// Pairing failures; all of them end the session
#[derive(Debug, Error)]
pub enum PairingError {
    /// Request body has the wrong size
    #[error("malformed pairing message: expected {expected} bytes, got {actual}")]
    MalformedMessage {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Flag header does not match the expected step
    #[error("unexpected pairing message flag 0x{0:02x}")]
    UnexpectedMessage(u8),

    /// Message arrived out of order
    #[error("pairing message out of sequence")]
    InvalidState,

    /// Verify key differs from the one presented at pair-setup
    #[error("sender key changed between pair-setup and pair-verify")]
    KeyMismatch,

    /// Sender's signature did not verify
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// Underlying primitive failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Output of a successful pair-verify
pub struct PairingResult {
    /// X25519 shared secret, wiped on drop
    pub shared_secret: Zeroizing<[u8; 32]>,
    /// Sender's long-term Ed25519 public key
    pub sender_public_key: [u8; 32],
}

impl std::fmt::Debug for PairingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingResult")
            .field("shared_secret", &"<redacted>")
            .field("sender_public_key", &crate::discovery::txt::to_hex(&self.sender_public_key))
            .finish()
    }
}

/// Result of one pair-verify request
#[derive(Debug)]
pub enum VerifyStep {
    /// Send this body and wait for the finishing request
    Reply(Vec<u8>),
    /// Pairing is done; answer with an empty body
    Complete(PairingResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Idle,
    AwaitingFinish,
    Complete,
    Failed,
}

struct PendingVerify {
    sender_x25519: [u8; 32],
    receiver_x25519: [u8; 32],
    sender_ed25519: Ed25519PublicKey,
    secret: SharedSecret,
}

/// Receiver side of legacy pairing for one session
pub struct LegacyPairingServer {
    identity: Arc<Ed25519KeyPair>,
    setup_public_key: Option<[u8; 32]>,
    pending: Option<PendingVerify>,
    step: Step,
}

impl LegacyPairingServer {
    /// Create a pairing server around the receiver's long-term key
    #[must_use]
    pub fn new(identity: Arc<Ed25519KeyPair>) -> Self {
        Self {
            identity,
            setup_public_key: None,
            pending: None,
            step: Step::Idle,
        }
    }

    /// Whether pair-verify finished successfully
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.step == Step::Complete
    }

    /// Handle `POST /pair-setup`: record the sender key, return ours
    ///
    /// # Errors
    ///
    /// Returns `PairingError` for a malformed key or a call out of order.
    pub fn handle_setup(&mut self, body: &[u8]) -> Result<Vec<u8>, PairingError> {
        if self.step != Step::Idle {
            return Err(self.fail(PairingError::InvalidState));
        }
        if body.len() != lengths::ED25519_PUBLIC_KEY {
            return Err(self.fail(PairingError::MalformedMessage {
                expected: lengths::ED25519_PUBLIC_KEY,
                actual: body.len(),
            }));
        }
        if let Err(e) = Ed25519PublicKey::from_bytes(body) {
            return Err(self.fail(e.into()));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(body);
        self.setup_public_key = Some(key);

        Ok(self.identity.public_key().as_bytes().to_vec())
    }

    /// Handle `POST /pair-verify`
    ///
    /// # Errors
    ///
    /// Returns `PairingError` on any malformed message, ordering problem or
    /// signature failure. The server is unusable afterwards.
    pub fn handle_verify(&mut self, body: &[u8]) -> Result<VerifyStep, PairingError> {
        let result = match (self.step, body.first().copied()) {
            (_, _) if body.len() != VERIFY_MESSAGE_LEN => Err(PairingError::MalformedMessage {
                expected: VERIFY_MESSAGE_LEN,
                actual: body.len(),
            }),
            (_, Some(flag)) if body[1..4] != [0, 0, 0] => Err(PairingError::UnexpectedMessage(flag)),
            (Step::Idle, Some(VERIFY_START)) => self.verify_start(&body[4..]).map(VerifyStep::Reply),
            (Step::AwaitingFinish, Some(VERIFY_FINISH)) => {
                self.verify_finish(&body[4..]).map(VerifyStep::Complete)
            }
            (Step::Idle | Step::AwaitingFinish, Some(flag)) => {
                Err(PairingError::UnexpectedMessage(flag))
            }
            _ => Err(PairingError::InvalidState),
        };
        result.map_err(|e| self.fail(e))
    }

    fn verify_start(&mut self, keys: &[u8]) -> Result<Vec<u8>, PairingError> {
        let (sender_x, sender_ed) = keys.split_at(lengths::X25519_PUBLIC_KEY);

        if let Some(expected) = self.setup_public_key {
            if expected.as_slice() != sender_ed {
                return Err(PairingError::KeyMismatch);
            }
        }
        let sender_ed25519 = Ed25519PublicKey::from_bytes(sender_ed)?;
        let sender_public = X25519PublicKey::from_bytes(sender_x)?;

        let ephemeral = EphemeralKeyPair::generate();
        let receiver_x25519 = *ephemeral.public_key().as_bytes();
        let secret = ephemeral.agree(&sender_public)?;

        let mut signed = Vec::with_capacity(64);
        signed.extend_from_slice(&receiver_x25519);
        signed.extend_from_slice(sender_x);
        let signature = self.identity.sign(&signed).to_bytes();

        let encrypted = SignatureCipher::new(secret.as_bytes()).apply(&signature);

        let mut reply = Vec::with_capacity(32 + encrypted.len());
        reply.extend_from_slice(&receiver_x25519);
        reply.extend_from_slice(&encrypted);

        self.pending = Some(PendingVerify {
            sender_x25519: *sender_public.as_bytes(),
            receiver_x25519,
            sender_ed25519,
            secret,
        });
        self.step = Step::AwaitingFinish;
        Ok(reply)
    }

    fn verify_finish(&mut self, encrypted: &[u8]) -> Result<PairingResult, PairingError> {
        let pending = self.pending.take().ok_or(PairingError::InvalidState)?;

        // The sender's keystream continues after our 64-byte signature
        let mut cipher = SignatureCipher::new(pending.secret.as_bytes());
        cipher.skip(lengths::ED25519_SIGNATURE as u64);
        let signature = Ed25519Signature::from_bytes(&cipher.apply(encrypted))?;

        let mut signed = Vec::with_capacity(64);
        signed.extend_from_slice(&pending.sender_x25519);
        signed.extend_from_slice(&pending.receiver_x25519);
        pending
            .sender_ed25519
            .verify(&signed, &signature)
            .map_err(|_| PairingError::SignatureVerificationFailed)?;

        self.step = Step::Complete;
        Ok(PairingResult {
            shared_secret: Zeroizing::new(*pending.secret.as_bytes()),
            sender_public_key: *pending.sender_ed25519.as_bytes(),
        })
    }

    fn fail(&mut self, error: PairingError) -> PairingError {
        self.step = Step::Failed;
        self.pending = None;
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SenderPairing;

    fn server() -> LegacyPairingServer {
        LegacyPairingServer::new(Arc::new(Ed25519KeyPair::generate()))
    }

    #[test]
    fn test_full_exchange_agrees_on_secret() {
        let mut server = server();
        let mut sender = SenderPairing::new();

        let receiver_pk = server.handle_setup(&sender.public_key()).unwrap();
        let VerifyStep::Reply(reply) = server.handle_verify(&sender.verify_start()).unwrap() else {
            panic!("expected reply");
        };
        let finish = sender.verify_finish(&reply, &receiver_pk).unwrap();
        let VerifyStep::Complete(result) = server.handle_verify(&finish).unwrap() else {
            panic!("expected completion");
        };

        assert!(server.is_complete());
        assert_eq!(*result.shared_secret, sender.shared_secret().unwrap());
        assert_eq!(result.sender_public_key, sender.public_key());
    }

    #[test]
    fn test_pair_setup_is_optional() {
        let mut server = server();
        let mut sender = SenderPairing::new();
        let receiver_pk = server.identity.public_key().as_bytes().to_vec();

        let VerifyStep::Reply(reply) = server.handle_verify(&sender.verify_start()).unwrap() else {
            panic!("expected reply");
        };
        let finish = sender.verify_finish(&reply, &receiver_pk).unwrap();
        assert!(matches!(server.handle_verify(&finish), Ok(VerifyStep::Complete(_))));
    }

    #[test]
    fn test_each_session_gets_a_fresh_secret() {
        let identity = Arc::new(Ed25519KeyPair::generate());
        let sender = SenderPairing::new();
        let start = sender.verify_start();

        let mut first = LegacyPairingServer::new(identity.clone());
        let mut second = LegacyPairingServer::new(identity);
        let (Ok(VerifyStep::Reply(a)), Ok(VerifyStep::Reply(b))) =
            (first.handle_verify(&start), second.handle_verify(&start))
        else {
            panic!("expected replies");
        };
        // replayed sender input still yields a different receiver key
        assert_ne!(a[..32], b[..32]);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let mut server = server();
        let mut sender = SenderPairing::new();
        let receiver_pk = server.identity.public_key().as_bytes().to_vec();

        let VerifyStep::Reply(reply) = server.handle_verify(&sender.verify_start()).unwrap() else {
            panic!("expected reply");
        };
        let mut finish = sender.verify_finish(&reply, &receiver_pk).unwrap();
        finish[40] ^= 0x01;

        assert!(matches!(
            server.handle_verify(&finish),
            Err(PairingError::SignatureVerificationFailed | PairingError::Crypto(_))
        ));
        assert!(!server.is_complete());
        // nothing retained: a retry on the same server fails
        assert!(matches!(
            server.handle_verify(&sender.verify_start()),
            Err(PairingError::InvalidState)
        ));
    }

    #[test]
    fn test_key_mismatch_with_pair_setup() {
        let mut server = server();
        let other = SenderPairing::new();
        let sender = SenderPairing::new();

        server.handle_setup(&other.public_key()).unwrap();
        assert!(matches!(
            server.handle_verify(&sender.verify_start()),
            Err(PairingError::KeyMismatch)
        ));
    }

    #[test]
    fn test_finish_before_start_rejected() {
        let mut server = server();
        let mut body = vec![0u8; VERIFY_MESSAGE_LEN];
        body[0] = VERIFY_FINISH;
        assert!(matches!(
            server.handle_verify(&body),
            Err(PairingError::UnexpectedMessage(0))
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let mut server = server();
        assert!(matches!(
            server.handle_verify(&[1, 0, 0, 0]),
            Err(PairingError::MalformedMessage { expected: 68, actual: 4 })
        ));
        let mut server = self::server();
        assert!(matches!(
            server.handle_setup(&[0u8; 31]),
            Err(PairingError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn test_low_order_point_rejected() {
        let mut server = server();
        let sender = SenderPairing::new();
        let mut body = sender.verify_start();
        // all-zero X25519 key is a low-order point
        body[4..36].fill(0);
        assert!(matches!(
            server.handle_verify(&body),
            Err(PairingError::Crypto(CryptoError::WeakSharedSecret))
        ));
    }
}
