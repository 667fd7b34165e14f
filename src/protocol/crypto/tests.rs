use super::*;

mod packet_cipher {
    use super::*;

    #[test]
    fn test_seal_open() {
        let cipher = PacketCipher::new(&[0x42; 32]).unwrap();
        let sealed = cipher.seal(1, b"header", b"body").unwrap();
        assert_eq!(sealed.len(), 4 + lengths::AEAD_TAG);
        assert_eq!(cipher.open(1, b"header", &sealed).unwrap(), b"body");
    }

    #[test]
    fn test_counter_binds_ciphertext() {
        let cipher = PacketCipher::new(&[0x42; 32]).unwrap();
        let sealed = cipher.seal(1, b"", b"secret").unwrap();
        assert!(matches!(
            cipher.open(2, b"", &sealed),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_aad_is_authenticated() {
        let cipher = PacketCipher::new(&[0x42; 32]).unwrap();
        let sealed = cipher.seal(7, b"aad1", b"data").unwrap();
        assert!(cipher.open(7, b"aad2", &sealed).is_err());
    }

    #[test]
    fn test_cipher_is_bound_to_its_key() {
        let sender = PacketCipher::new(&[0x42; 32]).unwrap();
        let other = PacketCipher::new(&[0x43; 32]).unwrap();
        let sealed = sender.seal(3, b"hdr", b"frame").unwrap();
        assert!(other.open(3, b"hdr", &sealed).is_err());
        let rekeyed = PacketCipher::new(&[0x42; 32]).unwrap();
        assert_eq!(rekeyed.open(3, b"hdr", &sealed).unwrap(), b"frame");
    }

    #[test]
    fn test_input_shorter_than_tag() {
        let cipher = PacketCipher::new(&[0; 32]).unwrap();
        assert!(matches!(
            cipher.open(0, b"", &[0u8; 8]),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_nonce_layout() {
        assert_eq!(
            counter_nonce(0x0102_0304_0506_0708),
            [0, 0, 0, 0, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }
}

mod key_exchange {
    use super::*;

    #[test]
    fn test_x25519_agreement() {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();
        let (alice_pk, bob_pk) = (alice.public_key(), bob.public_key());

        let ab = alice.agree(&bob_pk).unwrap();
        let ba = bob.agree(&alice_pk).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_x25519_rejects_low_order_point() {
        let zero = X25519PublicKey::from_bytes(&[0u8; 32]).unwrap();
        assert!(matches!(
            EphemeralKeyPair::generate().agree(&zero),
            Err(CryptoError::WeakSharedSecret)
        ));
        assert!(X25519PublicKey::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let pair = Ed25519KeyPair::generate();
        let sig = pair.sign(b"message");
        let public = Ed25519PublicKey::from_bytes(pair.public_key().as_bytes()).unwrap();
        assert!(public.verify(b"message", &sig).is_ok());
        assert!(matches!(
            public.verify(b"tampered", &sig),
            Err(CryptoError::InvalidSignature)
        ));

        let restored = Ed25519Signature::from_bytes(&sig.to_bytes()).unwrap();
        assert!(public.verify(b"message", &restored).is_ok());
        assert!(Ed25519Signature::from_bytes(&[0u8; 63]).is_err());
    }

    #[test]
    fn test_ed25519_seed_is_deterministic() {
        let a = Ed25519KeyPair::from_seed(&[9u8; 32]);
        let b = Ed25519KeyPair::from_seed(&[9u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), Ed25519KeyPair::from_seed(&[8u8; 32]).public_key());
    }
}

mod derivation {
    use super::*;

    #[test]
    fn test_signature_cipher_skip_matches_continuation() {
        let data = [0x5Au8; 128];
        let whole = SignatureCipher::new(&[1u8; 32]).apply(&data);

        let mut skipped = SignatureCipher::new(&[1u8; 32]);
        skipped.skip(64);
        assert_eq!(skipped.apply(&data[64..]), whole[64..]);

        let mut continued = SignatureCipher::new(&[1u8; 32]);
        let _ = continued.apply(&data[..64]);
        assert_eq!(continued.apply(&data[64..]), whole[64..]);
    }

    #[test]
    fn test_signature_cipher_depends_on_secret() {
        let data = [0u8; 64];
        assert_ne!(
            SignatureCipher::new(&[1u8; 32]).apply(&data),
            SignatureCipher::new(&[2u8; 32]).apply(&data)
        );
        assert_ne!(hash_truncated(b"a", &[1u8; 32]), hash_truncated(b"b", &[1u8; 32]));
    }

    #[test]
    fn test_hkdf_info_and_salt_separate_keys() {
        let a = derive_key(b"salt", b"ikm", b"video").unwrap();
        let b = derive_key(b"salt", b"ikm", b"audio").unwrap();
        let c = derive_key(b"salt2", b"ikm", b"video").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, derive_key(b"salt", b"ikm", b"video").unwrap());
    }
}
