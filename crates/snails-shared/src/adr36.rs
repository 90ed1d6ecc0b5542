//! ADR-36 arbitrary-message signatures.
//!
//! Cosmos wallets sign off-chain data by wrapping it in a fixed amino sign
//! document (`sign/MsgSignData`, empty chain id, zero fee and sequence) and
//! producing a secp256k1 ECDSA signature over its SHA-256 digest. The signer
//! address is `bech32(prefix, ripemd160(sha256(compressed_pubkey)))`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bech32::{Bech32, Hrp};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::SignatureError;
use crate::permit::{PubKey, StdSignature, PUBKEY_TYPE_SECP256K1};

/// Canonical (sorted-key, whitespace-free) amino sign document.
pub fn sign_doc_bytes(signer: &str, data: &[u8]) -> Vec<u8> {
    let data_b64 = BASE64.encode(data);
    // Key order comes from the literal, serde_json only escapes the values.
    let data_json = serde_json::Value::String(data_b64).to_string();
    let signer_json = serde_json::Value::String(signer.to_string()).to_string();
    format!(
        concat!(
            r#"{{"account_number":"0","chain_id":"","fee":{{"amount":[],"gas":"0"}},"memo":"","#,
            r#""msgs":[{{"type":"sign/MsgSignData","value":{{"data":{},"signer":{}}}}}],"sequence":"0"}}"#
        ),
        data_json, signer_json
    )
    .into_bytes()
}

/// Derive the bech32 account address for a compressed secp256k1 key.
pub fn pubkey_to_address(pubkey: &[u8], prefix: &str) -> Result<String, SignatureError> {
    if pubkey.len() != 33 {
        return Err(SignatureError::InvalidPubKey);
    }
    let sha = Sha256::digest(pubkey);
    let ripe = Ripemd160::digest(sha);
    let hrp = Hrp::parse(prefix).map_err(|e| SignatureError::Bech32(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, ripe.as_slice()).map_err(|e| SignatureError::Bech32(e.to_string()))
}

/// Split an address into its human-readable prefix.
pub fn address_prefix(address: &str) -> Result<String, SignatureError> {
    let (hrp, _) = bech32::decode(address).map_err(|e| SignatureError::Bech32(e.to_string()))?;
    Ok(hrp.as_str().to_string())
}

/// Verify an ADR-36 signature of `data` by `address`.
///
/// Checks both that the public key hashes to the claimed address and that
/// the signature covers the amino sign document.
pub fn verify_adr36(address: &str, data: &[u8], sig: &StdSignature) -> Result<(), SignatureError> {
    if sig.pub_key.key_type != PUBKEY_TYPE_SECP256K1 {
        return Err(SignatureError::InvalidPubKey);
    }

    let pubkey = BASE64.decode(&sig.pub_key.value)?;
    let prefix = address_prefix(address)?;
    let derived = pubkey_to_address(&pubkey, &prefix)?;
    if derived != address {
        return Err(SignatureError::AddressMismatch(address.to_string()));
    }

    let verifying_key =
        VerifyingKey::from_sec1_bytes(&pubkey).map_err(|_| SignatureError::InvalidPubKey)?;
    let sig_bytes = BASE64.decode(&sig.signature)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| SignatureError::InvalidSignature)?;

    verifying_key
        .verify(&sign_doc_bytes(address, data), &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Produce an ADR-36 signature the way a browser wallet would.
pub fn sign_adr36(signing_key: &SigningKey, signer: &str, data: &[u8]) -> StdSignature {
    let signature: Signature = signing_key.sign(&sign_doc_bytes(signer, data));
    let pubkey = signing_key.verifying_key().to_sec1_bytes();

    StdSignature {
        pub_key: PubKey {
            key_type: PUBKEY_TYPE_SECP256K1.to_string(),
            value: BASE64.encode(pubkey),
        },
        signature: BASE64.encode(signature.to_bytes()),
    }
}

/// Address of a signing key under the given prefix.
pub fn signing_key_address(signing_key: &SigningKey, prefix: &str) -> Result<String, SignatureError> {
    pubkey_to_address(&signing_key.verifying_key().to_sec1_bytes(), prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn sign_doc_is_canonical() {
        let doc = String::from_utf8(sign_doc_bytes("stars1abc", b"hi")).unwrap();
        assert_eq!(
            doc,
            r#"{"account_number":"0","chain_id":"","fee":{"amount":[],"gas":"0"},"memo":"","msgs":[{"type":"sign/MsgSignData","value":{"data":"aGk=","signer":"stars1abc"}}],"sequence":"0"}"#
        );
    }

    #[test]
    fn sign_then_verify() {
        let key = SigningKey::random(&mut OsRng);
        let address = signing_key_address(&key, "stars").unwrap();
        assert!(address.starts_with("stars1"));

        let sig = sign_adr36(&key, &address, b"login");
        verify_adr36(&address, b"login", &sig).unwrap();
    }

    #[test]
    fn tampered_data_fails() {
        let key = SigningKey::random(&mut OsRng);
        let address = signing_key_address(&key, "stars").unwrap();
        let sig = sign_adr36(&key, &address, b"login");

        let err = verify_adr36(&address, b"logout", &sig).unwrap_err();
        assert!(matches!(err, SignatureError::VerificationFailed));
    }

    #[test]
    fn foreign_key_fails_address_check() {
        let key = SigningKey::random(&mut OsRng);
        let other = SigningKey::random(&mut OsRng);
        let address = signing_key_address(&key, "stars").unwrap();
        let sig = sign_adr36(&other, &address, b"login");

        let err = verify_adr36(&address, b"login", &sig).unwrap_err();
        assert!(matches!(err, SignatureError::AddressMismatch(_)));
    }

    #[test]
    fn garbage_address_rejected() {
        let key = SigningKey::random(&mut OsRng);
        let sig = sign_adr36(&key, "nope", b"x");
        assert!(matches!(
            verify_adr36("nope", b"x", &sig),
            Err(SignatureError::Bech32(_))
        ));
    }
}
