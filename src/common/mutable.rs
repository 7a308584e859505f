//! Helper functions and structs for mutable items.

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha1_smol::Sha1;

use crate::Id;

/// Maximum size of a mutable item's `salt` field.
pub const MAX_SALT_SIZE: usize = 64;

#[derive(Clone, Debug, PartialEq)]
/// [BEP_0044](https://www.bittorrent.org/beps/bep_0044.html)'s mutable item.
pub struct MutableItem {
    /// hash of the key and optional salt
    target: Id,
    /// ed25519 public key
    key: [u8; 32],
    /// sequence number
    seq: i64,
    /// mutable value
    value: Bytes,
    /// ed25519 signature
    signature: [u8; 64],
    /// Optional salt
    salt: Option<Bytes>,
    /// Optional compare-and-swap seq
    cas: Option<i64>,
}

impl MutableItem {
    /// Create a new mutable item from a signing key, value, sequence number and optional salt.
    pub fn new(signer: SigningKey, value: Bytes, seq: i64, salt: Option<Bytes>) -> Self {
        let signable = encode_signable(seq, &value, &salt);
        let signature = signer.sign(&signable);

        Self::new_signed_unchecked(
            signer.verifying_key().to_bytes(),
            signature.into(),
            value,
            seq,
            salt,
        )
    }

    /// Return the target of a [MutableItem] by hashing its `public_key` and an optional `salt`
    pub fn target_from_key(public_key: &[u8; 32], salt: &Option<Bytes>) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(public_key);

        if let Some(salt) = salt {
            hasher.update(salt);
        }

        Id(hasher.digest().bytes())
    }

    /// Set the cas number if needed.
    pub fn with_cas(mut self, cas: i64) -> Self {
        self.cas = Some(cas);
        self
    }

    /// Create a new mutable item from an already signed value.
    pub fn new_signed_unchecked(
        key: [u8; 32],
        signature: [u8; 64],
        value: Bytes,
        seq: i64,
        salt: Option<Bytes>,
    ) -> Self {
        Self {
            target: MutableItem::target_from_key(&key, &salt),
            key,
            value,
            seq,
            signature,
            salt,
            cas: None,
        }
    }

    /// Create a mutable item from fields received over the wire, verifying
    /// the signature against the signable encoding of `{seq, v, salt?}`.
    pub(crate) fn from_dht_message(
        target: &Id,
        key: &[u8],
        v: Bytes,
        seq: i64,
        signature: &[u8],
        salt: Option<Bytes>,
        cas: Option<i64>,
    ) -> Result<Self, MutableError> {
        let key = VerifyingKey::try_from(key).map_err(|_| MutableError::InvalidPublicKey)?;

        let signature =
            Signature::from_slice(signature).map_err(|_| MutableError::InvalidSignature)?;

        key.verify(&encode_signable(seq, &v, &salt), &signature)
            .map_err(|_| MutableError::InvalidSignature)?;

        if MutableItem::target_from_key(&key.to_bytes(), &salt) != *target {
            return Err(MutableError::TargetMismatch);
        }

        Ok(Self {
            target: *target,
            key: key.to_bytes(),
            value: v,
            seq,
            signature: signature.to_bytes(),
            salt,
            cas,
        })
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn seq(&self) -> i64 {
        self.seq
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.signature
    }

    pub fn salt(&self) -> &Option<Bytes> {
        &self.salt
    }

    pub fn cas(&self) -> Option<i64> {
        self.cas
    }
}

/// The portion of a mutable message covered by its signature.
///
/// This is the bencode of the ordered keys `salt` (if any), `seq` and `v`
/// without the enclosing dictionary delimiters.
pub fn encode_signable(seq: i64, value: &Bytes, salt: &Option<Bytes>) -> Bytes {
    let mut signable = vec![];

    if let Some(salt) = salt {
        signable.extend(format!("4:salt{}:", salt.len()).into_bytes());
        signable.extend(salt);
    }

    signable.extend(format!("3:seqi{}e1:v{}:", seq, value.len()).into_bytes());
    signable.extend(value);

    signable.into()
}

#[derive(thiserror::Error, Debug)]
pub enum MutableError {
    #[error("Invalid mutable item public key")]
    InvalidPublicKey,

    #[error("Invalid mutable item signature")]
    InvalidSignature,

    #[error("The key and salt do not hash to the target")]
    TargetMismatch,
}
