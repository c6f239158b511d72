//! Wire codec: binary serialization and sealing of frames.
//!
//! Every frame is MessagePack (`rmp-serde`): enums are written as a variant
//! tag followed by the variant's fields, structs as positional arrays.
//! Relay frames are additionally sealed with the session key before being
//! wrapped in [`Envelope::Relay`].

use ib_crypto::{aead, CryptoError, SymmetricKey};
use serde::{de::DeserializeOwned, Serialize};

use crate::{envelope::Envelope, message::WebFrame};

const RELAY_AAD: &[u8] = b"ib-relay-v1";

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    encode(envelope)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    decode(bytes)
}

/// Serialize and encrypt a relay frame into its envelope.
pub fn seal_frame(key: &SymmetricKey, frame: &WebFrame) -> Result<Envelope, CodecError> {
    let plaintext = encode(frame)?;
    let ciphertext = aead::encrypt(key, &plaintext, RELAY_AAD)?;
    Ok(Envelope::Relay { ciphertext })
}

/// Decrypt and parse a relay payload. Decryption and parse failures are
/// reported as different variants so the caller can log them apart.
pub fn open_frame(key: &SymmetricKey, ciphertext: &[u8]) -> Result<WebFrame, CodecError> {
    let plaintext = aead::decrypt(key, ciphertext, RELAY_AAD).map_err(|_| CodecError::Decrypt)?;
    decode(&plaintext)
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Encoding error: {0}")]
    Encode(String),
    #[error("Decoding error: {0}")]
    Decode(String),
    #[error("Relay frame failed authentication")]
    Decrypt,
    #[error("Unexpected handshake message: expected {expected}, got {actual}")]
    WrongMessageType {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PingPong, UploadNotice};

    #[test]
    fn sealed_frame_opens_with_same_key() {
        let key = SymmetricKey::from_bytes([4u8; 32]);
        let frame = WebFrame::UploadAttachmentNotice(UploadNotice {
            local_id: "l-1".into(),
            discussion_id: 9,
            content_hash: "ab".into(),
            size: 1000,
            chunk_count: 4,
            mime_type: "image/png".into(),
            file_name: "a.png".into(),
        });
        let Envelope::Relay { ciphertext } = seal_frame(&key, &frame).unwrap() else {
            panic!("expected relay envelope");
        };
        assert_eq!(open_frame(&key, &ciphertext).unwrap(), frame);
    }

    #[test]
    fn wrong_key_is_a_decrypt_error_not_a_parse_error() {
        let key = SymmetricKey::from_bytes([4u8; 32]);
        let other = SymmetricKey::from_bytes([5u8; 32]);
        let Envelope::Relay { ciphertext } =
            seal_frame(&key, &WebFrame::Ping(PingPong { ping: true, pong: false })).unwrap()
        else {
            panic!("expected relay envelope");
        };
        assert!(matches!(open_frame(&other, &ciphertext), Err(CodecError::Decrypt)));
    }

    #[test]
    fn garbage_envelope_is_a_decode_error() {
        assert!(matches!(
            decode_envelope(&[0xc1, 0xff, 0x00]),
            Err(CodecError::Decode(_))
        ));
    }
}
