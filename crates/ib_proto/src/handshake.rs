//! Handshake frames carried in `Envelope::Connection`.

use ib_crypto::establishment::{
    AppEstablishment, BrowserEstablishment, FirstMessage, SecondMessage, ThirdMessage,
};
use serde::{Deserialize, Serialize};

use crate::codec::{decode, encode, CodecError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    First(FirstMessage),
    Second(SecondMessage),
    Third(ThirdMessage),
}

impl HandshakeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeMessage::First(_) => "first",
            HandshakeMessage::Second(_) => "second",
            HandshakeMessage::Third(_) => "third",
        }
    }
}

/// App side, step 2: build the encoded first message.
pub fn prepare_first_message(
    session: &mut AppEstablishment,
    peer_public_key: &[u8],
    connection_identifier: &str,
) -> Result<Vec<u8>, CodecError> {
    let first = session.prepare_first_message(peer_public_key, connection_identifier)?;
    encode(&HandshakeMessage::First(first))
}

/// App side, step 3: parse, check the type, then hand to the session.
/// Nothing is stored on the session unless every check passes.
pub fn handle_second_message(session: &mut AppEstablishment, bytes: &[u8]) -> Result<(), CodecError> {
    match decode::<HandshakeMessage>(bytes)? {
        HandshakeMessage::Second(second) => Ok(session.handle_second_message(&second)?),
        other => Err(CodecError::WrongMessageType {
            expected: "second",
            actual: other.kind(),
        }),
    }
}

/// App side, step 4.
pub fn prepare_third_message(session: &mut AppEstablishment) -> Result<Vec<u8>, CodecError> {
    let third = session.prepare_third_message()?;
    encode(&HandshakeMessage::Third(third))
}

/// Browser side: answer an encoded first message with an encoded second one.
pub fn answer_first_message(
    session: &mut BrowserEstablishment,
    bytes: &[u8],
) -> Result<Vec<u8>, CodecError> {
    match decode::<HandshakeMessage>(bytes)? {
        HandshakeMessage::First(first) => {
            let second = session.handle_first_message(first)?;
            encode(&HandshakeMessage::Second(second))
        }
        other => Err(CodecError::WrongMessageType {
            expected: "first",
            actual: other.kind(),
        }),
    }
}

/// Browser side: verify the decommitment in an encoded third message.
pub fn accept_third_message(session: &mut BrowserEstablishment, bytes: &[u8]) -> Result<(), CodecError> {
    match decode::<HandshakeMessage>(bytes)? {
        HandshakeMessage::Third(third) => Ok(session.handle_third_message(&third)?),
        other => Err(CodecError::WrongMessageType {
            expected: "third",
            actual: other.kind(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_handshake_reaches_matching_sas() {
        let mut browser = BrowserEstablishment::new();
        let mut app = AppEstablishment::new();
        let first = prepare_first_message(&mut app, &browser.public_key(), "conn-7").unwrap();
        let second = answer_first_message(&mut browser, &first).unwrap();
        handle_second_message(&mut app, &second).unwrap();
        let third = prepare_third_message(&mut app).unwrap();
        accept_third_message(&mut browser, &third).unwrap();
        assert_eq!(app.compute_sas_code().unwrap(), browser.compute_sas_code().unwrap());
    }

    #[test]
    fn wrong_type_is_rejected_without_progress() {
        let browser = BrowserEstablishment::new();
        let mut app = AppEstablishment::new();
        let first = prepare_first_message(&mut app, &browser.public_key(), "conn").unwrap();
        // Echo our own first message back instead of a second one.
        let err = handle_second_message(&mut app, &first).unwrap_err();
        assert!(matches!(
            err,
            CodecError::WrongMessageType { expected: "second", actual: "first" }
        ));
        assert!(app.compute_sas_code().is_err());
    }

    #[test]
    fn unparseable_second_message_is_a_decode_error() {
        let browser = BrowserEstablishment::new();
        let mut app = AppEstablishment::new();
        prepare_first_message(&mut app, &browser.public_key(), "conn").unwrap();
        assert!(matches!(
            handle_second_message(&mut app, b"not msgpack \xc1"),
            Err(CodecError::Decode(_))
        ));
    }
}
