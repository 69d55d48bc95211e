//! Wire schema: envelopes, payloads, pairing messages, constants

pub mod constants;
mod envelope;
mod pairing;

pub use envelope::{
    ClipboardPayload, ContentMetadata, ContentType, EncryptionInfo, EnvelopeType,
    RelayControlMessage, SyncEnvelope, SyncPayload,
};
pub use pairing::{
    AckBody, ChallengeBody, PairingAck, PairingChallenge, PairingMessage, PairingPayload,
    PAIRING_PAYLOAD_VERSION,
};
