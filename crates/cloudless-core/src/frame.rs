//! Binary framing for the direct peer-to-peer path.
//!
//! A data channel carries two kinds of message, told apart by the first byte:
//!
//! ```text
//! chunk:   0x01 | id_len (1) | transfer_id | chunk_index (u32 BE) | nonce (24) | ciphertext
//! control: '{' ... UTF-8 JSON object ... '}'
//! ```
//!
//! All multi-byte fields are big-endian (network byte order).

use cloudless_crypto::aead::NONCE_SIZE;
use cloudless_crypto::{EncryptedPayload, Nonce};
use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Type byte of a chunk frame.
pub const CHUNK_FRAME_TYPE: u8 = 0x01;

/// First byte of every control message.
pub const CONTROL_FRAME_START: u8 = b'{';

/// Longest transfer id the one-byte length field can carry.
pub const MAX_TRANSFER_ID_LEN: usize = u8::MAX as usize;

/// Bytes before the transfer id.
const PREFIX_LEN: usize = 2;

/// Encrypted chunk sent over a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    /// Transfer this chunk belongs to
    pub transfer_id: String,
    /// Zero-based chunk index
    pub chunk_index: u32,
    /// Sealed chunk
    pub payload: EncryptedPayload,
}

impl ChunkFrame {
    /// Encoded length.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        PREFIX_LEN + self.transfer_id.len() + 4 + NONCE_SIZE + self.payload.ciphertext.len()
    }

    /// Encode to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::IdTooLong`] for ids over 255 bytes and
    /// [`FrameError::InvalidId`] for an empty id.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let id = self.transfer_id.as_bytes();
        if id.is_empty() {
            return Err(FrameError::InvalidId);
        }
        let id_len = u8::try_from(id.len()).map_err(|_| FrameError::IdTooLong(id.len()))?;

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(CHUNK_FRAME_TYPE);
        buf.push(id_len);
        buf.extend_from_slice(id);
        buf.extend_from_slice(&self.chunk_index.to_be_bytes());
        buf.extend_from_slice(self.payload.nonce.as_bytes());
        buf.extend_from_slice(&self.payload.ciphertext);
        Ok(buf)
    }

    /// Parse a chunk frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooShort`] if the header is cut off,
    /// [`FrameError::UnknownType`] for a wrong type byte and
    /// [`FrameError::InvalidId`] if the id is empty or not UTF-8.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < PREFIX_LEN {
            return Err(FrameError::TooShort {
                expected: PREFIX_LEN,
                actual: data.len(),
            });
        }
        if data[0] != CHUNK_FRAME_TYPE {
            return Err(FrameError::UnknownType(data[0]));
        }

        let id_len = data[1] as usize;
        if id_len == 0 {
            return Err(FrameError::InvalidId);
        }
        let header_len = PREFIX_LEN + id_len + 4 + NONCE_SIZE;
        if data.len() < header_len {
            return Err(FrameError::TooShort {
                expected: header_len,
                actual: data.len(),
            });
        }

        let id_end = PREFIX_LEN + id_len;
        let transfer_id = std::str::from_utf8(&data[PREFIX_LEN..id_end])
            .map_err(|_| FrameError::InvalidId)?
            .to_string();
        let chunk_index = u32::from_be_bytes([
            data[id_end],
            data[id_end + 1],
            data[id_end + 2],
            data[id_end + 3],
        ]);

        let nonce_start = id_end + 4;
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[nonce_start..nonce_start + NONCE_SIZE]);

        Ok(Self {
            transfer_id,
            chunk_index,
            payload: EncryptedPayload {
                ciphertext: data[header_len..].to_vec(),
                nonce: Nonce::from_bytes(nonce),
            },
        })
    }
}

/// JSON control message exchanged over a data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// A file is about to be streamed
    FileOffer {
        /// Transfer id used in the chunk frames
        transfer_id: String,
        /// Base64 encrypted filename
        encrypted_filename: String,
        /// Base64 nonce of the filename
        filename_nonce: String,
        /// Plaintext size in bytes
        file_size: u64,
        /// Number of chunk frames to expect
        total_chunks: u64,
    },
    /// Every chunk of a transfer has been sent
    FileComplete {
        /// Transfer id
        transfer_id: String,
    },
    /// The sender abandoned the transfer
    FileCancel {
        /// Transfer id
        transfer_id: String,
    },
}

impl ControlMessage {
    /// Transfer the message is about.
    #[must_use]
    pub fn transfer_id(&self) -> &str {
        match self {
            Self::FileOffer { transfer_id, .. }
            | Self::FileComplete { transfer_id }
            | Self::FileCancel { transfer_id } => transfer_id,
        }
    }
}

/// Any message on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Binary chunk frame
    Chunk(ChunkFrame),
    /// JSON control message
    Control(ControlMessage),
}

impl PeerMessage {
    /// Encode to wire bytes.
    ///
    /// # Errors
    ///
    /// See [`ChunkFrame::encode`]; control messages fail only if JSON
    /// encoding does.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Chunk(frame) => frame.encode(),
            Self::Control(msg) => {
                serde_json::to_vec(msg).map_err(|e| FrameError::InvalidControl(e.to_string()))
            }
        }
    }

    /// Decode wire bytes, dispatching on the first byte.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooShort`] for an empty message and
    /// [`FrameError::UnknownType`] if the first byte is neither `0x01` nor
    /// `{`.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        match data.first() {
            None => Err(FrameError::TooShort {
                expected: 1,
                actual: 0,
            }),
            Some(&CHUNK_FRAME_TYPE) => ChunkFrame::decode(data).map(Self::Chunk),
            Some(&CONTROL_FRAME_START) => serde_json::from_slice(data)
                .map(Self::Control)
                .map_err(|e| FrameError::InvalidControl(e.to_string())),
            Some(&other) => Err(FrameError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(id: &str, index: u32, ct: Vec<u8>) -> ChunkFrame {
        ChunkFrame {
            transfer_id: id.to_string(),
            chunk_index: index,
            payload: EncryptedPayload {
                ciphertext: ct,
                nonce: Nonce::from_bytes([7u8; NONCE_SIZE]),
            },
        }
    }

    #[test]
    fn test_chunk_layout() {
        let bytes = frame("abc", 0x0102_0304, vec![0xEE; 20]).encode().unwrap();
        assert_eq!(bytes[0], CHUNK_FRAME_TYPE);
        assert_eq!(bytes[1], 3);
        assert_eq!(&bytes[2..5], b"abc");
        assert_eq!(&bytes[5..9], &[1, 2, 3, 4]);
        assert_eq!(&bytes[9..33], &[7u8; NONCE_SIZE]);
        assert_eq!(&bytes[33..], &[0xEE; 20]);
        assert_eq!(bytes.len(), frame("abc", 0, vec![0; 20]).encoded_len());
    }

    #[test]
    fn test_id_length_limit() {
        let ok = "x".repeat(MAX_TRANSFER_ID_LEN);
        assert!(frame(&ok, 0, vec![]).encode().is_ok());

        let long = "x".repeat(MAX_TRANSFER_ID_LEN + 1);
        assert_eq!(
            frame(&long, 0, vec![]).encode(),
            Err(FrameError::IdTooLong(256))
        );
        assert_eq!(frame("", 0, vec![]).encode(), Err(FrameError::InvalidId));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = frame("transfer-1", 5, vec![1, 2, 3]).encode().unwrap();
        let cut = &bytes[..20];
        assert!(matches!(
            ChunkFrame::decode(cut),
            Err(FrameError::TooShort { actual: 20, .. })
        ));
    }

    #[test]
    fn test_first_byte_dispatch() {
        let control = PeerMessage::Control(ControlMessage::FileComplete {
            transfer_id: "t1".into(),
        });
        let encoded = control.encode().unwrap();
        assert_eq!(encoded[0], b'{');
        assert_eq!(PeerMessage::decode(&encoded).unwrap(), control);

        let chunk = PeerMessage::Chunk(frame("t1", 9, vec![4; 32]));
        assert_eq!(PeerMessage::decode(&chunk.encode().unwrap()).unwrap(), chunk);

        assert_eq!(
            PeerMessage::decode(&[0x02, 0, 0]),
            Err(FrameError::UnknownType(0x02))
        );
        assert!(matches!(
            PeerMessage::decode(&[]),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn test_control_wire_names() {
        let offer = ControlMessage::FileOffer {
            transfer_id: "t".into(),
            encrypted_filename: "Zg==".into(),
            filename_nonce: "bg==".into(),
            file_size: 10,
            total_chunks: 1,
        };
        let value: serde_json::Value =
            serde_json::from_slice(&PeerMessage::Control(offer.clone()).encode().unwrap()).unwrap();
        assert_eq!(value["type"], "file_offer");
        assert_eq!(offer.transfer_id(), "t");
    }

    proptest! {
        #[test]
        fn prop_chunk_frame_roundtrip(
            id in "[a-zA-Z0-9-]{1,64}",
            index in any::<u32>(),
            ct in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let original = frame(&id, index, ct);
            let decoded = ChunkFrame::decode(&original.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, original);
        }
    }
}
