//! Relay service boundary.
//!
//! The relay stores rooms, memberships and encrypted transfer chunks. It is
//! reached through [`RoomApi`] and [`TransferApi`]; [`crate::http::HttpApi`]
//! is the production implementation and the integration tests use an
//! in-memory one.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use cloudless_crypto::{CryptoError, PublicKey, encoding};
use cloudless_files::{TransferMode, TransferStatus};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ApiError;

/// Authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// User id
    pub id: String,
    /// Login name
    pub username: String,
    /// Display name
    pub display_name: String,
}

/// One room member as listed by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// User id
    pub user_id: String,
    /// Login name
    #[serde(default)]
    pub username: String,
    /// Display name
    #[serde(default)]
    pub display_name: String,
    /// Base64 X25519 public key registered for this room
    pub public_key: String,
    /// Whether the member has a live realtime link
    #[serde(default)]
    pub is_online: bool,
}

impl MemberInfo {
    /// Decode the registered public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidEncoding`] or
    /// [`CryptoError::InvalidKeyLength`] for a malformed key.
    pub fn public_key(&self) -> Result<PublicKey, CryptoError> {
        encoding::decode_public_key(&self.public_key)
    }

    /// Name to show for this member.
    #[must_use]
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.username
        } else {
            &self.display_name
        }
    }
}

/// Room with its member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    /// Room id
    pub id: String,
    /// Join code
    pub code: String,
    /// Optional room name
    #[serde(default)]
    pub name: Option<String>,
    /// Room kind reported by the relay
    #[serde(default)]
    pub room_type: String,
    /// Whether relay transfers are allowed
    #[serde(default = "default_true")]
    pub allow_relay: bool,
    /// Creation time
    #[serde(default, deserialize_with = "lenient_time")]
    pub created_at: Option<DateTime<Utc>>,
    /// Expiry time
    #[serde(default, deserialize_with = "lenient_time")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Current members
    #[serde(default)]
    pub members: Vec<MemberInfo>,
}

impl RoomInfo {
    /// Look up one member.
    #[must_use]
    pub fn member(&self, user_id: &str) -> Option<&MemberInfo> {
        self.members.iter().find(|m| m.user_id == user_id)
    }
}

fn default_true() -> bool {
    true
}

/// `POST /rooms` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    /// Optional room name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Base64 public key of the creator
    pub public_key: String,
}

/// `POST /rooms/join` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoomRequest {
    /// Room code
    pub code: String,
    /// Base64 public key of the joiner
    pub public_key: String,
}

/// `POST /transfers` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitTransferRequest {
    /// Room id
    pub room_id: String,
    /// Base64 encrypted filename
    pub encrypted_filename: String,
    /// Base64 `nonce || ciphertext` of the MIME type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_mimetype: Option<String>,
    /// Plaintext size, must be positive
    pub file_size: u64,
    /// Base64 nonce of the filename
    pub nonce: String,
    /// Transfer path
    pub mode: TransferMode,
}

/// Transfer record held by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    /// Transfer id
    pub id: String,
    /// Room id
    pub room_id: String,
    /// Sender user id
    pub sender_id: String,
    /// Sender display name
    #[serde(default)]
    pub sender_name: String,
    /// Base64 encrypted filename
    pub encrypted_filename: String,
    /// Base64 `nonce || ciphertext` of the MIME type
    #[serde(default)]
    pub encrypted_mimetype: Option<String>,
    /// Plaintext size
    pub file_size: u64,
    /// Transfer path
    #[serde(default)]
    pub mode: TransferMode,
    /// Current status
    pub status: TransferStatus,
    /// Base64 nonce of the filename
    pub nonce: String,
    /// Declared chunk count
    pub total_chunks: u64,
    /// Chunks stored so far
    #[serde(default)]
    pub uploaded_chunks: u64,
    /// Creation time
    #[serde(default, deserialize_with = "lenient_time")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Reply to a chunk upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkUploadAck {
    /// Transfer id
    pub transfer_id: String,
    /// Index just stored
    pub chunk_index: u64,
    /// Chunks stored so far
    pub uploaded_chunks: u64,
    /// Declared chunk count
    pub total_chunks: u64,
    /// Status after this chunk
    pub status: TransferStatus,
}

/// Body of a transfer download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedBlob {
    /// Concatenated stored chunks
    pub bytes: Vec<u8>,
    /// `X-Transfer-Nonce` header, if sent
    pub nonce: Option<String>,
}

/// Room endpoints.
#[async_trait]
pub trait RoomApi: Send + Sync {
    /// `GET /auth/me`
    async fn current_user(&self) -> Result<UserInfo, ApiError>;

    /// `POST /rooms`
    async fn create_room(&self, request: &CreateRoomRequest) -> Result<RoomInfo, ApiError>;

    /// `POST /rooms/join`. Also re-registers the key of an existing member.
    async fn join_room(&self, request: &JoinRoomRequest) -> Result<RoomInfo, ApiError>;

    /// `GET /rooms/{id}`
    async fn get_room(&self, room_id: &str) -> Result<RoomInfo, ApiError>;

    /// `POST /rooms/{id}/leave`
    async fn leave_room(&self, room_id: &str) -> Result<(), ApiError>;
}

/// Transfer endpoints.
#[async_trait]
pub trait TransferApi: Send + Sync {
    /// `POST /transfers`
    async fn init_transfer(&self, request: &InitTransferRequest) -> Result<TransferInfo, ApiError>;

    /// `POST /transfers/{id}/chunks/{index}` with the sealed chunk
    async fn upload_chunk(
        &self,
        transfer_id: &str,
        chunk_index: u64,
        sealed: Vec<u8>,
    ) -> Result<ChunkUploadAck, ApiError>;

    /// `GET /transfers/{id}/download`
    async fn download(&self, transfer_id: &str) -> Result<DownloadedBlob, ApiError>;

    /// `GET /transfers/room/{room_id}`
    async fn list_transfers(&self, room_id: &str) -> Result<Vec<TransferInfo>, ApiError>;

    /// `DELETE /transfers/{id}`
    async fn cancel_transfer(&self, transfer_id: &str) -> Result<(), ApiError>;
}

/// Both halves of the relay service.
pub trait RelayApi: RoomApi + TransferApi {}

impl<T: RoomApi + TransferApi> RelayApi for T {}

/// Parse an RFC 3339 timestamp, or a naive one taken as UTC.
#[must_use]
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|t| t.and_utc())
}

fn lenient_time<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let text: Option<String> = Option::deserialize(d)?;
    Ok(text.as_deref().and_then(parse_timestamp))
}
