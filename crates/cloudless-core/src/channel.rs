//! Secure channel between the local member and the other room members.
//!
//! Holds the local [`KeyPair`] and one [`SharedSecret`] per peer. Secrets are
//! derived from the member list, which is the only source of peer public
//! keys. When a payload fails authentication the channel assumes its copy of
//! the sender's key is stale: it refetches the member list, re-derives, and
//! retries, as many times as the [`ResyncPolicy`] allows.

use std::collections::HashMap;

use async_trait::async_trait;
use cloudless_crypto::{
    EncryptedPayload, KeyPair, PublicKey, SafetyNumber, SharedSecret, derive_shared_secret,
    emoji_fingerprint, safety_number,
};
use cloudless_crypto::verify::EMOJI_FINGERPRINT_LEN;

use crate::api::MemberInfo;
use crate::error::{Error, Result};

/// Bounded stale-secret recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncPolicy {
    /// Member refetches allowed per failed payload
    pub max_resyncs: u32,
}

impl Default for ResyncPolicy {
    fn default() -> Self {
        Self { max_resyncs: 1 }
    }
}

impl ResyncPolicy {
    /// Fail on the first authentication error.
    #[must_use]
    pub fn none() -> Self {
        Self { max_resyncs: 0 }
    }
}

/// Authoritative member list.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    /// Fetch the current members of the room.
    async fn fetch_members(&self) -> Result<Vec<MemberInfo>>;
}

/// Secret shared with one peer, with the key it was derived from.
#[derive(Clone)]
pub struct PeerSecret {
    public_key: PublicKey,
    secret: SharedSecret,
}

impl PeerSecret {
    /// Peer key the secret was derived from.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The shared secret.
    #[must_use]
    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }
}

impl std::fmt::Debug for PeerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSecret")
            .field("key_id", &self.secret.key_id())
            .finish_non_exhaustive()
    }
}

/// Outcome of registering a peer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerUpdate {
    /// First secret for this peer
    Added,
    /// The peer's key changed and the secret was re-derived
    Rekeyed,
    /// Same key as before
    Unchanged,
}

/// What [`SecureChannel::sync_members`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Peers seen for the first time
    pub added: Vec<String>,
    /// Peers whose key changed
    pub rekeyed: Vec<String>,
    /// Peers no longer listed
    pub removed: Vec<String>,
}

impl SyncReport {
    /// Whether anything changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.rekeyed.is_empty() && self.removed.is_empty()
    }
}

/// Per-room key material.
pub struct SecureChannel {
    keypair: KeyPair,
    self_id: String,
    peers: HashMap<String, PeerSecret>,
    order: Vec<String>,
    resync: ResyncPolicy,
}

impl SecureChannel {
    /// Create a channel with no peers.
    #[must_use]
    pub fn new(keypair: KeyPair, self_id: impl Into<String>, resync: ResyncPolicy) -> Self {
        Self {
            keypair,
            self_id: self_id.into(),
            peers: HashMap::new(),
            order: Vec::new(),
            resync,
        }
    }

    /// Local key pair.
    #[must_use]
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// Local public key.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    /// Local user id.
    #[must_use]
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Peers in registration order.
    #[must_use]
    pub fn peer_ids(&self) -> &[String] {
        &self.order
    }

    /// Whether a secret exists for `peer`.
    #[must_use]
    pub fn has_peer(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    /// Secret and key for `peer`.
    #[must_use]
    pub fn peer(&self, peer: &str) -> Option<&PeerSecret> {
        self.peers.get(peer)
    }

    /// Peer used by [`SecureChannel::encrypt_outbound`].
    #[must_use]
    pub fn primary_peer(&self) -> Option<&str> {
        self.order.first().map(String::as_str)
    }

    /// Derive or refresh the secret for `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if the key is a low-order point.
    pub fn upsert_peer(&mut self, peer: &str, public_key: &PublicKey) -> Result<PeerUpdate> {
        if peer == self.self_id {
            return Ok(PeerUpdate::Unchanged);
        }
        if let Some(existing) = self.peers.get(peer) {
            if existing.public_key == *public_key {
                return Ok(PeerUpdate::Unchanged);
            }
        }

        let secret = derive_shared_secret(self.keypair.secret_key(), public_key)?;
        let update = if self.peers.contains_key(peer) {
            PeerUpdate::Rekeyed
        } else {
            self.order.push(peer.to_string());
            PeerUpdate::Added
        };
        tracing::debug!(peer, key_id = %secret.key_id(), ?update, "derived shared secret");
        self.peers.insert(
            peer.to_string(),
            PeerSecret {
                public_key: *public_key,
                secret,
            },
        );
        Ok(update)
    }

    /// Drop the secret for `peer`.
    pub fn remove_peer(&mut self, peer: &str) -> bool {
        self.order.retain(|p| p != peer);
        self.peers.remove(peer).is_some()
    }

    /// Bring the peer set in line with an authoritative member list.
    ///
    /// Members with malformed keys are skipped; they keep no secret until
    /// the relay lists a valid key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] only for a key that decodes but cannot be
    /// used for key agreement.
    pub fn sync_members(&mut self, members: &[MemberInfo]) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let self_id = self.self_id.clone();

        for member in members.iter().filter(|m| m.user_id != self_id) {
            let key = match member.public_key() {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(user_id = %member.user_id, error = %e, "skipping member with unusable key");
                    continue;
                }
            };
            match self.upsert_peer(&member.user_id, &key)? {
                PeerUpdate::Added => report.added.push(member.user_id.clone()),
                PeerUpdate::Rekeyed => report.rekeyed.push(member.user_id.clone()),
                PeerUpdate::Unchanged => {}
            }
        }

        let gone: Vec<String> = self
            .order
            .iter()
            .filter(|p| !members.iter().any(|m| &m.user_id == *p))
            .cloned()
            .collect();
        for peer in gone {
            self.remove_peer(&peer);
            report.removed.push(peer);
        }

        Ok(report)
    }

    /// Encrypt for the first-registered peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no peer has joined yet.
    pub fn encrypt_outbound(&self, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let peer = self
            .primary_peer()
            .ok_or(Error::InvalidState("no peer has joined the room".into()))?;
        self.encrypt_for(peer, plaintext)
    }

    /// Encrypt for one peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoPeerSecret`] for an unknown peer.
    pub fn encrypt_for(&self, peer: &str, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let secret = self
            .peers
            .get(peer)
            .ok_or_else(|| Error::NoPeerSecret(peer.to_string()))?;
        Ok(secret.secret.encrypt(plaintext)?)
    }

    /// Decrypt with the current secret for `sender`, without resync.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoPeerSecret`] for an unknown sender and
    /// [`Error::AuthenticationFailed`] if the payload does not verify.
    pub fn decrypt_from(&self, sender: &str, payload: &EncryptedPayload) -> Result<Vec<u8>> {
        let secret = self
            .peers
            .get(sender)
            .ok_or_else(|| Error::NoPeerSecret(sender.to_string()))?;
        Ok(secret.secret.open(payload)?)
    }

    /// Decrypt a payload from `sender`, recovering from a stale secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DecryptionFailed`] once the resync budget is spent,
    /// or the directory's error if the member list cannot be fetched.
    pub async fn decrypt_inbound(
        &mut self,
        payload: &EncryptedPayload,
        sender: &str,
        directory: &dyn MemberDirectory,
    ) -> Result<Vec<u8>> {
        match self.decrypt_from(sender, payload) {
            Ok(plaintext) => return Ok(plaintext),
            Err(Error::AuthenticationFailed | Error::NoPeerSecret(_)) => {}
            Err(other) => return Err(other),
        }

        for round in 1..=self.resync.max_resyncs {
            tracing::debug!(sender, round, "decrypt failed, resyncing member keys");
            let members = directory.fetch_members().await?;
            self.sync_members(&members)?;

            match self.decrypt_from(sender, payload) {
                Ok(plaintext) => {
                    tracing::info!(sender, round, "decrypted after resync");
                    return Ok(plaintext);
                }
                Err(Error::AuthenticationFailed | Error::NoPeerSecret(_)) => {}
                Err(other) => return Err(other),
            }
        }

        tracing::warn!(sender, "dropping payload that failed after resync");
        Err(Error::DecryptionFailed {
            sender: sender.to_string(),
        })
    }

    /// Safety number for the pair (local, `peer`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoPeerSecret`] for an unknown peer.
    pub fn safety_number(&self, peer: &str) -> Result<SafetyNumber> {
        let remote = self
            .peers
            .get(peer)
            .ok_or_else(|| Error::NoPeerSecret(peer.to_string()))?;
        Ok(safety_number(self.public_key(), &remote.public_key))
    }

    /// Emoji fingerprint of the local key.
    #[must_use]
    pub fn own_fingerprint(&self) -> [&'static str; EMOJI_FINGERPRINT_LEN] {
        emoji_fingerprint(self.public_key())
    }

    /// Emoji fingerprint of `peer`'s key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoPeerSecret`] for an unknown peer.
    pub fn peer_fingerprint(&self, peer: &str) -> Result<[&'static str; EMOJI_FINGERPRINT_LEN]> {
        let remote = self
            .peers
            .get(peer)
            .ok_or_else(|| Error::NoPeerSecret(peer.to_string()))?;
        Ok(emoji_fingerprint(&remote.public_key))
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("self_id", &self.self_id)
            .field("peers", &self.order)
            .finish_non_exhaustive()
    }
}
