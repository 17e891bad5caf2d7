//! Append-only capsule log.
//!
//! Each capsule is a sealed header (title, timestamp, role, source, type) and
//! a sealed body stored as a content-addressed blob. Entries are never
//! rewritten; deletion appends a tombstone.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mnemo_crypto::aead;
use mnemo_crypto::encoding::{b64_decode, b64_decode_array, b64_encode};
use mnemo_crypto::hash::blake3_hex;
use mnemo_crypto::random::IV_LEN;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{AuthFailure, Result, VaultError};
use crate::keyring::Keyring;
use crate::kv::{KvStore, Table, WriteBatch};
use crate::records::{
    self, log_key, BlobRef, CapsuleEntry, EncryptedField, LogRecord, Tombstone, RECORD_VERSION,
};

fn header_aad(id: &str) -> Vec<u8> {
    format!("mnemo:header:v1:{id}").into_bytes()
}

fn body_aad(id: &str) -> Vec<u8> {
    format!("mnemo:body:v1:{id}").into_bytes()
}

// ── Public types ────────────────────────────────────────────────────────────

/// Caller-supplied description of a new capsule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleMetadata {
    pub title: String,
    pub role: String,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Defaults to the creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl CapsuleMetadata {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            role: "user".into(),
            source: "manual".into(),
            kind: "note".into(),
            timestamp: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Decrypted header contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleHeader {
    pub title: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Per-item outcome of header decryption in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderView {
    Unlocked(CapsuleHeader),
    /// The header could not be opened; the rest of the listing is unaffected.
    Locked { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedCapsule {
    pub id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub header: HeaderView,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapsuleListing {
    /// Newest first.
    pub items: Vec<ListedCapsule>,
    /// Log records that failed schema validation and were left out.
    pub skipped: usize,
}

impl CapsuleListing {
    pub fn locked_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item.header, HeaderView::Locked { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleStats {
    pub capsules: usize,
    pub tombstones: usize,
    pub blobs: usize,
    pub blob_bytes: u64,
    /// Blobs whose stored text is not valid base64; excluded from `blob_bytes`.
    pub corrupt_blobs: usize,
}

// ── Store ───────────────────────────────────────────────────────────────────

/// Sequence numbers are allocated by `KvStore::append` from the highest log
/// key, so unreadable rows keep their slot and are never overwritten.
pub struct CapsuleStore {
    kv: Arc<dyn KvStore>,
}

struct LogView {
    capsules: Vec<CapsuleEntry>,
    tombstones: usize,
    skipped: usize,
}

impl CapsuleStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Seal `content` and its header, then append blob and log entry in one
    /// batch. Returns the new capsule id.
    pub async fn create_capsule(
        &self,
        keyring: &Keyring,
        content: &[u8],
        metadata: CapsuleMetadata,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let timestamp = metadata.timestamp.unwrap_or_else(Utc::now);
        let header = CapsuleHeader {
            title: metadata.title,
            timestamp,
            role: metadata.role,
            source: metadata.source,
            kind: metadata.kind,
        };
        let header_json = Zeroizing::new(serde_json::to_vec(&header)?);

        let (sealed_header, sealed_body) = keyring
            .with_key(|key| {
                let sealed_header = aead::seal(key.as_bytes(), &header_json, &header_aad(&id))?;
                let mut sealed_body = aead::seal(key.as_bytes(), content, &body_aad(&id))?;
                while sealed_body.iv == sealed_header.iv {
                    sealed_body = aead::seal(key.as_bytes(), content, &body_aad(&id))?;
                }
                Ok((sealed_header, sealed_body))
            })
            .await?;
        let content_id = blake3_hex(&sealed_body.data);
        let header = EncryptedField::from_sealed(&sealed_header);
        let blob_iv = b64_encode(sealed_body.iv);
        let blob_data = b64_encode(&sealed_body.data);

        let entry_id = id.clone();
        let seq = self
            .kv
            .append(
                Table::Log,
                Box::new(move |seq: u64| -> Result<WriteBatch> {
                    let record = LogRecord::Capsule(CapsuleEntry {
                        version: RECORD_VERSION,
                        id: entry_id,
                        seq,
                        timestamp,
                        header,
                        blob: BlobRef {
                            iv: blob_iv,
                            content_id: content_id.clone(),
                        },
                    });
                    let mut batch = WriteBatch::new();
                    batch
                        .put(Table::Blobs, content_id, blob_data)
                        .put(Table::Log, log_key(seq), records::encode(&record)?);
                    Ok(batch)
                }),
            )
            .await?;

        debug!(capsule = %id, seq, bytes = content.len(), "capsule appended");
        Ok(id)
    }

    /// The `limit` most recent live capsules, newest first, with decrypted
    /// headers. Bodies are not touched.
    pub async fn list_capsules(&self, keyring: &Keyring, limit: usize) -> Result<CapsuleListing> {
        let view = self.load_log().await?;
        let mut capsules = view.capsules;
        capsules.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.seq.cmp(&a.seq)));
        capsules.truncate(limit);

        let items = keyring
            .with_key(|key| {
                Ok(capsules
                    .into_iter()
                    .map(|entry| {
                        let header = match open_header(key.as_bytes(), &entry) {
                            Ok(header) => HeaderView::Unlocked(header),
                            Err(e) => {
                                warn!(capsule = %entry.id, "capsule header could not be opened");
                                HeaderView::Locked {
                                    reason: e.to_string(),
                                }
                            }
                        };
                        ListedCapsule {
                            id: entry.id,
                            seq: entry.seq,
                            timestamp: entry.timestamp,
                            header,
                        }
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        Ok(CapsuleListing {
            items,
            skipped: view.skipped,
        })
    }

    /// Resolve the entry, fetch its blob, check the content id, decrypt.
    pub async fn get_capsule_content(
        &self,
        keyring: &Keyring,
        id: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let entry = self
            .load_log()
            .await?
            .capsules
            .into_iter()
            .find(|entry| entry.id == id)
            .ok_or_else(|| VaultError::NotFound(format!("capsule {id}")))?;

        let content_id = &entry.blob.content_id;
        let raw = self
            .kv
            .get(Table::Blobs, content_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("blob {content_id}")))?;
        let data = b64_decode(&raw)
            .map_err(|_| VaultError::AuthenticationFailure(AuthFailure::Ciphertext))?;
        if &blake3_hex(&data) != content_id {
            warn!(capsule = %id, blob = %content_id, "blob does not match its content id");
            return Err(VaultError::AuthenticationFailure(AuthFailure::Ciphertext));
        }
        let iv: [u8; IV_LEN] = b64_decode_array(&entry.blob.iv)?;

        keyring
            .with_key(|key| Ok(aead::open(key.as_bytes(), &iv, &data, &body_aad(&entry.id))?))
            .await
    }

    /// Append a tombstone for `id`. The original entry and blob stay in the
    /// log; the capsule disappears from listings and lookups.
    pub async fn delete_capsule(&self, keyring: &Keyring, id: &str) -> Result<()> {
        // Only an unlocked session may mutate the log.
        keyring.with_key(|_| Ok(())).await?;

        let view = self.load_log().await?;
        if !view.capsules.iter().any(|entry| entry.id == id) {
            return Err(VaultError::NotFound(format!("capsule {id}")));
        }
        let target = id.to_string();
        let seq = self
            .kv
            .append(
                Table::Log,
                Box::new(move |seq: u64| -> Result<WriteBatch> {
                    let record = LogRecord::Tombstone(Tombstone {
                        version: RECORD_VERSION,
                        id: Uuid::new_v4().to_string(),
                        seq,
                        timestamp: Utc::now(),
                        target,
                    });
                    let mut batch = WriteBatch::new();
                    batch.put(Table::Log, log_key(seq), records::encode(&record)?);
                    Ok(batch)
                }),
            )
            .await?;
        debug!(capsule = %id, seq, "capsule tombstoned");
        Ok(())
    }

    /// Counts only; works while locked.
    pub async fn stats(&self) -> Result<CapsuleStats> {
        let view = self.load_log().await?;
        let blobs = self.kv.scan(Table::Blobs).await?;
        let mut blob_bytes = 0;
        let mut corrupt_blobs = 0;
        for (content_id, raw) in &blobs {
            match b64_decode(raw) {
                Ok(data) => blob_bytes += data.len() as u64,
                Err(_) => {
                    warn!(blob = %content_id, "blob is not valid base64");
                    corrupt_blobs += 1;
                }
            }
        }
        Ok(CapsuleStats {
            capsules: view.capsules.len(),
            tombstones: view.tombstones,
            blobs: blobs.len(),
            blob_bytes,
            corrupt_blobs,
        })
    }

    /// Live capsules (tombstoned ones removed) plus log bookkeeping.
    async fn load_log(&self) -> Result<LogView> {
        let mut capsules = Vec::new();
        let mut deleted = HashSet::new();
        let mut tombstones = 0;
        let mut skipped = 0;

        for (key, raw) in self.kv.scan(Table::Log).await? {
            match records::decode::<LogRecord>(&raw) {
                Ok(LogRecord::Capsule(entry)) => capsules.push(entry),
                Ok(LogRecord::Tombstone(t)) => {
                    tombstones += 1;
                    deleted.insert(t.target);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping invalid log record");
                    skipped += 1;
                }
            }
        }
        capsules.retain(|entry| !deleted.contains(&entry.id));

        Ok(LogView {
            capsules,
            tombstones,
            skipped,
        })
    }
}

fn open_header(key: &[u8; 32], entry: &CapsuleEntry) -> Result<CapsuleHeader> {
    let (iv, data) = entry.header.to_parts()?;
    let plain = aead::open(key, &iv, &data, &header_aad(&entry.id))?;
    let header: CapsuleHeader = serde_json::from_slice(&plain)?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use chrono::Duration;
    use mnemo_crypto::KdfParams;

    async fn setup() -> (Arc<MemoryKv>, Keyring, CapsuleStore) {
        let kv = Arc::new(MemoryKv::new());
        let keyring = Keyring::new(kv.clone(), KdfParams::minimal());
        keyring.unlock_with_passphrase("pw").await.unwrap();
        let store = CapsuleStore::new(kv.clone());
        (kv, keyring, store)
    }

    #[tokio::test]
    async fn content_round_trips_verbatim() {
        let (_kv, keyring, store) = setup().await;
        let body = b"\x00binary\xffpayload".to_vec();
        let id = store
            .create_capsule(&keyring, &body, CapsuleMetadata::new("bin"))
            .await
            .unwrap();
        let back = store.get_capsule_content(&keyring, &id).await.unwrap();
        assert_eq!(back.as_slice(), body.as_slice());
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_limited() {
        let (_kv, keyring, store) = setup().await;
        let base = Utc::now();
        for i in 0..4 {
            store
                .create_capsule(
                    &keyring,
                    b"x",
                    CapsuleMetadata::new(format!("c{i}")).at(base + Duration::seconds(i)),
                )
                .await
                .unwrap();
        }
        let listing = store.list_capsules(&keyring, 3).await.unwrap();
        let titles: Vec<_> = listing
            .items
            .iter()
            .map(|item| match &item.header {
                HeaderView::Unlocked(h) => h.title.clone(),
                HeaderView::Locked { .. } => panic!("locked header"),
            })
            .collect();
        assert_eq!(titles, ["c3", "c2", "c1"]);
    }

    #[tokio::test]
    async fn one_bad_header_degrades_to_placeholder() {
        let (kv, keyring, store) = setup().await;
        store
            .create_capsule(&keyring, b"ok", CapsuleMetadata::new("good"))
            .await
            .unwrap();
        let bad = store
            .create_capsule(&keyring, b"ok", CapsuleMetadata::new("bad"))
            .await
            .unwrap();

        // Flip a ciphertext byte in the second header so its tag fails.
        let mut snapshot = kv.snapshot();
        for raw in snapshot.log.values_mut() {
            let mut record: LogRecord = serde_json::from_str(raw).unwrap();
            if let LogRecord::Capsule(entry) = &mut record {
                if entry.id == bad {
                    let (iv, mut data) = entry.header.to_parts().unwrap();
                    data[0] ^= 0xff;
                    entry.header = EncryptedField::from_sealed(&aead::Sealed { iv, data });
                }
            }
            *raw = serde_json::to_string(&record).unwrap();
        }
        let kv = Arc::new(MemoryKv::from_snapshot(snapshot));
        let store = CapsuleStore::new(kv.clone());
        let keyring2 = Keyring::new(kv, KdfParams::minimal());
        keyring2.unlock_with_passphrase("pw").await.unwrap();
        drop(keyring);

        let listing = store.list_capsules(&keyring2, 10).await.unwrap();
        assert_eq!(listing.items.len(), 2);
        assert_eq!(listing.locked_count(), 1);
        let locked = listing
            .items
            .iter()
            .find(|item| matches!(item.header, HeaderView::Locked { .. }))
            .unwrap();
        assert_eq!(locked.id, bad);
    }

    #[tokio::test]
    async fn locked_keyring_refuses_listing() {
        let (_kv, keyring, store) = setup().await;
        keyring.lock().await;
        assert!(matches!(
            store.list_capsules(&keyring, 5).await,
            Err(VaultError::Locked)
        ));
        assert!(matches!(
            store
                .create_capsule(&keyring, b"x", CapsuleMetadata::new("t"))
                .await,
            Err(VaultError::Locked)
        ));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let (_kv, keyring, store) = setup().await;
        assert!(matches!(
            store.get_capsule_content(&keyring, "nope").await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn tombstone_hides_capsule_but_keeps_entry() {
        let (kv, keyring, store) = setup().await;
        let id = store
            .create_capsule(&keyring, b"gone", CapsuleMetadata::new("t"))
            .await
            .unwrap();
        store.delete_capsule(&keyring, &id).await.unwrap();

        assert!(matches!(
            store.get_capsule_content(&keyring, &id).await,
            Err(VaultError::NotFound(_))
        ));
        assert!(store.list_capsules(&keyring, 10).await.unwrap().items.is_empty());
        assert_eq!(kv.count(Table::Log).await.unwrap(), 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.capsules, 0);
        assert_eq!(stats.tombstones, 1);
        assert_eq!(stats.blobs, 1);
        assert_eq!(stats.corrupt_blobs, 0);

        assert!(matches!(
            store.delete_capsule(&keyring, &id).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn tampered_blob_is_rejected() {
        let (kv, keyring, store) = setup().await;
        let id = store
            .create_capsule(&keyring, b"secret", CapsuleMetadata::new("t"))
            .await
            .unwrap();
        let mut snapshot = kv.snapshot();
        for raw in snapshot.blobs.values_mut() {
            let mut bytes = b64_decode(raw).unwrap();
            bytes[0] ^= 1;
            *raw = b64_encode(&bytes);
        }
        let kv = Arc::new(MemoryKv::from_snapshot(snapshot));
        let tampered = CapsuleStore::new(kv);
        assert!(matches!(
            tampered.get_capsule_content(&keyring, &id).await,
            Err(VaultError::AuthenticationFailure(AuthFailure::Ciphertext))
        ));
    }

    #[tokio::test]
    async fn unreadable_log_row_keeps_its_slot() {
        let kv = Arc::new(MemoryKv::new());
        let mut batch = WriteBatch::new();
        batch.put(Table::Log, log_key(1), "garbage-record");
        kv.commit(batch).await.unwrap();
        let keyring = Keyring::new(kv.clone(), KdfParams::minimal());
        keyring.unlock_with_passphrase("pw").await.unwrap();
        let store = CapsuleStore::new(kv.clone());

        let id = store
            .create_capsule(&keyring, b"after", CapsuleMetadata::new("t"))
            .await
            .unwrap();
        assert_eq!(
            kv.get(Table::Log, &log_key(1)).await.unwrap().as_deref(),
            Some("garbage-record")
        );
        let raw = kv.get(Table::Log, &log_key(2)).await.unwrap().unwrap();
        match records::decode::<LogRecord>(&raw).unwrap() {
            LogRecord::Capsule(entry) => {
                assert_eq!(entry.id, id);
                assert_eq!(entry.seq, 2);
            }
            other => panic!("unexpected record {other:?}"),
        }

        store.delete_capsule(&keyring, &id).await.unwrap();
        assert_eq!(kv.count(Table::Log).await.unwrap(), 3);
        let listing = store.list_capsules(&keyring, 10).await.unwrap();
        assert!(listing.items.is_empty());
        assert_eq!(listing.skipped, 1);
    }

    #[tokio::test]
    async fn stats_count_corrupt_blobs() {
        let (kv, keyring, store) = setup().await;
        store
            .create_capsule(&keyring, b"12345", CapsuleMetadata::new("t"))
            .await
            .unwrap();
        let mut batch = WriteBatch::new();
        batch.put(Table::Blobs, "f".repeat(64), "%%% not base64 %%%");
        kv.commit(batch).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.blobs, 2);
        assert_eq!(stats.corrupt_blobs, 1);
        // Sealed body: five plaintext bytes plus the 16-byte tag.
        assert_eq!(stats.blob_bytes, 21);
    }

    #[tokio::test]
    async fn header_and_body_ivs_differ() {
        let (kv, keyring, store) = setup().await;
        store
            .create_capsule(&keyring, b"x", CapsuleMetadata::new("t"))
            .await
            .unwrap();
        let (_, raw) = kv.scan(Table::Log).await.unwrap().remove(0);
        match serde_json::from_str::<LogRecord>(&raw).unwrap() {
            LogRecord::Capsule(entry) => assert_ne!(entry.header.iv, entry.blob.iv),
            other => panic!("unexpected record {other:?}"),
        }
    }
}
