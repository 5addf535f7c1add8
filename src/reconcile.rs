use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{RelayError, RelayResult};
use crate::models::{CapturedRecord, Document, DocumentPatch};
use crate::protocol::{APPLICATIONS_KEY, RESUMES_KEY};
use crate::store::LocalStore;

/// How to fill in a missing document id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStrategy {
    /// `local_<millis>`
    Timestamp,
    /// `local_<millis>_<suffix>`
    TimestampWithSuffix,
}

pub fn local_id(strategy: IdStrategy) -> String {
    let millis = Utc::now().timestamp_millis();
    match strategy {
        IdStrategy::Timestamp => format!("local_{}", millis),
        IdStrategy::TimestampWithSuffix => {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(9)
                .map(char::from)
                .collect();
            format!("local_{}_{}", millis, suffix.to_lowercase())
        }
    }
}

/// Fill defaults: id, title. Missing lists are already empty after decoding.
pub fn normalize_document(doc: &mut Document, strategy: IdStrategy) {
    if doc.id.trim().is_empty() {
        doc.id = local_id(strategy);
    }
    if doc.title.trim().is_empty() {
        if let Some(title) = doc.default_title() {
            doc.title = title;
        }
    }
}

fn decode_document(value: Value) -> Option<Document> {
    match serde_json::from_value::<Document>(value) {
        Ok(doc) => Some(doc),
        Err(e) => {
            debug!(error = %e, "dropping undecodable resume");
            None
        }
    }
}

fn finish_document(mut doc: Document, strategy: IdStrategy) -> Option<Document> {
    normalize_document(&mut doc, strategy);
    match doc.validate() {
        Ok(()) => Some(doc),
        Err(e) => {
            debug!(id = %doc.id, error = %e, "dropping invalid resume");
            None
        }
    }
}

/// Decode, normalize and validate one raw document. Invalid ones are `None`.
pub fn repair_document(value: Value, strategy: IdStrategy) -> Option<Document> {
    finish_document(decode_document(value)?, strategy)
}

/// Repair a document the backend returned for `id`. A body without an id
/// stays addressable by the id it was requested under.
fn repair_for(value: Value, id: &str) -> Option<Document> {
    let mut doc = decode_document(value)?;
    if doc.id.trim().is_empty() {
        doc.id = id.to_string();
    }
    finish_document(doc, IdStrategy::TimestampWithSuffix)
}

/// Equal apart from the id.
fn same_content(a: &Document, b: &Document) -> bool {
    let strip = |doc: &Document| Document {
        id: String::new(),
        ..doc.clone()
    };
    strip(a) == strip(b)
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Offline-first CRUD over resumes plus the cached application list.
/// Remote first; the local store is the fallback and the mirror.
pub struct CacheReconciler {
    backend: Arc<dyn Backend>,
    store: Arc<dyn LocalStore>,
    request_timeout: Duration,
    // Serializes read-modify-write of cache keys.
    lock: Mutex<()>,
}

impl CacheReconciler {
    pub fn new(
        backend: Arc<dyn Backend>,
        store: Arc<dyn LocalStore>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            request_timeout,
            lock: Mutex::new(()),
        }
    }

    async fn remote<T>(&self, call: impl Future<Output = RelayResult<T>>) -> RelayResult<T> {
        timeout(self.request_timeout, call).await?
    }

    // --- Cache primitives ---

    /// A store failure is an error; only an unparsable payload is discarded.
    fn read_raw_list(&self, key: &str) -> RelayResult<Vec<Value>> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(items)) => Ok(items),
            _ => {
                warn!(key, "discarding corrupt cache payload");
                if let Err(e) = self.store.remove(key) {
                    warn!(key, error = %e, "failed to remove corrupt cache payload");
                }
                Ok(Vec::new())
            }
        }
    }

    /// Cached documents, repaired. The flag is set when an entry had no id
    /// and was given one here.
    fn read_documents(&self) -> RelayResult<(Vec<Document>, bool)> {
        let mut assigned = false;
        let docs = self
            .read_raw_list(RESUMES_KEY)?
            .into_iter()
            .filter_map(|value| {
                let doc = decode_document(value)?;
                assigned |= doc.id.trim().is_empty();
                finish_document(doc, IdStrategy::TimestampWithSuffix)
            })
            .collect();
        Ok((docs, assigned))
    }

    fn write_documents(&self, docs: &[Document]) -> RelayResult<()> {
        let raw = serde_json::to_string(docs).map_err(|e| RelayError::Storage(e.to_string()))?;
        self.store.set(RESUMES_KEY, &raw)?;
        Ok(())
    }

    /// Cache contents for the read paths. Ids assigned during repair are
    /// written back so later calls can use them. An unreadable store reads
    /// as empty.
    async fn settled_documents(&self) -> Vec<Document> {
        let _guard = self.lock.lock().await;
        match self.read_documents() {
            Ok((docs, false)) => docs,
            Ok((docs, true)) => {
                if let Err(e) = self.write_documents(&docs) {
                    warn!(error = %e, "failed to persist repaired resume ids");
                }
                docs
            }
            Err(e) => {
                warn!(error = %e, "resume cache unreadable");
                Vec::new()
            }
        }
    }

    /// Replace the cached entry with the same id, or put it first.
    async fn mirror(&self, doc: &Document) -> RelayResult<()> {
        let _guard = self.lock.lock().await;
        let (mut docs, _) = self.read_documents()?;
        match docs.iter_mut().find(|cached| cached.id == doc.id) {
            Some(cached) => *cached = doc.clone(),
            None => docs.insert(0, doc.clone()),
        }
        self.write_documents(&docs)
    }

    /// Documents currently in the cache, validated and repaired.
    pub async fn cached_documents(&self) -> Vec<Document> {
        self.settled_documents().await
    }

    // --- Resume operations ---

    pub async fn list(&self, owner_id: Option<&str>) -> Vec<Document> {
        let owned = |doc: &Document| match owner_id {
            Some(owner) => doc.user_id.as_deref() == Some(owner),
            None => true,
        };

        let values = match self.remote(self.backend.list_resumes(owner_id)).await {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "listing resumes from cache");
                let docs = self.settled_documents().await;
                return docs.into_iter().filter(|doc| owned(doc)).collect();
            }
        };

        let _guard = self.lock.lock().await;
        let cached = match self.read_documents() {
            Ok((cached, _)) => Some(cached),
            Err(e) => {
                warn!(error = %e, "resume cache unreadable, not refreshing it");
                None
            }
        };

        // Remote entries without an id take the id of an identical cached
        // entry from an earlier listing, otherwise a fresh unique one.
        let mut remote: Vec<Document> = Vec::with_capacity(values.len());
        for value in values {
            let Some(doc) = decode_document(value) else {
                continue;
            };
            let had_id = !doc.id.trim().is_empty();
            let Some(mut doc) = finish_document(doc, IdStrategy::TimestampWithSuffix) else {
                continue;
            };
            if !had_id {
                let earlier = cached.iter().flatten().find(|prev| {
                    prev.is_local()
                        && !remote.iter().any(|taken| taken.id == prev.id)
                        && same_content(prev, &doc)
                });
                if let Some(earlier) = earlier {
                    doc.id = earlier.id.clone();
                }
            }
            remote.push(doc);
        }

        let Some(cached) = cached else {
            return remote.into_iter().filter(|doc| owned(doc)).collect();
        };

        let remote_ids: HashSet<String> = remote.iter().map(|d| d.id.clone()).collect();
        let mut merged = remote;
        // Keep offline-created entries and entries outside this owner's view.
        merged.extend(cached.into_iter().filter(|cached| {
            !remote_ids.contains(&cached.id) && (cached.is_local() || !owned(cached))
        }));
        if let Err(e) = self.write_documents(&merged) {
            warn!(error = %e, "failed to refresh resume cache");
        }
        merged.into_iter().filter(|doc| owned(doc)).collect()
    }

    pub async fn get(&self, id: &str) -> Option<Document> {
        match self.remote(self.backend.get_resume(id)).await {
            Ok(Some(value)) => {
                if let Some(doc) = repair_for(value, id) {
                    if let Err(e) = self.mirror(&doc).await {
                        warn!(id, error = %e, "failed to mirror resume");
                    }
                    return Some(doc);
                }
            }
            Ok(None) => debug!(id, "resume not on backend, checking cache"),
            Err(e) => warn!(id, error = %e, "reading resume from cache"),
        }
        self.settled_documents().await.into_iter().find(|doc| doc.id == id)
    }

    /// Create a resume. Invalid input is rejected; a backend failure still
    /// yields a locally stored document with a `local_` id.
    pub async fn create(&self, patch: DocumentPatch) -> RelayResult<Document> {
        let mut draft = Document::from_patch(patch);
        draft.validate()?;
        if draft.title.trim().is_empty() {
            if let Some(title) = draft.default_title() {
                draft.title = title;
            }
        }

        let remote = self.remote(self.backend.create_resume(&draft)).await;
        let created = match remote {
            Ok(value) => repair_document(value, IdStrategy::Timestamp).ok_or_else(|| {
                RelayError::Transport("backend returned an invalid resume".to_string())
            }),
            Err(e) => Err(e),
        };

        let doc = match created {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "creating resume locally");
                let stamp = now();
                let mut doc = draft;
                doc.id = local_id(IdStrategy::TimestampWithSuffix);
                doc.created_at = Some(stamp.clone());
                doc.updated_at = Some(stamp);
                doc
            }
        };

        self.mirror(&doc).await?;
        Ok(doc)
    }

    pub async fn update(&self, id: &str, patch: DocumentPatch) -> RelayResult<Document> {
        let remote = self.remote(self.backend.update_resume(id, &patch)).await;
        let updated = match remote {
            Ok(value) => repair_for(value, id).ok_or_else(|| {
                RelayError::Transport("backend returned an invalid resume".to_string())
            }),
            Err(e) => Err(e),
        };

        match updated {
            Ok(doc) => {
                self.mirror(&doc).await?;
                Ok(doc)
            }
            Err(e) => {
                warn!(id, error = %e, "updating resume locally");
                let _guard = self.lock.lock().await;
                let (mut docs, _) = self.read_documents()?;
                let Some(cached) = docs.iter_mut().find(|doc| doc.id == id) else {
                    return Err(RelayError::NoCandidateTargets(format!(
                        "resume {} is not in the cache",
                        id
                    )));
                };
                let mut changed = cached.clone();
                patch.apply_to(&mut changed);
                changed.validate()?;
                changed.updated_at = Some(now());
                *cached = changed.clone();
                self.write_documents(&docs)?;
                Ok(changed)
            }
        }
    }

    /// Delete remotely if possible; the local copy is always removed.
    pub async fn delete(&self, id: &str) -> RelayResult<()> {
        if let Err(e) = self.remote(self.backend.delete_resume(id)).await {
            warn!(id, error = %e, "remote delete failed, removing locally");
        }

        let _guard = self.lock.lock().await;
        let (docs, _) = self.read_documents()?;
        let docs: Vec<Document> = docs.into_iter().filter(|doc| doc.id != id).collect();
        self.write_documents(&docs)
    }

    // --- Application cache ---

    fn read_applications(&self) -> RelayResult<Vec<CapturedRecord>> {
        Ok(self
            .read_raw_list(APPLICATIONS_KEY)?
            .into_iter()
            .filter_map(|value| serde_json::from_value::<CapturedRecord>(value).ok())
            .filter(|record| record.validate().is_ok())
            .collect())
    }

    /// Cached applications, newest first. Undecodable entries are skipped
    /// and an unreadable store reads as empty.
    pub fn applications(&self) -> Vec<CapturedRecord> {
        self.read_applications().unwrap_or_else(|e| {
            warn!(error = %e, "application cache unreadable");
            Vec::new()
        })
    }

    /// Put `record` at the front of the application cache, replacing any
    /// entry with the same identity.
    pub async fn record_application(&self, record: &CapturedRecord) -> RelayResult<()> {
        let _guard = self.lock.lock().await;
        let identity = record.identity();
        let mut records: Vec<CapturedRecord> = self
            .read_applications()?
            .into_iter()
            .filter(|cached| cached.identity() != identity)
            .collect();
        records.insert(0, record.clone());

        let raw =
            serde_json::to_string(&records).map_err(|e| RelayError::Storage(e.to_string()))?;
        self.store.set(APPLICATIONS_KEY, &raw)?;
        Ok(())
    }
}
