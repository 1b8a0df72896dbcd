//! Store collaborators backed by an embedded Strata database.
//!
//! A Strata `Session` is owned by one dedicated thread; async callers send it
//! closures and await the reply. Everything lives as JSON strings in the KV
//! primitive of the default branch:
//!
//! | key                               | value                |
//! |-----------------------------------|----------------------|
//! | `setting/global/<key>`            | [`SettingRecord`]    |
//! | `setting/kb/<kb_id>/<key>`        | [`SettingRecord`]    |
//! | `model/<id>`                      | [`Model`]            |
//! | `kb/<id>`                         | [`KnowledgeBase`]    |
//! | `node/<kb_id>/<unit_id>`          | [`ContentUnit`]      |
//! | `index_queue/<kb_id>/<unit_id>`   | [`VectorRequest`]    |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::mpsc;
use stratadb::{Command, OpenOptions, Output, Session, Strata, Value};
use tokio::sync::oneshot;

use crate::domain::{
    ContentUnit, KnowledgeBase, McpServerSettings, Model, ModelType, TokenUsage, UpdateModelReq,
    VectorRequest, SETTING_MCP_SERVER,
};
use crate::error::{BridgeError, Result};
use crate::store::{
    AppSettingsSource, ContentCursor, IndexQueue, KnowledgeBaseRepo, ModelRegistry,
    SettingsStore, UnitVisitor,
};

/// Units fetched per cursor page.
const NODE_PAGE_SIZE: u64 = 100;

const MODEL_PREFIX: &str = "model/";
const KB_PREFIX: &str = "kb/";
const NODE_PREFIX: &str = "node/";
const QUEUE_PREFIX: &str = "index_queue/";

type Job = Box<dyn FnOnce(&mut Session) + Send>;

/// A stored setting blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettingRecord {
    value: String,
    #[serde(default)]
    description: String,
}

/// Handle to the store thread. Cheap to clone.
#[derive(Clone)]
pub struct StrataStore {
    jobs: mpsc::Sender<Job>,
}

impl StrataStore {
    /// Open (or create) a database directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::spawn(move || {
            Strata::open_with(&path, OpenOptions::new())
                .map_err(|e| open_failed(&path.display(), e))
        })
    }

    /// In-memory database; nothing is persisted.
    pub fn cache() -> Result<Self> {
        Self::spawn(|| Strata::cache().map_err(|e| open_failed(&"cache", e)))
    }

    fn spawn<F>(open: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Strata> + Send + 'static,
    {
        let (jobs, rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);

        std::thread::Builder::new()
            .name("strata-store".to_string())
            .spawn(move || {
                let strata = match open() {
                    Ok(db) => db,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let mut session = strata.session();
                let _ = ready_tx.send(Ok(()));

                while let Ok(job) = rx.recv() {
                    job(&mut session);
                }
                tracing::debug!("strata store thread exiting");
            })?;

        ready_rx.recv().map_err(|_| {
            BridgeError::Internal("strata store thread exited during open".to_string())
        })??;

        Ok(Self { jobs })
    }

    /// Run `f` against the session on the store thread.
    async fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Session) -> Result<R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |session| {
            let _ = tx.send(f(session));
        });
        self.jobs
            .send(job)
            .map_err(|_| BridgeError::Internal("strata store is closed".to_string()))?;
        rx.await
            .map_err(|_| BridgeError::Internal("strata store dropped the request".to_string()))?
    }

    /// Create or replace a knowledge base.
    pub async fn put_knowledge_base(&self, kb: &KnowledgeBase) -> Result<()> {
        let key = format!("{}{}", KB_PREFIX, kb.id);
        let json = serde_json::to_string(kb)?;
        self.call(move |s| kv_put(s, key, json)).await
    }

    /// Fetch a knowledge base by id.
    pub async fn knowledge_base(&self, kb_id: &str) -> Result<Option<KnowledgeBase>> {
        let key = format!("{}{}", KB_PREFIX, kb_id);
        self.call(move |s| kv_get_json(s, &key)).await
    }

    /// Create or replace a content unit.
    pub async fn put_content_unit(&self, unit: &ContentUnit) -> Result<()> {
        let key = node_key(&unit.kb_id, &unit.id);
        let json = serde_json::to_string(unit)?;
        self.call(move |s| kv_put(s, key, json)).await
    }

    /// Write the MCP server settings of a knowledge base.
    pub async fn put_mcp_server_settings(
        &self,
        kb_id: &str,
        settings: &McpServerSettings,
    ) -> Result<()> {
        let value = serde_json::to_string(settings)?;
        self.upsert(kb_id, SETTING_MCP_SERVER, &value, "MCP server settings")
            .await
    }

    /// Messages waiting in the index queue, without removing them.
    pub async fn pending_index_requests(&self) -> Result<Vec<VectorRequest>> {
        self.call(|s| {
            let keys = kv_list(s, QUEUE_PREFIX, None, None)?;
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(req) = kv_get_json(s, &key)? {
                    out.push(req);
                }
            }
            Ok(out)
        })
        .await
    }

    /// Remove and return up to `limit` queued messages.
    pub async fn take_index_requests(&self, limit: u64) -> Result<Vec<VectorRequest>> {
        self.call(move |s| {
            let keys = kv_list(s, QUEUE_PREFIX, None, Some(limit))?;
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(req) = kv_get_json(s, &key)? {
                    out.push(req);
                }
                kv_delete(s, key)?;
            }
            Ok(out)
        })
        .await
    }
}

fn open_failed(target: &dyn std::fmt::Display, err: impl std::fmt::Display) -> BridgeError {
    BridgeError::Store {
        code: "OPEN_FAILED".to_string(),
        message: format!("failed to open database at '{}': {}", target, err),
    }
}

fn model_not_found(key: &str) -> BridgeError {
    BridgeError::InvalidArg {
        name: "id".to_string(),
        reason: format!("model '{}' not found", key.trim_start_matches(MODEL_PREFIX)),
    }
}

fn setting_key(scope: &str, key: &str) -> String {
    if scope.is_empty() {
        format!("setting/global/{}", key)
    } else {
        format!("setting/kb/{}/{}", scope, key)
    }
}

fn node_key(kb_id: &str, unit_id: &str) -> String {
    format!("{}{}/{}", NODE_PREFIX, kb_id, unit_id)
}

fn queue_key(req: &VectorRequest) -> String {
    format!("{}{}/{}", QUEUE_PREFIX, req.kb_id, req.unit_id)
}

fn kv_get(session: &mut Session, key: &str) -> Result<Option<String>> {
    let output = session.execute(Command::KvGet {
        branch: None,
        space: None,
        key: key.to_string(),
    })?;
    let value = match output {
        Output::Maybe(value) => value,
        Output::MaybeVersioned(versioned) => versioned.map(|vv| vv.value),
        _ => {
            return Err(BridgeError::Internal(
                "Unexpected output for KvGet".to_string(),
            ))
        }
    };
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(BridgeError::Internal(format!(
            "value at '{}' is not a string",
            key
        ))),
    }
}

fn kv_get_json<T: serde::de::DeserializeOwned>(
    session: &mut Session,
    key: &str,
) -> Result<Option<T>> {
    match kv_get(session, key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn kv_put(session: &mut Session, key: String, json: String) -> Result<()> {
    session.execute(Command::KvPut {
        branch: None,
        space: None,
        key,
        value: Value::String(json),
    })?;
    Ok(())
}

fn kv_delete(session: &mut Session, key: String) -> Result<()> {
    session.execute(Command::KvDelete {
        branch: None,
        space: None,
        key,
    })?;
    Ok(())
}

fn kv_list(
    session: &mut Session,
    prefix: &str,
    cursor: Option<String>,
    limit: Option<u64>,
) -> Result<Vec<String>> {
    let output = session.execute(Command::KvList {
        branch: None,
        space: None,
        prefix: Some(prefix.to_string()),
        cursor,
        limit,
    })?;
    let mut keys = match output {
        Output::Keys(keys) => keys,
        Output::JsonListResult { keys, .. } => keys,
        _ => {
            return Err(BridgeError::Internal(
                "Unexpected output for KvList".to_string(),
            ))
        }
    };
    keys.sort();
    Ok(keys)
}

fn all_models(session: &mut Session) -> Result<Vec<Model>> {
    let mut models = Vec::new();
    for key in kv_list(session, MODEL_PREFIX, None, None)? {
        if let Some(model) = kv_get_json(session, &key)? {
            models.push(model);
        }
    }
    Ok(models)
}

/// One page of the node traversal.
struct NodePage {
    units: Vec<ContentUnit>,
    last_key: Option<String>,
    more: bool,
}

fn node_page(session: &mut Session, after: Option<String>, limit: u64) -> Result<NodePage> {
    let keys = kv_list(session, NODE_PREFIX, after.clone(), Some(limit))?;
    let more = keys.len() as u64 >= limit;

    // Cursor may be inclusive; never revisit a key.
    let keys: Vec<String> = match &after {
        Some(after) => keys.into_iter().filter(|k| k > after).collect(),
        None => keys,
    };

    let mut units = Vec::with_capacity(keys.len());
    for key in &keys {
        if let Some(unit) = kv_get_json::<ContentUnit>(session, key)? {
            units.push(unit);
        }
    }
    Ok(NodePage {
        units,
        last_key: keys.last().cloned(),
        more,
    })
}

#[async_trait]
impl SettingsStore for StrataStore {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>> {
        let key = setting_key(scope, key);
        let record: Option<SettingRecord> = self.call(move |s| kv_get_json(s, &key)).await?;
        Ok(record.map(|r| r.value))
    }

    async fn upsert(&self, scope: &str, key: &str, value: &str, description: &str) -> Result<()> {
        let key = setting_key(scope, key);
        let record = SettingRecord {
            value: value.to_string(),
            description: description.to_string(),
        };
        let json = serde_json::to_string(&record)?;
        self.call(move |s| kv_put(s, key, json)).await
    }
}

#[async_trait]
impl ModelRegistry for StrataStore {
    async fn create(&self, model: &Model) -> Result<()> {
        if model.id.is_empty() {
            return Err(BridgeError::MissingArg("id".to_string()));
        }
        let key = format!("{}{}", MODEL_PREFIX, model.id);
        let json = serde_json::to_string(model)?;
        self.call(move |s| kv_put(s, key, json)).await
    }

    async fn update(&self, req: &UpdateModelReq) -> Result<Model> {
        let req = req.clone();
        self.call(move |s| {
            let key = format!("{}{}", MODEL_PREFIX, req.id);
            let mut model: Model = kv_get_json(s, &key)?.ok_or_else(|| model_not_found(&key))?;
            req.apply(&mut model);
            kv_put(s, key, serde_json::to_string(&model)?)?;
            Ok(model)
        })
        .await
    }

    async fn get_active_by_type(&self, model_type: ModelType) -> Result<Option<Model>> {
        let mut active: Vec<Model> = self
            .call(all_models)
            .await?
            .into_iter()
            .filter(|m| m.model_type == model_type && m.is_active)
            .collect();

        match active.len() {
            1 => Ok(active.pop()),
            0 => Ok(None),
            n => {
                tracing::warn!(
                    model_type = %model_type,
                    count = n,
                    "ambiguous active models, treating as none"
                );
                Ok(None)
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        self.call(all_models).await
    }

    async fn update_usage(&self, model_id: &str, usage: &TokenUsage) -> Result<Model> {
        let key = format!("{}{}", MODEL_PREFIX, model_id);
        let usage = *usage;
        self.call(move |s| {
            let mut model: Model = kv_get_json(s, &key)?.ok_or_else(|| model_not_found(&key))?;
            model.add_usage(&usage);
            kv_put(s, key, serde_json::to_string(&model)?)?;
            Ok(model)
        })
        .await
    }
}

#[async_trait]
impl KnowledgeBaseRepo for StrataStore {
    async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>> {
        self.call(|s| {
            let mut kbs = Vec::new();
            for key in kv_list(s, KB_PREFIX, None, None)? {
                if let Some(kb) = kv_get_json(s, &key)? {
                    kbs.push(kb);
                }
            }
            Ok(kbs)
        })
        .await
    }

    async fn update_dataset_id(&self, kb_id: &str, dataset_id: &str) -> Result<()> {
        let key = format!("{}{}", KB_PREFIX, kb_id);
        let dataset_id = dataset_id.to_string();
        self.call(move |s| {
            let kb_id = key.trim_start_matches(KB_PREFIX);
            let mut kb: KnowledgeBase =
                kv_get_json(s, &key)?.ok_or_else(|| BridgeError::InvalidArg {
                    name: "kb_id".to_string(),
                    reason: format!("knowledge base '{}' not found", kb_id),
                })?;
            kb.dataset_id = dataset_id;
            kv_put(s, key, serde_json::to_string(&kb)?)
        })
        .await
    }
}

#[async_trait]
impl ContentCursor for StrataStore {
    async fn for_each_published(&self, visit: &mut UnitVisitor<'_>) -> Result<()> {
        let mut after: Option<String> = None;
        loop {
            let cursor = after.clone();
            let page = self
                .call(move |s| node_page(s, cursor, NODE_PAGE_SIZE))
                .await?;

            let Some(last_key) = page.last_key else {
                break;
            };
            for unit in page.units.into_iter().filter(|u| u.published) {
                visit(unit).await?;
            }
            if !page.more {
                break;
            }
            after = Some(last_key);
        }
        Ok(())
    }
}

#[async_trait]
impl IndexQueue for StrataStore {
    async fn enqueue(&self, requests: Vec<VectorRequest>) -> Result<()> {
        self.call(move |s| {
            for req in requests {
                let key = queue_key(&req);
                kv_put(s, key, serde_json::to_string(&req)?)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| BridgeError::QueueUnreachable(e.to_string()))
    }
}

#[async_trait]
impl AppSettingsSource for StrataStore {
    async fn mcp_server_settings(&self, kb_id: &str) -> Result<McpServerSettings> {
        match self.get(kb_id, SETTING_MCP_SERVER).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(McpServerSettings::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VectorAction;
    use futures::future::BoxFuture;
    use std::sync::{Arc, Mutex};

    fn model(id: &str, model_type: ModelType, active: bool) -> Model {
        let mut m = Model::managed(model_type, id, "http://models.local", "key");
        m.id = id.to_string();
        m.is_active = active;
        m
    }

    #[tokio::test]
    async fn settings_roundtrip_per_scope() {
        let store = StrataStore::cache().unwrap();
        assert_eq!(store.get("", "k").await.unwrap(), None);

        store.upsert("", "k", "{\"a\":1}", "global").await.unwrap();
        store.upsert("kb1", "k", "{\"a\":2}", "scoped").await.unwrap();

        assert_eq!(store.get("", "k").await.unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(store.get("kb1", "k").await.unwrap().as_deref(), Some("{\"a\":2}"));
    }

    #[tokio::test]
    async fn active_model_lookup_treats_ambiguity_as_none() {
        let store = StrataStore::cache().unwrap();
        store.create(&model("e1", ModelType::Embedding, true)).await.unwrap();
        store.create(&model("r1", ModelType::Rerank, true)).await.unwrap();
        store.create(&model("r2", ModelType::Rerank, true)).await.unwrap();
        store.create(&model("a1", ModelType::Analysis, false)).await.unwrap();

        let embedding = store.get_active_by_type(ModelType::Embedding).await.unwrap();
        assert_eq!(embedding.map(|m| m.id), Some("e1".to_string()));
        assert!(store.get_active_by_type(ModelType::Rerank).await.unwrap().is_none());
        assert!(store.get_active_by_type(ModelType::Analysis).await.unwrap().is_none());
        assert_eq!(store.list_models().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn model_update_applies_present_fields() {
        let store = StrataStore::cache().unwrap();
        store.create(&model("e1", ModelType::Embedding, true)).await.unwrap();

        let updated = store
            .update(&UpdateModelReq {
                id: "e1".to_string(),
                api_key: Some("new".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.api_key, "new");
        assert_eq!(updated.base_url, "http://models.local");

        let missing = store
            .update(&UpdateModelReq {
                id: "nope".to_string(),
                ..Default::default()
            })
            .await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn usage_is_added_to_stored_counters() {
        let store = StrataStore::cache().unwrap();
        store.create(&model("c1", ModelType::Chat, true)).await.unwrap();
        let usage = TokenUsage {
            prompt_tokens: 12,
            completion_tokens: 30,
            total_tokens: 42,
        };

        store.update_usage("c1", &usage).await.unwrap();
        let updated = store.update_usage("c1", &usage).await.unwrap();
        assert_eq!(updated.prompt_tokens, 24);
        assert_eq!(updated.completion_tokens, 60);
        assert_eq!(updated.total_tokens, 84);

        let stored = store.get_active_by_type(ModelType::Chat).await.unwrap().unwrap();
        assert_eq!(stored.total_tokens, 84);
        assert!(store.update_usage("nope", &usage).await.is_err());
    }

    #[tokio::test]
    async fn cursor_visits_every_published_unit_once() {
        let store = StrataStore::cache().unwrap();
        for i in 0..(NODE_PAGE_SIZE * 2 + 7) {
            store
                .put_content_unit(&ContentUnit {
                    id: format!("n{:04}", i),
                    kb_id: "kb1".to_string(),
                    published: i % 10 != 0,
                })
                .await
                .unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut visit = move |unit: ContentUnit| -> BoxFuture<'static, Result<()>> {
            sink.lock().unwrap().push(unit.id);
            Box::pin(async { Ok(()) })
        };
        store.for_each_published(&mut visit).await.unwrap();

        let seen = seen.lock().unwrap();
        let mut deduped = seen.clone();
        deduped.dedup();
        assert_eq!(seen.len(), deduped.len());
        assert_eq!(seen.len(), 207 - 21);
    }

    #[tokio::test]
    async fn duplicate_enqueues_collapse() {
        let store = StrataStore::cache().unwrap();
        let unit = ContentUnit {
            id: "n1".to_string(),
            kb_id: "kb1".to_string(),
            published: true,
        };
        store.enqueue(vec![VectorRequest::upsert(&unit)]).await.unwrap();
        store.enqueue(vec![VectorRequest::upsert(&unit)]).await.unwrap();

        let pending = store.pending_index_requests().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action, VectorAction::Upsert);

        let taken = store.take_index_requests(10).await.unwrap();
        assert_eq!(taken.len(), 1);
        assert!(store.pending_index_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_app_settings_mean_disabled() {
        let store = StrataStore::cache().unwrap();
        let settings = store.mcp_server_settings("kb1").await.unwrap();
        assert!(!settings.is_enabled);
    }

    #[tokio::test]
    async fn opens_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = StrataStore::open(dir.path()).unwrap();
        store.upsert("", "k", "v", "d").await.unwrap();
        assert_eq!(store.get("", "k").await.unwrap().as_deref(), Some("v"));
    }
}
