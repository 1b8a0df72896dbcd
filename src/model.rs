//! Model configuration manager.
//!
//! Owns the global model mode setting and keeps the retrieval service in step
//! with it. Propagation is best-effort: every RAG model type is pushed on its
//! own, a failure on one type is logged and recorded in the [`SyncReport`],
//! and the persisted setting is never rolled back.

use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::domain::{
    ContentUnit, Model, ModelMode, ModelModeSetting, ModelType, TokenUsage, UpdateModelReq,
    VectorRequest, DEFAULT_MANAGED_BASE_URL, GLOBAL_SCOPE, SEED_ANALYSIS_MODEL,
    SETTING_MODEL_MODE,
};
use crate::error::{BridgeError, Result};
use crate::rag::RetrievalService;
use crate::store::{ContentCursor, IndexQueue, KnowledgeBaseRepo, ModelRegistry, SettingsStore};

const MODE_SETTING_DESCRIPTION: &str = "Model setting mode configuration";

/// Outcome of pushing one model type to the retrieval service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TypeOutcome {
    Updated { model: String },
    Skipped { reason: String },
    Failed { error: String },
}

/// One entry of a [`SyncReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeReport {
    #[serde(rename = "type")]
    pub model_type: ModelType,
    #[serde(flatten)]
    pub outcome: TypeOutcome,
}

/// What happened to one knowledge base during a reindex.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetOutcome {
    pub kb_id: String,
    /// The new dataset, if one was created and recorded.
    pub dataset_id: Option<String>,
    /// Set when the old dataset could not be deleted or the KB update failed.
    pub error: Option<String>,
}

/// Result of one full reindex pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReindexReport {
    pub datasets: Vec<DatasetOutcome>,
    pub enqueued: usize,
}

/// Per-type results of a propagation run, in propagation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub mode: Option<ModelMode>,
    pub types: Vec<TypeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reindex: Option<ReindexReport>,
    /// Set when the reindex pass itself failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reindex_error: Option<String>,
}

impl SyncReport {
    pub fn outcome(&self, model_type: ModelType) -> Option<&TypeOutcome> {
        self.types
            .iter()
            .find(|r| r.model_type == model_type)
            .map(|r| &r.outcome)
    }

    /// True when no type failed and the reindex, if any, completed.
    pub fn is_clean(&self) -> bool {
        self.reindex_error.is_none()
            && self
                .types
                .iter()
                .all(|r| !matches!(r.outcome, TypeOutcome::Failed { .. }))
    }
}

/// Collaborators the manager drives.
#[derive(Clone)]
pub struct ModelDeps {
    pub settings: Arc<dyn SettingsStore>,
    pub models: Arc<dyn ModelRegistry>,
    pub knowledge_bases: Arc<dyn KnowledgeBaseRepo>,
    pub nodes: Arc<dyn ContentCursor>,
    pub queue: Arc<dyn IndexQueue>,
    pub rag: Arc<dyn RetrievalService>,
}

/// Model configuration manager.
pub struct ModelManager {
    deps: ModelDeps,
    managed_base_url: String,
    /// Serializes read-modify-write of the mode setting.
    setting_lock: Mutex<()>,
    /// Held from persisting a mode change until its propagation finishes, so
    /// the retrieval service sees changes in the order they were stored.
    sync_lock: Mutex<()>,
}

impl ModelManager {
    pub fn new(deps: ModelDeps) -> Self {
        Self::with_managed_base_url(deps, DEFAULT_MANAGED_BASE_URL)
    }

    pub fn with_managed_base_url(deps: ModelDeps, managed_base_url: &str) -> Self {
        Self {
            deps,
            managed_base_url: managed_base_url.to_string(),
            setting_lock: Mutex::new(()),
            sync_lock: Mutex::new(()),
        }
    }

    /// Create the mode setting as manual if it does not exist yet.
    pub async fn ensure_model_mode_setting(&self) -> Result<()> {
        let _guard = self.setting_lock.lock().await;
        if self
            .deps
            .settings
            .get(GLOBAL_SCOPE, SETTING_MODEL_MODE)
            .await?
            .is_some()
        {
            tracing::debug!("model mode setting already exists");
            return Ok(());
        }
        self.store_setting(&ModelModeSetting::initial()).await?;
        tracing::info!("created model mode setting");
        Ok(())
    }

    /// The stored setting, if present and valid.
    ///
    /// Returns [`BridgeError::ConfigInvalid`] when the setting is absent, does
    /// not parse, has no mode, or is in auto mode without an API key. Callers
    /// fall back to manual mode on that error.
    pub async fn get_model_mode_setting(&self) -> Result<ModelModeSetting> {
        let setting = self
            .load_setting()
            .await?
            .ok_or_else(|| BridgeError::ConfigInvalid("model mode setting is absent".to_string()))?;
        setting.validate()?;
        Ok(setting)
    }

    /// Current mode, degrading to manual when the setting is unusable.
    pub async fn effective_mode(&self) -> Result<ModelMode> {
        match self.get_model_mode_setting().await {
            Ok(setting) => setting.validate(),
            Err(BridgeError::ConfigInvalid(reason)) => {
                tracing::debug!(%reason, "falling back to manual mode");
                Ok(ModelMode::Manual)
            }
            Err(e) => Err(e),
        }
    }

    /// Switch between manual and auto mode.
    ///
    /// Switching to the stored mode is a no-op and returns `None`. Otherwise
    /// the new mode is persisted first and then propagated; propagation
    /// problems are reported, not returned as errors.
    pub async fn switch_mode(&self, mode: ModelMode) -> Result<Option<SyncReport>> {
        let _sync = self.sync_lock.lock().await;
        let setting = {
            let _guard = self.setting_lock.lock().await;
            let mut setting = self.load_setting().await?.unwrap_or_default();
            if setting.mode == mode.as_str() {
                tracing::debug!(%mode, "mode unchanged, skipping propagation");
                return Ok(None);
            }
            setting.mode = mode.as_str().to_string();
            self.store_setting(&setting).await?;
            setting
        };

        tracing::info!(%mode, "model mode switched");
        Ok(Some(self.update_rag_models_by_mode(mode, &setting).await))
    }

    /// Force auto mode with a new shared API key.
    ///
    /// A `None` chat model keeps the stored override; `Some("")` clears it.
    pub async fn update_auto_model_setting(
        &self,
        api_key: &str,
        chat_model: Option<&str>,
    ) -> Result<SyncReport> {
        if api_key.is_empty() {
            return Err(BridgeError::MissingArg("api_key".to_string()));
        }

        let _sync = self.sync_lock.lock().await;
        let setting = {
            let _guard = self.setting_lock.lock().await;
            let mut setting = self.load_setting().await?.unwrap_or_default();
            setting.mode = ModelMode::Auto.as_str().to_string();
            setting.auto_mode_api_key = api_key.to_string();
            if let Some(chat_model) = chat_model {
                setting.chat_model = chat_model.to_string();
            }
            self.store_setting(&setting).await?;
            setting
        };

        tracing::info!("auto model setting updated");
        Ok(self
            .update_rag_models_by_mode(ModelMode::Auto, &setting)
            .await)
    }

    /// Push the model of every RAG type to the retrieval service.
    ///
    /// Types are processed in [`ModelType::RAG`] order. A type with no active
    /// model (manual) or whose update fails is recorded and skipped. A full
    /// reindex follows when the embedding model was pushed.
    pub async fn update_rag_models_by_mode(
        &self,
        mode: ModelMode,
        setting: &ModelModeSetting,
    ) -> SyncReport {
        let mut report = SyncReport {
            mode: Some(mode),
            ..Default::default()
        };
        let mut embedding_pushed = false;

        for model_type in ModelType::RAG {
            let model = match self.resolve_model(mode, model_type, setting).await {
                Ok(model) => model,
                Err(outcome) => {
                    report.types.push(TypeReport { model_type, outcome });
                    continue;
                }
            };

            if model_type == ModelType::Embedding {
                embedding_pushed = true;
            }

            let outcome = match self.deps.rag.update_model(&model).await {
                Ok(()) => {
                    tracing::info!(
                        model_type = %model_type,
                        model = %model.model,
                        "updated model in retrieval service"
                    );
                    TypeOutcome::Updated { model: model.model }
                }
                Err(e) => {
                    tracing::error!(
                        model_type = %model_type,
                        model_id = %model.id,
                        error = %e,
                        "failed to update model in retrieval service"
                    );
                    TypeOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            report.types.push(TypeReport { model_type, outcome });
        }

        if embedding_pushed {
            match self.trigger_upsert_records().await {
                Ok(reindex) => report.reindex = Some(reindex),
                Err(e) => {
                    tracing::error!(error = %e, "reindex after model update failed");
                    report.reindex_error = Some(e.to_string());
                }
            }
        }

        report
    }

    /// The model to push for one type, or the outcome explaining why not.
    async fn resolve_model(
        &self,
        mode: ModelMode,
        model_type: ModelType,
        setting: &ModelModeSetting,
    ) -> std::result::Result<Model, TypeOutcome> {
        match mode {
            ModelMode::Manual => match self.deps.models.get_active_by_type(model_type).await {
                Ok(Some(model)) if model.is_active => Ok(model),
                Ok(_) => {
                    tracing::warn!(model_type = %model_type, "no active model found for type");
                    Err(TypeOutcome::Skipped {
                        reason: "no active model".to_string(),
                    })
                }
                Err(e) => {
                    tracing::warn!(
                        model_type = %model_type,
                        error = %e,
                        "failed to get model by type"
                    );
                    Err(TypeOutcome::Failed {
                        error: e.to_string(),
                    })
                }
            },
            ModelMode::Auto => {
                if setting.auto_mode_api_key.is_empty() {
                    tracing::warn!(model_type = %model_type, "auto mode has no API key");
                    return Err(TypeOutcome::Failed {
                        error: "auto mode API key is not set".to_string(),
                    });
                }
                Ok(self.managed_model(model_type, setting))
            }
        }
    }

    fn managed_model(&self, model_type: ModelType, setting: &ModelModeSetting) -> Model {
        let name = match model_type {
            ModelType::Chat => setting.auto_chat_model(),
            other => other.auto_mode_default(),
        };
        Model::managed(
            model_type,
            name,
            &self.managed_base_url,
            &setting.auto_mode_api_key,
        )
    }

    /// Recreate every knowledge base's dataset and queue every published unit.
    ///
    /// Dataset failures are recorded per knowledge base. Only a failure to
    /// list knowledge bases, traverse units, or reach the queue aborts.
    pub async fn trigger_upsert_records(&self) -> Result<ReindexReport> {
        let mut report = ReindexReport::default();

        let kbs = self.deps.knowledge_bases.list_knowledge_bases().await?;
        for kb in kbs {
            report.datasets.push(self.replace_dataset(&kb.id, &kb.dataset_id).await);
        }

        let queue = self.deps.queue.clone();
        let enqueued = Arc::new(AtomicUsize::new(0));
        let counter = enqueued.clone();
        let mut visit = move |unit: ContentUnit| -> BoxFuture<'static, Result<()>> {
            let queue = queue.clone();
            let counter = counter.clone();
            Box::pin(async move {
                queue.enqueue(vec![VectorRequest::upsert(&unit)]).await?;
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        };
        self.deps.nodes.for_each_published(&mut visit).await?;

        report.enqueued = enqueued.load(Ordering::Relaxed);
        tracing::info!(
            knowledge_bases = report.datasets.len(),
            enqueued = report.enqueued,
            "triggered upsert of all records"
        );
        Ok(report)
    }

    /// Create-then-delete so a knowledge base always has a live dataset.
    async fn replace_dataset(&self, kb_id: &str, old_dataset_id: &str) -> DatasetOutcome {
        let mut outcome = DatasetOutcome {
            kb_id: kb_id.to_string(),
            dataset_id: None,
            error: None,
        };

        let new_id = match self.deps.rag.create_dataset().await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(kb_id, error = %e, "create new dataset failed");
                outcome.error = Some(format!("create dataset: {}", e));
                return outcome;
            }
        };

        let mut errors = Vec::new();
        if !old_dataset_id.is_empty() {
            if let Err(e) = self.deps.rag.delete_dataset(old_dataset_id).await {
                tracing::warn!(
                    kb_id,
                    dataset_id = old_dataset_id,
                    error = %e,
                    "delete old dataset failed, leaving it orphaned"
                );
                errors.push(format!("delete dataset {}: {}", old_dataset_id, e));
            }
        }

        match self
            .deps
            .knowledge_bases
            .update_dataset_id(kb_id, &new_id)
            .await
        {
            Ok(()) => outcome.dataset_id = Some(new_id),
            Err(e) => {
                tracing::error!(
                    kb_id,
                    dataset_id = %new_id,
                    error = %e,
                    "update knowledge base dataset id failed"
                );
                errors.push(format!("update dataset id: {}", e));
            }
        }

        if !errors.is_empty() {
            outcome.error = Some(errors.join("; "));
        }
        outcome
    }

    /// Register a model; RAG types are mirrored to the retrieval service.
    pub async fn create_model(&self, mut model: Model) -> Result<Model> {
        if model.model_type.is_rag() {
            model.id = self.deps.rag.add_model(&model).await?;
        } else if model.id.is_empty() {
            model.id = uuid::Uuid::new_v4().to_string();
        }
        self.deps.models.create(&model).await?;
        tracing::info!(model_id = %model.id, model_type = %model.model_type, "model created");

        if model.model_type == ModelType::Embedding {
            self.trigger_upsert_records().await?;
        }
        Ok(model)
    }

    /// Update a registry model and mirror the change.
    pub async fn update_model(&self, req: &UpdateModelReq) -> Result<Model> {
        let stored = self.deps.models.update(req).await?;

        if stored.model_type.is_rag() {
            let mut mirrored = stored.clone();
            // Only analysis models can be toggled off in the retrieval service.
            mirrored.is_active = match stored.model_type {
                ModelType::Analysis | ModelType::AnalysisVl => req.is_active.unwrap_or(true),
                _ => true,
            };
            self.deps.rag.update_model(&mirrored).await?;
        }

        if stored.model_type == ModelType::Embedding {
            self.trigger_upsert_records().await?;
        }
        Ok(stored)
    }

    /// The chat model that serves requests right now.
    pub async fn get_chat_model(&self) -> Result<Option<Model>> {
        let setting = match self.get_model_mode_setting().await {
            Ok(setting) => Some(setting),
            Err(BridgeError::ConfigInvalid(_)) => None,
            Err(e) => return Err(e),
        };
        match setting {
            Some(setting) if setting.mode == ModelMode::Auto.as_str() => {
                Ok(Some(self.managed_model(ModelType::Chat, &setting)))
            }
            _ => self.deps.models.get_active_by_type(ModelType::Chat).await,
        }
    }

    /// Add token usage to a registry model's counters.
    pub async fn update_usage(&self, model_id: &str, usage: &TokenUsage) -> Result<Model> {
        let model = self.deps.models.update_usage(model_id, usage).await?;
        tracing::debug!(
            model_id,
            total_tokens = model.total_tokens,
            "model usage updated"
        );
        Ok(model)
    }

    /// Wait for the retrieval service and seed default models into an empty one.
    ///
    /// Seeded models use `api_key`, falling back to the stored auto mode key.
    /// Without either, seeding is skipped.
    pub async fn init_rag_models(
        &self,
        api_key: Option<&str>,
        attempts: u32,
        backoff: Duration,
    ) -> Result<()> {
        let mut existing = None;
        for attempt in 1..=attempts {
            match self.deps.rag.list_models().await {
                Ok(models) => {
                    existing = Some(models);
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "waiting for retrieval service");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        let existing = existing.ok_or_else(|| {
            BridgeError::upstream("retrieval service", "not ready after retries")
        })?;

        let wanted: &[ModelType] = if existing.is_empty() {
            &[ModelType::Embedding, ModelType::Rerank, ModelType::Analysis]
        } else if existing.iter().any(|m| m.model_type == ModelType::Analysis) {
            &[]
        } else {
            &[ModelType::Analysis]
        };
        if wanted.is_empty() {
            return Ok(());
        }

        let mut setting = self.load_setting().await?.unwrap_or_default();
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            setting.auto_mode_api_key = key.to_string();
        }
        if setting.auto_mode_api_key.is_empty() {
            tracing::warn!("no API key for default models, skipping seeding");
            return Ok(());
        }

        for &model_type in wanted {
            let mut model = self.managed_model(model_type, &setting);
            if model_type == ModelType::Analysis {
                model.model = SEED_ANALYSIS_MODEL.to_string();
            }
            model.id = self.deps.rag.add_model(&model).await?;
            self.deps.models.create(&model).await?;
            tracing::info!(model_type = %model_type, model = %model.model, "seeded default model");
        }
        Ok(())
    }

    async fn load_setting(&self) -> Result<Option<ModelModeSetting>> {
        match self
            .deps
            .settings
            .get(GLOBAL_SCOPE, SETTING_MODEL_MODE)
            .await?
        {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                BridgeError::ConfigInvalid(format!("failed to parse model mode setting: {}", e))
            }),
            None => Ok(None),
        }
    }

    async fn store_setting(&self, setting: &ModelModeSetting) -> Result<()> {
        let value = serde_json::to_string(setting)?;
        self.deps
            .settings
            .upsert(GLOBAL_SCOPE, SETTING_MODEL_MODE, &value, MODE_SETTING_DESCRIPTION)
            .await
    }
}
