//! Chain template registry: resolves a template name into a runnable chain.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::TaskChain;
use crate::error::{AdmissionError, ChainError};

/// A request to build a chain, as carried by a queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRequest {
    #[serde(rename = "task_template_name")]
    pub template_name: String,
    #[serde(default)]
    pub user_parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Identifier override; the factory generates one when absent.
    #[serde(rename = "uuid", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ChainRequest {
    pub fn new(template_name: impl Into<String>) -> Self {
        Self {
            template_name: template_name.into(),
            user_parameters: serde_json::Value::Null,
            tags: None,
            id: None,
        }
    }

    pub fn with_parameters(mut self, user_parameters: serde_json::Value) -> Self {
        self.user_parameters = user_parameters;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A named chain definition.
pub trait ChainTemplate: Send + Sync {
    fn name(&self) -> &str;

    /// Tags used to narrow lookups when several templates share a name.
    fn tags(&self) -> &[String] {
        &[]
    }

    /// Kinds of task the chain runs; checked against agent restrictions.
    fn task_kinds(&self) -> Vec<String>;

    fn build(&self, user_parameters: &serde_json::Value) -> Result<Arc<dyn TaskChain>, ChainError>;
}

/// A freshly built chain with its factory-assigned identifier.
pub struct BuiltChain {
    pub id: String,
    pub task_kinds: Vec<String>,
    pub chain: Arc<dyn TaskChain>,
}

/// Resolves chain requests into executable chains.
#[async_trait]
pub trait ChainFactory: Send + Sync {
    async fn build(&self, request: &ChainRequest) -> Result<BuiltChain, AdmissionError>;
}

/// Registry of chain templates, keyed by name.
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, Vec<Arc<dyn ChainTemplate>>>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with the built-in templates.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        super::builtin::register_builtins(&registry);
        registry
    }

    pub async fn register(&self, template: Arc<dyn ChainTemplate>) {
        let name = template.name().to_string();
        self.templates
            .write()
            .await
            .entry(name.clone())
            .or_default()
            .push(template);
        tracing::debug!("Registered chain template: {}", name);
    }

    /// Register a template (sync version for startup).
    pub fn register_sync(&self, template: Arc<dyn ChainTemplate>) {
        let name = template.name().to_string();
        if let Ok(mut templates) = self.templates.try_write() {
            templates.entry(name.clone()).or_default().push(template);
            tracing::debug!("Registered chain template: {}", name);
        }
    }

    /// Find the first template with `name` carrying every tag in `tags`.
    pub async fn find(&self, name: &str, tags: &[String]) -> Option<Arc<dyn ChainTemplate>> {
        self.templates
            .read()
            .await
            .get(name)?
            .iter()
            .find(|template| tags.iter().all(|tag| template.tags().contains(tag)))
            .cloned()
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.templates
            .try_read()
            .map(|t| t.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainFactory for TemplateRegistry {
    async fn build(&self, request: &ChainRequest) -> Result<BuiltChain, AdmissionError> {
        let tags = request.tags.as_deref().unwrap_or_default();
        let template = self.find(&request.template_name, tags).await.ok_or_else(|| {
            AdmissionError::TemplateNotFound {
                name: request.template_name.clone(),
            }
        })?;

        let chain = template
            .build(&request.user_parameters)
            .map_err(|e| AdmissionError::Build {
                name: request.template_name.clone(),
                reason: e.to_string(),
            })?;

        Ok(BuiltChain {
            id: Uuid::new_v4().to_string(),
            task_kinds: template.task_kinds(),
            chain,
        })
    }
}
