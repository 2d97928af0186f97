use trafficredirect_controller_core::RULE_NAMESPACE;
use trafficredirect_controller_k8s_api::{
    self as k8s, Api, DeleteParams, ErrorResponse, PostParams, Rule,
};

/// Reads and writes rule records in the rule namespace.
#[async_trait::async_trait]
pub trait RuleStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Rule>, StoreError>;

    async fn create(&self, rule: &Rule) -> Result<(), StoreError>;

    /// Replaces an existing rule. The rule's metadata must identify the
    /// existing record.
    async fn replace(&self, rule: &Rule) -> Result<(), StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rule not found")]
    NotFound,

    #[error("rule already exists")]
    AlreadyExists,

    #[error("rule was modified concurrently")]
    Conflict,

    #[error("rule has no name")]
    MissingName,

    #[error(transparent)]
    Api(#[from] k8s::Error),
}

/// A [`RuleStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeRuleStore {
    api: Api<Rule>,
    post: PostParams,
}

// === impl StoreError ===

impl StoreError {
    fn from_api(error: k8s::Error) -> Self {
        if let k8s::Error::Api(ErrorResponse { code, reason, .. }) = &error {
            match (*code, reason.as_str()) {
                (404, _) => return Self::NotFound,
                (409, "AlreadyExists") => return Self::AlreadyExists,
                (409, _) => return Self::Conflict,
                _ => {}
            }
        }
        Self::Api(error)
    }
}

// === impl KubeRuleStore ===

impl KubeRuleStore {
    pub fn new(client: k8s::Client, field_manager: impl ToString) -> Self {
        Self {
            api: Api::namespaced(client, RULE_NAMESPACE),
            post: PostParams {
                field_manager: Some(field_manager.to_string()),
                ..Default::default()
            },
        }
    }
}

#[async_trait::async_trait]
impl RuleStore for KubeRuleStore {
    async fn get(&self, name: &str) -> Result<Option<Rule>, StoreError> {
        self.api.get_opt(name).await.map_err(StoreError::from_api)
    }

    async fn create(&self, rule: &Rule) -> Result<(), StoreError> {
        self.api
            .create(&self.post, rule)
            .await
            .map_err(StoreError::from_api)?;
        Ok(())
    }

    async fn replace(&self, rule: &Rule) -> Result<(), StoreError> {
        let name = rule.metadata.name.as_deref().ok_or(StoreError::MissingName)?;
        self.api
            .replace(name, &self.post, rule)
            .await
            .map_err(StoreError::from_api)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(StoreError::from_api)?;
        Ok(())
    }
}

impl std::fmt::Debug for KubeRuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeRuleStore")
            .field("namespace", &RULE_NAMESPACE)
            .finish_non_exhaustive()
    }
}
