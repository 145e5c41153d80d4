//! Model alias resolution.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{Catalog, OverrideConfig, ProviderRecord};

/// One dispatchable (provider, provider-model, override) target.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: Arc<ProviderRecord>,
    pub provider_model: String,
    pub overrides: OverrideConfig,
    pub mapping_id: i64,
}

/// Resolves aliases against the cached catalog.
pub struct ModelRouter {
    catalog: Arc<Catalog>,
}

impl ModelRouter {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Ordered candidate list for an alias: the default mapping first, then
    /// order_index ascending. Mappings whose provider is disabled are
    /// treated as absent.
    pub async fn candidates(&self, alias: &str) -> Result<Vec<Candidate>> {
        let snapshot = self.catalog.snapshot().await;

        let candidates: Vec<Candidate> = snapshot
            .mappings_for(alias)
            .iter()
            .filter_map(|mapping| {
                let provider = snapshot.provider(mapping.provider_id)?;
                if !provider.enabled {
                    return None;
                }
                Some(Candidate {
                    provider,
                    provider_model: mapping.provider_model.clone(),
                    overrides: mapping.overrides.clone(),
                    mapping_id: mapping.id,
                })
            })
            .collect();

        if candidates.is_empty() {
            return Err(Error::ModelNotFound {
                model: alias.to_string(),
            });
        }
        Ok(candidates)
    }

    /// Distinct aliases for /v1/models.
    pub async fn aliases(&self) -> Vec<String> {
        self.catalog.snapshot().await.aliases()
    }
}
