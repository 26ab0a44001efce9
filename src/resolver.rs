use std::collections::HashMap;

use serde::Deserialize;

use crate::errors::AppError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelMapping {
    pub client_alias: String,
    pub backend_id: String,
}

impl ModelMapping {
    pub fn new(client_alias: impl Into<String>, backend_id: impl Into<String>) -> Self {
        Self {
            client_alias: client_alias.into(),
            backend_id: backend_id.into(),
        }
    }
}

/// Immutable alias table built once at startup and shared across requests.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    mappings: Vec<ModelMapping>,
    by_alias: HashMap<String, usize>,
    by_backend: HashMap<String, usize>,
    passthrough: bool,
}

impl ModelResolver {
    pub fn new(mappings: Vec<ModelMapping>, passthrough: bool) -> Self {
        let mut by_alias = HashMap::with_capacity(mappings.len());
        let mut by_backend = HashMap::with_capacity(mappings.len());
        for (index, mapping) in mappings.iter().enumerate() {
            by_alias.entry(mapping.client_alias.clone()).or_insert(index);
            by_backend.entry(mapping.backend_id.clone()).or_insert(index);
        }

        Self {
            mappings,
            by_alias,
            by_backend,
            passthrough,
        }
    }

    pub fn passthrough(&self) -> bool {
        self.passthrough
    }

    pub fn resolve(&self, client_alias: &str) -> Result<String, AppError> {
        if let Some(index) = self.by_alias.get(client_alias) {
            return Ok(self.mappings[*index].backend_id.clone());
        }
        if self.passthrough {
            return Ok(client_alias.to_owned());
        }
        Err(AppError::UnknownModel(client_alias.to_owned()))
    }

    /// Configured aliases in configuration order.
    pub fn list_client_aliases(&self) -> Vec<&str> {
        self.mappings
            .iter()
            .map(|mapping| mapping.client_alias.as_str())
            .collect()
    }

    pub fn mappings(&self) -> &[ModelMapping] {
        &self.mappings
    }

    /// First alias configured for `backend_id`, if any.
    pub fn alias_for(&self, backend_id: &str) -> Option<&str> {
        self.by_backend
            .get(backend_id)
            .map(|index| self.mappings[*index].client_alias.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(passthrough: bool) -> ModelResolver {
        ModelResolver::new(
            vec![
                ModelMapping::new("mistral:latest", "mistral-7b"),
                ModelMapping::new("mistral:7b", "mistral-7b"),
                ModelMapping::new("mixtral:latest", "mixtral-8x7b"),
            ],
            passthrough,
        )
    }

    #[test]
    fn mapped_aliases_resolve_to_backend_ids() {
        let resolver = resolver(true);
        for mapping in resolver.mappings().to_vec() {
            assert_eq!(
                resolver.resolve(&mapping.client_alias).expect("mapped alias"),
                mapping.backend_id
            );
        }
    }

    #[test]
    fn unmapped_alias_passes_through_unchanged() {
        let resolver = resolver(true);
        for alias in ["unmapped-model", "mistral-7b", "", "qwen2.5-coder:32b"] {
            assert_eq!(resolver.resolve(alias).expect("pass-through"), alias);
        }
    }

    #[test]
    fn unmapped_alias_fails_when_passthrough_disabled() {
        let resolver = resolver(false);
        let error = resolver
            .resolve("unmapped-model")
            .expect_err("unknown model should fail");
        assert!(matches!(error, AppError::UnknownModel(alias) if alias == "unmapped-model"));
        assert_eq!(resolver.resolve("mixtral:latest").expect("mapped"), "mixtral-8x7b");
    }

    #[test]
    fn aliases_are_listed_in_configuration_order() {
        assert_eq!(
            resolver(true).list_client_aliases(),
            vec!["mistral:latest", "mistral:7b", "mixtral:latest"]
        );
    }

    #[test]
    fn reverse_lookup_returns_first_alias() {
        let resolver = resolver(true);
        assert_eq!(resolver.alias_for("mistral-7b"), Some("mistral:latest"));
        assert_eq!(resolver.alias_for("mixtral-8x7b"), Some("mixtral:latest"));
        assert_eq!(resolver.alias_for("phi-3"), None);
    }
}
