use std::sync::Arc;

use crate::constants::{AUTO_MODEL, DEFAULT_MODEL_POOL};
use crate::types::{ParleyError, Result};

/// Caller's model request, resolved once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChoice {
    Auto,
    Explicit(String),
}

impl ModelChoice {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => ModelChoice::Auto,
            Some(m) if m.eq_ignore_ascii_case(AUTO_MODEL) => ModelChoice::Auto,
            Some(m) => ModelChoice::Explicit(m.to_string()),
        }
    }
}

/// Model ids end up in the upstream URL path, so only `[A-Za-z0-9._-]` is allowed.
pub fn is_valid_model_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Ranked model variants, most capable first. Never empty.
#[derive(Debug, Clone)]
pub struct ModelPool {
    models: Arc<[String]>,
}

impl ModelPool {
    pub fn new<I, S>(models: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut deduped: Vec<String> = Vec::new();
        for model in models {
            let model = model.into().trim().to_string();
            if model.is_empty() {
                continue;
            }
            if !is_valid_model_id(&model) {
                return Err(ParleyError::Configuration(format!(
                    "Invalid model id '{}' in pool",
                    model
                ))
                .into());
            }
            if !deduped.contains(&model) {
                deduped.push(model);
            }
        }
        if deduped.is_empty() {
            return Err(ParleyError::Configuration("Model pool cannot be empty".into()).into());
        }
        Ok(Self {
            models: deduped.into(),
        })
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn candidates(&self, choice: &ModelChoice) -> CandidateList {
        let mut ordered: Vec<String> = Vec::with_capacity(self.models.len() + 1);
        if let ModelChoice::Explicit(id) = choice {
            ordered.push(id.clone());
        }
        for model in self.models.iter() {
            if !ordered.contains(model) {
                ordered.push(model.clone());
            }
        }
        CandidateList { models: ordered }
    }
}

impl Default for ModelPool {
    fn default() -> Self {
        Self {
            models: DEFAULT_MODEL_POOL.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// Ordered, de-duplicated attempt list for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateList {
    models: Vec<String>,
}

impl CandidateList {
    pub fn as_slice(&self) -> &[String] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn first(&self) -> &str {
        // pools are non-empty by construction
        self.models.first().map(String::as_str).unwrap_or(AUTO_MODEL)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(String::as_str)
    }
}
