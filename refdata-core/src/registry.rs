//! Registry of dictionaries this deployment serves

use crate::{DictionaryConfig, NotFoundError, RefdataResult};
use std::collections::HashMap;

/// Enabled dictionaries, looked up case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct DictionaryRegistry {
    by_code: HashMap<String, DictionaryConfig>,
}

impl DictionaryRegistry {
    /// Build from configuration. Disabled entries are dropped.
    pub fn new<'a>(dictionaries: impl IntoIterator<Item = &'a DictionaryConfig>) -> Self {
        let by_code = dictionaries
            .into_iter()
            .filter(|d| d.enabled)
            .map(|d| (d.code.trim().to_uppercase(), d.clone()))
            .collect();
        Self { by_code }
    }

    pub fn get(&self, code: &str) -> Option<&DictionaryConfig> {
        self.by_code.get(&code.trim().to_uppercase())
    }

    /// Like [`get`](Self::get), but a miss is a `NotFoundError::Dictionary`.
    pub fn required(&self, code: &str) -> RefdataResult<&DictionaryConfig> {
        self.get(code).ok_or_else(|| {
            NotFoundError::Dictionary {
                dict_code: code.to_string(),
            }
            .into()
        })
    }

    pub fn is_registered(&self, code: &str) -> bool {
        self.get(code).is_some()
    }

    /// Configured spelling of a dictionary code.
    pub fn canonical_code(&self, code: &str) -> RefdataResult<String> {
        self.required(code).map(|d| d.code.clone())
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.by_code.values().map(|d| d.code.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}
