use std::{collections::HashSet, path::PathBuf};

use blob_store::ByteStore;

use crate::{config::ConversionConfig, key_mapper::PathSegments};

/// Resolved locations for one conversion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionPlan {
    pub output: PathSegments,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

/// Decides which stored items get a derived artifact and where it goes.
#[derive(Debug, Clone)]
pub struct ConversionPolicy {
    category: String,
    allowed_extensions: HashSet<String>,
    derived_extension: String,
}

impl ConversionPolicy {
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            category: config.category.clone(),
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|ext| ext.to_ascii_lowercase())
                .collect(),
            derived_extension: config.derived_extension.to_ascii_lowercase(),
        }
    }

    pub fn is_eligible(&self, path: &PathSegments) -> bool {
        path.category() == self.category &&
            path
                .extension()
                .is_some_and(|ext| self.allowed_extensions.contains(ext))
    }

    /// `None` when the item does not qualify, when the artifact would
    /// overwrite the item itself, or when the store has no local files.
    pub fn plan(&self, path: &PathSegments, store: &dyn ByteStore) -> Option<ConversionPlan> {
        if !self.is_eligible(path) {
            return None;
        }
        let output = path.with_extension(&self.derived_extension)?;
        if &output == path {
            return None;
        }
        let input_path = store.local_path(&path.to_string())?;
        let output_path = store.local_path(&output.to_string())?;
        Some(ConversionPlan {
            output,
            input_path,
            output_path,
        })
    }
}
