//! Column registry: one typed column per flattened key, ids in first-seen order.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use indexmap::IndexMap;

use crate::models::{ChartType, ColumnInfo, MetricError};

#[derive(Debug, Default)]
pub struct ColumnRegistry {
    columns: IndexMap<String, ColumnInfo>,
}

impl ColumnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the column for `key`, creating it with `chart_type` if unseen.
    ///
    /// The boolean is `true` when this call created the column. An existing
    /// column is returned untouched, whatever `chart_type` says.
    pub fn register(
        &mut self,
        key: &str,
        chart_type: ChartType,
        error: Option<MetricError>,
    ) -> (ColumnInfo, bool) {
        if let Some(existing) = self.columns.get(key) {
            return (existing.clone(), false);
        }
        let info = ColumnInfo {
            kid: self.columns.len(),
            key: key.to_string(),
            key_encoded: encode_key(key),
            chart_type,
            section: section_of(key),
            error,
        };
        self.columns.insert(key.to_string(), info.clone());
        (info, true)
    }

    /// Check that a value of `got` may be logged to the existing column `key`.
    pub fn check_type(&self, key: &str, got: ChartType) -> Result<(), MetricError> {
        match self.columns.get(key) {
            Some(column) if column.chart_type != got => Err(MetricError::type_mismatch(
                column.chart_type.type_name(),
                got.type_name(),
            )),
            _ => Ok(()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ColumnInfo> {
        self.columns.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.columns.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Columns in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.values()
    }
}

pub(crate) fn encode_key(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

fn section_of(key: &str) -> Option<String> {
    key.split_once('/')
        .map(|(section, _)| section.trim())
        .filter(|section| !section.is_empty())
        .map(str::to_string)
}
