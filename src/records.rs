//! # Record Store Lookups
//!
//! Thin request/response access to one table of records: a point query by
//! the table's key attribute and AND-combined equality scans.
//!
//! ## Scan rules:
//! - Between one and four predicates, otherwise a validation error
//! - A predicate matches when the record's attribute, rendered as a string,
//!   equals the predicate value

use crate::config::RecordsConfig;
use crate::error::{AppError, AppResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

pub type Record = Map<String, Value>;

pub const MAX_PREDICATES: usize = 4;

/// `attribute == value`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub attribute: String,
    pub value: String,
}

impl Predicate {
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    fn matches(&self, record: &Record) -> bool {
        match record.get(&self.attribute) {
            Some(Value::String(text)) => *text == self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    fn table(&self) -> &str;

    async fn get(&self, key: &str) -> AppResult<Option<Record>>;

    async fn scan(&self, predicates: &[Predicate]) -> AppResult<Vec<Record>>;
}

pub fn check_predicates(predicates: &[Predicate]) -> AppResult<()> {
    if predicates.is_empty() || predicates.len() > MAX_PREDICATES {
        return Err(AppError::ValidationError(format!(
            "a scan takes between 1 and {} predicates, got {}",
            MAX_PREDICATES,
            predicates.len()
        )));
    }
    Ok(())
}

pub struct InMemoryRecordStore {
    table: String,
    key_attribute: String,
    records: Vec<Record>,
}

impl InMemoryRecordStore {
    pub fn new(config: &RecordsConfig, records: Vec<Record>) -> Self {
        Self {
            table: config.table.clone(),
            key_attribute: config.key_attribute.clone(),
            records,
        }
    }

    /// Load the table from `config.seed_file`, a JSON array of objects.
    pub fn from_file(config: &RecordsConfig) -> Result<Self> {
        let raw = std::fs::read_to_string(&config.seed_file)
            .with_context(|| format!("failed to read record seed file {}", config.seed_file))?;
        let records: Vec<Record> = serde_json::from_str(&raw)
            .with_context(|| format!("record seed file {} is not a JSON array of objects", config.seed_file))?;

        info!(table = %config.table, count = records.len(), "Record store loaded");
        Ok(Self::new(config, records))
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn get(&self, key: &str) -> AppResult<Option<Record>> {
        let lookup = Predicate::new(self.key_attribute.as_str(), key);
        Ok(self.records.iter().find(|record| lookup.matches(record)).cloned())
    }

    async fn scan(&self, predicates: &[Predicate]) -> AppResult<Vec<Record>> {
        check_predicates(predicates)?;
        let items: Vec<Record> = self
            .records
            .iter()
            .filter(|record| predicates.iter().all(|p| p.matches(record)))
            .cloned()
            .collect();
        debug!(table = %self.table, predicates = predicates.len(), matched = items.len(), "Record scan");
        Ok(items)
    }
}
