//! Schema-version migrations for materialized documents.
//!
//! Clients stamp mutations with the schema version their documents were
//! written against (`_schemaVersion`). When the server knows a newer
//! shape, the registered stepwise `v -> v+1` functions bring the
//! materialized document up to date before it is stored. A missing step
//! fails the mutation with a clear error; there is no downgrade path.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Result, ServerError};

/// One migration step over a materialized document.
pub type MigrationStep = fn(Value) -> Result<Value>;

/// Registered migrations for one collection.
pub struct SchemaMigrations {
    latest: u32,
    steps: HashMap<u32, MigrationStep>,
}

impl SchemaMigrations {
    /// Declare the latest schema version the server stores.
    pub fn new(latest: u32) -> Self {
        Self {
            latest,
            steps: HashMap::new(),
        }
    }

    /// Register the step migrating documents from `from` to `from + 1`.
    pub fn step(mut self, from: u32, step: MigrationStep) -> Self {
        self.steps.insert(from, step);
        self
    }

    pub fn latest(&self) -> u32 {
        self.latest
    }

    /// Run the steps from the document's version up to the latest.
    ///
    /// A document without a version claim is assumed current.
    pub fn migrate(&self, doc: Value, from: Option<u32>) -> Result<Value> {
        let Some(mut version) = from else {
            return Ok(doc);
        };

        if version > self.latest {
            return Err(ServerError::InvalidRequest(format!(
                "Document schema version {} is newer than the server's {}",
                version, self.latest
            )));
        }

        let mut doc = doc;
        while version < self.latest {
            let Some(step) = self.steps.get(&version) else {
                return Err(ServerError::MissingMigration { from: version });
            };
            doc = step(doc)?;
            version += 1;
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_done_flag(mut doc: Value) -> Result<Value> {
        if let Some(fields) = doc.as_object_mut() {
            fields.entry("done").or_insert(json!(false));
        }
        Ok(doc)
    }

    fn rename_text_to_title(mut doc: Value) -> Result<Value> {
        if let Some(fields) = doc.as_object_mut() {
            if let Some(text) = fields.remove("text") {
                fields.insert("title".to_string(), text);
            }
        }
        Ok(doc)
    }

    #[test]
    fn test_migrate_runs_steps_in_order() {
        let migrations = SchemaMigrations::new(3)
            .step(1, add_done_flag)
            .step(2, rename_text_to_title);

        let migrated = migrations
            .migrate(json!({ "id": "t1", "text": "hi" }), Some(1))
            .unwrap();

        assert_eq!(
            migrated,
            json!({ "id": "t1", "title": "hi", "done": false })
        );
    }

    #[test]
    fn test_current_version_is_untouched() {
        let migrations = SchemaMigrations::new(2).step(1, add_done_flag);

        let doc = json!({ "id": "t1" });
        assert_eq!(migrations.migrate(doc.clone(), Some(2)).unwrap(), doc);
        assert_eq!(migrations.migrate(doc.clone(), None).unwrap(), doc);
    }

    #[test]
    fn test_missing_step_fails() {
        let migrations = SchemaMigrations::new(3).step(1, add_done_flag);

        let err = migrations
            .migrate(json!({ "id": "t1" }), Some(1))
            .unwrap_err();

        assert!(matches!(err, ServerError::MissingMigration { from: 2 }));
    }

    #[test]
    fn test_future_version_is_rejected() {
        let migrations = SchemaMigrations::new(1);

        let err = migrations
            .migrate(json!({ "id": "t1" }), Some(5))
            .unwrap_err();

        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }
}
