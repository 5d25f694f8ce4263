//! Per-item record store shared by the step controller and the report synchronizer.
//!
//! Records are keyed by the item's fullname; step-scoped records use
//! `<fullname>_<step>`. Entries are created lazily, live for the whole session
//! and are only ever mutated, never removed.

use std::collections::BTreeMap;

use crate::core::types::Attachment;

/// Mutable reporting state of one test item or step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemRecord {
    /// Accumulated HTML comment rows.
    pub comment: String,
    /// Free-form details, `<br>`-separated.
    pub description: String,
    /// Single attachment set through item metadata.
    pub attachment: Option<Attachment>,
    /// Attachments collected by checks of the method-level block.
    pub case_attachments: Vec<Attachment>,
    /// Attachments collected by checks of a numbered step.
    pub step_attachments: Vec<Attachment>,
    /// `Some(true)` once the item/step was blocked; `None` when unset or cleared.
    pub blocked: Option<bool>,
    /// Set once the step controller has published this record itself.
    ///
    /// `Session` never reports step records on its own; callers driving
    /// `MetaBlock` directly read this to avoid publishing a step twice.
    pub done: bool,
    /// Running check counter used for check signatures.
    pub numchecks: u32,
    last_failure_id: Option<u64>,
}

impl ItemRecord {
    pub fn is_blocked(&self) -> bool {
        self.blocked == Some(true)
    }

    pub fn append_comment(&mut self, fragment: &str) {
        self.comment.push_str(fragment);
    }

    pub fn append_description(&mut self, description: &str) {
        if self.description.is_empty() {
            self.description = description.to_string();
        } else {
            self.description.push_str("<br>");
            self.description.push_str(description);
        }
    }

    /// Remember a failure as reported; returns false if this exact failure was seen before.
    pub fn register_failure(&mut self, failure_id: u64) -> bool {
        if self.last_failure_id == Some(failure_id) {
            return false;
        }
        self.last_failure_id = Some(failure_id);
        true
    }
}

/// Session-wide record store.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    records: BTreeMap<String, ItemRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry key of a step-scoped record.
    pub fn step_key(fullname: &str, step: u32) -> String {
        format!("{fullname}_{step}")
    }

    /// Registry key for a block: the item itself, or one of its steps.
    pub fn block_key(fullname: &str, step: Option<u32>) -> String {
        match step {
            Some(step) => Self::step_key(fullname, step),
            None => fullname.to_string(),
        }
    }

    /// Reset an item's record (collection time).
    pub fn reset(&mut self, key: &str) {
        self.records.insert(key.to_string(), ItemRecord::default());
    }

    pub fn entry(&mut self, key: &str) -> &mut ItemRecord {
        self.records.entry(key.to_string()).or_default()
    }

    pub fn get(&self, key: &str) -> Option<&ItemRecord> {
        self.records.get(key)
    }

    /// Step-scoped records of an item, in key order.
    pub fn sub_records<'a>(
        &'a self,
        fullname: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a ItemRecord)> + 'a {
        self.records
            .iter()
            .filter(move |(key, _)| is_step_key_of(key, fullname))
            .map(|(key, record)| (key.as_str(), record))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn is_step_key_of(key: &str, fullname: &str) -> bool {
    key.strip_prefix(fullname)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|step| !step.is_empty() && step.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_created_lazily() {
        let mut registry = Registry::new();
        assert!(registry.get("a.rs::test_T1").is_none());
        registry.entry("a.rs::test_T1").append_comment("x");
        assert_eq!(registry.get("a.rs::test_T1").expect("record").comment, "x");
    }

    #[test]
    fn sub_records_only_match_step_keys() {
        let mut registry = Registry::new();
        registry.reset("a.rs::test_a");
        registry.entry(&Registry::step_key("a.rs::test_a", 2));
        registry.entry(&Registry::step_key("a.rs::test_a", 1));
        registry.entry("a.rs::test_a_b");
        registry.entry("a.rs::test_ab_1");

        let keys: Vec<&str> = registry
            .sub_records("a.rs::test_a")
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["a.rs::test_a_1", "a.rs::test_a_2"]);
    }

    #[test]
    fn failures_are_registered_once() {
        let mut record = ItemRecord::default();
        assert!(record.register_failure(7));
        assert!(!record.register_failure(7));
        assert!(record.register_failure(8));
    }

    #[test]
    fn descriptions_are_joined_with_breaks() {
        let mut record = ItemRecord::default();
        record.append_description("first");
        record.append_description("second");
        assert_eq!(record.description, "first<br>second");
    }
}
