//! Reading flag data files into change-sets.
//!
//! Sources may be JSON or YAML. The syntax is picked from the content: a
//! document whose first non-blank character is `{` is JSON, anything else is
//! read as YAML.

use crate::config::{DuplicateKeysHandling, FileSource, FileSourceConfig};
use crate::error::{SyncError, SyncResult};
use flagsync_protocol::{ChangeSet, Selector, Update};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind name for flags.
pub const FLAG_KIND: &str = "flag";
/// Kind name for segments.
pub const SEGMENT_KIND: &str = "segment";

/// On-disk document shape. All sections are optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlagFile {
    #[serde(default)]
    flags: BTreeMap<String, Value>,
    #[serde(default)]
    flag_values: BTreeMap<String, Value>,
    #[serde(default)]
    segments: BTreeMap<String, Value>,
}

/// Syntax of a flag data document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

impl Format {
    fn detect(text: &str) -> Self {
        if text.trim_start().starts_with('{') {
            Format::Json
        } else {
            Format::Yaml
        }
    }
}

/// Collects updates, applying the duplicate key policy.
struct DataBuilder {
    duplicate_keys: DuplicateKeysHandling,
    seen: HashSet<(&'static str, String)>,
    updates: Vec<Update>,
}

impl DataBuilder {
    fn new(duplicate_keys: DuplicateKeysHandling) -> Self {
        Self {
            duplicate_keys,
            seen: HashSet::new(),
            updates: Vec::new(),
        }
    }

    fn add(
        &mut self,
        source: &FileSource,
        kind: &'static str,
        key: &str,
        version: u64,
        object: Value,
    ) -> SyncResult<()> {
        if !self.seen.insert((kind, key.to_string())) {
            return match self.duplicate_keys {
                DuplicateKeysHandling::Ignore => Ok(()),
                DuplicateKeysHandling::Fail => Err(SyncError::file_data(
                    source.name(),
                    format!("in {kind}, key \"{key}\" was already defined"),
                )),
            };
        }
        self.updates.push(Update::put(kind, key, version, object));
        Ok(())
    }
}

/// Loads all configured sources. Each load gets the next version number.
#[derive(Debug)]
pub(crate) struct DataLoader {
    sources: Vec<FileSource>,
    duplicate_keys: DuplicateKeysHandling,
    should_persist: bool,
    last_version: AtomicU64,
}

impl DataLoader {
    pub(crate) fn new(config: &FileSourceConfig) -> Self {
        Self {
            sources: config.sources.clone(),
            duplicate_keys: config.duplicate_keys,
            should_persist: config.should_persist,
            last_version: AtomicU64::new(0),
        }
    }

    /// Reads and parses every source into one full change-set.
    pub(crate) fn load(&self) -> SyncResult<ChangeSet> {
        let version = self.last_version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut builder = DataBuilder::new(self.duplicate_keys);

        for source in &self.sources {
            let file = parse(source)?;
            for (key, value) in file.flags {
                let object = stamp(source, FLAG_KIND, &key, value, version)?;
                builder.add(source, FLAG_KIND, &key, version, object)?;
            }
            for (key, value) in file.flag_values {
                let object = flag_with_value(&key, value, version);
                builder.add(source, FLAG_KIND, &key, version, object)?;
            }
            for (key, value) in file.segments {
                let object = stamp(source, SEGMENT_KIND, &key, value, version)?;
                builder.add(source, SEGMENT_KIND, &key, version, object)?;
            }
        }

        // File data has no selector.
        Ok(ChangeSet::full(builder.updates, Selector::empty()).with_persist(self.should_persist))
    }
}

fn parse(source: &FileSource) -> SyncResult<FlagFile> {
    let text = match source {
        FileSource::Path(path) => std::fs::read_to_string(path)
            .map_err(|e| SyncError::file_data(source.name(), format!("failed to read: {e}")))?,
        FileSource::Resource { contents, .. } => contents.clone(),
    };
    let parsed: Result<FlagFile, String> = match Format::detect(&text) {
        Format::Json => serde_json::from_str(&text).map_err(|e| e.to_string()),
        Format::Yaml => serde_yaml::from_str(&text).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| SyncError::file_data(source.name(), format!("failed to parse: {e}")))
}

/// Sets the load version, and the key if missing, on a flag or segment object.
fn stamp(
    source: &FileSource,
    kind: &str,
    key: &str,
    value: Value,
    version: u64,
) -> SyncResult<Value> {
    let Value::Object(mut object) = value else {
        return Err(SyncError::file_data(
            source.name(),
            format!("{kind} \"{key}\" is not a JSON object"),
        ));
    };
    object
        .entry("key")
        .or_insert_with(|| Value::String(key.to_string()));
    object.insert("version".to_string(), Value::from(version));
    Ok(Value::Object(object))
}

/// Builds a flag that is on and always serves `value`.
fn flag_with_value(key: &str, value: Value, version: u64) -> Value {
    let mut object = Map::new();
    object.insert("key".to_string(), Value::String(key.to_string()));
    object.insert("on".to_string(), Value::Bool(true));
    object.insert("variations".to_string(), Value::Array(vec![value]));
    object.insert("fallthrough".to_string(), json!({"variation": 0}));
    object.insert("offVariation".to_string(), Value::from(0));
    object.insert("version".to_string(), Value::from(version));
    Value::Object(object)
}
