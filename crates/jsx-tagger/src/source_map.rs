use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Source coordinates recorded for one tagged element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsxLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
    #[serde(rename = "elementName")]
    pub element_name: String,
}

/// In-memory id -> location registry, shared between the transform and the
/// HTTP query surface.
///
/// The transform replaces a file's entries wholesale on every re-transform;
/// HTTP readers may observe the map before or after a replacement, but never
/// a torn entry.
#[derive(Debug, Default)]
pub struct SourceMapManager {
    entries: DashMap<String, JsxLocation>,
}

impl SourceMapManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything previously recorded for `file`, then record the
    /// freshly collected entries for it.
    pub fn replace_file(&self, file: &str, entries: Vec<(String, JsxLocation)>) {
        self.entries.retain(|_, loc| loc.file != file);
        for (id, loc) in entries {
            self.entries.insert(id, loc);
        }
    }

    pub fn record(&self, id: String, location: JsxLocation) {
        self.entries.insert(id, location);
    }

    pub fn get(&self, id: &str) -> Option<JsxLocation> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// All entries for one file, as `(id, location)` pairs.
    pub fn entries_for_file(&self, file: &str) -> Vec<(String, JsxLocation)> {
        self.entries
            .iter()
            .filter(|e| e.value().file == file)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Snapshot of the whole map.
    pub fn snapshot(&self) -> HashMap<String, JsxLocation> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(file: &str, line: u32) -> JsxLocation {
        JsxLocation {
            file: file.to_string(),
            line,
            column: 0,
            element_name: "div".to_string(),
        }
    }

    #[test]
    fn replace_file_drops_only_that_file() {
        let map = SourceMapManager::new();
        map.record("a1".into(), loc("/src/A.tsx", 1));
        map.record("a2".into(), loc("/src/A.tsx", 2));
        map.record("b1".into(), loc("/src/B.tsx", 1));

        map.replace_file("/src/A.tsx", vec![("a3".into(), loc("/src/A.tsx", 3))]);

        assert!(map.get("a1").is_none());
        assert!(map.get("a2").is_none());
        assert_eq!(map.get("a3").unwrap().line, 3);
        assert_eq!(map.get("b1").unwrap().line, 1);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn entries_for_file_filters() {
        let map = SourceMapManager::new();
        map.record("a1".into(), loc("/src/A.tsx", 1));
        map.record("b1".into(), loc("/src/B.tsx", 1));

        let a = map.entries_for_file("/src/A.tsx");
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].0, "a1");
    }
}
