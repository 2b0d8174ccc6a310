//! Parent/child provenance for content produced by recursive unpacking.
//!
//! Keys are content names as they will appear on the item. When two children
//! would land on the same key, the later one is stored under an alternate key
//! of the form `parent:fullName`, and if that is taken too, a random suffix
//! is appended. Entries are kept in a `BTreeMap` so serialization is stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Provenance of one unpacked piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageData {
    /// `path + filename` as it appeared inside the parent.
    pub full_name: String,
    /// Key of the parent entry (or the name of the top-level content).
    pub parent_content_name: String,
    /// Whether this entry lives under a disambiguated key.
    pub is_alt_key: bool,
}

/// Map from content key to [`LineageData`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineageMap {
    entries: BTreeMap<String, LineageData>,
}

impl LineageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record `filename` found at `path` inside `parent`; returns the key the
    /// entry was stored under.
    pub fn add(&mut self, filename: &str, path: &str, parent: &str) -> String {
        let full_name = format!("{path}{filename}");

        let key = if !self.entries.contains_key(&full_name) {
            full_name.clone()
        } else {
            let alt = format!("{parent}:{full_name}");
            let mut candidate = alt.clone();
            while self.entries.contains_key(&candidate) {
                candidate = format!("{alt}:{:08x}", rand::random::<u32>());
            }
            candidate
        };

        let is_alt_key = key != full_name;
        self.entries.insert(
            key.clone(),
            LineageData {
                full_name,
                parent_content_name: parent.to_string(),
                is_alt_key,
            },
        );
        key
    }

    pub fn get(&self, key: &str) -> Option<&LineageData> {
        self.entries.get(key)
    }

    /// The entry one level above `key`, if the parent is itself tracked.
    pub fn find_parent_entry(&self, key: &str) -> Option<(&str, &LineageData)> {
        let data = self.entries.get(key)?;
        self.entries
            .get_key_value(&data.parent_content_name)
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Keys from `key` up to the outermost known ancestor, nearest first.
    ///
    /// The final element may be an untracked top-level content name.
    pub fn ancestry(&self, key: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = key;
        while let Some(data) = self.entries.get(current) {
            let parent = data.parent_content_name.as_str();
            if parent == key || chain.iter().any(|seen: &String| seen == parent) {
                break;
            }
            chain.push(parent.to_string());
            current = parent;
        }
        chain
    }

    /// All keys whose full name is `full_name`, primary key first.
    pub fn keys_for_full_name(&self, full_name: &str) -> Vec<&str> {
        let mut keys: Vec<(&String, &LineageData)> = self
            .entries
            .iter()
            .filter(|(_, data)| data.full_name == full_name)
            .collect();
        keys.sort_by_key(|(_, data)| data.is_alt_key);
        keys.into_iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LineageData)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Deterministic JSON snapshot.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_add_uses_full_name() {
        let mut map = LineageMap::new();
        let key = map.add("a.txt", "dir/", "archive.tar");
        assert_eq!(key, "dir/a.txt");
        assert!(!map.get(&key).unwrap().is_alt_key);
    }

    #[test]
    fn same_name_under_different_parents() {
        let mut map = LineageMap::new();
        map.add("p1", "", "root.zip");
        map.add("p2", "", "root.zip");
        let k1 = map.add("a.txt", "", "p1");
        let k2 = map.add("a.txt", "", "p2");

        assert_ne!(k1, k2);
        assert_eq!(k2, "p2:a.txt");
        assert_eq!(map.find_parent_entry(&k1).unwrap().0, "p1");
        assert_eq!(map.find_parent_entry(&k2).unwrap().0, "p2");
        assert_eq!(map.get(&k2).unwrap().full_name, "a.txt");
    }

    #[test]
    fn same_name_under_same_parent_never_overwrites() {
        let mut map = LineageMap::new();
        let k1 = map.add("a.txt", "", "p1");
        let k2 = map.add("a.txt", "", "p1");
        let k3 = map.add("a.txt", "", "p1");

        assert_eq!(map.len(), 3);
        assert_eq!(k2, "p1:a.txt");
        assert!(k3.starts_with("p1:a.txt:"));
        assert_ne!(k1, k3);
        assert_eq!(map.keys_for_full_name("a.txt")[0], "a.txt");
    }

    #[test]
    fn untracked_parent_has_no_entry() {
        let mut map = LineageMap::new();
        let key = map.add("a.txt", "", "outer.zip");
        assert!(map.find_parent_entry(&key).is_none());
        assert!(map.find_parent_entry("missing").is_none());
    }

    #[test]
    fn ancestry_walks_to_the_top() {
        let mut map = LineageMap::new();
        let inner = map.add("inner.tar", "", "outer.zip");
        let nested = map.add("deep.gz", "x/", &inner);
        let leaf = map.add("leaf.txt", "", &nested);
        assert_eq!(
            map.ancestry(&leaf),
            vec!["x/deep.gz".to_string(), "inner.tar".into(), "outer.zip".into()]
        );
    }

    #[test]
    fn serialization_is_ordered_and_stable() {
        let mut a = LineageMap::new();
        a.add("z.txt", "", "root");
        a.add("a.txt", "", "root");
        let mut b = LineageMap::new();
        b.add("a.txt", "", "root");
        b.add("z.txt", "", "root");

        let json = a.to_json().unwrap();
        assert_eq!(json, b.to_json().unwrap());
        assert!(json.find("a.txt").unwrap() < json.find("z.txt").unwrap());
        assert_eq!(LineageMap::from_json(&json).unwrap(), a);
    }
}
