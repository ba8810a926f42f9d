// src/cache.rs
//
// Persistent JSON parameter cache with checksum integrity, mirroring
// buderus_wps/cache.py's ParameterCache exactly (version, checksum
// format, deterministic serialization for the digest).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::table::Parameter;

pub const CACHE_VERSION: &str = "1.0.0";

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: String,
    created: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    firmware: Option<String>,
    element_count: usize,
    checksum: String,
    parameters: Vec<Parameter>,
}

/// Manages the on-disk parameter cache at `cache_path`.
pub struct ParameterCache {
    cache_path: PathBuf,
}

impl ParameterCache {
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.cache_path
    }

    /// True iff the file exists, parses as JSON, has the current version,
    /// and its checksum matches the recomputed digest over `parameters`.
    pub fn is_valid(&self) -> bool {
        self.read_and_validate().is_some()
    }

    fn read_and_validate(&self) -> Option<CacheFile> {
        let bytes = std::fs::read(&self.cache_path).ok()?;
        let cache: CacheFile = serde_json::from_slice(&bytes).ok()?;
        if cache.version != CACHE_VERSION {
            return None;
        }
        let expected = compute_checksum(&cache.parameters);
        if cache.checksum != expected {
            return None;
        }
        Some(cache)
    }

    /// Load the cached parameter list, or `None` if the cache is invalid.
    pub fn load(&self) -> Option<Vec<Parameter>> {
        self.read_and_validate().map(|c| c.parameters)
    }

    /// Persist `parameters` to disk with a freshly computed checksum.
    /// Creates parent directories as needed. Returns `false` on any I/O
    /// error rather than propagating one — cache writes are best-effort.
    pub fn save(
        &self,
        parameters: &[Parameter],
        device_id: Option<String>,
        firmware: Option<String>,
    ) -> bool {
        let Some(parent) = self.cache_path.parent() else {
            return false;
        };
        if !parent.as_os_str().is_empty() && std::fs::create_dir_all(parent).is_err() {
            return false;
        }

        let cache = CacheFile {
            version: CACHE_VERSION.to_string(),
            created: chrono::Utc::now().to_rfc3339(),
            device_id,
            firmware,
            element_count: parameters.len(),
            checksum: compute_checksum(parameters),
            parameters: parameters.to_vec(),
        };

        let Ok(json) = serde_json::to_vec_pretty(&cache) else {
            return false;
        };
        std::fs::write(&self.cache_path, json).is_ok()
    }

    /// Best-effort removal of the cache file.
    pub fn invalidate(&self) {
        let _ = std::fs::remove_file(&self.cache_path);
    }
}

/// Deterministic SHA-256 over `parameters`, sorted by index, serialized
/// with lexicographic map keys and no whitespace.
fn compute_checksum(parameters: &[Parameter]) -> String {
    let mut sorted: Vec<&Parameter> = parameters.iter().collect();
    sorted.sort_by_key(|p| p.index);

    // serde_json preserves struct field declaration order, not lexicographic
    // key order, so re-encode each parameter as a sorted map before hashing.
    let canonical: Vec<serde_json::Value> = sorted
        .iter()
        .map(|p| {
            let v = serde_json::to_value(p).expect("Parameter always serializes");
            let map = v.as_object().expect("Parameter serializes to an object");
            let sorted_map: std::collections::BTreeMap<String, serde_json::Value> =
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            serde_json::to_value(sorted_map).unwrap()
        })
        .collect();

    let json = serde_json::to_string(&canonical).expect("canonical value always serializes");
    let digest = Sha256::digest(json.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(index: u32, name: &str) -> Parameter {
        Parameter {
            index,
            ext_id: format!("{:014X}", index),
            min: 0,
            max: 5,
            format: "int".to_string(),
            read: 0,
            name: name.to_string(),
        }
    }

    #[test]
    fn round_trip_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ParameterCache::new(dir.path().join("params.json"));
        let params = vec![param(1, "ACCESS_LEVEL"), param(2, "STATUS")];
        assert!(cache.save(&params, None, None));
        assert!(cache.is_valid());
        assert_eq!(cache.load().unwrap(), params);
    }

    #[test]
    fn tamper_detection_rejects_modified_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        let cache = ParameterCache::new(&path);
        cache.save(&[param(1, "ACCESS_LEVEL")], None, None);

        let mut text = std::fs::read_to_string(&path).unwrap();
        text = text.replace("ACCESS_LEVEL", "TAMPERED_NAME");
        std::fs::write(&path, text).unwrap();

        assert!(!cache.is_valid());
        assert!(cache.load().is_none());
    }

    #[test]
    fn checksum_is_deterministic_across_saves() {
        let dir = tempfile::tempdir().unwrap();
        let params = vec![param(2, "B"), param(1, "A")]; // out of order on purpose
        let cache_a = ParameterCache::new(dir.path().join("a.json"));
        let cache_b = ParameterCache::new(dir.path().join("b.json"));
        cache_a.save(&params, None, None);
        cache_b.save(&params, None, None);

        let text_a = std::fs::read_to_string(dir.path().join("a.json")).unwrap();
        let text_b = std::fs::read_to_string(dir.path().join("b.json")).unwrap();
        let val_a: serde_json::Value = serde_json::from_str(&text_a).unwrap();
        let val_b: serde_json::Value = serde_json::from_str(&text_b).unwrap();
        assert_eq!(val_a["checksum"], val_b["checksum"]);
    }

    #[test]
    fn version_mismatch_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        let cache = ParameterCache::new(&path);
        cache.save(&[param(1, "A")], None, None);

        let text = std::fs::read_to_string(&path).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&text).unwrap();
        value["version"] = serde_json::Value::String("0.9.0".to_string());
        std::fs::write(&path, value.to_string()).unwrap();

        assert!(!cache.is_valid());
        assert!(cache.load().is_none());
    }

    #[test]
    fn invalidate_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        let cache = ParameterCache::new(&path);
        cache.save(&[param(1, "A")], None, None);
        assert!(path.exists());
        cache.invalidate();
        assert!(!path.exists());
    }

    #[test]
    fn invalidate_on_missing_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ParameterCache::new(dir.path().join("missing.json"));
        cache.invalidate(); // must not panic
    }

    #[test]
    fn missing_cache_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ParameterCache::new(dir.path().join("missing.json"));
        assert!(!cache.is_valid());
        assert!(cache.load().is_none());
    }
}
