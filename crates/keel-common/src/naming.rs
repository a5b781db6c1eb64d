//! Content-addressed object names
//!
//! A configuration object named `<base>-<hash8>` changes identity whenever its
//! content changes, which forces every workload mounting it to roll out. The
//! previous object is left behind for the applier's garbage collector, which
//! finds it through [`LABEL_GARBAGE_COLLECTABLE`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use serde::Serialize;

use crate::Error;

/// Number of hex characters of the content hash appended to names
pub const HASH_SUFFIX_LEN: usize = 8;

/// Label marking objects the applier may delete once nothing references them
pub const LABEL_GARBAGE_COLLECTABLE: &str = "resources.keel.dev/garbage-collectable-reference";

/// Full hex-encoded SHA-256 digest of `content`.
///
/// Uses SHA-256 rather than `DefaultHasher`, which is not stable across Rust
/// releases, because the result is persisted in object names.
pub fn content_hash(content: &[u8]) -> String {
    use aws_lc_rs::digest::{digest, SHA256};

    digest(&SHA256, content)
        .as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// `<base>-<first 8 hex chars of sha256(content)>`
pub fn unique_name(base: &str, content: &[u8]) -> String {
    let hash = content_hash(content);
    format!("{}-{}", base, &hash[..HASH_SUFFIX_LEN])
}

/// Hash of the canonical JSON encoding of `data`.
///
/// Map keys are serialized in sorted order (`BTreeMap`), so equal maps hash
/// equally regardless of insertion order.
pub fn checksum<T: Serialize + ?Sized>(data: &T) -> Result<String, Error> {
    let bytes = serde_json::to_vec(data).map_err(|e| Error::serialization(e.to_string()))?;
    Ok(content_hash(&bytes))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigMapContent<'a> {
    data: Option<&'a BTreeMap<String, String>>,
    binary_data: Option<&'a BTreeMap<String, ByteString>>,
}

/// Rename a ConfigMap to `<name>-<hash8>` of its data and mark it immutable.
///
/// Callers must use the returned name for every reference to the ConfigMap
/// (volume mounts, env sources) built in the same deploy.
pub fn make_unique_config_map(config_map: &mut ConfigMap) -> Result<String, Error> {
    let content = ConfigMapContent {
        data: config_map.data.as_ref(),
        binary_data: config_map.binary_data.as_ref(),
    };
    let hash = checksum(&content)?;
    finish_unique(
        &mut config_map.metadata,
        &mut config_map.immutable,
        "ConfigMap",
        &hash,
    )
}

/// Rename a Secret to `<name>-<hash8>` of its data and mark it immutable.
pub fn make_unique_secret(secret: &mut Secret) -> Result<String, Error> {
    let empty = BTreeMap::new();
    let hash = checksum(secret.data.as_ref().unwrap_or(&empty))?;
    finish_unique(&mut secret.metadata, &mut secret.immutable, "Secret", &hash)
}

fn finish_unique(
    metadata: &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    immutable: &mut Option<bool>,
    kind: &str,
    hash: &str,
) -> Result<String, Error> {
    let base = metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::validation(format!("{} has no name to make unique", kind)))?;
    let name = format!("{}-{}", base, &hash[..HASH_SUFFIX_LEN]);

    metadata.name = Some(name.clone());
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_GARBAGE_COLLECTABLE.to_string(), "true".to_string());
    *immutable = Some(true);

    Ok(name)
}
