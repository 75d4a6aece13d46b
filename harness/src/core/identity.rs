//! Content-addressed image identity for an environment spec.
//!
//! The identity is a SHA-256 digest over the repository name, the canonical
//! spec (execution-only fields removed, object keys sorted into `[key, value]`
//! pairs, sequences kept in order) and the Dockerfile template text.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::script::DOCKERFILE_TEMPLATE;
use crate::core::spec::{EnvironmentSpec, IDENTITY_EXCLUDED_FIELDS};

/// Length of the digest prefix embedded in image names.
const NAME_DIGEST_LEN: usize = 8;

/// Stable identity of a buildable environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageIdentity {
    /// Full hex digest; the build cache and lock key.
    pub digest: String,
    /// Local image name derived from the repository and digest.
    pub image_name: String,
}

/// Canonical, order-stable form of a JSON value.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Array(
                entries
                    .into_iter()
                    .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), canonicalize(v)]))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical bytes of the image-defining part of a spec.
pub fn canonical_spec_bytes(spec: &EnvironmentSpec) -> Vec<u8> {
    let mut value = serde_json::to_value(spec).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        for field in IDENTITY_EXCLUDED_FIELDS {
            map.remove(field);
        }
    }
    canonicalize(&value).to_string().into_bytes()
}

/// Hex digest identifying the image for `repo` built from `spec`.
pub fn spec_digest(repo: &str, spec: &EnvironmentSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_spec_bytes(spec));
    hasher.update(DOCKERFILE_TEMPLATE.as_bytes());
    hex::encode(hasher.finalize())
}

/// `eval-<repo lowercased, '/' -> '-'>-<digest prefix>`.
pub fn image_name(repo: &str, digest: &str) -> String {
    let repo = repo.to_lowercase().replace('/', "-");
    let prefix = &digest[..digest.len().min(NAME_DIGEST_LEN)];
    format!("eval-{repo}-{prefix}")
}

pub fn image_identity(repo: &str, spec: &EnvironmentSpec) -> ImageIdentity {
    let digest = spec_digest(repo, spec);
    let image_name = image_name(repo, &digest);
    ImageIdentity { digest, image_name }
}
