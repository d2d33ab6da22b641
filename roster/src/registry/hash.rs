use std::collections::HashMap;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::Instance;

/// Hash only what identifies and describes an instance; `registered_at`
/// differs between otherwise identical re-registrations.
#[derive(Serialize)]
struct HashView<'a> {
    identity: String,
    service_name: &'a str,
    host: &'a str,
    hostname: &'a str,
    port: u16,
    meta: Vec<(&'a String, &'a serde_json::Value)>,
}

/// Computes a SHA-256 hash of a set of instances.
/// Instances are sorted by identity and metadata by key for deterministic output.
pub fn compute_hash(instances: &[Instance]) -> Result<String, serde_json::Error> {
    let mut views: Vec<HashView<'_>> = instances
        .iter()
        .map(|i| HashView {
            identity: i.identity(),
            service_name: &i.service_name,
            host: &i.host,
            hostname: &i.hostname,
            port: i.port,
            meta: sorted(&i.meta),
        })
        .collect();
    views.sort_by(|a, b| a.identity.cmp(&b.identity));

    let json = serde_json::to_string(&views)?;

    let hash = Sha256::digest(json.as_bytes());
    Ok(hex::encode(hash))
}

fn sorted(meta: &HashMap<String, serde_json::Value>) -> Vec<(&String, &serde_json::Value)> {
    let mut entries: Vec<_> = meta.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_instance(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            ..Instance::new("billing")
                .with_address("10.0.0.1", 8080)
                .with_meta([("zone", "a"), ("tier", "gold")])
        }
    }

    #[test]
    fn test_hash_deterministic() {
        let a = test_instance("a");
        let b = test_instance("b");

        let hash1 = compute_hash(&[a.clone(), b.clone()]).unwrap();
        let hash2 = compute_hash(&[b, a]).unwrap();

        assert_eq!(hash1, hash2, "Hash should be same regardless of input order");
    }

    #[test]
    fn test_hash_changes_on_modification() {
        let before = compute_hash(&[test_instance("a")]).unwrap();

        let mut changed = test_instance("a");
        changed.meta.insert("zone".to_string(), "b".into());
        let after = compute_hash(&[changed]).unwrap();

        assert_ne!(before, after, "Hash should change when metadata changes");
    }

    #[test]
    fn test_hash_stable_across_registration_time() {
        let a = test_instance("a");
        let mut b = test_instance("a");
        b.registered_at = Some(Utc::now());

        assert_eq!(compute_hash(&[a]).unwrap(), compute_hash(&[b]).unwrap());
    }
}
