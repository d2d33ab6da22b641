/// Root namespace used when the configured prefix is empty
pub const DEFAULT_PREFIX: &str = "/default-registry-service/";

/// Delimiter the root namespace must start and end with
pub const PREFIX_DELIMITER: &str = "/";

/// Lease duration and renewal period in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 3;

/// Path separator for storage keys
pub const DEFAULT_SEPARATOR: &str = "/";

/// Port assumed for instances registered without one
pub const DEFAULT_PORT: u16 = 8000;

/// Namespace segments below the root prefix
pub const REGISTRY_NAMESPACE: &str = "registry/";
pub const STORAGE_NAMESPACE: &str = "storage/";

/// Joins service name and id inside an instance identity
pub const IDENTITY_SEPARATOR: &str = "_";

/// Key under which an instance with the given identity is registered
pub fn registry_key(prefix: &str, identity: &str) -> String {
    format!("{}{}{}", prefix, REGISTRY_NAMESPACE, identity)
}
