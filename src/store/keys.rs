// src/store/keys.rs

//! Key schema of the persistent group state: every entry is keyed by a
//! prefix-qualified name with `_` separating the components.

pub const OMAP_KEY_DELIMITER: &str = "_";
pub const OMAP_VERSION_KEY: &str = "omap_version";

pub const SUBSYSTEM_PREFIX: &str = "subsystem_";
pub const NAMESPACE_PREFIX: &str = "namespace_";
pub const NAMESPACE_QOS_PREFIX: &str = "qos_";
pub const HOST_PREFIX: &str = "host_";
pub const LISTENER_PREFIX: &str = "listener_";

/// Records whose keys start with this prefix belong to an obsolete layout
/// where backing devices were persisted; such records are rejected at
/// startup.
pub const LEGACY_BDEV_PREFIX: &str = "bdev";

/// Prefixes in dependency order: additions are dispatched in this order,
/// removals in the reverse.
pub const PREFIX_DISPATCH_ORDER: [&str; 5] = [
    SUBSYSTEM_PREFIX,
    NAMESPACE_PREFIX,
    NAMESPACE_QOS_PREFIX,
    HOST_PREFIX,
    LISTENER_PREFIX,
];

pub fn subsystem_key(subsystem_nqn: &str) -> String {
    format!("{SUBSYSTEM_PREFIX}{subsystem_nqn}")
}

pub fn namespace_key(subsystem_nqn: &str, nsid: u32) -> String {
    format!("{NAMESPACE_PREFIX}{subsystem_nqn}{OMAP_KEY_DELIMITER}{nsid}")
}

/// All namespaces of one subsystem share this key prefix.
pub fn namespace_key_prefix(subsystem_nqn: &str) -> String {
    format!("{NAMESPACE_PREFIX}{subsystem_nqn}{OMAP_KEY_DELIMITER}")
}

pub fn namespace_qos_key(subsystem_nqn: &str, nsid: u32) -> String {
    format!("{NAMESPACE_QOS_PREFIX}{subsystem_nqn}{OMAP_KEY_DELIMITER}{nsid}")
}

pub fn namespace_qos_key_prefix(subsystem_nqn: &str) -> String {
    format!("{NAMESPACE_QOS_PREFIX}{subsystem_nqn}{OMAP_KEY_DELIMITER}")
}

pub fn host_key(subsystem_nqn: &str, host_nqn: &str) -> String {
    format!("{HOST_PREFIX}{subsystem_nqn}{OMAP_KEY_DELIMITER}{host_nqn}")
}

pub fn host_key_prefix(subsystem_nqn: &str) -> String {
    format!("{HOST_PREFIX}{subsystem_nqn}{OMAP_KEY_DELIMITER}")
}

pub fn listener_key(
    subsystem_nqn: &str,
    gateway: &str,
    trtype: &str,
    traddr: &str,
    trsvcid: u16,
) -> String {
    format!(
        "{}{}{gateway}{}{trtype}{}{traddr}{}{trsvcid}",
        partial_listener_key(subsystem_nqn),
        OMAP_KEY_DELIMITER,
        OMAP_KEY_DELIMITER,
        OMAP_KEY_DELIMITER,
        OMAP_KEY_DELIMITER
    )
}

/// All listeners of one subsystem, regardless of the owning gateway.
pub fn partial_listener_key(subsystem_nqn: &str) -> String {
    format!("{LISTENER_PREFIX}{subsystem_nqn}")
}

/// Suffix matching one transport address and port on any gateway.
pub fn listener_key_suffix(trtype: &str, traddr: &str, trsvcid: u16) -> String {
    format!("{OMAP_KEY_DELIMITER}{trtype}{OMAP_KEY_DELIMITER}{traddr}{OMAP_KEY_DELIMITER}{trsvcid}")
}
