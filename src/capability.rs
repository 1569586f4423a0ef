/// Capability and namespace tables for contained spaces and apps
///
/// Every space drops the basic bundle plus the bundle of its kind from the
/// bounding set and clears the same capabilities from the inheritable set.
/// Dropping is one way only, nothing here ever raises a capability.
use crate::types::{LxceError, Result, SpaceKind, TypeEntry};
use caps::{CapSet, Capability};
use nix::sched::CloneFlags;

/// Dropped by every space regardless of its kind
pub const BASIC_BUNDLE: &[Capability] = &[
    Capability::CAP_BLOCK_SUSPEND,
    Capability::CAP_IPC_LOCK,
    Capability::CAP_MAC_ADMIN,
    Capability::CAP_MAC_OVERRIDE,
];

pub const SERVICE_BUNDLE: &[Capability] = &[
    Capability::CAP_NET_ADMIN,
    Capability::CAP_NET_BIND_SERVICE,
    Capability::CAP_SETFCAP,
    Capability::CAP_SETUID,
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_SYS_BOOT,
    Capability::CAP_SYS_MODULE,
    Capability::CAP_SYS_NICE,
    Capability::CAP_SYS_RAWIO,
    Capability::CAP_SYS_TIME,
    Capability::CAP_SYSLOG,
    Capability::CAP_WAKE_ALARM,
    Capability::CAP_SYS_RESOURCE,
];

pub const SHUTDOWN_BUNDLE: &[Capability] = &[
    Capability::CAP_SYSLOG,
    Capability::CAP_SYS_TIME,
    Capability::CAP_NET_ADMIN,
];

/// Namespace names accepted in space and app configs
pub const NAMESPACES: &[(&str, CloneFlags)] = &[
    ("pid", CloneFlags::CLONE_NEWPID),
    ("uts", CloneFlags::CLONE_NEWUTS),
    ("net", CloneFlags::CLONE_NEWNET),
    ("mount", CloneFlags::CLONE_NEWNS),
    ("user", CloneFlags::CLONE_NEWUSER),
];

/// Kind-specific bundle, empty for boot spaces
pub fn kind_bundle(kind: SpaceKind) -> &'static [Capability] {
    match kind {
        SpaceKind::Boot => &[],
        SpaceKind::Service => SERVICE_BUNDLE,
        SpaceKind::Shutdown => SHUTDOWN_BUNDLE,
    }
}

/// Capabilities removed from a space of the given kind, basic bundle first
pub fn dropped_for(kind: SpaceKind, extra: &[Capability]) -> Vec<Capability> {
    let mut dropped: Vec<Capability> = BASIC_BUNDLE.to_vec();
    for cap in kind_bundle(kind).iter().chain(extra.iter()) {
        if !dropped.contains(cap) {
            dropped.push(*cap);
        }
    }
    dropped
}

/// Look up a namespace flag by name
///
/// Unknown names map to empty flags and are logged.
pub fn namespace_flag(name: &str) -> CloneFlags {
    match NAMESPACES.iter().find(|(n, _)| *n == name) {
        Some((_, flag)) => *flag,
        None => {
            log::error!("Invalid namespace: {}", name);
            CloneFlags::empty()
        }
    }
}

/// Look up a capability by its `CAP_*` name
pub fn capability_from_name(name: &str) -> Option<Capability> {
    match name.parse::<Capability>() {
        Ok(cap) => Some(cap),
        Err(_) => {
            log::error!("Invalid capability: {}", name);
            None
        }
    }
}

/// Combine configured namespace entries into clone flags, rejecting unknown names
pub fn parse_namespaces(entries: &[TypeEntry]) -> Result<CloneFlags> {
    let mut flags = CloneFlags::empty();
    for entry in entries {
        let flag = namespace_flag(&entry.kind);
        if flag.is_empty() {
            return Err(LxceError::Config(format!(
                "Unknown namespace type: {}",
                entry.kind
            )));
        }
        flags |= flag;
    }
    Ok(flags)
}

/// Resolve configured capability entries, rejecting unknown names
pub fn parse_capabilities(entries: &[TypeEntry]) -> Result<Vec<Capability>> {
    entries
        .iter()
        .map(|entry| {
            capability_from_name(&entry.kind).ok_or_else(|| {
                LxceError::Config(format!("Unknown capability type: {}", entry.kind))
            })
        })
        .collect()
}

/// Drop `caps` from the bounding set and clear them from the inheritable set
pub fn drop_capabilities(label: &str, caps: &[Capability]) -> Result<()> {
    for cap in caps {
        caps::drop(None, CapSet::Bounding, *cap).map_err(|e| {
            LxceError::Capability(format!(
                "{}: Failed to drop {} from bounding set: {}",
                label, cap, e
            ))
        })?;
    }

    let mut inheritable = caps::read(None, CapSet::Inheritable).map_err(|e| {
        LxceError::Capability(format!("{}: Failed to read inheritable set: {}", label, e))
    })?;
    for cap in caps {
        inheritable.remove(cap);
    }
    caps::set(None, CapSet::Inheritable, &inheritable).map_err(|e| {
        LxceError::Capability(format!("{}: Failed to set inheritable set: {}", label, e))
    })?;

    Ok(())
}

/// Apply the full drop profile of a space
pub fn apply_space_profile(label: &str, kind: SpaceKind, extra: &[Capability]) -> Result<()> {
    drop_capabilities(label, &dropped_for(kind, extra))
}
