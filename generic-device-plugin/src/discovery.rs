//! Device discovery from glob patterns.
//!
//! A resource is described by one or more path groups. Each group is an
//! ordered list of glob patterns; the n-th match of every pattern in the group
//! together make up the n-th physical device. Every physical device is then
//! instantiated `count` times, one instance per slot.
//!
//! Discovery is a pure function of the filesystem: for an unchanged tree it
//! yields the same devices with the same identifiers every time.

use device_plugin_api::{Device, Health, PluginError, Result};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

/// An ordered list of glob patterns describing one device shape, and the
/// number of instances to advertise for each match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathGroup {
    pub paths: Vec<String>,
    pub count: u32,
}

impl PathGroup {
    pub fn new<I, S>(paths: I, count: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            count,
        }
    }
}

/// A device class: the resource name it is advertised under and the path
/// groups its devices are found at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub resource: String,
    pub groups: Vec<PathGroup>,
}

/// A device instance found by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: String,
    pub health: Health,
    /// Resolved paths, aligned with the patterns of the group.
    pub paths: Vec<String>,
}

impl DiscoveredDevice {
    pub fn to_device(&self) -> Device {
        Device {
            id: self.id.clone(),
            health: self.health,
        }
    }
}

/// Resolve a single glob pattern to its matches, sorted byte-wise.
///
/// Entries that cannot be read while matching are skipped, as are paths that
/// are not valid UTF-8.
pub fn resolve_pattern(pattern: &str) -> Result<Vec<String>> {
    let entries = glob::glob(pattern).map_err(|e| PluginError::Discovery {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;

    let mut matches = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) => match path.into_os_string().into_string() {
                Ok(path) => matches.push(path),
                Err(raw) => warn!("Skipping non UTF-8 path {:?} for pattern {}", raw, pattern),
            },
            Err(e) => debug!("Skipping unreadable path {:?}: {}", e.path(), e.error()),
        }
    }

    matches.sort();
    Ok(matches)
}

/// Resolve every pattern of a group, preserving pattern order.
pub fn resolve_group(patterns: &[String]) -> Result<Vec<Vec<String>>> {
    patterns.iter().map(|p| resolve_pattern(p)).collect()
}

/// Number of complete devices in a resolved group: the shortest match list.
///
/// Patterns with more matches than others are truncated to this length.
pub fn usable_length(resolved: &[Vec<String>]) -> usize {
    resolved.iter().map(Vec::len).min().unwrap_or(0)
}

/// Derive the identifier of the `ordinal`-th instance of the device made up of
/// `paths`.
///
/// The identifier is the hex-encoded SHA-1 of the ordinal's decimal form
/// followed by every path, in pattern order.
pub fn device_id<S: AsRef<str>>(ordinal: u32, paths: &[S]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(ordinal.to_string().as_bytes());
    for path in paths {
        hasher.update(path.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Discover all device instances of a single group.
pub fn discover_group(group: &PathGroup) -> Result<Vec<DiscoveredDevice>> {
    let resolved = resolve_group(&group.paths)?;
    let length = usable_length(&resolved);

    let mut devices = Vec::with_capacity(length * group.count as usize);
    for i in 0..length {
        let paths: Vec<String> = resolved.iter().map(|matches| matches[i].clone()).collect();
        for ordinal in 0..group.count {
            devices.push(DiscoveredDevice {
                id: device_id(ordinal, &paths),
                health: Health::Healthy,
                paths: paths.clone(),
            });
        }
    }

    Ok(devices)
}

/// Discover every device instance of a resource, group by group.
pub fn discover(spec: &ResourceSpec) -> Result<Vec<DiscoveredDevice>> {
    let mut devices = Vec::new();
    for group in &spec.groups {
        devices.extend(discover_group(group)?);
    }
    debug!("Discovered {} device(s) for {}", devices.len(), spec.resource);
    Ok(devices)
}
