//! User pod specification.
//!
//! The pod spec is the supervisor's input: an ordered set of containers
//! sharing one VM, the data volumes they mount, and the file injections
//! they receive. Parsed from YAML (or JSON, which YAML subsumes) with
//! validation.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Limits
// =============================================================================

/// Maximum size of a pod manifest in bytes (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum number of containers per pod.
pub const MAX_CONTAINERS_PER_POD: usize = 16;

/// Maximum number of volumes per pod.
pub const MAX_VOLUMES_PER_POD: usize = 64;

/// Maximum length for pod, container, and volume names.
pub const MAX_NAME_LEN: usize = 253;

// =============================================================================
// Validation Helpers
// =============================================================================

/// Validates a DNS-label-style name.
fn validate_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidSpec(format!("{what} name cannot be empty")));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidSpec(format!(
            "{what} name '{name}' exceeds maximum length of {MAX_NAME_LEN}"
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(Error::InvalidSpec(format!(
            "{what} name '{name}' must contain only lowercase alphanumeric characters, '-' or '.'"
        )));
    }

    Ok(())
}

// =============================================================================
// Pod Specification
// =============================================================================

/// A user-declared pod: containers sharing one VM.
///
/// This is the primary input type; it arrives on the event bus inside
/// a `RunPod` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPod {
    /// Pod name; doubles as the VM hostname.
    pub name: String,
    /// Container specifications, in start order (at least one required).
    pub containers: Vec<UserContainer>,
    /// Volume definitions for the pod.
    #[serde(default)]
    pub volumes: Vec<UserVolume>,
    /// File entries referenced by container file injections.
    #[serde(default)]
    pub files: Vec<UserFile>,
}

/// One container within a pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContainer {
    /// Container image reference.
    pub image: String,
    /// Working directory override; the image config applies when empty.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Command override; the image config applies when empty.
    #[serde(default)]
    pub command: Vec<String>,
    /// Files to inject into the container rootfs.
    #[serde(default)]
    pub files: Vec<ContainerFileRef>,
}

/// Reference from a container to a declared file entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerFileRef {
    /// Name of the `UserFile` entry supplying the content.
    pub filename: String,
    /// Absolute target path inside the container rootfs.
    pub path: String,
    /// Octal permission bits for the injected file.
    #[serde(default = "default_file_perm")]
    pub perm: u32,
}

fn default_file_perm() -> u32 {
    0o644
}

/// A data volume shared into the VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserVolume {
    /// Volume name, unique within the pod.
    pub name: String,
    /// Host source path; a fresh volume is allocated when absent.
    #[serde(default)]
    pub source: Option<String>,
    /// Declared filesystem type.
    #[serde(default)]
    pub fstype: Option<String>,
}

/// A named file content source, consumed by container file injections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFile {
    /// Name referenced by `ContainerFileRef::filename`.
    pub name: String,
    /// URI of the content (file path or URL, resolved by the image backend).
    pub uri: String,
}

impl UserPod {
    /// Parses a pod spec from YAML or JSON bytes.
    ///
    /// # Errors
    ///
    /// - Size exceeds `MAX_MANIFEST_SIZE`
    /// - Parsing fails
    /// - Validation errors for names and counts
    pub fn from_yaml(manifest: &[u8]) -> Result<Self> {
        if manifest.len() > MAX_MANIFEST_SIZE {
            return Err(Error::InvalidSpec(format!(
                "manifest size {} exceeds limit of {}",
                manifest.len(),
                MAX_MANIFEST_SIZE
            )));
        }

        let pod: UserPod =
            serde_yaml::from_slice(manifest).map_err(|e| Error::InvalidSpec(e.to_string()))?;
        pod.validate()?;
        Ok(pod)
    }

    /// Validates names, counts, and cross-references.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name, "pod")?;

        if self.containers.is_empty() {
            return Err(Error::InvalidSpec(
                "pod must declare at least one container".to_string(),
            ));
        }
        if self.containers.len() > MAX_CONTAINERS_PER_POD {
            return Err(Error::InvalidSpec(format!(
                "pod declares {} containers, limit is {}",
                self.containers.len(),
                MAX_CONTAINERS_PER_POD
            )));
        }
        if self.volumes.len() > MAX_VOLUMES_PER_POD {
            return Err(Error::InvalidSpec(format!(
                "pod declares {} volumes, limit is {}",
                self.volumes.len(),
                MAX_VOLUMES_PER_POD
            )));
        }

        for volume in &self.volumes {
            validate_name(&volume.name, "volume")?;
        }

        for (i, container) in self.containers.iter().enumerate() {
            if container.image.is_empty() {
                return Err(Error::InvalidSpec(format!(
                    "container {i} has no image reference"
                )));
            }
            for file in &container.files {
                if !self.files.iter().any(|f| f.name == file.filename) {
                    return Err(Error::InvalidSpec(format!(
                        "container {i} references undeclared file '{}'",
                        file.filename
                    )));
                }
            }
        }

        Ok(())
    }

    /// Looks up a declared file entry by name.
    #[must_use]
    pub fn file(&self, name: &str) -> Option<&UserFile> {
        self.files.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: web-pod
containers:
  - image: nginx:1.25
    workdir: /srv
    command: ["nginx", "-g", "daemon off;"]
    files:
      - filename: site-conf
        path: /etc/nginx/conf.d/site.conf
volumes:
  - name: data
    fstype: ext4
files:
  - name: site-conf
    uri: file:///etc/pods/web/site.conf
"#;

    #[test]
    fn parse_manifest() {
        let pod = UserPod::from_yaml(MANIFEST.as_bytes()).unwrap();
        assert_eq!(pod.name, "web-pod");
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].command[0], "nginx");
        assert_eq!(pod.volumes[0].name, "data");
        assert!(pod.file("site-conf").is_some());
    }

    #[test]
    fn reject_empty_containers() {
        let err = UserPod::from_yaml(b"name: empty-pod\ncontainers: []\n").unwrap_err();
        assert!(err.to_string().contains("at least one container"));
    }

    #[test]
    fn reject_dangling_file_reference() {
        let manifest = r#"
name: pod
containers:
  - image: alpine:3.19
    files:
      - filename: missing
        path: /etc/missing
"#;
        let err = UserPod::from_yaml(manifest.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("undeclared file"));
    }

    #[test]
    fn reject_bad_name() {
        let err = UserPod::from_yaml(b"name: Bad_Name\ncontainers:\n  - image: a\n").unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }
}
