//! Kernel configuration – reads/writes `~/.agora/kernel.toml`.
//!
//! Every field has a default, so an empty or missing file yields a working
//! single-kernel setup.  Environment variables override the file:
//!
//! | Variable | Field |
//! |---|---|
//! | `AGORA_CLUSTER_ID` | `cluster_id` |
//! | `AGORA_KERNEL_URI` | `kernel_uri` |
//! | `AGORA_STARTUP_TIMEOUT_MS` | `startup_timeout_ms` |
//! | `AGORA_REGISTRY` | `registry` (`unique` or `multi`) |

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agora_kernel::RegistryKind;
use agora_types::{AgoraError, ContextId, KernelUri};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Id of the context every kernel creates on boot.
pub const DEFAULT_ROOT_CONTEXT_ID: Uuid = Uuid::from_u128(0x6167_6f72_615f_726f_6f74_5f63_7478_0001);

/// Default space of [`DEFAULT_ROOT_CONTEXT_ID`].
pub const DEFAULT_ROOT_SPACE_ID: Uuid = Uuid::from_u128(0x6167_6f72_615f_726f_6f74_5f73_7063_0001);

/// Persisted kernel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Prefix of the replicated map names.
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Endpoint to bind, `scheme://host:port` with `*` allowed as the port.
    #[serde(default = "default_kernel_uri")]
    pub kernel_uri: String,

    /// Per-service readiness bound.  Unset means wait indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_timeout_ms: Option<u64>,

    #[serde(default)]
    pub registry: RegistryKind,

    #[serde(default = "default_root_context_id")]
    pub root_context_id: ContextId,

    #[serde(default = "default_root_space_id")]
    pub root_space_id: Uuid,
}

fn default_cluster_id() -> String {
    "agora".to_string()
}
fn default_kernel_uri() -> String {
    "tcp://127.0.0.1:*".to_string()
}
fn default_root_context_id() -> ContextId {
    DEFAULT_ROOT_CONTEXT_ID
}
fn default_root_space_id() -> Uuid {
    DEFAULT_ROOT_SPACE_ID
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cluster_id: default_cluster_id(),
            kernel_uri: default_kernel_uri(),
            startup_timeout_ms: None,
            registry: RegistryKind::default(),
            root_context_id: default_root_context_id(),
            root_space_id: default_root_space_id(),
        }
    }
}

impl KernelConfig {
    pub fn kernel_uri(&self) -> Result<KernelUri, AgoraError> {
        self.kernel_uri.parse()
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_ms.map(Duration::from_millis)
    }
}

/// Return the path to `~/.agora/kernel.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".agora").join("kernel.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<KernelConfig>, AgoraError> {
    load_from(&config_path())
}

/// The on-disk config, or the defaults when there is none, with the
/// environment overrides applied either way.
pub fn resolve() -> Result<KernelConfig, AgoraError> {
    resolve_from(&config_path())
}

pub fn resolve_from(path: &Path) -> Result<KernelConfig, AgoraError> {
    match load_from(path)? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = KernelConfig::default();
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

pub fn load_from(path: &Path) -> Result<Option<KernelConfig>, AgoraError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| AgoraError::Config(format!("Failed to read config at {}: {e}", path.display())))?;
    let mut cfg: KernelConfig =
        toml::from_str(&raw).map_err(|e| AgoraError::Config(format!("Failed to parse config: {e}")))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `AGORA_*` environment variable overrides to `cfg`.
pub fn apply_env_overrides(cfg: &mut KernelConfig) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Apply overrides looked up through `var`.  Unparseable values are logged
/// and ignored.
pub(crate) fn apply_overrides(cfg: &mut KernelConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("AGORA_CLUSTER_ID") {
        cfg.cluster_id = v;
    }
    if let Some(v) = var("AGORA_KERNEL_URI") {
        cfg.kernel_uri = v;
    }
    if let Some(v) = var("AGORA_STARTUP_TIMEOUT_MS") {
        match v.parse::<u64>() {
            Ok(ms) => cfg.startup_timeout_ms = Some(ms),
            Err(e) => warn!(value = %v, error = %e, "ignoring AGORA_STARTUP_TIMEOUT_MS"),
        }
    }
    if let Some(v) = var("AGORA_REGISTRY") {
        match v.parse::<RegistryKind>() {
            Ok(kind) => cfg.registry = kind,
            Err(e) => warn!(value = %v, error = %e, "ignoring AGORA_REGISTRY"),
        }
    }
}

/// Save the config to disk, creating `~/.agora/` if necessary.
pub fn save(cfg: &KernelConfig) -> Result<(), AgoraError> {
    save_to(cfg, &config_path())
}

pub fn save_to(cfg: &KernelConfig, path: &Path) -> Result<(), AgoraError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AgoraError::Config(format!("Failed to create config directory: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| AgoraError::Config(format!("Failed to set config directory permissions: {e}")))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| AgoraError::Config(format!("Failed to serialize config: {e}")))?;
    let write_error = |e: std::io::Error| AgoraError::Config(format!("Failed to write config at {}: {e}", path.display()));
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_error)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_error)?;
    Ok(())
}
