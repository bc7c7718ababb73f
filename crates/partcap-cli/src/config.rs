//! Machine description – reads/writes `~/.partcap/machine.toml`.
//!
//! ```toml
//! machine = "pseries-3.0"
//! cpu_type = "power9"
//! max_compat = "power8"
//!
//! [host]
//! mode = "accelerated"
//! htm = true
//! cfpc = "workaround"
//! ram_page_size = "64K"
//!
//! [caps]
//! cfpc = "workaround"
//! hpt-max-page-size = "64K"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use partcap_hal::{AcceleratedBackend, Backend, EmulatedBackend, HostFeatures};
use partcap_kernel::accessor::parse_size;
use partcap_kernel::defaults::DEFAULT_PROFILE;
use partcap_kernel::machine::DEFAULT_CPU_TYPE;
use partcap_kernel::registry::{CFPC_VALUES, IBS_VALUES, PossibleValues, SBBC_VALUES};
use partcap_kernel::{Machine, MachineBuilder};
use partcap_types::{CompatLevel, ExecMode, Level};

/// A capability or size value as written in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(u64),
    Text(String),
}

impl ConfigValue {
    /// Textual form accepted by the `cap-*` property setters.
    pub fn to_raw(&self) -> String {
        match self {
            ConfigValue::Bool(true) => "on".to_string(),
            ConfigValue::Bool(false) => "off".to_string(),
            ConfigValue::Int(n) => n.to_string(),
            ConfigValue::Text(s) => s.clone(),
        }
    }
}

/// What the host can do for the guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_mode")]
    pub mode: ExecMode,

    #[serde(default)]
    pub htm: bool,

    #[serde(default)]
    pub nested_hv: bool,

    /// Best cache-flush mitigation, by name.
    #[serde(default = "default_mitigation")]
    pub cfpc: String,

    #[serde(default = "default_mitigation")]
    pub sbbc: String,

    #[serde(default = "default_mitigation")]
    pub ibs: String,

    #[serde(default)]
    pub needs_host_contiguous_pages: bool,

    /// Bytes, or a suffixed string such as `"64K"`.
    #[serde(default = "default_ram_page_size")]
    pub ram_page_size: ConfigValue,
}

fn default_mode() -> ExecMode {
    ExecMode::Emulated
}
fn default_mitigation() -> String {
    "broken".to_string()
}
fn default_ram_page_size() -> ConfigValue {
    ConfigValue::Text("64K".to_string())
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            htm: false,
            nested_hv: false,
            cfpc: default_mitigation(),
            sbbc: default_mitigation(),
            ibs: default_mitigation(),
            needs_host_contiguous_pages: false,
            ram_page_size: default_ram_page_size(),
        }
    }
}

impl HostConfig {
    /// Build the execution backend this host describes.
    pub fn backend(&self) -> Result<Box<dyn Backend>, String> {
        let ram_page_size = parse_size(&self.ram_page_size.to_raw())
            .map_err(|e| format!("host.ram_page_size: {e}"))?;
        match self.mode {
            ExecMode::Emulated => Ok(Box::new(
                EmulatedBackend::new().with_ram_page_size(ram_page_size),
            )),
            ExecMode::Accelerated => Ok(Box::new(AcceleratedBackend::new(HostFeatures {
                htm: self.htm,
                nested_hv: self.nested_hv,
                safe_cache: mitigation_level("cfpc", &CFPC_VALUES, &self.cfpc)?,
                safe_bounds_check: mitigation_level("sbbc", &SBBC_VALUES, &self.sbbc)?,
                safe_indirect_branch: mitigation_level("ibs", &IBS_VALUES, &self.ibs)?,
                needs_host_contiguous_pages: self.needs_host_contiguous_pages,
                ram_page_size,
            }))),
        }
    }
}

fn mitigation_level(field: &str, values: &PossibleValues, name: &str) -> Result<Level, String> {
    values.position(name).ok_or_else(|| {
        format!(
            "host.{field}: unknown level \"{name}\" (expected one of {})",
            values.values.join(", ")
        )
    })
}

/// Persisted machine description stored in `~/.partcap/machine.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Machine profile, e.g. `pseries-3.0`.
    #[serde(default = "default_machine")]
    pub machine: String,

    #[serde(default = "default_cpu_type")]
    pub cpu_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_compat: Option<CompatLevel>,

    #[serde(default)]
    pub host: HostConfig,

    /// Explicit capability settings keyed by capability name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub caps: BTreeMap<String, ConfigValue>,
}

fn default_machine() -> String {
    DEFAULT_PROFILE.to_string()
}
fn default_cpu_type() -> String {
    DEFAULT_CPU_TYPE.to_string()
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            machine: default_machine(),
            cpu_type: default_cpu_type(),
            max_compat: None,
            host: HostConfig::default(),
            caps: BTreeMap::new(),
        }
    }
}

impl MachineConfig {
    /// A builder carrying every setting in this description.
    pub fn builder(&self) -> Result<MachineBuilder, String> {
        let mut builder = Machine::builder()
            .profile(&self.machine)
            .cpu_type(&self.cpu_type)
            .max_compat(self.max_compat)
            .backend(self.host.backend()?);
        for (name, value) in &self.caps {
            builder = builder.cap(name, value.to_raw());
        }
        Ok(builder)
    }

    /// Build the configured machine.
    pub fn build(&self) -> Result<Machine, String> {
        self.builder()?.build().map_err(|e| e.to_string())
    }
}

/// Return the path to `~/.partcap/machine.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".partcap").join("machine.toml")
}

/// Load the default config file.  Returns `None` if it does not exist.
pub fn load() -> Result<Option<MachineConfig>, String> {
    load_from(&config_path())
}

/// Load a config from a specific path and apply environment overrides.
pub fn load_from(path: &Path) -> Result<Option<MachineConfig>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: MachineConfig =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Load `path` when given, else the default file, else built-in defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<MachineConfig, String> {
    let loaded = match path {
        Some(p) if !p.exists() => return Err(format!("No config at {}", p.display())),
        Some(p) => load_from(p)?,
        None => load()?,
    };
    Ok(loaded.unwrap_or_else(|| {
        let mut cfg = MachineConfig::default();
        apply_env_overrides(&mut cfg);
        cfg
    }))
}

/// Apply `PARTCAP_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PARTCAP_MACHINE` | `machine` |
/// | `PARTCAP_CPU_TYPE` | `cpu_type` |
/// | `PARTCAP_MODE` | `host.mode` |
pub fn apply_env_overrides(cfg: &mut MachineConfig) {
    if let Ok(v) = std::env::var("PARTCAP_MACHINE") {
        cfg.machine = v;
    }
    if let Ok(v) = std::env::var("PARTCAP_CPU_TYPE") {
        cfg.cpu_type = v;
    }
    if let Ok(v) = std::env::var("PARTCAP_MODE")
        && let Ok(mode) = v.parse::<ExecMode>()
    {
        cfg.host.mode = mode;
    }
}

/// Save the config to a specific path, creating parent directories.
pub fn save_to(cfg: &MachineConfig, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}
