use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::FlowlineConfig,
};

/// Config file names, checked in order in each directory.
pub const CONFIG_FILENAMES: &[&str] = &[
    "flowline.toml",
    "flowline.yaml",
    "flowline.yml",
    "flowline.json",
];

/// Supported formats, picked by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Yaml,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        match ext {
            "toml" => Ok(Self::Toml),
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            other => Err(Error::UnsupportedFormat {
                extension: other.to_string(),
            }),
        }
    }
}

/// A config together with the file it came from, if any.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub path: Option<PathBuf>,
    pub config: FlowlineConfig,
}

/// Read `path` with `${ENV}` substitution applied.
pub fn read_config_text(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(substitute_env(&raw))
}

/// All formats go through the same JSON tree, so they accept exactly the
/// same documents.
pub fn load_config(path: &Path) -> Result<FlowlineConfig> {
    let value = load_config_value(path)?;
    serde_json::from_value(value).map_err(|e| Error::parse(path, e))
}

/// Load `path` as a generic JSON tree, whatever its format.
pub fn load_config_value(path: &Path) -> Result<serde_json::Value> {
    let format = Format::from_path(path)?;
    let raw = read_config_text(path)?;
    parse_value(format, &raw).map_err(|e| Error::parse(path, e))
}

pub(crate) fn parse_value(format: Format, raw: &str) -> std::result::Result<serde_json::Value, String> {
    match format {
        Format::Toml => {
            let v: toml::Value = toml::from_str(raw).map_err(|e| e.to_string())?;
            serde_json::to_value(v).map_err(|e| e.to_string())
        },
        Format::Yaml => {
            let v: serde_yaml::Value = serde_yaml::from_str(raw).map_err(|e| e.to_string())?;
            // an empty YAML document is null; treat it as an empty config
            if v.is_null() {
                return Ok(serde_json::Value::Object(Default::default()));
            }
            serde_json::to_value(v).map_err(|e| e.to_string())
        },
        Format::Json => serde_json::from_str(raw).map_err(|e| e.to_string()),
    }
}

/// Load `explicit` if given, else the first discovered file, else defaults.
///
/// An explicit path that does not exist is an error; a discovered file that
/// fails to parse is also an error rather than a silent fallback.
pub fn load_or_default(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => find_config_file(),
    };
    let Some(path) = path else {
        debug!("no config file found, using defaults");
        return Ok(LoadedConfig::default());
    };
    let config = load_config(&path)?;
    info!(path = %path.display(), "loaded config");
    Ok(LoadedConfig {
        path: Some(path),
        config,
    })
}

/// First config file in `./`, then in the user config directory.
pub fn find_config_file() -> Option<PathBuf> {
    find_in(Path::new(".")).or_else(|| config_dir().and_then(|dir| find_in(&dir)))
}

pub(crate) fn find_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// User-global config directory, e.g. `~/.config/flowline/`.
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "flowline").map(|d| d.config_dir().to_path_buf())
}

/// Render a config as pretty TOML.
pub fn to_toml_string(config: &FlowlineConfig) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}
