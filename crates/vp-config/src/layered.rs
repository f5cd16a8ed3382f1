use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Configuration files merged in order: base TOML, site TOML, run JSON.
#[derive(Clone, Debug, Default)]
pub struct ConfigLayering {
    pub base: Option<PathBuf>,
    pub site: Option<PathBuf>,
    pub run: Option<PathBuf>,
}

impl ConfigLayering {
    /// Discovers layers from `VISPRED_CONFIG_{ROOT,BASE,SITE,RUN}` or
    /// `~/.vispred`. Files that do not exist are ignored.
    pub fn discover() -> Self {
        let root = env_path("VISPRED_CONFIG_ROOT").unwrap_or_else(default_root);
        Self::discover_in(&root)
    }

    /// Discovers layers under `root`, still honouring per-layer env overrides.
    pub fn discover_in(root: &Path) -> Self {
        let locate = |layer: ConfigLayer| {
            existing(env_path(layer.env_var()).unwrap_or_else(|| root.join(layer.file_name())))
        };
        ConfigLayering {
            base: locate(ConfigLayer::Base),
            site: locate(ConfigLayer::Site),
            run: locate(ConfigLayer::Run),
        }
    }

    pub fn with_base<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.base = Some(path.into());
        self
    }

    pub fn with_site<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.site = Some(path.into());
        self
    }

    pub fn with_run<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.run = Some(path.into());
        self
    }

    /// Configured layers in merge order.
    fn ordered(&self) -> impl Iterator<Item = (ConfigLayer, &Path)> {
        [
            (ConfigLayer::Base, self.base.as_deref()),
            (ConfigLayer::Site, self.site.as_deref()),
            (ConfigLayer::Run, self.run.as_deref()),
        ]
        .into_iter()
        .filter_map(|(layer, path)| path.map(|path| (layer, path)))
    }
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.exists().then_some(path)
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var).map(PathBuf::from)
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".vispred"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Layer that produced a configuration change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigLayer {
    Base,
    Site,
    Run,
}

impl ConfigLayer {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigLayer::Base => "base",
            ConfigLayer::Site => "site",
            ConfigLayer::Run => "run",
        }
    }

    fn env_var(self) -> &'static str {
        match self {
            ConfigLayer::Base => "VISPRED_CONFIG_BASE",
            ConfigLayer::Site => "VISPRED_CONFIG_SITE",
            ConfigLayer::Run => "VISPRED_CONFIG_RUN",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            ConfigLayer::Base => "base.toml",
            ConfigLayer::Site => "site.toml",
            ConfigLayer::Run => "run.json",
        }
    }

    /// Base and site layers are TOML, the run layer is JSON.
    fn is_toml(self) -> bool {
        !matches!(self, ConfigLayer::Run)
    }
}

impl fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One leaf value changed by a layer, addressed by a dotted path.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigDiffEvent {
    pub layer: ConfigLayer,
    pub path: String,
    pub previous: Option<Value>,
    pub current: Option<Value>,
}

/// Result of merging layered configuration files.
#[derive(Clone, Debug)]
pub struct LayeredConfig {
    layering: ConfigLayering,
    value: Value,
    events: Vec<ConfigDiffEvent>,
}

impl LayeredConfig {
    /// Loads the configured layers, merging base → site → run.
    pub fn load(layering: ConfigLayering) -> Result<Self, LayeredConfigError> {
        let mut value = Value::Object(Default::default());
        let mut events = Vec::new();
        for (layer, path) in layering.ordered() {
            let Some(source) = read_layer(path, layer)? else {
                continue;
            };
            let before = events.len();
            merge_recording(&mut value, source, &mut Vec::new(), layer, &mut events);
            debug!(
                layer = %layer,
                path = %path.display(),
                changes = events.len() - before,
                "config layer merged"
            );
        }
        Ok(LayeredConfig {
            layering,
            value,
            events,
        })
    }

    /// Wraps an in-memory value, e.g. one assembled by a test or a CLI.
    pub fn from_value(value: Value) -> Self {
        LayeredConfig {
            layering: ConfigLayering::default(),
            value,
            events: Vec::new(),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn layering(&self) -> &ConfigLayering {
        &self.layering
    }

    pub fn events(&self) -> &[ConfigDiffEvent] {
        &self.events
    }

    /// Extracts a typed view of a nested section. Returns `Ok(None)` when the
    /// path does not exist.
    pub fn section<T>(&self, path: &[&str]) -> Result<Option<T>, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        let mut node = &self.value;
        for key in path {
            match node {
                Value::Object(map) => match map.get(*key) {
                    Some(value) => node = value,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            }
        }
        serde_json::from_value(node.clone()).map(Some)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayeredConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse JSON {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn read_layer(path: &Path, layer: ConfigLayer) -> Result<Option<Value>, LayeredConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|source| LayeredConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let json = |source| LayeredConfigError::Json {
        path: path.to_path_buf(),
        source,
    };
    if layer.is_toml() {
        let table: toml::Value =
            toml::from_str(&text).map_err(|source| LayeredConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::to_value(table).map(Some).map_err(json)
    } else {
        serde_json::from_str(&text).map(Some).map_err(json)
    }
}

/// Deep-merges `src` into `dest`, recording one event per replaced leaf.
/// Objects merge key by key; any other value replaces the destination.
fn merge_recording(
    dest: &mut Value,
    src: Value,
    path: &mut Vec<String>,
    layer: ConfigLayer,
    events: &mut Vec<ConfigDiffEvent>,
) {
    match (dest, src) {
        (Value::Object(dest_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                path.push(key.clone());
                let slot = dest_map.entry(key).or_insert(Value::Null);
                merge_recording(slot, value, path, layer, events);
                path.pop();
            }
        }
        (slot, value) => {
            if *slot == value {
                return;
            }
            if value.is_object() {
                // a new subtree: report its leaves individually
                let previous = std::mem::replace(slot, Value::Object(Default::default()));
                if !previous.is_null() {
                    events.push(ConfigDiffEvent {
                        layer,
                        path: path.join("."),
                        previous: Some(previous),
                        current: None,
                    });
                }
                merge_recording(slot, value, path, layer, events);
                return;
            }
            let previous = std::mem::replace(slot, value);
            events.push(ConfigDiffEvent {
                layer,
                path: path.join("."),
                previous: (!previous.is_null()).then_some(previous),
                current: (!slot.is_null()).then(|| slot.clone()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_layers_and_reports_diffs() {
        let root = tempfile::tempdir().unwrap();

        let base = root.path().join("base.toml");
        fs::write(
            &base,
            r#"
            [model.modulator]
            include_gain = false
            diff_reg = 1000.0
            "#,
        )
        .unwrap();

        let site = root.path().join("site.toml");
        fs::write(
            &site,
            r#"
            [model.modulator]
            include_gain = true
            gain_kernel_std = 20.0
            "#,
        )
        .unwrap();

        let run = root.path().join("run.json");
        fs::write(&run, r#"{"model":{"modulator":{"diff_reg":10.0}}}"#).unwrap();

        let layering = ConfigLayering::default()
            .with_base(&base)
            .with_site(&site)
            .with_run(&run);
        let stacked = LayeredConfig::load(layering).unwrap();

        let modulator: Value = stacked
            .section::<Value>(&["model", "modulator"])
            .unwrap()
            .unwrap();
        assert_eq!(modulator["include_gain"], Value::from(true));
        assert_eq!(modulator["diff_reg"], Value::from(10.0));
        assert_eq!(modulator["gain_kernel_std"], Value::from(20.0));

        let events = stacked.events();
        assert!(events.iter().any(|event| {
            event.layer == ConfigLayer::Run
                && event.path == "model.modulator.diff_reg"
                && event.previous == Some(Value::from(1000.0))
        }));
        assert!(events.iter().any(|event| {
            event.layer == ConfigLayer::Site
                && event.path == "model.modulator.gain_kernel_std"
                && event.previous.is_none()
        }));
    }

    #[test]
    fn missing_section_is_none() {
        let stacked = LayeredConfig::from_value(serde_json::json!({"model": {}}));
        let section: Option<Value> = stacked.section(&["model", "shifter"]).unwrap();
        assert!(section.is_none());
    }

    #[test]
    fn malformed_toml_is_reported_with_path() {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().join("base.toml");
        fs::write(&base, "[model\n").unwrap();
        let err = LayeredConfig::load(ConfigLayering::default().with_base(&base)).unwrap_err();
        assert!(matches!(err, LayeredConfigError::Toml { .. }));
    }
}
