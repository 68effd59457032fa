//! YAML loading with custom tags
//!
//! - `!include path` - replace the node with another YAML file
//! - `!include_dir_merge_list dir` - concatenate the lists of every YAML
//!   file in a directory (handy for one file of actions per controller)
//! - `!secret key` - value from `secrets.yaml`
//! - `!env_var VAR` - value of an environment variable

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use crate::DaemonConfig;
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

/// Resolves tags while reading YAML files below a config directory
pub struct ConfigLoader {
    config_dir: PathBuf,
    secrets: Secrets,
    /// Files currently being read, innermost last
    stack: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Loader for `config_dir`, reading its `secrets.yaml` if present
    pub fn new(config_dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self::with_secrets(config_dir, secrets))
    }

    pub fn with_secrets(config_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets,
            stack: Vec::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Read a file and resolve every tag in it
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.config_dir.join(path.as_ref());
        self.read(path)
    }

    fn read(&mut self, path: PathBuf) -> ConfigResult<Value> {
        if self.stack.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }
        debug!(path = %path.display(), "Reading configuration file");

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        self.stack.push(path.clone());
        let result = self.load_str(&content, &path);
        self.stack.pop();
        result
    }

    /// Parse YAML text; relative includes resolve against `origin`'s directory
    pub fn load_str(&mut self, content: &str, origin: &Path) -> ConfigResult<Value> {
        let value: Value =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
                path: origin.to_path_buf(),
                source,
            })?;
        self.resolve(value, origin)
    }

    fn resolve(&mut self, value: Value, origin: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.resolve_tag(*tagged, origin),
            Value::Mapping(map) => {
                let mut resolved = Mapping::with_capacity(map.len());
                for (key, value) in map {
                    resolved.insert(key, self.resolve(value, origin)?);
                }
                Ok(Value::Mapping(resolved))
            }
            Value::Sequence(items) => items
                .into_iter()
                .map(|item| self.resolve(item, origin))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn resolve_tag(&mut self, tagged: TaggedValue, origin: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!(tag = %tag, "Resolving tag");

        match tag.as_str() {
            "!include" => {
                let path = self.tag_path(&tag, &tagged.value, origin)?;
                self.read(path)
            }
            "!include_dir_merge_list" => {
                let dir = self.tag_path(&tag, &tagged.value, origin)?;
                self.merge_dir_lists(&dir)
            }
            "!secret" => {
                let key = tag_string(&tag, &tagged.value)?;
                Ok(Value::String(self.secrets.get(key)?.to_string()))
            }
            "!env_var" => {
                let var = tag_string(&tag, &tagged.value)?;
                std::env::var(var)
                    .map(Value::String)
                    .map_err(|_| ConfigError::EnvVarNotFound {
                        var: var.to_string(),
                    })
            }
            _ => {
                let value = self.resolve(tagged.value, origin)?;
                Ok(Value::Tagged(Box::new(TaggedValue {
                    tag: tagged.tag,
                    value,
                })))
            }
        }
    }

    fn tag_path(&self, tag: &str, value: &Value, origin: &Path) -> ConfigResult<PathBuf> {
        let raw = Path::new(tag_string(tag, value)?);
        if raw.is_absolute() {
            return Ok(raw.to_path_buf());
        }
        let base = origin.parent().unwrap_or(&self.config_dir);
        Ok(base.join(raw))
    }

    fn merge_dir_lists(&mut self, dir: &Path) -> ConfigResult<Value> {
        let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::ReadFile {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        files.sort();

        let mut merged = Vec::new();
        for file in files {
            match self.read(file)? {
                Value::Sequence(items) => merged.extend(items),
                Value::Null => {}
                single => merged.push(single),
            }
        }
        Ok(Value::Sequence(merged))
    }
}

fn tag_string<'a>(tag: &str, value: &'a Value) -> ConfigResult<&'a str> {
    value.as_str().ok_or_else(|| ConfigError::InvalidTagArgument {
        tag: tag.to_string(),
    })
}

/// Load, deserialize and validate a daemon configuration file
///
/// Secrets are read from the file's directory.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<DaemonConfig> {
    let path = path.as_ref();
    let config_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().map(PathBuf::from).unwrap_or_default();

    let mut loader = ConfigLoader::new(config_dir)?;
    let value = loader.load_file(file_name)?;
    let config = DaemonConfig::from_value(value)?;

    info!(
        outputs = config.outputs.len(),
        controllers = config.controllers.len(),
        actions = config.actions.len(),
        "Configuration loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn get<'a>(value: &'a Value, key: &str) -> &'a Value {
        value.as_mapping().unwrap().get(key).unwrap()
    }

    #[test]
    fn test_include_relative_to_including_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "parts/outputs.yaml", "- id: fan\n");
        write(dir.path(), "parts/main.yaml", "outputs: !include outputs.yaml\n");

        let mut loader = ConfigLoader::new(dir.path()).unwrap();
        let value = loader.load_file("parts/main.yaml").unwrap();
        assert_eq!(get(&value, "outputs").as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn test_merge_dir_lists() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "actions/a.yaml", "- id: a1\n- id: a2\n");
        write(dir.path(), "actions/b.yml", "- id: b1\n");
        write(dir.path(), "actions/notes.txt", "ignored");
        write(dir.path(), "main.yaml", "actions: !include_dir_merge_list actions\n");

        let mut loader = ConfigLoader::new(dir.path()).unwrap();
        let value = loader.load_file("main.yaml").unwrap();
        let ids: Vec<&str> = get(&value, "actions")
            .as_sequence()
            .unwrap()
            .iter()
            .map(|a| get(a, "id").as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["a1", "a2", "b1"]);
    }

    #[test]
    fn test_secret_and_env_var() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "secrets.yaml", "hook: https://example.test/hook\n");
        std::env::set_var("HABCTL_LOADER_TEST_LEVEL", "debug");
        write(
            dir.path(),
            "main.yaml",
            "url: !secret hook\nlevel: !env_var HABCTL_LOADER_TEST_LEVEL\n",
        );

        let mut loader = ConfigLoader::new(dir.path()).unwrap();
        let value = loader.load_file("main.yaml").unwrap();
        assert_eq!(get(&value, "url").as_str(), Some("https://example.test/hook"));
        assert_eq!(get(&value, "level").as_str(), Some("debug"));
        std::env::remove_var("HABCTL_LOADER_TEST_LEVEL");
    }

    #[test]
    fn test_missing_env_var() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "main.yaml", "x: !env_var HABCTL_SURELY_UNSET_VAR\n");
        let mut loader = ConfigLoader::new(dir.path()).unwrap();
        assert!(matches!(
            loader.load_file("main.yaml"),
            Err(ConfigError::EnvVarNotFound { .. })
        ));
    }

    #[test]
    fn test_circular_include() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.yaml", "b: !include b.yaml\n");
        write(dir.path(), "b.yaml", "a: !include a.yaml\n");

        let mut loader = ConfigLoader::new(dir.path()).unwrap();
        assert!(matches!(
            loader.load_file("a.yaml"),
            Err(ConfigError::CircularInclude { .. })
        ));
    }

    #[test]
    fn test_non_string_tag_argument() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "main.yaml", "x: !secret [a, b]\n");
        let mut loader = ConfigLoader::new(dir.path()).unwrap();
        assert!(matches!(
            loader.load_file("main.yaml"),
            Err(ConfigError::InvalidTagArgument { .. })
        ));
    }
}
