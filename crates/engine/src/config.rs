use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use verlay_sandbox::{normalize_path, SandboxLimits, DEFAULT_EXTENSION};
use verlay_tree::merge_json;

use crate::error::ConfigError;

pub const CONFIG_FILE_NAME: &str = "verlay.json";

/// Settings for one source tree and its version directory.
/// 單一來源樹及其版本目錄的設定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerlayConfig {
    pub source_root: PathBuf,
    pub target_root: PathBuf,
    #[serde(default = "default_true")]
    pub auto_build: bool,
    /// Script extensions without the leading dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Entry names matching any of these patterns are never walked.
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub sandbox: SandboxLimits,
}

fn default_true() -> bool {
    true
}

fn default_extensions() -> Vec<String> {
    vec![DEFAULT_EXTENSION.to_string()]
}

fn default_ignore() -> Vec<String> {
    vec![r"^\.".to_string()]
}

impl VerlayConfig {
    pub fn new(source_root: impl Into<PathBuf>, target_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            target_root: target_root.into(),
            auto_build: true,
            extensions: default_extensions(),
            ignore: default_ignore(),
            sandbox: SandboxLimits::default(),
        }
    }

    pub fn with_auto_build(mut self, auto_build: bool) -> Self {
        self.auto_build = auto_build;
        self
    }

    /// Loads a config file, layering it over the defaults. Relative roots
    /// are resolved against the file's directory.
    /// 載入設定檔並覆蓋在預設值之上；相對路徑以設定檔所在目錄為基準。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents, path)
    }

    fn from_json_str(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let overlay: Value = serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let mut layered = defaults_value();
        merge_json(&mut layered, overlay);
        let mut config: VerlayConfig =
            serde_json::from_value(layered).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        config.source_root = anchor(base_dir, &config.source_root);
        config.target_root = anchor(base_dir, &config.target_root);
        config.sanitize();
        config.ignore_patterns()?;
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        let mut extensions: Vec<String> = Vec::with_capacity(self.extensions.len());
        for ext in &self.extensions {
            let ext = ext.trim().trim_start_matches('.').to_string();
            if !ext.is_empty() && !extensions.contains(&ext) {
                extensions.push(ext);
            }
        }
        if extensions.is_empty() {
            extensions = default_extensions();
        }
        self.extensions = extensions;
        self.ignore.retain(|pattern| !pattern.trim().is_empty());
        self.sandbox.sanitize();
    }

    pub fn ignore_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.ignore
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect()
    }

    /// True when `path` carries one of the configured script extensions.
    pub fn is_script(&self, path: &Path) -> bool {
        has_script_extension(path, &self.extensions)
    }
}

/// True when `path` ends in one of `extensions`.
/// 判斷 `path` 的副檔名是否屬於 `extensions`。
pub(crate) fn has_script_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|known| known == ext))
        .unwrap_or(false)
}

fn defaults_value() -> Value {
    json!({
        "auto_build": true,
        "extensions": default_extensions(),
        "ignore": default_ignore(),
        "sandbox": SandboxLimits::default(),
    })
}

fn anchor(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&base_dir.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_layers_file_over_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"{ "source_root": "src", "target_root": "src/versions", "sandbox": { "max_call_depth": 8 } }"#,
        )
        .unwrap();

        let config = VerlayConfig::load(&path).unwrap();
        assert_eq!(config.source_root, dir.path().join("src"));
        assert_eq!(config.target_root, dir.path().join("src/versions"));
        assert!(config.auto_build);
        assert_eq!(config.extensions, vec!["rhai".to_string()]);
        assert_eq!(config.sandbox.max_call_depth, 8);
        assert_eq!(
            config.sandbox.max_expr_depth,
            SandboxLimits::default().max_expr_depth
        );
    }

    #[test]
    fn sanitize_normalizes_extensions() {
        let mut config = VerlayConfig::new("/a", "/a/v");
        config.extensions = vec![".rhai".into(), "rhai".into(), " ".into(), "script".into()];
        config.sanitize();
        assert_eq!(config.extensions, vec!["rhai".to_string(), "script".to_string()]);

        config.extensions.clear();
        config.sanitize();
        assert_eq!(config.extensions, default_extensions());
    }

    #[test]
    fn invalid_ignore_pattern_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"{ "source_root": "/s", "target_root": "/t", "ignore": ["("] }"#,
        )
        .unwrap();

        let err = VerlayConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn missing_roots_fail_to_parse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{ "auto_build": false }"#).unwrap();
        assert!(matches!(
            VerlayConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn default_ignore_hides_dotfiles() {
        let config = VerlayConfig::new("/s", "/t");
        let patterns = config.ignore_patterns().unwrap();
        assert!(patterns.iter().any(|re| re.is_match(".git")));
        assert!(!patterns.iter().any(|re| re.is_match("index.rhai")));
        assert!(config.is_script(Path::new("/s/index.rhai")));
        assert!(!config.is_script(Path::new("/s/notes.txt")));
    }
}
