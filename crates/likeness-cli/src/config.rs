use anyhow::{Context, Result};
use likeness_core::normalize::DEFAULT_MAX_WIDTH;
use likeness_core::{MatchPolicy, DEFAULT_TOLERANCE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI configuration: defaults, then the TOML file, then `LIKENESS_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gallery file (default: $XDG_DATA_HOME/likeness/gallery.json).
    pub gallery_path: PathBuf,
    /// Directory containing det_10g.onnx and w600k_r50.onnx.
    pub model_dir: PathBuf,
    /// V4L2 device used for single-subject capture.
    pub camera_device: String,
    /// Maximum Euclidean distance counted as a match (inclusive).
    pub tolerance: f32,
    /// Images wider than this are downscaled before detection.
    pub max_width: u32,
    pub match_policy: MatchPolicy,
    /// Frames discarded while the camera's auto exposure settles.
    pub warmup_frames: usize,
    /// Frames examined for a non-dark capture before giving up.
    pub capture_attempts: usize,
    /// TrueType font for annotation labels (default: first DejaVu or Liberation Sans found).
    pub label_font: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            gallery_path: data_dir.join("gallery.json"),
            model_dir: data_dir.join("models"),
            camera_device: "/dev/video0".to_string(),
            tolerance: DEFAULT_TOLERANCE,
            max_width: DEFAULT_MAX_WIDTH,
            match_policy: MatchPolicy::default(),
            warmup_frames: 5,
            capture_attempts: 10,
            label_font: None,
        }
    }
}

impl Config {
    /// Load from the process environment and the default config file location.
    pub fn load() -> Result<Self> {
        let file = std::env::var_os("LIKENESS_CONFIG")
            .map(PathBuf::from)
            .or_else(|| config_home().map(|dir| dir.join("likeness/config.toml")));
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Layer an optional TOML file and an environment lookup over the defaults.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn from_sources(
        file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = match file {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config at {}", path.display()))?;
                let config: Config = toml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?;
                tracing::debug!(path = %path.display(), "loaded config file");
                config
            }
            _ => Config::default(),
        };

        if let Some(v) = env("LIKENESS_GALLERY_PATH") {
            config.gallery_path = PathBuf::from(v);
        }
        if let Some(v) = env("LIKENESS_MODEL_DIR") {
            config.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("LIKENESS_CAMERA_DEVICE") {
            config.camera_device = v;
        }
        if let Some(v) = env("LIKENESS_LABEL_FONT") {
            config.label_font = Some(PathBuf::from(v));
        }
        override_parsed(&env, "LIKENESS_TOLERANCE", &mut config.tolerance);
        override_parsed(&env, "LIKENESS_MAX_WIDTH", &mut config.max_width);
        override_parsed(&env, "LIKENESS_MATCH_POLICY", &mut config.match_policy);
        override_parsed(&env, "LIKENESS_WARMUP_FRAMES", &mut config.warmup_frames);
        override_parsed(&env, "LIKENESS_CAPTURE_ATTEMPTS", &mut config.capture_attempts);

        Ok(config)
    }
}

/// Replace `slot` with the parsed variable; unparsable values are logged and ignored.
fn override_parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("likeness")
}

fn config_home() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = Config::from_sources(None, env_of(&[])).unwrap();
        assert_eq!(config.tolerance, 0.6);
        assert_eq!(config.max_width, 800);
        assert_eq!(config.match_policy, MatchPolicy::First);
        assert!(config.gallery_path.ends_with("likeness/gallery.json"));
    }

    #[test]
    fn test_file_then_env_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "tolerance = 0.5\nmatch_policy = \"nearest\"\ncamera_device = \"/dev/video4\"\n",
        )
        .unwrap();

        let config = Config::from_sources(
            Some(&path),
            env_of(&[("LIKENESS_TOLERANCE", "0.45"), ("LIKENESS_MAX_WIDTH", "640")]),
        )
        .unwrap();

        assert_eq!(config.tolerance, 0.45);
        assert_eq!(config.max_width, 640);
        assert_eq!(config.match_policy, MatchPolicy::Nearest);
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.warmup_frames, 5);
        assert_eq!(config.label_font, None);
    }

    #[test]
    fn test_label_font_from_file_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "label_font = \"/opt/fonts/a.ttf\"\n").unwrap();

        let config = Config::from_sources(Some(&path), env_of(&[])).unwrap();
        assert_eq!(config.label_font, Some(PathBuf::from("/opt/fonts/a.ttf")));

        let config =
            Config::from_sources(Some(&path), env_of(&[("LIKENESS_LABEL_FONT", "/b.ttf")])).unwrap();
        assert_eq!(config.label_font, Some(PathBuf::from("/b.ttf")));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_sources(Some(&dir.path().join("absent.toml")), env_of(&[])).unwrap();
        assert_eq!(config, Config::from_sources(None, env_of(&[])).unwrap());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "tolerance = \"strict\"").unwrap();
        assert!(Config::from_sources(Some(&path), env_of(&[])).is_err());
    }

    #[test]
    fn test_unparsable_env_is_ignored() {
        let config = Config::from_sources(
            None,
            env_of(&[("LIKENESS_TOLERANCE", "tight"), ("LIKENESS_MATCH_POLICY", "Nearest")]),
        )
        .unwrap();
        assert_eq!(config.tolerance, DEFAULT_TOLERANCE);
        assert_eq!(config.match_policy, MatchPolicy::Nearest);
    }
}
