//! Locator configuration.
//!
//! Layering, later wins: built-in defaults, a JSON file, environment
//! variables, then whatever the caller sets explicitly (CLI flags).

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const CONFIG_ENV: &str = "IMAGE_LOCATOR_CONFIG";
pub const LOOK_BEHIND_ENV: &str = "IMAGE_LOCATOR_LOOK_BEHIND";
pub const RADIUS_ENV: &str = "IMAGE_LOCATOR_RADIUS";
pub const OUT_DIR_ENV: &str = "IMAGE_LOCATOR_OUT_DIR";

pub const DEFAULT_NEIGHBORHOOD_RADIUS: f64 = 10.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown look-behind strategy {0:?} (expected occlusion-probe or bounds-check)")]
    UnknownLookBehind(String),

    #[error("neighborhood radius must be a finite, non-negative number, got {0:?}")]
    InvalidRadius(String),
}

/// How the locator looks behind the topmost elements of the hit-test stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LookBehind {
    /// Temporarily removes each candidate from hit-testing and re-queries
    /// the point. Mutates the document for the duration of one probe.
    OcclusionProbe,
    /// Checks candidate bounds, lowest stacking order first. Read-only.
    #[default]
    BoundsCheck,
}

impl LookBehind {
    pub fn as_str(self) -> &'static str {
        match self {
            LookBehind::OcclusionProbe => "occlusion-probe",
            LookBehind::BoundsCheck => "bounds-check",
        }
    }
}

impl fmt::Display for LookBehind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LookBehind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "occlusion-probe" | "probe" => Ok(LookBehind::OcclusionProbe),
            "bounds-check" | "bounds" => Ok(LookBehind::BoundsCheck),
            other => Err(ConfigError::UnknownLookBehind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub look_behind: LookBehind,
    pub ancestor_traversal: bool,
    pub descendant_scan: bool,
    pub neighborhood_scan: bool,
    pub neighborhood_radius: f64,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            look_behind: LookBehind::default(),
            ancestor_traversal: true,
            descendant_scan: true,
            neighborhood_scan: true,
            neighborhood_radius: DEFAULT_NEIGHBORHOOD_RADIUS,
        }
    }
}

impl LocatorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: LocatorConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, overlaid with `path` (or the file named by
    /// `IMAGE_LOCATOR_CONFIG`) and then the environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path.map(Path::to_path_buf).or_else(|| {
            env::var(CONFIG_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        });
        let base = match file {
            Some(file) => Self::from_file(&file)?,
            None => Self::default(),
        };
        base.with_env_overrides(|key| env::var(key).ok())
    }

    /// Applies `IMAGE_LOCATOR_LOOK_BEHIND` and `IMAGE_LOCATOR_RADIUS` as
    /// reported by `lookup`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(LOOK_BEHIND_ENV).filter(|v| !v.trim().is_empty()) {
            self.look_behind = raw.parse()?;
        }
        if let Some(raw) = lookup(RADIUS_ENV).filter(|v| !v.trim().is_empty()) {
            self.neighborhood_radius = parse_radius(&raw)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.neighborhood_radius.is_finite() || self.neighborhood_radius < 0.0 {
            return Err(ConfigError::InvalidRadius(
                self.neighborhood_radius.to_string(),
            ));
        }
        Ok(())
    }
}

pub fn parse_radius(raw: &str) -> Result<f64, ConfigError> {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
        _ => Err(ConfigError::InvalidRadius(raw.to_string())),
    }
}

/// Root directory for saved locate payloads.
pub fn out_root() -> PathBuf {
    env::var(OUT_DIR_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".image-locator"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_values_overlay_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locator.json");
        fs::write(
            &path,
            r#"{"look_behind": "occlusion-probe", "neighborhood_scan": false}"#,
        )
        .unwrap();

        let config = LocatorConfig::from_file(&path).unwrap();
        assert_eq!(config.look_behind, LookBehind::OcclusionProbe);
        assert!(!config.neighborhood_scan);
        assert!(config.ancestor_traversal);
        assert_eq!(config.neighborhood_radius, DEFAULT_NEIGHBORHOOD_RADIUS);
    }

    #[test]
    fn env_overrides_file() {
        let config = LocatorConfig::default()
            .with_env_overrides(|key| match key {
                LOOK_BEHIND_ENV => Some("probe".to_string()),
                RADIUS_ENV => Some("4.5".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.look_behind, LookBehind::OcclusionProbe);
        assert_eq!(config.neighborhood_radius, 4.5);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            "sideways".parse::<LookBehind>(),
            Err(ConfigError::UnknownLookBehind(_))
        ));
        assert!(matches!(parse_radius("-1"), Err(ConfigError::InvalidRadius(_))));
        assert!(matches!(parse_radius("NaN"), Err(ConfigError::InvalidRadius(_))));

        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"neighborhood_radius": -2}"#).unwrap();
        assert!(matches!(
            LocatorConfig::from_file(&path),
            Err(ConfigError::InvalidRadius(_))
        ));
    }
}
