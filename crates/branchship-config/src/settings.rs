//! Build configuration and its KDL parser.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything the build engine needs to know about the project it builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Root of the version-controlled working copy.
    pub project_path: PathBuf,
    pub build_command: String,
    pub install_command: String,
    /// Directory (relative to the project) whose presence means dependencies are installed.
    pub dependency_dir: String,
    /// Build output directory, relative to the project.
    pub output_dir: String,
    /// Where finished archives are written.
    pub archive_dir: PathBuf,
    /// Reinstall dependencies on every build even when they are present.
    pub always_reinstall: bool,
    /// Fetch and pull before building. When off, the local branch is built as-is.
    pub auto_fetch_pull: bool,
    /// Deflate level, 1 (fastest) to 9 (smallest).
    pub compression_level: u8,
    /// Empty means every branch is allowed.
    pub allowed_branches: Vec<String>,
    /// Empty means every requester is allowed.
    pub allowed_requesters: Vec<String>,
    pub split: Option<SplitConfig>,
    pub timings: Timings,
}

/// Splitting of large archives before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Archives larger than this are split.
    pub threshold_mb: u64,
    pub chunk_mb: u64,
}

/// Fixed delays and retry counts used by the pipeline and scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    /// Attempts for remote refresh and pull.
    pub sync_attempts: u32,
    /// Pause between failed sync attempts.
    pub sync_backoff: Duration,
    /// How often synthetic build progress is reported.
    pub progress_interval: Duration,
    /// Assumed typical build duration used to extrapolate progress.
    pub expected_build: Duration,
    /// Pause after a task finishes before the next one is dispatched.
    pub settle_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            sync_attempts: 3,
            sync_backoff: Duration::from_secs(3),
            progress_interval: Duration::from_secs(15),
            expected_build: Duration::from_secs(180),
            settle_delay: Duration::from_secs(2),
        }
    }
}

impl BuildConfig {
    /// Configuration with defaults for everything but the working copy.
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            build_command: "npm run build".to_string(),
            install_command: "npm install".to_string(),
            dependency_dir: "node_modules".to_string(),
            output_dir: "dist".to_string(),
            archive_dir: PathBuf::from("./builds"),
            always_reinstall: false,
            auto_fetch_pull: true,
            compression_level: 6,
            allowed_branches: Vec::new(),
            allowed_requesters: Vec::new(),
            split: None,
            timings: Timings::default(),
        }
    }

    pub fn is_branch_allowed(&self, branch: &str) -> bool {
        self.allowed_branches.is_empty() || self.allowed_branches.iter().any(|b| b == branch)
    }

    pub fn is_requester_allowed(&self, requester: &str) -> bool {
        self.allowed_requesters.is_empty() || self.allowed_requesters.iter().any(|r| r == requester)
    }

    pub fn output_path(&self) -> PathBuf {
        self.project_path.join(&self.output_dir)
    }

    pub fn dependency_path(&self) -> PathBuf {
        self.project_path.join(&self.dependency_dir)
    }

    /// Resolve relative paths against `base`.
    pub fn resolve_relative_to(mut self, base: &Path) -> Self {
        if self.project_path.is_relative() {
            self.project_path = base.join(&self.project_path);
        }
        if self.archive_dir.is_relative() {
            self.archive_dir = base.join(&self.archive_dir);
        }
        self
    }
}

/// Read and parse a configuration file. Relative paths inside it are resolved
/// against the file's directory.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<BuildConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    Ok(config.resolve_relative_to(base))
}

/// Parse a build configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<BuildConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let project = doc
        .get("project")
        .and_then(get_first_string_arg)
        .ok_or_else(|| ConfigError::MissingField("project".to_string()))?;

    let mut config = BuildConfig::new(project);

    for node in doc.nodes() {
        match node.name().value() {
            "build" => parse_build(node, &mut config)?,
            "allowed-branches" => config.allowed_branches = get_all_string_args(node),
            "allowed-requesters" => config.allowed_requesters = get_all_string_args(node),
            "split" => config.split = Some(parse_split(node)?),
            "scheduler" => {
                if let Some(secs) = get_u64_prop(node, "settle-delay-secs")? {
                    config.timings.settle_delay = Duration::from_secs(secs);
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_build(node: &KdlNode, config: &mut BuildConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        match child.name().value() {
            "command" => {
                let command = get_first_string_arg(child).unwrap_or_default();
                if command.trim().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "build.command".to_string(),
                        message: "must not be empty".to_string(),
                    });
                }
                config.build_command = command;
            }
            "install-command" => {
                if let Some(cmd) = get_first_string_arg(child) {
                    config.install_command = cmd;
                }
            }
            "dependency-dir" => {
                if let Some(dir) = get_first_string_arg(child) {
                    config.dependency_dir = dir;
                }
            }
            "output-dir" => {
                if let Some(dir) = get_first_string_arg(child) {
                    config.output_dir = dir;
                }
            }
            "archive-dir" => {
                if let Some(dir) = get_first_string_arg(child) {
                    config.archive_dir = PathBuf::from(dir);
                }
            }
            "always-reinstall" => {
                config.always_reinstall = get_first_bool_arg(child, "build.always-reinstall")?;
            }
            "auto-fetch-pull" => {
                config.auto_fetch_pull = get_first_bool_arg(child, "build.auto-fetch-pull")?;
            }
            "compression-level" => {
                let level = get_first_int_arg(child).ok_or_else(|| ConfigError::InvalidValue {
                    field: "build.compression-level".to_string(),
                    message: "expected an integer".to_string(),
                })?;
                if !(1..=9).contains(&level) {
                    return Err(ConfigError::InvalidValue {
                        field: "build.compression-level".to_string(),
                        message: format!("{} is outside 1..=9", level),
                    });
                }
                config.compression_level = level as u8;
            }
            _ => {}
        }
    }

    Ok(())
}

fn parse_split(node: &KdlNode) -> ConfigResult<SplitConfig> {
    let threshold_mb = get_u64_prop(node, "threshold-mb")?
        .ok_or_else(|| ConfigError::MissingField("split threshold-mb".to_string()))?;
    let chunk_mb = get_u64_prop(node, "chunk-mb")?
        .ok_or_else(|| ConfigError::MissingField("split chunk-mb".to_string()))?;

    if chunk_mb == 0 {
        return Err(ConfigError::InvalidValue {
            field: "split.chunk-mb".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    Ok(SplitConfig {
        threshold_mb,
        chunk_mb,
    })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_first_bool_arg(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected #true or #false".to_string(),
        })
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|v| u64::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: name.to_string(),
                message: "expected a non-negative integer".to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = parse_config(r#"project "../web-app""#).unwrap();
        assert_eq!(config.project_path, PathBuf::from("../web-app"));
        assert_eq!(config.build_command, "npm run build");
        assert_eq!(config.output_dir, "dist");
        assert_eq!(config.compression_level, 6);
        assert!(config.auto_fetch_pull);
        assert!(!config.always_reinstall);
        assert!(config.split.is_none());
        assert_eq!(config.timings, Timings::default());
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            project "/srv/web"

            build {
                command "pnpm build"
                install-command "pnpm install"
                dependency-dir "node_modules"
                output-dir "out"
                archive-dir "/var/builds"
                always-reinstall #true
                auto-fetch-pull #false
                compression-level 1
            }

            allowed-branches "main" "release"
            allowed-requesters "1001"
            split threshold-mb=20 chunk-mb=10
            scheduler settle-delay-secs=5
        "#;

        let config = parse_config(kdl).unwrap();
        assert_eq!(config.build_command, "pnpm build");
        assert_eq!(config.install_command, "pnpm install");
        assert_eq!(config.output_dir, "out");
        assert_eq!(config.archive_dir, PathBuf::from("/var/builds"));
        assert!(config.always_reinstall);
        assert!(!config.auto_fetch_pull);
        assert_eq!(config.compression_level, 1);
        assert_eq!(config.allowed_branches, vec!["main", "release"]);
        assert_eq!(config.allowed_requesters, vec!["1001"]);
        assert_eq!(
            config.split,
            Some(SplitConfig {
                threshold_mb: 20,
                chunk_mb: 10
            })
        );
        assert_eq!(config.timings.settle_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_project() {
        let result = parse_config(r#"build { command "make" }"#);
        assert!(matches!(result.unwrap_err(), ConfigError::MissingField(_)));
    }

    #[test]
    fn test_compression_level_out_of_range() {
        let kdl = r#"
            project "."
            build {
                compression-level 12
            }
        "#;
        let result = parse_config(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_empty_build_command_rejected() {
        let kdl = r#"
            project "."
            build {
                command ""
            }
        "#;
        assert!(parse_config(kdl).is_err());
    }

    #[test]
    fn test_allow_lists_empty_means_unrestricted() {
        let mut config = BuildConfig::new(".");
        assert!(config.is_branch_allowed("anything"));
        assert!(config.is_requester_allowed("anyone"));

        config.allowed_branches = vec!["main".to_string()];
        assert!(config.is_branch_allowed("main"));
        assert!(!config.is_branch_allowed("dev"));
    }

    #[test]
    fn test_load_config_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("branchship.kdl");
        std::fs::write(&path, "project \"web\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.project_path, dir.path().join("web"));
        assert_eq!(config.archive_dir, dir.path().join("./builds"));
    }
}
