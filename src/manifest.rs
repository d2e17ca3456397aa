//! The subset of a package manifest this crate consumes.
//!
//! The actual manifest file format (JSON, TOML, or anything else an
//! ecosystem uses) is a driver concern; this module only commits to the
//! schema described below, reached through the [`ManifestSource`] trait so a
//! driver can plug in whichever file format its ecosystem uses.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path::AbsDirPath;

/// A package manifest: the script table an ecosystem already understands,
/// plus the `wireit` block that opts individual scripts into this
/// orchestrator, plus a workspace glob list for `<workspaces>` expansion.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct PackageManifest {
    #[serde(default)]
    pub scripts: HashMap<String, String>,
    #[serde(default)]
    pub wireit: HashMap<String, WireitScript>,
    #[serde(default)]
    pub workspaces: Vec<String>,
    /// Declared runtime dependencies, for `<dependencies>` expansion. Keys
    /// are package names; values are ignored (version ranges, path specs,
    /// etc. are a driver concern).
    #[serde(default)]
    pub dependencies: HashMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireitScript {
    pub command: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    pub files: Option<Vec<String>>,
    pub output: Option<Vec<String>>,
    #[serde(default)]
    pub clean: CleanConfig,
    pub service: Option<ServiceConfig>,
    #[serde(default)]
    pub package_locks: Vec<String>,
    #[serde(default)]
    pub allow_usually_excluded_paths: bool,
    #[serde(default)]
    pub env: HashMap<String, EnvVarConfig>,
}

/// A dependency entry: either a bare specifier string (cascading by
/// default) or `{script, cascade?}`. `cascade: false` keeps the scheduling
/// edge but excludes the dependency's fingerprint from the dependent's own
/// (spec §3 invariant 4).
#[derive(Clone, Debug)]
pub struct DependencySpec {
    pub specifier: String,
    pub cascade: bool,
}

impl<'de> Deserialize<'de> for DependencySpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Full {
            script: String,
            #[serde(default = "default_cascade_true")]
            cascade: bool,
        }
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Full(Full),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => Ok(DependencySpec { specifier: s, cascade: true }),
            Raw::Full(f) => Ok(DependencySpec { specifier: f.script, cascade: f.cascade }),
        }
    }
}

fn default_cascade_true() -> bool {
    true
}

/// `clean?: (bool|"if-file-deleted")` in the schema.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum CleanConfig {
    #[default]
    Always,
    Never,
    IfFileDeleted,
}

impl Serialize for CleanConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(match self {
            CleanConfig::Always => "always",
            CleanConfig::Never => "never",
            CleanConfig::IfFileDeleted => "if-file-deleted",
        })
    }
}

impl<'de> Deserialize<'de> for CleanConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Tag(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Bool(true) => Ok(CleanConfig::Always),
            Raw::Bool(false) => Ok(CleanConfig::Never),
            Raw::Tag(s) if s == "if-file-deleted" => Ok(CleanConfig::IfFileDeleted),
            Raw::Tag(other) => Err(serde::de::Error::custom(format!(
                "invalid `clean` value: {other:?}, expected a boolean or \"if-file-deleted\""
            ))),
        }
    }
}

/// `service?: bool|{readyWhen?:{lineMatches?: string}}` in the schema.
#[derive(Clone, Debug, Default)]
pub struct ServiceConfig {
    pub ready_when_line_matches: Option<String>,
}

impl<'de> Deserialize<'de> for ServiceConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ReadyWhen {
            #[serde(rename = "lineMatches")]
            line_matches: Option<String>,
        }
        #[derive(Deserialize)]
        struct Full {
            #[serde(rename = "readyWhen")]
            ready_when: Option<ReadyWhen>,
        }
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Full(Full),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Bool(_) => Ok(ServiceConfig {
                ready_when_line_matches: None,
            }),
            Raw::Full(full) => Ok(ServiceConfig {
                ready_when_line_matches: full.ready_when.and_then(|r| r.line_matches),
            }),
        }
    }
}

/// `env: {var → {external:true} | {default:string}}` in the schema.
#[derive(Clone, Debug)]
pub enum EnvVarConfig {
    External,
    Default(String),
}

impl<'de> Deserialize<'de> for EnvVarConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            external: Option<bool>,
            default: Option<String>,
        }
        let raw = Raw::deserialize(deserializer)?;
        match (raw.external, raw.default) {
            (Some(true), _) => Ok(EnvVarConfig::External),
            (_, Some(default)) => Ok(EnvVarConfig::Default(default)),
            _ => Err(serde::de::Error::custom(
                "env var entry must set `external: true` or `default: <string>`",
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest not found: {0:?}")]
    Missing(std::path::PathBuf),
    #[error("read manifest {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path:?} at line {line}, column {column}: {message}")]
    Json {
        path: std::path::PathBuf,
        message: String,
        line: usize,
        column: usize,
    },
    #[error("invalid TOML in {path:?}: {message}")]
    Toml { path: std::path::PathBuf, message: String },
}

/// Parses a manifest's textual content into a [`PackageManifest`].
pub trait ManifestSource: Send + Sync {
    /// The conventional file name this source expects within a package
    /// directory, e.g. `package.json`.
    fn file_name(&self) -> &'static str;

    fn parse(&self, path: &std::path::Path, content: &str) -> Result<PackageManifest, ManifestError>;
}

pub struct JsonManifestSource;

impl ManifestSource for JsonManifestSource {
    fn file_name(&self) -> &'static str {
        "package.json"
    }

    fn parse(&self, path: &std::path::Path, content: &str) -> Result<PackageManifest, ManifestError> {
        serde_json::from_str(content).map_err(|e| ManifestError::Json {
            path: path.to_owned(),
            message: e.to_string(),
            line: e.line(),
            column: e.column(),
        })
    }
}

pub struct TomlManifestSource;

impl ManifestSource for TomlManifestSource {
    fn file_name(&self) -> &'static str {
        "package.toml"
    }

    fn parse(&self, path: &std::path::Path, content: &str) -> Result<PackageManifest, ManifestError> {
        toml::from_str(content).map_err(|e| ManifestError::Toml {
            path: path.to_owned(),
            message: e.to_string(),
        })
    }
}

/// Read and parse the manifest for `package_dir` using `source`.
pub async fn load(package_dir: &AbsDirPath, source: &dyn ManifestSource) -> Result<PackageManifest, ManifestError> {
    let path = package_dir.join_str_file(source.file_name());
    let content = tokio::fs::read_to_string(path.as_std_path())
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ManifestError::Missing(path.as_std_path().to_owned())
            } else {
                ManifestError::Io {
                    path: path.as_std_path().to_owned(),
                    source: e,
                }
            }
        })?;
    source.parse(path.as_std_path(), &content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_json_manifest() {
        let json = r#"{
            "scripts": { "build": "wireit" },
            "wireit": {
                "build": { "command": "tsc", "files": ["src/**"], "output": ["lib/**"] }
            }
        }"#;
        let source = JsonManifestSource;
        let manifest = source.parse(std::path::Path::new("package.json"), json).unwrap();
        assert_eq!(manifest.scripts.get("build"), Some(&"wireit".to_string()));
        let build = manifest.wireit.get("build").unwrap();
        assert_eq!(build.command.as_deref(), Some("tsc"));
        assert_eq!(build.clean, CleanConfig::Always);
    }

    #[test]
    fn clean_accepts_bool_and_tag() {
        let json = r#"{"command":"x","clean":false}"#;
        let script: WireitScript = serde_json::from_str(json).unwrap();
        assert_eq!(script.clean, CleanConfig::Never);

        let json = r#"{"command":"x","clean":"if-file-deleted"}"#;
        let script: WireitScript = serde_json::from_str(json).unwrap();
        assert_eq!(script.clean, CleanConfig::IfFileDeleted);
    }

    #[test]
    fn service_accepts_bool_and_ready_when() {
        let json = r#"{"command":"x","service":true}"#;
        let script: WireitScript = serde_json::from_str(json).unwrap();
        assert!(script.service.unwrap().ready_when_line_matches.is_none());

        let json = r#"{"command":"x","service":{"readyWhen":{"lineMatches":"^listening"}}}"#;
        let script: WireitScript = serde_json::from_str(json).unwrap();
        assert_eq!(script.service.unwrap().ready_when_line_matches.as_deref(), Some("^listening"));
    }

    #[test]
    fn dependency_accepts_bare_string_and_object_form() {
        let json = r#"{"command":"x","dependencies":["build", {"script":"test","cascade":false}]}"#;
        let script: WireitScript = serde_json::from_str(json).unwrap();
        assert_eq!(script.dependencies[0].specifier, "build");
        assert!(script.dependencies[0].cascade);
        assert_eq!(script.dependencies[1].specifier, "test");
        assert!(!script.dependencies[1].cascade);
    }

    #[test]
    fn json_syntax_error_reports_location() {
        let source = JsonManifestSource;
        let err = source.parse(std::path::Path::new("package.json"), "{ not json").unwrap_err();
        assert!(matches!(err, ManifestError::Json { .. }));
    }

    #[tokio::test]
    async fn missing_manifest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let err = load(&package_dir, &JsonManifestSource).await.unwrap_err();
        assert!(matches!(err, ManifestError::Missing(_)));
    }
}
