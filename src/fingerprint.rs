//! Canonical fingerprint assembly and hashing (spec §4.3).
//!
//! A fingerprint is a canonical JSON object with a fixed field order, hashed
//! with SHA-256. Two scripts with the same fingerprint are expected to
//! produce the same outputs, which is what lets the Executor skip a script
//! ("fresh") or restore its outputs from the cache instead of running it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    analyzer::{Dependency, ScriptConfig, ScriptReference},
    glob,
    manifest::CleanConfig,
    path::AbsDirPath,
    runtime::Runtime,
};

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("glob input files: {0}")]
    Glob(#[from] glob::GlobError),
    #[error("read input file {0:?}: {1}")]
    Read(std::path::PathBuf, #[source] std::io::Error),
    #[error("input file(s) deleted unexpectedly: {0:?}")]
    InputFileDeletedUnexpectedly(Vec<String>),
    #[error("serialize fingerprint: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The platform/runtime triple a fingerprint is computed against. An
/// ecosystem driver supplies `runtime_version` (e.g. the Node.js version in
/// use); `platform`/`arch` default to the host's.
#[derive(Clone, Debug)]
pub struct PlatformInfo {
    pub platform: String,
    pub arch: String,
    pub runtime_version: String,
}

impl PlatformInfo {
    pub fn host(runtime: &dyn Runtime, runtime_version: impl Into<String>) -> Self {
        Self {
            platform: runtime.platform().to_string(),
            arch: runtime.arch().to_string(),
            runtime_version: runtime_version.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadyWhenFingerprint {
    #[serde(rename = "lineMatches")]
    pub line_matches: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceFingerprint {
    #[serde(rename = "readyWhen")]
    pub ready_when: ReadyWhenFingerprint,
}

/// The canonical JSON object described in spec §3, field order fixed by
/// struct declaration order (`serde_json` does not reorder struct fields).
/// Also round-tripped back off disk as the prior run's persisted fingerprint
/// (spec §5), so field order on the wire and field order for `Deserialize`
/// are allowed to diverge — only the `Serialize` side is load-bearing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fingerprint {
    #[serde(rename = "fullyTracked")]
    pub fully_tracked: bool,
    pub platform: String,
    pub arch: String,
    #[serde(rename = "runtimeVersion")]
    pub runtime_version: String,
    pub command: Option<String>,
    #[serde(rename = "extraArgs")]
    pub extra_args: Vec<String>,
    pub clean: CleanConfig,
    /// relpath → sha256-hex, sorted by key.
    pub files: BTreeMap<String, String>,
    /// NOT sorted: declaration order is semantic (spec §8 property 2).
    pub output: Vec<String>,
    /// refString → sha256-hex, sorted by key.
    pub dependencies: BTreeMap<String, String>,
    /// lock file name → sha256-hex of the nearest ancestor match, sorted by
    /// key (spec §6 "packageLocks").
    #[serde(rename = "packageLocks")]
    pub package_locks: BTreeMap<String, String>,
    pub service: Option<ServiceFingerprint>,
    /// name → value, sorted by key.
    pub env: BTreeMap<String, String>,
}

impl Fingerprint {
    /// The canonical string this fingerprint hashes to. Exposed separately
    /// from [`Fingerprint::hash_hex`] so callers comparing two fingerprints
    /// for equality can compare strings directly without re-hashing.
    pub fn canonical_string(&self) -> Result<String, FingerprintError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn hash_hex(&self) -> Result<String, FingerprintError> {
        let canonical = self.canonical_string()?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Why a script's fingerprint is not fully tracked, hence never eligible to
/// be declared fresh or restored from the cache.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum NotFullyTrackedReason {
    FilesNotDeclared,
    OutputNotDeclared,
    CascadingDependencyNotTracked(String),
}

/// Compute the fingerprint for `script`, given the already-computed
/// fingerprints of its direct dependencies and the env values resolved for
/// its declared passthrough vars (spec §4.3).
pub async fn compute(
    script_dir: &AbsDirPath,
    script: &ScriptConfig,
    dependency_fingerprints: &[(Dependency, Fingerprint)],
    resolved_env: BTreeMap<String, String>,
    package_locks: BTreeMap<String, String>,
    platform: &PlatformInfo,
) -> Result<(Fingerprint, Option<NotFullyTrackedReason>), FingerprintError> {
    // Step 1: filter to cascading deps; find the first non-fully-tracked one.
    let mut dependencies = BTreeMap::new();
    let mut not_tracked_dep = None;
    for (dep, fingerprint) in dependency_fingerprints {
        if !dep.cascade {
            continue;
        }
        if not_tracked_dep.is_none() && !fingerprint.fully_tracked {
            not_tracked_dep = Some(dep.target.canonical_string());
        }
        dependencies.insert(dep.target.canonical_string(), fingerprint.hash_hex()?);
    }

    // Step 2: glob and hash input files.
    let files = hash_input_files(script_dir, script.files.as_deref()).await?;

    let service = script.service.as_ref().map(|s| ServiceFingerprint {
        ready_when: ReadyWhenFingerprint {
            line_matches: s.ready_when_line_matches.clone(),
        },
    });

    let mut reason = None;
    if script.files.is_none() {
        reason = Some(NotFullyTrackedReason::FilesNotDeclared);
    } else if script.output.is_none() && service.is_none() && script.command.is_some() {
        reason = Some(NotFullyTrackedReason::OutputNotDeclared);
    } else if let Some(dep_ref) = not_tracked_dep {
        reason = Some(NotFullyTrackedReason::CascadingDependencyNotTracked(dep_ref));
    }
    let fully_tracked = reason.is_none();

    let fingerprint = Fingerprint {
        fully_tracked,
        platform: platform.platform.clone(),
        arch: platform.arch.clone(),
        runtime_version: platform.runtime_version.clone(),
        command: script.command.clone(),
        extra_args: script.extra_args.clone(),
        clean: script.clean,
        files,
        output: script.output.clone().unwrap_or_default(),
        dependencies,
        package_locks,
        service,
        env: resolved_env,
    };

    Ok((fingerprint, reason))
}

/// Resolve `names` against `script_dir`'s ancestors (spec §6 "packageLocks"):
/// for each declared lock file name, walk up from `script_dir` (inclusive)
/// and hash the first match found. A name with no match anywhere up the tree
/// is simply absent from the result, not an error.
pub async fn resolve_package_locks(
    script_dir: &AbsDirPath,
    names: &[String],
) -> Result<BTreeMap<String, String>, FingerprintError> {
    let mut resolved = BTreeMap::new();
    for name in names {
        let mut dir = Some(script_dir.clone());
        while let Some(current) = dir {
            let candidate = current.join_str_file(name);
            match tokio::fs::read(candidate.as_std_path()).await {
                Ok(bytes) => {
                    let mut hasher = Sha256::new();
                    hasher.update(&bytes);
                    resolved.insert(name.clone(), hex::encode(hasher.finalize()));
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    dir = current.parent();
                }
                Err(e) => return Err(FingerprintError::Read(candidate.into_path_buf(), e)),
            }
        }
    }
    Ok(resolved)
}

async fn hash_input_files(
    script_dir: &AbsDirPath,
    patterns: Option<&[String]>,
) -> Result<BTreeMap<String, String>, FingerprintError> {
    let Some(patterns) = patterns else {
        return Ok(BTreeMap::new());
    };
    let set = glob::GlobSet::compile(patterns, true)?;
    let matches = set.resolve(script_dir)?;

    let mut files = BTreeMap::new();
    let mut deleted = Vec::new();
    for entry in matches {
        if entry.kind != glob::EntryKind::File {
            continue;
        }
        let rel = entry.path.as_str_lossy().into_owned();
        let abs = script_dir.as_std_path().join(entry.path.as_std_path());
        match tokio::fs::read(&abs).await {
            Ok(bytes) => {
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                files.insert(rel, hex::encode(hasher.finalize()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => deleted.push(rel),
            Err(e) => return Err(FingerprintError::Read(abs, e)),
        }
    }
    if !deleted.is_empty() {
        deleted.sort();
        return Err(FingerprintError::InputFileDeletedUnexpectedly(deleted));
    }
    Ok(files)
}

/// The first field at which two fingerprints differ, in the order spec §4.3
/// mandates for "explain" diagnostics. `None` means the fingerprints are
/// identical.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum FingerprintDiff {
    Platform,
    Arch,
    RuntimeVersion,
    Command,
    ExtraArgs,
    Clean,
    Output,
    Service,
    Env,
    FilesAdded(Vec<String>),
    FilesRemoved(Vec<String>),
    FilesChanged(Vec<String>),
    DependenciesAdded(Vec<String>),
    DependenciesRemoved(Vec<String>),
    DependenciesChanged(Vec<String>),
    PackageLocksAdded(Vec<String>),
    PackageLocksRemoved(Vec<String>),
    PackageLocksChanged(Vec<String>),
}

pub fn difference(a: &Fingerprint, b: &Fingerprint) -> Result<Option<FingerprintDiff>, FingerprintError> {
    if a.platform != b.platform {
        return Ok(Some(FingerprintDiff::Platform));
    }
    if a.arch != b.arch {
        return Ok(Some(FingerprintDiff::Arch));
    }
    if a.runtime_version != b.runtime_version {
        return Ok(Some(FingerprintDiff::RuntimeVersion));
    }
    if a.command != b.command {
        return Ok(Some(FingerprintDiff::Command));
    }
    if a.extra_args != b.extra_args {
        return Ok(Some(FingerprintDiff::ExtraArgs));
    }
    if serde_json::to_string(&a.clean)? != serde_json::to_string(&b.clean)? {
        return Ok(Some(FingerprintDiff::Clean));
    }
    if a.output != b.output {
        return Ok(Some(FingerprintDiff::Output));
    }
    if serde_json::to_string(&a.service)? != serde_json::to_string(&b.service)? {
        return Ok(Some(FingerprintDiff::Service));
    }
    if a.env != b.env {
        return Ok(Some(FingerprintDiff::Env));
    }
    if let Some(diff) = map_diff(&a.files, &b.files, FingerprintDiff::FilesAdded, FingerprintDiff::FilesRemoved, FingerprintDiff::FilesChanged) {
        return Ok(Some(diff));
    }
    if let Some(diff) = map_diff(
        &a.dependencies,
        &b.dependencies,
        FingerprintDiff::DependenciesAdded,
        FingerprintDiff::DependenciesRemoved,
        FingerprintDiff::DependenciesChanged,
    ) {
        return Ok(Some(diff));
    }
    if let Some(diff) = map_diff(
        &a.package_locks,
        &b.package_locks,
        FingerprintDiff::PackageLocksAdded,
        FingerprintDiff::PackageLocksRemoved,
        FingerprintDiff::PackageLocksChanged,
    ) {
        return Ok(Some(diff));
    }
    Ok(None)
}

fn map_diff(
    a: &BTreeMap<String, String>,
    b: &BTreeMap<String, String>,
    added: impl Fn(Vec<String>) -> FingerprintDiff,
    removed: impl Fn(Vec<String>) -> FingerprintDiff,
    changed: impl Fn(Vec<String>) -> FingerprintDiff,
) -> Option<FingerprintDiff> {
    let added_keys: Vec<String> = b.keys().filter(|k| !a.contains_key(*k)).cloned().collect();
    if !added_keys.is_empty() {
        return Some(added(added_keys));
    }
    let removed_keys: Vec<String> = a.keys().filter(|k| !b.contains_key(*k)).cloned().collect();
    if !removed_keys.is_empty() {
        return Some(removed(removed_keys));
    }
    let changed_keys: Vec<String> = a
        .iter()
        .filter_map(|(k, v)| (b.get(k).is_some_and(|bv| bv != v)).then(|| k.clone()))
        .collect();
    if !changed_keys.is_empty() {
        return Some(changed(changed_keys));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeRuntime;
    use std::collections::HashMap;

    fn script_ref(name: &str, dir: &std::path::Path) -> ScriptReference {
        ScriptReference {
            package_dir: AbsDirPath::try_from(dir.to_path_buf()).unwrap(),
            name: name.to_string(),
        }
    }

    fn base_script(reference: ScriptReference, dir: AbsDirPath) -> ScriptConfig {
        ScriptConfig {
            reference,
            command: Some("echo hi".to_string()),
            extra_args: Vec::new(),
            dependencies: Vec::new(),
            files: Some(vec!["src/**".to_string()]),
            output: Some(vec!["lib/**".to_string()]),
            allow_usually_excluded_paths: false,
            clean: CleanConfig::Always,
            service: None,
            service_persistence: None,
            env: HashMap::new(),
            package_locks: Vec::new(),
            declaring_file: dir,
        }
    }

    #[tokio::test]
    async fn determinism_same_inputs_same_hash() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("src")).await.unwrap();
        tokio::fs::write(dir.path().join("src/a.txt"), b"hello").await.unwrap();

        let package_dir = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let reference = script_ref("build", dir.path());
        let script = base_script(reference, package_dir.clone());
        let platform = PlatformInfo::host(&FakeRuntime::new(), "20.0.0");

        let (fp1, reason1) = compute(&package_dir, &script, &[], BTreeMap::new(), BTreeMap::new(), &platform).await.unwrap();
        let (fp2, reason2) = compute(&package_dir, &script, &[], BTreeMap::new(), BTreeMap::new(), &platform).await.unwrap();

        assert_eq!(fp1.hash_hex().unwrap(), fp2.hash_hex().unwrap());
        assert_eq!(reason1, reason2);
        assert!(fp1.fully_tracked);
    }

    #[tokio::test]
    async fn missing_files_declaration_is_not_fully_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let reference = script_ref("build", dir.path());
        let mut script = base_script(reference, package_dir.clone());
        script.files = None;
        let platform = PlatformInfo::host(&FakeRuntime::new(), "20.0.0");

        let (fp, reason) = compute(&package_dir, &script, &[], BTreeMap::new(), BTreeMap::new(), &platform).await.unwrap();
        assert!(!fp.fully_tracked);
        assert_eq!(reason, Some(NotFullyTrackedReason::FilesNotDeclared));
    }

    #[tokio::test]
    async fn deleted_input_file_between_glob_and_read_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("src")).await.unwrap();
        let file = dir.path().join("src/a.txt");
        tokio::fs::write(&file, b"hello").await.unwrap();

        let package_dir = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let reference = script_ref("build", dir.path());
        let script = base_script(reference, package_dir.clone());
        let platform = PlatformInfo::host(&FakeRuntime::new(), "20.0.0");

        // Simulate the race by removing the file right before hashing would
        // occur: glob() above already walked the tree in `compute`, so we
        // instead exercise `hash_input_files` directly against a pattern
        // list, deleting the file first.
        tokio::fs::remove_file(&file).await.unwrap();
        let err = hash_input_files(&package_dir, script.files.as_deref()).await.unwrap_err();
        assert!(matches!(err, FingerprintError::InputFileDeletedUnexpectedly(_)));
    }

    #[tokio::test]
    async fn shuffled_output_order_changes_hash_but_shuffled_files_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let reference = script_ref("build", dir.path());
        let mut a = base_script(reference.clone(), package_dir.clone());
        a.output = Some(vec!["a/**".to_string(), "b/**".to_string()]);
        let mut b = a.clone();
        b.output = Some(vec!["b/**".to_string(), "a/**".to_string()]);
        let platform = PlatformInfo::host(&FakeRuntime::new(), "20.0.0");

        let (fp_a, _) = compute(&package_dir, &a, &[], BTreeMap::new(), BTreeMap::new(), &platform).await.unwrap();
        let (fp_b, _) = compute(&package_dir, &b, &[], BTreeMap::new(), BTreeMap::new(), &platform).await.unwrap();
        assert_ne!(fp_a.hash_hex().unwrap(), fp_b.hash_hex().unwrap());
    }

    #[test]
    fn difference_reports_command_before_output() {
        let mut a = Fingerprint {
            fully_tracked: true,
            platform: "linux".into(),
            arch: "x86_64".into(),
            runtime_version: "20.0.0".into(),
            command: Some("tsc".into()),
            extra_args: Vec::new(),
            clean: CleanConfig::Always,
            files: BTreeMap::new(),
            output: vec!["lib/**".into()],
            dependencies: BTreeMap::new(),
            package_locks: BTreeMap::new(),
            service: None,
            env: BTreeMap::new(),
        };
        let mut b = a.clone();
        b.command = Some("swc".into());
        b.output = vec!["dist/**".into()];
        assert_eq!(difference(&a, &b).unwrap(), Some(FingerprintDiff::Command));

        a.command = b.command.clone();
        assert_eq!(difference(&a, &b).unwrap(), Some(FingerprintDiff::Output));
    }
}
