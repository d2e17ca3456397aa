//! Reads manifests, resolves dependency specifiers to concrete script
//! references, validates the result, detects cycles, and returns a DAG
//! (spec §4.2).

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use dashmap::DashMap;
use thiserror::Error;

use crate::{
    diagnostic::Diagnostic,
    glob,
    manifest::{self, EnvVarConfig, ManifestError, ManifestSource, PackageManifest, WireitScript},
    path::AbsDirPath,
    specifier::{self, Package, Script, SpecifierError},
};

/// A concrete script: a package directory and a script name within it.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ScriptReference {
    pub package_dir: AbsDirPath,
    pub name: String,
}

impl ScriptReference {
    pub fn canonical_string(&self) -> String {
        format!("{}#{}", self.package_dir.as_str_lossy(), self.name)
    }
}

/// An edge in the DAG. `cascade = false` means the target must run first but
/// its fingerprint does not enter the dependent's fingerprint.
#[derive(Clone, Debug)]
pub struct Dependency {
    pub target: ScriptReference,
    pub cascade: bool,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ServicePersistence {
    /// Every transitive consumer is the root script: keep running until
    /// process-wide abort.
    Persistent,
    /// Scoped to its consumers: stopped once they've all finished.
    Ephemeral,
}

#[derive(Clone, Debug)]
pub struct ScriptConfig {
    pub reference: ScriptReference,
    pub command: Option<String>,
    pub extra_args: Vec<String>,
    pub dependencies: Vec<Dependency>,
    pub files: Option<Vec<String>>,
    pub output: Option<Vec<String>>,
    pub allow_usually_excluded_paths: bool,
    pub clean: manifest::CleanConfig,
    pub service: Option<crate::manifest::ServiceConfig>,
    pub service_persistence: Option<ServicePersistence>,
    pub env: HashMap<String, EnvVarConfig>,
    /// Named lock files to resolve (spec §6 "packageLocks"), found by
    /// walking ancestors of the script's package directory.
    pub package_locks: Vec<String>,
    pub declaring_file: AbsDirPath,
}

/// A validated, acyclic graph of script configs reachable from a root.
#[derive(Debug)]
pub struct Dag {
    pub root: ScriptReference,
    pub nodes: HashMap<ScriptReference, ScriptConfig>,
}

impl Dag {
    pub fn get(&self, reference: &ScriptReference) -> Option<&ScriptConfig> {
        self.nodes.get(reference)
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("read manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("invalid dependency specifier {specifier:?} in {package:?}#{script}: {source}")]
    Specifier {
        package: std::path::PathBuf,
        script: String,
        specifier: String,
        #[source]
        source: SpecifierError,
    },
    #[error("script {script:?} not found in package {package:?}")]
    MissingScript {
        package: std::path::PathBuf,
        script: String,
    },
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("invalid glob pattern: {0}")]
    Glob(#[from] glob::GlobError),
    #[error("`<dependencies>` used in {0:?}, but its declared dependencies don't share a workspace root with it")]
    DependenciesAcrossWorkspaces(std::path::PathBuf),
}

/// Resolves a named package reference to a directory. The core doesn't know
/// how a given ecosystem lays out installed packages (node_modules, a
/// vendor directory, etc.), so this is supplied by the driver.
#[async_trait::async_trait]
pub trait PackageResolver: Send + Sync {
    async fn resolve(&self, from: &AbsDirPath, name: &str) -> Option<AbsDirPath>;
}

/// Resolves npm-style dependencies by walking up from `from` looking for
/// `node_modules/<name>` at each ancestor, matching the PATH-prepending walk
/// the runner does for `node_modules/.bin` (spec §4.5).
pub struct NodeModulesResolver;

#[async_trait::async_trait]
impl PackageResolver for NodeModulesResolver {
    async fn resolve(&self, from: &AbsDirPath, name: &str) -> Option<AbsDirPath> {
        let mut current = Some(from.clone());
        while let Some(dir) = current {
            let candidate = dir.join_str_dir("node_modules").join_str_dir(name);
            if tokio::fs::metadata(candidate.as_std_path()).await.is_ok() {
                return Some(candidate);
            }
            current = dir.parent();
        }
        None
    }
}

struct Analyzer<'a> {
    source: &'a dyn ManifestSource,
    resolver: &'a dyn PackageResolver,
    manifests: DashMap<AbsDirPath, Arc<PackageManifest>>,
    diagnostics: Vec<Diagnostic>,
    root_dir: AbsDirPath,
}

/// Analyze the script reachable from `root`, returning a validated DAG or
/// the diagnostics collected along the way.
pub async fn analyze(
    root: ScriptReference,
    extra_args: Vec<String>,
    source: &dyn ManifestSource,
    resolver: &dyn PackageResolver,
) -> Result<Dag, Vec<Diagnostic>> {
    let mut analyzer = Analyzer {
        source,
        resolver,
        manifests: DashMap::new(),
        diagnostics: Vec::new(),
        root_dir: root.package_dir.clone(),
    };

    let mut nodes = HashMap::new();
    let mut visiting = HashSet::new();
    let mut stack = Vec::new();

    if let Err(e) = analyzer
        .visit(&root, &mut nodes, &mut visiting, &mut stack)
        .await
    {
        analyzer.diagnostics.push(Diagnostic::error(e.to_string()));
    }

    if !analyzer.diagnostics.is_empty() {
        return Err(analyzer.diagnostics);
    }

    if let Some(root_config) = nodes.get_mut(&root) {
        root_config.extra_args = extra_args;
    }

    compute_service_persistence(&root, &mut nodes);

    Ok(Dag { root, nodes })
}

impl Analyzer<'_> {
    async fn manifest_for(&self, package_dir: &AbsDirPath) -> Result<Arc<PackageManifest>, AnalysisError> {
        if let Some(existing) = self.manifests.get(package_dir) {
            return Ok(existing.clone());
        }
        let manifest = manifest::load(package_dir, self.source).await?;
        let manifest = Arc::new(manifest);
        self.manifests.insert(package_dir.clone(), manifest.clone());
        Ok(manifest)
    }

    async fn expand_workspaces(&self) -> Result<Vec<AbsDirPath>, AnalysisError> {
        let root_manifest = self.manifest_for(&self.root_dir).await?;
        if root_manifest.workspaces.is_empty() {
            return Ok(Vec::new());
        }
        let set = glob::GlobSet::compile(&root_manifest.workspaces, false)?;
        let matches = set.resolve(&self.root_dir)?;
        let mut dirs = Vec::new();
        for entry in matches {
            if entry.kind != glob::EntryKind::Dir {
                continue;
            }
            let rel: crate::path::RelDirPath = crate::path::RelDirPath::try_from(entry.path.into_path_buf())
                .expect("glob match under an absolute base is relative");
            dirs.push(self.root_dir.join_dir(&rel));
        }
        Ok(dirs)
    }

    async fn visit(
        &mut self,
        reference: &ScriptReference,
        nodes: &mut HashMap<ScriptReference, ScriptConfig>,
        visiting: &mut HashSet<ScriptReference>,
        stack: &mut Vec<String>,
    ) -> Result<(), AnalysisError> {
        if nodes.contains_key(reference) {
            return Ok(());
        }
        if visiting.contains(reference) {
            stack.push(reference.canonical_string());
            return Err(AnalysisError::Cycle(stack.clone()));
        }

        visiting.insert(reference.clone());
        stack.push(reference.canonical_string());

        let manifest = self.manifest_for(&reference.package_dir).await?;
        let wireit = manifest.wireit.get(&reference.name).cloned().unwrap_or(WireitScript {
            command: manifest.scripts.get(&reference.name).cloned().filter(|v| v != "wireit"),
            dependencies: Vec::new(),
            files: None,
            output: None,
            clean: manifest::CleanConfig::Always,
            service: None,
            package_locks: Vec::new(),
            allow_usually_excluded_paths: false,
            env: HashMap::new(),
        });

        if !manifest.scripts.contains_key(&reference.name) && !manifest.wireit.contains_key(&reference.name) {
            return Err(AnalysisError::MissingScript {
                package: reference.package_dir.as_std_path().to_owned(),
                script: reference.name.clone(),
            });
        }

        let mut dependencies = Vec::new();
        let mut excluded = HashSet::new();
        for raw in &wireit.dependencies {
            let parsed = specifier::parse(&raw.specifier).map_err(|source| AnalysisError::Specifier {
                package: reference.package_dir.as_std_path().to_owned(),
                script: reference.name.clone(),
                specifier: raw.specifier.clone(),
                source,
            })?;

            let targets = self.expand_specifier(reference, &parsed).await?;
            if parsed.inverted {
                for t in targets {
                    excluded.insert(t);
                }
            } else {
                for t in targets {
                    if !dependencies.iter().any(|d: &Dependency| d.target == t) {
                        dependencies.push(Dependency { target: t, cascade: raw.cascade });
                    }
                }
            }
        }
        dependencies.retain(|d| !excluded.contains(&d.target));

        for dep in dependencies.clone() {
            Box::pin(self.visit(&dep.target, nodes, visiting, stack)).await?;
        }

        visiting.remove(reference);
        stack.pop();

        nodes.insert(
            reference.clone(),
            ScriptConfig {
                reference: reference.clone(),
                command: wireit.command,
                extra_args: Vec::new(),
                dependencies,
                files: wireit.files,
                output: wireit.output,
                allow_usually_excluded_paths: wireit.allow_usually_excluded_paths,
                clean: wireit.clean,
                service: wireit.service,
                service_persistence: None,
                env: wireit.env,
                package_locks: wireit.package_locks,
                declaring_file: reference.package_dir.clone(),
            },
        );
        Ok(())
    }

    async fn expand_specifier(
        &mut self,
        from: &ScriptReference,
        parsed: &specifier::ParsedDependency,
    ) -> Result<Vec<ScriptReference>, AnalysisError> {
        let script_pattern = match &parsed.script {
            Script::This => from.name.clone(),
            Script::Name(name) => name.clone(),
        };

        let candidate_dirs = match &parsed.package {
            Package::This => vec![from.package_dir.clone()],
            Package::Path(rel) => {
                let rel_path = crate::path::RelDirPath::try_from(std::path::PathBuf::from(rel))
                    .unwrap_or_else(|_| crate::path::RelDirPath::try_from(std::path::PathBuf::from(".")).unwrap());
                vec![from.package_dir.join_dir(&rel_path)]
            }
            Package::Npm(name) => match self.resolver.resolve(&from.package_dir, name).await {
                Some(dir) => vec![dir],
                None => {
                    return Err(AnalysisError::MissingScript {
                        package: from.package_dir.as_std_path().to_owned(),
                        script: format!("(npm package {name:?} not found)"),
                    });
                }
            },
            Package::Workspaces => self.expand_workspaces().await?,
            Package::Dependencies => {
                let manifest = self.manifest_for(&from.package_dir).await?;
                let from_root = self.workspace_root_of(&from.package_dir).await?;
                let mut dirs = Vec::new();
                for name in manifest.dependencies.keys() {
                    if let Some(dir) = self.resolver.resolve(&from.package_dir, name).await {
                        let dep_root = self.workspace_root_of(&dir).await?;
                        if dep_root == from_root {
                            dirs.push(dir);
                        } else {
                            return Err(AnalysisError::DependenciesAcrossWorkspaces(
                                from.package_dir.as_std_path().to_owned(),
                            ));
                        }
                    }
                }
                dirs
            }
        };

        let mut out = Vec::new();
        for dir in candidate_dirs {
            let manifest = self.manifest_for(&dir).await?;
            let mut names: Vec<&String> = manifest.wireit.keys().collect();
            names.sort();
            for name in names {
                if glob::matches_pattern(&script_pattern, name)? {
                    out.push(ScriptReference {
                        package_dir: dir.clone(),
                        name: name.clone(),
                    });
                }
            }
            if names_is_literal(&script_pattern) && manifest.scripts.contains_key(&script_pattern) {
                let reference = ScriptReference {
                    package_dir: dir.clone(),
                    name: script_pattern.clone(),
                };
                if !out.contains(&reference) {
                    out.push(reference);
                }
            }
        }
        Ok(out)
    }

    async fn workspace_root_of(&self, package_dir: &AbsDirPath) -> Result<AbsDirPath, AnalysisError> {
        let mut current = Some(package_dir.clone());
        while let Some(dir) = current {
            if let Ok(manifest) = self.manifest_for(&dir).await {
                if !manifest.workspaces.is_empty() {
                    return Ok(dir);
                }
            }
            current = dir.parent();
        }
        Ok(package_dir.clone())
    }
}

fn names_is_literal(pattern: &str) -> bool {
    !pattern.contains(['*', '?', '[', '{'])
}

/// Compute persistence for every service node: a service is persistent iff
/// its only direct consumer is the root script itself — declared as a
/// top-level dependency, it must outlive the whole run. If any other script
/// depends on it directly, it's ephemeral: scoped to those consumers, even
/// though the root may also reach it transitively (spec §4.2 invariant 3).
fn compute_service_persistence(root: &ScriptReference, nodes: &mut HashMap<ScriptReference, ScriptConfig>) {
    let mut consumers: HashMap<ScriptReference, HashSet<ScriptReference>> = HashMap::new();
    for config in nodes.values() {
        for dep in &config.dependencies {
            consumers
                .entry(dep.target.clone())
                .or_default()
                .insert(config.reference.clone());
        }
    }

    let references: Vec<ScriptReference> = nodes.keys().cloned().collect();
    for reference in references {
        let is_service = nodes[&reference].service.is_some();
        if !is_service {
            continue;
        }
        let direct = consumers.get(&reference);
        let persistence = match direct {
            Some(set) if set.len() == 1 && set.contains(root) => ServicePersistence::Persistent,
            Some(_) => ServicePersistence::Ephemeral,
            // No direct consumer other than being the root script itself.
            None if reference == *root => ServicePersistence::Persistent,
            None => ServicePersistence::Ephemeral,
        };
        nodes.get_mut(&reference).unwrap().service_persistence = Some(persistence);
    }
}
