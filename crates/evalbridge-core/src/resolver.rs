//! Dependency resolution for loadable units.
//!
//! A unit is a script file declaring the module names it provides and the
//! names it requires:
//!
//! ```text
//! goog.provide("app.core");
//! goog.require("app.util");
//! ```
//!
//! [`SourceTreeResolver`] scans a source root for these declarations and
//! answers transitive-closure queries over them.

use crate::{BridgeError, Result};
use regex::Regex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};
use tracing::{debug, info};
use walkdir::WalkDir;

static DECLARATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:\bgoog\.)?\b(provide|require)\(\s*['"]([^'"]+)['"]\s*\)"#)
        .expect("declaration regex must compile")
});

/// Options passed through to dependency resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Include script identifiers alongside module names in the closure.
    pub include_scripts: bool,
}

impl BuildOptions {
    pub fn with_scripts() -> Self {
        Self {
            include_scripts: true,
        }
    }
}

/// One script and its declarations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    /// Script identifier, relative to the source root.
    pub script: String,
    pub provides: Vec<String>,
    pub requires: Vec<String>,
}

impl UnitInfo {
    pub fn new<P, R>(script: impl Into<String>, provides: P, requires: R) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            script: script.into(),
            provides: provides.into_iter().map(Into::into).collect(),
            requires: requires.into_iter().map(Into::into).collect(),
        }
    }
}

/// Compiler-facing dependency queries.
pub trait DependencyResolver: Send + Sync {
    /// One-time static analysis of `source_root`.
    fn analyze(&self, source_root: &Path) -> Result<()>;

    /// Every unit reachable from `units` by following requires edges.
    fn resolve_transitive_deps(
        &self,
        units: &BTreeSet<String>,
        options: &BuildOptions,
    ) -> Result<BTreeSet<String>>;

    /// Full text of the units served at `url`.
    fn read_units_source(&self, url: &str) -> Result<String>;
}

/// Extract provide/require declarations from script text.
pub fn parse_declarations(source: &str) -> (Vec<String>, Vec<String>) {
    let mut provides = Vec::new();
    let mut requires = Vec::new();
    for caps in DECLARATION_RE.captures_iter(source) {
        let name = caps[2].to_string();
        match &caps[1] {
            "provide" => provides.push(name),
            _ => requires.push(name),
        }
    }
    (provides, requires)
}

/// Resolver backed by declarations found in a source tree.
#[derive(Debug, Default)]
pub struct SourceTreeResolver {
    units: RwLock<Vec<UnitInfo>>,
}

impl SourceTreeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver over a fixed set of units.
    pub fn with_units(units: Vec<UnitInfo>) -> Self {
        Self {
            units: RwLock::new(units),
        }
    }

    pub fn register(&self, unit: UnitInfo) -> Result<()> {
        self.units
            .write()
            .map_err(|_| BridgeError::poisoned("unit graph"))?
            .push(unit);
        Ok(())
    }

    pub fn units(&self) -> Result<Vec<UnitInfo>> {
        Ok(self
            .units
            .read()
            .map_err(|_| BridgeError::poisoned("unit graph"))?
            .clone())
    }

    fn scan(source_root: &Path) -> Result<Vec<UnitInfo>> {
        let mut units = Vec::new();
        for entry in WalkDir::new(source_root).sort_by_file_name() {
            let entry = entry.map_err(|e| BridgeError::Io {
                message: e.to_string(),
                path: e.path().map(Path::to_path_buf),
                source: None,
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().map_or(true, |ext| ext != "js") {
                continue;
            }

            let text =
                std::fs::read_to_string(path).map_err(|e| BridgeError::io_with_path(e, path))?;
            let (provides, requires) = parse_declarations(&text);
            if provides.is_empty() {
                continue;
            }

            let script = path
                .strip_prefix(source_root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            units.push(UnitInfo {
                script,
                provides,
                requires,
            });
        }
        Ok(units)
    }
}

impl DependencyResolver for SourceTreeResolver {
    fn analyze(&self, source_root: &Path) -> Result<()> {
        if !source_root.is_dir() {
            return Err(BridgeError::Config {
                message: format!("Source root is not a directory: {}", source_root.display()),
            });
        }
        let units = Self::scan(source_root)?;
        info!(
            "Analyzed {}: {} unit(s)",
            source_root.display(),
            units.len()
        );
        *self
            .units
            .write()
            .map_err(|_| BridgeError::poisoned("unit graph"))? = units;
        Ok(())
    }

    fn resolve_transitive_deps(
        &self,
        units: &BTreeSet<String>,
        options: &BuildOptions,
    ) -> Result<BTreeSet<String>> {
        let graph = self
            .units
            .read()
            .map_err(|_| BridgeError::poisoned("unit graph"))?;
        let providers: HashMap<&str, &UnitInfo> = graph
            .iter()
            .flat_map(|unit| unit.provides.iter().map(move |name| (name.as_str(), unit)))
            .collect();

        let mut closure = BTreeSet::new();
        let mut queue: VecDeque<String> = units.iter().cloned().collect();
        while let Some(name) = queue.pop_front() {
            if !closure.insert(name.clone()) {
                continue;
            }
            let Some(unit) = providers.get(name.as_str()) else {
                debug!("No declaration for {}, treating it as a leaf", name);
                continue;
            };
            if options.include_scripts {
                closure.insert(unit.script.clone());
            }
            queue.extend(
                unit.requires
                    .iter()
                    .filter(|r| !closure.contains(*r))
                    .cloned(),
            );
        }
        Ok(closure)
    }

    fn read_units_source(&self, url: &str) -> Result<String> {
        match url::Url::parse(url) {
            Ok(parsed) if parsed.scheme() == "file" => {
                let path = parsed.to_file_path().map_err(|_| BridgeError::Config {
                    message: format!("Not a local file URL: {}", url),
                })?;
                read_local(&path)
            }
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => fetch_remote(parsed),
            Ok(parsed) if parsed.scheme().len() > 1 => Err(BridgeError::Config {
                message: format!("Unsupported unit source scheme: {}", parsed.scheme()),
            }),
            // Plain paths, including Windows drive letters that parse as a scheme.
            _ => read_local(Path::new(url)),
        }
    }
}

fn read_local(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => BridgeError::UnitNotFound(path.display().to_string()),
        _ => BridgeError::io_with_path(e, PathBuf::from(path)),
    })
}

fn fetch_remote(url: url::Url) -> Result<String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let response = reqwest::get(url.clone()).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BridgeError::UnitNotFound(url.to_string()));
        }
        let response = response.error_for_status()?;
        Ok::<_, BridgeError>(response.text().await?)
    })
}
