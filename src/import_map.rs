//! Import resolution policy.
//!
//! Decides, for every specifier the bundler meets, whether the module is
//! inlined from the request's virtual files, fetched from a remote origin and
//! inlined, or left external for the sandbox loader to satisfy at run time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use url::Url;

/// Origin used for root-relative specifiers such as `/react@18/es2022/react.mjs`.
pub const DEFAULT_REMOTE_ORIGIN: &str = "https://esm.sh";

/// Specifiers the sandbox supplies as capabilities. Kept in sync with the
/// loader table in `sandbox/harness.js`.
pub const SANDBOX_CAPABILITIES: &[&str] = &["react", "react/jsx-runtime", "react/jsx-dev-runtime"];

/// One Import Map entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Resolution target: an absolute URL, a root-relative remote path, or a
    /// path into the request's virtual files.
    #[serde(alias = "resolutionTarget")]
    pub path: String,
    /// External modules are never inlined; the sandbox must provide them.
    #[serde(default)]
    pub external: bool,
    /// Optional `sha256-<base64>` digest the fetched source must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

impl ImportConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            external: false,
            integrity: None,
        }
    }

    pub fn external(path: impl Into<String>) -> Self {
        Self {
            external: true,
            ..Self::new(path)
        }
    }
}

/// Specifier → [`ImportConfig`] table. Specifiers are unique by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportMap {
    entries: BTreeMap<String, ImportConfig>,
}

impl ImportMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default: the rendering runtime's entry points, all
    /// external.
    pub fn with_runtime_defaults() -> Self {
        let mut map = Self::new();
        for specifier in SANDBOX_CAPABILITIES {
            map.insert(
                *specifier,
                ImportConfig::external(format!("{}/{}", DEFAULT_REMOTE_ORIGIN, specifier)),
            );
        }
        map
    }

    pub fn insert(&mut self, specifier: impl Into<String>, config: ImportConfig) -> Option<ImportConfig> {
        self.entries.insert(specifier.into(), config)
    }

    pub fn get(&self, specifier: &str) -> Option<&ImportConfig> {
        self.entries.get(specifier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ImportConfig)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Specifiers flagged external.
    pub fn externals(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|(_, c)| c.external).map(|(k, _)| k)
    }

    /// Merge `overrides` on top of `self`; the override wins per specifier.
    pub fn merged(&self, overrides: &ImportMap) -> ImportMap {
        let mut entries = self.entries.clone();
        for (specifier, config) in &overrides.entries {
            entries.insert(specifier.clone(), config.clone());
        }
        ImportMap { entries }
    }
}

impl FromIterator<(String, ImportConfig)> for ImportMap {
    fn from_iter<T: IntoIterator<Item = (String, ImportConfig)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Identity of a module in the graph, also used as the referrer when
/// resolving its imports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleId {
    /// The caller-supplied source text.
    Entry,
    /// A virtual file, as a normalised absolute path (`/lib/util.js`).
    Local(String),
    /// A fetched module, by final URL.
    Remote(Url),
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleId::Entry => f.write_str("<component>"),
            ModuleId::Local(path) => f.write_str(path),
            ModuleId::Remote(url) => f.write_str(url.as_str()),
        }
    }
}

/// Where a specifier goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Left as a run-time `require(name)` against the sandbox loader.
    External(String),
    /// Inlined from the request's virtual files.
    Local(String),
    /// Fetched, then inlined.
    Remote { url: Url, integrity: Option<String> },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Could not resolve \"{specifier}\" from {referrer}")]
    Unresolved { specifier: String, referrer: String },

    #[error("Import \"{specifier}\" uses a forbidden scheme")]
    ForbiddenScheme { specifier: String },

    #[error("Import \"{specifier}\" escapes the module root")]
    OutsideRoot { specifier: String },

    #[error("Invalid resolution target for \"{specifier}\": {reason}")]
    InvalidTarget { specifier: String, reason: String },
}

/// The per-call policy: a merged Import Map plus the fixed remote origin.
#[derive(Debug, Clone)]
pub struct ImportPolicy {
    map: ImportMap,
    remote_origin: Url,
}

impl ImportPolicy {
    pub fn new(map: ImportMap, remote_origin: Url) -> Self {
        Self { map, remote_origin }
    }

    pub fn map(&self) -> &ImportMap {
        &self.map
    }

    pub fn remote_origin(&self) -> &Url {
        &self.remote_origin
    }

    /// Resolve `specifier` as imported by `referrer`.
    ///
    /// Order: root-relative path (rewritten against the fixed remote origin
    /// before the Import Map is consulted), Import Map entry, absolute URL,
    /// relative path (against the referrer). Any other bare specifier is
    /// unresolved.
    pub fn resolve(&self, specifier: &str, referrer: &ModuleId) -> Result<Resolution, ResolveError> {
        if specifier.starts_with('/') {
            return self.resolve_root_relative(specifier, None);
        }

        if let Some(config) = self.map.get(specifier) {
            if config.external {
                return Ok(Resolution::External(specifier.to_string()));
            }
            return self.resolve_target(specifier, config);
        }

        if is_url(specifier) {
            return self.resolve_url(specifier, None);
        }

        if specifier.starts_with("./") || specifier.starts_with("../") {
            return match referrer {
                ModuleId::Remote(base) => {
                    let url = base.join(specifier).map_err(|e| ResolveError::InvalidTarget {
                        specifier: specifier.to_string(),
                        reason: e.to_string(),
                    })?;
                    Ok(Resolution::Remote { url, integrity: None })
                }
                ModuleId::Local(path) => Ok(Resolution::Local(join_path(parent_dir(path), specifier)?)),
                ModuleId::Entry => Ok(Resolution::Local(join_path("/", specifier)?)),
            };
        }

        if specifier.contains(':') {
            return Err(ResolveError::ForbiddenScheme {
                specifier: specifier.to_string(),
            });
        }

        Err(ResolveError::Unresolved {
            specifier: specifier.to_string(),
            referrer: referrer.to_string(),
        })
    }

    fn resolve_target(&self, specifier: &str, config: &ImportConfig) -> Result<Resolution, ResolveError> {
        let integrity = config.integrity.clone();
        let target = config.path.as_str();
        if is_url(target) {
            self.resolve_url(target, integrity)
        } else if target.starts_with('/') {
            self.resolve_root_relative(target, integrity)
        } else if target.contains(':') {
            Err(ResolveError::ForbiddenScheme {
                specifier: specifier.to_string(),
            })
        } else {
            Ok(Resolution::Local(join_path("/", target)?))
        }
    }

    fn resolve_url(&self, target: &str, integrity: Option<String>) -> Result<Resolution, ResolveError> {
        let url = Url::parse(target).map_err(|e| ResolveError::InvalidTarget {
            specifier: target.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Resolution::Remote { url, integrity })
    }

    fn resolve_root_relative(&self, path: &str, integrity: Option<String>) -> Result<Resolution, ResolveError> {
        let url = self.remote_origin.join(path).map_err(|e| ResolveError::InvalidTarget {
            specifier: path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Resolution::Remote { url, integrity })
    }
}

fn is_url(specifier: &str) -> bool {
    specifier.starts_with("https://") || specifier.starts_with("http://")
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Join `relative` onto the absolute directory `base`, collapsing `.` and
/// `..`. Climbing above `/` is an error.
pub(crate) fn join_path(base: &str, relative: &str) -> Result<String, ResolveError> {
    let mut segments: Vec<&str> = if relative.starts_with('/') {
        Vec::new()
    } else {
        base.split('/').filter(|s| !s.is_empty()).collect()
    };

    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(ResolveError::OutsideRoot {
                        specifier: relative.to_string(),
                    });
                }
            }
            other => segments.push(other),
        }
    }

    Ok(format!("/{}", segments.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(map: ImportMap) -> ImportPolicy {
        ImportPolicy::new(map, Url::parse(DEFAULT_REMOTE_ORIGIN).unwrap())
    }

    #[test]
    fn test_runtime_defaults_are_external() {
        let policy = policy(ImportMap::with_runtime_defaults());
        for specifier in SANDBOX_CAPABILITIES {
            assert_eq!(
                policy.resolve(specifier, &ModuleId::Entry).unwrap(),
                Resolution::External(specifier.to_string())
            );
        }
    }

    #[test]
    fn test_unknown_bare_specifier_is_unresolved() {
        let policy = policy(ImportMap::with_runtime_defaults());
        let err = policy.resolve("totally-unknown-module", &ModuleId::Entry).unwrap_err();
        assert!(matches!(err, ResolveError::Unresolved { .. }));
        assert!(err.to_string().contains("totally-unknown-module"));
    }

    #[test]
    fn test_root_relative_is_rewritten_before_the_map() {
        let mut map = ImportMap::new();
        map.insert("/react", ImportConfig::new("https://cdn.example.com/react"));
        let policy = policy(map);
        assert_eq!(
            policy.resolve("/react", &ModuleId::Entry).unwrap(),
            Resolution::Remote {
                url: Url::parse("https://esm.sh/react").unwrap(),
                integrity: None,
            }
        );
    }

    #[test]
    fn test_root_relative_uses_remote_origin() {
        let policy = policy(ImportMap::new());
        let resolved = policy.resolve("/react@18.3.1/es2022/react.mjs", &ModuleId::Entry).unwrap();
        assert_eq!(
            resolved,
            Resolution::Remote {
                url: Url::parse("https://esm.sh/react@18.3.1/es2022/react.mjs").unwrap(),
                integrity: None,
            }
        );
    }

    #[test]
    fn test_override_wins_on_collision() {
        let defaults = ImportMap::with_runtime_defaults();
        let mut overrides = ImportMap::new();
        overrides.insert("react", ImportConfig::new("https://cdn.example.com/react.js"));
        overrides.insert("lodash", ImportConfig::new("https://esm.sh/lodash-es"));

        let merged = defaults.merged(&overrides);
        assert!(!merged.get("react").unwrap().external);
        assert!(merged.get("react/jsx-runtime").unwrap().external);
        assert!(merged.get("lodash").is_some());
        // The default map is untouched.
        assert!(defaults.get("react").unwrap().external);
    }

    #[test]
    fn test_relative_from_remote_joins_referrer() {
        let policy = policy(ImportMap::new());
        let referrer = ModuleId::Remote(Url::parse("https://esm.sh/pkg@1.0.0/es2022/index.mjs").unwrap());
        let resolved = policy.resolve("./util.mjs", &referrer).unwrap();
        assert_eq!(
            resolved,
            Resolution::Remote {
                url: Url::parse("https://esm.sh/pkg@1.0.0/es2022/util.mjs").unwrap(),
                integrity: None,
            }
        );
    }

    #[test]
    fn test_relative_from_local_stays_in_virtual_tree() {
        let policy = policy(ImportMap::new());
        let referrer = ModuleId::Local("/components/card/index.js".into());
        assert_eq!(
            policy.resolve("../button.js", &referrer).unwrap(),
            Resolution::Local("/components/button.js".into())
        );
        assert_eq!(
            policy.resolve("./title.js", &ModuleId::Entry).unwrap(),
            Resolution::Local("/title.js".into())
        );
    }

    #[test]
    fn test_blocks_root_escape() {
        let policy = policy(ImportMap::new());
        let err = policy.resolve("../../etc/passwd", &ModuleId::Entry).unwrap_err();
        assert!(matches!(err, ResolveError::OutsideRoot { .. }));
    }

    #[test]
    fn test_blocks_other_schemes() {
        let policy = policy(ImportMap::new());
        for specifier in ["file:///etc/passwd", "data:text/javascript,1", "node:fs"] {
            let err = policy.resolve(specifier, &ModuleId::Entry).unwrap_err();
            assert!(matches!(err, ResolveError::ForbiddenScheme { .. }), "{specifier}");
        }
    }

    #[test]
    fn test_map_target_carries_integrity() {
        let mut map = ImportMap::new();
        map.insert(
            "dayjs",
            ImportConfig {
                path: "/dayjs@1.11.10".into(),
                external: false,
                integrity: Some("sha256-abc".into()),
            },
        );
        let resolved = policy(map).resolve("dayjs", &ModuleId::Entry).unwrap();
        assert_eq!(
            resolved,
            Resolution::Remote {
                url: Url::parse("https://esm.sh/dayjs@1.11.10").unwrap(),
                integrity: Some("sha256-abc".into()),
            }
        );
    }

    #[test]
    fn test_import_map_json_shape() {
        let map: ImportMap = serde_json::from_str(
            r#"{"react": {"path": "https://esm.sh/react", "external": true},
                "utils": {"resolutionTarget": "./lib/utils.js"}}"#,
        )
        .unwrap();
        assert!(map.get("react").unwrap().external);
        assert_eq!(map.get("utils").unwrap().path, "./lib/utils.js");
        assert_eq!(map.externals().collect::<Vec<_>>(), vec!["react"]);
    }
}
