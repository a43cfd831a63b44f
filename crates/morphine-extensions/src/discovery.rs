//! Extension directory discovery and dependency ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::ExtensionResult;
use crate::extension::ExtensionId;
use crate::manifest;

/// An extension directory found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredExtension {
    /// Id derived from the directory name.
    pub id: ExtensionId,
    /// The extension directory.
    pub dir: PathBuf,
    /// Declared dependencies, empty when the manifest is unreadable.
    pub dependencies: Vec<String>,
}

/// Scan `root` for extension directories.
///
/// Non-directories, hidden entries and names that are not valid ids are
/// skipped with a warning. Manifests are only peeked at for dependency
/// names; full validation happens at load time.
///
/// # Errors
///
/// Returns an I/O error if `root` itself cannot be read.
pub fn discover(root: &Path) -> ExtensionResult<Vec<DiscoveredExtension>> {
    let mut found = Vec::new();

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        if name.starts_with('.') || !path.is_dir() {
            debug!(path = %path.display(), "Skipping non-extension entry");
            continue;
        }
        let id = match ExtensionId::new(name) {
            Ok(id) => id,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping extension directory");
                continue;
            },
        };

        let dependencies = manifest::load_manifest(&path)
            .map(|m| m.dependencies)
            .unwrap_or_default();
        found.push(DiscoveredExtension {
            id,
            dir: path,
            dependencies,
        });
    }

    info!(root = %root.display(), count = found.len(), "Discovered extensions");
    Ok(order_by_dependencies(found))
}

/// Order extensions so that dependencies come before their dependents.
///
/// Ties are broken by id. Extensions caught in a cycle, or depending on
/// something that was not discovered, keep their place at the end in id
/// order; loading them then fails with a dependency error.
#[must_use]
pub fn order_by_dependencies(extensions: Vec<DiscoveredExtension>) -> Vec<DiscoveredExtension> {
    let mut pending: BTreeMap<ExtensionId, DiscoveredExtension> = extensions
        .into_iter()
        .map(|ext| (ext.id.clone(), ext))
        .collect();
    let known: BTreeSet<String> = pending.keys().map(|id| id.as_str().to_owned()).collect();
    let mut placed: BTreeSet<String> = BTreeSet::new();
    let mut ordered = Vec::with_capacity(pending.len());

    loop {
        let ready: Vec<ExtensionId> = pending
            .values()
            .filter(|ext| {
                ext.dependencies
                    .iter()
                    .all(|dep| placed.contains(dep) || !known.contains(dep))
            })
            .map(|ext| ext.id.clone())
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in ready {
            if let Some(ext) = pending.remove(&id) {
                placed.insert(id.as_str().to_owned());
                ordered.push(ext);
            }
        }
    }

    if !pending.is_empty() {
        let stuck: Vec<&str> = pending.keys().map(ExtensionId::as_str).collect();
        warn!(extensions = ?stuck, "Dependency cycle among extensions");
        ordered.extend(pending.into_values());
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(id: &str, deps: &[&str]) -> DiscoveredExtension {
        DiscoveredExtension {
            id: ExtensionId::from_static(id),
            dir: PathBuf::from(id),
            dependencies: deps.iter().map(|d| (*d).to_owned()).collect(),
        }
    }

    fn ids(list: &[DiscoveredExtension]) -> Vec<&str> {
        list.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_independent_sorted_by_id() {
        let ordered = order_by_dependencies(vec![ext("b", &[]), ext("a", &[]), ext("c", &[])]);
        assert_eq!(ids(&ordered), ["a", "b", "c"]);
    }

    #[test]
    fn test_dependencies_first() {
        let ordered = order_by_dependencies(vec![
            ext("a", &["c"]),
            ext("b", &[]),
            ext("c", &["b"]),
        ]);
        assert_eq!(ids(&ordered), ["b", "c", "a"]);
    }

    #[test]
    fn test_unknown_dependency_does_not_block() {
        let ordered = order_by_dependencies(vec![ext("a", &["missing"]), ext("b", &[])]);
        assert_eq!(ids(&ordered), ["a", "b"]);
    }

    #[test]
    fn test_cycle_appended_last() {
        let ordered = order_by_dependencies(vec![
            ext("x", &["y"]),
            ext("y", &["x"]),
            ext("z", &[]),
        ]);
        assert_eq!(ids(&ordered), ["z", "x", "y"]);
    }

    #[test]
    fn test_discover_skips_files_and_hidden() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("Alpha")).unwrap();
        std::fs::create_dir(root.path().join(".git")).unwrap();
        std::fs::create_dir(root.path().join("bad name")).unwrap();
        std::fs::write(root.path().join("README.md"), "hi").unwrap();

        let found = discover(root.path()).unwrap();
        assert_eq!(ids(&found), ["Alpha"]);
    }

    #[test]
    fn test_discover_reads_dependencies() {
        let root = tempfile::tempdir().unwrap();
        for (name, deps) in [("Orders", r#"["Products"]"#), ("Products", "[]")] {
            let dir = root.path().join(name);
            std::fs::create_dir(&dir).unwrap();
            std::fs::write(
                dir.join(manifest::MANIFEST_FILE_NAME),
                format!(r#"{{"version":"1","author":"a","index":"i.js","dependencies":{deps}}}"#),
            )
            .unwrap();
        }
        let found = discover(root.path()).unwrap();
        assert_eq!(ids(&found), ["Products", "Orders"]);
    }
}
