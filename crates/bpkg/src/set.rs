//! The package set: every package currently loaded by this node,
//! keyed by `ident` (`spec.md` §2.9 "wiring", §6 `ADDPACKAGE`/
//! `REMPACKAGE`/`PACKAGES`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::error::BpkgError;
use crate::package::{FileCheck, Package};

/// Exclusive owner of every loaded [`Package`] (`spec.md` §3,
/// "Ownership: ... the package set exclusively owns packages").
#[derive(Default)]
pub struct PackageSet {
    packages: Mutex<HashMap<String, Arc<Package>>>,
}

impl PackageSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the manifest at `manifest_path` and add it to the set.
    /// Manifest parse failures leave the set unchanged
    /// (`spec.md` §7: "package not added").
    pub fn add(&self, manifest_path: &Path) -> Result<FileCheck, BpkgError> {
        let (package, file_check) = Package::load(manifest_path)?;
        let ident = package.ident.clone();
        info!(%ident, "package added to set");
        self.packages
            .lock()
            .expect("package set lock poisoned")
            .insert(ident, Arc::new(package));
        Ok(file_check)
    }

    /// Remove the package identified by `ident`, if present.
    pub fn remove(&self, ident: &str) {
        self.packages
            .lock()
            .expect("package set lock poisoned")
            .remove(ident);
    }

    /// Look up a package by `ident`.
    #[must_use]
    pub fn find(&self, ident: &str) -> Option<Arc<Package>> {
        self.packages
            .lock()
            .expect("package set lock poisoned")
            .get(ident)
            .cloned()
    }

    /// Every currently loaded package's `ident`.
    #[must_use]
    pub fn idents(&self) -> Vec<String> {
        self.packages
            .lock()
            .expect("package set lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.lock().expect("package set lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn add_find_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = dir.path().join("data.bin");
        let leaf = crate::hash::hash_bytes(&[0u8; 16]);
        let manifest = dir.path().join("pkg.bpkg");
        let text = format!(
            "ident:{}\nfilename:{}\nsize:16\nnhashes:0\nhashes:\nnchunks:1\nchunks:\n  {leaf},0,16\n",
            "1".repeat(32),
            data_file.display(),
        );
        File::create(&manifest).unwrap().write_all(text.as_bytes()).unwrap();

        let set = PackageSet::new();
        set.add(&manifest).unwrap();
        assert_eq!(set.idents(), vec!["1".repeat(32)]);
        assert!(set.find(&"1".repeat(32)).is_some());

        set.remove(&"1".repeat(32));
        assert!(set.is_empty());
    }

    #[test]
    fn add_of_malformed_manifest_leaves_set_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("bad.bpkg");
        File::create(&manifest).unwrap().write_all(b"not a manifest").unwrap();

        let set = PackageSet::new();
        assert!(set.add(&manifest).is_err());
        assert!(set.is_empty());
    }
}
