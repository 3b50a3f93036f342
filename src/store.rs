//! On-disk `*.tf.json` resource files.
//!
//! An instance is spread over up to three kinds of files, selected per resource
//! by its `@scope` property:
//!
//! - `instance-<ts>.tf.json` holds the VM plus `@default` resources,
//! - `instance-<ts>-dedicated.tf.json` holds `@dedicated` resources,
//! - `scope-<label>.tf.json` holds resources shared by every instance using `<label>`.
//!
//! The VM records every other file it depends on in its attach tag so that
//! destroy can cascade without a separate index.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use walkdir::WalkDir;

use crate::error::{EngineError, Result};
use crate::platform::VmType;
use crate::resource::{
    InstanceId, PROP_HOSTNAME_PREFIX, PROP_SCOPE, RESOURCE_FILE_SUFFIX, ResourceDocument,
    ResourceName, ResourceProperties, ResourceType, SHARED_SCOPE_PREFIX, ScopeValue, TAG_ATTACH,
    resource_file_name,
};
use crate::tags::{self, Tags};

static INSTANCE_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(instance-[0-9]+)\.tf\.json$").expect("instance file pattern is valid")
});

/// VM resources keyed by type then name, as found across all instance files.
pub type VmIndex = BTreeMap<ResourceType, BTreeMap<ResourceName, ResourceProperties>>;

/// The one recognised VM-class resource in a document.
pub fn find_vm(doc: &ResourceDocument) -> Option<(VmType, &ResourceName, &ResourceProperties)> {
    doc.resource.iter().find_map(|(resource_type, by_name)| {
        let vm = VmType::parse(resource_type)?;
        let (name, props) = by_name.iter().next()?;
        Some((vm, name, props))
    })
}

#[derive(Debug, Clone)]
pub struct ResourceFileStore {
    dir: PathBuf,
}

impl ResourceFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, stem: &str) -> PathBuf {
        self.dir.join(resource_file_name(stem))
    }

    pub fn exists(&self, stem: &str) -> bool {
        self.path(stem).exists()
    }

    pub fn read(&self, stem: &str) -> Result<ResourceDocument> {
        let path = self.path(stem);
        let content = fs::read_to_string(&path).map_err(|e| EngineError::io(&path, e))?;
        serde_json::from_str(&content).map_err(|e| EngineError::json(&path, e))
    }

    /// Writes a document as indented JSON via a temp file and rename.
    pub fn write_document(&self, stem: &str, doc: &ResourceDocument) -> Result<()> {
        let path = self.path(stem);
        let tmp = self.dir.join(format!(".{stem}{RESOURCE_FILE_SUFFIX}.tmp"));
        let content = serde_json::to_string_pretty(doc).map_err(|e| EngineError::json(&path, e))?;
        fs::write(&tmp, content).map_err(|e| EngineError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| EngineError::io(&path, e))?;
        tracing::debug!(file = %path.display(), "wrote resource file");
        Ok(())
    }

    /// Removes a file; a file that is already gone is not an error.
    pub fn remove(&self, stem: &str) -> Result<()> {
        let path = self.path(stem);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(file = %path.display(), "removed resource file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::io(&path, e)),
        }
    }

    /// Loads an instance's VM file and locates its VM resource.
    pub fn load_instance(&self, id: &InstanceId) -> Result<(ResourceDocument, VmType)> {
        if !self.exists(id.as_str()) {
            return Err(EngineError::InstanceNotFound(id.to_string()));
        }
        let doc = self.read(id.as_str())?;
        let vm = find_vm(&doc)
            .map(|(vm, _, _)| vm)
            .ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
        Ok((doc, vm))
    }

    /// Routes every resource in `doc` to its destination file and writes them.
    ///
    /// The VM resource (of `vm`) is renamed to the instance ID and always lands
    /// in the instance's own file. Returns the stems of every file written.
    ///
    /// Files are written one at a time; a failure part way through leaves the
    /// earlier files in place.
    pub fn write_instance(
        &self,
        id: &InstanceId,
        doc: ResourceDocument,
        vm: VmType,
        logical_id: Option<&str>,
        attachments: &[String],
    ) -> Result<Vec<String>> {
        let own_stem = id.to_string();
        let mut files: BTreeMap<String, ResourceDocument> = BTreeMap::new();
        let mut vm_resource: Option<(ResourceProperties, Option<String>)> = None;

        for (resource_type, by_name) in doc.resource {
            for (name, mut props) in by_name {
                let scope = take_scope(&mut props);
                if resource_type == vm.as_str() {
                    if scope != ScopeValue::Default {
                        tracing::warn!(instance_id = %id, "ignoring @scope on VM resource");
                    }
                    let prefix = match props.remove(PROP_HOSTNAME_PREFIX) {
                        Some(Value::String(prefix)) => Some(prefix),
                        _ => None,
                    };
                    vm_resource = Some((props, prefix));
                    continue;
                }
                files
                    .entry(scope.file_stem(id))
                    .or_default()
                    .insert(resource_type.clone(), scope.resource_name(id, &name), props);
            }
        }

        let (mut vm_props, hostname_prefix) = vm_resource.ok_or(EngineError::NoVmResource)?;

        let attach: BTreeSet<String> = files
            .keys()
            .filter(|stem| **stem != own_stem)
            .cloned()
            .chain(attachments.iter().cloned())
            .collect();
        if !attach.is_empty() {
            let attach: Vec<String> = attach.into_iter().collect();
            let attach_tag = Tags::from([(TAG_ATTACH.to_string(), tags::encode_attach(&attach))]);
            tags::merge(vm, &mut vm_props, &attach_tag);
        }

        vm.apply_fixups(id.as_str(), logical_id, hostname_prefix.as_deref(), &mut vm_props);
        files
            .entry(own_stem.clone())
            .or_default()
            .insert(vm.as_str(), id.as_str(), vm_props);

        // Auxiliary files first so a VM never references a file that was not written.
        let mut order: Vec<String> = files.keys().filter(|s| **s != own_stem).cloned().collect();
        order.push(own_stem);

        for stem in &order {
            let Some(mut doc) = files.remove(stem) else {
                continue;
            };
            if stem.starts_with(SHARED_SCOPE_PREFIX) && self.exists(stem) {
                let mut existing = self.read(stem)?;
                for (resource_type, by_name) in doc.resource {
                    for (name, props) in by_name {
                        existing.insert(resource_type.clone(), name, props);
                    }
                }
                doc = existing;
            }
            self.write_document(stem, &doc)?;
        }

        tracing::info!(instance_id = %id, files = ?order, "wrote instance resource files");
        Ok(order)
    }

    /// Stems of every `instance-<digits>.tf.json` file in the directory.
    pub fn instance_stems(&self) -> Result<Vec<String>> {
        let mut stems = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.dir).to_path_buf();
                EngineError::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if let Some(captures) = INSTANCE_FILE.captures(&name) {
                stems.push(captures[1].to_string());
            }
        }
        stems.sort();
        Ok(stems)
    }

    /// Reads every instance file and indexes the VM resource of each.
    ///
    /// Files without a recognised VM type are skipped.
    pub fn scan_all(&self) -> Result<VmIndex> {
        let mut index = VmIndex::new();
        for stem in self.instance_stems()? {
            let doc = self.read(&stem)?;
            match find_vm(&doc) {
                Some((vm, name, props)) => {
                    index
                        .entry(vm.as_str().to_string())
                        .or_default()
                        .insert(name.clone(), props.clone());
                }
                None => tracing::debug!(file = %stem, "no known VM resource, skipping"),
            }
        }
        Ok(index)
    }
}

fn take_scope(props: &mut ResourceProperties) -> ScopeValue {
    match props.remove(PROP_SCOPE) {
        Some(Value::String(scope)) => ScopeValue::parse(&scope),
        Some(other) => {
            tracing::warn!(scope = %other, "non-string @scope, using @default");
            ScopeValue::Default
        }
        None => ScopeValue::Default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> ResourceDocument {
        serde_json::from_value(value).unwrap()
    }

    fn spec_doc() -> ResourceDocument {
        doc(json!({
            "resource": {
                "aws_instance": {
                    "vm": {"ami": "ami-1", "tags": {"team": "x"}}
                },
                "aws_ebs_volume": {
                    "boot": {"size": 10},
                    "data": {"@scope": "@dedicated", "size": 100}
                },
                "aws_security_group": {
                    "sg": {"@scope": "net", "name": "shared"}
                }
            }
        }))
    }

    #[test]
    fn test_write_instance_routes_by_scope() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceFileStore::new(dir.path());
        let id = InstanceId::new("instance-100");

        let written = store
            .write_instance(&id, spec_doc(), VmType::Aws, None, &[])
            .unwrap();
        assert_eq!(
            written,
            vec!["instance-100-dedicated", "scope-net", "instance-100"]
        );

        let own = store.read("instance-100").unwrap();
        assert!(own.get("aws_instance", "instance-100").is_some());
        assert_eq!(own.get("aws_ebs_volume", "instance-100-boot").unwrap()["size"], 10);

        let dedicated = store.read("instance-100-dedicated").unwrap();
        let data = dedicated.get("aws_ebs_volume", "instance-100-data").unwrap();
        assert_eq!(data["size"], 100);
        assert!(!data.contains_key("@scope"));

        let shared = store.read("scope-net").unwrap();
        assert!(shared.get("aws_security_group", "net-sg").is_some());
    }

    #[test]
    fn test_write_instance_attach_tag_lists_non_default_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceFileStore::new(dir.path());
        let id = InstanceId::new("instance-100");
        store
            .write_instance(&id, spec_doc(), VmType::Aws, None, &[])
            .unwrap();

        let own = store.read("instance-100").unwrap();
        let vm = own.get("aws_instance", "instance-100").unwrap();
        assert_eq!(
            tags::attached_files(VmType::Aws, vm),
            vec!["instance-100-dedicated", "scope-net"]
        );
        assert_eq!(vm["tags"]["team"], "x");
    }

    #[test]
    fn test_write_instance_without_auxiliary_files_has_no_attach_tag() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceFileStore::new(dir.path());
        let id = InstanceId::new("instance-5");
        let d = doc(json!({"resource": {"aws_instance": {"vm": {"ami": "ami-1"}}}}));
        store.write_instance(&id, d, VmType::Aws, None, &[]).unwrap();

        let own = store.read("instance-5").unwrap();
        let vm = own.get("aws_instance", "instance-5").unwrap();
        assert!(!vm.contains_key("tags"));
    }

    #[test]
    fn test_write_instance_requires_vm() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceFileStore::new(dir.path());
        let d = doc(json!({"resource": {"aws_ebs_volume": {"v": {"size": 1}}}}));
        let err = store
            .write_instance(&InstanceId::new("instance-1"), d, VmType::Aws, None, &[])
            .unwrap_err();
        assert!(matches!(err, EngineError::NoVmResource));
        assert!(store.instance_stems().unwrap().is_empty());
    }

    #[test]
    fn test_shared_scope_file_merges_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceFileStore::new(dir.path());
        let a = doc(json!({"resource": {
            "aws_instance": {"vm": {}},
            "aws_security_group": {"sg": {"@scope": "net"}}
        }}));
        let b = doc(json!({"resource": {
            "aws_instance": {"vm": {}},
            "aws_eip": {"ip": {"@scope": "net"}}
        }}));
        store
            .write_instance(&InstanceId::new("instance-1"), a, VmType::Aws, None, &[])
            .unwrap();
        store
            .write_instance(&InstanceId::new("instance-2"), b, VmType::Aws, None, &[])
            .unwrap();

        let shared = store.read("scope-net").unwrap();
        assert!(shared.get("aws_security_group", "net-sg").is_some());
        assert!(shared.get("aws_eip", "net-ip").is_some());
    }

    #[test]
    fn test_write_instance_applies_hostname_fixup() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceFileStore::new(dir.path());
        let id = InstanceId::new("instance-77");
        let d = doc(json!({"resource": {
            "softlayer_virtual_guest": {"vm": {"@hostname_prefix": "worker", "cores": 1}}
        }}));
        store
            .write_instance(&id, d, VmType::SoftLayer, None, &[])
            .unwrap();
        let own = store.read("instance-77").unwrap();
        let vm = own.get("softlayer_virtual_guest", "instance-77").unwrap();
        assert_eq!(vm["hostname"], "worker-77");
        assert!(!vm.contains_key(PROP_HOSTNAME_PREFIX));
    }

    #[test]
    fn test_extra_attachments_join_attach_tag() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceFileStore::new(dir.path());
        let id = InstanceId::new("instance-3");
        let d = doc(json!({"resource": {"aws_instance": {"vm": {}}}}));
        store
            .write_instance(&id, d, VmType::Aws, None, &["scope-existing".to_string()])
            .unwrap();
        let own = store.read("instance-3").unwrap();
        let vm = own.get("aws_instance", "instance-3").unwrap();
        assert_eq!(tags::attached_files(VmType::Aws, vm), vec!["scope-existing"]);
    }

    #[test]
    fn test_files_are_indented_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceFileStore::new(dir.path());
        let d = doc(json!({"resource": {"aws_instance": {"vm": {"ami": "ami-1"}}}}));
        store
            .write_instance(&InstanceId::new("instance-9"), d, VmType::Aws, None, &[])
            .unwrap();
        let content = fs::read_to_string(store.path("instance-9")).unwrap();
        assert!(content.starts_with("{\n  \"resource\": {"));
    }

    #[test]
    fn test_scan_all_only_reads_instance_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceFileStore::new(dir.path());
        store
            .write_instance(&InstanceId::new("instance-100"), spec_doc(), VmType::Aws, None, &[])
            .unwrap();
        let unknown = doc(json!({"resource": {"null_resource": {"n": {}}}}));
        store.write_document("instance-200", &unknown).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(
            store.instance_stems().unwrap(),
            vec!["instance-100", "instance-200"]
        );
        let index = store.scan_all().unwrap();
        assert_eq!(index.len(), 1);
        assert!(index["aws_instance"].contains_key("instance-100"));
    }

    #[test]
    fn test_load_instance_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceFileStore::new(dir.path());
        let err = store
            .load_instance(&InstanceId::new("instance-404"))
            .unwrap_err();
        assert!(matches!(err, EngineError::InstanceNotFound(_)));
    }

    #[test]
    fn test_remove_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceFileStore::new(dir.path());
        store.remove("scope-gone").unwrap();
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceFileStore::new(dir.path());
        fs::write(store.path("instance-1"), "{not json").unwrap();
        match store.scan_all() {
            Err(EngineError::Json { path, .. }) => assert_eq!(path, store.path("instance-1")),
            other => panic!("expected Json error, got {other:?}"),
        }
    }
}
