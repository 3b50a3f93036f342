use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lock::FileLock;
use crate::platform::VmType;
use crate::resource::{
    InstanceDescription, InstanceId, InstanceSpec, PROP_SCOPE, ResourceDocument,
    ResourceProperties, ScopeValue, TAG_LOGICAL_ID, TAG_NAME,
};
use crate::store::{ResourceFileStore, find_vm};
use crate::tags::{self, Tags};
use crate::template;
use crate::terraform::{
    ApplyCoordinator, CliTerraform, FlatValue, Leadership, Standalone, TerraformExecutor,
    decode_resource, decode_resources,
};

/// Terraform-backed instance lifecycle: provision, destroy, label and describe.
pub struct InstanceEngine {
    store: ResourceFileStore,
    lock: FileLock,
    executor: Arc<dyn TerraformExecutor>,
    coordinator: ApplyCoordinator,
}

impl InstanceEngine {
    /// Engine driving the terraform binary, always allowed to apply.
    pub fn new(config: EngineConfig) -> Self {
        let executor = CliTerraform::new(config.terraform_bin.clone(), config.dir.clone())
            .with_env(config.env.clone());
        Self::with_parts(config, Arc::new(executor), Arc::new(Standalone))
    }

    pub fn with_parts(
        config: EngineConfig,
        executor: Arc<dyn TerraformExecutor>,
        leadership: Arc<dyn Leadership>,
    ) -> Self {
        let lock = FileLock::new(&config.dir, config.lock_retry);
        let coordinator = ApplyCoordinator::new(
            executor.clone(),
            leadership,
            lock.clone(),
            config.apply_settings(),
        );
        Self {
            store: ResourceFileStore::new(config.dir),
            lock,
            executor,
            coordinator,
        }
    }

    pub fn store(&self) -> &ResourceFileStore {
        &self.store
    }

    pub fn coordinator(&self) -> &ApplyCoordinator {
        &self.coordinator
    }

    /// Refreshes terraform state once and kicks off the apply loop.
    pub async fn start(&self) -> Result<()> {
        {
            let _guard = self.lock.acquire().await?;
            match self.executor.refresh().await {
                Ok(output) if output.success => tracing::info!("terraform refresh complete"),
                Ok(output) => tracing::warn!(stderr = %output.stderr.trim(), "terraform refresh failed"),
                Err(e) => tracing::warn!(error = %e, "terraform refresh failed"),
            }
        }
        self.coordinator.trigger();
        Ok(())
    }

    pub fn validate(&self, spec: &InstanceSpec) -> Result<()> {
        let doc = ResourceDocument::from_value(spec.properties.clone())?;
        vm_type_of(&doc)?.ok_or(EngineError::NoVmResource)?;
        Ok(())
    }

    /// Writes the instance's resource files and schedules an apply.
    ///
    /// Returns as soon as the files are on disk; apply failures are only logged.
    pub async fn provision(&self, spec: InstanceSpec) -> Result<InstanceId> {
        let id = {
            let _guard = self.lock.acquire().await?;
            let id = self.next_instance_id();
            let (doc, vm) = prepare(&spec, &id)?;
            self.store.write_instance(
                &id,
                doc,
                vm,
                spec.logical_id.as_deref(),
                &attachment_files(&spec),
            )?;
            id
        };
        tracing::info!(instance_id = %id, "provisioned instance");
        self.coordinator.trigger();
        Ok(id)
    }

    /// Provisions an instance and adopts an existing cloud resource as its VM.
    ///
    /// On import failure the state entry and the files written here are rolled back.
    pub async fn import_instance(&self, spec: InstanceSpec, cloud_id: &str) -> Result<InstanceId> {
        let id = {
            let _guard = self.lock.acquire().await?;
            let id = self.next_instance_id();
            let (doc, vm) = prepare(&spec, &id)?;
            let preexisting: BTreeSet<String> = doc
                .resource
                .values()
                .flat_map(|by_name| by_name.values())
                .filter_map(|props| props.get(PROP_SCOPE)?.as_str().map(ScopeValue::parse))
                .filter(|scope| matches!(scope, ScopeValue::Shared(_)))
                .map(|scope| scope.file_stem(&id))
                .filter(|stem| self.store.exists(stem))
                .collect();
            let written = self.store.write_instance(
                &id,
                doc,
                vm,
                spec.logical_id.as_deref(),
                &attachment_files(&spec),
            )?;

            let address = format!("{}.{}", vm.as_str(), id);
            let imported = match self.executor.import(&address, cloud_id).await {
                Ok(output) => output.into_result("import"),
                Err(e) => Err(e),
            };
            if let Err(e) = imported {
                tracing::warn!(instance_id = %id, cloud_id, error = %e, "import failed, rolling back");
                match self.executor.state_rm(&address).await {
                    Ok(output) if output.success => {}
                    Ok(output) => tracing::warn!(address = %address, stderr = %output.stderr.trim(), "state rm failed"),
                    Err(rm) => tracing::warn!(address = %address, error = %rm, "state rm failed"),
                }
                for stem in written.iter().filter(|s| !preexisting.contains(*s)) {
                    if let Err(rm) = self.store.remove(stem) {
                        tracing::warn!(file = %stem, error = %rm, "rollback could not remove file");
                    }
                }
                return Err(e);
            }
            id
        };
        tracing::info!(instance_id = %id, cloud_id, "imported instance");
        self.coordinator.trigger();
        Ok(id)
    }

    /// Removes the instance file and, recursively, every attached file no
    /// surviving instance references.
    ///
    /// An attached file that is itself an instance file is destroyed the same
    /// way, so its own dedicated and shared files are released too.
    pub async fn destroy(&self, id: &InstanceId) -> Result<()> {
        {
            let _guard = self.lock.acquire().await?;
            self.store.load_instance(id)?;

            // Decide everything before deleting anything.
            let removal = self.removal_set(id)?;
            for stem in &removal {
                self.store.remove(stem)?;
            }
            tracing::info!(instance_id = %id, removed = ?removal, "destroyed instance");
        }
        self.coordinator.trigger();
        Ok(())
    }

    /// Merges `new_tags` into the instance's VM tags.
    pub async fn label(&self, id: &InstanceId, new_tags: &Tags) -> Result<()> {
        {
            let _guard = self.lock.acquire().await?;
            let (mut doc, vm) = self.store.load_instance(id)?;
            let name = find_vm(&doc)
                .map(|(_, name, _)| name.clone())
                .ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
            if let Some(props) = doc.get_mut(vm.as_str(), &name) {
                tags::merge(vm, props, new_tags);
            }
            self.store.write_document(id.as_str(), &doc)?;
        }
        tracing::info!(instance_id = %id, "labelled instance");
        self.coordinator.trigger();
        Ok(())
    }

    /// Lists instances whose tags contain every `filter` entry.
    ///
    /// With `include_properties`, live attributes from `terraform show` are
    /// attached when available.
    pub async fn describe_instances(
        &self,
        filter: &Tags,
        include_properties: bool,
    ) -> Result<Vec<InstanceDescription>> {
        let (index, mut live) = {
            let _guard = self.lock.acquire().await?;
            let index = self.store.scan_all()?;
            let live = if include_properties {
                self.live_properties().await
            } else {
                BTreeMap::new()
            };
            (index, live)
        };

        let mut descriptions = Vec::new();
        for (resource_type, by_name) in index {
            let Some(vm) = VmType::parse(&resource_type) else {
                continue;
            };
            for (name, props) in by_name {
                let instance_tags = tags::parse(vm, &props);
                let matches = filter
                    .iter()
                    .all(|(key, value)| instance_tags.get(key) == Some(value));
                if !matches {
                    continue;
                }
                let logical_id = tags::find(&instance_tags, "logicalid").cloned();
                let properties = live
                    .remove(&format!("{resource_type}.{name}"))
                    .map(Value::from);
                descriptions.push(InstanceDescription {
                    id: InstanceId::new(name),
                    tags: instance_tags,
                    logical_id,
                    properties,
                });
            }
        }
        Ok(descriptions)
    }

    /// Live attributes keyed by `type.name`, from `terraform show` or, when
    /// that fails, per-VM `terraform state show`.
    async fn live_properties(&self) -> BTreeMap<String, FlatValue> {
        match self.executor.show().await {
            Ok(output) if output.success => return decode_resources(&output.stdout),
            Ok(output) => tracing::warn!(
                stderr = %output.stderr.trim(),
                "terraform show failed, falling back to state show"
            ),
            Err(e) => tracing::warn!(error = %e, "terraform show failed, falling back to state show"),
        }
        self.state_properties().await
    }

    async fn state_properties(&self) -> BTreeMap<String, FlatValue> {
        let listed = match self.executor.state_list().await {
            Ok(output) => output.into_result("state list"),
            Err(e) => Err(e),
        };
        let listed = match listed {
            Ok(stdout) => stdout,
            Err(e) => {
                tracing::warn!(error = %e, "terraform state list failed");
                return BTreeMap::new();
            }
        };

        let mut live = BTreeMap::new();
        let vm_addresses = listed.lines().map(str::trim).filter(|address| {
            address
                .split_once('.')
                .and_then(|(resource_type, _)| VmType::parse(resource_type))
                .is_some()
        });
        for address in vm_addresses {
            let shown = match self.executor.state_show(address).await {
                Ok(output) => output.into_result("state show"),
                Err(e) => Err(e),
            };
            match shown {
                Ok(stdout) => {
                    live.insert(address.to_string(), decode_resource(&stdout));
                }
                Err(e) => tracing::warn!(address, error = %e, "terraform state show failed"),
            }
        }
        live
    }

    /// Every file destroying `id` removes, in removal order.
    ///
    /// Reads all instance files up front; an unreadable one fails the whole
    /// call before anything is deleted.
    fn removal_set(&self, id: &InstanceId) -> Result<Vec<String>> {
        let mut attached_by: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for stem in self.store.instance_stems()? {
            let doc = self.store.read(&stem)?;
            let attached = find_vm(&doc)
                .map(|(vm, _, props)| tags::attached_files(vm, props))
                .unwrap_or_default();
            attached_by.insert(stem, attached);
        }

        let mut removed = BTreeSet::new();
        let mut order = Vec::new();
        let mut pending = vec![id.to_string()];
        while let Some(stem) = pending.pop() {
            if !removed.insert(stem.clone()) {
                continue;
            }
            let Some(attached) = attached_by.get(&stem) else {
                order.push(stem);
                continue;
            };
            for file in attached {
                if removed.contains(file) {
                    continue;
                }
                let still_referenced = attached_by
                    .iter()
                    .any(|(owner, files)| !removed.contains(owner) && files.contains(file));
                if !still_referenced {
                    pending.push(file.clone());
                }
            }
            order.push(stem);
        }
        Ok(order)
    }

    /// `instance-<unix seconds>`, bumped past any ID already on disk.
    fn next_instance_id(&self) -> InstanceId {
        let mut ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        loop {
            let id = InstanceId::from_timestamp(ts);
            if !self.store.exists(id.as_str()) && !self.store.exists(&id.dedicated_stem()) {
                return id;
            }
            ts += 1;
        }
    }
}

/// The single VM type in `doc`, if any.
fn vm_type_of(doc: &ResourceDocument) -> Result<Option<VmType>> {
    let vms: Vec<(VmType, &String)> = doc
        .resource
        .iter()
        .filter_map(|(resource_type, by_name)| Some((VmType::parse(resource_type)?, by_name)))
        .flat_map(|(vm, by_name)| by_name.keys().map(move |name| (vm, name)))
        .collect();
    match vms.as_slice() {
        [] => Ok(None),
        [(vm, _)] => Ok(Some(*vm)),
        many => Err(EngineError::MultipleVmResources(
            many.iter()
                .map(|(vm, name)| format!("{}.{}", vm.as_str(), name))
                .collect(),
        )),
    }
}

/// Renders templates and folds tags and init into the VM resource.
fn prepare(spec: &InstanceSpec, id: &InstanceId) -> Result<(ResourceDocument, VmType)> {
    let mut properties = spec.properties.clone();
    template::render_value(&mut properties, id.as_str());
    let mut doc = ResourceDocument::from_value(properties)?;
    let vm = vm_type_of(&doc)?.ok_or(EngineError::NoVmResource)?;

    let mut managed = spec.tags.clone();
    managed.insert(TAG_NAME.to_string(), id.to_string());
    if let Some(logical_id) = &spec.logical_id {
        managed.insert(TAG_LOGICAL_ID.to_string(), logical_id.clone());
    }
    let init = template::render_str(&spec.init, id.as_str());

    let vm_props = doc
        .resource
        .get_mut(vm.as_str())
        .and_then(|by_name| by_name.values_mut().next())
        .ok_or(EngineError::NoVmResource)?;
    tags::merge(vm, vm_props, &managed);
    merge_init(vm, vm_props, &init)?;
    Ok((doc, vm))
}

/// Appends `init` to the platform's user-data property, base64 encoding where needed.
fn merge_init(vm: VmType, props: &mut ResourceProperties, init: &str) -> Result<()> {
    if init.is_empty() {
        return Ok(());
    }
    let path: Vec<&str> = vm.user_data_property().split('.').collect();
    let Some((leaf, parents)) = path.split_last() else {
        return Ok(());
    };

    let mut target = props;
    for segment in parents {
        let entry = target
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        // Terraform blocks may be written as a one-element list.
        let entry = match entry {
            Value::Array(items) => {
                if items.is_empty() {
                    items.push(Value::Object(Map::new()));
                }
                &mut items[0]
            }
            other => other,
        };
        target = entry.as_object_mut().ok_or_else(|| {
            EngineError::InvalidSpec(format!("`{segment}` must be an object to hold user data"))
        })?;
    }

    let script = match target.get(*leaf) {
        Some(Value::String(existing)) if !existing.is_empty() => format!("{existing}\n{init}"),
        _ => init.to_string(),
    };
    let script = if vm.encodes_user_data() {
        BASE64.encode(script)
    } else {
        script
    };
    target.insert(leaf.to_string(), Value::String(script));
    Ok(())
}

fn attachment_files(spec: &InstanceSpec) -> Vec<String> {
    spec.attachments.iter().map(|a| a.id.clone()).collect()
}
