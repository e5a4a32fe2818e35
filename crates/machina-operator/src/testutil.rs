//! Shared test fixtures: node builders, an in-memory cache, a recording
//! Node API, and a scripted machine backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use machina_backend::{
    DriverData, FlagSet, FlagSpec, FlagValue, HostDescriptor, MachineBackend, MachineHandle,
    MachineState,
};
use machina_common::crd::{NodeClass, NodeClassSpec, ProvisioningConfig};
use machina_common::{
    Error, Result, CLASS_ANNOTATION_KEY, CONTROLLER_LABEL_KEY, CONTROLLER_NAME,
};

use crate::cache::ObjectCache;
use crate::controller::{Context, NodeApi};
use crate::migrate::MigrationTracker;
use crate::queue::WorkQueue;

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Unowned node with a unique UID
pub fn node_named(name: &str) -> Node {
    let mut node = Node::default();
    node.metadata.name = Some(name.to_string());
    node.metadata.uid = Some(format!(
        "uid-{}",
        NEXT_UID.fetch_add(1, Ordering::Relaxed)
    ));
    node
}

/// Node claimed by this controller
pub fn owned_node(name: &str) -> Node {
    let mut node = node_named(name);
    node.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(CONTROLLER_LABEL_KEY.to_string(), CONTROLLER_NAME.to_string());
    node
}

/// Owned node referencing a class by name
pub fn owned_node_with_class(name: &str, class: &str) -> Node {
    let mut node = owned_node(name);
    node.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(CLASS_ANNOTATION_KEY.to_string(), class.to_string());
    node
}

/// NodeClass with the given provider and empty payloads
pub fn class_named(name: &str, provider: &str) -> NodeClass {
    NodeClass::new(
        name,
        NodeClassSpec {
            provider: provider.to_string(),
            ..Default::default()
        },
    )
}

/// Creation timestamp at `secs` after the epoch
pub fn timestamp(secs: i64) -> Time {
    use k8s_openapi::chrono::TimeZone;
    Time(k8s_openapi::chrono::Utc.timestamp_opt(secs, 0).unwrap())
}

/// The driver-data envelope the scripted backend produces for a machine
pub fn fake_driver_data(name: &str) -> String {
    DriverData {
        driver: "fake".to_string(),
        name: name.to_string(),
        state: serde_json::json!({}),
    }
    .encode()
    .unwrap()
}

// ============================================================================
// In-memory cache
// ============================================================================

/// `ObjectCache` backed by a plain map
pub struct FakeCache<K> {
    objects: Mutex<HashMap<String, Arc<K>>>,
    synced: bool,
}

impl<K: ResourceExt> FakeCache<K> {
    /// Synced cache holding the given objects
    pub fn with(objects: Vec<K>) -> Self {
        Self::with_synced(objects, true)
    }

    /// Cache with explicit sync state
    pub fn with_synced(objects: Vec<K>, synced: bool) -> Self {
        let map = objects
            .into_iter()
            .map(|o| (o.name_any(), Arc::new(o)))
            .collect();
        Self {
            objects: Mutex::new(map),
            synced,
        }
    }

    /// Insert or replace an object, as a watch event would
    pub fn upsert(&self, object: K) {
        self.objects
            .lock()
            .unwrap()
            .insert(object.name_any(), Arc::new(object));
    }
}

impl<K: Send + Sync> ObjectCache<K> for FakeCache<K> {
    fn get(&self, name: &str) -> Option<Arc<K>> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.objects.lock().unwrap().values().cloned().collect()
    }

    fn has_synced(&self) -> bool {
        self.synced
    }
}

// ============================================================================
// Recording Node API
// ============================================================================

/// `NodeApi` that records patches and deletes instead of talking to a
/// cluster
pub struct RecordingApi {
    originals: HashMap<String, serde_json::Value>,
    patches: Mutex<Vec<(String, json_patch::Patch)>>,
    deletes: Mutex<Vec<String>>,
}

impl RecordingApi {
    /// Recorder seeded with the initial node documents
    pub fn new(nodes: &[Node]) -> Self {
        let originals = nodes
            .iter()
            .map(|n| (n.name_any(), serde_json::to_value(n).unwrap()))
            .collect();
        Self {
            originals,
            patches: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        }
    }

    /// All recorded patches
    pub fn patches(&self) -> Vec<(String, json_patch::Patch)> {
        self.patches.lock().unwrap().clone()
    }

    /// Names passed to delete, in order
    pub fn deleted(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    /// The node as it looks after every recorded patch for it, in order.
    /// Patches that no longer apply (already-satisfied removals) are
    /// skipped, mirroring patch-then-retry traffic.
    pub fn last_patched(&self, name: &str) -> Option<Node> {
        let patches = self.patches.lock().unwrap();
        let mut relevant = patches.iter().filter(|(n, _)| n == name).peekable();
        relevant.peek()?;

        let mut doc = self.originals.get(name)?.clone();
        for (_, patch) in relevant {
            let _ = json_patch::patch(&mut doc, &patch.0);
        }
        serde_json::from_value(doc).ok()
    }
}

#[async_trait]
impl NodeApi for RecordingApi {
    async fn patch_node(&self, name: &str, patch: &json_patch::Patch) -> Result<()> {
        self.patches
            .lock()
            .unwrap()
            .push((name.to_string(), patch.clone()));
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.deletes.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

// ============================================================================
// Scripted machine backend
// ============================================================================

#[derive(Default)]
struct BackendState {
    run_state: Mutex<Option<MachineState>>,
    fail_create: AtomicBool,
    fail_provision: AtomicBool,
    fail_remove: AtomicBool,
    created: Mutex<Vec<String>>,
    provisioned: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

/// Backend for the "fake" provider with scriptable failures
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<BackendState>,
}

impl ScriptedBackend {
    /// Happy-path backend: machines create instantly and report running
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next create call fail (transient)
    pub fn fail_next_create(&self) {
        self.state.fail_create.store(true, Ordering::SeqCst);
    }

    /// Make the next provision call fail (transient)
    pub fn fail_next_provision(&self) {
        self.state.fail_provision.store(true, Ordering::SeqCst);
    }

    /// Make the next remove call fail (transient)
    pub fn fail_next_remove(&self) {
        self.state.fail_remove.store(true, Ordering::SeqCst);
    }

    /// Override the reported run state
    pub fn set_run_state(&self, state: MachineState) {
        *self.state.run_state.lock().unwrap() = Some(state);
    }

    /// Number of machines created
    pub fn created_count(&self) -> usize {
        self.state.created.lock().unwrap().len()
    }

    /// Machines provisioned, in order
    pub fn provisioned(&self) -> Vec<String> {
        self.state.provisioned.lock().unwrap().clone()
    }

    /// Machines removed, in order
    pub fn removed(&self) -> Vec<String> {
        self.state.removed.lock().unwrap().clone()
    }
}

struct ScriptedHandle {
    name: String,
    state: Arc<BackendState>,
}

#[async_trait]
impl MachineHandle for ScriptedHandle {
    fn declared_flags(&self) -> Vec<FlagSpec> {
        vec![
            FlagSpec::with_default("fake-size", FlagValue::Int(1)),
            FlagSpec::with_default("engine-install-url", FlagValue::String(String::new())),
        ]
    }

    fn configure(&mut self, _flags: &FlagSet) -> Result<()> {
        Ok(())
    }

    async fn create(&mut self) -> Result<()> {
        if self.state.fail_create.swap(false, Ordering::SeqCst) {
            return Err(Error::backend_for(&self.name, "fake", "scripted create failure"));
        }
        self.state.created.lock().unwrap().push(self.name.clone());
        Ok(())
    }

    async fn provision(&mut self, _config: &ProvisioningConfig) -> Result<()> {
        if self.state.fail_provision.swap(false, Ordering::SeqCst) {
            return Err(Error::backend_for(
                &self.name,
                "fake",
                "scripted provision failure",
            ));
        }
        self.state
            .provisioned
            .lock()
            .unwrap()
            .push(self.name.clone());
        Ok(())
    }

    async fn ip(&self) -> Result<String> {
        Ok("203.0.113.10".to_string())
    }

    async fn ssh_hostname(&self) -> Result<String> {
        Ok(format!("{}.example.net", self.name))
    }

    async fn run_state(&self) -> Result<MachineState> {
        Ok(self
            .state
            .run_state
            .lock()
            .unwrap()
            .unwrap_or(MachineState::Running))
    }

    async fn remove(&mut self) -> Result<()> {
        if self.state.fail_remove.swap(false, Ordering::SeqCst) {
            return Err(Error::backend_for(&self.name, "fake", "scripted remove failure"));
        }
        self.state.removed.lock().unwrap().push(self.name.clone());
        Ok(())
    }

    fn driver_data(&self) -> Result<String> {
        Ok(fake_driver_data(&self.name))
    }
}

#[async_trait]
impl MachineBackend for ScriptedBackend {
    async fn new_host(
        &self,
        provider: &str,
        descriptor: HostDescriptor,
    ) -> Result<Box<dyn MachineHandle>> {
        if provider != "fake" {
            return Err(Error::backend_fatal(
                &descriptor.name,
                provider,
                "no driver registered for provider",
            ));
        }
        Ok(Box::new(ScriptedHandle {
            name: descriptor.name,
            state: Arc::clone(&self.state),
        }))
    }

    async fn load(&self, driver_data: &str) -> Result<Box<dyn MachineHandle>> {
        let data = DriverData::parse(driver_data)?;
        Ok(Box::new(ScriptedHandle {
            name: data.name,
            state: Arc::clone(&self.state),
        }))
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Everything a reconcile test needs, wired together
pub struct Harness {
    /// Reconcile context over the fakes below
    pub ctx: Arc<Context>,
    /// Recording API behind `ctx.api`
    pub api: Arc<RecordingApi>,
    /// Scripted backend behind `ctx.backend`
    pub backend: ScriptedBackend,
    /// Node cache behind `ctx.nodes`
    pub nodes: Arc<FakeCache<Node>>,
}

impl Harness {
    /// Harness recording against the given cluster contents
    pub fn new(nodes: Vec<Node>, classes: Vec<NodeClass>) -> Self {
        let api = Arc::new(RecordingApi::new(&nodes));
        Self::build(nodes, classes, api.clone(), api)
    }

    /// Harness with a custom `NodeApi` (e.g. a mock with expectations);
    /// the recording API is still constructed but sees no traffic.
    pub fn with_api(nodes: Vec<Node>, classes: Vec<NodeClass>, api: Arc<dyn NodeApi>) -> Self {
        let recorder = Arc::new(RecordingApi::new(&nodes));
        Self::build(nodes, classes, recorder, api)
    }

    fn build(
        nodes: Vec<Node>,
        classes: Vec<NodeClass>,
        recorder: Arc<RecordingApi>,
        api: Arc<dyn NodeApi>,
    ) -> Self {
        let backend = ScriptedBackend::new();
        let node_cache = Arc::new(FakeCache::with(nodes));
        let class_cache = Arc::new(FakeCache::with(classes));
        let ctx = Arc::new(Context {
            nodes: node_cache.clone(),
            classes: class_cache,
            api,
            backend: Arc::new(backend.clone()),
            queue: WorkQueue::new(),
            migrations: MigrationTracker::new(),
            max_migration_wait: Duration::from_secs(1),
        });
        Self {
            ctx,
            api: recorder,
            backend,
            nodes: node_cache,
        }
    }

    /// Clone a node out of the cache
    pub fn node(&self, name: &str) -> Node {
        (*self.nodes.get(name).expect("node in cache")).clone()
    }
}

/// Shorthand for tests that only need the context and the recorder
pub fn scripted_context(
    nodes: Vec<Node>,
    classes: Vec<NodeClass>,
) -> (Arc<Context>, Arc<RecordingApi>) {
    let harness = Harness::new(nodes, classes);
    (harness.ctx.clone(), harness.api.clone())
}
