//! Node builders and a scripted in-memory cloud provider for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeSpec, NodeStatus, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use crate::provider::{CloudProvider, Instance, NodeGroup, ProviderError};
use crate::readiness::{node_name, provider_id};

/// Build a minimal node with its provider id equal to its name and no
/// creation timestamp (i.e. created in the distant past).
pub(crate) fn build_test_node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(name.to_string()),
            ..Default::default()
        }),
        status: Some(NodeStatus::default()),
    }
}

/// Set the node's `Ready` condition.
pub(crate) fn set_node_ready(node: &mut Node, ready: bool, last_transition: DateTime<Utc>) {
    let condition = NodeCondition {
        type_: "Ready".to_string(),
        status: if ready { "True" } else { "False" }.to_string(),
        last_transition_time: Some(Time(last_transition)),
        ..Default::default()
    };
    let status = node.status.get_or_insert_with(NodeStatus::default);
    let conditions = status.conditions.get_or_insert_with(Vec::new);
    conditions.retain(|existing| existing.type_ != "Ready");
    conditions.push(condition);
}

/// Set the node's creation timestamp.
pub(crate) fn set_creation_time(node: &mut Node, time: DateTime<Utc>) {
    node.metadata.creation_timestamp = Some(Time(time));
}

/// Add a `NoSchedule` taint with the given key.
pub(crate) fn add_taint(node: &mut Node, key: &str) {
    let spec = node.spec.get_or_insert_with(NodeSpec::default);
    spec.taints.get_or_insert_with(Vec::new).push(Taint {
        key: key.to_string(),
        effect: "NoSchedule".to_string(),
        ..Default::default()
    });
}

/// Remove all taints with the given key.
pub(crate) fn remove_taint(node: &mut Node, key: &str) {
    if let Some(taints) = node.spec.as_mut().and_then(|spec| spec.taints.as_mut()) {
        taints.retain(|taint| taint.key != key);
    }
}

#[derive(Clone, Copy, Debug)]
struct GroupSettings {
    min: usize,
    max: usize,
    target: usize,
}

#[derive(Default)]
struct ProviderInner {
    groups: BTreeMap<String, GroupSettings>,
    /// Provider id -> group name. Survives instance termination, the way a
    /// real provider resolves membership from node metadata.
    node_to_group: HashMap<String, String>,
    /// Provider ids with a live backing instance.
    alive: HashSet<String>,
    instances_unsupported: bool,
    has_instance_unsupported: bool,
    target_size_fails: bool,
}

/// Scripted cloud provider: tests add groups and nodes, flip capability
/// flags, and the registry observes the result through the provider traits.
pub(crate) struct TestCloudProvider {
    inner: Arc<Mutex<ProviderInner>>,
}

impl TestCloudProvider {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(ProviderInner::default())),
        })
    }

    pub(crate) fn add_node_group(&self, id: &str, min: usize, max: usize, target: usize) {
        self.inner
            .lock()
            .unwrap()
            .groups
            .insert(id.to_string(), GroupSettings { min, max, target });
    }

    pub(crate) fn set_target_size(&self, id: &str, target: usize) {
        if let Some(group) = self.inner.lock().unwrap().groups.get_mut(id) {
            group.target = target;
        }
    }

    /// Register a node (and its live instance) under a group name. The
    /// group does not have to exist; unknown groups model nodes outside
    /// any autoscaled group.
    pub(crate) fn add_node(&self, group_id: &str, node: &Node) {
        let key = node_key(node);
        let mut inner = self.inner.lock().unwrap();
        inner.node_to_group.insert(key.clone(), group_id.to_string());
        inner.alive.insert(key);
    }

    /// Terminate the node's backing instance. Group membership knowledge
    /// survives, as it would with a real provider.
    pub(crate) fn delete_node(&self, node: &Node) {
        self.inner.lock().unwrap().alive.remove(&node_key(node));
    }

    /// Make `instances()` report `NotImplemented`.
    pub(crate) fn set_instances_unsupported(&self) {
        self.inner.lock().unwrap().instances_unsupported = true;
    }

    /// Make `has_instance()` report `NotImplemented`.
    pub(crate) fn set_has_instance_unsupported(&self) {
        self.inner.lock().unwrap().has_instance_unsupported = true;
    }

    /// Make `target_size()` fail transiently.
    pub(crate) fn set_target_size_fails(&self, fails: bool) {
        self.inner.lock().unwrap().target_size_fails = fails;
    }
}

fn node_key(node: &Node) -> String {
    provider_id(node).unwrap_or(node_name(node)).to_string()
}

struct TestNodeGroup {
    id: String,
    inner: Arc<Mutex<ProviderInner>>,
}

impl NodeGroup for TestNodeGroup {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn min_size(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .groups
            .get(&self.id)
            .map_or(0, |group| group.min)
    }

    fn max_size(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .groups
            .get(&self.id)
            .map_or(0, |group| group.max)
    }

    fn target_size(&self) -> Result<usize, ProviderError> {
        let inner = self.inner.lock().unwrap();
        if inner.target_size_fails {
            return Err(ProviderError::Transient("target size unavailable".to_string()));
        }
        inner
            .groups
            .get(&self.id)
            .map(|group| group.target)
            .ok_or_else(|| ProviderError::Transient("unknown node group".to_string()))
    }

    fn instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let inner = self.inner.lock().unwrap();
        if inner.instances_unsupported {
            return Err(ProviderError::NotImplemented);
        }
        let mut instances: Vec<Instance> = inner
            .node_to_group
            .iter()
            .filter(|(id, group)| group.as_str() == self.id && inner.alive.contains(id.as_str()))
            .map(|(id, _)| Instance { id: id.clone() })
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }
}

impl CloudProvider for TestCloudProvider {
    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>> {
        let inner = self.inner.lock().unwrap();
        inner
            .groups
            .keys()
            .map(|id| {
                Arc::new(TestNodeGroup {
                    id: id.clone(),
                    inner: self.inner.clone(),
                }) as Arc<dyn NodeGroup>
            })
            .collect()
    }

    fn node_group_for_node(&self, node: &Node) -> Option<Arc<dyn NodeGroup>> {
        let inner = self.inner.lock().unwrap();
        let group_id = inner.node_to_group.get(&node_key(node))?;
        if !inner.groups.contains_key(group_id) {
            return None;
        }
        Some(Arc::new(TestNodeGroup {
            id: group_id.clone(),
            inner: self.inner.clone(),
        }))
    }

    fn has_instance(&self, node: &Node) -> Result<bool, ProviderError> {
        let inner = self.inner.lock().unwrap();
        if inner.has_instance_unsupported {
            return Err(ProviderError::NotImplemented);
        }
        Ok(inner.alive.contains(&node_key(node)))
    }
}
