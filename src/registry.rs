//! The cluster state registry.
//!
//! [`ClusterStateRegistry`] fuses three asynchronous views of the managed
//! cluster (nodes as Kubernetes reports them, instances as the cloud
//! provider reports them, and the scale requests the autoscaler itself has
//! issued) into one consistent picture. Every `update_nodes` call
//! reconciles the node snapshot against the provider's instance listings,
//! classifies node readiness, ages scale requests, evaluates health
//! thresholds and refreshes the material behind the published status.
//!
//! A single reconciliation loop drives `update_nodes`; other callers
//! register scale intents and query health gates concurrently. One
//! read/write lock protects the whole state and every query returns
//! defensive copies.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::ClusterStateConfig;
use crate::error::Result;
use crate::events::EventRecorder;
use crate::provider::{CloudProvider, Instance, NodeGroup, ProviderError};
use crate::readiness::{
    creation_time, has_not_ready_taint, has_to_be_deleted_taint, is_node_ready, node_name,
    provider_id,
};
use crate::status::{
    preserve_last_transition_times, AutoscalerStatus, Condition, ConditionStatus, ConditionType,
    NodeGroupStatus,
};

/// Why a scale-up attempt is considered failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailedScaleUpReason {
    /// The requested nodes did not appear within the provisioning window.
    Timeout,
    /// The orchestration API rejected or lost the request.
    ApiError,
    /// The cloud provider reported an error for the request.
    CloudProviderError,
    /// The cloud provider refused the request for quota reasons.
    QuotaExceeded,
}

impl std::fmt::Display for FailedScaleUpReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            FailedScaleUpReason::Timeout => "timeout",
            FailedScaleUpReason::ApiError => "apiCallError",
            FailedScaleUpReason::CloudProviderError => "cloudProviderError",
            FailedScaleUpReason::QuotaExceeded => "quotaExceeded",
        };
        f.write_str(reason)
    }
}

/// An outstanding request to grow a node group. At most one is live per
/// group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleUpRequest {
    /// Group being grown.
    pub group_id: String,
    /// How many nodes are still expected to appear.
    pub increase: usize,
    /// When the request was last (re)armed by a positive delta.
    pub time: DateTime<Utc>,
    /// Deadline after which the request is declared failed.
    pub expected_add_time: DateTime<Utc>,
}

/// An in-flight removal of a single node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleDownRequest {
    /// Group the node belongs to.
    pub group_id: String,
    /// Node being removed.
    pub node_name: String,
    /// When the removal was initiated.
    pub time: DateTime<Utc>,
    /// When the node is expected to be gone.
    pub expected_delete_time: DateTime<Utc>,
}

/// A scale-up that did not complete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleUpFailure {
    /// Group whose scale-up failed.
    pub group_id: String,
    /// Failure class.
    pub reason: FailedScaleUpReason,
    /// When the failure was recorded.
    pub time: DateTime<Utc>,
}

/// A node group whose observed size disagrees with what the provider is
/// converging towards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncorrectNodeGroupSize {
    /// Size the provider reports as the target.
    pub expected_size: usize,
    /// Registered nodes actually observed.
    pub current_size: usize,
    /// When this exact mismatch was first observed. Sticky: consecutive
    /// updates with the same `(expected, current)` keep the original value.
    pub first_observed: DateTime<Utc>,
}

/// A cloud instance that has not yet registered as a cluster node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnregisteredNode {
    /// Provider-assigned instance id.
    pub instance_id: String,
    /// Group the instance belongs to.
    pub group_id: String,
    /// When the instance was first seen without a matching node.
    pub unregistered_since: DateTime<Utc>,
}

/// Node names bucketed by readiness, for the whole cluster or one group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Readiness {
    /// Every node registered with the cluster.
    pub registered: Vec<String>,
    /// Nodes serving traffic.
    pub ready: Vec<String>,
    /// Nodes that are down and no longer excused by the startup window.
    pub unready: Vec<String>,
    /// Registered nodes still inside their startup window.
    pub not_started: Vec<String>,
    /// Cloud instances with no cluster-side node yet.
    pub unregistered: Vec<String>,
    /// Unregistered instances past the provisioning window.
    pub long_unregistered: Vec<String>,
    /// Registered nodes whose cloud instance is gone.
    pub deleted: Vec<String>,
    /// When this view was computed.
    pub time: DateTime<Utc>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            registered: Vec::new(),
            ready: Vec::new(),
            unready: Vec::new(),
            not_started: Vec::new(),
            unregistered: Vec::new(),
            long_unregistered: Vec::new(),
            deleted: Vec::new(),
            time: DateTime::UNIX_EPOCH,
        }
    }
}

impl Readiness {
    fn at(time: DateTime<Utc>) -> Self {
        Self {
            time,
            ..Default::default()
        }
    }
}

/// Sizes a group may legitimately have given in-flight requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AcceptableRange {
    /// Fewest registered nodes that still counts as converged.
    min_nodes: i64,
    /// Most registered nodes that still counts as converged.
    max_nodes: i64,
    /// The provider-reported target itself.
    current_target: usize,
}

enum NodeBucket {
    Ready,
    Unready,
    NotStarted,
    Deleted,
}

struct RegistryState {
    nodes: Vec<Node>,
    scale_up_requests: HashMap<String, ScaleUpRequest>,
    scale_down_requests: Vec<ScaleDownRequest>,
    scale_up_failures: HashMap<String, Vec<ScaleUpFailure>>,
    total_readiness: Readiness,
    per_group_readiness: HashMap<String, Readiness>,
    acceptable_ranges: HashMap<String, AcceptableRange>,
    incorrect_sizes: HashMap<String, IncorrectNodeGroupSize>,
    unregistered_nodes: HashMap<String, UnregisteredNode>,
    deleted_nodes: HashMap<String, DateTime<Utc>>,
    instance_cache: HashMap<String, Vec<Instance>>,
    scale_down_candidates: HashMap<String, Vec<String>>,
    last_candidates_update: Option<DateTime<Utc>>,
    last_status: Option<AutoscalerStatus>,
    backoff: ExponentialBackoff,
}

/// In-memory authority over the reconciled cluster state.
pub struct ClusterStateRegistry {
    provider: Arc<dyn CloudProvider>,
    config: ClusterStateConfig,
    recorder: Arc<dyn EventRecorder>,
    state: RwLock<RegistryState>,
}

impl ClusterStateRegistry {
    /// Create a registry over the given provider. Fails when the
    /// configuration is invalid.
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        config: ClusterStateConfig,
        recorder: Arc<dyn EventRecorder>,
    ) -> Result<Self> {
        config.validate()?;
        let backoff = ExponentialBackoff::new(config.backoff.clone());
        Ok(Self {
            provider,
            config,
            recorder,
            state: RwLock::new(RegistryState {
                nodes: Vec::new(),
                scale_up_requests: HashMap::new(),
                scale_down_requests: Vec::new(),
                scale_up_failures: HashMap::new(),
                total_readiness: Readiness::default(),
                per_group_readiness: HashMap::new(),
                acceptable_ranges: HashMap::new(),
                incorrect_sizes: HashMap::new(),
                unregistered_nodes: HashMap::new(),
                deleted_nodes: HashMap::new(),
                instance_cache: HashMap::new(),
                scale_down_candidates: HashMap::new(),
                last_candidates_update: None,
                last_status: None,
                backoff,
            }),
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ingest the latest node snapshot and reconcile it against the cloud
    /// provider view.
    ///
    /// Holds the write lock for the whole body, so status queries observe
    /// either the previous or the new state, never a mix. Scale-request
    /// aging runs after reconciliation: nodes observed in this snapshot can
    /// satisfy a pending request before its timeout is declared.
    pub fn update_nodes(&self, nodes: &[Node], now: DateTime<Utc>) -> Result<()> {
        let groups = self.provider.node_groups();
        let mut guard = self.write_state();
        let state = &mut *guard;

        let targets = self.fetch_target_sizes(&groups, state);
        self.refresh_instance_cache(&groups, &mut state.instance_cache);

        state.nodes = nodes.to_vec();
        self.update_deleted_nodes(state, now);
        self.update_unregistered_nodes(state, now);
        self.update_readiness(state, now);
        self.update_acceptable_ranges(state, &targets);
        self.update_scale_requests(state, now);
        // Ranges shift once timed-out requests are gone.
        self.update_acceptable_ranges(state, &targets);
        self.update_incorrect_sizes(state, now);

        #[cfg(feature = "metrics")]
        crate::metrics::observe_cluster_state(
            &state.total_readiness,
            state.unregistered_nodes.len(),
        );

        debug!(
            nodes = state.nodes.len(),
            ready = state.total_readiness.ready.len(),
            unready = state.total_readiness.unready.len(),
            unregistered = state.unregistered_nodes.len(),
            deleted = state.deleted_nodes.len(),
            "cluster state updated"
        );
        Ok(())
    }

    /// Latch the current scale-down candidates for the next status
    /// publication.
    pub fn update_scale_down_candidates(&self, nodes: &[Node], now: DateTime<Utc>) {
        let mut candidates: HashMap<String, Vec<String>> = HashMap::new();
        for node in nodes {
            if let Some(group) = self.provider.node_group_for_node(node) {
                candidates
                    .entry(group.id())
                    .or_default()
                    .push(node_name(node).to_string());
            }
        }
        let mut state = self.write_state();
        state.scale_down_candidates = candidates;
        state.last_candidates_update = Some(now);
    }

    /// Register a new scale-up for the group or fold `delta` into the live
    /// one.
    ///
    /// A positive delta restarts the provisioning clock; a negative delta
    /// records partial fulfilment and keeps the original deadline. The
    /// request disappears once its remaining increase is zero or less.
    pub fn register_or_update_scale_up(&self, group_id: &str, delta: i64, now: DateTime<Utc>) {
        let mut state = self.write_state();
        match state.scale_up_requests.get(group_id).cloned() {
            None => {
                if delta <= 0 {
                    return;
                }
                info!(group = %group_id, delta, "registering scale-up");
                state.scale_up_requests.insert(
                    group_id.to_string(),
                    ScaleUpRequest {
                        group_id: group_id.to_string(),
                        increase: delta as usize,
                        time: now,
                        expected_add_time: now + self.config.max_node_provision_time,
                    },
                );
            }
            Some(mut request) => {
                let increase = request.increase as i64 + delta;
                if increase <= 0 {
                    debug!(group = %group_id, "scale-up fully consumed, dropping request");
                    state.scale_up_requests.remove(group_id);
                    return;
                }
                request.increase = increase as usize;
                if delta > 0 {
                    request.time = now;
                    request.expected_add_time = now + self.config.max_node_provision_time;
                }
                state
                    .scale_up_requests
                    .insert(group_id.to_string(), request);
            }
        }
    }

    /// Record an in-flight node removal.
    pub fn register_scale_down(&self, request: ScaleDownRequest) {
        self.write_state().scale_down_requests.push(request);
    }

    /// Record a scale-up failure reported by an action executor (quota,
    /// API errors and the like) and back the group off.
    pub fn register_failed_scale_up(
        &self,
        group_id: &str,
        reason: FailedScaleUpReason,
        now: DateTime<Utc>,
    ) {
        let mut state = self.write_state();
        Self::note_failed_scale_up(&mut state, group_id, reason, now);
    }

    /// Whether the cluster as a whole passes the unready thresholds.
    pub fn is_cluster_healthy(&self) -> bool {
        let state = self.read_state();
        self.cluster_healthy(&state)
    }

    /// Whether the group's registered nodes cover what its in-flight
    /// requests allow.
    pub fn is_node_group_healthy(&self, group_id: &str) -> bool {
        let state = self.read_state();
        self.node_group_healthy(&state, group_id)
    }

    /// Whether a live scale-up for the group still has nodes to deliver.
    pub fn is_node_group_scaling_up(&self, group_id: &str) -> bool {
        let state = self.read_state();
        Self::node_group_scaling_up(&state, group_id)
    }

    /// Whether the group may be scaled up right now: healthy and not backed
    /// off after a recent failure.
    pub fn is_node_group_safe_to_scale_up(&self, group_id: &str, now: DateTime<Utc>) -> bool {
        let state = self.read_state();
        self.node_group_healthy(&state, group_id) && !state.backoff.is_backed_off(group_id, now)
    }

    /// How many new nodes each group is expected to produce, and the names
    /// of registered-but-not-started nodes per group. Groups expecting
    /// nothing are omitted.
    pub fn get_upcoming_nodes(&self) -> (HashMap<String, usize>, HashMap<String, Vec<String>>) {
        let state = self.read_state();
        let mut counts = HashMap::new();
        let mut registered = HashMap::new();
        for (group_id, range) in &state.acceptable_ranges {
            let empty = Readiness::default();
            let readiness = state.per_group_readiness.get(group_id).unwrap_or(&empty);
            let counted =
                readiness.ready.len() + readiness.unready.len() + readiness.long_unregistered.len();
            let new_nodes = range.current_target as i64 - counted as i64;
            if new_nodes <= 0 {
                continue;
            }
            counts.insert(group_id.clone(), new_nodes as usize);
            // Instances that exist only provider-side are not listed: they
            // have no registered node to name yet.
            registered.insert(group_id.clone(), readiness.not_started.clone());
        }
        (counts, registered)
    }

    /// Cloud instances with no matching cluster node, sorted by instance id.
    pub fn get_unregistered_nodes(&self) -> Vec<UnregisteredNode> {
        let state = self.read_state();
        let mut unregistered: Vec<UnregisteredNode> =
            state.unregistered_nodes.values().cloned().collect();
        unregistered.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        unregistered
    }

    /// Names of registered nodes whose cloud instance is gone, sorted.
    pub fn get_cloud_provider_deleted_nodes(&self) -> Vec<String> {
        let state = self.read_state();
        let mut names: Vec<String> = state.deleted_nodes.keys().cloned().collect();
        names.sort();
        names
    }

    /// The cluster-wide readiness view from the last `update_nodes`.
    pub fn get_cluster_readiness(&self) -> Readiness {
        self.read_state().total_readiness.clone()
    }

    /// Scale-up failures recorded since the last
    /// [`clear_scale_up_failures`](Self::clear_scale_up_failures).
    pub fn get_scale_up_failures(&self) -> HashMap<String, Vec<ScaleUpFailure>> {
        self.read_state().scale_up_failures.clone()
    }

    /// Forget recorded scale-up failures, typically after they have been
    /// published.
    pub fn clear_scale_up_failures(&self) {
        self.write_state().scale_up_failures.clear();
    }

    /// Registered and target node counts across autoscaled groups. Nodes
    /// outside any known group are not counted.
    pub fn get_autoscaled_nodes_count(&self) -> (usize, usize) {
        let state = self.read_state();
        let current = state
            .per_group_readiness
            .values()
            .map(|readiness| readiness.registered.len())
            .sum();
        let target = state
            .acceptable_ranges
            .values()
            .map(|range| range.current_target)
            .sum();
        (current, target)
    }

    /// Read-only view of the groups whose size disagrees with their target.
    pub fn get_incorrect_node_group_sizes(&self) -> HashMap<String, IncorrectNodeGroupSize> {
        self.read_state().incorrect_sizes.clone()
    }

    /// Drop the cached instance listing for one group so the next
    /// `update_nodes` fetches a fresh one.
    pub fn invalidate_node_instances_cache_entry(&self, group_id: &str) {
        self.write_state().instance_cache.remove(group_id);
    }

    /// Assemble the current status document, preserving each condition's
    /// `last_transition_time` while its status is unchanged.
    pub fn get_status(&self, now: DateTime<Utc>) -> AutoscalerStatus {
        let groups = self.provider.node_groups();
        let mut guard = self.write_state();
        let state = &mut *guard;

        let mut status = AutoscalerStatus {
            clusterwide_conditions: Vec::new(),
            node_group_statuses: Vec::new(),
        };
        // Scale-down conditions are probed when candidates were last latched.
        let candidates_probed = state.last_candidates_update.unwrap_or(now);

        for group in &groups {
            let group_id = group.id();
            let conditions = vec![
                self.build_group_health_condition(state, group.as_ref(), now),
                self.build_group_scale_up_condition(state, &group_id, now),
                Self::build_scale_down_condition(
                    state.scale_down_candidates.get(&group_id).map_or(0, Vec::len),
                    candidates_probed,
                ),
            ];
            status.node_group_statuses.push(NodeGroupStatus {
                provider_id: group_id,
                conditions,
            });
        }

        status
            .clusterwide_conditions
            .push(self.build_cluster_health_condition(state, now));
        status
            .clusterwide_conditions
            .push(Self::build_cluster_scale_up_condition(state, &status.node_group_statuses, now));
        let candidate_count = state.scale_down_candidates.values().map(Vec::len).sum();
        status
            .clusterwide_conditions
            .push(Self::build_scale_down_condition(candidate_count, candidates_probed));

        if let Some(previous) = &state.last_status {
            preserve_last_transition_times(&mut status, previous);
        }
        state.last_status = Some(status.clone());
        status
    }

    // ── reconciliation steps ───────────────────────────────────────────────

    fn fetch_target_sizes(
        &self,
        groups: &[Arc<dyn NodeGroup>],
        state: &RegistryState,
    ) -> HashMap<String, usize> {
        let mut targets = HashMap::new();
        for group in groups {
            let group_id = group.id();
            match group.target_size() {
                Ok(size) => {
                    targets.insert(group_id, size);
                }
                Err(err) => {
                    warn!(group = %group_id, error = %err, "failed to read node group target size");
                    self.recorder.warning(
                        "CloudProviderError",
                        &format!("failed to read target size of node group {group_id}: {err}"),
                    );
                    // Keep reconciling against the last known target.
                    if let Some(range) = state.acceptable_ranges.get(&group_id) {
                        targets.insert(group_id, range.current_target);
                    }
                }
            }
        }
        targets
    }

    fn refresh_instance_cache(
        &self,
        groups: &[Arc<dyn NodeGroup>],
        cache: &mut HashMap<String, Vec<Instance>>,
    ) {
        let live: HashSet<String> = groups.iter().map(|group| group.id()).collect();
        cache.retain(|group_id, _| live.contains(group_id));

        for group in groups {
            let group_id = group.id();
            if cache.contains_key(&group_id) {
                continue;
            }
            match group.instances() {
                Ok(instances) => {
                    cache.insert(group_id, instances);
                }
                Err(ProviderError::NotImplemented) => {
                    debug!(group = %group_id, "instance listing not implemented");
                }
                Err(err) => {
                    warn!(group = %group_id, error = %err, "failed to list node group instances");
                    self.recorder.warning(
                        "CloudProviderError",
                        &format!("failed to list instances of node group {group_id}: {err}"),
                    );
                }
            }
        }
    }

    fn has_cloud_instance(
        &self,
        state: &RegistryState,
        node: &Node,
        used_taint_fallback: &mut bool,
    ) -> bool {
        let Some(group) = self.provider.node_group_for_node(node) else {
            // Not autoscaled; never ours to declare deleted.
            return true;
        };
        if let Some(instances) = state.instance_cache.get(&group.id()) {
            let Some(id) = provider_id(node) else {
                return true;
            };
            return instances.iter().any(|instance| instance.id == id);
        }
        match self.provider.has_instance(node) {
            Ok(exists) => exists,
            Err(ProviderError::NotImplemented) => {
                *used_taint_fallback = true;
                !has_to_be_deleted_taint(node)
            }
            Err(err) => {
                warn!(node = %node_name(node), error = %err, "failed to check cloud instance");
                true
            }
        }
    }

    fn update_deleted_nodes(&self, state: &mut RegistryState, now: DateTime<Utc>) {
        let mut deleted = HashMap::new();
        let mut used_taint_fallback = false;
        {
            let snapshot: &RegistryState = state;
            for node in &snapshot.nodes {
                let name = node_name(node);
                if name.is_empty() {
                    continue;
                }
                if !self.has_cloud_instance(snapshot, node, &mut used_taint_fallback) {
                    if !snapshot.deleted_nodes.contains_key(name) {
                        info!(node = %name, "node removed on the cloud provider side but still registered");
                    }
                    let first_seen = snapshot.deleted_nodes.get(name).copied().unwrap_or(now);
                    deleted.insert(name.to_string(), first_seen);
                }
            }
        }
        if used_taint_fallback {
            warn!("cloud provider exposes no instance information; node deletion detection degraded to drain-taint inference");
            self.recorder.warning(
                "DegradedDeletionDetection",
                "cloud provider exposes no instance information; inferring node removal from drain taints",
            );
        }
        state.deleted_nodes = deleted;
    }

    fn update_unregistered_nodes(&self, state: &mut RegistryState, now: DateTime<Utc>) {
        let registered: HashSet<&str> = state.nodes.iter().filter_map(provider_id).collect();
        let mut unregistered = HashMap::new();
        for (group_id, instances) in &state.instance_cache {
            for instance in instances {
                if registered.contains(instance.id.as_str()) {
                    continue;
                }
                let entry = state
                    .unregistered_nodes
                    .get(&instance.id)
                    .cloned()
                    .unwrap_or_else(|| UnregisteredNode {
                        instance_id: instance.id.clone(),
                        group_id: group_id.clone(),
                        unregistered_since: now,
                    });
                unregistered.insert(instance.id.clone(), entry);
            }
        }
        state.unregistered_nodes = unregistered;
    }

    fn classify_node(
        &self,
        deleted_nodes: &HashMap<String, DateTime<Utc>>,
        node: &Node,
        now: DateTime<Utc>,
    ) -> NodeBucket {
        if deleted_nodes.contains_key(node_name(node)) {
            return NodeBucket::Deleted;
        }
        if is_node_ready(node) {
            return NodeBucket::Ready;
        }
        // Unready is excused only while the kubelet's startup taint is
        // still on and the node is young; everything else is a real outage.
        if has_not_ready_taint(node)
            && creation_time(node) + self.config.max_node_startup_time > now
        {
            return NodeBucket::NotStarted;
        }
        NodeBucket::Unready
    }

    fn update_readiness(&self, state: &mut RegistryState, now: DateTime<Utc>) {
        let mut total = Readiness::at(now);
        let mut per_group: HashMap<String, Readiness> = HashMap::new();

        {
            let snapshot: &RegistryState = state;
            for node in &snapshot.nodes {
                let name = node_name(node).to_string();
                let group = self.provider.node_group_for_node(node);
                let bucket = self.classify_node(&snapshot.deleted_nodes, node, now);

                let mut apply = |readiness: &mut Readiness| {
                    readiness.registered.push(name.clone());
                    match bucket {
                        NodeBucket::Ready => readiness.ready.push(name.clone()),
                        NodeBucket::Unready => readiness.unready.push(name.clone()),
                        NodeBucket::NotStarted => readiness.not_started.push(name.clone()),
                        NodeBucket::Deleted => readiness.deleted.push(name.clone()),
                    }
                };
                apply(&mut total);
                if let Some(group) = group {
                    apply(per_group.entry(group.id()).or_insert_with(|| Readiness::at(now)));
                }
            }

            for unregistered in snapshot.unregistered_nodes.values() {
                let long = unregistered.unregistered_since + self.config.max_node_provision_time
                    < now;
                let per_group_entry = per_group
                    .entry(unregistered.group_id.clone())
                    .or_insert_with(|| Readiness::at(now));
                if long {
                    total
                        .long_unregistered
                        .push(unregistered.instance_id.clone());
                    per_group_entry
                        .long_unregistered
                        .push(unregistered.instance_id.clone());
                } else {
                    total.unregistered.push(unregistered.instance_id.clone());
                    per_group_entry
                        .unregistered
                        .push(unregistered.instance_id.clone());
                }
            }
        }

        state.total_readiness = total;
        state.per_group_readiness = per_group;
    }

    fn update_acceptable_ranges(&self, state: &mut RegistryState, targets: &HashMap<String, usize>) {
        let mut ranges = HashMap::new();
        for (group_id, &target) in targets {
            let long_unregistered = state
                .per_group_readiness
                .get(group_id)
                .map_or(0, |readiness| readiness.long_unregistered.len());
            ranges.insert(
                group_id.clone(),
                AcceptableRange {
                    min_nodes: target as i64 - long_unregistered as i64,
                    max_nodes: target as i64,
                    current_target: target,
                },
            );
        }
        for (group_id, request) in &state.scale_up_requests {
            if let Some(range) = ranges.get_mut(group_id) {
                range.min_nodes -= request.increase as i64;
            }
        }
        for request in &state.scale_down_requests {
            if let Some(range) = ranges.get_mut(&request.group_id) {
                range.max_nodes += 1;
            }
        }
        state.acceptable_ranges = ranges;
    }

    fn has_upcoming_nodes(state: &RegistryState, group_id: &str) -> bool {
        let Some(range) = state.acceptable_ranges.get(group_id) else {
            return false;
        };
        let counted = state.per_group_readiness.get(group_id).map_or(0, |readiness| {
            readiness.ready.len() + readiness.unready.len() + readiness.long_unregistered.len()
        });
        range.current_target as i64 > counted as i64
    }

    fn note_failed_scale_up(
        state: &mut RegistryState,
        group_id: &str,
        reason: FailedScaleUpReason,
        now: DateTime<Utc>,
    ) {
        state
            .scale_up_failures
            .entry(group_id.to_string())
            .or_default()
            .push(ScaleUpFailure {
                group_id: group_id.to_string(),
                reason,
                time: now,
            });
        state.backoff.backoff(group_id, now);

        #[cfg(feature = "metrics")]
        crate::metrics::inc_failed_scale_up(&reason.to_string());
    }

    fn update_scale_requests(&self, state: &mut RegistryState, now: DateTime<Utc>) {
        state.backoff.remove_stale(now);

        let mut finished = Vec::new();
        let mut timed_out = Vec::new();
        for (group_id, request) in &state.scale_up_requests {
            if !Self::has_upcoming_nodes(state, group_id) {
                finished.push(group_id.clone());
            } else if request.expected_add_time <= now {
                timed_out.push(group_id.clone());
            }
        }

        for group_id in finished {
            if let Some(request) = state.scale_up_requests.remove(&group_id) {
                info!(
                    group = %group_id,
                    elapsed = %(now - request.time),
                    "scale-up finished"
                );
                state.backoff.remove(&group_id);
            }
        }

        for group_id in timed_out {
            if let Some(request) = state.scale_up_requests.remove(&group_id) {
                warn!(
                    group = %group_id,
                    elapsed = %(now - request.time),
                    "scale-up timed out"
                );
                self.recorder.warning(
                    "ScaleUpTimedOut",
                    &format!(
                        "nodes added to group {group_id} failed to register within {}",
                        now - request.time
                    ),
                );
                Self::note_failed_scale_up(state, &group_id, FailedScaleUpReason::Timeout, now);
            }
        }

        state
            .scale_down_requests
            .retain(|request| request.expected_delete_time > now);
    }

    fn update_incorrect_sizes(&self, state: &mut RegistryState, now: DateTime<Utc>) {
        let mut incorrect_sizes = HashMap::new();
        for (group_id, range) in &state.acceptable_ranges {
            let Some(readiness) = state.per_group_readiness.get(group_id) else {
                // Scaled to zero or nothing registered yet; nothing to compare.
                continue;
            };
            let registered = readiness.registered.len() as i64;
            if registered >= range.min_nodes && registered <= range.max_nodes {
                continue;
            }
            let mut incorrect = IncorrectNodeGroupSize {
                expected_size: range.current_target,
                current_size: readiness.registered.len(),
                first_observed: now,
            };
            if let Some(existing) = state.incorrect_sizes.get(group_id) {
                if existing.expected_size == incorrect.expected_size
                    && existing.current_size == incorrect.current_size
                {
                    incorrect = existing.clone();
                }
            }
            incorrect_sizes.insert(group_id.clone(), incorrect);
        }
        state.incorrect_sizes = incorrect_sizes;
    }

    // ── health evaluation ──────────────────────────────────────────────────

    fn cluster_healthy(&self, state: &RegistryState) -> bool {
        let unready = state.total_readiness.unready.len();
        unready <= self.config.ok_total_unready_count
            || (unready as f64)
                <= self.config.max_total_unready_percentage / 100.0 * state.nodes.len() as f64
    }

    fn node_group_healthy(&self, state: &RegistryState, group_id: &str) -> bool {
        let Some(range) = state.acceptable_ranges.get(group_id) else {
            warn!(group = %group_id, "no acceptable range for node group");
            return false;
        };
        let Some(readiness) = state.per_group_readiness.get(group_id) else {
            // No nodes at all: fine for an empty target, or while a
            // scale-up from zero still covers the whole target.
            return range.current_target == 0
                || (range.min_nodes <= 0 && state.scale_up_requests.contains_key(group_id));
        };

        let shortfall = (range.min_nodes - readiness.ready.len() as i64).max(0);
        let counted = (readiness.ready.len()
            + readiness.unready.len()
            + readiness.not_started.len()) as f64;
        !(shortfall > self.config.ok_total_unready_count as i64
            && shortfall as f64 > self.config.max_total_unready_percentage / 100.0 * counted)
    }

    fn node_group_scaling_up(state: &RegistryState, group_id: &str) -> bool {
        Self::has_upcoming_nodes(state, group_id)
            && state.scale_up_requests.contains_key(group_id)
    }

    // ── status assembly ────────────────────────────────────────────────────

    fn build_group_health_condition(
        &self,
        state: &RegistryState,
        group: &dyn NodeGroup,
        now: DateTime<Utc>,
    ) -> Condition {
        let group_id = group.id();
        let empty = Readiness::default();
        let readiness = state.per_group_readiness.get(&group_id).unwrap_or(&empty);
        let target = state
            .acceptable_ranges
            .get(&group_id)
            .map_or(0, |range| range.current_target);
        let healthy = self.node_group_healthy(state, &group_id);
        Condition {
            condition_type: ConditionType::Health,
            status: if healthy {
                ConditionStatus::Healthy
            } else {
                ConditionStatus::Unhealthy
            },
            message: format!(
                "ready={} unready={} notStarted={} registered={} longUnregistered={} cloudProviderTarget={} (minSize={}, maxSize={})",
                readiness.ready.len(),
                readiness.unready.len(),
                readiness.not_started.len(),
                readiness.registered.len(),
                readiness.long_unregistered.len(),
                target,
                group.min_size(),
                group.max_size(),
            ),
            last_probe_time: now,
            last_transition_time: now,
        }
    }

    fn build_group_scale_up_condition(
        &self,
        state: &RegistryState,
        group_id: &str,
        now: DateTime<Utc>,
    ) -> Condition {
        let empty = Readiness::default();
        let readiness = state.per_group_readiness.get(group_id).unwrap_or(&empty);
        let target = state
            .acceptable_ranges
            .get(group_id)
            .map_or(0, |range| range.current_target);
        Condition {
            condition_type: ConditionType::ScaleUp,
            status: if Self::node_group_scaling_up(state, group_id) {
                ConditionStatus::InProgress
            } else {
                ConditionStatus::NoActivity
            },
            message: format!(
                "ready={} cloudProviderTarget={}",
                readiness.ready.len(),
                target
            ),
            last_probe_time: now,
            last_transition_time: now,
        }
    }

    fn build_scale_down_condition(candidate_count: usize, probed: DateTime<Utc>) -> Condition {
        Condition {
            condition_type: ConditionType::ScaleDown,
            status: if candidate_count > 0 {
                ConditionStatus::CandidatesPresent
            } else {
                ConditionStatus::NoCandidates
            },
            message: format!("candidates={candidate_count}"),
            last_probe_time: probed,
            last_transition_time: probed,
        }
    }

    fn build_cluster_health_condition(
        &self,
        state: &RegistryState,
        now: DateTime<Utc>,
    ) -> Condition {
        let readiness = &state.total_readiness;
        Condition {
            condition_type: ConditionType::Health,
            status: if self.cluster_healthy(state) {
                ConditionStatus::Healthy
            } else {
                ConditionStatus::Unhealthy
            },
            message: format!(
                "ready={} unready={} notStarted={} registered={} longUnregistered={}",
                readiness.ready.len(),
                readiness.unready.len(),
                readiness.not_started.len(),
                readiness.registered.len(),
                readiness.long_unregistered.len(),
            ),
            last_probe_time: now,
            last_transition_time: now,
        }
    }

    fn build_cluster_scale_up_condition(
        state: &RegistryState,
        group_statuses: &[NodeGroupStatus],
        now: DateTime<Utc>,
    ) -> Condition {
        let in_progress = group_statuses.iter().any(|group_status| {
            group_status.conditions.iter().any(|condition| {
                condition.condition_type == ConditionType::ScaleUp
                    && condition.status == ConditionStatus::InProgress
            })
        });
        let readiness = &state.total_readiness;
        Condition {
            condition_type: ConditionType::ScaleUp,
            status: if in_progress {
                ConditionStatus::InProgress
            } else {
                ConditionStatus::NoActivity
            },
            message: format!(
                "ready={} registered={}",
                readiness.ready.len(),
                readiness.registered.len()
            ),
            last_probe_time: now,
            last_transition_time: now,
        }
    }

    // ── test support ───────────────────────────────────────────────────────

    #[cfg(test)]
    pub(crate) fn scale_up_request(&self, group_id: &str) -> Option<ScaleUpRequest> {
        self.read_state().scale_up_requests.get(group_id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn scale_down_request_count(&self) -> usize {
        self.read_state().scale_down_requests.len()
    }
}
