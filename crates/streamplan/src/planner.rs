//! The planner proper: value locations, use counts, single-stream greedy
//! reuse, the multi-stream reuse optimizer, execution-plan construction, and
//! the deallocation schedule.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::mem;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::context::{ParallelPlannerContext, PlannerContext};
use crate::graph::{
    GraphError, GraphViewer, Node, NodeIndex, ValueDef, ValueIndex, ValueIndexMap,
};
use crate::kernel::{nested_subgraph_key, KernelDef, KernelInfoMap, SubgraphKernelInfoMaps};
use crate::partition::{create_partitioner, PartitionError};
use crate::plan::{
    AllocKind, ExecutionStep, LogicStream, NotificationIndex, ReleaseAction,
    SequentialExecutionPlan, StreamIndex,
};
use crate::provider::{ExecutionProviders, MemType, MemoryInfo, StreamHandleRegistry};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no kernel registered for node {node_index} ({op_type})")]
    MissingKernelInfo { node_index: NodeIndex, op_type: String },
    #[error("no kernel map registered for nested subgraph key {key:?}")]
    MissingSubgraphKernelInfo { key: String },
    #[error("unknown execution provider {provider} for node {node_index}")]
    UnknownProvider {
        provider: String,
        node_index: NodeIndex,
    },
    #[error("bad partition configuration: {0}")]
    BadPartitionConfig(#[from] PartitionError),
    #[error("implicit input {name} has no location in the outer scope map")]
    MissingOuterScopeLocation { name: String },
    #[error("index {index} out of range ({len} entries)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("value {name} is not registered in the value index map")]
    UnknownValue { name: String },
    #[error("external output {name} is not a tensor")]
    NonTensorExternalOutput { name: String },
    #[error("strided tensor reuse is not supported in this build (node {node_index})")]
    UnsupportedStridedTensor { node_index: NodeIndex },
    #[error("stream {stream} mixes execution providers ({expected} and {actual})")]
    MismatchedStreamProvider {
        stream: StreamIndex,
        expected: String,
        actual: String,
    },
    #[error("node {node_index} requires contiguous inputs that mix initializers and activations")]
    #[cfg(feature = "training")]
    ContiguousInputsMixed { node_index: NodeIndex },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Everything `create_plan` needs from the session.
pub struct PlanRequest<'a> {
    /// Node in the outer graph owning this subgraph; `None` at top level.
    pub parent_node: Option<&'a Node>,
    pub graph: &'a GraphViewer<'a>,
    /// Values visible from the enclosing scope.
    pub outer_scope_args: &'a [ValueDef],
    pub providers: &'a ExecutionProviders,
    pub kernel_info_map: &'a KernelInfoMap,
    pub subgraph_kernel_info_maps: &'a SubgraphKernelInfoMaps,
    /// Location per outer-scope value name, filled in by the session while
    /// planning the enclosing graph.
    pub outer_scope_locations: &'a HashMap<String, MemoryInfo>,
    pub value_map: &'a ValueIndexMap,
    pub context: &'a dyn PlannerContext,
    pub stream_handles: &'a StreamHandleRegistry,
    pub partition_config_file: Option<&'a Path>,
}

/// Builds the execution, allocation, and deallocation plans for one graph.
pub fn create_plan(request: &PlanRequest<'_>) -> Result<SequentialExecutionPlan, PlanError> {
    PlannerImpl::new(request).run()
}

/// Auxiliary per-value state used only during plan generation.
#[derive(Debug, Clone)]
struct ValueInfo<'a> {
    def_site: Option<&'a ValueDef>,
    use_count: usize,
    /// Root buffer this value maps onto; initially the value itself.
    reused_buffer: ValueIndex,
}

#[derive(Debug, Clone, Copy)]
struct FreeBufferInfo {
    value: ValueIndex,
    /// Step in the execution plan after which the buffer is dead.
    deallocate_point: usize,
}

struct PlannerImpl<'a> {
    req: &'a PlanRequest<'a>,
    plan: SequentialExecutionPlan,
    num_logic_streams: usize,
    stream_nodes: Vec<Vec<NodeIndex>>,
    node_stream_map: Vec<StreamIndex>,
    /// Combined dependencies: `dependence_graph[downstream]` holds both the
    /// model-edge producers of `downstream` and its predecessor on the same
    /// logic stream.
    dependence_graph: BTreeMap<NodeIndex, BTreeSet<NodeIndex>>,
    value_consumer_map: HashMap<ValueIndex, BTreeSet<NodeIndex>>,
    value_node_map: HashMap<ValueIndex, NodeIndex>,
    value_info: Vec<ValueInfo<'a>>,
    /// Recently released roots, most recent first.
    freelist: VecDeque<FreeBufferInfo>,
}

impl<'a> PlannerImpl<'a> {
    fn new(req: &'a PlanRequest<'a>) -> Self {
        Self {
            req,
            plan: SequentialExecutionPlan::default(),
            num_logic_streams: 0,
            stream_nodes: Vec::new(),
            node_stream_map: Vec::new(),
            dependence_graph: BTreeMap::new(),
            value_consumer_map: HashMap::new(),
            value_node_map: HashMap::new(),
            value_info: Vec::new(),
            freelist: VecDeque::new(),
        }
    }

    fn run(mut self) -> Result<SequentialExecutionPlan, PlanError> {
        self.partition_into_streams()?;
        self.initialize();
        self.compute_value_location()?;
        self.compute_plan_for_inputs_and_weights()?;
        self.build_execution_plan()?;
        self.compute_reuse_plan()?;
        #[cfg(feature = "training")]
        self.compute_allocation_order()?;
        self.generate_deallocation_plan()?;
        Ok(mem::take(&mut self.plan))
    }

    // ---- lookups ------------------------------------------------------

    fn index(&self, name: &str) -> Result<ValueIndex, PlanError> {
        self.req
            .value_map
            .index_of(name)
            .ok_or_else(|| PlanError::UnknownValue {
                name: name.to_string(),
            })
    }

    fn node(&self, node_index: NodeIndex) -> Result<&'a Node, PlanError> {
        self.req
            .graph
            .node(node_index)
            .ok_or(PlanError::IndexOutOfRange {
                index: node_index,
                len: self.req.graph.max_node_index(),
            })
    }

    fn kernel_info(&self, node_index: NodeIndex) -> Result<&'a KernelDef, PlanError> {
        self.req
            .kernel_info_map
            .get(&node_index)
            .ok_or_else(|| PlanError::MissingKernelInfo {
                node_index,
                op_type: self
                    .req
                    .graph
                    .node(node_index)
                    .map(|n| n.op_type.clone())
                    .unwrap_or_default(),
            })
    }

    /// Resolves a value definition from the current graph or the outer scope.
    fn def_of(&self, name: &str) -> Option<&'a ValueDef> {
        self.req
            .graph
            .value_def(name)
            .or_else(|| self.req.outer_scope_args.iter().find(|a| a.name == name))
    }

    fn value_info(&self, value: ValueIndex) -> Result<&ValueInfo<'a>, PlanError> {
        let len = self.value_info.len();
        self.value_info
            .get(value)
            .ok_or(PlanError::IndexOutOfRange { index: value, len })
    }

    fn buffer(&self, value: ValueIndex) -> Result<ValueIndex, PlanError> {
        Ok(self.value_info(value)?.reused_buffer)
    }

    fn use_count(&self, value: ValueIndex) -> Result<usize, PlanError> {
        Ok(self.value_info(value)?.use_count)
    }

    fn bump_use_count(&mut self, value: ValueIndex, amount: usize) -> Result<(), PlanError> {
        let len = self.value_info.len();
        let info = self
            .value_info
            .get_mut(value)
            .ok_or(PlanError::IndexOutOfRange { index: value, len })?;
        info.use_count += amount;
        Ok(())
    }

    fn alloc_plan(&self, value: ValueIndex) -> Result<&crate::plan::AllocPlanPerValue, PlanError> {
        let len = self.plan.allocation_plan.len();
        self.plan
            .allocation_plan
            .get(value)
            .ok_or(PlanError::IndexOutOfRange { index: value, len })
    }

    fn alloc_plan_mut(
        &mut self,
        value: ValueIndex,
    ) -> Result<&mut crate::plan::AllocPlanPerValue, PlanError> {
        let len = self.plan.allocation_plan.len();
        self.plan
            .allocation_plan
            .get_mut(value)
            .ok_or(PlanError::IndexOutOfRange { index: value, len })
    }

    /// Records that `value` is defined by `def_site`: zero uses so far and a
    /// self-owned buffer.
    fn process_def(&mut self, value: ValueIndex, def_site: &'a ValueDef) -> Result<(), PlanError> {
        let len = self.value_info.len();
        let info = self
            .value_info
            .get_mut(value)
            .ok_or(PlanError::IndexOutOfRange { index: value, len })?;
        info.use_count = 0;
        info.reused_buffer = value;
        info.def_site = Some(def_site);
        self.alloc_plan_mut(value)?.value_type = Some(def_site.value_type.clone());
        Ok(())
    }

    /// Routes `reused_for` onto the root buffer behind `reused`, merging its
    /// remaining uses into the root's count.
    fn reuse(
        &mut self,
        reused: ValueIndex,
        reused_for: ValueIndex,
        alloc_kind: AllocKind,
    ) -> Result<(), PlanError> {
        debug_assert_ne!(reused, reused_for);
        let original = self.buffer(reused)?;
        let merged = self.use_count(reused_for)?;
        {
            let len = self.value_info.len();
            let info = self
                .value_info
                .get_mut(reused_for)
                .ok_or(PlanError::IndexOutOfRange {
                    index: reused_for,
                    len,
                })?;
            info.reused_buffer = original;
        }
        self.bump_use_count(original, merged)?;
        let entry = self.alloc_plan_mut(reused_for)?;
        entry.alloc_kind = alloc_kind;
        entry.reused_buffer = Some(original);
        Ok(())
    }

    // ---- partitioning -------------------------------------------------

    fn partition_into_streams(&mut self) -> Result<(), PlanError> {
        let mut partitioner = create_partitioner(self.req.partition_config_file)?;
        self.stream_nodes = partitioner.partition(self.req.graph)?;
        self.num_logic_streams = self.stream_nodes.len();
        self.node_stream_map = vec![usize::MAX; self.req.graph.max_node_index()];
        for (stream, nodes) in self.stream_nodes.iter().enumerate() {
            for &node_index in nodes {
                self.node_stream_map[node_index] = stream;
            }
        }
        Ok(())
    }

    fn initialize(&mut self) {
        let num_values = self.req.value_map.len();
        self.value_info = (0..num_values)
            .map(|value| ValueInfo {
                def_site: None,
                use_count: 0,
                reused_buffer: value,
            })
            .collect();
        self.plan.allocation_plan = vec![Default::default(); num_values];
        self.plan.execution_plan.reserve(self.num_logic_streams);
    }

    // ---- value locations ----------------------------------------------

    fn compute_value_location(&mut self) -> Result<(), PlanError> {
        let graph = self.req.graph.graph();

        for name in graph.inputs().to_vec() {
            let index = self.index(&name)?;
            let def = self.def_of(&name).ok_or(PlanError::UnknownValue { name })?;
            self.process_def(index, def)?;
        }
        for arg in self.req.outer_scope_args {
            let index = self.index(&arg.name)?;
            self.process_def(index, arg)?;
        }
        for name in graph.initializers().to_vec() {
            let index = self.index(&name)?;
            let def = self.def_of(&name).ok_or(PlanError::UnknownValue { name })?;
            self.process_def(index, def)?;
        }

        let graph_inputs: HashSet<&str> = graph.inputs_including_initializers().collect();
        let is_subgraph = self.req.parent_node.is_some();
        let mut has_explicit_consumer: HashSet<ValueIndex> = HashSet::new();
        let mut implicit_consumer_provider: HashMap<ValueIndex, String> = HashMap::new();
        let mut implicit_heterogeneous: HashSet<ValueIndex> = HashSet::new();

        let stream_nodes = self.stream_nodes.clone();
        for nodes in &stream_nodes {
            for &node_index in nodes {
                let node = self.node(node_index)?;
                let kernel = self.kernel_info(node_index)?;
                let provider = self.req.providers.get(&node.provider).ok_or_else(|| {
                    PlanError::UnknownProvider {
                        provider: node.provider.clone(),
                        node_index,
                    }
                })?;

                for (arg_index, name) in node.inputs.iter().enumerate() {
                    let Some(name) = name.as_deref() else { continue };
                    let is_graph_input = graph_inputs.contains(name);
                    let is_outer_scope_arg =
                        self.req.outer_scope_args.iter().any(|a| a.name == name);
                    if !is_graph_input && !is_outer_scope_arg {
                        continue;
                    }
                    let index = self.index(name)?;
                    let location = provider.memory_info(kernel.input_mem_type(arg_index));
                    self.plan.set_location(index, location);
                    has_explicit_consumer.insert(index);
                }

                for name in &node.implicit_inputs {
                    let is_graph_input = graph_inputs.contains(name.as_str());
                    let is_outer_scope_arg =
                        self.req.outer_scope_args.iter().any(|a| &a.name == name);
                    if !is_graph_input && !is_outer_scope_arg {
                        continue;
                    }
                    let index = self.index(name)?;
                    if has_explicit_consumer.contains(&index) {
                        // An explicit consumer already fixed the location.
                        continue;
                    }
                    if is_subgraph {
                        // Pass-through subgraph input: keep the outer-scope
                        // location so no copy is triggered at this level.
                        match self.req.outer_scope_locations.get(name) {
                            Some(location) => {
                                self.plan.set_location(index, location.clone());
                            }
                            None if !is_graph_input => {
                                return Err(PlanError::MissingOuterScopeLocation {
                                    name: name.clone(),
                                });
                            }
                            None => {}
                        }
                    } else if !implicit_heterogeneous.contains(&index) {
                        // Top level: place the value on the single consuming
                        // provider's device, falling back to CPU once the
                        // consumers disagree.
                        let seen = implicit_consumer_provider.get(&index).cloned();
                        match seen {
                            None => {
                                let location = provider.memory_info(MemType::Default);
                                self.plan.set_location(index, location);
                                implicit_consumer_provider
                                    .insert(index, node.provider.clone());
                            }
                            Some(seen) if seen == node.provider => {
                                let location = provider.memory_info(MemType::Default);
                                self.plan.set_location(index, location);
                            }
                            Some(_) => {
                                let location = self.req.providers.default_cpu_memory_info();
                                self.plan.set_location(index, location);
                                implicit_heterogeneous.insert(index);
                            }
                        }
                    }
                }

                for (output_index, name) in node.outputs.iter().enumerate() {
                    let Some(name) = name.as_deref() else { continue };
                    let index = self.index(name)?;
                    let def = self
                        .def_of(name)
                        .ok_or_else(|| PlanError::UnknownValue {
                            name: name.to_string(),
                        })?;
                    self.process_def(index, def)?;
                    let location = provider.memory_info(kernel.output_mem_type(output_index));
                    self.plan.set_location(index, location);
                }
            }
        }
        Ok(())
    }

    fn compute_plan_for_inputs_and_weights(&mut self) -> Result<(), PlanError> {
        let graph = self.req.graph.graph();
        for name in graph.inputs().to_vec() {
            let index = self.index(&name)?;
            self.alloc_plan_mut(index)?.alloc_kind = AllocKind::PreExisting;
        }
        for arg in self.req.outer_scope_args {
            let index = self.index(&arg.name)?;
            self.alloc_plan_mut(index)?.alloc_kind = AllocKind::PreExisting;
        }
        self.generate_plan_for_weights()
    }

    /// An initializer is placed where it is first used in a top-down walk of
    /// the graph and all nested subgraphs; uses on other devices are handled
    /// by an upstream copy pass.
    fn generate_plan_for_weights(&mut self) -> Result<(), PlanError> {
        let graph = self.req.graph.graph();
        let weights: HashSet<&str> = graph.initializers().iter().map(String::as_str).collect();
        let mut locations: Vec<Vec<MemoryInfo>> = vec![Vec::new(); self.req.value_map.len()];
        self.weight_locations_in_graph(
            graph,
            None,
            &weights,
            self.req.kernel_info_map,
            "",
            0,
            &mut locations,
        )?;
        for (index, found) in locations.iter().enumerate() {
            let Some(first) = found.first() else { continue };
            let entry = self.alloc_plan_mut(index)?;
            entry.alloc_kind = AllocKind::AllocateStatically;
            entry.location = Some(first.clone());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn weight_locations_in_graph(
        &self,
        graph: &crate::graph::Graph,
        parent_node: Option<&Node>,
        weights: &HashSet<&str>,
        kernel_info_map: &KernelInfoMap,
        key_base: &str,
        graph_depth: usize,
        locations: &mut Vec<Vec<MemoryInfo>>,
    ) -> Result<(), PlanError> {
        for (node_index, node) in graph.nodes().iter().enumerate() {
            for (input_index, name) in node.inputs.iter().enumerate() {
                let Some(name) = name.as_deref() else { continue };
                if !weights.contains(name) {
                    continue;
                }
                // A weight name not captured by the parent's implicit inputs
                // is shadowed inside this subgraph.
                if graph_depth > 0 {
                    let captured = parent_node
                        .map(|p| p.implicit_inputs.iter().any(|i| i == name))
                        .unwrap_or(false);
                    if !captured {
                        continue;
                    }
                }
                let weight_index = self.index(name)?;
                let location =
                    self.location_for_node_input(input_index, node_index, node, kernel_info_map)?;
                locations[weight_index].push(location);
            }
        }
        for (node_index, node) in graph.nodes().iter().enumerate() {
            for (attr_name, subgraph) in &node.subgraphs {
                let key = nested_subgraph_key(key_base, graph_depth, node_index, attr_name);
                let subgraph_kernels = self
                    .req
                    .subgraph_kernel_info_maps
                    .get(&key)
                    .ok_or_else(|| PlanError::MissingSubgraphKernelInfo { key: key.clone() })?;
                self.weight_locations_in_graph(
                    subgraph,
                    Some(node),
                    weights,
                    subgraph_kernels,
                    &key,
                    graph_depth + 1,
                    locations,
                )?;
            }
        }
        Ok(())
    }

    fn location_for_node_input(
        &self,
        input_index: usize,
        node_index: NodeIndex,
        node: &Node,
        kernel_info_map: &KernelInfoMap,
    ) -> Result<MemoryInfo, PlanError> {
        let provider = self.req.providers.get(&node.provider).ok_or_else(|| {
            PlanError::UnknownProvider {
                provider: node.provider.clone(),
                node_index,
            }
        })?;
        let kernel =
            kernel_info_map
                .get(&node_index)
                .ok_or_else(|| PlanError::MissingKernelInfo {
                    node_index,
                    op_type: node.op_type.clone(),
                })?;
        if kernel.input_mem_type(input_index) == MemType::CpuInput {
            // Weights consumed on the host stay on the host allocator.
            Ok(self.req.providers.default_cpu_memory_info())
        } else {
            Ok(provider.memory_info(MemType::Default))
        }
    }

    // ---- execution plan -----------------------------------------------

    fn build_execution_plan(&mut self) -> Result<(), PlanError> {
        for _ in 0..self.num_logic_streams {
            self.plan.execution_plan.push(LogicStream::default());
        }

        // A node whose output crosses streams owns one notification.
        let mut num_notifications = 0usize;
        let mut node_to_notification: HashMap<NodeIndex, NotificationIndex> = HashMap::new();
        for (stream, nodes) in self.stream_nodes.iter().enumerate() {
            for &node_index in nodes {
                let crosses = self
                    .req
                    .graph
                    .consumers_of_node(node_index)
                    .iter()
                    .any(|&consumer| self.node_stream_map[consumer] != stream);
                if crosses {
                    node_to_notification.insert(node_index, num_notifications);
                    num_notifications += 1;
                }
            }
        }

        for (stream, nodes) in self.stream_nodes.iter().enumerate() {
            for &node_index in nodes {
                let node = self.req.graph.node(node_index).ok_or(
                    PlanError::IndexOutOfRange {
                        index: node_index,
                        len: self.req.graph.max_node_index(),
                    },
                )?;
                let entry = &mut self.plan.execution_plan[stream];
                if entry.provider.is_empty() {
                    entry.provider = node.provider.clone();
                } else if entry.provider != node.provider {
                    return Err(PlanError::MismatchedStreamProvider {
                        stream,
                        expected: entry.provider.clone(),
                        actual: node.provider.clone(),
                    });
                }
            }
        }
        let stream_providers: Vec<String> = self
            .plan
            .execution_plan
            .iter()
            .map(|s| s.provider.clone())
            .collect();

        self.plan.notification_owners = vec![0; num_notifications];
        for &node_index in self
            .req
            .graph
            .nodes_in_topological_order(self.req.context.execution_order())
        {
            if let Some(&notification) = node_to_notification.get(&node_index) {
                self.plan.notification_owners[notification] = self.node_stream_map[node_index];
            }
        }

        let stream_nodes = self.stream_nodes.clone();
        for (stream, nodes) in stream_nodes.iter().enumerate() {
            for (position, &node_index) in nodes.iter().enumerate() {
                if position > 0 {
                    self.dependence_graph
                        .entry(node_index)
                        .or_default()
                        .insert(nodes[position - 1]);
                }
                let node = self.node(node_index)?;
                for &producer in self.req.graph.producers_of_node(node_index) {
                    if self.node_stream_map[producer] == stream {
                        continue;
                    }
                    let notification = *node_to_notification.get(&producer).ok_or(
                        PlanError::IndexOutOfRange {
                            index: producer,
                            len: num_notifications,
                        },
                    )?;
                    let barrier_id = self.plan.num_barriers;
                    self.plan.num_barriers += 1;
                    let offset = self.plan.execution_plan[stream].steps.len();
                    self.plan
                        .downstream_map
                        .entry(notification)
                        .or_default()
                        .push((stream, offset));
                    self.plan.execution_plan[stream]
                        .steps
                        .push(ExecutionStep::Barrier { barrier_id });
                    let producer_stream = self.plan.notification_owners[notification];
                    if let Some(wait_fn) = self
                        .req
                        .stream_handles
                        .wait_handle(&stream_providers[producer_stream], &node.provider)
                    {
                        self.plan.execution_plan[stream]
                            .steps
                            .push(ExecutionStep::WaitOnEp {
                                notification,
                                wait_fn,
                            });
                    }
                }
                for &consumer in self.req.graph.consumers_of_node(node_index) {
                    self.dependence_graph
                        .entry(consumer)
                        .or_default()
                        .insert(node_index);
                }
                self.plan.execution_plan[stream]
                    .steps
                    .push(ExecutionStep::LaunchKernel { node_index });
                if let Some(&notification) = node_to_notification.get(&node_index) {
                    self.plan.execution_plan[stream]
                        .steps
                        .push(ExecutionStep::ActivateNotification { notification });
                    self.plan.execution_plan[stream]
                        .steps
                        .push(ExecutionStep::TriggerDownstream { notification });
                }
            }
        }

        for &node_index in self
            .req
            .graph
            .nodes_in_topological_order(self.req.context.execution_order())
        {
            let node = self.node(node_index)?;
            for name in node.existing_outputs() {
                let index = self.index(name)?;
                self.plan
                    .value_to_stream_map
                    .insert(index, self.node_stream_map[node_index]);
                self.value_node_map.insert(index, node_index);
            }
        }
        Ok(())
    }

    // ---- reuse --------------------------------------------------------

    /// True when every non-empty stream runs on a distinct provider, which
    /// makes the plan equivalent to sequential per-provider execution.
    fn is_single_stream(&self) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        for (stream, nodes) in self.stream_nodes.iter().enumerate() {
            if nodes.is_empty() {
                continue;
            }
            if !seen.insert(self.plan.execution_plan[stream].provider.as_str()) {
                return false;
            }
        }
        true
    }

    fn compute_reuse_plan(&mut self) -> Result<(), PlanError> {
        self.compute_use_counts()?;
        if self.is_single_stream() {
            return self.compute_single_stream_reuse_plan(self.req.context);
        }
        // Multi-stream: run the sequential pass with reuse suppressed so
        // every non-aliased output starts as a fresh allocation, then let
        // the stream-aware optimizer rebuild reuse on top.
        let parallel = ParallelPlannerContext::new(self.req.context);
        self.compute_single_stream_reuse_plan(&parallel)?;
        self.optimize_reuse_plan_for_multi_stream(self.req.context)
    }

    /// Static reference count per value, plus the consumer map the
    /// multi-stream optimizer reads.
    fn compute_use_counts(&mut self) -> Result<(), PlanError> {
        let graph = self.req.graph.graph();
        for name in graph.inputs().to_vec() {
            let index = self.index(&name)?;
            // Pins the caller's view of the input; never reused.
            self.bump_use_count(index, 1)?;
        }
        for arg in self.req.outer_scope_args {
            let index = self.index(&arg.name)?;
            self.bump_use_count(index, 1)?;
        }
        for name in graph.initializers().to_vec() {
            let index = self.index(&name)?;
            self.bump_use_count(index, 1)?;
        }
        let stream_nodes = self.stream_nodes.clone();
        for nodes in &stream_nodes {
            for &node_index in nodes {
                let node = self.node(node_index)?;
                for name in node
                    .existing_inputs()
                    .chain(node.implicit_inputs.iter().map(String::as_str))
                {
                    let index = self.index(name)?;
                    self.bump_use_count(index, 1)?;
                    self.value_consumer_map
                        .entry(index)
                        .or_default()
                        .insert(node_index);
                }
                let has_external_outputs = self.kernel_info(node_index)?.external_outputs;
                for name in node.existing_outputs() {
                    let index = self.index(name)?;
                    self.bump_use_count(index, if has_external_outputs { 2 } else { 1 })?;
                }
            }
        }
        for name in graph.outputs().to_vec() {
            let index = self.index(&name)?;
            self.bump_use_count(index, 1)?;
        }
        Ok(())
    }

    fn compute_single_stream_reuse_plan(
        &mut self,
        context: &dyn PlannerContext,
    ) -> Result<(), PlanError> {
        let order: Vec<NodeIndex> = self
            .req
            .graph
            .nodes_in_topological_order(context.execution_order())
            .to_vec();
        let graph = self.req.graph.graph();
        let graph_outputs: HashSet<&str> = graph.outputs().iter().map(String::as_str).collect();
        let parallel = context.parallel_execution_enabled();

        for (program_counter, &node_index) in order.iter().enumerate() {
            let node = self.node(node_index)?;
            let has_external_outputs = self.kernel_info(node_index)?.external_outputs;

            for (output_index, name) in node.outputs.iter().enumerate() {
                let Some(name) = name.as_deref() else { continue };
                let current = self.index(name)?;
                let def = self
                    .def_of(name)
                    .ok_or_else(|| PlanError::UnknownValue {
                        name: name.to_string(),
                    })?;

                if has_external_outputs {
                    if !def.value_type.is_tensor() {
                        return Err(PlanError::NonTensorExternalOutput {
                            name: name.to_string(),
                        });
                    }
                    self.alloc_plan_mut(current)?.alloc_kind = AllocKind::AllocatedExternally;
                } else if graph_outputs.contains(name) {
                    self.alloc_plan_mut(current)?.alloc_kind = AllocKind::AllocateOutput;
                    self.try_share_loop_passthrough(node, current)?;
                } else {
                    let reusable_input = if parallel {
                        None
                    } else {
                        self.find_reusable_input(context, node, node_index, output_index, def)?
                    };
                    if let Some((reused, is_strided)) = reusable_input {
                        self.reuse(reused, current, AllocKind::Reuse)?;
                        debug!(input = reused, output = current, "reused as input");
                        if is_strided {
                            #[cfg(feature = "training")]
                            {
                                self.alloc_plan_mut(current)?.is_strided_tensor = true;
                            }
                            #[cfg(not(feature = "training"))]
                            {
                                return Err(PlanError::UnsupportedStridedTensor { node_index });
                            }
                        }
                    } else if !def.value_type.is_tensor() {
                        self.alloc_plan_mut(current)?.alloc_kind = AllocKind::Allocate;
                    } else {
                        let freed = if parallel {
                            None
                        } else {
                            self.find_reusable_tensor(context, current, def)?
                        };
                        if let Some(reused) = freed {
                            self.reuse(reused, current, AllocKind::Reuse)?;
                            debug!(freed = reused, output = current, "reused freed buffer");
                        } else {
                            self.alloc_plan_mut(current)?.alloc_kind = AllocKind::Allocate;
                        }
                    }
                }
            }

            // Inputs whose root hits zero remaining uses become free after
            // this step; unused outputs die immediately.
            for name in node
                .existing_inputs()
                .chain(node.implicit_inputs.iter().map(String::as_str))
                .chain(node.existing_outputs())
            {
                let index = self.index(name)?;
                self.release_use(index, program_counter)?;
            }
        }
        Ok(())
    }

    /// Inside a Loop body, an Identity whose input is a pass-through loop
    /// state (and not the iteration counter) shares the caller's buffer
    /// instead of copying it into a fresh output.
    fn try_share_loop_passthrough(
        &mut self,
        node: &Node,
        current: ValueIndex,
    ) -> Result<(), PlanError> {
        let Some(parent) = self.req.parent_node else {
            return Ok(());
        };
        if node.op_type != "Identity" || parent.op_type != "Loop" {
            return Ok(());
        }
        let Some(Some(input_name)) = node.inputs.first() else {
            return Ok(());
        };
        // The first body input is the iteration number; its holder is
        // rewritten every iteration and must be copied out.
        if self.req.graph.graph().inputs().first() == Some(input_name) {
            return Ok(());
        }
        let input_index = self.index(input_name)?;
        if self.alloc_plan(input_index)?.alloc_kind == AllocKind::PreExisting {
            self.reuse(input_index, current, AllocKind::Share)?;
        }
        Ok(())
    }

    fn release_use(
        &mut self,
        value: ValueIndex,
        program_counter: usize,
    ) -> Result<(), PlanError> {
        let original = self.buffer(value)?;
        let len = self.value_info.len();
        let info = self
            .value_info
            .get_mut(original)
            .ok_or(PlanError::IndexOutOfRange {
                index: original,
                len,
            })?;
        debug_assert!(info.use_count > 0);
        info.use_count = info.use_count.saturating_sub(1);
        if info.use_count == 0 {
            self.freelist.push_front(FreeBufferInfo {
                value: original,
                deallocate_point: program_counter,
            });
            debug!(
                value = original,
                step = program_counter,
                "buffer released to freelist"
            );
        }
        Ok(())
    }

    /// Searches the kernel's aliasing contracts for an input this output can
    /// take over: mandatory aliases first, then variadic aliases, then
    /// permitted in-place pairs when the input is at its last use and the
    /// sizes match. Returns `(input value, is_strided)`.
    fn find_reusable_input(
        &self,
        context: &dyn PlannerContext,
        node: &Node,
        node_index: NodeIndex,
        output_index: usize,
        output_def: &ValueDef,
    ) -> Result<Option<(ValueIndex, bool)>, PlanError> {
        let kernel = self.kernel_info(node_index)?;

        for &(input, output) in &kernel.alias {
            if output != output_index {
                continue;
            }
            if let Some(Some(name)) = node.inputs.get(input) {
                return Ok(Some((self.index(name)?, false)));
            }
        }

        if let Some((input_offset, output_offset)) = kernel.variadic_alias {
            let alias_input = output_index as isize - output_offset as isize + input_offset as isize;
            if alias_input >= 0 {
                if let Some(Some(name)) = node.inputs.get(alias_input as usize) {
                    return Ok(Some((self.index(name)?, false)));
                }
            }
        }

        for &(input, output) in &kernel.may_inplace {
            if output != output_index {
                continue;
            }
            let Some(Some(input_name)) = node.inputs.get(input) else {
                continue;
            };
            let input_index = self.index(input_name)?;
            let original = self.buffer(input_index)?;
            if self.use_count(original)? != 1 {
                continue;
            }
            let Some(input_def) = self.def_of(input_name) else {
                continue;
            };
            if self.same_size(context, input_def, output_def) {
                return Ok(Some((input_index, false)));
            }
        }

        #[cfg(feature = "training")]
        {
            if let Some(found) =
                self.find_strided_reusable_input(node, node_index, output_index, kernel)?
            {
                return Ok(Some((found, true)));
            }
        }

        Ok(None)
    }

    /// An output may share its input as a strided view only when every
    /// consumer accepts a strided tensor at the position it reads it from.
    #[cfg(feature = "training")]
    fn find_strided_reusable_input(
        &self,
        node: &Node,
        node_index: NodeIndex,
        output_index: usize,
        kernel: &KernelDef,
    ) -> Result<Option<ValueIndex>, PlanError> {
        let Some(output_name) = node.outputs.get(output_index).and_then(|n| n.as_deref()) else {
            return Ok(None);
        };
        for &(input, output) in &kernel.may_strided_output {
            if output != output_index {
                continue;
            }
            let Some(Some(input_name)) = node.inputs.get(input) else {
                continue;
            };
            let mut can_strided = true;
            for &consumer in self.req.graph.consumers_of_node(node_index) {
                let consumer_node = self.node(consumer)?;
                let consumer_kernel = self.kernel_info(consumer)?;
                for (position, consumed) in consumer_node.inputs.iter().enumerate() {
                    if consumed.as_deref() == Some(output_name)
                        && !consumer_kernel.may_strided_input.contains(&position)
                    {
                        can_strided = false;
                        break;
                    }
                }
                if !can_strided {
                    break;
                }
            }
            if can_strided {
                return Ok(Some(self.index(input_name)?));
            }
        }
        Ok(None)
    }

    /// Two values have the same size when neither is string-typed, element
    /// sizes agree, and shapes match rank-wise (by value or by identical
    /// non-empty symbolic name). Unknown shapes conservatively differ.
    fn same_size(
        &self,
        context: &dyn PlannerContext,
        a: &ValueDef,
        b: &ValueDef,
    ) -> bool {
        let (Some(spec_a), Some(spec_b)) = (a.value_type.tensor_spec(), b.value_type.tensor_spec())
        else {
            return false;
        };
        if spec_a.dtype.is_string() || spec_b.dtype.is_string() {
            return false;
        }
        let (Some(size_a), Some(size_b)) =
            (spec_a.dtype.size_in_bytes(), spec_b.dtype.size_in_bytes())
        else {
            return false;
        };
        if size_a != size_b {
            return false;
        }
        let (Some(shape_a), Some(shape_b)) = (context.shape(a), context.shape(b)) else {
            return false;
        };
        shape_a.matches(shape_b)
    }

    /// Picks the most recently freed buffer with the same location and size.
    fn find_reusable_tensor(
        &mut self,
        context: &dyn PlannerContext,
        output: ValueIndex,
        output_def: &ValueDef,
    ) -> Result<Option<ValueIndex>, PlanError> {
        if !context.enable_memory_reuse() {
            return Ok(None);
        }
        let Some(required_shape) = context.shape(output_def) else {
            return Ok(None);
        };
        if required_shape.rank() == 0 {
            return Ok(None);
        }
        let required_location = self.alloc_plan(output)?.location.clone();

        let mut found = None;
        for (position, free) in self.freelist.iter().enumerate() {
            let Some(def_site) = self.value_info(free.value)?.def_site else {
                continue;
            };
            let available_location = &self.alloc_plan(free.value)?.location;
            if available_location != &required_location {
                continue;
            }
            if context.shape(def_site).is_some() && self.same_size(context, def_site, output_def)
            {
                found = Some((position, free.value, free.deallocate_point));
                break;
            }
        }
        if let Some((position, value, freed_at)) = found {
            debug!(value, freed_at, "buffer leaves freelist");
            self.freelist.remove(position);
            return Ok(Some(value));
        }
        Ok(None)
    }

    // ---- multi-stream optimizer ---------------------------------------

    /// Overlays reuse onto the conservative baseline. Nodes are visited in
    /// reverse topological order (sinks first) so that when a node offers an
    /// output, every downstream candidate already carries its ancestor set.
    fn optimize_reuse_plan_for_multi_stream(
        &mut self,
        context: &dyn PlannerContext,
    ) -> Result<(), PlanError> {
        let mut dependents: HashMap<NodeIndex, usize> = HashMap::new();
        for upstreams in self.dependence_graph.values() {
            for &upstream in upstreams {
                *dependents.entry(upstream).or_insert(0) += 1;
            }
        }
        let mut queue: VecDeque<NodeIndex> = self
            .dependence_graph
            .keys()
            .filter(|node| dependents.get(node).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut ancestors_map: HashMap<NodeIndex, BTreeSet<NodeIndex>> = HashMap::new();
        let mut waiting_list: WaitingList = BTreeMap::new();
        let mut input_output_map: HashMap<ValueIndex, BTreeSet<ValueIndex>> = HashMap::new();
        let mut reused: HashSet<ValueIndex> = HashSet::new();

        while let Some(node_index) = queue.pop_front() {
            self.try_reuse_input(context, node_index, &mut input_output_map, &mut reused)?;
            self.try_reuse_output(
                context,
                node_index,
                &mut waiting_list,
                &mut ancestors_map,
                &input_output_map,
                &mut reused,
            )?;
            if let Some(upstreams) = self.dependence_graph.get(&node_index) {
                for &upstream in upstreams {
                    let counter = dependents.entry(upstream).or_insert(0);
                    *counter = counter.saturating_sub(1);
                    if *counter == 0 {
                        queue.push_back(upstream);
                    }
                }
            }
        }
        Ok(())
    }

    /// All transitive predecessors of `node_index` in the combined graph,
    /// including the node itself.
    fn collect_ancestors(&self, node_index: NodeIndex) -> BTreeSet<NodeIndex> {
        let mut ancestors = BTreeSet::new();
        let mut stack = vec![node_index];
        while let Some(current) = stack.pop() {
            if !ancestors.insert(current) {
                continue;
            }
            if let Some(upstreams) = self.dependence_graph.get(&current) {
                stack.extend(upstreams.iter().copied());
            }
        }
        ancestors
    }

    /// Re-runs the aliasing search against the baseline, gated on the
    /// candidate input still being a fresh allocation.
    fn try_reuse_input(
        &mut self,
        context: &dyn PlannerContext,
        node_index: NodeIndex,
        input_output_map: &mut HashMap<ValueIndex, BTreeSet<ValueIndex>>,
        reused: &mut HashSet<ValueIndex>,
    ) -> Result<(), PlanError> {
        let node = self.node(node_index)?;
        let outputs: Vec<(usize, String)> = node
            .outputs
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (i, n.clone())))
            .collect();

        for (output_index, output_name) in outputs {
            let output_value = self.index(&output_name)?;
            if self.alloc_plan(output_value)?.alloc_kind != AllocKind::Allocate {
                continue;
            }
            let Some(kernel) = self.req.kernel_info_map.get(&node_index) else {
                continue;
            };
            for input_name in node.existing_inputs() {
                let input_value = self.index(input_name)?;
                input_output_map
                    .entry(input_value)
                    .or_default()
                    .insert(output_value);
            }

            let mut rewritten = false;
            for &(input, output) in &kernel.alias {
                if output != output_index {
                    continue;
                }
                let Some(Some(input_name)) = node.inputs.get(input) else {
                    continue;
                };
                let input_value = self.index(input_name)?;
                if self.alloc_plan(input_value)?.alloc_kind == AllocKind::Allocate {
                    self.rewrite_as_reuse(output_value, input_value, reused)?;
                    rewritten = true;
                    break;
                }
            }
            if rewritten {
                continue;
            }

            if let Some((input_offset, output_offset)) = kernel.variadic_alias {
                let alias_input =
                    output_index as isize - output_offset as isize + input_offset as isize;
                if alias_input >= 0 {
                    if let Some(Some(input_name)) = node.inputs.get(alias_input as usize) {
                        let input_value = self.index(input_name)?;
                        if self.alloc_plan(input_value)?.alloc_kind == AllocKind::Allocate {
                            self.rewrite_as_reuse(output_value, input_value, reused)?;
                            continue;
                        }
                    }
                }
            }

            let output_def = self.def_of(&output_name);
            for &(input, output) in &kernel.may_inplace {
                if output != output_index {
                    continue;
                }
                let Some(Some(input_name)) = node.inputs.get(input) else {
                    continue;
                };
                let input_value = self.index(input_name)?;
                if self.alloc_plan(input_value)?.alloc_kind != AllocKind::Allocate {
                    continue;
                }
                let remaining = self
                    .value_consumer_map
                    .get(&input_value)
                    .map_or(0, BTreeSet::len);
                if remaining != 1 {
                    continue;
                }
                let (Some(input_def), Some(output_def)) = (self.def_of(input_name), output_def)
                else {
                    continue;
                };
                if self.same_size(context, input_def, output_def) {
                    self.rewrite_as_reuse(output_value, input_value, reused)?;
                    break;
                }
            }
        }
        Ok(())
    }

    fn rewrite_as_reuse(
        &mut self,
        output_value: ValueIndex,
        input_value: ValueIndex,
        reused: &mut HashSet<ValueIndex>,
    ) -> Result<(), PlanError> {
        debug!(input = input_value, output = output_value, "reused as input across streams");
        let entry = self.alloc_plan_mut(output_value)?;
        entry.alloc_kind = AllocKind::Reuse;
        entry.reused_buffer = Some(input_value);
        let merged = self
            .value_consumer_map
            .get(&output_value)
            .cloned()
            .unwrap_or_default();
        self.value_consumer_map
            .entry(input_value)
            .or_default()
            .extend(merged);
        reused.insert(input_value);
        Ok(())
    }

    /// Offers each still-fresh output of `node_index` to downstream waiters.
    /// A waiter may take the buffer only when the offering node and every
    /// consumer of the offered value are among the waiter's ancestors, so
    /// all reads of the donor happen-before any write by the reuser.
    fn try_reuse_output(
        &mut self,
        context: &dyn PlannerContext,
        node_index: NodeIndex,
        waiting_list: &mut WaitingList,
        ancestors_map: &mut HashMap<NodeIndex, BTreeSet<NodeIndex>>,
        input_output_map: &HashMap<ValueIndex, BTreeSet<ValueIndex>>,
        reused: &mut HashSet<ValueIndex>,
    ) -> Result<(), PlanError> {
        ancestors_map.insert(node_index, self.collect_ancestors(node_index));
        let node = self.node(node_index)?;
        let outputs: Vec<String> = node.existing_outputs().map(str::to_string).collect();

        for output_name in outputs {
            let output_value = self.index(&output_name)?;
            if reused.contains(&output_value)
                || self.alloc_plan(output_value)?.alloc_kind != AllocKind::Allocate
            {
                continue;
            }
            let Some(output_def) = self.def_of(&output_name) else {
                continue;
            };
            let Some(shape) = context.shape(output_def) else {
                continue;
            };
            let Some(spec) = output_def.value_type.tensor_spec() else {
                continue;
            };
            let footprint = buffer_footprint(spec.dtype.size_in_bytes(), shape);
            let Some(location) = self.alloc_plan(output_value)?.location.clone() else {
                continue;
            };

            let mut taken: Option<(usize, ValueIndex)> = None;
            if let Some(candidates) = waiting_list
                .get(&location)
                .and_then(|by_size| by_size.get(&footprint))
            {
                for (position, &(downstream_value, downstream_node)) in
                    candidates.iter().enumerate()
                {
                    // A direct producer/consumer pair must not collapse into
                    // one buffer.
                    if input_output_map
                        .get(&output_value)
                        .is_some_and(|outputs| outputs.contains(&downstream_value))
                    {
                        continue;
                    }
                    let Some(downstream_def) =
                        self.value_info(downstream_value)?.def_site
                    else {
                        continue;
                    };
                    if !self.same_size(context, downstream_def, output_def) {
                        continue;
                    }
                    let Some(ancestors) = ancestors_map.get(&downstream_node) else {
                        continue;
                    };
                    if !ancestors.contains(&node_index) {
                        continue;
                    }
                    let all_covered = self
                        .value_consumer_map
                        .get(&output_value)
                        .map_or(true, |consumers| {
                            consumers.iter().all(|c| ancestors.contains(c))
                        });
                    if all_covered {
                        taken = Some((position, downstream_value));
                        break;
                    }
                }
            }

            if let Some((position, downstream_value)) = taken {
                debug!(
                    donor = output_value,
                    reuser = downstream_value,
                    "reused across streams"
                );
                let entry = self.alloc_plan_mut(downstream_value)?;
                entry.alloc_kind = AllocKind::Reuse;
                entry.reused_buffer = Some(output_value);
                let mut merged: BTreeSet<NodeIndex> = self
                    .value_consumer_map
                    .get(&downstream_value)
                    .cloned()
                    .unwrap_or_default();
                if let Some(&producer) = self.value_node_map.get(&downstream_value) {
                    merged.insert(producer);
                }
                self.value_consumer_map
                    .entry(output_value)
                    .or_default()
                    .extend(merged);
                if let Some(by_size) = waiting_list.get_mut(&location) {
                    if let Some(candidates) = by_size.get_mut(&footprint) {
                        candidates.remove(position);
                        if candidates.is_empty() {
                            by_size.remove(&footprint);
                        }
                    }
                    if by_size.is_empty() {
                        waiting_list.remove(&location);
                    }
                }
                reused.insert(output_value);
            } else {
                waiting_list
                    .entry(location)
                    .or_default()
                    .entry(footprint)
                    .or_default()
                    .push((output_value, node_index));
            }
        }
        Ok(())
    }

    // ---- deallocation -------------------------------------------------

    /// Walks each stream backwards so the first recorded consumer per stream
    /// is the last one to execute, then attaches release actions: a single
    /// decrement when one stream covers all consumers, one per consumer
    /// otherwise.
    fn generate_deallocation_plan(&mut self) -> Result<(), PlanError> {
        let num_values = self.req.value_map.len();
        let mut value_consumers: Vec<Vec<NodeIndex>> = vec![Vec::new(); num_values];

        let stream_nodes = self.stream_nodes.clone();
        for nodes in &stream_nodes {
            for &node_index in nodes.iter().rev() {
                let node = self.node(node_index)?;
                for name in node
                    .existing_inputs()
                    .chain(node.implicit_inputs.iter().map(String::as_str))
                {
                    let index = self.index(name)?;
                    let original = self.buffer(index)?;
                    if self.alloc_plan(original)?.alloc_kind == AllocKind::Allocate {
                        value_consumers[original].push(node_index);
                    }
                }
            }
        }

        self.plan.node_release_list = vec![Vec::new(); self.req.graph.max_node_index()];
        for (value, consumers) in value_consumers.iter().enumerate() {
            if consumers.is_empty() {
                continue;
            }
            self.plan.release_actions.push(ReleaseAction {
                value,
                ref_count: 0,
            });
            let action_index = self.plan.release_actions.len() - 1;
            let first_stream = self.node_stream_map[consumers[0]];
            let single_stream = consumers
                .iter()
                .all(|&c| self.node_stream_map[c] == first_stream);
            if single_stream {
                self.attach_release(action_index, consumers[0]);
            } else {
                for &consumer in consumers {
                    self.attach_release(action_index, consumer);
                }
            }
        }
        Ok(())
    }

    fn attach_release(&mut self, action_index: usize, node_index: NodeIndex) {
        self.plan.release_actions[action_index].ref_count += 1;
        self.plan.node_release_list[node_index].push(action_index);
    }

    // ---- training-only ordering ---------------------------------------

    /// Roots feeding contiguously-allocated kernels, split into initializer
    /// and activation order lists.
    #[cfg(feature = "training")]
    fn compute_allocation_order(&mut self) -> Result<(), PlanError> {
        let stream_nodes = self.stream_nodes.clone();
        for nodes in &stream_nodes {
            for &node_index in nodes {
                if !self.kernel_info(node_index)?.allocate_inputs_contiguously {
                    continue;
                }
                let node = self.node(node_index)?;
                let mut input_kind = AllocKind::AllocateStatically;
                let mut first = true;
                for name in node.existing_inputs() {
                    let current = self.index(name)?;
                    let entry = self.alloc_plan(current)?;
                    let actual = match (entry.alloc_kind, entry.reused_buffer) {
                        (AllocKind::Reuse, Some(root)) => root,
                        _ => current,
                    };
                    let actual_kind = self.alloc_plan(actual)?.alloc_kind;
                    if first {
                        input_kind = actual_kind;
                        first = false;
                    }
                    if actual_kind == AllocKind::AllocateStatically
                        && input_kind != AllocKind::AllocateStatically
                    {
                        return Err(PlanError::ContiguousInputsMixed { node_index });
                    }
                    let order = if actual_kind == AllocKind::AllocateStatically {
                        &mut self.plan.initializer_allocation_order
                    } else {
                        &mut self.plan.activation_allocation_order
                    };
                    if !order.contains(&actual) {
                        order.push(actual);
                    }
                }
            }
        }
        Ok(())
    }
}

/// `location → byte footprint → (value, offering node)` in insertion order.
type WaitingList = BTreeMap<MemoryInfo, BTreeMap<u64, Vec<(ValueIndex, NodeIndex)>>>;


/// Cheap discriminator for the waiting list. Statically shaped values use
/// their byte length; symbolic shapes hash the dimension pattern. Equality
/// is always re-checked structurally before a reuse is taken.
fn buffer_footprint(elem_size: Option<usize>, shape: &crate::graph::Shape) -> u64 {
    if let (Some(count), Some(size)) = (shape.element_count(), elem_size) {
        if let Some(bytes) = count.checked_mul(size) {
            return bytes as u64;
        }
    }
    let mut hasher = DefaultHasher::new();
    elem_size.hash(&mut hasher);
    shape.dims().hash(&mut hasher);
    hasher.finish()
}
