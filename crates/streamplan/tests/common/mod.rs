#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use streamplan::{
    create_plan, DType, ExecutionProvider, ExecutionProviders, Graph, GraphViewer, KernelDef,
    KernelInfoMap, MemType, MemoryInfo, Node, PlanRequest, SequentialExecutionPlan,
    SequentialPlannerContext, Shape, StreamHandleRegistry, SubgraphKernelInfoMaps, TensorSpec,
    ValueDef, ValueIndexMap, ValueType,
};

pub const CPU: &str = "CpuExecutionProvider";
pub const CUDA: &str = "CudaExecutionProvider";

pub fn f32_spec(dims: &[usize]) -> TensorSpec {
    TensorSpec::new(DType::F32, Shape::of_static(dims))
}

pub fn f32_tensor(dims: &[usize]) -> ValueType {
    ValueType::Tensor(f32_spec(dims))
}

pub fn i64_tensor(dims: &[usize]) -> ValueType {
    ValueType::Tensor(TensorSpec::new(DType::I64, Shape::of_static(dims)))
}

pub fn cpu_only() -> ExecutionProviders {
    let mut providers = ExecutionProviders::new();
    providers.register(ExecutionProvider::new(CPU, MemoryInfo::cpu()));
    providers
}

pub fn cpu_and_cuda() -> ExecutionProviders {
    let mut providers = ExecutionProviders::new();
    providers.register(ExecutionProvider::new(CPU, MemoryInfo::cpu()));
    providers.register(ExecutionProvider::new(
        CUDA,
        MemoryInfo::new("Cuda", 0, MemType::Default),
    ));
    providers
}

pub fn kernels(defs: Vec<(usize, KernelDef)>) -> KernelInfoMap {
    defs.into_iter().collect()
}

pub fn plain_kernels(count: usize) -> KernelInfoMap {
    (0..count).map(|i| (i, KernelDef::new())).collect()
}

/// Plans a top-level graph with default context and no partition config.
pub fn plan_graph(
    graph: &Graph,
    kernel_info_map: &KernelInfoMap,
    providers: &ExecutionProviders,
    stream_handles: &StreamHandleRegistry,
) -> (SequentialExecutionPlan, ValueIndexMap) {
    plan_graph_with_config(graph, kernel_info_map, providers, stream_handles, None)
}

pub fn plan_graph_with_config(
    graph: &Graph,
    kernel_info_map: &KernelInfoMap,
    providers: &ExecutionProviders,
    stream_handles: &StreamHandleRegistry,
    partition_config_file: Option<&Path>,
) -> (SequentialExecutionPlan, ValueIndexMap) {
    let viewer = GraphViewer::new(graph).expect("graph must be acyclic");
    let value_map = ValueIndexMap::from_graph(&viewer, &[]);
    let context = SequentialPlannerContext::default();
    let subgraph_kernels = SubgraphKernelInfoMaps::new();
    let outer_scope_locations = HashMap::new();
    let request = PlanRequest {
        parent_node: None,
        graph: &viewer,
        outer_scope_args: &[],
        providers,
        kernel_info_map,
        subgraph_kernel_info_maps: &subgraph_kernels,
        outer_scope_locations: &outer_scope_locations,
        value_map: &value_map,
        context: &context,
        stream_handles,
        partition_config_file,
    };
    let plan = create_plan(&request).expect("planning must succeed");
    (plan, value_map)
}

/// Plans a subgraph owned by `parent_node`.
pub fn plan_subgraph(
    parent_node: &Node,
    graph: &Graph,
    outer_scope_args: &[ValueDef],
    outer_scope_locations: &HashMap<String, MemoryInfo>,
    kernel_info_map: &KernelInfoMap,
    providers: &ExecutionProviders,
) -> (SequentialExecutionPlan, ValueIndexMap) {
    let viewer = GraphViewer::new(graph).expect("graph must be acyclic");
    let value_map = ValueIndexMap::from_graph(&viewer, outer_scope_args);
    let context = SequentialPlannerContext::default();
    let subgraph_kernels = SubgraphKernelInfoMaps::new();
    let stream_handles = StreamHandleRegistry::new();
    let request = PlanRequest {
        parent_node: Some(parent_node),
        graph: &viewer,
        outer_scope_args,
        providers,
        kernel_info_map,
        subgraph_kernel_info_maps: &subgraph_kernels,
        outer_scope_locations,
        value_map: &value_map,
        context: &context,
        stream_handles: &stream_handles,
        partition_config_file: None,
    };
    let plan = create_plan(&request).expect("planning must succeed");
    (plan, value_map)
}

pub fn index_of(value_map: &ValueIndexMap, name: &str) -> usize {
    value_map
        .index_of(name)
        .unwrap_or_else(|| panic!("value {name} missing from index map"))
}
