mod common;

use std::collections::HashMap;

use common::{
    cpu_only, f32_spec, f32_tensor, i64_tensor, index_of, kernels, plain_kernels, plan_graph,
    plan_subgraph, CPU,
};
use streamplan::{
    AllocKind, ExecutionStep, Graph, GraphBuilder, KernelDef, Node, StreamHandleRegistry,
};

fn linear_chain() -> Graph {
    let mut builder = GraphBuilder::new();
    builder.add_input("x", f32_tensor(&[4]));
    builder.add_value("a", f32_tensor(&[4]));
    builder.add_value("b", f32_tensor(&[4]));
    builder.add_value("c", f32_tensor(&[4]));
    builder.add_node(
        Node::new("A", "Exp", CPU)
            .with_inputs(["x"])
            .with_outputs(["a"]),
    );
    builder.add_node(
        Node::new("B", "Relu", CPU)
            .with_inputs(["a"])
            .with_outputs(["b"]),
    );
    builder.add_node(
        Node::new("C", "Neg", CPU)
            .with_inputs(["b"])
            .with_outputs(["c"]),
    );
    builder.add_output("c");
    builder.finish().unwrap()
}

#[test]
fn linear_single_stream_inplace_reuse() {
    let graph = linear_chain();
    // B may run in place on its only input.
    let kernel_map = kernels(vec![
        (0, KernelDef::new()),
        (1, KernelDef::new().with_may_inplace(0, 0)),
        (2, KernelDef::new()),
    ]);
    let providers = cpu_only();
    let handles = StreamHandleRegistry::new();
    let (plan, value_map) = plan_graph(&graph, &kernel_map, &providers, &handles);

    assert_eq!(plan.execution_plan.len(), 1);
    let launches: Vec<usize> = plan.execution_plan[0]
        .steps
        .iter()
        .filter_map(|s| match s {
            ExecutionStep::LaunchKernel { node_index } => Some(*node_index),
            _ => None,
        })
        .collect();
    assert_eq!(launches, vec![0, 1, 2]);

    let a = index_of(&value_map, "a");
    let b = index_of(&value_map, "b");
    let c = index_of(&value_map, "c");

    // a's buffer is at its last use when B runs, so b takes it over.
    assert_eq!(plan.allocation_plan[b].alloc_kind, AllocKind::Reuse);
    assert_eq!(plan.allocation_plan[b].reused_buffer, Some(a));
    assert_eq!(plan.allocation_plan[a].alloc_kind, AllocKind::Allocate);
    assert_eq!(plan.allocation_plan[c].alloc_kind, AllocKind::AllocateOutput);

    // A's buffer is released once C, the last reader through b, completes.
    let action = plan
        .release_actions
        .iter()
        .position(|r| r.value == a)
        .expect("a must have a release action");
    assert_eq!(plan.release_actions[action].ref_count, 1);
    assert!(plan.node_release_list[2].contains(&action));
}

#[test]
fn mandatory_alias_reuses_non_graph_input() {
    let mut builder = GraphBuilder::new();
    builder.add_input("x", f32_tensor(&[2, 2]));
    builder.add_value("t", f32_tensor(&[2, 2]));
    builder.add_value("r", f32_tensor(&[4]));
    builder.add_value("y", f32_tensor(&[4]));
    builder.add_node(
        Node::new("A", "Relu", CPU)
            .with_inputs(["x"])
            .with_outputs(["t"]),
    );
    builder.add_node(
        Node::new("R", "Reshape", CPU)
            .with_inputs(["t"])
            .with_outputs(["r"]),
    );
    builder.add_node(
        Node::new("C", "Neg", CPU)
            .with_inputs(["r"])
            .with_outputs(["y"]),
    );
    builder.add_output("y");
    let graph = builder.finish().unwrap();

    let kernel_map = kernels(vec![
        (0, KernelDef::new()),
        (1, KernelDef::new().with_alias(0, 0)),
        (2, KernelDef::new()),
    ]);
    let providers = cpu_only();
    let handles = StreamHandleRegistry::new();
    let (plan, value_map) = plan_graph(&graph, &kernel_map, &providers, &handles);

    let t = index_of(&value_map, "t");
    let r = index_of(&value_map, "r");
    assert_eq!(plan.allocation_plan[r].alloc_kind, AllocKind::Reuse);
    assert_eq!(plan.allocation_plan[r].reused_buffer, Some(t));
}

#[test]
fn variadic_alias_maps_output_to_offset_input() {
    // Graph outputs win over aliasing, so route the variadic pair through
    // an extra consumer.
    let mut builder = GraphBuilder::new();
    builder.add_input("x0", f32_tensor(&[4]));
    builder.add_input("x1", f32_tensor(&[4]));
    builder.add_value("p0", f32_tensor(&[4]));
    builder.add_value("p1", f32_tensor(&[4]));
    builder.add_value("y0", f32_tensor(&[4]));
    builder.add_value("y1", f32_tensor(&[4]));
    builder.add_value("z", f32_tensor(&[4]));
    builder.add_node(
        Node::new("P0", "Exp", CPU)
            .with_inputs(["x0"])
            .with_outputs(["p0"]),
    );
    builder.add_node(
        Node::new("P1", "Exp", CPU)
            .with_inputs(["x1"])
            .with_outputs(["p1"]),
    );
    builder.add_node(
        Node::new("AR", "AllReduce", CPU)
            .with_inputs(["p0", "p1"])
            .with_outputs(["y0", "y1"]),
    );
    builder.add_node(
        Node::new("S", "Add", CPU)
            .with_inputs(["y0", "y1"])
            .with_outputs(["z"]),
    );
    builder.add_output("z");
    let graph = builder.finish().unwrap();

    let kernel_map = kernels(vec![
        (0, KernelDef::new()),
        (1, KernelDef::new()),
        (2, KernelDef::new().with_variadic_alias(0, 0)),
        (3, KernelDef::new()),
    ]);
    let providers = cpu_only();
    let handles = StreamHandleRegistry::new();
    let (plan, value_map) = plan_graph(&graph, &kernel_map, &providers, &handles);

    let p0 = index_of(&value_map, "p0");
    let p1 = index_of(&value_map, "p1");
    let y0 = index_of(&value_map, "y0");
    let y1 = index_of(&value_map, "y1");
    assert_eq!(plan.allocation_plan[y0].alloc_kind, AllocKind::Reuse);
    assert_eq!(plan.allocation_plan[y0].reused_buffer, Some(p0));
    assert_eq!(plan.allocation_plan[y1].alloc_kind, AllocKind::Reuse);
    assert_eq!(plan.allocation_plan[y1].reused_buffer, Some(p1));
}

#[test]
fn graph_output_is_never_reused() {
    let mut builder = GraphBuilder::new();
    builder.add_input("x", f32_tensor(&[4]));
    builder.add_value("y", f32_tensor(&[4]));
    builder.add_node(
        Node::new("A", "Relu", CPU)
            .with_inputs(["x"])
            .with_outputs(["y"]),
    );
    builder.add_output("y");
    let graph = builder.finish().unwrap();

    // Even a may-inplace permission must not claim a graph output.
    let kernel_map = kernels(vec![(0, KernelDef::new().with_may_inplace(0, 0))]);
    let providers = cpu_only();
    let handles = StreamHandleRegistry::new();
    let (plan, value_map) = plan_graph(&graph, &kernel_map, &providers, &handles);

    let y = index_of(&value_map, "y");
    assert_eq!(plan.allocation_plan[y].alloc_kind, AllocKind::AllocateOutput);
    assert_eq!(plan.allocation_plan[y].reused_buffer, None);
}

#[test]
fn freelist_reuses_dead_buffer_of_same_size_and_location() {
    // a dies as soon as B has read it; C's output picks it off the
    // freelist two steps later.
    let mut builder = GraphBuilder::new();
    builder.add_input("x", f32_tensor(&[8]));
    builder.add_value("a", f32_tensor(&[8]));
    builder.add_value("b", f32_tensor(&[8]));
    builder.add_value("c", f32_tensor(&[8]));
    builder.add_value("d", f32_tensor(&[8]));
    builder.add_node(
        Node::new("A", "Exp", CPU)
            .with_inputs(["x"])
            .with_outputs(["a"]),
    );
    builder.add_node(
        Node::new("B", "Neg", CPU)
            .with_inputs(["a"])
            .with_outputs(["b"]),
    );
    builder.add_node(
        Node::new("C", "Exp", CPU)
            .with_inputs(["b"])
            .with_outputs(["c"]),
    );
    builder.add_node(
        Node::new("D", "Neg", CPU)
            .with_inputs(["c"])
            .with_outputs(["d"]),
    );
    builder.add_output("d");
    let graph = builder.finish().unwrap();

    let kernel_map = plain_kernels(4);
    let providers = cpu_only();
    let handles = StreamHandleRegistry::new();
    let (plan, value_map) = plan_graph(&graph, &kernel_map, &providers, &handles);

    let a = index_of(&value_map, "a");
    let c = index_of(&value_map, "c");
    // a dies once B has consumed it, so C's output claims it from the
    // freelist.
    assert_eq!(plan.allocation_plan[c].alloc_kind, AllocKind::Reuse);
    assert_eq!(plan.allocation_plan[c].reused_buffer, Some(a));
}

#[test]
fn string_tensors_never_enter_reuse() {
    use streamplan::{DType, Shape, TensorSpec, ValueType};
    let str_tensor = ValueType::Tensor(TensorSpec::new(DType::Str, Shape::of_static(&[4])));
    let mut builder = GraphBuilder::new();
    builder.add_input("x", str_tensor.clone());
    builder.add_value("a", str_tensor.clone());
    builder.add_value("b", str_tensor.clone());
    builder.add_value("c", str_tensor);
    builder.add_node(
        Node::new("A", "Lower", CPU)
            .with_inputs(["x"])
            .with_outputs(["a"]),
    );
    builder.add_node(
        Node::new("B", "Upper", CPU)
            .with_inputs(["a"])
            .with_outputs(["b"]),
    );
    builder.add_node(
        Node::new("C", "Trim", CPU)
            .with_inputs(["b"])
            .with_outputs(["c"]),
    );
    builder.add_output("c");
    let graph = builder.finish().unwrap();

    let kernel_map = kernels(vec![
        (0, KernelDef::new()),
        (1, KernelDef::new().with_may_inplace(0, 0)),
        (2, KernelDef::new()),
    ]);
    let providers = cpu_only();
    let handles = StreamHandleRegistry::new();
    let (plan, value_map) = plan_graph(&graph, &kernel_map, &providers, &handles);

    for name in ["a", "b"] {
        let index = index_of(&value_map, name);
        assert_eq!(plan.allocation_plan[index].alloc_kind, AllocKind::Allocate);
    }
}

#[test]
fn external_outputs_are_owned_outside_and_pinned() {
    let mut builder = GraphBuilder::new();
    builder.add_input("x", f32_tensor(&[4]));
    builder.add_value("e", f32_tensor(&[4]));
    builder.add_value("y", f32_tensor(&[4]));
    builder.add_node(
        Node::new("E", "Yield", CPU)
            .with_inputs(["x"])
            .with_outputs(["e"]),
    );
    builder.add_node(
        Node::new("B", "Relu", CPU)
            .with_inputs(["e"])
            .with_outputs(["y"]),
    );
    builder.add_output("y");
    let graph = builder.finish().unwrap();

    let kernel_map = kernels(vec![
        (0, KernelDef::new().with_external_outputs()),
        (1, KernelDef::new().with_may_inplace(0, 0)),
    ]);
    let providers = cpu_only();
    let handles = StreamHandleRegistry::new();
    let (plan, value_map) = plan_graph(&graph, &kernel_map, &providers, &handles);

    let e = index_of(&value_map, "e");
    let y = index_of(&value_map, "y");
    assert_eq!(
        plan.allocation_plan[e].alloc_kind,
        AllocKind::AllocatedExternally
    );
    // The doubled use count keeps the external buffer out of reuse even at
    // its last consumer.
    assert_eq!(plan.allocation_plan[y].alloc_kind, AllocKind::AllocateOutput);
    assert!(plan
        .release_actions
        .iter()
        .all(|action| action.value != e));
}

#[test]
fn loop_identity_shares_passthrough_state() {
    let mut builder = GraphBuilder::new();
    builder.add_input("iter", i64_tensor(&[1]));
    builder.add_input("state", f32_tensor(&[4]));
    builder.add_value("state_out", f32_tensor(&[4]));
    builder.add_node(
        Node::new("I", "Identity", CPU)
            .with_inputs(["state"])
            .with_outputs(["state_out"]),
    );
    builder.add_output("state_out");
    let body = builder.finish().unwrap();

    let parent = Node::new("loop0", "Loop", CPU);
    let kernel_map = kernels(vec![(0, KernelDef::new().with_alias(0, 0))]);
    let providers = cpu_only();
    let (plan, value_map) = plan_subgraph(
        &parent,
        &body,
        &[],
        &HashMap::new(),
        &kernel_map,
        &providers,
    );

    let state = index_of(&value_map, "state");
    let state_out = index_of(&value_map, "state_out");
    assert_eq!(plan.allocation_plan[state_out].alloc_kind, AllocKind::Share);
    assert_eq!(plan.allocation_plan[state_out].reused_buffer, Some(state));
    assert_eq!(plan.allocation_plan[state].alloc_kind, AllocKind::PreExisting);
}

#[test]
fn loop_identity_copies_iteration_counter() {
    let mut builder = GraphBuilder::new();
    builder.add_input("iter", i64_tensor(&[1]));
    builder.add_input("state", f32_tensor(&[4]));
    builder.add_value("iter_out", i64_tensor(&[1]));
    builder.add_node(
        Node::new("I", "Identity", CPU)
            .with_inputs(["iter"])
            .with_outputs(["iter_out"]),
    );
    builder.add_output("iter_out");
    let body = builder.finish().unwrap();

    let parent = Node::new("loop0", "Loop", CPU);
    let kernel_map = kernels(vec![(0, KernelDef::new().with_alias(0, 0))]);
    let providers = cpu_only();
    let (plan, value_map) = plan_subgraph(
        &parent,
        &body,
        &[],
        &HashMap::new(),
        &kernel_map,
        &providers,
    );

    // The iteration holder is rewritten every round; the output must be a
    // fresh copy.
    let iter_out = index_of(&value_map, "iter_out");
    assert_eq!(
        plan.allocation_plan[iter_out].alloc_kind,
        AllocKind::AllocateOutput
    );
}

#[test]
fn reuse_chains_terminate_at_self_rooted_buffers() {
    let graph = linear_chain();
    let kernel_map = kernels(vec![
        (0, KernelDef::new()),
        (1, KernelDef::new().with_may_inplace(0, 0)),
        (2, KernelDef::new().with_may_inplace(0, 0)),
    ]);
    let providers = cpu_only();
    let handles = StreamHandleRegistry::new();
    let (plan, value_map) = plan_graph(&graph, &kernel_map, &providers, &handles);

    for (index, _) in value_map.iter() {
        let mut current = index;
        let mut hops = 0;
        while let Some(next) = plan.allocation_plan[current].reused_buffer {
            assert_ne!(next, current, "a value must never reuse itself");
            current = next;
            hops += 1;
            assert!(hops <= value_map.len(), "reuse chain must terminate");
        }
        // The chain root carries a real allocation decision.
        assert!(matches!(
            plan.allocation_plan[current].alloc_kind,
            AllocKind::Allocate
                | AllocKind::AllocateOutput
                | AllocKind::AllocateStatically
                | AllocKind::PreExisting
                | AllocKind::AllocatedExternally
        ));
    }
}

#[test]
fn weights_are_allocated_statically_at_first_use_location() {
    let mut builder = GraphBuilder::new();
    builder.add_input("x", f32_tensor(&[4]));
    builder.add_initializer("w", f32_spec(&[4]));
    builder.add_value("y", f32_tensor(&[4]));
    builder.add_node(
        Node::new("A", "Mul", CPU)
            .with_inputs(["x", "w"])
            .with_outputs(["y"]),
    );
    builder.add_output("y");
    let graph = builder.finish().unwrap();

    let kernel_map = plain_kernels(1);
    let providers = cpu_only();
    let handles = StreamHandleRegistry::new();
    let (plan, value_map) = plan_graph(&graph, &kernel_map, &providers, &handles);

    let w = index_of(&value_map, "w");
    assert_eq!(
        plan.allocation_plan[w].alloc_kind,
        AllocKind::AllocateStatically
    );
    assert_eq!(
        plan.allocation_plan[w].location.as_ref().map(|l| l.name.as_str()),
        Some("Cpu")
    );
}

#[test]
fn plan_dump_lists_values_and_steps() {
    let graph = linear_chain();
    let kernel_map = plain_kernels(3);
    let providers = cpu_only();
    let handles = StreamHandleRegistry::new();
    let (plan, value_map) = plan_graph(&graph, &kernel_map, &providers, &handles);

    let dump = plan.dump(&value_map);
    assert!(dump.contains("(0) x : PreExisting"));
    assert!(dump.contains("Launch kernel with node id: 0."));
    assert!(dump.contains("Start logic stream: 0 on execution provider: CpuExecutionProvider"));
}
