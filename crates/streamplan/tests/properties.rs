mod common;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Write;

use common::{cpu_only, f32_spec, f32_tensor, plan_graph, plan_graph_with_config, CPU};
use proptest::prelude::*;
use streamplan::{
    AllocKind, ExecutionStep, Graph, GraphBuilder, KernelDef, KernelInfoMap, Node,
    SequentialExecutionPlan, StreamHandleRegistry, ValueIndexMap,
};
use tempfile::NamedTempFile;

/// Per node: first-input selector, second-input selector, feature flags.
type NodeSpec = (u8, u8, u8);

fn node_specs() -> impl Strategy<Value = Vec<NodeSpec>> {
    proptest::collection::vec(any::<NodeSpec>(), 3..=9)
}

/// Builds a random DAG: node `i` produces `v{i}` and consumes `x`, an
/// optional initializer, or earlier outputs. Sinks become graph outputs.
fn build_graph(specs: &[NodeSpec]) -> (Graph, KernelInfoMap, Vec<Vec<String>>) {
    let mut builder = GraphBuilder::new();
    builder.add_input("x", f32_tensor(&[4]));
    if specs.iter().any(|&(_, _, flags)| flags & 8 != 0) {
        builder.add_initializer("w", f32_spec(&[4]));
    }

    let mut kernel_map = KernelInfoMap::new();
    let mut consumed: HashSet<String> = HashSet::new();
    let mut node_inputs: Vec<Vec<String>> = Vec::new();

    for (i, &(first, second, flags)) in specs.iter().enumerate() {
        let pick = |sel: u8| -> String {
            let choice = sel as usize % (i + 1);
            if choice == i {
                "x".to_string()
            } else {
                format!("v{choice}")
            }
        };
        let mut inputs = vec![pick(first)];
        if flags & 1 != 0 && i > 0 {
            inputs.push(pick(second));
        }
        if flags & 8 != 0 {
            inputs.push("w".to_string());
        }
        for input in &inputs {
            consumed.insert(input.clone());
        }
        let output = format!("v{i}");
        builder.add_value(&output, f32_tensor(&[4]));
        builder.add_node(
            Node::new(format!("n{i}"), "Op", CPU)
                .with_inputs(inputs.iter().map(String::as_str))
                .with_outputs([output.as_str()]),
        );
        let mut kernel = KernelDef::new();
        if flags & 2 != 0 {
            kernel = kernel.with_may_inplace(0, 0);
        }
        kernel_map.insert(i, kernel);
        node_inputs.push(inputs);
    }

    for i in 0..specs.len() {
        let output = format!("v{i}");
        if !consumed.contains(&output) {
            builder.add_output(&output);
        }
    }
    (builder.finish().unwrap(), kernel_map, node_inputs)
}

fn chase_root(plan: &SequentialExecutionPlan, value: usize) -> usize {
    let mut current = value;
    let mut hops = 0;
    while let Some(next) = plan.allocation_plan[current].reused_buffer {
        assert_ne!(next, current, "a value must never reuse itself");
        current = next;
        hops += 1;
        assert!(
            hops <= plan.allocation_plan.len(),
            "reuse chain must terminate"
        );
    }
    current
}

fn check_shared_invariants(
    plan: &SequentialExecutionPlan,
    value_map: &ValueIndexMap,
    graph: &Graph,
) {
    // Every value carries a decision.
    for (index, name) in value_map.iter() {
        assert_ne!(
            plan.allocation_plan[index].alloc_kind,
            AllocKind::NotSet,
            "value {name} was never planned"
        );
    }

    // Reuse chains terminate at self-rooted buffers with real decisions,
    // and never at a graph output.
    let output_indices: HashSet<usize> = graph
        .outputs()
        .iter()
        .map(|name| value_map.index_of(name).unwrap())
        .collect();
    for (index, _) in value_map.iter() {
        let root = chase_root(plan, index);
        let root_kind = plan.allocation_plan[root].alloc_kind;
        assert!(matches!(
            root_kind,
            AllocKind::Allocate
                | AllocKind::AllocateOutput
                | AllocKind::AllocateStatically
                | AllocKind::PreExisting
                | AllocKind::AllocatedExternally
        ));
        if root != index {
            assert!(
                !output_indices.contains(&root),
                "an intermediate reuses a graph output"
            );
        }
    }

    // Graph outputs stay immortal.
    for &output in &output_indices {
        assert!(matches!(
            plan.allocation_plan[output].alloc_kind,
            AllocKind::AllocateOutput | AllocKind::Share | AllocKind::AllocatedExternally
        ));
    }

    // Initializers are planned statically.
    for name in graph.initializers() {
        let index = value_map.index_of(name).unwrap();
        assert_eq!(
            plan.allocation_plan[index].alloc_kind,
            AllocKind::AllocateStatically
        );
    }

    // Scheduled decrements match every release action's reference count.
    for (action_index, action) in plan.release_actions.iter().enumerate() {
        assert!(action.ref_count > 0);
        let attachments: usize = plan
            .node_release_list
            .iter()
            .map(|actions| actions.iter().filter(|&&i| i == action_index).count())
            .sum();
        assert_eq!(attachments, action.ref_count);
    }
}

proptest! {
    #[test]
    fn sequential_plans_uphold_reuse_invariants(specs in node_specs()) {
        let (graph, kernel_map, _) = build_graph(&specs);
        let providers = cpu_only();
        let handles = StreamHandleRegistry::new();
        let (plan, value_map) = plan_graph(&graph, &kernel_map, &providers, &handles);
        check_shared_invariants(&plan, &value_map, &graph);
    }

    #[test]
    fn multi_stream_plans_synchronize_and_reuse_safely(specs in node_specs()) {
        let (graph, kernel_map, node_inputs) = build_graph(&specs);

        // Split the nodes across two CPU streams so the stream-aware
        // optimizer is exercised; fall back to one stream when a side
        // would be empty.
        let stream_a: Vec<String> = (0..specs.len())
            .filter(|i| specs[*i].2 & 4 == 0)
            .map(|i| format!("n{i}"))
            .collect();
        let stream_b: Vec<String> = (0..specs.len())
            .filter(|i| specs[*i].2 & 4 != 0)
            .map(|i| format!("n{i}"))
            .collect();
        let streams: Vec<&[String]> = [&stream_a, &stream_b]
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_slice())
            .collect();
        let mut config = NamedTempFile::new().unwrap();
        writeln!(config, "DevicePartition").unwrap();
        writeln!(config, "ExecutionProviders:1").unwrap();
        writeln!(config, "CpuExecutionProvider:{}", streams.len()).unwrap();
        for stream in &streams {
            writeln!(config, "{}", stream.join(",")).unwrap();
        }

        let providers = cpu_only();
        let handles = StreamHandleRegistry::new();
        let (plan, value_map) = plan_graph_with_config(
            &graph,
            &kernel_map,
            &providers,
            &handles,
            Some(config.path()),
        );
        check_shared_invariants(&plan, &value_map, &graph);

        // Reconstruct stream assignment and per-stream order from launches.
        let mut node_stream: HashMap<usize, usize> = HashMap::new();
        let mut stream_order: Vec<Vec<usize>> = Vec::new();
        for (stream_index, stream) in plan.execution_plan.iter().enumerate() {
            let mut order = Vec::new();
            for step in &stream.steps {
                if let ExecutionStep::LaunchKernel { node_index } = step {
                    node_stream.insert(*node_index, stream_index);
                    order.push(*node_index);
                }
            }
            stream_order.push(order);
        }

        // Combined dependency graph: model edges plus stream successors.
        let mut upstreams: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        let mut producer_of: HashMap<String, usize> = HashMap::new();
        for i in 0..specs.len() {
            producer_of.insert(format!("v{i}"), i);
        }
        let mut consumers_of_value: HashMap<String, BTreeSet<usize>> = HashMap::new();
        for (i, inputs) in node_inputs.iter().enumerate() {
            for input in inputs {
                consumers_of_value.entry(input.clone()).or_default().insert(i);
                if let Some(&producer) = producer_of.get(input) {
                    upstreams.entry(i).or_default().insert(producer);
                }
            }
        }
        for order in &stream_order {
            for pair in order.windows(2) {
                upstreams.entry(pair[1]).or_default().insert(pair[0]);
            }
        }
        let ancestors = |start: usize| -> BTreeSet<usize> {
            let mut seen = BTreeSet::new();
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                if seen.insert(node) {
                    if let Some(ups) = upstreams.get(&node) {
                        stack.extend(ups.iter().copied());
                    }
                }
            }
            seen
        };

        // Cross-stream reuse safety: every reader of the donor buffer is an
        // ancestor of the reusing value's producer.
        for i in 0..specs.len() {
            let value = value_map.index_of(&format!("v{i}")).unwrap();
            if plan.allocation_plan[value].alloc_kind != AllocKind::Reuse {
                continue;
            }
            let donor = plan.allocation_plan[value].reused_buffer.unwrap();
            let donor_name = value_map.name_of(donor).unwrap().to_string();
            let reuser_ancestors = ancestors(i);
            if let Some(readers) = consumers_of_value.get(&donor_name) {
                for &reader in readers {
                    prop_assert!(
                        reuser_ancestors.contains(&reader),
                        "node n{i} reuses {donor_name} while n{reader} may still read it"
                    );
                }
            }
        }

        // Sync completeness: every cross-stream model edge is guarded by a
        // barrier released by the producer's notification.
        for (consumer, inputs) in node_inputs.iter().enumerate() {
            for input in inputs {
                let Some(&producer) = producer_of.get(input) else { continue };
                let producer_stream = node_stream[&producer];
                let consumer_stream = node_stream[&consumer];
                if producer_stream == consumer_stream {
                    continue;
                }
                let launch_offset = plan.execution_plan[consumer_stream]
                    .steps
                    .iter()
                    .position(|step| {
                        matches!(step, ExecutionStep::LaunchKernel { node_index } if *node_index == consumer)
                    })
                    .unwrap();
                let notification = plan.execution_plan[producer_stream]
                    .steps
                    .iter()
                    .zip(plan.execution_plan[producer_stream].steps.iter().skip(1))
                    .find_map(|(step, next)| {
                        if matches!(step, ExecutionStep::LaunchKernel { node_index } if *node_index == producer) {
                            match next {
                                ExecutionStep::ActivateNotification { notification } => {
                                    Some(*notification)
                                }
                                _ => None,
                            }
                        } else {
                            None
                        }
                    });
                let notification = notification.expect("cross-stream producer must notify");
                prop_assert_eq!(plan.notification_owners[notification], producer_stream);
                let guarded = plan
                    .downstream_map
                    .get(&notification)
                    .map(|barriers| {
                        barriers
                            .iter()
                            .any(|&(stream, offset)| {
                                stream == consumer_stream && offset < launch_offset
                            })
                    })
                    .unwrap_or(false);
                prop_assert!(
                    guarded,
                    "edge n{producer}->n{consumer} lacks a preceding barrier"
                );
            }
        }
    }
}
