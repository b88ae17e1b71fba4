use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::graph::NodeIndex;
use crate::provider::MemType;

/// Per-kernel planning contracts reported by the kernel registry.
///
/// `alias` pairs are mandatory: output `j` must share storage with input `i`.
/// `may_inplace` pairs are permissions the planner may take when the input is
/// at its last use and the sizes match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelDef {
    /// `(input, output)` pairs that must alias.
    pub alias: Vec<(usize, usize)>,
    /// `(input_offset, output_offset)`: output `k` must alias input
    /// `k - output_offset + input_offset`.
    pub variadic_alias: Option<(usize, usize)>,
    /// `(input, output)` pairs that may be computed in place.
    pub may_inplace: Vec<(usize, usize)>,
    /// Output storage is owned outside the planner.
    pub external_outputs: bool,
    /// Memory type per input index; unlisted inputs use [`MemType::Default`].
    pub input_mem_types: HashMap<usize, MemType>,
    /// Memory type per output index; unlisted outputs use [`MemType::Default`].
    pub output_mem_types: HashMap<usize, MemType>,
    /// `(input, output)` pairs where the output may be a strided view of the
    /// input when every consumer accepts one.
    #[cfg(feature = "training")]
    pub may_strided_output: Vec<(usize, usize)>,
    /// Input positions that accept strided tensors.
    #[cfg(feature = "training")]
    pub may_strided_input: Vec<usize>,
    /// Inputs must be laid out contiguously in one arena.
    #[cfg(feature = "training")]
    pub allocate_inputs_contiguously: bool,
}

impl KernelDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alias(mut self, input: usize, output: usize) -> Self {
        self.alias.push((input, output));
        self
    }

    pub fn with_variadic_alias(mut self, input_offset: usize, output_offset: usize) -> Self {
        self.variadic_alias = Some((input_offset, output_offset));
        self
    }

    pub fn with_may_inplace(mut self, input: usize, output: usize) -> Self {
        self.may_inplace.push((input, output));
        self
    }

    pub fn with_external_outputs(mut self) -> Self {
        self.external_outputs = true;
        self
    }

    pub fn with_input_mem_type(mut self, input: usize, mem_type: MemType) -> Self {
        self.input_mem_types.insert(input, mem_type);
        self
    }

    pub fn with_output_mem_type(mut self, output: usize, mem_type: MemType) -> Self {
        self.output_mem_types.insert(output, mem_type);
        self
    }

    #[cfg(feature = "training")]
    pub fn with_may_strided_output(mut self, input: usize, output: usize) -> Self {
        self.may_strided_output.push((input, output));
        self
    }

    #[cfg(feature = "training")]
    pub fn with_may_strided_input(mut self, input: usize) -> Self {
        self.may_strided_input.push(input);
        self
    }

    #[cfg(feature = "training")]
    pub fn with_allocate_inputs_contiguously(mut self) -> Self {
        self.allocate_inputs_contiguously = true;
        self
    }

    pub fn input_mem_type(&self, input: usize) -> MemType {
        self.input_mem_types
            .get(&input)
            .copied()
            .unwrap_or(MemType::Default)
    }

    pub fn output_mem_type(&self, output: usize) -> MemType {
        self.output_mem_types
            .get(&output)
            .copied()
            .unwrap_or(MemType::Default)
    }
}

/// Kernel metadata per node of one graph.
pub type KernelInfoMap = HashMap<NodeIndex, KernelDef>;

/// Kernel metadata for nested subgraphs, keyed by [`nested_subgraph_key`].
pub type SubgraphKernelInfoMaps = HashMap<String, KernelInfoMap>;

/// Composes the lookup key identifying a nested subgraph relative to the
/// graph level `base` was built for: base, depth, node index, and attribute
/// name concatenated without separators.
pub fn nested_subgraph_key(
    base: &str,
    graph_depth: usize,
    node_index: NodeIndex,
    attr_name: &str,
) -> String {
    format!("{base}{graph_depth}{node_index}{attr_name}")
}
