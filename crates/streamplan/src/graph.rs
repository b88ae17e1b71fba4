use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// Index of a node within its graph's node table.
pub type NodeIndex = usize;
/// Dense index of a value assigned by a [`ValueIndexMap`].
pub type ValueIndex = usize;

/// Enumerates scalar element types carried by tensor-typed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F16,
    Bf16,
    F32,
    F64,
    /// String tensors need placement-new semantics and never share storage.
    Str,
}

impl DType {
    /// Returns the storage size in bytes when it is well-defined.
    pub fn size_in_bytes(self) -> Option<usize> {
        match self {
            DType::Bool | DType::I8 | DType::U8 => Some(1),
            DType::I16 | DType::U16 | DType::F16 | DType::Bf16 => Some(2),
            DType::I32 | DType::U32 | DType::F32 => Some(4),
            DType::I64 | DType::U64 | DType::F64 => Some(8),
            DType::Str => None,
        }
    }

    pub fn is_string(self) -> bool {
        matches!(self, DType::Str)
    }
}

/// Names a symbolic dynamic dimension (e.g. `batch`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// Represents a single axis extent in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Symbolic(DimSymbol),
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Convenience constructor for fully static shapes.
    pub fn of_static(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().copied().map(Dimension::Static).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dimension::Static(value) => dims.push(*value),
                Dimension::Symbolic(_) => return None,
            }
        }
        Some(dims)
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }

    /// Rank-wise shape match: every dimension equal by known value, or by the
    /// same non-empty symbolic name. Any other combination differs.
    pub fn matches(&self, other: &Shape) -> bool {
        if self.rank() != other.rank() {
            return false;
        }
        self.dims.iter().zip(other.dims.iter()).all(|(a, b)| match (a, b) {
            (Dimension::Static(x), Dimension::Static(y)) => x == y,
            (Dimension::Symbolic(x), Dimension::Symbolic(y)) => {
                !x.as_str().is_empty() && x.as_str() == y.as_str()
            }
            _ => false,
        })
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    /// Returns total byte length when shape is static and dtype size is known.
    pub fn byte_len(&self) -> Option<usize> {
        let elem_count = self.shape.element_count()?;
        let elem_size = self.dtype.size_in_bytes()?;
        elem_count.checked_mul(elem_size)
    }
}

/// Type of a named edge in the graph. Sequences hold tensors but do not have
/// a flat buffer of their own, so they are non-tensors for planning purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorSpec),
    Sequence(TensorSpec),
}

impl ValueType {
    pub fn is_tensor(&self) -> bool {
        matches!(self, ValueType::Tensor(_))
    }

    pub fn tensor_spec(&self) -> Option<&TensorSpec> {
        match self {
            ValueType::Tensor(spec) => Some(spec),
            ValueType::Sequence(_) => None,
        }
    }
}

/// A named tensor-typed edge of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueDef {
    pub name: String,
    pub value_type: ValueType,
}

impl ValueDef {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }
}

/// An operator node. Optional arguments are `None`; implicit inputs are
/// values captured from the enclosing scope by nested subgraphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub provider: String,
    pub inputs: Vec<Option<String>>,
    pub implicit_inputs: Vec<String>,
    pub outputs: Vec<Option<String>>,
    pub subgraphs: BTreeMap<String, Graph>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        op_type: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            provider: provider.into(),
            inputs: Vec::new(),
            implicit_inputs: Vec::new(),
            outputs: Vec::new(),
            subgraphs: BTreeMap::new(),
        }
    }

    pub fn with_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = names.into_iter().map(|n| Some(n.into())).collect();
        self
    }

    /// Appends a missing optional input slot.
    pub fn with_missing_input(mut self) -> Self {
        self.inputs.push(None);
        self
    }

    pub fn with_implicit_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.implicit_inputs = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = names.into_iter().map(|n| Some(n.into())).collect();
        self
    }

    pub fn with_subgraph(mut self, attr: impl Into<String>, subgraph: Graph) -> Self {
        self.subgraphs.insert(attr.into(), subgraph);
        self
    }

    pub fn existing_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|n| n.as_deref())
    }

    pub fn existing_outputs(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().filter_map(|n| n.as_deref())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("value {name} is produced by more than one node")]
    DuplicateProducer { name: String },
    #[error("value {name} is referenced but never declared")]
    UndeclaredValue { name: String },
    #[error("graph contains a cycle")]
    Cycle,
}

/// A frozen computation graph: nodes plus the value definitions they connect.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Node>,
    values: BTreeMap<String, ValueDef>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    initializers: Vec<String>,
}

impl Graph {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index)
    }

    /// Graph inputs excluding initializers.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn initializers(&self) -> &[String] {
        &self.initializers
    }

    pub fn inputs_including_initializers(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .map(String::as_str)
            .chain(self.initializers.iter().map(String::as_str))
    }

    pub fn value_def(&self, name: &str) -> Option<&ValueDef> {
        self.values.get(name)
    }
}

/// Builder for [`Graph`]. Every value a node produces must be declared with
/// its type before `finish`; node inputs may reference outer-scope names that
/// are not declared locally.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_value(&mut self, name: impl Into<String>, value_type: ValueType) -> &mut Self {
        let name = name.into();
        self.graph
            .values
            .insert(name.clone(), ValueDef::new(name, value_type));
        self
    }

    pub fn add_input(&mut self, name: impl Into<String>, value_type: ValueType) -> &mut Self {
        let name = name.into();
        self.graph.inputs.push(name.clone());
        self.add_value(name, value_type)
    }

    pub fn add_initializer(&mut self, name: impl Into<String>, spec: TensorSpec) -> &mut Self {
        let name = name.into();
        self.graph.initializers.push(name.clone());
        self.add_value(name, ValueType::Tensor(spec))
    }

    pub fn add_output(&mut self, name: impl Into<String>) -> &mut Self {
        self.graph.outputs.push(name.into());
        self
    }

    pub fn add_node(&mut self, node: Node) -> &mut Self {
        self.graph.nodes.push(node);
        self
    }

    pub fn finish(self) -> Result<Graph, GraphError> {
        let graph = self.graph;
        let mut produced: HashSet<&str> = HashSet::new();
        for node in &graph.nodes {
            for output in node.existing_outputs() {
                if !produced.insert(output) {
                    return Err(GraphError::DuplicateProducer {
                        name: output.to_string(),
                    });
                }
                if !graph.values.contains_key(output) {
                    return Err(GraphError::UndeclaredValue {
                        name: output.to_string(),
                    });
                }
            }
        }
        for output in &graph.outputs {
            if !graph.values.contains_key(output) {
                return Err(GraphError::UndeclaredValue {
                    name: output.clone(),
                });
            }
        }
        Ok(graph)
    }
}

/// Selects which topological order drives node traversal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionOrder {
    /// Deterministic Kahn order, smallest node index first.
    #[default]
    Default,
    /// Post-order depth-first from each node's producers; keeps producers
    /// adjacent to their first consumer.
    DepthFirst,
}

type AdjacencyList = SmallVec<[NodeIndex; 4]>;

/// Read-only view over a [`Graph`] with precomputed traversal orders and
/// producer/consumer adjacency.
#[derive(Debug)]
pub struct GraphViewer<'a> {
    graph: &'a Graph,
    topo_default: Vec<NodeIndex>,
    topo_depth_first: Vec<NodeIndex>,
    node_producers: Vec<AdjacencyList>,
    node_consumers: Vec<AdjacencyList>,
    value_producer: HashMap<&'a str, NodeIndex>,
}

impl<'a> GraphViewer<'a> {
    pub fn new(graph: &'a Graph) -> Result<Self, GraphError> {
        let num_nodes = graph.nodes.len();
        let mut value_producer: HashMap<&'a str, NodeIndex> = HashMap::new();
        for (index, node) in graph.nodes.iter().enumerate() {
            for output in node.outputs.iter().filter_map(|n| n.as_deref()) {
                value_producer.insert(output, index);
            }
        }

        let mut node_producers: Vec<AdjacencyList> = vec![AdjacencyList::new(); num_nodes];
        let mut node_consumers: Vec<AdjacencyList> = vec![AdjacencyList::new(); num_nodes];
        for (index, node) in graph.nodes.iter().enumerate() {
            let mut producers: AdjacencyList = node
                .existing_inputs()
                .chain(node.implicit_inputs.iter().map(String::as_str))
                .filter_map(|name| value_producer.get(name).copied())
                .collect();
            producers.sort_unstable();
            producers.dedup();
            for &producer in &producers {
                node_consumers[producer].push(index);
            }
            node_producers[index] = producers;
        }
        for consumers in &mut node_consumers {
            consumers.sort_unstable();
            consumers.dedup();
        }

        let topo_default = kahn_order(num_nodes, &node_producers, &node_consumers)?;
        let topo_depth_first = depth_first_order(num_nodes, &node_producers);

        Ok(Self {
            graph,
            topo_default,
            topo_depth_first,
            node_producers,
            node_consumers,
            value_producer,
        })
    }

    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    pub fn num_nodes(&self) -> usize {
        self.graph.nodes.len()
    }

    /// One past the largest valid node index.
    pub fn max_node_index(&self) -> usize {
        self.graph.nodes.len()
    }

    pub fn node(&self, index: NodeIndex) -> Option<&'a Node> {
        self.graph.nodes.get(index)
    }

    pub fn nodes_in_topological_order(&self, order: ExecutionOrder) -> &[NodeIndex] {
        match order {
            ExecutionOrder::Default => &self.topo_default,
            ExecutionOrder::DepthFirst => &self.topo_depth_first,
        }
    }

    /// Node producing `name`, when it is produced inside this graph.
    pub fn producer_of(&self, name: &str) -> Option<NodeIndex> {
        self.value_producer.get(name).copied()
    }

    /// Distinct nodes feeding this node's explicit or implicit inputs.
    pub fn producers_of_node(&self, index: NodeIndex) -> &[NodeIndex] {
        self.node_producers.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Distinct nodes consuming any output of this node.
    pub fn consumers_of_node(&self, index: NodeIndex) -> &[NodeIndex] {
        self.node_consumers.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn value_def(&self, name: &str) -> Option<&'a ValueDef> {
        self.graph.value_def(name)
    }
}

fn kahn_order(
    num_nodes: usize,
    node_producers: &[AdjacencyList],
    node_consumers: &[AdjacencyList],
) -> Result<Vec<NodeIndex>, GraphError> {
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    let mut indegree: Vec<usize> = node_producers.iter().map(|p| p.len()).collect();
    let mut ready: BinaryHeap<Reverse<NodeIndex>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(num_nodes);
    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for &consumer in &node_consumers[index] {
            indegree[consumer] -= 1;
            if indegree[consumer] == 0 {
                ready.push(Reverse(consumer));
            }
        }
    }
    if order.len() != num_nodes {
        return Err(GraphError::Cycle);
    }
    Ok(order)
}

fn depth_first_order(num_nodes: usize, node_producers: &[AdjacencyList]) -> Vec<NodeIndex> {
    let mut visited = vec![false; num_nodes];
    let mut order = Vec::with_capacity(num_nodes);
    for start in 0..num_nodes {
        // Iterative post-order: producers first, then the node itself.
        let mut stack: Vec<(NodeIndex, bool)> = vec![(start, false)];
        while let Some((index, expanded)) = stack.pop() {
            if expanded {
                order.push(index);
                continue;
            }
            if visited[index] {
                continue;
            }
            visited[index] = true;
            stack.push((index, true));
            for &producer in node_producers[index].iter().rev() {
                if !visited[producer] {
                    stack.push((producer, false));
                }
            }
        }
    }
    order
}

/// Dense name→index table shared by the planner and its callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueIndexMap {
    indices: HashMap<String, ValueIndex>,
    names: Vec<String>,
}

impl ValueIndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the table for a graph: inputs, initializers, and outer-scope
    /// args first, then every node argument in topological order.
    pub fn from_graph(viewer: &GraphViewer<'_>, outer_scope_args: &[ValueDef]) -> Self {
        let mut map = Self::new();
        let graph = viewer.graph();
        for name in graph.inputs() {
            map.add(name);
        }
        for name in graph.initializers() {
            map.add(name);
        }
        for arg in outer_scope_args {
            map.add(&arg.name);
        }
        for &node_index in viewer.nodes_in_topological_order(ExecutionOrder::Default) {
            let node = &graph.nodes()[node_index];
            for name in node.existing_inputs() {
                map.add(name);
            }
            for name in &node.implicit_inputs {
                map.add(name);
            }
            for name in node.existing_outputs() {
                map.add(name);
            }
        }
        map
    }

    pub fn add(&mut self, name: &str) -> ValueIndex {
        if let Some(&index) = self.indices.get(name) {
            return index;
        }
        let index = self.names.len();
        self.names.push(name.to_string());
        self.indices.insert(name.to_string(), index);
        index
    }

    pub fn index_of(&self, name: &str) -> Option<ValueIndex> {
        self.indices.get(name).copied()
    }

    pub fn name_of(&self, index: ValueIndex) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValueIndex, &str)> {
        self.names.iter().enumerate().map(|(i, n)| (i, n.as_str()))
    }
}
