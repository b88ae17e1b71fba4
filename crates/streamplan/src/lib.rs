//! Allocation and execution planning for stream-partitioned dataflow
//! inference graphs.
//!
//! Given a frozen computation graph, a node-to-provider assignment, and
//! per-kernel aliasing metadata, [`planner::create_plan`] partitions the
//! nodes into logic streams, decides how every value's storage is obtained
//! (fresh allocation, reuse of a dead buffer, aliasing, static or
//! caller-owned storage), inserts the barriers and notifications that order
//! cross-stream edges, and schedules deterministic buffer release.
//!
//! The planner itself is offline and single-threaded; the
//! [`plan::SequentialExecutionPlan`] it emits is the read-only program a
//! multi-worker executor runs without further coordination.

pub mod context;
pub mod graph;
pub mod kernel;
pub mod partition;
pub mod plan;
pub mod planner;
pub mod provider;

pub use context::{PlannerContext, SequentialPlannerContext};
pub use graph::{
    DType, DimSymbol, Dimension, ExecutionOrder, Graph, GraphBuilder, GraphError, GraphViewer,
    Node, NodeIndex, Shape, TensorSpec, ValueDef, ValueIndex, ValueIndexMap, ValueType,
};
pub use kernel::{nested_subgraph_key, KernelDef, KernelInfoMap, SubgraphKernelInfoMaps};
pub use partition::{create_partitioner, NodePartitioner, PartitionError, PartitionerKind};
pub use plan::{
    AllocKind, AllocPlanPerValue, ExecutionStep, LogicStream, NotificationIndex, ReleaseAction,
    SequentialExecutionPlan, StreamIndex,
};
pub use planner::{create_plan, PlanError, PlanRequest};
pub use provider::{
    ExecutionProvider, ExecutionProviders, MemType, MemoryInfo, StreamHandleRegistry,
    WaitNotificationFn,
};
