use crate::graph::{ExecutionOrder, Shape, ValueDef, ValueType};

/// Session knobs the planner consults while building a plan. The default
/// shape lookup reads the static shape recorded on the value definition;
/// sessions with richer shape inference can override it.
pub trait PlannerContext {
    fn shape<'a>(&'a self, value: &'a ValueDef) -> Option<&'a Shape> {
        match &value.value_type {
            ValueType::Tensor(spec) => Some(&spec.shape),
            ValueType::Sequence(_) => None,
        }
    }

    fn enable_memory_reuse(&self) -> bool {
        true
    }

    fn parallel_execution_enabled(&self) -> bool {
        false
    }

    fn execution_order(&self) -> ExecutionOrder {
        ExecutionOrder::Default
    }
}

/// Context for ordinary sequential sessions.
#[derive(Debug, Clone)]
pub struct SequentialPlannerContext {
    pub enable_memory_reuse: bool,
    pub parallel_execution: bool,
    pub execution_order: ExecutionOrder,
}

impl Default for SequentialPlannerContext {
    fn default() -> Self {
        Self {
            enable_memory_reuse: true,
            parallel_execution: false,
            execution_order: ExecutionOrder::Default,
        }
    }
}

impl PlannerContext for SequentialPlannerContext {
    fn enable_memory_reuse(&self) -> bool {
        self.enable_memory_reuse
    }

    fn parallel_execution_enabled(&self) -> bool {
        self.parallel_execution
    }

    fn execution_order(&self) -> ExecutionOrder {
        self.execution_order
    }
}

/// Wraps a session context for the multi-stream baseline pass: shape lookup
/// and traversal order pass through, while reuse is suppressed so every
/// non-aliased output starts out freshly allocated.
pub(crate) struct ParallelPlannerContext<'a> {
    base: &'a dyn PlannerContext,
}

impl<'a> ParallelPlannerContext<'a> {
    pub(crate) fn new(base: &'a dyn PlannerContext) -> Self {
        Self { base }
    }
}

impl PlannerContext for ParallelPlannerContext<'_> {
    fn shape<'a>(&'a self, value: &'a ValueDef) -> Option<&'a Shape> {
        self.base.shape(value)
    }

    fn enable_memory_reuse(&self) -> bool {
        false
    }

    fn parallel_execution_enabled(&self) -> bool {
        true
    }

    fn execution_order(&self) -> ExecutionOrder {
        self.base.execution_order()
    }
}
