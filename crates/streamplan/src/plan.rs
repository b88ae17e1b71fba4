use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::graph::{NodeIndex, ValueIndex, ValueIndexMap, ValueType};
use crate::provider::{MemoryInfo, WaitNotificationFn};

/// Index of a cross-stream notification within one plan.
pub type NotificationIndex = usize;
/// Index of a logic stream within one plan.
pub type StreamIndex = usize;

/// How a value's backing storage is obtained at run time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocKind {
    #[default]
    NotSet,
    /// Fresh buffer allocated when the producer runs.
    Allocate,
    /// Constant initializer, allocated once at session load.
    AllocateStatically,
    /// Caller-supplied buffer (graph input or outer-scope value).
    PreExisting,
    /// Shares the buffer of another value.
    Reuse,
    /// Graph output; allocated fresh and never reused by intermediates.
    AllocateOutput,
    /// Identity pass-through of a pre-existing value.
    Share,
    /// Storage owned outside the planner by the producing kernel.
    AllocatedExternally,
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AllocKind::NotSet => "NotSet",
            AllocKind::Allocate => "Allocate",
            AllocKind::AllocateStatically => "AllocateStatically",
            AllocKind::PreExisting => "PreExisting",
            AllocKind::Reuse => "Reuse",
            AllocKind::AllocateOutput => "AllocateOutput",
            AllocKind::Share => "Share",
            AllocKind::AllocatedExternally => "AllocatedExternally",
        };
        f.write_str(text)
    }
}

/// Allocation decision for one value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocPlanPerValue {
    pub alloc_kind: AllocKind,
    /// Root buffer this value reuses; set exactly when `alloc_kind` is
    /// `Reuse` or `Share`.
    pub reused_buffer: Option<ValueIndex>,
    pub location: Option<MemoryInfo>,
    pub value_type: Option<ValueType>,
    /// The buffer holds a strided view rather than contiguous data.
    #[cfg(feature = "training")]
    pub is_strided_tensor: bool,
}

/// One step of a logic stream's program.
#[derive(Clone)]
pub enum ExecutionStep {
    /// Two-party rendezvous: the consumer stream and the producer's trigger
    /// each arrive once; the second arrival releases the stream.
    Barrier { barrier_id: usize },
    /// Device-level wait on a notification, using the handle registered for
    /// the (producer, consumer) provider pair. The waiting stream adopts the
    /// notification's clock.
    WaitOnEp {
        notification: NotificationIndex,
        wait_fn: WaitNotificationFn,
    },
    LaunchKernel { node_index: NodeIndex },
    /// Signals the notification owned by this stream; one-shot.
    ActivateNotification { notification: NotificationIndex },
    /// Schedules the consumer-side barriers recorded in the downstream map.
    TriggerDownstream { notification: NotificationIndex },
}

impl ExecutionStep {
    pub fn dump(&self) -> String {
        match self {
            ExecutionStep::Barrier { barrier_id } => {
                format!("Set a barrier with id: {barrier_id}, count: 2.")
            }
            ExecutionStep::WaitOnEp { notification, .. } => {
                format!("Wait on notification with id: {notification}.")
            }
            ExecutionStep::LaunchKernel { node_index } => {
                format!("Launch kernel with node id: {node_index}.")
            }
            ExecutionStep::ActivateNotification { notification } => {
                format!("Activate notification with id: {notification}.")
            }
            ExecutionStep::TriggerDownstream { notification } => {
                format!("Trigger downstream of notification: {notification}.")
            }
        }
    }
}

// The wait handle is not `Debug`; the dump string covers every variant.
impl fmt::Debug for ExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())
    }
}

/// Ordered program for one worker, bound to a single execution provider.
#[derive(Debug, Clone, Default)]
pub struct LogicStream {
    pub provider: String,
    pub steps: Vec<ExecutionStep>,
}

/// Decrement target for deterministic buffer release: when `ref_count`
/// reaches zero the runtime frees the buffer behind `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAction {
    pub value: ValueIndex,
    pub ref_count: usize,
}

/// The planner's output: allocation decisions, per-stream step programs,
/// synchronization bookkeeping, and the deallocation schedule.
#[derive(Debug, Default)]
pub struct SequentialExecutionPlan {
    pub allocation_plan: Vec<AllocPlanPerValue>,
    pub execution_plan: Vec<LogicStream>,
    /// Owning stream per notification.
    pub notification_owners: Vec<StreamIndex>,
    pub num_barriers: usize,
    /// Per notification: the `(stream, step offset)` of every barrier its
    /// trigger step releases.
    pub downstream_map: HashMap<NotificationIndex, Vec<(StreamIndex, usize)>>,
    pub release_actions: Vec<ReleaseAction>,
    /// Per node: indices into `release_actions` it decrements on completion.
    pub node_release_list: Vec<Vec<usize>>,
    pub value_to_stream_map: HashMap<ValueIndex, StreamIndex>,
    /// Initializer roots that must be allocated contiguously, in order.
    #[cfg(feature = "training")]
    pub initializer_allocation_order: Vec<ValueIndex>,
    /// Activation roots that must be allocated contiguously, in order.
    #[cfg(feature = "training")]
    pub activation_allocation_order: Vec<ValueIndex>,
}

impl SequentialExecutionPlan {
    pub fn set_location(&mut self, value: ValueIndex, location: MemoryInfo) {
        if let Some(entry) = self.allocation_plan.get_mut(value) {
            entry.location = Some(location);
        }
    }

    /// Human-readable listing of the full plan.
    pub fn dump(&self, value_map: &ValueIndexMap) -> String {
        let mut out = String::new();
        out.push_str("Allocation Plan:\n");
        out.push_str("(value_idx) name : <allocation plan>\n");
        for (index, name) in value_map.iter() {
            let _ = write!(out, "({index}) {name} : ");
            match self.allocation_plan.get(index) {
                Some(entry) => {
                    let _ = write!(out, "{}", entry.alloc_kind);
                    if let (AllocKind::Reuse | AllocKind::Share, Some(reused)) =
                        (entry.alloc_kind, entry.reused_buffer)
                    {
                        let _ = write!(out, " {reused}");
                    }
                    match &entry.location {
                        Some(location) => {
                            let _ = write!(out, ", {location}");
                        }
                        None => out.push_str(", <no location>"),
                    }
                }
                None => out.push_str("index out of range"),
            }
            out.push('\n');
        }
        out.push_str("\nExecution Plan:\n");
        for (stream_index, stream) in self.execution_plan.iter().enumerate() {
            let _ = writeln!(
                out,
                "Start logic stream: {stream_index} on execution provider: {}",
                stream.provider
            );
            for step in &stream.steps {
                let _ = writeln!(out, "  {}", step.dump());
            }
            let _ = writeln!(out, "End logic stream: {stream_index}");
        }
        out
    }
}
