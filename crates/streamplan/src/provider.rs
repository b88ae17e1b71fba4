use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Memory class of a kernel argument. `CpuInput`/`CpuOutput` arguments live
/// in host memory even when the kernel runs on an accelerator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum MemType {
    CpuInput,
    CpuOutput,
    #[default]
    Default,
}

/// Identifies a device memory region an allocator serves.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct MemoryInfo {
    pub name: String,
    pub device_id: u32,
    pub mem_type: MemType,
}

impl MemoryInfo {
    pub fn new(name: impl Into<String>, device_id: u32, mem_type: MemType) -> Self {
        Self {
            name: name.into(),
            device_id,
            mem_type,
        }
    }

    /// The host CPU allocator.
    pub fn cpu() -> Self {
        Self::new("Cpu", 0, MemType::Default)
    }
}

impl fmt::Display for MemoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} device:{} memtype:{:?}",
            self.name, self.device_id, self.mem_type
        )
    }
}

/// A backend device/runtime that owns kernels and allocators. The planner
/// only consults its type name and per-[`MemType`] allocator locations.
#[derive(Debug, Clone)]
pub struct ExecutionProvider {
    provider_type: String,
    allocators: BTreeMap<MemType, MemoryInfo>,
}

impl ExecutionProvider {
    pub fn new(provider_type: impl Into<String>, default_location: MemoryInfo) -> Self {
        let mut allocators = BTreeMap::new();
        allocators.insert(MemType::Default, default_location);
        Self {
            provider_type: provider_type.into(),
            allocators,
        }
    }

    pub fn with_allocator(mut self, mem_type: MemType, location: MemoryInfo) -> Self {
        self.allocators.insert(mem_type, location);
        self
    }

    pub fn provider_type(&self) -> &str {
        &self.provider_type
    }

    /// Location the provider's allocator reports for `mem_type`. CPU-bound
    /// argument classes fall back to host memory when not overridden.
    pub fn memory_info(&self, mem_type: MemType) -> MemoryInfo {
        if let Some(info) = self.allocators.get(&mem_type) {
            return info.clone();
        }
        match mem_type {
            MemType::CpuInput | MemType::CpuOutput => MemoryInfo::cpu(),
            MemType::Default => self
                .allocators
                .get(&MemType::Default)
                .cloned()
                .unwrap_or_else(MemoryInfo::cpu),
        }
    }
}

/// Registry of the providers participating in one session.
#[derive(Debug, Clone, Default)]
pub struct ExecutionProviders {
    providers: Vec<ExecutionProvider>,
    by_type: HashMap<String, usize>,
}

impl ExecutionProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: ExecutionProvider) -> &mut Self {
        let key = provider.provider_type().to_string();
        self.by_type.insert(key, self.providers.len());
        self.providers.push(provider);
        self
    }

    pub fn get(&self, provider_type: &str) -> Option<&ExecutionProvider> {
        self.by_type
            .get(provider_type)
            .and_then(|&i| self.providers.get(i))
    }

    pub fn default_cpu_memory_info(&self) -> MemoryInfo {
        MemoryInfo::cpu()
    }
}

/// Runtime hook a consumer stream invokes to wait on a producer stream's
/// notification; arguments are `(stream_index, notification_index)`.
pub type WaitNotificationFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Registers cross-provider wait handles. Absence of a handle means the
/// barrier alone orders the two streams.
#[derive(Default)]
pub struct StreamHandleRegistry {
    handles: HashMap<(String, String), WaitNotificationFn>,
}

impl StreamHandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_wait_handle(
        &mut self,
        producer_type: impl Into<String>,
        consumer_type: impl Into<String>,
        handle: WaitNotificationFn,
    ) -> &mut Self {
        self.handles
            .insert((producer_type.into(), consumer_type.into()), handle);
        self
    }

    pub fn wait_handle(
        &self,
        producer_type: &str,
        consumer_type: &str,
    ) -> Option<WaitNotificationFn> {
        self.handles
            .get(&(producer_type.to_string(), consumer_type.to_string()))
            .cloned()
    }
}

impl fmt::Debug for StreamHandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandleRegistry")
            .field("handles", &self.handles.keys().collect::<Vec<_>>())
            .finish()
    }
}
