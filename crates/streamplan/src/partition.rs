//! Stream partitioning: groups nodes into logic streams, one or more per
//! execution provider, driven by an optional configuration file.
//!
//! Configuration format:
//!
//! ```text
//! DevicePartition
//! ExecutionProviders:2
//! CpuExecutionProvider:1
//! CudaExecutionProvider:1
//! a,b,c
//! d,e
//! ```
//!
//! The first line names the partitioner variant, the second the number of
//! providers, followed by one `<provider>:<stream count>` line per provider
//! and one comma-separated node-name line per stream. When the file is
//! absent or empty the partitioner infers one stream per provider and writes
//! the inferred configuration back when dropped.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::warn;

use crate::graph::{ExecutionOrder, GraphViewer, Node, NodeIndex};

pub const DEVICE_PARTITION_NAME: &str = "DevicePartition";

/// Partitioner variants selected by the configuration header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionerKind {
    Device,
}

static PARTITIONER_KINDS: Lazy<HashMap<&'static str, PartitionerKind>> =
    Lazy::new(|| HashMap::from([(DEVICE_PARTITION_NAME, PartitionerKind::Device)]));

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("unknown partitioner name {name:?} in configuration header")]
    UnknownPartitioner { name: String },
    #[error("configuration must declare providers as ExecutionProviders:<count>, got {line:?}")]
    BadProviderHeader { line: String },
    #[error("provider count must be positive")]
    NonPositiveProviderCount,
    #[error("bad provider stream setting {line:?}, expected <provider>:<count>")]
    BadProviderLine { line: String },
    #[error("stream count for provider {provider} must be positive")]
    NonPositiveStreamCount { provider: String },
    #[error("configuration contains an empty stream line")]
    EmptyStreamLine,
    #[error("configuration declares {declared} streams but lists {listed} node lines")]
    StreamCountMismatch { declared: usize, listed: usize },
    #[error("node {name} from the configuration does not match any graph node")]
    UnknownNode { name: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Groups graph nodes into logic streams.
pub trait NodePartitioner: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Ordered node indices per stream. Streams for one provider are
    /// contiguous; every graph node appears in exactly one stream.
    fn partition(
        &mut self,
        graph: &GraphViewer<'_>,
    ) -> Result<Vec<Vec<NodeIndex>>, PartitionError>;
}

/// Creates the partitioner selected by the configuration file header, or the
/// device partitioner when no usable configuration exists.
pub fn create_partitioner(
    config_file: Option<&Path>,
) -> Result<Box<dyn NodePartitioner>, PartitionError> {
    let kind = match config_file {
        Some(path) if path.exists() => {
            let contents = fs::read_to_string(path)?;
            match contents.lines().next().map(str::trim) {
                None | Some("") => PartitionerKind::Device,
                Some(name) => *PARTITIONER_KINDS.get(name).ok_or_else(|| {
                    PartitionError::UnknownPartitioner {
                        name: name.to_string(),
                    }
                })?,
            }
        }
        _ => PartitionerKind::Device,
    };
    match kind {
        PartitionerKind::Device => Ok(Box::new(DevicePartitioner::from_config(config_file)?)),
    }
}

/// Default partitioner: honours an explicit stream layout from the
/// configuration file, otherwise one stream per distinct provider.
#[derive(Debug)]
pub struct DevicePartitioner {
    config_file: Option<PathBuf>,
    max_streams: BTreeMap<String, usize>,
    node_names_by_stream: Vec<Vec<String>>,
    need_dump: bool,
}

impl DevicePartitioner {
    pub fn from_config(config_file: Option<&Path>) -> Result<Self, PartitionError> {
        let mut partitioner = Self {
            config_file: config_file.map(Path::to_path_buf),
            max_streams: BTreeMap::new(),
            node_names_by_stream: Vec::new(),
            need_dump: false,
        };
        partitioner.load()?;
        Ok(partitioner)
    }

    fn load(&mut self) -> Result<(), PartitionError> {
        let Some(path) = self.config_file.as_deref() else {
            return Ok(());
        };
        if !path.exists() {
            self.need_dump = true;
            return Ok(());
        }
        let contents = fs::read_to_string(path)?;
        let mut lines = contents.lines();
        match lines.next().map(str::trim) {
            None | Some("") => {
                self.need_dump = true;
                return Ok(());
            }
            Some(DEVICE_PARTITION_NAME) => {}
            Some(name) => {
                return Err(PartitionError::UnknownPartitioner {
                    name: name.to_string(),
                })
            }
        }
        let Some(provider_header) = lines.next() else {
            // Name-only file: infer the layout and write it back on drop.
            self.need_dump = true;
            return Ok(());
        };
        let provider_count = match provider_header.split_once(':') {
            Some(("ExecutionProviders", count)) => {
                count
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| PartitionError::BadProviderHeader {
                        line: provider_header.to_string(),
                    })?
            }
            _ => {
                return Err(PartitionError::BadProviderHeader {
                    line: provider_header.to_string(),
                })
            }
        };
        if provider_count <= 0 {
            return Err(PartitionError::NonPositiveProviderCount);
        }
        let mut declared_streams = 0usize;
        for _ in 0..provider_count {
            let line = lines.next().ok_or(PartitionError::BadProviderLine {
                line: String::new(),
            })?;
            let (provider, count) =
                line.split_once(':')
                    .ok_or_else(|| PartitionError::BadProviderLine {
                        line: line.to_string(),
                    })?;
            let count: i64 =
                count
                    .trim()
                    .parse()
                    .map_err(|_| PartitionError::BadProviderLine {
                        line: line.to_string(),
                    })?;
            if count <= 0 {
                return Err(PartitionError::NonPositiveStreamCount {
                    provider: provider.to_string(),
                });
            }
            self.max_streams.insert(provider.to_string(), count as usize);
            declared_streams += count as usize;
        }
        for line in lines {
            let names: Vec<String> = line.split(',').map(str::to_string).collect();
            if names.iter().all(|n| n.trim().is_empty()) {
                return Err(PartitionError::EmptyStreamLine);
            }
            self.node_names_by_stream.push(names);
        }
        if self.node_names_by_stream.len() != declared_streams {
            return Err(PartitionError::StreamCountMismatch {
                declared: declared_streams,
                listed: self.node_names_by_stream.len(),
            });
        }
        Ok(())
    }

    fn dump(&self) -> std::io::Result<()> {
        let Some(path) = self.config_file.as_deref() else {
            return Ok(());
        };
        let mut file = fs::File::create(path)?;
        writeln!(file, "{DEVICE_PARTITION_NAME}")?;
        writeln!(file, "ExecutionProviders:{}", self.max_streams.len())?;
        for (provider, count) in &self.max_streams {
            writeln!(file, "{provider}:{count}")?;
        }
        for names in &self.node_names_by_stream {
            writeln!(file, "{}", names.join(","))?;
        }
        Ok(())
    }
}

/// Unnamed nodes are addressed as `<OpType><k>` where `k` counts prior
/// occurrences of the op type in topological order.
fn resolved_name(node: &Node, op_type_counter: &mut HashMap<String, usize>) -> String {
    if node.name.is_empty() {
        let counter = op_type_counter.entry(node.op_type.clone()).or_insert(0);
        let name = format!("{}{}", node.op_type, *counter);
        *counter += 1;
        name
    } else {
        node.name.clone()
    }
}

impl NodePartitioner for DevicePartitioner {
    fn name(&self) -> &'static str {
        DEVICE_PARTITION_NAME
    }

    fn partition(
        &mut self,
        graph: &GraphViewer<'_>,
    ) -> Result<Vec<Vec<NodeIndex>>, PartitionError> {
        let order = graph.nodes_in_topological_order(ExecutionOrder::Default);

        if self.max_streams.is_empty() && self.node_names_by_stream.is_empty() {
            let mut op_type_counter: HashMap<String, usize> = HashMap::new();
            let mut provider_to_stream: HashMap<&str, usize> = HashMap::new();
            for &node_index in order {
                let node = &graph.graph().nodes()[node_index];
                self.max_streams.entry(node.provider.clone()).or_insert(1);
                let stream = *provider_to_stream
                    .entry(node.provider.as_str())
                    .or_insert_with(|| {
                        self.node_names_by_stream.push(Vec::new());
                        self.node_names_by_stream.len() - 1
                    });
                self.node_names_by_stream[stream].push(resolved_name(node, &mut op_type_counter));
            }
        }

        let mut node_stream_map: HashMap<&str, usize> = HashMap::new();
        for (stream, names) in self.node_names_by_stream.iter().enumerate() {
            for name in names {
                node_stream_map.insert(name.as_str(), stream);
            }
        }

        let mut op_type_counter: HashMap<String, usize> = HashMap::new();
        let mut stream_nodes = vec![Vec::new(); self.node_names_by_stream.len()];
        for &node_index in order {
            let node = &graph.graph().nodes()[node_index];
            let name = resolved_name(node, &mut op_type_counter);
            let stream = *node_stream_map
                .get(name.as_str())
                .ok_or(PartitionError::UnknownNode { name })?;
            stream_nodes[stream].push(node_index);
        }
        Ok(stream_nodes)
    }
}

impl Drop for DevicePartitioner {
    fn drop(&mut self) {
        if self.need_dump {
            if let Err(error) = self.dump() {
                warn!(
                    config = ?self.config_file,
                    %error,
                    "failed to dump inferred stream partition"
                );
            }
        }
    }
}
