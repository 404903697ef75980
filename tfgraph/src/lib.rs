//! Lowering of tensor operations embedded in a host SSA function to a
//! device-partitioned dataflow graph.
//!
//! The passes run in order:
//! 1. [`config::DeviceConfiguration::for_function`] reads the device setup.
//! 2. [`classifier::canonicalize`] decodes each tensor op, unfolds its array
//!    operands and resolves its device.
//! 3. [`lowering::lower_tf_graph`] partitions the function per device and
//!    turns every device function into a graph function.
//! 4. [`assembly::GraphAssembler`] closes the entry graph over its callees,
//!    ready to be encoded by a [`assembly::GraphCodec`].
//!
//! [`pipeline::lower_program`] chains all of them for a whole program.

pub mod assembly;
pub mod classifier;
pub mod config;
pub mod device;
pub mod error;
pub mod ir;
pub mod lowering;
pub mod ops;
pub mod partition;
pub mod pipeline;

pub use assembly::{GraphAssembler, GraphAssembly, GraphCodec, JsonCodec, MsgPackCodec, copy_graph_functions, serialize_graph};
pub use config::DeviceConfiguration;
pub use device::DeviceType;
pub use error::{Diagnostic, GraphError};
pub use lowering::{GraphFunctionPool, LoweredGraphFunction, lower_tf_function, lower_tf_graph};
pub use pipeline::{PipelineOptions, lower_program};
