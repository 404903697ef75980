//! Names of pseudo-ops and reserved attributes understood by the lowering.
//! Regular ops are assumed to never use these names.

/// Attribute carrying the device string of an op.
pub const DEVICE_ATTR: &str = "__device";
/// Shapes of the tensors moved by a host transfer. Only kept in the graph for
/// infeed/outfeed ops.
pub const SHAPE_ARRAY_ATTR: &str = "__shapes";

/// Scalar to tensor promotion. Placed later, once the partitioner knows which
/// devices use the promoted value.
pub const SCALAR_TO_TENSOR: &str = "tfc.scalarToTensor";
pub const RECV_FROM_HOST: &str = "tfc.RecvFromHost";
pub const SEND_TO_HOST: &str = "tfc.SendToHost";
/// Device to device transfer halves, inserted by the partitioner.
pub const D2D_SEND: &str = "tfc.D2DTensorSend";
pub const D2D_RECV: &str = "tfc.D2DTensorRecv";

pub const CONFIGURE_CPU: &str = "tfc.configureCPU";
pub const CONFIGURE_GPU: &str = "tfc.configureGPU";
pub const CONFIGURE_TPU: &str = "tfc.configureTPU";

pub const TRANSFER_ID_ATTR: &str = "transferId";
pub const SRC_DEVICE_ATTR: &str = "srcDevice";
pub const DEST_DEVICE_ATTR: &str = "destDevice";
pub const TENSOR_ID_ATTR: &str = "tensorId";
pub const ENABLE_INFEED_ATTR: &str = "enableInfeed";

pub fn is_host_transfer(op: &str) -> bool {
    op == RECV_FROM_HOST || op == SEND_TO_HOST
}

/// Device configuration pseudo-ops. They are read once per function and never
/// placed, partitioned or lowered.
pub fn is_configuration(op: &str) -> bool {
    matches!(op, CONFIGURE_CPU | CONFIGURE_GPU | CONFIGURE_TPU)
}
