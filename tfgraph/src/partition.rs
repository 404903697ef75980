//! Splitting a placed function into one function per device.
//!
//! Every tensor op is moved to the function of its device. A tensor crossing
//! devices goes through a `tfc.D2DTensorSend` in the producing function and a
//! `tfc.D2DTensorRecv` in the consuming one, paired by a transfer id. A value
//! is received at most once per device, however many ops consume it there.

use crate::{
    classifier::{OpBuilder, OperandRole, OperationDescriptor},
    config::DeviceConfiguration,
    device::DeviceType,
    error::GraphError,
    ir::{DataType, Function, InstId, InstKind, Location, ValueId, ValueType},
    lowering::LoweringError,
    ops::{
        D2D_RECV, D2D_SEND, DEST_DEVICE_ATTR, DEVICE_ATTR, SCALAR_TO_TENSOR, SHAPE_ARRAY_ATTR, SRC_DEVICE_ATTR,
        TRANSFER_ID_ATTR, is_configuration,
    },
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, instrument, trace, warn};

/// One value moved between two device functions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEdge {
    pub transfer_id: u32,
    /// The value in the partitioned function.
    pub value: ValueId,
    pub src: DeviceType,
    pub dest: DeviceType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PartitionedFunction {
    pub device: DeviceType,
    pub function: Function,
}

/// Result of partitioning: one function per device, primary device first.
#[derive(Clone, Debug)]
pub struct Partition {
    functions: Vec<PartitionedFunction>,
    transfers: Vec<TransferEdge>,
}

impl Partition {
    pub fn devices(&self) -> impl Iterator<Item = DeviceType> + '_ {
        self.functions.iter().map(|f| f.device)
    }

    pub fn extract_function_for_device(&self, device: DeviceType) -> Option<&Function> {
        self.functions
            .iter()
            .find(|f| f.device == device)
            .map(|f| &f.function)
    }

    pub fn primary(&self) -> &PartitionedFunction {
        &self.functions[0]
    }

    pub fn transfers(&self) -> &[TransferEdge] {
        &self.transfers
    }

    pub fn into_functions(self) -> Vec<PartitionedFunction> {
        self.functions
    }
}

/// Where the result of a source instruction lives.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Home {
    Device(DeviceType),
    /// Replicated on every device function.
    Everywhere,
}

pub struct DevicePartitioner<'a> {
    src: &'a Function,
    config: &'a DeviceConfiguration,
    functions: Vec<PartitionedFunction>,
    /// Per device function, source value to local value.
    value_maps: Vec<HashMap<ValueId, ValueId>>,
    homes: HashMap<ValueId, Home>,
    transfers: Vec<TransferEdge>,
    next_transfer_id: u32,
}

impl<'a> DevicePartitioner<'a> {
    pub fn new(src: &'a Function, config: &'a DeviceConfiguration) -> Self {
        let mut partitioner = Self {
            src,
            config,
            functions: Vec::new(),
            value_maps: Vec::new(),
            homes: HashMap::new(),
            transfers: Vec::new(),
            next_transfer_id: 0,
        };
        for device in config.used_devices() {
            partitioner.function_index(*device);
        }
        partitioner
    }

    #[instrument(level = "debug", skip(self), fields(func = %self.src.name))]
    pub fn partition(mut self) -> Result<Partition, GraphError> {
        let src = self.src;
        let primary = self.config.primary_device();
        let mut returned = false;
        for inst in src.iter() {
            match src.kind(inst) {
                InstKind::Param { .. } => {
                    let local = self.append(primary, src.kind(inst).clone(), src.loc(inst).clone());
                    self.record(primary, inst, local);
                    self.homes.insert(inst, Home::Device(primary));
                }
                InstKind::Return { values } => {
                    let loc = src.loc(inst).clone();
                    let values = values
                        .iter()
                        .map(|v| self.operand_on(*v, primary, &loc))
                        .collect::<Result<Vec<_>, _>>()?;
                    self.append(primary, InstKind::Return { values }, loc);
                    returned = true;
                }
                // Releases only matter to the host program.
                InstKind::Destroy { .. } => {}
                kind if kind.tensor_op_name().is_some_and(is_configuration) => {}
                kind if kind.is_rematerializable() => {}
                _ => self.place_op(inst)?,
            }
        }
        let index = self.function_index(primary);
        for (i, partitioned) in self.functions.iter_mut().enumerate() {
            if i != index || !returned {
                partitioned
                    .function
                    .append(InstKind::Return { values: vec![] }, Location::unknown());
            }
        }
        debug!(
            "partitioned {} into {} functions with {} transfers",
            src.name,
            self.functions.len(),
            self.transfers.len()
        );
        Ok(Partition {
            functions: self.functions,
            transfers: self.transfers,
        })
    }

    fn place_op(&mut self, inst: InstId) -> Result<(), GraphError> {
        let src = self.src;
        let loc = src.loc(inst).clone();
        let descriptor = OperationDescriptor::decode(src, inst)?.ok_or_else(|| {
            LoweringError::UnsupportedInstruction {
                what: format!("{:?}", src.kind(inst)),
                loc: loc.clone(),
            }
        })?;
        let device = match descriptor.device() {
            Some(device) => device,
            None if descriptor.op_name() == SCALAR_TO_TENSOR => DeviceType::All,
            None => {
                warn!("{loc}: {} has no device, placing it on CPU", descriptor.op_name());
                DeviceType::Cpu
            }
        };
        if device == DeviceType::All {
            self.homes.insert(inst, Home::Everywhere);
            let devices = self.functions.iter().map(|f| f.device).collect::<Vec<_>>();
            for device in devices {
                self.replicate(&descriptor, device)?;
            }
            return Ok(());
        }
        if descriptor.device().is_none() {
            let local = self.clone_with_device(&descriptor, device)?;
            self.record(device, inst, local);
            self.homes.insert(inst, Home::Device(device));
            return Ok(());
        }
        let operands = src
            .operands(inst)
            .into_iter()
            .map(|v| self.operand_on(v, device, &loc))
            .collect::<Result<Vec<_>, _>>()?;
        let local = self.append(device, with_operands(src.kind(inst), operands), loc);
        self.record(device, inst, local);
        self.homes.insert(inst, Home::Device(device));
        trace!("{inst} -> {device} {local}");
        Ok(())
    }

    /// Clones an op living on every device into the function of `device`.
    fn replicate(&mut self, descriptor: &OperationDescriptor, device: DeviceType) -> Result<ValueId, GraphError> {
        let local = self.clone_with_device(descriptor, device)?;
        self.record(device, descriptor.inst(), local);
        Ok(local)
    }

    /// Clones an op into `device`'s function, setting its device attribute to
    /// `device`.
    fn clone_with_device(&mut self, descriptor: &OperationDescriptor, device: DeviceType) -> Result<ValueId, GraphError> {
        let src = self.src;
        let inst = descriptor.inst();
        let loc = src.loc(inst).clone();
        if !descriptor.is_canonical() {
            return Err(LoweringError::NotCanonical {
                op: descriptor.op_name().to_string(),
                loc,
            }
            .into());
        }
        let mut builder = OpBuilder::new(descriptor.op_name());
        for operand in descriptor.operands() {
            if operand.role == OperandRole::Normal && operand.name == DEVICE_ATTR {
                continue;
            }
            let Some(value) = operand.value() else {
                return Err(LoweringError::NotCanonical {
                    op: descriptor.op_name().to_string(),
                    loc,
                }
                .into());
            };
            let local = self.operand_on(value, device, &loc)?;
            builder.push(&operand.name, operand.role, local);
        }
        let device_string = self.device_literal(device, device, &loc)?;
        builder.push(DEVICE_ATTR, OperandRole::Normal, device_string);
        Ok(self.append(device, builder.build(src.result_type(inst)), loc))
    }

    /// The value standing for `value` in the function of `device`, creating it
    /// on first use: literals are recreated, tensors are received.
    fn operand_on(&mut self, value: ValueId, device: DeviceType, loc: &Location) -> Result<ValueId, GraphError> {
        let src = self.src;
        let index = self.function_index(device);
        if let Some(local) = self.value_maps[index].get(&value) {
            return Ok(*local);
        }
        let kind = src.kind(value);
        if kind.is_rematerializable() {
            let operands = kind
                .operands()
                .into_iter()
                .map(|v| self.operand_on(v, device, loc))
                .collect::<Result<Vec<_>, _>>()?;
            let local = self.append(device, with_operands(kind, operands), src.loc(value).clone());
            self.record(device, value, local);
            return Ok(local);
        }
        match self.homes.get(&value).copied() {
            Some(Home::Device(home)) => self.transfer(value, home, device, loc),
            // The device function did not exist when the op was replicated.
            Some(Home::Everywhere) => {
                let descriptor = OperationDescriptor::decode(src, value)?.ok_or_else(|| {
                    LoweringError::UnsupportedInstruction {
                        what: format!("{:?}", src.kind(value)),
                        loc: loc.clone(),
                    }
                })?;
                self.replicate(&descriptor, device)
            }
            None => Err(LoweringError::UnsupportedInstruction {
                what: format!("use of {value} before its placement"),
                loc: loc.clone(),
            }
            .into()),
        }
    }

    /// Moves `value` from `src` to `dest` with a send/recv pair. The producer's
    /// transfer shapes, if any, go along on both halves.
    fn transfer(
        &mut self,
        value: ValueId,
        src: DeviceType,
        dest: DeviceType,
        loc: &Location,
    ) -> Result<ValueId, GraphError> {
        let result = self.src.result_type(value);
        let src_index = self.function_index(src);
        let sent = self.value_maps[src_index].get(&value).copied().ok_or_else(|| {
            LoweringError::UnsupportedInstruction {
                what: format!("{value} is not available on {src}"),
                loc: loc.clone(),
            }
        })?;
        let shapes = self.transfer_shapes(value)?;
        let transfer_id = self.next_transfer_id;
        self.next_transfer_id += 1;

        let mut send = OpBuilder::new(D2D_SEND);
        send.push("", OperandRole::Input, sent);
        let id = self.append(src, transfer_id_literal(transfer_id), loc.clone());
        send.push(TRANSFER_ID_ATTR, OperandRole::Normal, id);
        let dest_string = self.device_literal(dest, src, loc)?;
        send.push(DEST_DEVICE_ATTR, OperandRole::Normal, dest_string);
        self.push_shapes(&mut send, &shapes, src, loc)?;
        let src_string = self.device_literal(src, src, loc)?;
        send.push(DEVICE_ATTR, OperandRole::Normal, src_string);
        self.append(src, send.build(ValueType::Unit), loc.clone());

        let mut recv = OpBuilder::new(D2D_RECV);
        let id = self.append(dest, transfer_id_literal(transfer_id), loc.clone());
        recv.push(TRANSFER_ID_ATTR, OperandRole::Normal, id);
        let src_string = self.device_literal(src, dest, loc)?;
        recv.push(SRC_DEVICE_ATTR, OperandRole::Normal, src_string);
        self.push_shapes(&mut recv, &shapes, dest, loc)?;
        let dest_string = self.device_literal(dest, dest, loc)?;
        recv.push(DEVICE_ATTR, OperandRole::Normal, dest_string);
        let received = self.append(dest, recv.build(result), loc.clone());

        self.record(dest, value, received);
        debug!("transfer #{transfer_id}: {value} from {src} to {dest}");
        self.transfers.push(TransferEdge {
            transfer_id,
            value,
            src,
            dest,
        });
        Ok(received)
    }

    /// The `__shapes` group of the op producing `value`, as (name, role,
    /// source value) triples.
    fn transfer_shapes(&self, value: ValueId) -> Result<Vec<(String, OperandRole, ValueId)>, GraphError> {
        let Some(descriptor) = OperationDescriptor::decode(self.src, value)? else {
            return Ok(vec![]);
        };
        let Some(group) = descriptor
            .groups()
            .into_iter()
            .find(|g| g.head.role == OperandRole::ShapeArray && g.head.name == SHAPE_ARRAY_ATTR)
        else {
            return Ok(vec![]);
        };
        std::iter::once(group.head)
            .chain(group.elements)
            .map(|operand| -> Result<_, GraphError> {
                let source = operand.value().ok_or_else(|| LoweringError::NotCanonical {
                    op: descriptor.op_name().to_string(),
                    loc: self.src.loc(value).clone(),
                })?;
                Ok((operand.name.clone(), operand.role, source))
            })
            .collect()
    }

    fn push_shapes(
        &mut self,
        builder: &mut OpBuilder,
        shapes: &[(String, OperandRole, ValueId)],
        device: DeviceType,
        loc: &Location,
    ) -> Result<(), GraphError> {
        for (name, role, value) in shapes {
            let local = self.operand_on(*value, device, loc)?;
            builder.push(name, *role, local);
        }
        Ok(())
    }

    /// Appends the device string of `device` to the function of `into`.
    fn device_literal(&mut self, device: DeviceType, into: DeviceType, loc: &Location) -> Result<ValueId, GraphError> {
        let device_string = device
            .device_string()
            .filter(|_| device.is_concrete())
            .ok_or_else(|| LoweringError::AllDevicesInGraph {
                op: DEVICE_ATTR.to_string(),
                loc: loc.clone(),
            })?;
        Ok(self.append(into, InstKind::StringLiteral(device_string.to_string()), loc.clone()))
    }

    /// Index of the function of `device`, created if the device was not
    /// known to be used.
    fn function_index(&mut self, device: DeviceType) -> usize {
        if let Some(index) = self.functions.iter().position(|f| f.device == device) {
            return index;
        }
        if !self.config.is_used(device) {
            warn!("{} uses {device}, which was not marked as used", self.src.name);
        }
        self.functions.push(PartitionedFunction {
            device,
            function: Function::new(format!("{}_{}", self.src.name, device.short_name())),
        });
        self.value_maps.push(HashMap::new());
        self.functions.len() - 1
    }

    fn append(&mut self, device: DeviceType, kind: InstKind, loc: Location) -> InstId {
        let index = self.function_index(device);
        self.functions[index].function.append(kind, loc)
    }

    fn record(&mut self, device: DeviceType, value: ValueId, local: ValueId) {
        let index = self.function_index(device);
        self.value_maps[index].insert(value, local);
    }
}

/// `kind` with its operands replaced, in order, by `operands`.
fn with_operands(kind: &InstKind, operands: Vec<ValueId>) -> InstKind {
    let mut operands = operands.into_iter();
    kind.map_operands(|old| operands.next().unwrap_or(old))
}

fn transfer_id_literal(transfer_id: u32) -> InstKind {
    InstKind::IntLiteral {
        value: i64::from(transfer_id),
        dtype: DataType::Int32,
    }
}
