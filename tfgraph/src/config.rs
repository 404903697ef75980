//! Device configuration of a function and the placement policy for its ops.

use crate::{
    classifier::{OpBuilder, OperationDescriptor},
    device::DeviceType,
    ir::{Function, InstId, Location},
    ops::{CONFIGURE_CPU, CONFIGURE_GPU, CONFIGURE_TPU, ENABLE_INFEED_ATTR, SCALAR_TO_TENSOR, is_host_transfer},
};
use serde::{Deserialize, Serialize};
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq)]
/// Errors raised while building a [`DeviceConfiguration`].
pub enum ConfigError {
    /// The primary device must be a concrete device.
    InvalidPrimaryDevice(DeviceType),
    /// Only concrete devices can be recorded as used.
    InvalidUsedDevice(DeviceType),
    /// A function carries more than one configuration op.
    MultipleConfigurations { first: Location, second: Location },
    /// A configuration op whose attributes cannot be read.
    MalformedConfiguration { reason: String, loc: Location },
}

impl ConfigError {
    pub fn location(&self) -> Option<&Location> {
        match self {
            ConfigError::InvalidPrimaryDevice(_) | ConfigError::InvalidUsedDevice(_) => None,
            ConfigError::MultipleConfigurations { second, .. } => Some(second),
            ConfigError::MalformedConfiguration { loc, .. } => Some(loc),
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ConfigError::InvalidPrimaryDevice(device) => {
                write!(f, "{device} cannot be used as the primary device")
            }
            ConfigError::InvalidUsedDevice(device) => {
                write!(f, "{device} cannot be recorded as a used device")
            }
            ConfigError::MultipleConfigurations { first, second } => write!(
                f,
                "{second}: device configuration already given at {first}"
            ),
            ConfigError::MalformedConfiguration { reason, loc } => {
                write!(f, "{loc}: malformed device configuration: {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PlacementError {
    #[error("{loc}: op '{op}' is placed on unknown device '{device}'")]
    UnknownDevice {
        op: String,
        device: String,
        loc: Location,
    },
}

impl PlacementError {
    pub fn location(&self) -> &Location {
        match self {
            PlacementError::UnknownDevice { loc, .. } => loc,
        }
    }
}

/// Devices a function runs on. `used_devices` grows while ops are placed and
/// keeps insertion order, starting with the primary device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SerializedConfiguration")]
pub struct DeviceConfiguration {
    primary_device: DeviceType,
    infeed_enabled: bool,
    used_devices: Vec<DeviceType>,
}

/// Wire form of [`DeviceConfiguration`], checked on the way in.
#[derive(Deserialize)]
struct SerializedConfiguration {
    primary_device: DeviceType,
    #[serde(default)]
    infeed_enabled: bool,
    #[serde(default)]
    used_devices: Vec<DeviceType>,
}

impl TryFrom<SerializedConfiguration> for DeviceConfiguration {
    type Error = ConfigError;

    fn try_from(serialized: SerializedConfiguration) -> Result<Self, ConfigError> {
        let mut config = Self::new(serialized.primary_device, serialized.infeed_enabled)?;
        for device in serialized.used_devices {
            if !device.is_concrete() {
                return Err(ConfigError::InvalidUsedDevice(device));
            }
            config.mark_device_used(device);
        }
        Ok(config)
    }
}

impl DeviceConfiguration {
    pub fn new(primary_device: DeviceType, infeed_enabled: bool) -> Result<Self, ConfigError> {
        if !primary_device.is_concrete() {
            return Err(ConfigError::InvalidPrimaryDevice(primary_device));
        }
        Ok(Self {
            primary_device,
            infeed_enabled,
            used_devices: vec![primary_device],
        })
    }

    /// Reads the configuration from the `tfc.configure*` op of `func`, if it
    /// has one. Without such op the function runs on the CPU, infeed disabled.
    pub fn for_function(func: &mut Function, remove_config_inst: bool) -> Result<Self, ConfigError> {
        let mut found: Option<(InstId, DeviceType, bool)> = None;
        for inst in func.iter().collect::<Vec<_>>() {
            let loc = func.loc(inst).clone();
            let device = match func.kind(inst).tensor_op_name() {
                Some(CONFIGURE_CPU) => DeviceType::Cpu,
                Some(CONFIGURE_GPU) => DeviceType::Gpu,
                Some(CONFIGURE_TPU) => DeviceType::Tpu,
                _ => continue,
            };
            if let Some((first, ..)) = found {
                return Err(ConfigError::MultipleConfigurations {
                    first: func.loc(first).clone(),
                    second: loc,
                });
            }
            let descriptor = OperationDescriptor::decode(func, inst)
                .map_err(|e| ConfigError::MalformedConfiguration {
                    reason: e.to_string(),
                    loc: loc.clone(),
                })?
                .ok_or_else(|| ConfigError::MalformedConfiguration {
                    reason: "not a tensor op".to_string(),
                    loc: loc.clone(),
                })?;
            let infeed = match descriptor.attribute(ENABLE_INFEED_ATTR) {
                None => false,
                Some(_) => {
                    descriptor
                        .int_attribute(func, ENABLE_INFEED_ATTR)
                        .ok_or_else(|| ConfigError::MalformedConfiguration {
                            reason: format!("'{ENABLE_INFEED_ATTR}' must be an integer literal"),
                            loc: loc.clone(),
                        })?
                        != 0
                }
            };
            found = Some((inst, device, infeed));
        }

        let Some((inst, device, infeed)) = found else {
            debug!("no device configuration in {}, defaulting to CPU", func.name);
            return Self::new(DeviceType::Cpu, false);
        };
        if remove_config_inst {
            func.erase(inst);
        }
        debug!(
            "{} configured for {device}, infeed {}",
            func.name,
            if infeed { "enabled" } else { "disabled" }
        );
        Self::new(device, infeed)
    }

    pub fn primary_device(&self) -> DeviceType {
        self.primary_device
    }

    pub fn infeed_enabled(&self) -> bool {
        self.infeed_enabled
    }

    /// Infeed/outfeed replaces host transfers only on a TPU primary device.
    pub fn uses_infeed(&self) -> bool {
        self.infeed_enabled && self.primary_device == DeviceType::Tpu
    }

    pub fn used_devices(&self) -> &[DeviceType] {
        &self.used_devices
    }

    pub fn is_used(&self, device: DeviceType) -> bool {
        self.used_devices.contains(&device)
    }

    /// Records that an op runs on `device`. `ALL` is not a device of its own.
    pub fn mark_device_used(&mut self, device: DeviceType) {
        if device == DeviceType::All || self.used_devices.contains(&device) {
            return;
        }
        trace!("device {device} now in use");
        self.used_devices.push(device);
    }

    /// Default placement: host transfers run on the CPU, everything else on
    /// the primary device.
    pub fn choose_device(&self, op_name: &str) -> DeviceType {
        if is_host_transfer(op_name) {
            DeviceType::Cpu
        } else {
            self.primary_device
        }
    }

    /// Resolves the device of the op being built by `builder` and appends it
    /// as its device attribute. `explicit_device` is the device string the op
    /// carried, empty if none. Returns the resolved device, or `None` for the
    /// scalar promotion op whose placement is left to partitioning.
    pub fn handle_device_placement(
        &mut self,
        op_name: &str,
        explicit_device: &str,
        func: &mut Function,
        anchor: InstId,
        builder: &mut OpBuilder,
    ) -> Result<Option<DeviceType>, PlacementError> {
        if op_name == SCALAR_TO_TENSOR {
            return Ok(None);
        }
        let device = if explicit_device.is_empty() {
            self.choose_device(op_name)
        } else {
            DeviceType::from_device_string(explicit_device).ok_or_else(|| PlacementError::UnknownDevice {
                op: op_name.to_string(),
                device: explicit_device.to_string(),
                loc: func.loc(anchor).clone(),
            })?
        };
        let device_string = device
            .device_string()
            .ok_or_else(|| PlacementError::UnknownDevice {
                op: op_name.to_string(),
                device: device.to_string(),
                loc: func.loc(anchor).clone(),
            })?;
        builder.append_device_attribute(func, anchor, device_string);
        self.mark_device_used(device);
        trace!("placed {op_name} on {device}");
        Ok(Some(device))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        classifier::OperandRole,
        ir::{DataType, FunctionBuilder, ValueType},
        ops::{DEVICE_ATTR, RECV_FROM_HOST, SEND_TO_HOST},
    };
    use rstest::rstest;

    #[rstest]
    #[case(DeviceType::All)]
    #[case(DeviceType::Invalid)]
    fn test_primary_must_be_concrete(#[case] device: DeviceType) {
        assert_eq!(
            DeviceConfiguration::new(device, false),
            Err(ConfigError::InvalidPrimaryDevice(device))
        );
    }

    #[rstest]
    #[case(DeviceType::Cpu, "Add", DeviceType::Cpu)]
    #[case(DeviceType::Gpu, "Add", DeviceType::Gpu)]
    #[case(DeviceType::Tpu, "MatMul", DeviceType::Tpu)]
    #[case(DeviceType::Tpu, RECV_FROM_HOST, DeviceType::Cpu)]
    #[case(DeviceType::Gpu, SEND_TO_HOST, DeviceType::Cpu)]
    fn test_choose_device(#[case] primary: DeviceType, #[case] op: &str, #[case] expected: DeviceType) {
        let config = DeviceConfiguration::new(primary, false).unwrap();
        assert_eq!(config.choose_device(op), expected);
    }

    #[test]
    fn test_all_is_never_used() {
        let mut config = DeviceConfiguration::new(DeviceType::Gpu, false).unwrap();
        config.mark_device_used(DeviceType::All);
        config.mark_device_used(DeviceType::Cpu);
        config.mark_device_used(DeviceType::Cpu);
        assert_eq!(config.used_devices(), &[DeviceType::Gpu, DeviceType::Cpu]);
        assert!(!config.is_used(DeviceType::All));
    }

    fn placement(explicit: &str, op: &str) -> (Result<Option<DeviceType>, PlacementError>, DeviceConfiguration, String) {
        let mut b = FunctionBuilder::new("f");
        let x = b.param(ValueType::Tensor(DataType::Float));
        let inst = b.tensor_op(&format!("{op},$in"), &[x], ValueType::Tensor(DataType::Float));
        let mut func = b.finish();
        let mut config = DeviceConfiguration::new(DeviceType::Tpu, false).unwrap();
        let mut builder = OpBuilder::new(op);
        builder.push("", OperandRole::Input, x);
        let result = config.handle_device_placement(op, explicit, &mut func, inst, &mut builder);
        (result, config, builder.mnemonic())
    }

    #[test]
    fn test_explicit_device_wins() {
        let (result, config, mnemonic) = placement("/device:GPU:0", RECV_FROM_HOST);
        assert_eq!(result, Ok(Some(DeviceType::Gpu)));
        assert_eq!(config.used_devices(), &[DeviceType::Tpu, DeviceType::Gpu]);
        assert_eq!(mnemonic, format!("{RECV_FROM_HOST},$in,{DEVICE_ATTR}"));
    }

    #[test]
    fn test_default_placement() {
        let (result, config, _) = placement("", "Relu");
        assert_eq!(result, Ok(Some(DeviceType::Tpu)));
        assert_eq!(config.used_devices(), &[DeviceType::Tpu]);

        let (result, config, _) = placement("", SEND_TO_HOST);
        assert_eq!(result, Ok(Some(DeviceType::Cpu)));
        assert_eq!(config.used_devices(), &[DeviceType::Tpu, DeviceType::Cpu]);
    }

    #[test]
    fn test_scalar_promotion_is_deferred() {
        let (result, config, mnemonic) = placement("", SCALAR_TO_TENSOR);
        assert_eq!(result, Ok(None));
        assert_eq!(config.used_devices(), &[DeviceType::Tpu]);
        assert!(!mnemonic.contains(DEVICE_ATTR));
    }

    #[test]
    fn test_explicit_all_is_not_marked_used() {
        let (result, config, _) = placement("ALL_DEVICES", "Const");
        assert_eq!(result, Ok(Some(DeviceType::All)));
        assert_eq!(config.used_devices(), &[DeviceType::Tpu]);
    }

    #[test]
    fn test_unknown_explicit_device() {
        let (result, _, _) = placement("/job:worker/device:GPU:1", "Add");
        assert!(matches!(
            result,
            Err(PlacementError::UnknownDevice { device, .. }) if device == "/job:worker/device:GPU:1"
        ));
    }

    #[test]
    fn test_deserialization_keeps_invariants() {
        let config: DeviceConfiguration =
            serde_json::from_str(r#"{"primary_device":"Tpu","used_devices":["Gpu","Tpu","Cpu"]}"#).unwrap();
        assert_eq!(config.used_devices(), &[DeviceType::Tpu, DeviceType::Gpu, DeviceType::Cpu]);
        assert!(!config.infeed_enabled());
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<DeviceConfiguration>(&json).unwrap(), config);

        for bad in [
            r#"{"primary_device":"All"}"#,
            r#"{"primary_device":"Invalid","used_devices":[]}"#,
            r#"{"primary_device":"Cpu","used_devices":["Cpu","All"]}"#,
        ] {
            assert!(serde_json::from_str::<DeviceConfiguration>(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_configuration_discovery() {
        let mut b = FunctionBuilder::new("f");
        let on = b.int(1, DataType::Int64);
        let cfg = b.tensor_op("tfc.configureTPU,enableInfeed", &[on], ValueType::Unit);
        b.ret(&[]);
        let mut func = b.finish();

        let config = DeviceConfiguration::for_function(&mut func, true).unwrap();
        assert_eq!(config.primary_device(), DeviceType::Tpu);
        assert!(config.infeed_enabled());
        assert!(config.uses_infeed());
        assert!(!func.is_live(cfg));
    }

    #[test]
    fn test_configuration_defaults_and_duplicates() {
        let mut b = FunctionBuilder::new("f");
        b.ret(&[]);
        let mut func = b.finish();
        let config = DeviceConfiguration::for_function(&mut func, false).unwrap();
        assert_eq!(config.primary_device(), DeviceType::Cpu);
        assert!(!config.infeed_enabled());

        let mut b = FunctionBuilder::new("g");
        b.at(Location::new("g.swift", 1, 1));
        b.tensor_op("tfc.configureGPU", &[], ValueType::Unit);
        b.at(Location::new("g.swift", 2, 1));
        let second = b.tensor_op("tfc.configureCPU", &[], ValueType::Unit);
        b.ret(&[]);
        let mut func = b.finish();
        let err = DeviceConfiguration::for_function(&mut func, true).unwrap_err();
        assert_eq!(err.location(), Some(&Location::new("g.swift", 2, 1)));
        assert!(err.to_string().contains("g.swift:1:1"));
        assert!(func.is_live(second));
    }
}
