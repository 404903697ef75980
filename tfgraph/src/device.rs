//! Devices an operation can be placed on, and their canonical spellings.

use serde::{Deserialize, Serialize};

pub const DEFAULT_CPU_DEVICE: &str = "/device:CPU:0";
pub const DEFAULT_GPU_DEVICE: &str = "/device:GPU:0";
pub const DEFAULT_TPU_DEVICE: &str = "TPU_SYSTEM";
/// Pseudo-device only found before partitioning; replaced by every used device.
pub const ALL_DEVICES: &str = "ALL_DEVICES";

/// The device of a tensor op and of the tensors it produces.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
pub enum DeviceType {
    #[display("INVALID")]
    Invalid,
    #[display("CPU")]
    Cpu,
    #[display("GPU")]
    Gpu,
    #[display("TPU")]
    Tpu,
    /// Run on every device in use. A promoted scalar is placed here, in case it
    /// is a loop count and the loop runs on all devices.
    #[display("ALL")]
    All,
}

impl DeviceType {
    /// Parses one of the canonical device strings.
    pub fn from_device_string(device: &str) -> Option<Self> {
        match device {
            DEFAULT_CPU_DEVICE => Some(DeviceType::Cpu),
            DEFAULT_GPU_DEVICE => Some(DeviceType::Gpu),
            DEFAULT_TPU_DEVICE => Some(DeviceType::Tpu),
            ALL_DEVICES => Some(DeviceType::All),
            _ => None,
        }
    }

    /// The device name used in the generated graph. `None` for `Invalid`.
    pub fn device_string(self) -> Option<&'static str> {
        match self {
            DeviceType::Cpu => Some(DEFAULT_CPU_DEVICE),
            DeviceType::Gpu => Some(DEFAULT_GPU_DEVICE),
            DeviceType::Tpu => Some(DEFAULT_TPU_DEVICE),
            DeviceType::All => Some(ALL_DEVICES),
            DeviceType::Invalid => None,
        }
    }

    /// Short name, used to build per-device function names.
    pub fn short_name(self) -> String {
        self.to_string()
    }

    /// A device an op can actually execute on.
    pub fn is_concrete(self) -> bool {
        matches!(self, DeviceType::Cpu | DeviceType::Gpu | DeviceType::Tpu)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DeviceType::Cpu, "/device:CPU:0", "CPU")]
    #[case(DeviceType::Gpu, "/device:GPU:0", "GPU")]
    #[case(DeviceType::Tpu, "TPU_SYSTEM", "TPU")]
    #[case(DeviceType::All, "ALL_DEVICES", "ALL")]
    fn test_device_strings(#[case] device: DeviceType, #[case] string: &str, #[case] short: &str) {
        assert_eq!(device.device_string(), Some(string));
        assert_eq!(DeviceType::from_device_string(string), Some(device));
        assert_eq!(device.short_name(), short);
    }

    #[test]
    fn test_non_canonical_strings() {
        assert_eq!(DeviceType::from_device_string("CPU:0"), None);
        assert_eq!(DeviceType::from_device_string("/device:GPU:1"), None);
        assert_eq!(DeviceType::from_device_string(""), None);
        assert_eq!(DeviceType::Invalid.device_string(), None);
        assert!(!DeviceType::All.is_concrete());
    }
}
