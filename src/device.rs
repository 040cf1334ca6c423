//! # Device Selection
//!
//! Maps the `local.device` setting to a candle [`Device`]. A GPU that cannot be
//! opened degrades to the CPU with a warning instead of failing the task.
//!
//! The device label (`cpu`, `cuda`, `metal`) is half of the model cache key, so a
//! model loaded on one device is never handed to a worker expecting another.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// `auto` is resolved once per process.
static AUTO_DEVICE: OnceLock<Device> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl DevicePreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            DevicePreference::Auto => "auto",
            DevicePreference::Cpu => "cpu",
            DevicePreference::Cuda => "cuda",
            DevicePreference::Metal => "metal",
        }
    }

    /// Open the preferred device, falling back to the CPU.
    pub fn resolve(self) -> Device {
        match self {
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Auto => AUTO_DEVICE.get_or_init(detect).clone(),
            gpu => open_gpu(gpu).unwrap_or_else(|| {
                warn!(requested = gpu.as_str(), "GPU unavailable, running on CPU");
                Device::Cpu
            }),
        }
    }
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" | "mps" => Ok(DevicePreference::Metal),
            other => Err(format!(
                "Unknown device '{}', expected auto, cpu, cuda or metal",
                other
            )),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CUDA first, then Metal, then CPU.
fn detect() -> Device {
    let device = open_gpu(DevicePreference::Cuda)
        .or_else(|| open_gpu(DevicePreference::Metal))
        .unwrap_or(Device::Cpu);
    info!(device = device_label(&device), "Selected inference device");
    device
}

fn open_gpu(preference: DevicePreference) -> Option<Device> {
    let opened = match preference {
        DevicePreference::Cuda => Device::new_cuda(0),
        DevicePreference::Metal => Device::new_metal(0),
        DevicePreference::Auto | DevicePreference::Cpu => return None,
    };
    opened
        .map_err(|e| debug!(device = preference.as_str(), "Cannot open device: {}", e))
        .ok()
}

/// Cache-key label for a device.
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsing_accepts_aliases() {
        assert_eq!("".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!(" CPU ".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("mps".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);

        let err = "tpu".parse::<DevicePreference>().unwrap_err();
        assert!(err.contains("tpu"));
    }

    #[test]
    fn test_cpu_resolves_to_cpu() {
        let device = DevicePreference::Cpu.resolve();
        assert_eq!(device_label(&device), "cpu");
        assert_eq!(DevicePreference::Metal.to_string(), "metal");
    }
}
