//! Device identification for cache keys.

/// Resolves a human-readable device name for a CUDA ordinal.
pub trait DeviceProbe: Send + Sync {
    /// `None` when the device cannot be introspected.
    fn device_name(&self, device_id: u32) -> Option<String>;
}

/// Never introspects; cache keys fall back to `device<N>`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PositionalDevice;

impl DeviceProbe for PositionalDevice {
    fn device_name(&self, _device_id: u32) -> Option<String> {
        None
    }
}

/// Fixed name, for tests and for callers that already know the device.
#[derive(Clone, Debug)]
pub struct NamedDevice(pub String);

impl DeviceProbe for NamedDevice {
    fn device_name(&self, _device_id: u32) -> Option<String> {
        Some(self.0.clone())
    }
}

#[cfg(feature = "cuda")]
#[derive(Clone, Copy, Debug, Default)]
pub struct CudaDeviceProbe;

#[cfg(feature = "cuda")]
impl DeviceProbe for CudaDeviceProbe {
    fn device_name(&self, device_id: u32) -> Option<String> {
        match cudarc::driver::CudaDevice::new(device_id as usize).and_then(|dev| dev.name()) {
            Ok(name) => Some(name),
            Err(err) => {
                tracing::debug!(device_id, error = %err, "CUDA device name unavailable");
                None
            }
        }
    }
}

/// The best probe compiled into this build.
pub fn default_probe() -> Box<dyn DeviceProbe> {
    #[cfg(feature = "cuda")]
    {
        Box::new(CudaDeviceProbe)
    }
    #[cfg(not(feature = "cuda"))]
    {
        Box::new(PositionalDevice)
    }
}

/// Path-safe device identifier: the sanitized name, or `device<N>`.
pub fn device_identifier(probe: &dyn DeviceProbe, device_id: u32) -> String {
    probe
        .device_name(device_id)
        .map(|name| sanitize(name.trim()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("device{device_id}"))
}

/// Spaces become `-`; anything outside `[A-Za-z0-9._-]` becomes `_`.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            ' ' => '-',
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => c,
            _ => '_',
        })
        .collect()
}
