//! Audio device lookup
//!
//! Devices are addressed by cpal's stable `DeviceId` strings so a host
//! application can persist a selection across restarts. The loopback
//! source is just another capture device from cpal's point of view (a
//! monitor/loopback input exposed by the platform); when no ID is
//! configured we fall back to the first input whose name looks like one.

use crate::error::{EngineError, EngineResult};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::DeviceId;
use serde::Serialize;
use std::str::FromStr;

/// Describes one capture device to the outside world
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    /// Stable identifier (survives restarts)
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Whether this is the system default input
    pub is_default: bool,
    /// Whether the name marks it as a monitor/loopback source
    pub is_loopback: bool,
}

/// Display name for a device, preferring `description()` with the
/// deprecated `name()` as a fallback.
pub fn device_display_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|desc| desc.name().to_string())
        .unwrap_or_else(|_| {
            #[allow(deprecated)]
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        })
}

fn looks_like_loopback(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("monitor") || lower.contains("loopback")
}

/// List all capture devices with stable IDs.
pub fn list_input_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    tracing::debug!("CPAL host: {}", host.id().name());

    let default_id = host
        .default_input_device()
        .and_then(|d| d.id().ok())
        .map(|id| id.to_string());

    let devices: Vec<AudioDeviceInfo> = host
        .input_devices()
        .map(|iter| {
            iter.filter_map(|device| {
                let id = device.id().ok()?.to_string();
                let name = device_display_name(&device);
                Some(AudioDeviceInfo {
                    is_default: Some(&id) == default_id.as_ref(),
                    is_loopback: looks_like_loopback(&name),
                    id,
                    name,
                })
            })
            .collect()
        })
        .unwrap_or_default();

    tracing::debug!("found {} capture devices", devices.len());
    devices
}

/// Resolve a stable ID back to a device.
pub fn find_device_by_id(id_str: &str) -> Option<cpal::Device> {
    let host = cpal::default_host();
    let device_id = DeviceId::from_str(id_str).ok()?;
    host.device_by_id(&device_id)
}

/// Pick the microphone: the configured ID if it resolves, the system
/// default otherwise.
pub fn resolve_mic_device(device_id: Option<&str>) -> EngineResult<cpal::Device> {
    if let Some(id) = device_id {
        if let Some(device) = find_device_by_id(id) {
            tracing::info!("using mic device: {}", device_display_name(&device));
            return Ok(device);
        }
        tracing::warn!("configured mic device '{}' not found, using default", id);
    }
    cpal::default_host()
        .default_input_device()
        .ok_or(EngineError::NoInputDevice)
}

/// Pick the loopback source: the configured ID if it resolves, otherwise
/// the first input device whose name marks it as a monitor/loopback.
pub fn resolve_loopback_device(device_id: Option<&str>) -> EngineResult<cpal::Device> {
    if let Some(id) = device_id {
        return find_device_by_id(id)
            .ok_or_else(|| EngineError::DeviceNotFound(id.to_string()));
    }

    let host = cpal::default_host();
    let candidate = host.input_devices().ok().and_then(|mut iter| {
        iter.find(|d| looks_like_loopback(&device_display_name(d)))
    });
    match candidate {
        Some(device) => {
            tracing::info!(
                "using loopback source: {}",
                device_display_name(&device)
            );
            Ok(device)
        }
        None => Err(EngineError::NoLoopbackDevice),
    }
}
