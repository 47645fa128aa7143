//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

#[cfg(feature = "audio-cpal")]
use crate::error::{ParleyError, Result};

/// Which side of the conversation a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
}

/// Sort defaults first, then case-insensitively by name.
fn sort_devices(list: &mut [DeviceInfo]) {
    list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
}

/// Pick `preferred` when the host lists it, else the default, else the first
/// listed device.
#[cfg(feature = "audio-cpal")]
fn resolve_device<I>(
    preferred: Option<&str>,
    listed: impl FnOnce() -> std::result::Result<I, cpal::DevicesError>,
    default: impl FnOnce() -> Option<cpal::Device>,
    missing: ParleyError,
) -> Result<cpal::Device>
where
    I: Iterator<Item = cpal::Device>,
{
    use cpal::traits::DeviceTrait;
    use tracing::warn;

    let mut devices: Vec<cpal::Device> = match listed() {
        Ok(devices) => devices.collect(),
        Err(e) => {
            warn!("failed to list audio devices: {e}");
            Vec::new()
        }
    };

    if let Some(name) = preferred {
        if let Some(idx) = devices
            .iter()
            .position(|d| d.name().map(|n| n == name).unwrap_or(false))
        {
            return Ok(devices.swap_remove(idx));
        }
        warn!(preferred = name, "preferred audio device not found, falling back");
    }

    if let Some(device) = default() {
        return Ok(device);
    }

    if devices.is_empty() {
        return Err(missing);
    }
    warn!("no default audio device, falling back to first available");
    Ok(devices.swap_remove(0))
}

#[cfg(feature = "audio-cpal")]
pub(crate) fn resolve_input_device(preferred: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::HostTrait;

    let host = cpal::default_host();
    resolve_device(
        preferred,
        || host.input_devices(),
        || host.default_input_device(),
        ParleyError::NoDefaultInputDevice,
    )
}

#[cfg(feature = "audio-cpal")]
pub(crate) fn resolve_output_device(preferred: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::HostTrait;

    let host = cpal::default_host();
    resolve_device(
        preferred,
        || host.output_devices(),
        || host.default_output_device(),
        ParleyError::NoDefaultOutputDevice,
    )
}

#[cfg(feature = "audio-cpal")]
fn describe<I>(
    devices: std::result::Result<I, cpal::DevicesError>,
    default_name: Option<String>,
    direction: DeviceDirection,
) -> Vec<DeviceInfo>
where
    I: Iterator<Item = cpal::Device>,
{
    use cpal::traits::DeviceTrait;

    let devices = match devices {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("failed to enumerate {direction:?} devices: {e}");
            return default_name
                .map(|name| {
                    vec![DeviceInfo {
                        name,
                        direction,
                        is_default: true,
                    }]
                })
                .unwrap_or_default();
        }
    };

    let mut list = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("{direction:?} Device {}", idx + 1));
            let is_default = default_name.as_deref() == Some(name.as_str());
            DeviceInfo {
                name,
                direction,
                is_default,
            }
        })
        .collect::<Vec<_>>();
    sort_devices(&mut list);
    list
}

/// List all audio input devices. Empty if none exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    describe(host.input_devices(), default_name, DeviceDirection::Input)
}

/// List all audio output devices. Empty if none exist.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    describe(host.output_devices(), default_name, DeviceDirection::Output)
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}
