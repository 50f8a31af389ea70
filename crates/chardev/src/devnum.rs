//! Legacy device-number decoding
//!
//! Device numbers arrive as a flat integer packing a legacy-style
//! `(major, minor)` pair. The major selects the device class; the minor
//! layout within a class follows the conventions the hosted drivers were
//! written against. Unknown subdevice kinds decode to `None` and are
//! logged and ignored — partially configured device classes are normal,
//! not an error.

use common::DispatchSettings;
use tracing::debug;

pub const VIDEO_MAJOR: u32 = 81;
pub const INPUT_MAJOR: u32 = 13;
pub const LIRC_MAJOR: u32 = 61;
pub const DVB_MAJOR: u32 = 212;
pub const HIDRAW_MAJOR: u32 = 243;

/// First event-device minor on the input major.
const INPUT_EVENT_BASE: u32 = 64;

/// Tuner subdevice kinds within an adapter's minor block.
const DVB_KIND_VIDEO: u32 = 0;
const DVB_KIND_AUDIO: u32 = 1;
const DVB_KIND_SEC: u32 = 2;
const DVB_KIND_FRONTEND: u32 = 3;
const DVB_KIND_DEMUX: u32 = 4;
const DVB_KIND_DVR: u32 = 5;
const DVB_KIND_CA: u32 = 6;
const DVB_KIND_OSD: u32 = 8;

/// Subdevices of one kind per tuner adapter.
const DVB_IDS_PER_ADAPTER: usize = 4;

pub fn makedev(major: u32, minor: u32) -> u32 {
    (major << 8) | (minor & 0xff)
}

pub fn major(nr: u32) -> u32 {
    nr >> 8
}

pub fn minor(nr: u32) -> u32 {
    nr & 0xff
}

/// Device classes with fixed-capacity subdevice tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Capture,
    TunerFrontend,
    TunerDemux,
    TunerDvr,
    TunerAudio,
    TunerVideo,
    TunerCa,
    TunerOsd,
    TunerSec,
    EventInput,
    JoystickInput,
    RemoteControl,
    VendorHid,
}

impl DeviceClass {
    pub const COUNT: usize = 13;

    pub const ALL: [DeviceClass; Self::COUNT] = [
        DeviceClass::Capture,
        DeviceClass::TunerFrontend,
        DeviceClass::TunerDemux,
        DeviceClass::TunerDvr,
        DeviceClass::TunerAudio,
        DeviceClass::TunerVideo,
        DeviceClass::TunerCa,
        DeviceClass::TunerOsd,
        DeviceClass::TunerSec,
        DeviceClass::EventInput,
        DeviceClass::JoystickInput,
        DeviceClass::RemoteControl,
        DeviceClass::VendorHid,
    ];

    /// Capacity of this class's subdevice table.
    pub fn capacity(self) -> usize {
        match self {
            DeviceClass::Capture => 64,
            DeviceClass::TunerFrontend
            | DeviceClass::TunerDemux
            | DeviceClass::TunerDvr
            | DeviceClass::TunerAudio
            | DeviceClass::TunerVideo
            | DeviceClass::TunerCa
            | DeviceClass::TunerOsd
            | DeviceClass::TunerSec => 16,
            DeviceClass::EventInput | DeviceClass::JoystickInput => 32,
            DeviceClass::RemoteControl | DeviceClass::VendorHid => 16,
        }
    }

    pub(crate) fn index(self) -> usize {
        Self::ALL.iter().position(|c| *c == self).unwrap()
    }
}

/// A decoded device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode {
    pub class: DeviceClass,
    pub instance: usize,
}

/// Decode a flat device number into `(class, instance)`.
///
/// Returns `None` for majors this layer does not expose and for unknown
/// subdevice kinds within a known major.
pub fn decode(nr: u32, settings: &DispatchSettings) -> Option<DeviceNode> {
    let major = major(nr);
    let minor = minor(nr);

    let node = match major {
        VIDEO_MAJOR => DeviceNode {
            class: DeviceClass::Capture,
            instance: minor as usize,
        },
        DVB_MAJOR => decode_tuner(minor, settings)?,
        INPUT_MAJOR => {
            if minor >= INPUT_EVENT_BASE && minor < INPUT_EVENT_BASE + 32 {
                DeviceNode {
                    class: DeviceClass::EventInput,
                    instance: (minor - INPUT_EVENT_BASE) as usize,
                }
            } else if minor < 32 {
                DeviceNode {
                    class: DeviceClass::JoystickInput,
                    instance: minor as usize,
                }
            } else {
                debug!("ignoring input minor {} outside known ranges", minor);
                return None;
            }
        }
        LIRC_MAJOR => DeviceNode {
            class: DeviceClass::RemoteControl,
            instance: minor as usize,
        },
        HIDRAW_MAJOR => DeviceNode {
            class: DeviceClass::VendorHid,
            instance: minor as usize,
        },
        _ => {
            debug!("ignoring device number {:#x} with unknown major {}", nr, major);
            return None;
        }
    };

    if node.instance >= node.class.capacity() {
        debug!(
            "ignoring {:?} instance {} beyond table capacity {}",
            node.class,
            node.instance,
            node.class.capacity()
        );
        return None;
    }
    Some(node)
}

/// Tuner minors pack `(adapter, id, kind)` as `aa ii kkkk`.
fn decode_tuner(minor: u32, settings: &DispatchSettings) -> Option<DeviceNode> {
    let adapter = (minor >> 6) as usize;
    let id = ((minor >> 4) & 0x3) as usize;
    let kind = minor & 0xf;

    let class = match kind {
        DVB_KIND_VIDEO => DeviceClass::TunerVideo,
        DVB_KIND_AUDIO => DeviceClass::TunerAudio,
        DVB_KIND_SEC => DeviceClass::TunerSec,
        DVB_KIND_FRONTEND => DeviceClass::TunerFrontend,
        DVB_KIND_DEMUX => DeviceClass::TunerDemux,
        DVB_KIND_DVR => DeviceClass::TunerDvr,
        DVB_KIND_CA => DeviceClass::TunerCa,
        DVB_KIND_OSD => DeviceClass::TunerOsd,
        _ => {
            debug!("ignoring unknown tuner subdevice kind {}", kind);
            return None;
        }
    };

    let mut instance = adapter * DVB_IDS_PER_ADAPTER + id;
    if class == DeviceClass::TunerFrontend && settings.swap_frontend_parity {
        instance ^= 1;
    }
    Some(DeviceNode { class, instance })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DispatchSettings {
        DispatchSettings::default()
    }

    #[test]
    fn test_capture_decode() {
        let node = decode(makedev(VIDEO_MAJOR, 2), &settings()).unwrap();
        assert_eq!(node.class, DeviceClass::Capture);
        assert_eq!(node.instance, 2);
    }

    #[test]
    fn test_tuner_decode() {
        // adapter 1, id 2, frontend
        let minor = (1 << 6) | (2 << 4) | 3;
        let node = decode(makedev(DVB_MAJOR, minor), &settings()).unwrap();
        assert_eq!(node.class, DeviceClass::TunerFrontend);
        assert_eq!(node.instance, 1 * 4 + 2);
    }

    #[test]
    fn test_tuner_unknown_kind_ignored() {
        // kind 7 has no class here
        let minor = (0 << 6) | (0 << 4) | 7;
        assert!(decode(makedev(DVB_MAJOR, minor), &settings()).is_none());
    }

    #[test]
    fn test_frontend_parity_swap() {
        let swapped = DispatchSettings {
            swap_frontend_parity: true,
        };
        let minor = 3; // adapter 0, id 0, frontend
        let plain = decode(makedev(DVB_MAJOR, minor), &settings()).unwrap();
        let flipped = decode(makedev(DVB_MAJOR, minor), &swapped).unwrap();
        assert_eq!(plain.instance, 0);
        assert_eq!(flipped.instance, 1);

        // The swap only applies to front ends
        let demux = (0 << 6) | (0 << 4) | 4;
        let node = decode(makedev(DVB_MAJOR, demux), &swapped).unwrap();
        assert_eq!(node.class, DeviceClass::TunerDemux);
        assert_eq!(node.instance, 0);
    }

    #[test]
    fn test_input_ranges() {
        let event = decode(makedev(INPUT_MAJOR, 64), &settings()).unwrap();
        assert_eq!(event.class, DeviceClass::EventInput);
        assert_eq!(event.instance, 0);

        let joystick = decode(makedev(INPUT_MAJOR, 5), &settings()).unwrap();
        assert_eq!(joystick.class, DeviceClass::JoystickInput);
        assert_eq!(joystick.instance, 5);

        // Between the ranges: ignored, not an error
        assert!(decode(makedev(INPUT_MAJOR, 40), &settings()).is_none());
    }

    #[test]
    fn test_unknown_major_ignored() {
        assert!(decode(makedev(199, 0), &settings()).is_none());
    }

    #[test]
    fn test_capacity_bound() {
        assert!(decode(makedev(LIRC_MAJOR, 15), &settings()).is_some());
        assert!(decode(makedev(LIRC_MAJOR, 16), &settings()).is_none());
    }
}
