//! Device profiles
//!
//! One tagged variant per supported device type, carrying the per-type
//! command surface that the historical controller classes duplicated:
//! label, transport, config template, and result-file header.

use serde::{Deserialize, Serialize};

/// Supported device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceProfile {
    /// Wired detection-response-task unit
    Drt,
    /// Wired DRT variant embedded in the factorial-stimulus unit
    SftDrt,
    /// Wired visual-occlusion goggles
    Vog,
    /// Wireless (radio) DRT unit
    Wdrt,
    /// Wireless (radio) occlusion goggles
    Wvog,
}

/// Config template for the DRT family: stimulus-on ms, debounce ms,
/// ISI bounds ms, stimulus intensity percent.
const DRT_TEMPLATE: &[(&str, &str)] = &[
    ("ONTM", "1000"),
    ("DBNC", "100"),
    ("ISIH", "5000"),
    ("ISIL", "3000"),
    ("SPCT", "100"),
];

/// Config template for the VOG family: lens clear/opaque opacity and
/// durations, debounce ms, start state, data flag, experiment type.
const VOG_TEMPLATE: &[(&str, &str)] = &[
    ("clr", "100"),
    ("cls", "1500"),
    ("dbc", "20"),
    ("srt", "1"),
    ("opn", "1500"),
    ("dta", "0"),
    ("drk", "0"),
    ("typ", "cycle"),
];

const DRT_HEADER: &str =
    "Device_Unit,Label,Host_UTC,Trial,Reaction_Time,Responses,Battery,Device_UTC";

const VOG_HEADER: &str =
    "Device_Unit,Label,Host_UTC,Trial,Open_Time,Responses,Battery,Device_UTC";

impl DeviceProfile {
    /// Every profile, in roster order
    pub const ALL: [DeviceProfile; 5] = [
        DeviceProfile::Drt,
        DeviceProfile::SftDrt,
        DeviceProfile::Vog,
        DeviceProfile::Wdrt,
        DeviceProfile::Wvog,
    ];

    /// Device-type label used on the UI boundary and in node ids
    pub fn label(&self) -> &'static str {
        match self {
            DeviceProfile::Drt => "sDRT",
            DeviceProfile::SftDrt => "sftDRT",
            DeviceProfile::Vog => "sVOG",
            DeviceProfile::Wdrt => "wDRT",
            DeviceProfile::Wvog => "wVOG",
        }
    }

    /// Resolve a label back to a profile
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.label() == label)
    }

    /// True for radio-attached device types
    pub fn is_wireless(&self) -> bool {
        matches!(self, DeviceProfile::Wdrt | DeviceProfile::Wvog)
    }

    /// True for the occlusion-goggle family
    pub fn is_vog(&self) -> bool {
        matches!(self, DeviceProfile::Vog | DeviceProfile::Wvog)
    }

    /// Fixed configuration template for this device type
    pub fn config_template(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            DeviceProfile::Drt | DeviceProfile::SftDrt | DeviceProfile::Wdrt => DRT_TEMPLATE,
            DeviceProfile::Vog | DeviceProfile::Wvog => VOG_TEMPLATE,
        }
    }

    /// Config key holding the debounce window for this type
    pub fn debounce_key(&self) -> &'static str {
        match self {
            DeviceProfile::Drt | DeviceProfile::SftDrt | DeviceProfile::Wdrt => "DBNC",
            DeviceProfile::Vog | DeviceProfile::Wvog => "dbc",
        }
    }

    /// Header line for this type's result file
    pub fn result_header(&self) -> &'static str {
        match self {
            DeviceProfile::Drt | DeviceProfile::SftDrt | DeviceProfile::Wdrt => DRT_HEADER,
            DeviceProfile::Vog | DeviceProfile::Wvog => VOG_HEADER,
        }
    }
}
