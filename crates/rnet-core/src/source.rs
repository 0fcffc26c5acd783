//! Audio sources selectable by any zone.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of device behind a source input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Generic,
    Airplay,
    Bluetooth,
    Spotify,
    Radio,
    Tv,
}

impl SourceType {
    /// Wire representation.
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Generic => 0,
            Self::Airplay => 1,
            Self::Bluetooth => 2,
            Self::Spotify => 3,
            Self::Radio => 4,
            Self::Tv => 5,
        }
    }

    /// Parses the wire representation; unknown values map to `Generic`.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Airplay,
            2 => Self::Bluetooth,
            3 => Self::Spotify,
            4 => Self::Radio,
            5 => Self::Tv,
            _ => Self::Generic,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Generic => "generic",
            Self::Airplay => "airplay",
            Self::Bluetooth => "bluetooth",
            Self::Spotify => "spotify",
            Self::Radio => "radio",
            Self::Tv => "tv",
        };
        f.write_str(s)
    }
}

/// An addressable audio input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: u8,
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
}

impl Source {
    pub fn new(id: u8, name: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            id,
            name: name.into(),
            source_type,
        }
    }
}
