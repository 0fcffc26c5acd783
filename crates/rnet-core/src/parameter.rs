//! Extra per-zone parameters (tone, loudness, turn-on volume, do-not-disturb).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult};

/// Small-integer-keyed zone parameter.
///
/// The set is fixed: any id not listed here is rejected with
/// [`DomainError::InvalidParameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ZoneParameter {
    Bass,
    Treble,
    Loudness,
    TurnOnVolume,
    DoNotDisturb,
}

impl ZoneParameter {
    /// Every known parameter, in id order.
    pub const ALL: [ZoneParameter; 5] = [
        ZoneParameter::Bass,
        ZoneParameter::Treble,
        ZoneParameter::Loudness,
        ZoneParameter::TurnOnVolume,
        ZoneParameter::DoNotDisturb,
    ];

    /// Wire id of the parameter.
    pub const fn id(self) -> u8 {
        match self {
            Self::Bass => 0,
            Self::Treble => 1,
            Self::Loudness => 2,
            Self::TurnOnVolume => 4,
            Self::DoNotDisturb => 6,
        }
    }

    /// Looks up a parameter by wire id.
    pub fn from_id(id: u8) -> DomainResult<Self> {
        match id {
            0 => Ok(Self::Bass),
            1 => Ok(Self::Treble),
            2 => Ok(Self::Loudness),
            4 => Ok(Self::TurnOnVolume),
            6 => Ok(Self::DoNotDisturb),
            _ => Err(DomainError::InvalidParameter { id }),
        }
    }

    /// Value a freshly configured zone starts with.
    pub const fn default_value(self) -> i8 {
        match self {
            Self::TurnOnVolume => 20,
            _ => 0,
        }
    }

    /// Whether the parameter is an on/off flag.
    pub const fn is_flag(self) -> bool {
        matches!(self, Self::Loudness | Self::DoNotDisturb)
    }

    /// Validates a requested value against the parameter's range.
    pub fn validate(self, value: i32) -> DomainResult<i8> {
        let (min, max, expected) = match self {
            Self::Bass | Self::Treble => (-10, 10, "-10..=10"),
            Self::TurnOnVolume => (0, 100, "0..=100"),
            Self::Loudness | Self::DoNotDisturb => (0, 1, "0 or 1"),
        };

        if value < min || value > max {
            return Err(DomainError::InvalidValue {
                field: self.name(),
                value,
                expected,
            });
        }

        // Range checked above, always fits
        i8::try_from(value).map_err(|_| DomainError::InvalidValue {
            field: self.name(),
            value,
            expected,
        })
    }

    /// Human readable name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bass => "bass",
            Self::Treble => "treble",
            Self::Loudness => "loudness",
            Self::TurnOnVolume => "turn-on volume",
            Self::DoNotDisturb => "do-not-disturb",
        }
    }
}

impl fmt::Display for ZoneParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_id_round_trips_known_ids() {
        for param in ZoneParameter::ALL {
            assert_eq!(ZoneParameter::from_id(param.id()).unwrap(), param);
        }
    }

    #[test]
    fn test_from_id_rejects_gaps_and_out_of_range() {
        for id in [3u8, 5, 7, 0x7F, 0xFF] {
            assert_eq!(
                ZoneParameter::from_id(id),
                Err(DomainError::InvalidParameter { id })
            );
        }
    }

    #[test]
    fn test_validate_ranges() {
        assert_eq!(ZoneParameter::Bass.validate(-10).unwrap(), -10);
        assert_eq!(ZoneParameter::Treble.validate(10).unwrap(), 10);
        assert!(ZoneParameter::Bass.validate(11).is_err());
        assert!(ZoneParameter::Treble.validate(-11).is_err());
        assert_eq!(ZoneParameter::TurnOnVolume.validate(100).unwrap(), 100);
        assert!(ZoneParameter::TurnOnVolume.validate(101).is_err());
        assert_eq!(ZoneParameter::Loudness.validate(1).unwrap(), 1);
        assert!(ZoneParameter::DoNotDisturb.validate(2).is_err());
    }

    #[test]
    fn test_invalid_value_display() {
        let err = ZoneParameter::Bass.validate(42).unwrap_err();
        assert_eq!(err.to_string(), "Invalid bass: 42 (expected -10..=10)");
    }
}
