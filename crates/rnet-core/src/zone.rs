//! Zone entities and the volume rules the hardware imposes on them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult, ZoneParameter};

/// Upper bound for a zone's configurable maximum volume.
pub const MAX_VOLUME_LIMIT: u8 = 100;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Stable key of a zone: the owning controller plus the zone index on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId {
    pub controller: u8,
    pub zone: u8,
}

impl ZoneId {
    pub const fn new(controller: u8, zone: u8) -> Self {
        Self { controller, zone }
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.controller, self.zone)
    }
}

// ============================================================================
// Volume Rules
// ============================================================================

/// Normalizes a requested volume to what the hardware can store.
///
/// Odd values round down to the nearest even step, then the result is
/// clamped into `0..=max_volume`. Negative and oversized requests clamp
/// instead of failing.
///
/// ```
/// use rnet_core::normalize_volume;
///
/// assert_eq!(normalize_volume(55, 80), 54);
/// assert_eq!(normalize_volume(-7, 80), 0);
/// assert_eq!(normalize_volume(250, 80), 80);
/// ```
pub fn normalize_volume(requested: i32, max_volume: u8) -> u8 {
    let even = requested.div_euclid(2).saturating_mul(2);
    let clamped = even.clamp(0, i32::from(max_volume));
    u8::try_from(clamped).unwrap_or(max_volume)
}

// ============================================================================
// Zone
// ============================================================================

/// An addressable audio output owned by exactly one controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub power: bool,
    /// Always even and never above `max_volume`
    pub volume: u8,
    pub muted: bool,
    /// Selected source, `None` when nothing is routed
    #[serde(rename = "source")]
    pub source_id: Option<u8>,
    pub max_volume: u8,
    pub parameters: BTreeMap<ZoneParameter, i8>,
}

impl Zone {
    /// Creates a powered-off zone with default parameters.
    pub fn new(id: ZoneId, name: impl Into<String>) -> Self {
        let parameters = ZoneParameter::ALL
            .iter()
            .map(|p| (*p, p.default_value()))
            .collect();

        Self {
            id,
            name: name.into(),
            power: false,
            volume: 0,
            muted: false,
            source_id: None,
            max_volume: MAX_VOLUME_LIMIT,
            parameters,
        }
    }

    /// Returns the current value of a parameter.
    pub fn parameter(&self, parameter: ZoneParameter) -> i8 {
        self.parameters
            .get(&parameter)
            .copied()
            .unwrap_or_else(|| parameter.default_value())
    }

    /// Sets the power flag. Returns true if it changed.
    pub fn set_power(&mut self, power: bool) -> bool {
        let changed = self.power != power;
        self.power = power;
        changed
    }

    /// Sets the mute flag. Returns true if it changed.
    pub fn set_muted(&mut self, muted: bool) -> bool {
        let changed = self.muted != muted;
        self.muted = muted;
        changed
    }

    /// Selects a source. Returns true if it changed.
    pub fn set_source(&mut self, source_id: Option<u8>) -> bool {
        let changed = self.source_id != source_id;
        self.source_id = source_id;
        changed
    }

    /// Renames the zone. Returns true if it changed.
    pub fn set_name(&mut self, name: &str) -> bool {
        if self.name == name {
            return false;
        }
        self.name = name.to_string();
        true
    }

    /// Stores a normalized volume and returns the value actually stored.
    pub fn set_volume(&mut self, requested: i32) -> u8 {
        self.volume = normalize_volume(requested, self.max_volume);
        self.volume
    }

    /// Validates and stores a parameter value.
    ///
    /// On error the zone is left untouched.
    pub fn set_parameter(&mut self, parameter: ZoneParameter, value: i32) -> DomainResult<i8> {
        let value = parameter.validate(value)?;
        self.parameters.insert(parameter, value);
        Ok(value)
    }

    /// Sets the maximum volume, lowering the current volume if it is now too loud.
    ///
    /// The maximum is stored rounded down to an even step so the clamped
    /// volume stays even. Returns the stored maximum.
    pub fn set_max_volume(&mut self, requested: i32) -> DomainResult<u8> {
        if requested < 0 || requested > i32::from(MAX_VOLUME_LIMIT) {
            return Err(DomainError::InvalidValue {
                field: "max volume",
                value: requested,
                expected: "0..=100",
            });
        }

        self.max_volume = normalize_volume(requested, MAX_VOLUME_LIMIT);
        if self.volume > self.max_volume {
            self.volume = self.max_volume;
        }
        Ok(self.max_volume)
    }
}
