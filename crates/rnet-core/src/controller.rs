//! Controllers: hardware units hosting a contiguous range of zones.

use serde::{Deserialize, Serialize};

use crate::{Zone, ZoneId};

/// A controller and the zones it owns.
///
/// Zone ids are contiguous from 0, so `zones[i].id.zone == i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controller {
    pub id: u8,
    zones: Vec<Zone>,
}

impl Controller {
    /// Builds a controller from zone names, assigning ids in order.
    pub fn new<I, S>(id: u8, zone_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let zones = zone_names
            .into_iter()
            .zip(0u8..)
            .map(|(name, zone)| Zone::new(ZoneId::new(id, zone), name))
            .collect();

        Self { id, zones }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zone(&self, zone: u8) -> Option<&Zone> {
        self.zones.get(usize::from(zone))
    }

    pub fn zone_mut(&mut self, zone: u8) -> Option<&mut Zone> {
        self.zones.get_mut(usize::from(zone))
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}
