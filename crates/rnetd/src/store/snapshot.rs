//! Immutable view of the store, shared with readers through a watch channel.

use rnet_core::{Controller, Source, Zone, ZoneId};

/// Controllers (with their zones) and sources at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub controllers: Vec<Controller>,
    /// Sorted by id
    pub sources: Vec<Source>,
}

impl Snapshot {
    pub fn controllers_len(&self) -> usize {
        self.controllers.len()
    }

    /// Number of zones on a controller, 0 if the controller is unknown.
    pub fn zones_len(&self, controller: u8) -> usize {
        self.controller(controller).map_or(0, Controller::len)
    }

    pub fn controller(&self, controller: u8) -> Option<&Controller> {
        self.controllers.iter().find(|c| c.id == controller)
    }

    pub fn zone(&self, id: ZoneId) -> Option<&Zone> {
        self.controller(id.controller)?.zone(id.zone)
    }

    /// Every zone, controller by controller.
    pub fn zones(&self) -> impl Iterator<Item = &Zone> + '_ {
        self.controllers.iter().flat_map(|c| c.zones().iter())
    }

    pub fn sources_len(&self) -> usize {
        self.sources.len()
    }

    pub fn source(&self, id: u8) -> Option<&Source> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// First zone with exactly this name.
    pub fn find_zone_by_name(&self, name: &str) -> Option<&Zone> {
        self.zones().find(|z| z.name == name)
    }

    /// First source with exactly this name.
    pub fn find_source_by_name(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name == name)
    }
}
