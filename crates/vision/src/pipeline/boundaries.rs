//! Named slot polygons for one machine and their on-disk JSON form
//! (`{"pair1_oc": [[x, y], ...], ...}`).

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use ml_core::ItemClass;
use thiserror::Error;
use tracing::warn;

use crate::pipeline::geometry::{Point, point_in_polygon};

pub const PAIRS: usize = 3;
pub const SLOTS: usize = PAIRS * 2;

/// One of the six (pair, item class) regions of a machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotKey {
    /// Zero-based pair index (`pair1` is 0).
    pub pair: usize,
    pub class: ItemClass,
}

impl SlotKey {
    pub const ALL: [SlotKey; SLOTS] = [
        SlotKey::new(0, ItemClass::OilCan),
        SlotKey::new(0, ItemClass::BunkHole),
        SlotKey::new(1, ItemClass::OilCan),
        SlotKey::new(1, ItemClass::BunkHole),
        SlotKey::new(2, ItemClass::OilCan),
        SlotKey::new(2, ItemClass::BunkHole),
    ];

    pub const fn new(pair: usize, class: ItemClass) -> Self {
        Self { pair, class }
    }

    pub fn name(self) -> String {
        format!("pair{}_{}", self.pair + 1, self.class.slot_suffix())
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|slot| slot.name() == name)
    }

    /// Position in [`SlotKey::ALL`].
    pub fn index(self) -> usize {
        self.pair * 2
            + match self.class {
                ItemClass::OilCan => 0,
                ItemClass::BunkHole => 1,
            }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("failed to access boundary file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed boundary file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Immutable-per-cycle set of the six slot polygons. Reloads build a new set
/// and swap it in whole.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoundarySet {
    polygons: [Vec<Point>; SLOTS],
}

impl BoundarySet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn polygon(&self, slot: SlotKey) -> &[Point] {
        &self.polygons[slot.index()]
    }

    pub fn set_polygon(&mut self, slot: SlotKey, polygon: Vec<Point>) {
        self.polygons[slot.index()] = polygon;
    }

    /// True when no slot has a usable polygon.
    pub fn is_empty(&self) -> bool {
        self.polygons.iter().all(|p| p.len() < 3)
    }

    pub fn contains(&self, slot: SlotKey, point: Point) -> bool {
        point_in_polygon(point, self.polygon(slot))
    }

    /// Builds a set from the slot-name map. Unknown keys are ignored and
    /// polygons with fewer than three points are kept but match nothing.
    pub fn from_map(map: BTreeMap<String, Vec<Point>>) -> Self {
        let mut set = Self::empty();
        for (name, polygon) in map {
            match SlotKey::parse(&name) {
                Some(slot) => {
                    if !polygon.is_empty() && polygon.len() < 3 {
                        warn!("boundary {name} has {} point(s); ignoring it", polygon.len());
                    }
                    set.set_polygon(slot, polygon);
                }
                None => warn!("unknown boundary key {name:?}"),
            }
        }
        set
    }

    pub fn to_map(&self) -> BTreeMap<String, Vec<Point>> {
        SlotKey::ALL
            .into_iter()
            .map(|slot| (slot.name(), self.polygon(slot).to_vec()))
            .collect()
    }

    pub fn load(path: &Path) -> Result<Self, BoundaryError> {
        let raw = fs::read_to_string(path).map_err(|source| BoundaryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let map = serde_json::from_str(&raw).map_err(|source| BoundaryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_map(map))
    }

    /// Missing files yield an empty set; unreadable ones are an error.
    pub fn load_or_empty(path: &Path) -> Result<Self, BoundaryError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::empty())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), BoundaryError> {
        let io_err = |source| BoundaryError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json =
            serde_json::to_string_pretty(&self.to_map()).map_err(|source| BoundaryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        fs::write(path, json + "\n").map_err(io_err)
    }
}
