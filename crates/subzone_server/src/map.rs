//! The map-data contract.
//!
//! Parsing `.lvl` files is external; the core consumes tiles, regions, the
//! turf-flag count, and the checksum through [`MapData`], registered on each
//! arena's broker.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// A tile coordinate. Maps are 1024x1024 tiles.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TileCoord {
    pub x: u16,
    pub y: u16,
}

impl TileCoord {
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }
}

/// What occupies a tile, reduced to what the core needs to know.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum Tile {
    #[default]
    Empty,
    Solid,
    Door,
    Safe,
    Goal,
    FlyOver,
    FlyUnder,
    Brick,
    /// A turf flag tile.
    Flag,
}

impl Tile {
    /// Whether a ship can occupy this tile.
    pub fn is_flyable(self) -> bool {
        self != Self::Solid
    }
}

/// Region attributes relevant to the core at one tile.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct RegionFlags {
    /// Carry flags may not come to rest here.
    pub no_flag_drops: bool,
}

/// Read access to one arena's map.
pub trait MapData: Send + Sync {
    fn tile(&self, coord: TileCoord) -> Tile;

    /// Combined flags of every region covering `coord`.
    fn regions_at(&self, coord: TileCoord) -> RegionFlags;

    /// Number of turf flags on the map.
    fn flag_count(&self) -> u16;

    /// Map checksum, used to invalidate persisted flag state after a map
    /// change.
    fn checksum(&self) -> u32;

    fn width(&self) -> u16 {
        1024
    }

    fn height(&self) -> u16 {
        1024
    }
}

/// A sparse in-memory map for tests and embedders without a `.lvl` reader.
/// Unset tiles are empty.
#[derive(Default)]
pub struct GridMap {
    tiles: RwLock<FxHashMap<TileCoord, Tile>>,
    no_drop_rects: RwLock<Vec<(TileCoord, TileCoord)>>,
    flag_count: u16,
    checksum: u32,
}

impl GridMap {
    pub fn new(flag_count: u16, checksum: u32) -> Self {
        Self {
            tiles: RwLock::default(),
            no_drop_rects: RwLock::default(),
            flag_count,
            checksum,
        }
    }

    pub fn set_tile(&self, coord: TileCoord, tile: Tile) {
        self.tiles.write().insert(coord, tile);
    }

    /// Marks an inclusive rectangle as a no-flag-drop region.
    pub fn add_no_drop_rect(&self, min: TileCoord, max: TileCoord) {
        self.no_drop_rects.write().push((min, max));
    }
}

impl MapData for GridMap {
    fn tile(&self, coord: TileCoord) -> Tile {
        self.tiles.read().get(&coord).copied().unwrap_or_default()
    }

    fn regions_at(&self, coord: TileCoord) -> RegionFlags {
        let no_flag_drops = self
            .no_drop_rects
            .read()
            .iter()
            .any(|(min, max)| {
                (min.x..=max.x).contains(&coord.x) && (min.y..=max.y).contains(&coord.y)
            });
        RegionFlags { no_flag_drops }
    }

    fn flag_count(&self) -> u16 {
        self.flag_count
    }

    fn checksum(&self) -> u32 {
        self.checksum
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn grid_map_defaults_to_empty() {
        let map = GridMap::new(3, 0xABCD);
        assert_eq!(map.tile(TileCoord::new(5, 5)), Tile::Empty);
        assert!(map.tile(TileCoord::new(5, 5)).is_flyable());

        map.set_tile(TileCoord::new(5, 5), Tile::Solid);
        assert!(!map.tile(TileCoord::new(5, 5)).is_flyable());
        assert_eq!(map.flag_count(), 3);
    }

    #[test]
    fn no_drop_rect_covers_inclusive_bounds() {
        let map = GridMap::new(0, 0);
        map.add_no_drop_rect(TileCoord::new(10, 10), TileCoord::new(12, 12));

        assert!(map.regions_at(TileCoord::new(10, 12)).no_flag_drops);
        assert!(map.regions_at(TileCoord::new(12, 10)).no_flag_drops);
        assert!(!map.regions_at(TileCoord::new(13, 10)).no_flag_drops);
    }
}
