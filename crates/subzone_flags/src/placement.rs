//! Flag placement: finding tiles where a flag may come to rest.

use rand::seq::SliceRandom;
use rand::Rng;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use subzone_server::{MapData, Tile, TileCoord};

/// A ship-passable tile that is not a one-tile-wide corridor. Flags dropped
/// in single-wide corridors are unreachable without ramming the wall.
pub(crate) fn is_walkable(map: &dyn MapData, coord: TileCoord) -> bool {
    if !map.tile(coord).is_flyable() {
        return false;
    }

    let solid = |dx: i32, dy: i32| {
        let x = i32::from(coord.x) + dx;
        let y = i32::from(coord.y) + dy;
        if x < 0 || y < 0 || x >= i32::from(map.width()) || y >= i32::from(map.height()) {
            return true;
        }
        !map.tile(TileCoord::new(x as u16, y as u16)).is_flyable()
    };

    let vertical_squeeze = solid(-1, 0) && solid(1, 0);
    let horizontal_squeeze = solid(0, -1) && solid(0, 1);
    !(vertical_squeeze || horizontal_squeeze)
}

/// Whether a flag may come to rest on this tile: empty, no other flag, and
/// no region forbidding drops.
fn is_available(map: &dyn MapData, occupied: &FxHashSet<TileCoord>, coord: TileCoord) -> bool {
    map.tile(coord) == Tile::Empty
        && !occupied.contains(&coord)
        && !map.regions_at(coord).no_flag_drops
}

/// Walks breadth-first from `start` over walkable tiles collecting available
/// ones, stopping once `needed` are found or `max_radius` steps exhausted.
/// Candidates come back shuffled so repeated drops at one spot scatter.
pub(crate) fn find_drop_spots(
    map: &dyn MapData,
    occupied: &FxHashSet<TileCoord>,
    start: TileCoord,
    needed: usize,
    max_radius: u32,
    rng: &mut impl Rng,
) -> Vec<TileCoord> {
    let mut candidates = Vec::new();
    if needed == 0 {
        return candidates;
    }

    let mut visited: FxHashSet<TileCoord> = FxHashSet::default();
    let mut queue: VecDeque<(TileCoord, u32)> = VecDeque::new();
    visited.insert(start);
    queue.push_back((start, 0));

    while let Some((coord, depth)) = queue.pop_front() {
        if is_available(map, occupied, coord) {
            candidates.push(coord);
            if candidates.len() >= needed {
                break;
            }
        }
        if depth >= max_radius {
            continue;
        }
        for (dx, dy) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
            let x = i32::from(coord.x) + dx;
            let y = i32::from(coord.y) + dy;
            if x < 0 || y < 0 || x >= i32::from(map.width()) || y >= i32::from(map.height()) {
                continue;
            }
            let next = TileCoord::new(x as u16, y as u16);
            if visited.insert(next) && is_walkable(map, next) {
                queue.push_back((next, depth + 1));
            }
        }
    }

    candidates.shuffle(rng);
    candidates.truncate(needed);
    candidates
}

/// A uniformly random tile inside the circle around `center`, clamped to
/// the map.
pub(crate) fn random_in_circle(
    map: &dyn MapData,
    center: TileCoord,
    radius: u32,
    rng: &mut impl Rng,
) -> TileCoord {
    let r = (radius as f64) * rng.gen::<f64>().sqrt();
    let theta = rng.gen::<f64>() * std::f64::consts::TAU;
    let x = f64::from(center.x) + r * theta.cos();
    let y = f64::from(center.y) + r * theta.sin();
    TileCoord::new(
        (x.round().max(0.0) as u16).min(map.width() - 1),
        (y.round().max(0.0) as u16).min(map.height() - 1),
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use subzone_server::GridMap;

    use super::*;

    fn walled_corridor() -> GridMap {
        // A vertical 1-wide corridor at x=5, y=1..=3.
        let map = GridMap::new(0, 0);
        for y in 0..=4u16 {
            map.set_tile(TileCoord::new(4, y), Tile::Solid);
            map.set_tile(TileCoord::new(6, y), Tile::Solid);
        }
        map
    }

    #[test]
    fn single_wide_corridors_are_not_walkable() {
        let map = walled_corridor();
        assert!(!is_walkable(&map, TileCoord::new(5, 2)));
        assert!(is_walkable(&map, TileCoord::new(10, 10)));
    }

    #[test]
    fn bfs_skips_occupied_and_no_drop_tiles() {
        let map = GridMap::new(0, 0);
        map.add_no_drop_rect(TileCoord::new(0, 0), TileCoord::new(1023, 9));

        let mut occupied = FxHashSet::default();
        occupied.insert(TileCoord::new(100, 100));

        let mut rng = rand::thread_rng();
        let spots = find_drop_spots(&map, &occupied, TileCoord::new(100, 100), 5, 20, &mut rng);
        assert_eq!(spots.len(), 5);
        assert!(spots.iter().all(|s| !occupied.contains(s)));
        assert!(spots.iter().all(|s| s.y >= 10));
    }

    #[test]
    fn exhausted_walk_returns_what_it_found() {
        // A sealed 3x3 room with the center start: 8 reachable tiles + start.
        let map = GridMap::new(0, 0);
        for i in 0..=4u16 {
            map.set_tile(TileCoord::new(i, 0), Tile::Solid);
            map.set_tile(TileCoord::new(i, 4), Tile::Solid);
            map.set_tile(TileCoord::new(0, i), Tile::Solid);
            map.set_tile(TileCoord::new(4, i), Tile::Solid);
        }

        let mut rng = rand::thread_rng();
        let spots = find_drop_spots(
            &map,
            &FxHashSet::default(),
            TileCoord::new(2, 2),
            50,
            100,
            &mut rng,
        );
        assert_eq!(spots.len(), 9);
    }

    #[test]
    fn random_in_circle_stays_in_bounds() {
        let map = GridMap::new(0, 0);
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let c = random_in_circle(&map, TileCoord::new(2, 2), 50, &mut rng);
            assert!(c.x < map.width() && c.y < map.height());
        }
    }
}
