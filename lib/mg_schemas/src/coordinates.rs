//! Strongly typed newtype wrappers for the coordinate formats used to address blocks, chunk columns and section cells, and the related layout constants.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::Deref;

use bytemuck::{Pod, Zeroable};
use glam::{IVec2, IVec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of bits a block coordinate is shifted by to get the containing chunk coordinate
pub const CHUNK_SHIFT: i32 = 4;
/// Length of the horizontal sides of a chunk column in blocks
pub const CHUNK_DIM: i32 = 1 << CHUNK_SHIFT;
/// Length of the horizontal sides of a chunk column in blocks
pub const CHUNK_DIMZ: usize = CHUNK_DIM as usize;
/// Height of a single column section in blocks
pub const SECTION_HEIGHT: i32 = 16;
/// Height of a single column section in blocks
pub const SECTION_HEIGHTZ: usize = SECTION_HEIGHT as usize;
/// Number of blocks on a horizontal slice of a section
pub const SECTION_DIM2Z: usize = CHUNK_DIMZ * CHUNK_DIMZ;
/// Number of blocks in the volume of a section
pub const SECTION_VOLUME: usize = CHUNK_DIMZ * CHUNK_DIMZ * SECTION_HEIGHTZ;

static_assertions::const_assert_eq!(SECTION_VOLUME, 4096);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
#[error("Given coordinates were outside of section boundaries: {0}")]
/// Error when the given coordinates are outside of the section boundary.
pub struct InSectionVecError(IVec3);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
#[error("Given index was outside of section boundaries: {0}")]
/// Error when the given block index is outside of the section boundary.
pub struct InSectionIndexError(usize);

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Pod, Zeroable, Serialize, Deserialize)]
#[repr(transparent)]
/// An absolute block position in a world
pub struct BlockPos(pub(crate) IVec3);

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Pod, Zeroable, Serialize, Deserialize)]
#[repr(transparent)]
/// A chunk column position in a world, (x, z) in units of [`CHUNK_DIM`] blocks
pub struct ChunkPos(pub(crate) IVec2);

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Pod, Zeroable, Serialize, Deserialize)]
#[repr(transparent)]
/// A block position inside of a single column section, limited to 0..16 on every axis
pub struct InSectionPos(pub(crate) IVec3);

// === BlockPos

impl BlockPos {
    /// (0, 0, 0)
    pub const ZERO: Self = Self(IVec3::ZERO);

    /// Constructs a new position from the given coordinates.
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self(IVec3::new(x, y, z))
    }

    /// Const-friendly from<IVec3>
    pub const fn from_ivec3(value: IVec3) -> Self {
        Self(value)
    }

    /// Const-friendly into<IVec3>
    pub const fn into_ivec3(self) -> IVec3 {
        self.0
    }

    /// The chunk column containing this position.
    #[inline]
    pub const fn chunk(self) -> ChunkPos {
        ChunkPos(IVec2::new(self.0.x >> CHUNK_SHIFT, self.0.z >> CHUNK_SHIFT))
    }

    /// The position of this block within its section, discarding the section index.
    #[inline]
    pub const fn in_section(self) -> InSectionPos {
        InSectionPos(IVec3::new(
            self.0.x & (CHUNK_DIM - 1),
            self.0.y & (SECTION_HEIGHT - 1),
            self.0.z & (CHUNK_DIM - 1),
        ))
    }

    /// Returns the same position with the Y coordinate replaced.
    pub const fn with_y(self, y: i32) -> Self {
        Self(IVec3::new(self.0.x, y, self.0.z))
    }
}

impl From<IVec3> for BlockPos {
    fn from(value: IVec3) -> Self {
        Self::from_ivec3(value)
    }
}

impl From<BlockPos> for IVec3 {
    fn from(value: BlockPos) -> IVec3 {
        value.into_ivec3()
    }
}

impl Deref for BlockPos {
    type Target = IVec3;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Ord for BlockPos {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.to_array().cmp(&other.0.to_array())
    }
}

impl PartialOrd for BlockPos {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for BlockPos {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Block(x={}, y={}, z={})", self.0.x, self.0.y, self.0.z)
    }
}

// === ChunkPos

impl ChunkPos {
    /// (0, 0)
    pub const ZERO: Self = Self(IVec2::ZERO);

    /// Constructs a new chunk position from the given chunk coordinates.
    pub const fn new(x: i32, z: i32) -> Self {
        Self(IVec2::new(x, z))
    }

    /// The chunk X coordinate.
    pub const fn x(self) -> i32 {
        self.0.x
    }

    /// The chunk Z coordinate.
    pub const fn z(self) -> i32 {
        self.0.y
    }

    /// The smallest block X coordinate inside of this column.
    pub const fn min_block_x(self) -> i32 {
        self.0.x << CHUNK_SHIFT
    }

    /// The smallest block Z coordinate inside of this column.
    pub const fn min_block_z(self) -> i32 {
        self.0.y << CHUNK_SHIFT
    }

    /// Checks if the given block position lies inside of this column (at any height).
    pub const fn contains(self, pos: BlockPos) -> bool {
        let c = pos.chunk();
        c.0.x == self.0.x && c.0.y == self.0.y
    }
}

impl Ord for ChunkPos {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.to_array().cmp(&other.0.to_array())
    }
}

impl PartialOrd for ChunkPos {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for ChunkPos {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chunk(x={}, z={})", self.0.x, self.0.y)
    }
}

// === InSectionPos

impl InSectionPos {
    /// Const-friendly try_from<IVec3>
    pub const fn try_from_ivec3(v: IVec3) -> Result<Self, InSectionVecError> {
        let IVec3 { x, y, z } = v;
        if (x < 0) || (x >= CHUNK_DIM) || (y < 0) || (y >= SECTION_HEIGHT) || (z < 0) || (z >= CHUNK_DIM) {
            Err(InSectionVecError(v))
        } else {
            Ok(Self(v))
        }
    }

    /// Constructs a new in-section position, or returns an error if it's outside of section bounds.
    pub const fn try_new(x: i32, y: i32, z: i32) -> Result<Self, InSectionVecError> {
        Self::try_from_ivec3(IVec3::new(x, y, z))
    }

    /// Convert a YZX-ordered section array index into the coordinates
    pub const fn try_from_index(idx: usize) -> Result<Self, InSectionIndexError> {
        if idx >= SECTION_VOLUME {
            return Err(InSectionIndexError(idx));
        }
        let i = idx as i32;
        Ok(Self(IVec3::new(
            i % CHUNK_DIM,
            i / (CHUNK_DIM * CHUNK_DIM),
            (i / CHUNK_DIM) % CHUNK_DIM,
        )))
    }

    /// Converts the coordinates into an index into section block and light arrays (strides of X=1, Z=16, Y=256).
    #[inline]
    pub const fn as_index(self) -> usize {
        ((self.0.y as usize) * SECTION_DIM2Z) + ((self.0.z as usize) * CHUNK_DIMZ) + (self.0.x as usize)
    }
}

impl Deref for InSectionPos {
    type Target = IVec3;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// === BlockRegion

/// An axis-aligned box of block positions, min&max are *inclusive*.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct BlockRegion {
    min: BlockPos,
    max: BlockPos,
}

impl BlockRegion {
    /// Constructs the smallest region containing both corners, in any order.
    pub fn from_corners(a: BlockPos, b: BlockPos) -> Self {
        Self {
            min: BlockPos(a.0.min(b.0)),
            max: BlockPos(a.0.max(b.0)),
        }
    }

    /// The minimum corner.
    pub fn min(&self) -> BlockPos {
        self.min
    }

    /// The maximum corner.
    pub fn max(&self) -> BlockPos {
        self.max
    }

    /// Checks if the position is within the region, with inclusive bounds on every axis.
    pub fn contains(&self, pos: BlockPos) -> bool {
        pos.0.cmpge(self.min.0).all() && pos.0.cmple(self.max.0).all()
    }

    /// Number of block positions in the region.
    pub fn volume(&self) -> u64 {
        let size = (self.max.0 - self.min.0 + IVec3::ONE).as_i64vec3();
        (size.x * size.y * size.z) as u64
    }

    /// All chunk columns intersecting the region, ordered by X then Z.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkPos> {
        let (min, max) = (self.min.chunk(), self.max.chunk());
        (min.x()..=max.x()).flat_map(move |x| (min.z()..=max.z()).map(move |z| ChunkPos::new(x, z)))
    }

    /// Iterates over all the block positions in a column of the region at the given horizontal coordinates, from the top down.
    pub fn iter_column_down(&self, x: i32, z: i32) -> impl Iterator<Item = BlockPos> {
        let inside = x >= self.min.0.x && x <= self.max.0.x && z >= self.min.0.z && z <= self.max.0.z;
        let (min_y, max_y) = if inside { (self.min.0.y, self.max.0.y) } else { (1, 0) };
        (min_y..=max_y).rev().map(move |y| BlockPos::new(x, y, z))
    }
}

impl Display for BlockRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} ..= {}]", self.min, self.max)
    }
}

#[cfg(test)]
mod test {
    use quickcheck_macros::quickcheck;

    use super::*;

    #[test]
    fn chunk_of_negative_coordinates_rounds_down() {
        assert_eq!(BlockPos::new(-1, 0, -16).chunk(), ChunkPos::new(-1, -1));
        assert_eq!(BlockPos::new(-17, 0, 15).chunk(), ChunkPos::new(-2, 0));
        assert_eq!(BlockPos::new(31, 100, 32).chunk(), ChunkPos::new(1, 2));
    }

    #[quickcheck]
    fn chunk_contains_its_blocks(x: i16, y: i16, z: i16) -> bool {
        let (x, y, z) = (i32::from(x) * 7, i32::from(y), i32::from(z) * 7);
        let pos = BlockPos::new(x, y, z);
        let chunk = pos.chunk();
        chunk.contains(pos)
            && (chunk.min_block_x()..chunk.min_block_x() + CHUNK_DIM).contains(&x)
            && (chunk.min_block_z()..chunk.min_block_z() + CHUNK_DIM).contains(&z)
    }

    #[test]
    fn in_section_index_roundtrip() {
        for idx in 0..SECTION_VOLUME {
            let pos = InSectionPos::try_from_index(idx).unwrap();
            assert_eq!(pos.as_index(), idx);
        }
        assert!(InSectionPos::try_from_index(SECTION_VOLUME).is_err());
        assert!(InSectionPos::try_new(16, 0, 0).is_err());
        assert_eq!(InSectionPos::try_new(1, 2, 3).unwrap().as_index(), 2 * 256 + 3 * 16 + 1);
    }

    #[test]
    fn region_from_unordered_corners() {
        let region = BlockRegion::from_corners(BlockPos::new(31, 0, 0), BlockPos::new(0, 15, 31));
        assert_eq!(region.min(), BlockPos::new(0, 0, 0));
        assert_eq!(region.max(), BlockPos::new(31, 15, 31));
        assert_eq!(region.volume(), 32 * 16 * 32);
        assert!(region.contains(BlockPos::new(31, 15, 31)));
        assert!(!region.contains(BlockPos::new(32, 15, 31)));
        assert!(!region.contains(BlockPos::new(0, -1, 0)));
    }

    #[test]
    fn region_chunks_are_inclusive() {
        let region = BlockRegion::from_corners(BlockPos::new(0, 0, 0), BlockPos::new(31, 15, 31));
        let chunks: Vec<_> = region.chunks().collect();
        assert_eq!(
            chunks,
            vec![
                ChunkPos::new(0, 0),
                ChunkPos::new(0, 1),
                ChunkPos::new(1, 0),
                ChunkPos::new(1, 1)
            ]
        );
        let edge = BlockRegion::from_corners(BlockPos::new(15, 0, 15), BlockPos::new(16, 0, 16));
        assert_eq!(edge.chunks().count(), 4);
    }

    #[test]
    fn column_iteration_outside_region_is_empty() {
        let region = BlockRegion::from_corners(BlockPos::new(0, 0, 0), BlockPos::new(3, 3, 3));
        assert_eq!(region.iter_column_down(5, 0).count(), 0);
        let col: Vec<_> = region.iter_column_down(1, 2).collect();
        assert_eq!(col.first(), Some(&BlockPos::new(1, 3, 2)));
        assert_eq!(col.last(), Some(&BlockPos::new(1, 0, 2)));
    }
}
