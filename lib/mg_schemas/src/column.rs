//! Terrain column layout: a vertical stack of 16x16x16 sections, and the light payload sent alongside it.

use bitvec::vec::BitVec;
use thiserror::Error;

use crate::block::BlockState;
use crate::coordinates::{BlockPos, ChunkPos, InSectionPos, SECTION_HEIGHT, SECTION_VOLUME};
use crate::light::{LightChannels, LightLevel, NibbleArray};

/// Errors when describing the vertical extent of a world.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum WorldHeightError {
    /// The height is zero or not divisible by the section height.
    #[error("World height {0} is not a positive multiple of 16")]
    InvalidHeight(u32),
    /// The bottom of the world does not start a section.
    #[error("Minimum world Y {0} is not aligned to a section boundary")]
    UnalignedMinimum(i32),
    /// The world is taller than [`MAX_WORLD_HEIGHT`] or its top doesn't fit in an `i32`.
    #[error("World of height {height} starting at Y {min_y} is out of range")]
    OutOfRange {
        /// Requested bottom Y
        min_y: i32,
        /// Requested height
        height: u32,
    },
}

/// Tallest supported world, in blocks.
pub const MAX_WORLD_HEIGHT: u32 = 4096;

/// Errors when assembling a [`TerrainColumn`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum ColumnError {
    /// The number of sections doesn't match the world height.
    #[error("Column {chunk} has {actual} sections, the world height requires {expected}")]
    SectionCount {
        /// The column position
        chunk: ChunkPos,
        /// Number of sections required by the world height
        expected: usize,
        /// Number of sections given
        actual: usize,
    },
}

/// Errors when reading the light arrays out of a terrain snapshot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum LightExtractionError {
    /// A section was captured without the light data for a channel.
    #[error("Section {section} of {chunk} has no {channel:?} light data")]
    MissingChannel {
        /// The column position
        chunk: ChunkPos,
        /// The section index, counted from the bottom of the world
        section: usize,
        /// The missing channel
        channel: LightChannels,
    },
}

/// The vertical extent of a world, made of whole sections.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct WorldHeight {
    min_y: i32,
    height: u32,
}

impl WorldHeight {
    /// Validates the world bounds.
    pub const fn try_new(min_y: i32, height: u32) -> Result<Self, WorldHeightError> {
        if height == 0 || height % (SECTION_HEIGHT as u32) != 0 {
            return Err(WorldHeightError::InvalidHeight(height));
        }
        if min_y.rem_euclid(SECTION_HEIGHT) != 0 {
            return Err(WorldHeightError::UnalignedMinimum(min_y));
        }
        if height > MAX_WORLD_HEIGHT || min_y as i64 + height as i64 - 1 > i32::MAX as i64 {
            return Err(WorldHeightError::OutOfRange { min_y, height });
        }
        Ok(Self { min_y, height })
    }

    /// Lowest valid Y coordinate.
    pub const fn min_y(&self) -> i32 {
        self.min_y
    }

    /// Highest valid Y coordinate (inclusive).
    pub const fn max_y(&self) -> i32 {
        self.min_y + self.height as i32 - 1
    }

    /// Total height in blocks.
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Number of sections in a column, world height / 16.
    pub const fn section_count(&self) -> usize {
        (self.height / SECTION_HEIGHT as u32) as usize
    }

    /// Index of the section containing the given Y coordinate, counted from the bottom.
    pub const fn section_of(&self, y: i32) -> Option<usize> {
        if y < self.min_y || y > self.max_y() {
            None
        } else {
            Some(((y - self.min_y) / SECTION_HEIGHT) as usize)
        }
    }
}

/// Dense block storage of one section (with strides of X=1, Z=16, Y=16²).
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum SectionBlocks {
    /// Every block in the section is identical
    Singleton(BlockState),
    /// At least one block differs
    Array(Box<[BlockState; SECTION_VOLUME]>),
}

impl Default for SectionBlocks {
    fn default() -> Self {
        Self::Singleton(BlockState::AIR)
    }
}

impl SectionBlocks {
    #[cold]
    fn upgrade(&mut self) -> &mut Box<[BlockState; SECTION_VOLUME]> {
        if let Self::Singleton(e) = *self {
            *self = Self::Array(Box::new([e; SECTION_VOLUME]));
        }
        match self {
            Self::Array(arr) => arr,
            Self::Singleton(_) => unreachable!("section storage was just upgraded"),
        }
    }

    /// Gets the block at the given coordinates.
    #[inline]
    pub fn get(&self, position: InSectionPos) -> BlockState {
        match self {
            Self::Singleton(e) => *e,
            Self::Array(arr) => arr[position.as_index()],
        }
    }

    /// Puts a single block at the given coordinates, returns the old value.
    pub fn put(&mut self, position: InSectionPos, new_value: BlockState) -> BlockState {
        match self {
            Self::Singleton(e) if *e == new_value => new_value,
            Self::Singleton(_) => std::mem::replace(&mut self.upgrade()[position.as_index()], new_value),
            Self::Array(arr) => std::mem::replace(&mut arr[position.as_index()], new_value),
        }
    }

    /// Number of blocks that are not air.
    pub fn non_air_count(&self) -> usize {
        match self {
            Self::Singleton(e) if e.is_air() => 0,
            Self::Singleton(_) => SECTION_VOLUME,
            Self::Array(arr) => arr.iter().filter(|b| !b.is_air()).count(),
        }
    }
}

/// One 16x16x16 section of a terrain column, with its optional packed light arrays.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct ColumnSection {
    /// Block storage
    pub blocks: SectionBlocks,
    /// Light emitted by blocks, if captured
    pub block_light: Option<NibbleArray>,
    /// Light from the sky, if captured
    pub sky_light: Option<NibbleArray>,
}

/// A full-height column of terrain, as captured from the authoritative world or synthesized for a viewer.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct TerrainColumn {
    pos: ChunkPos,
    height: WorldHeight,
    sections: Vec<ColumnSection>,
}

impl TerrainColumn {
    /// Assembles a column from bottom-to-top sections.
    pub fn new(pos: ChunkPos, height: WorldHeight, sections: Vec<ColumnSection>) -> Result<Self, ColumnError> {
        if sections.len() != height.section_count() {
            return Err(ColumnError::SectionCount {
                chunk: pos,
                expected: height.section_count(),
                actual: sections.len(),
            });
        }
        Ok(Self { pos, height, sections })
    }

    /// A column of air with no captured light.
    pub fn empty(pos: ChunkPos, height: WorldHeight) -> Self {
        Self {
            pos,
            height,
            sections: vec![ColumnSection::default(); height.section_count()],
        }
    }

    /// The column position.
    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    /// The vertical extent of the column.
    pub fn height(&self) -> WorldHeight {
        self.height
    }

    /// Sections ordered from the bottom of the world.
    pub fn sections(&self) -> &[ColumnSection] {
        &self.sections
    }

    /// Mutable sections ordered from the bottom of the world.
    pub fn sections_mut(&mut self) -> &mut [ColumnSection] {
        &mut self.sections
    }

    /// Gets the block at the given world position, `None` if it's outside of this column.
    pub fn get_block(&self, pos: BlockPos) -> Option<BlockState> {
        let section = self.locate(pos)?;
        Some(self.sections[section].blocks.get(pos.in_section()))
    }

    /// Replaces the block at the given world position, returns the old block or `None` if it's outside of this column.
    pub fn set_block(&mut self, pos: BlockPos, state: BlockState) -> Option<BlockState> {
        let section = self.locate(pos)?;
        Some(self.sections[section].blocks.put(pos.in_section(), state))
    }

    fn locate(&self, pos: BlockPos) -> Option<usize> {
        if !self.pos.contains(pos) {
            return None;
        }
        self.height.section_of(pos.y)
    }
}

/// Light payload of one channel in one section.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub enum LightSlot {
    /// No data is sent, the client treats the section as dark and recomputes it
    #[default]
    Empty,
    /// A full packed array is sent
    Present(NibbleArray),
}

/// The light data sent together with a column, one slot per section and channel.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ColumnLight {
    block: Vec<LightSlot>,
    sky: Vec<LightSlot>,
}

impl ColumnLight {
    /// A payload with every section empty on both channels.
    pub fn empty(section_count: usize) -> Self {
        Self {
            block: vec![LightSlot::Empty; section_count],
            sky: vec![LightSlot::Empty; section_count],
        }
    }

    /// Copies the captured light arrays out of a terrain column.
    pub fn extract(column: &TerrainColumn) -> Result<Self, LightExtractionError> {
        let count = column.sections().len();
        let mut light = Self {
            block: Vec::with_capacity(count),
            sky: Vec::with_capacity(count),
        };
        for (section, data) in column.sections().iter().enumerate() {
            let missing = |channel| LightExtractionError::MissingChannel {
                chunk: column.pos(),
                section,
                channel,
            };
            let block = data.block_light.clone().ok_or_else(|| missing(LightChannels::BLOCK))?;
            let sky = data.sky_light.clone().ok_or_else(|| missing(LightChannels::SKY))?;
            light.block.push(LightSlot::Present(block));
            light.sky.push(LightSlot::Present(sky));
        }
        Ok(light)
    }

    /// Number of sections covered.
    pub fn section_count(&self) -> usize {
        self.block.len()
    }

    fn slots(&self, channel: LightChannels) -> &[LightSlot] {
        if channel == LightChannels::SKY {
            &self.sky
        } else {
            &self.block
        }
    }

    /// The slot of a single channel in a section.
    pub fn slot(&self, channel: LightChannels, section: usize) -> Option<&LightSlot> {
        self.slots(channel).get(section)
    }

    /// Reads a single channel's level, empty slots read as 0.
    pub fn get(&self, channel: LightChannels, section: usize, pos: InSectionPos) -> Option<u8> {
        match self.slot(channel, section)? {
            LightSlot::Empty => Some(0),
            LightSlot::Present(arr) => Some(arr.get(pos.as_index())),
        }
    }

    /// Writes the level to every channel in `channels`, turning empty slots into arrays obtained from `alloc`.
    /// Returns `false` if the section is out of range.
    pub fn set(
        &mut self,
        channels: LightChannels,
        section: usize,
        pos: InSectionPos,
        level: LightLevel,
        mut alloc: impl FnMut() -> NibbleArray,
    ) -> bool {
        if section >= self.section_count() {
            return false;
        }
        for (channel, slots) in [(LightChannels::BLOCK, &mut self.block), (LightChannels::SKY, &mut self.sky)] {
            if !channels.contains(channel) {
                continue;
            }
            let slot = &mut slots[section];
            if let LightSlot::Empty = slot {
                *slot = LightSlot::Present(alloc());
            }
            if let LightSlot::Present(arr) = slot {
                arr.set(pos.as_index(), level);
            }
        }
        true
    }

    /// Bitmasks of (sections with an array, sections sent as empty) for a single channel.
    pub fn masks(&self, channel: LightChannels) -> (BitVec, BitVec) {
        let slots = self.slots(channel);
        let present: BitVec = slots.iter().map(|s| matches!(s, LightSlot::Present(_))).collect();
        let empty: BitVec = slots.iter().map(|s| matches!(s, LightSlot::Empty)).collect();
        (present, empty)
    }

    /// Checks if no section carries an array.
    pub fn is_fully_empty(&self) -> bool {
        self.block.iter().chain(self.sky.iter()).all(|s| *s == LightSlot::Empty)
    }

    /// Consumes the payload, returning the arrays it carried so they can be reused.
    pub fn into_arrays(self) -> impl Iterator<Item = NibbleArray> {
        self.block.into_iter().chain(self.sky).filter_map(|slot| match slot {
            LightSlot::Present(arr) => Some(arr),
            LightSlot::Empty => None,
        })
    }
}
