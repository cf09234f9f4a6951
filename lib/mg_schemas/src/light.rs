//! Light levels, per-position light overrides and the 4-bit packed light arrays sent to clients.

use std::fmt::{Debug, Formatter};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coordinates::SECTION_VOLUME;

/// The brightest light level
pub const MAX_LIGHT: u8 = 15;
/// Length in bytes of a packed light array covering one section, 4 bits per block
pub const LIGHT_ARRAY_LEN: usize = SECTION_VOLUME / 2;
/// The raw value reported for a light channel that has no override
pub const NO_LIGHT_OVERRIDE: i32 = -1;

static_assertions::const_assert_eq!(LIGHT_ARRAY_LEN, 2048);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
#[error("Light level {0} is outside of the 0..=15 range")]
/// Error when a raw light level doesn't fit into 4 bits.
pub struct LightLevelError(pub i32);

/// A light level in the 0..=15 range.
#[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LightLevel(u8);

impl LightLevel {
    /// Complete darkness
    pub const DARK: Self = Self(0);
    /// Full brightness
    pub const FULL: Self = Self(MAX_LIGHT);

    /// Validates the raw light level.
    pub const fn try_new(level: i32) -> Result<Self, LightLevelError> {
        if level >= 0 && level <= MAX_LIGHT as i32 {
            Ok(Self(level as u8))
        } else {
            Err(LightLevelError(level))
        }
    }

    /// The level as a 4-bit value.
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i32> for LightLevel {
    type Error = LightLevelError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

bitflags! {
    /// The independent light channels a client tracks.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
    pub struct LightChannels: u8 {
        /// Light emitted by blocks
        const BLOCK = 0b01;
        /// Ambient light coming from the sky
        const SKY = 0b10;
    }
}

/// Optional per-channel light overrides for a single position.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct LightingData {
    block_light: Option<LightLevel>,
    sky_light: Option<LightLevel>,
}

impl LightingData {
    /// Constructs lighting data with the given channel overrides.
    pub const fn new(block_light: Option<LightLevel>, sky_light: Option<LightLevel>) -> Self {
        Self { block_light, sky_light }
    }

    /// Checks if the block light channel is overridden.
    pub const fn has_custom_block_light(&self) -> bool {
        self.block_light.is_some()
    }

    /// Checks if the sky light channel is overridden.
    pub const fn has_custom_sky_light(&self) -> bool {
        self.sky_light.is_some()
    }

    /// The block light override.
    pub const fn block_light(&self) -> Option<LightLevel> {
        self.block_light
    }

    /// The sky light override.
    pub const fn sky_light(&self) -> Option<LightLevel> {
        self.sky_light
    }

    /// The block light override as a raw level, or [`NO_LIGHT_OVERRIDE`].
    pub fn raw_block_light(&self) -> i32 {
        self.block_light.map_or(NO_LIGHT_OVERRIDE, |l| i32::from(l.get()))
    }

    /// The sky light override as a raw level, or [`NO_LIGHT_OVERRIDE`].
    pub fn raw_sky_light(&self) -> i32 {
        self.sky_light.map_or(NO_LIGHT_OVERRIDE, |l| i32::from(l.get()))
    }

    /// Returns a copy with the given channel(s) set to the level.
    pub fn with(mut self, channels: LightChannels, level: LightLevel) -> Self {
        if channels.contains(LightChannels::BLOCK) {
            self.block_light = Some(level);
        }
        if channels.contains(LightChannels::SKY) {
            self.sky_light = Some(level);
        }
        self
    }

    /// The channels that carry an override.
    pub fn channels(&self) -> LightChannels {
        let mut channels = LightChannels::empty();
        channels.set(LightChannels::BLOCK, self.block_light.is_some());
        channels.set(LightChannels::SKY, self.sky_light.is_some());
        channels
    }

    /// Checks if neither channel is overridden.
    pub const fn is_empty(&self) -> bool {
        self.block_light.is_none() && self.sky_light.is_none()
    }

    /// Overlays the channels set in `other` on top of this value.
    pub fn overlaid_with(self, other: LightingData) -> Self {
        Self {
            block_light: other.block_light.or(self.block_light),
            sky_light: other.sky_light.or(self.sky_light),
        }
    }
}

/// A packed array of 4-bit light values for one section, two blocks per byte.
/// The first block of each pair lives in the low nibble.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct NibbleArray(Box<[u8; LIGHT_ARRAY_LEN]>);

impl Default for NibbleArray {
    fn default() -> Self {
        Self(Box::new([0; LIGHT_ARRAY_LEN]))
    }
}

impl NibbleArray {
    /// A zero-filled (fully dark) array.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps raw packed bytes.
    pub fn from_bytes(bytes: Box<[u8; LIGHT_ARRAY_LEN]>) -> Self {
        Self(bytes)
    }

    /// Copies raw packed bytes, returns `None` if the slice is not exactly [`LIGHT_ARRAY_LEN`] long.
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: &[u8; LIGHT_ARRAY_LEN] = bytes.try_into().ok()?;
        Some(Self(Box::new(*arr)))
    }

    /// The raw packed bytes.
    pub fn as_bytes(&self) -> &[u8; LIGHT_ARRAY_LEN] {
        &self.0
    }

    /// Reads the level at the given section index (see [`crate::coordinates::InSectionPos::as_index`]).
    #[inline]
    pub fn get(&self, index: usize) -> u8 {
        let byte = self.0[index >> 1];
        if index & 1 == 0 {
            byte & 0x0F
        } else {
            byte >> 4
        }
    }

    /// Writes the level at the given section index.
    #[inline]
    pub fn set(&mut self, index: usize, level: LightLevel) {
        let byte = &mut self.0[index >> 1];
        if index & 1 == 0 {
            *byte = (*byte & 0xF0) | level.get();
        } else {
            *byte = (*byte & 0x0F) | (level.get() << 4);
        }
    }

    /// Sets every position to the same level.
    pub fn fill(&mut self, level: LightLevel) {
        let l = level.get();
        self.0.fill(l | (l << 4));
    }

    /// Checks if every position is fully dark.
    pub fn is_dark(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl Debug for NibbleArray {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let lit = self.0.iter().filter(|&&b| b != 0).count();
        write!(f, "NibbleArray{{non_dark_bytes={lit}}}")
    }
}
