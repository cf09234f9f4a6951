//! Chunk packet synthesis: terrain snapshot + the viewer's overrides + lighting, sent as an unload followed by a fresh column.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use mg_schemas::column::{ColumnLight, LightExtractionError, TerrainColumn, WorldHeight};
use mg_schemas::light::{LightChannels, LightLevel, NibbleArray};
use thiserror::Error;

use crate::config::ConfigHandle;
use crate::host::{ChunkTransport, TerrainError, TerrainSource, TransportError, ViewerDirectory, ViewerSession};
use crate::lighting::BlockLightingManager;
use crate::metrics::*;
use crate::overlay::OverlayCache;
use crate::pool::BufferPools;
use crate::prelude::*;

/// One unit of synthesis work.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ChunkUnit {
    /// The receiving viewer
    pub viewer: ViewerId,
    /// The world the column is read from
    pub world: WorldId,
    /// The column
    pub chunk: ChunkPos,
    /// Send an empty column instead of the real one
    pub unload: bool,
}

/// Classified failures of a synthesis unit. The unit is abandoned, other units are unaffected.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The viewer went away before or during synthesis.
    #[error("Viewer {0} is not connected")]
    ViewerDisconnected(ViewerId),
    /// The transport has no session for the viewer.
    #[error("No protocol session for viewer {0}")]
    SessionMissing(ViewerId),
    /// The terrain snapshot could not be read.
    #[error("Terrain snapshot unavailable")]
    TerrainUnavailable(#[from] TerrainError),
    /// The snapshot's light arrays could not be copied.
    #[error("Light extraction failed")]
    LightExtraction(#[from] LightExtractionError),
    /// The transport refused a packet.
    #[error("Packet could not be sent")]
    Transport(#[from] TransportError),
}

/// The payload of one column update.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SynthesizedChunk {
    /// Blocks with the viewer's overrides applied
    pub column: TerrainColumn,
    /// Light sent with the column
    pub light: ColumnLight,
}

/// Builds and sends column updates. Shared by every worker thread.
pub struct ChunkSynthesizer {
    pub(crate) terrain: Arc<dyn TerrainSource>,
    pub(crate) transport: Arc<dyn ChunkTransport>,
    pub(crate) directory: Arc<dyn ViewerDirectory>,
    pub(crate) overlay: Arc<OverlayCache>,
    pub(crate) lighting: Arc<BlockLightingManager>,
    pub(crate) pools: Arc<BufferPools>,
    pub(crate) config: ConfigHandle,
    pub(crate) metrics: Arc<PerformanceMonitor>,
}

impl ChunkSynthesizer {
    /// Produces the payload for a unit without sending anything.
    pub fn build_payload(&self, unit: &ChunkUnit) -> Result<SynthesizedChunk, SynthesisError> {
        if !self.directory.is_connected(unit.viewer) {
            return Err(SynthesisError::ViewerDisconnected(unit.viewer));
        }
        let height = self
            .terrain
            .world_height(&unit.world)
            .ok_or_else(|| TerrainError::WorldUnavailable(unit.world.clone()))?;
        if unit.unload {
            return Ok(SynthesizedChunk {
                column: TerrainColumn::empty(unit.chunk, height),
                light: ColumnLight::empty(height.section_count()),
            });
        }

        let mut column = self
            .metrics
            .time(OP_TERRAIN_FETCH, || self.terrain.terrain_column(&unit.world, unit.chunk))?;
        if column.height() != height {
            warn!(
                chunk = %unit.chunk,
                world = ?height,
                column = ?column.height(),
                "Terrain column doesn't match the world height, using the column's"
            );
        }
        let height = column.height();
        if let Some(overrides) = self.overlay.get_chunk(unit.viewer, unit.chunk) {
            for (&pos, &block) in overrides.iter() {
                column.set_block(pos, block);
            }
        }

        let mut light = if self.config.load().preserve_lighting {
            match ColumnLight::extract(&column).map_err(SynthesisError::from) {
                Ok(light) => light,
                Err(e) => {
                    warn!(viewer = %unit.viewer, chunk = %unit.chunk, "Falling back to empty light: {:#}", anyhow::Error::new(e));
                    self.metrics.increment(COUNTER_LIGHT_FALLBACKS);
                    ColumnLight::empty(height.section_count())
                }
            }
        } else {
            ColumnLight::empty(height.section_count())
        };
        self.apply_custom_lighting(unit, &column, height, &mut light);
        Ok(SynthesizedChunk { column, light })
    }

    fn apply_custom_lighting(&self, unit: &ChunkUnit, column: &TerrainColumn, height: WorldHeight, light: &mut ColumnLight) {
        let scopes = self.overlay.visible_light_scopes(unit.viewer);
        if scopes.is_empty() {
            return;
        }
        let custom = self.lighting.lighting_in_chunk(&scopes, unit.chunk);
        for (pos, data) in custom {
            let Some(section) = height.section_of(pos.y) else {
                continue;
            };
            let base = |captured: &Option<NibbleArray>| -> NibbleArray {
                captured.clone().unwrap_or_else(|| self.pools.light_arrays.acquire())
            };
            let Some(captured) = column.sections().get(section) else {
                debug!(chunk = %unit.chunk, section, "Custom light outside of the column");
                continue;
            };
            let channels: [(LightChannels, Option<LightLevel>, &Option<NibbleArray>); 2] = [
                (LightChannels::BLOCK, data.block_light(), &captured.block_light),
                (LightChannels::SKY, data.sky_light(), &captured.sky_light),
            ];
            for (channel, level, captured) in channels {
                if let Some(level) = level {
                    light.set(channel, section, pos.in_section(), level, || base(captured));
                }
            }
        }
    }

    /// Builds the payload and sends it as an unload immediately followed by the column.
    pub fn process(&self, unit: &ChunkUnit) -> Result<(), SynthesisError> {
        if !self.directory.is_connected(unit.viewer) {
            return Err(SynthesisError::ViewerDisconnected(unit.viewer));
        }
        let session: Arc<dyn ViewerSession> = self
            .transport
            .session(unit.viewer)
            .ok_or(SynthesisError::SessionMissing(unit.viewer))?;
        let payload = self.build_payload(unit)?;
        // The viewer may have left while the terrain was read
        if !self.directory.is_connected(unit.viewer) {
            self.recycle(payload);
            return Err(SynthesisError::ViewerDisconnected(unit.viewer));
        }
        let sent = session
            .send_unload_chunk(unit.chunk)
            .and_then(|_| session.send_chunk_column(&payload.column, &payload.light));
        self.recycle(payload);
        Ok(sent?)
    }

    fn recycle(&self, payload: SynthesizedChunk) {
        for array in payload.light.into_arrays() {
            self.pools.light_arrays.release(array);
        }
    }

    /// Runs a unit to completion, never propagating failures: they are logged and counted.
    pub fn run_unit(&self, unit: ChunkUnit) {
        let span = tracing::trace_span!("synthesize_chunk", viewer = %unit.viewer, chunk = %unit.chunk, unload = unit.unload);
        let _entered = span.enter();
        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.process(&unit)));
        self.metrics.record(OP_SYNTHESIZE_CHUNK, start.elapsed());
        match outcome {
            Ok(Ok(())) => self.metrics.increment(COUNTER_UNITS_COMPLETED),
            Ok(Err(SynthesisError::ViewerDisconnected(_))) => {
                self.metrics.increment(COUNTER_PROCESSING_ERRORS);
                debug!(viewer = %unit.viewer, chunk = %unit.chunk, "Dropped chunk update for a disconnected viewer");
            }
            Ok(Err(e)) => {
                self.metrics.increment(COUNTER_PROCESSING_ERRORS);
                warn!(viewer = %unit.viewer, chunk = %unit.chunk, world = %unit.world, "Chunk synthesis failed: {:#}", anyhow::Error::new(e));
            }
            Err(panic) => {
                self.metrics.increment(COUNTER_UNEXPECTED_ERRORS);
                error!(
                    viewer = %unit.viewer,
                    chunk = %unit.chunk,
                    world = %unit.world,
                    unload = unit.unload,
                    "Unexpected failure in chunk synthesis: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
