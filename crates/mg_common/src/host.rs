//! Capabilities the engine consumes from the hosting game server and its network transport.
//!
//! All of these are implemented by the host; the engine never owns world state or sockets.

use mg_schemas::column::{ColumnLight, TerrainColumn, WorldHeight};
use thiserror::Error;

use crate::prelude::*;

/// Errors when reading authoritative terrain.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum TerrainError {
    /// The world is not loaded by the host.
    #[error("World {0} is not available")]
    WorldUnavailable(WorldId),
    /// The column could not be read, e.g. its region file failed to load.
    #[error("Column {chunk} could not be read: {reason}")]
    ColumnUnavailable {
        /// The requested column
        chunk: ChunkPos,
        /// Host-provided description of the failure
        reason: String,
    },
}

/// Errors when handing a packet to the transport.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum TransportError {
    /// The connection was closed before the packet could be queued.
    #[error("Connection of viewer {0} is closed")]
    Closed(ViewerId),
    /// The transport refused the packet.
    #[error("Packet rejected: {0}")]
    Rejected(String),
}

/// Read access to the authoritative world. Calls may block on disk I/O, so the engine only makes them from its worker pool.
pub trait TerrainSource: Send + Sync + 'static {
    /// The vertical extent of the given world, `None` if it's not loaded.
    fn world_height(&self, world: &WorldId) -> Option<WorldHeight>;
    /// A snapshot of the column at the given position, with light arrays if the host captured them.
    fn terrain_column(&self, world: &WorldId, chunk: ChunkPos) -> Result<TerrainColumn, TerrainError>;
}

/// Knowledge of which viewers are connected and where they are.
pub trait ViewerDirectory: Send + Sync + 'static {
    /// Checks if the viewer has a live connection.
    fn is_connected(&self, viewer: ViewerId) -> bool;
    /// The world the viewer is currently in.
    fn world_of(&self, viewer: ViewerId) -> Option<WorldId>;
}

/// Outgoing packets for a single viewer. Sends are fire-and-forget.
pub trait ViewerSession: Send + Sync {
    /// Tells the client to forget a column.
    fn send_unload_chunk(&self, chunk: ChunkPos) -> Result<(), TransportError>;
    /// Sends a full column with its light payload.
    fn send_chunk_column(&self, column: &TerrainColumn, light: &ColumnLight) -> Result<(), TransportError>;
    /// Sends a batch of individual block updates.
    fn send_positional_block_change(&self, changes: &HashMap<BlockPos, BlockState>) -> Result<(), TransportError>;
}

/// Resolves viewers to their protocol sessions.
pub trait ChunkTransport: Send + Sync + 'static {
    /// The session of a viewer, `None` once the viewer has disconnected.
    fn session(&self, viewer: ViewerId) -> Option<Arc<dyn ViewerSession>>;
}
