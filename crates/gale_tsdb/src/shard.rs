//! Shard handle consumed by data families.

use std::sync::Arc;

use gale_common::types::ShardId;

use crate::buffer::BufferManager;

/// The slice of the owning shard a data family needs: naming for the
/// indicator and the shard-wide buffer ledger.
pub trait Shard: Send + Sync {
    fn database_name(&self) -> &str;
    fn shard_id(&self) -> ShardId;
    fn buffer_manager(&self) -> Arc<BufferManager>;
}
