// Listener unregistration on a broadcaster: the broadcaster is a one-pointer
// wrapper around its data block, and the listener pool header sits at a fixed
// offset inside that block. Releasing a listener marks its slot free.
use tracing::debug;

use crate::core::directory::Directory;
use crate::core::error::{Error, ErrorKind};
use crate::core::geometry::PoolGeometry;
use crate::core::memory::Memory;
use crate::core::resolver::{Handle, SlotLocation, SlotPool};

/// Pool header address for the broadcaster at `broadcaster`.
pub fn listener_pool_header<M: Memory + ?Sized>(
    memory: &M,
    broadcaster: u64,
    listener_pool_offset: u64,
) -> Result<u64, Error> {
    let data = memory.read_u64(broadcaster)?;
    if data == 0 {
        return Err(Error::new(ErrorKind::Fault)
            .with_message("broadcaster has no data block")
            .with_address(broadcaster));
    }
    Ok(data.wrapping_add(listener_pool_offset))
}

/// Marks the listener slot for `handle` free and returns where it was.
pub fn unlisten<M, D>(
    memory: &M,
    directory: &D,
    geometry: &PoolGeometry,
    listener_pool_offset: u64,
    broadcaster: u64,
    handle: Handle,
) -> Result<SlotLocation, Error>
where
    M: Memory + ?Sized,
    D: Directory<M> + ?Sized,
{
    let header = listener_pool_header(memory, broadcaster, listener_pool_offset)?;
    let location = SlotPool::new(memory, directory, geometry, header).release_located(handle)?;
    debug!(
        broadcaster,
        handle = handle.raw(),
        slot = location.slot_address,
        "listener released"
    );
    Ok(location)
}
