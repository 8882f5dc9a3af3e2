use alloc::vec::Vec;

use hal::{
    is_page_aligned, page_align_up, Access, CacheOps, Errno, FrameAllocator, PagingOps, Range,
    Region, VirtAddr, PAGE_SIZE,
};
use kernel_abi::{ProcessId, RangeRecord, ShareRecord};
use log::{debug, warn};

use crate::config::MAXIMUM_MEMORY_SHARES;
use crate::memory::{fill_physical, release_pages, MemoryContext};

/// Lifetime of one side of a shared-memory relationship.
///
/// A stored record is either `Attached` (both sides mapped) or
/// `DetachedRemote` (the peer is gone and this side owns the memory).
/// Detaching moves it to `DetachedLocal` when the peer still holds the
/// memory, or to `Released` when the physical pages were freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareState {
    Attached,
    DetachedLocal,
    DetachedRemote,
    Released,
}

/// Bookkeeping record of one shared memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryShare {
    /// Process on the other side.
    pub pid: ProcessId,
    pub core_id: u32,
    pub tag_id: u64,
    /// Mapping on this side.
    pub range: Range,
    pub state: ShareState,
}

impl MemoryShare {
    /// Returns true while both sides hold the memory.
    pub fn is_attached(&self) -> bool {
        self.state == ShareState::Attached
    }

    fn matches(&self, pid: ProcessId, core_id: u32, tag_id: u64) -> bool {
        self.pid == pid && self.core_id == core_id && self.tag_id == tag_id
    }

    /// Wire form handed to user space.
    pub fn to_record(&self) -> ShareRecord {
        ShareRecord {
            pid: self.pid.raw(),
            core_id: self.core_id,
            tag_id: self.tag_id,
            range: RangeRecord::from(self.range),
            attached: self.is_attached() as u32,
            reserved: 0,
        }
    }
}

/// Parameters of a two-sided share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareRequest {
    pub core_id: u32,
    pub tag_id: u64,
    pub size: u64,
    pub access: Access,
}

/// Memory shares held by one process.
#[derive(Debug)]
pub struct ProcessShares {
    pid: ProcessId,
    shares: Vec<MemoryShare>,
}

/// Share table and address space of one process, borrowed together.
pub struct ShareEndpoint<'a, P: PagingOps> {
    pub shares: &'a mut ProcessShares,
    pub memory: &'a mut MemoryContext<P>,
}

impl ProcessShares {
    /// Creates an empty collection owned by `pid`.
    pub fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            shares: Vec::new(),
        }
    }

    /// Owner of this collection.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Returns the number of recorded shares.
    pub fn len(&self) -> usize {
        self.shares.len()
    }

    /// Returns true if no share is recorded.
    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    /// Iterates over every recorded share.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryShare> {
        self.shares.iter()
    }

    /// Returns true if any recorded share maps part of `[virt, virt + size)`.
    pub fn overlaps(&self, virt: VirtAddr, size: u64) -> bool {
        let end = virt.saturating_add(size.max(1));
        self.shares.iter().any(|share| {
            let share_end = share.range.virt.saturating_add(page_align_up(share.range.size));
            virt < share_end && share.range.virt < end
        })
    }

    /// Distinct peer processes, excluding the kernel.
    pub fn peers(&self) -> Vec<ProcessId> {
        let mut peers: Vec<ProcessId> = Vec::new();
        for share in &self.shares {
            if !share.pid.is_kernel() && !peers.contains(&share.pid) {
                peers.push(share.pid);
            }
        }
        peers
    }

    fn position(&self, pid: ProcessId, core_id: u32, tag_id: u64) -> Option<usize> {
        self.shares
            .iter()
            .position(|share| share.matches(pid, core_id, tag_id))
    }

    fn insert(&mut self, share: MemoryShare) -> Result<(), Errno> {
        if self.shares.len() >= MAXIMUM_MEMORY_SHARES {
            return Err(Errno::OutOfMemory);
        }
        self.shares.push(share);
        Ok(())
    }

    /// Records an existing local mapping as shared with `pid`.
    ///
    /// Nothing is allocated. A share with the kernel starts out detached
    /// on the remote side, so this process frees the memory on release.
    pub fn create_local_share<P: PagingOps>(
        &mut self,
        memory: &MemoryContext<P>,
        pid: ProcessId,
        core_id: u32,
        tag_id: u64,
        virt: VirtAddr,
        size: u64,
    ) -> Result<(), Errno> {
        if size == 0 || !is_page_aligned(size) || !is_page_aligned(virt) {
            return Err(Errno::InvalidArgument);
        }
        if self.position(pid, core_id, tag_id).is_some() {
            return Err(Errno::AlreadyExists);
        }
        let phys = memory.lookup(virt)?;
        let access = memory.access(virt)?;
        let state = if pid.is_kernel() {
            ShareState::DetachedRemote
        } else {
            ShareState::Attached
        };
        self.insert(MemoryShare {
            pid,
            core_id,
            tag_id,
            range: Range::new(virt, phys, size, access),
            state,
        })
    }

    /// Exact-match lookup.
    pub fn read_share(&self, pid: ProcessId, core_id: u32, tag_id: u64) -> Result<MemoryShare, Errno> {
        self.position(pid, core_id, tag_id)
            .map(|index| self.shares[index])
            .ok_or(Errno::NotFound)
    }

    fn mark_detached_remote(&mut self, pid: ProcessId, core_id: u32, tag_id: u64) -> bool {
        match self.position(pid, core_id, tag_id) {
            Some(index) => {
                self.shares[index].state = ShareState::DetachedRemote;
                true
            }
            None => false,
        }
    }
}

/// Creates fresh shared memory mapped into both processes.
///
/// Returns the local record and the remote record. On any failure both
/// address spaces and the allocator are left as they were.
pub fn create_share<P: PagingOps, C: CacheOps, F: FrameAllocator>(
    local: ShareEndpoint<'_, P>,
    remote: ShareEndpoint<'_, P>,
    request: ShareRequest,
    cache: &C,
    frames: &mut F,
) -> Result<(MemoryShare, MemoryShare), Errno> {
    let local_pid = local.shares.pid;
    let remote_pid = remote.shares.pid;
    if request.size == 0 || local_pid == remote_pid {
        return Err(Errno::InvalidArgument);
    }
    if local
        .shares
        .position(remote_pid, request.core_id, request.tag_id)
        .is_some()
    {
        return Err(Errno::AlreadyExists);
    }
    if let Some(index) = remote
        .shares
        .position(local_pid, request.core_id, request.tag_id)
    {
        return Err(match remote.shares.shares[index].state {
            ShareState::DetachedRemote => Errno::RetryAgain,
            _ => Errno::AlreadyExists,
        });
    }
    if local.shares.len() >= MAXIMUM_MEMORY_SHARES || remote.shares.len() >= MAXIMUM_MEMORY_SHARES {
        return Err(Errno::OutOfMemory);
    }

    let size = page_align_up(request.size);
    let pages = size / PAGE_SIZE;
    let access = Access::USER | request.access;
    let phys = frames.allocate(size)?;
    // SAFETY: the frames were just allocated to this share.
    unsafe { fill_physical(frames, phys, size as usize, 0) };
    for page in 0..pages {
        cache.clean_data(phys + frames.phys_offset() + page * PAGE_SIZE);
    }

    let mut local_range = Range::new(0, phys, size, access);
    let mapped_local = local
        .memory
        .find_free(size, Region::UserShare)
        .and_then(|virt| {
            local_range.virt = virt;
            local.memory.map_range(&mut local_range, frames)
        });
    if let Err(err) = mapped_local {
        release_pages(frames, phys, pages);
        return Err(err);
    }

    let mut remote_range = Range::new(0, phys, size, access);
    let mapped_remote = remote
        .memory
        .find_free(size, Region::UserShare)
        .and_then(|virt| {
            remote_range.virt = virt;
            remote.memory.map_range(&mut remote_range, frames)
        });
    if let Err(err) = mapped_remote {
        if let Err(unmap) = local.memory.unmap_range(&local_range) {
            warn!(target: "share", "unwinding local map at {:#x} failed: {unmap:?}", local_range.virt);
        }
        release_pages(frames, phys, pages);
        return Err(err);
    }

    let local_share = MemoryShare {
        pid: remote_pid,
        core_id: request.core_id,
        tag_id: request.tag_id,
        range: local_range,
        state: ShareState::Attached,
    };
    let remote_share = MemoryShare {
        pid: local_pid,
        range: remote_range,
        ..local_share
    };
    // Capacity was checked above, so neither insert can fail.
    local.shares.insert(local_share)?;
    remote.shares.insert(remote_share)?;
    debug!(
        target: "share",
        "{local_pid} <-> {remote_pid} tag {} phys {phys:#x} size {size:#x}",
        request.tag_id
    );
    Ok((local_share, remote_share))
}

fn detach<P: PagingOps, F: FrameAllocator>(
    local: &mut ShareEndpoint<'_, P>,
    remote: Option<&mut ProcessShares>,
    index: usize,
    frames: &mut F,
) -> Result<ShareState, Errno> {
    let share = local.shares.shares.remove(index);
    let owner = local.shares.pid;
    let keep_memory = share.state == ShareState::Attached
        && remote.is_some_and(|remote| remote.mark_detached_remote(owner, share.core_id, share.tag_id));

    let state = if keep_memory {
        local.memory.unmap_range(&share.range)?;
        ShareState::DetachedLocal
    } else {
        local.memory.release_range(&share.range, frames)?;
        ShareState::Released
    };
    debug!(
        target: "share",
        "{owner} detached from {} tag {}: {:?} -> {state:?}",
        share.pid, share.tag_id, share.state
    );
    Ok(state)
}

/// Detaches every share the local process holds with `pid`.
///
/// `remote` is the peer's collection when the peer is still alive. Memory
/// is freed only by whichever side detaches last. Returns the final state
/// of each detached record.
pub fn remove_shares<P: PagingOps, F: FrameAllocator>(
    mut local: ShareEndpoint<'_, P>,
    mut remote: Option<&mut ProcessShares>,
    pid: ProcessId,
    frames: &mut F,
) -> Result<Vec<ShareState>, Errno> {
    let mut states = Vec::new();
    while let Some(index) = local.shares.shares.iter().position(|share| share.pid == pid) {
        states.push(detach(&mut local, remote.as_deref_mut(), index, frames)?);
    }
    Ok(states)
}
