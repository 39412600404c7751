//! Communicator for the collectives a checkpoint operation needs.
//!
//! Resharding only ever exchanges a small control payload (the staging area
//! identifier) and waits at barriers; bulk tensor data moves through storage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

/// Trait for the collective operations used during checkpoint load/save.
pub trait Communicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// Broadcast an opaque payload from `src_rank` to every rank.
    ///
    /// The source rank passes `Some(payload)`, all other ranks pass `None`.
    /// Every rank returns the source's payload.
    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, src_rank: usize) -> Result<Vec<u8>>;

    /// Barrier: synchronize all ranks.
    fn barrier(&self) -> Result<()>;
}

/// Broadcast a UTF-8 string from `src_rank`.
pub fn broadcast_string(
    comm: &dyn Communicator,
    value: Option<&str>,
    src_rank: usize,
) -> Result<String> {
    let bytes = comm.broadcast_bytes(value.map(|v| v.as_bytes().to_vec()), src_rank)?;
    String::from_utf8(bytes).map_err(|e| DistributedError::Desync {
        expected: "utf-8 string payload".to_string(),
        actual: e.to_string(),
    })
}

/// Mock communicator for single-process execution.
///
/// Broadcast returns the caller's own payload and barrier is a no-op.
pub struct MockCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> MockCommunicator<P> {
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl MockCommunicator<LocalProcessGroup> {
    /// Communicator for a one-process group.
    pub fn single() -> Self {
        Self::new(LocalProcessGroup::new())
    }
}

impl<P: ProcessGroup> Communicator for MockCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, src_rank: usize) -> Result<Vec<u8>> {
        let world_size = self.process_group.world_size();
        if src_rank >= world_size {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size,
            });
        }
        payload.ok_or(DistributedError::EmptyBroadcast { src_rank })
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

// ─── In-process group ────────────────────────────────────────────────────────

#[derive(Default)]
struct GroupState {
    arrived: usize,
    barrier_generation: u64,
    broadcast: Option<(u64, Vec<u8>)>,
}

struct SharedGroup {
    world_size: usize,
    timeout: Duration,
    state: Mutex<GroupState>,
    cvar: Condvar,
}

impl SharedGroup {
    fn lock(&self) -> Result<MutexGuard<'_, GroupState>> {
        self.state
            .lock()
            .map_err(|_| DistributedError::PeerFailed("group state poisoned".to_string()))
    }
}

/// Communicator connecting participants that live in one OS process.
///
/// Each participant runs on its own thread and owns one `ThreadCommunicator`.
/// Collectives block until every participant arrives or the group timeout
/// elapses.
pub struct ThreadCommunicator {
    process_group: LocalProcessGroup,
    shared: Arc<SharedGroup>,
    broadcast_seq: AtomicU64,
}

impl ThreadCommunicator {
    /// Create one communicator per rank for a group of `world_size`.
    pub fn group(world_size: usize, timeout: Duration) -> Vec<ThreadCommunicator> {
        assert!(world_size > 0, "world_size must be > 0");
        let shared = Arc::new(SharedGroup {
            world_size,
            timeout,
            state: Mutex::new(GroupState::default()),
            cvar: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| ThreadCommunicator {
                process_group: LocalProcessGroup::with_rank(rank, world_size),
                shared: Arc::clone(&shared),
                broadcast_seq: AtomicU64::new(0),
            })
            .collect()
    }

    fn timeout_ms(&self) -> u64 {
        self.shared.timeout.as_millis() as u64
    }
}

impl Communicator for ThreadCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, src_rank: usize) -> Result<Vec<u8>> {
        let world_size = self.shared.world_size;
        if src_rank >= world_size {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size,
            });
        }
        let seq = self.broadcast_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let data = if self.process_group.rank() == src_rank {
            let payload = payload.ok_or(DistributedError::EmptyBroadcast { src_rank })?;
            let mut state = self.shared.lock()?;
            state.broadcast = Some((seq, payload.clone()));
            self.shared.cvar.notify_all();
            payload
        } else {
            let deadline = Instant::now() + self.shared.timeout;
            let mut state = self.shared.lock()?;
            loop {
                match &state.broadcast {
                    Some((posted, data)) if *posted == seq => break data.clone(),
                    Some((posted, _)) if *posted > seq => {
                        return Err(DistributedError::Desync {
                            expected: format!("broadcast #{seq}"),
                            actual: format!("broadcast #{posted}"),
                        });
                    }
                    _ => {}
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(DistributedError::Timeout {
                        op: "broadcast",
                        timeout_ms: self.timeout_ms(),
                    });
                }
                let (guard, _) = self
                    .shared
                    .cvar
                    .wait_timeout(state, deadline - now)
                    .map_err(|_| DistributedError::PeerFailed("group state poisoned".to_string()))?;
                state = guard;
            }
        };

        // Nobody may post the next payload before every rank has read this one.
        self.barrier()?;
        Ok(data)
    }

    fn barrier(&self) -> Result<()> {
        let deadline = Instant::now() + self.shared.timeout;
        let mut state = self.shared.lock()?;
        let generation = state.barrier_generation;
        state.arrived += 1;
        if state.arrived == self.shared.world_size {
            state.arrived = 0;
            state.barrier_generation += 1;
            self.shared.cvar.notify_all();
            return Ok(());
        }
        while state.barrier_generation == generation {
            let now = Instant::now();
            if now >= deadline {
                state.arrived -= 1;
                return Err(DistributedError::Timeout {
                    op: "barrier",
                    timeout_ms: self.timeout_ms(),
                });
            }
            let (guard, _) = self
                .shared
                .cvar
                .wait_timeout(state, deadline - now)
                .map_err(|_| DistributedError::PeerFailed("group state poisoned".to_string()))?;
            state = guard;
        }
        Ok(())
    }
}
