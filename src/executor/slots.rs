//! The process-slot table: 127 fixed slots holding per-slot argv
//! and environment overlay storage, capture pipe, PID, and state.
//!
//! Pure state transitions, no I/O — mirrors the broker state table this
//! codebase used to carry for sessions, flattened from a hash map into a
//! fixed-size array since slot ids are bounded and wire-addressed by a
//! single byte.

use std::os::fd::RawFd;

use crate::wire::{MAX_SLOT_ID, SLOT_COUNT};

/// Maximum number of (key, value) pairs held in a slot's env overlay.
pub const MAX_ENV_ENTRIES: usize = 255;

/// Maximum number of argv tail strings accepted by Exec.
pub const MAX_ARGV_TAIL: usize = 12;

/// Upper bound on the combined byte length of a slot's argv strings.
/// Derived from the platform's `ARG_MAX` at startup; see
/// [`argv_store_limit`].
const ARGV_STORE_FALLBACK: usize = 128 * 1024;

/// Computes the argv packed-storage limit as half of the platform's
/// `ARG_MAX`, falling back to a conservative constant when `sysconf`
/// is unavailable or returns a bogus value.
pub fn argv_store_limit() -> usize {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::ARG_MAX) {
        Ok(Some(n)) if n > 0 => (n as usize) / 2,
        _ => ARGV_STORE_FALLBACK,
    }
}

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never configured or returned to the pool after a prior run.
    Empty,
    /// Env has been set but no process has been execed yet.
    Configured,
    /// A child process exists and holds the slot's PID.
    Running,
    /// The child has exited; Result has been emitted and the slot is
    /// eligible for reuse. Distinguished from `Empty` only for observability
    /// — both accept a new Exec identically.
    Terminated,
}

/// Errors surfaced by slot-table operations. All of these indicate a
/// fatal protocol violation in the caller (invalid slot id, duplicate
/// pid, overlay full, etc.) — none is recoverable by waiting for more
/// input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot id {0} exceeds the maximum of {MAX_SLOT_ID}")]
    InvalidSlotId(u32),
    #[error("slot {0} already has a running process")]
    AlreadyRunning(u32),
    #[error("slot {0} has no running process")]
    NotRunning(u32),
    #[error("slot {0} env overlay is full ({MAX_ENV_ENTRIES} entries)")]
    EnvOverlayFull(u32),
    #[error("slot {0} argv exceeds the packed storage limit")]
    ArgvTooLarge(u32),
    #[error("pid {0} is not registered to any slot")]
    UnknownPid(u32),
}

/// One (key, value) pair in a slot's environment overlay.
#[derive(Debug, Clone)]
struct EnvEntry {
    key: String,
    value: String,
}

/// A single row of the process-slot table.
#[derive(Debug)]
pub struct Slot {
    state: SlotState,
    pid: Option<u32>,
    env: Vec<EnvEntry>,
    /// Read end of the child's stdout/stderr capture pipe, set while running.
    pub capture_fd: Option<RawFd>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Empty,
            pid: None,
            env: Vec::new(),
            capture_fd: None,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The slot's environment overlay as (key, value) pairs, in
    /// insertion/replacement order, suitable for applying between fork
    /// and exec.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().map(|e| (e.key.as_str(), e.value.as_str()))
    }

    /// Set or replace a key in the overlay. Existing keys are replaced
    /// in place; new keys are appended. Does not affect an
    /// already-running child in this slot.
    fn set_env(&mut self, key: String, value: String, slot_id: u32) -> Result<(), SlotError> {
        if let Some(entry) = self.env.iter_mut().find(|e| e.key == key) {
            entry.value = value;
            return Ok(());
        }
        if self.env.len() >= MAX_ENV_ENTRIES {
            return Err(SlotError::EnvOverlayFull(slot_id));
        }
        self.env.push(EnvEntry { key, value });
        Ok(())
    }
}

/// The fixed 127-slot table plus the PID→slot reverse index.
///
/// Owned exclusively by the event loop; every method here is a pure
/// state transition with no I/O.
pub struct SlotTable {
    slots: Vec<Slot>,
    /// Global environment overlay, applied to every future child in
    /// addition to its slot's own overlay (Env with a nil slot id).
    global_env: Vec<EnvEntry>,
    argv_limit: usize,
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            slots: (0..SLOT_COUNT).map(|_| Slot::new()).collect(),
            global_env: Vec::new(),
            argv_limit: argv_store_limit(),
        }
    }

    fn check_slot_id(id: u32) -> Result<usize, SlotError> {
        if id > MAX_SLOT_ID as u32 {
            return Err(SlotError::InvalidSlotId(id));
        }
        Ok(id as usize)
    }

    pub fn slot(&self, id: u32) -> Result<&Slot, SlotError> {
        let idx = Self::check_slot_id(id)?;
        Ok(&self.slots[idx])
    }

    /// Apply an Env message: `slot = None` means the global overlay
    /// inherited by all future children; `Some(id)` targets one slot.
    pub fn apply_env(
        &mut self,
        slot: Option<u32>,
        key: String,
        value: String,
    ) -> Result<(), SlotError> {
        match slot {
            None => {
                if let Some(entry) = self.global_env.iter_mut().find(|e| e.key == key) {
                    entry.value = value;
                } else {
                    if self.global_env.len() >= MAX_ENV_ENTRIES {
                        return Err(SlotError::EnvOverlayFull(u32::MAX));
                    }
                    self.global_env.push(EnvEntry { key, value });
                }
                Ok(())
            }
            Some(id) => {
                let idx = Self::check_slot_id(id)?;
                if self.slots[idx].state == SlotState::Empty {
                    self.slots[idx].state = SlotState::Configured;
                }
                self.slots[idx].set_env(key, value, id)
            }
        }
    }

    /// The full environment a new child in `slot` should receive: the
    /// global overlay followed by the slot's own overlay (slot entries
    /// win on key collision, applied after).
    pub fn effective_env(&self, id: u32) -> Result<Vec<(String, String)>, SlotError> {
        let idx = Self::check_slot_id(id)?;
        let mut out: Vec<(String, String)> = self
            .global_env
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect();
        for (k, v) in self.slots[idx].env_pairs() {
            if let Some(existing) = out.iter_mut().find(|(ek, _)| ek == k) {
                existing.1 = v.to_string();
            } else {
                out.push((k.to_string(), v.to_string()));
            }
        }
        Ok(out)
    }

    /// Validate an Exec's argv against the packed-storage limit before
    /// fork, since the limit is fatal-in-caller, not fatal-in-child.
    pub fn check_argv_len(&self, id: u32, path: &str, argv: &[String]) -> Result<(), SlotError> {
        let total: usize = path.len() + 1 + argv.iter().map(|a| a.len() + 1).sum::<usize>();
        if total > self.argv_limit || argv.len() > MAX_ARGV_TAIL {
            return Err(SlotError::ArgvTooLarge(id));
        }
        Ok(())
    }

    /// Record that `slot` now holds a running child with the given pid
    /// and capture fd, having already validated argv length via
    /// [`check_argv_len`].
    pub fn mark_running(&mut self, id: u32, pid: u32, capture_fd: RawFd) -> Result<(), SlotError> {
        let idx = Self::check_slot_id(id)?;
        if self.slots[idx].state == SlotState::Running {
            return Err(SlotError::AlreadyRunning(id));
        }
        self.slots[idx].state = SlotState::Running;
        self.slots[idx].pid = Some(pid);
        self.slots[idx].capture_fd = Some(capture_fd);
        Ok(())
    }

    /// Find the slot holding `pid`, used when the SIGCHLD drain loop
    /// reports an exit.
    pub fn slot_for_pid(&self, pid: u32) -> Result<u32, SlotError> {
        self.slots
            .iter()
            .position(|s| s.pid == Some(pid))
            .map(|idx| idx as u32)
            .ok_or(SlotError::UnknownPid(pid))
    }

    /// Clear the PID→slot mapping and mark the slot terminated, called
    /// once the Result frame for this exit has been appended to the
    /// output buffer, atomically from the protocol's perspective.
    pub fn mark_terminated(&mut self, id: u32) -> Result<(), SlotError> {
        let idx = Self::check_slot_id(id)?;
        self.slots[idx].pid = None;
        self.slots[idx].capture_fd = None;
        self.slots[idx].state = SlotState::Terminated;
        Ok(())
    }

    /// Close the capture fd for a slot (on child-pipe EOF), without
    /// touching running/terminated state, which is driven solely by
    /// SIGCHLD.
    pub fn close_capture(&mut self, id: u32) -> Result<(), SlotError> {
        let idx = Self::check_slot_id(id)?;
        self.slots[idx].capture_fd = None;
        Ok(())
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_slot() {
        let table = SlotTable::new();
        assert_eq!(table.slot(127), Err(SlotError::InvalidSlotId(127)));
        assert!(table.slot(126).is_ok());
    }

    #[test]
    fn global_env_is_inherited_by_new_slot() {
        let mut table = SlotTable::new();
        table
            .apply_env(None, "LANG".to_string(), "C".to_string())
            .unwrap();
        let env = table.effective_env(5).unwrap();
        assert_eq!(env, vec![("LANG".to_string(), "C".to_string())]);
    }

    #[test]
    fn slot_env_overrides_global_on_collision() {
        let mut table = SlotTable::new();
        table
            .apply_env(None, "LANG".to_string(), "C".to_string())
            .unwrap();
        table
            .apply_env(Some(1), "LANG".to_string(), "en_US.UTF-8".to_string())
            .unwrap();
        let env = table.effective_env(1).unwrap();
        assert_eq!(env, vec![("LANG".to_string(), "en_US.UTF-8".to_string())]);
    }

    #[test]
    fn repeated_key_replaces_value_in_place_once() {
        let mut table = SlotTable::new();
        table
            .apply_env(Some(3), "K".to_string(), "v1".to_string())
            .unwrap();
        table
            .apply_env(Some(3), "K".to_string(), "v2-longer-value".to_string())
            .unwrap();
        let env = table.effective_env(3).unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0], ("K".to_string(), "v2-longer-value".to_string()));
    }

    #[test]
    fn env_overlay_full_is_fatal() {
        let mut table = SlotTable::new();
        for i in 0..MAX_ENV_ENTRIES {
            table
                .apply_env(Some(0), format!("K{i}"), "v".to_string())
                .unwrap();
        }
        let err = table
            .apply_env(Some(0), "one_more".to_string(), "v".to_string())
            .unwrap_err();
        assert_eq!(err, SlotError::EnvOverlayFull(0));
    }

    #[test]
    fn mark_running_then_lookup_by_pid() {
        let mut table = SlotTable::new();
        table.mark_running(2, 4242, 9).unwrap();
        assert_eq!(table.slot_for_pid(4242), Ok(2));
        assert_eq!(table.slot(2).unwrap().state(), SlotState::Running);
    }

    #[test]
    fn double_exec_into_running_slot_is_rejected() {
        let mut table = SlotTable::new();
        table.mark_running(2, 4242, 9).unwrap();
        let err = table.mark_running(2, 4343, 10).unwrap_err();
        assert_eq!(err, SlotError::AlreadyRunning(2));
    }

    #[test]
    fn termination_clears_pid_and_frees_slot_for_reuse() {
        let mut table = SlotTable::new();
        table.mark_running(2, 4242, 9).unwrap();
        table.mark_terminated(2).unwrap();
        assert_eq!(table.slot(2).unwrap().state(), SlotState::Terminated);
        assert_eq!(table.slot_for_pid(4242), Err(SlotError::UnknownPid(4242)));
        // Env persists across reuse.
        table.mark_running(2, 5555, 11).unwrap();
        assert_eq!(table.slot(2).unwrap().pid(), Some(5555));
    }

    #[test]
    fn env_persists_across_slot_reuse() {
        let mut table = SlotTable::new();
        table
            .apply_env(Some(4), "K".to_string(), "v".to_string())
            .unwrap();
        table.mark_running(4, 10, 1).unwrap();
        table.mark_terminated(4).unwrap();
        let env = table.effective_env(4).unwrap();
        assert_eq!(env, vec![("K".to_string(), "v".to_string())]);
    }

    #[test]
    fn argv_over_tail_count_is_rejected() {
        let table = SlotTable::new();
        let argv: Vec<String> = (0..13).map(|i| format!("a{i}")).collect();
        assert!(table.check_argv_len(0, "/bin/true", &argv).is_err());
    }

    #[test]
    fn argv_store_limit_is_positive() {
        assert!(argv_store_limit() > 0);
    }
}
