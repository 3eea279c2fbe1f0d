//! Process groups started on behalf of running jobs.
//!
//! Commands run in their own process group so a kill reaches every
//! descendant, not only the direct child. Groups are tracked process-wide
//! while they are live; a worker that exits on a timeout kills them all
//! first, since destructors do not run on `exit`.

use std::collections::BTreeSet;
use std::sync::Mutex;

static LIVE_GROUPS: Mutex<BTreeSet<i32>> = Mutex::new(BTreeSet::new());

/// A live process group, killed when dropped.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: i32,
}

impl ProcessGroup {
    /// Tracks the group led by `pid`, a child spawned with `process_group(0)`.
    pub fn track(pid: u32) -> Option<Self> {
        let pgid = i32::try_from(pid).ok()?;
        LIVE_GROUPS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pgid);
        Some(Self { pgid })
    }

    pub fn id(&self) -> i32 {
        self.pgid
    }

    pub fn kill(&self) {
        if let Err(e) = kill_group(self.pgid) {
            tracing::warn!(pgid = self.pgid, error = %e, "Failed to kill process group");
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
        LIVE_GROUPS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.pgid);
    }
}

/// Kills every tracked group. Returns how many were signalled.
pub fn kill_all() -> usize {
    let groups = LIVE_GROUPS.lock().unwrap_or_else(|e| e.into_inner()).clone();
    for &pgid in &groups {
        tracing::warn!(pgid, "Killing job process group");
        if let Err(e) = kill_group(pgid) {
            tracing::warn!(pgid, error = %e, "Failed to kill process group");
        }
    }
    groups.len()
}

/// Sends SIGKILL to every process in group `pgid`. A group that is already
/// gone is not an error.
#[cfg(unix)]
pub fn kill_group(pgid: i32) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pgid: i32) -> std::io::Result<()> {
    Ok(())
}
