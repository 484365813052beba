//! Process state owned by the virtual memory core
//!
//! The scheduler and loader live outside this crate; what lives here is
//! the per-process memory state they hand us -- the hardware page
//! directory, the supplemental page table, and the user stack pointer
//! saved at the last user-to-kernel transition -- plus the registry the
//! eviction path uses to reach another process's page tables.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::mm::demand_paging::{self, SuppPageTable};
use crate::mm::page_table::PageDirectory;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

impl ProcessId {
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Per-process state the VM core needs.
pub struct Process {
    pid: ProcessId,
    name: String,
    pub(crate) pagedir: Mutex<PageDirectory>,
    pub(crate) spt: Mutex<SuppPageTable>,
    /// User `esp` saved at the last user-to-kernel transition. The page
    /// fault handler needs it when a fault arrives from kernel mode,
    /// where the trap frame's `esp` is not the user stack.
    saved_esp: AtomicUsize,
    exit_status: Mutex<Option<i32>>,
}

impl Process {
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn saved_esp(&self) -> usize {
        self.saved_esp.load(Ordering::Acquire)
    }

    /// Record the user stack pointer on entry to the kernel. Called by the
    /// system-call and interrupt entry paths.
    pub fn record_user_esp(&self, esp: usize) {
        self.saved_esp.store(esp, Ordering::Release);
    }

    /// Exit status recorded at termination, if the process has exited.
    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock()
    }
}

lazy_static! {
    static ref PROCESS_TABLE: Mutex<BTreeMap<u64, Arc<Process>>> = Mutex::new(BTreeMap::new());
}

static NEXT_PID: AtomicU64 = AtomicU64::new(1);
static CURRENT: Mutex<Option<Arc<Process>>> = Mutex::new(None);

/// Create a process with an empty address space and register it.
pub fn create(name: &str) -> Arc<Process> {
    let pid = ProcessId(NEXT_PID.fetch_add(1, Ordering::Relaxed));
    let process = Arc::new(Process {
        pid,
        name: name.to_string(),
        pagedir: Mutex::new(PageDirectory::new()),
        spt: Mutex::new(SuppPageTable::new()),
        saved_esp: AtomicUsize::new(0),
        exit_status: Mutex::new(None),
    });
    PROCESS_TABLE.lock().insert(pid.0, process.clone());
    log::debug!("[PROCESS] Created {} with PID {}", name, pid.0);
    process
}

/// Look up a registered process.
pub fn get(pid: ProcessId) -> Option<Arc<Process>> {
    PROCESS_TABLE.lock().get(&pid.0).cloned()
}

/// The process running on this CPU, as told by the scheduler.
pub fn current() -> Option<Arc<Process>> {
    CURRENT.lock().clone()
}

/// Name of the current process, for diagnostics.
pub fn current_name() -> String {
    current().map_or_else(|| "unknown".to_string(), |p| p.name.clone())
}

/// Install the scheduler's notion of the running process. The scheduler
/// calls this on every context switch.
pub fn set_current(process: Option<Arc<Process>>) {
    *CURRENT.lock() = process;
}

/// Terminate the current process with `status`.
pub fn exit_current(status: i32) {
    if let Some(process) = current() {
        exit(&process, status);
    }
}

/// Terminate `process` with `status`: tear down its pages, frames and
/// swap slots, record the status, and deregister it.
///
/// In the running kernel the scheduler never resumes an exited process;
/// callers on the fault path return to the dispatcher, which must not
/// return to user code of a dead process.
pub fn exit(process: &Arc<Process>, status: i32) {
    log::info!("[PROCESS] {}: exit({})", process.name, status);

    demand_paging::cleanup(process);
    *process.exit_status.lock() = Some(status);

    PROCESS_TABLE.lock().remove(&process.pid.0);

    let mut current = CURRENT.lock();
    if current.as_ref().is_some_and(|p| p.pid == process.pid) {
        *current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_assigns_distinct_pids() {
        let a = create("proc-a");
        let b = create("proc-b");
        assert_ne!(a.pid(), b.pid());
        assert_eq!(get(a.pid()).unwrap().name(), "proc-a");
    }

    #[test]
    fn test_current_tracks_scheduler() {
        // The current-process cell is shared with the scenario tests.
        let _guard = crate::integration_tests::env::lock();
        let p = create("sched-test");
        set_current(Some(p.clone()));
        assert_eq!(current().unwrap().pid(), p.pid());
        set_current(None);
    }

    #[test]
    fn test_saved_esp_round_trip() {
        let p = create("esp-test");
        p.record_user_esp(0xBFFF_FFF0);
        assert_eq!(p.saved_esp(), 0xBFFF_FFF0);
    }
}
