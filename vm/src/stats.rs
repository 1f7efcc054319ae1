use core::fmt::{self, Display, Formatter};
use core::sync::atomic::{AtomicU64, Ordering};

/// Running counters of paging activity.
#[derive(Default)]
pub struct VmStats {
    faults: AtomicU64,
    stack_growths: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
    swap_outs: AtomicU64,
    swap_ins: AtomicU64,
    write_backs: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub faults: u64,
    pub stack_growths: u64,
    pub loads: u64,
    pub evictions: u64,
    pub swap_outs: u64,
    pub swap_ins: u64,
    pub write_backs: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl VmStats {
    pub(crate) fn fault(&self) {
        bump(&self.faults);
    }
    pub(crate) fn stack_growth(&self) {
        bump(&self.stack_growths);
    }
    pub(crate) fn load(&self) {
        bump(&self.loads);
    }
    pub(crate) fn eviction(&self) {
        bump(&self.evictions);
    }
    pub(crate) fn swap_out(&self) {
        bump(&self.swap_outs);
    }
    pub(crate) fn swap_in(&self) {
        bump(&self.swap_ins);
    }
    pub(crate) fn write_back(&self) {
        bump(&self.write_backs);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            stack_growths: self.stack_growths.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            swap_ins: self.swap_ins.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
        }
    }
}

impl Display for StatsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} faults ({} stack), {} loads, {} evictions, {} swapped out, {} swapped in, {} written back",
            self.faults,
            self.stack_growths,
            self.loads,
            self.evictions,
            self.swap_outs,
            self.swap_ins,
            self.write_backs
        )
    }
}
