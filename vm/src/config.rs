use crate::addr::VirtAddr;
use kidneyos_shared::mem::{OFFSET, USER_STACK_LIMIT};

/// How far below the stack pointer a fault may land and still count as a
/// push. `pusha` writes 32 bytes before moving `esp`.
pub const DEFAULT_STACK_SLACK: usize = 32;

/// Full revolutions of the clock hand before eviction gives up.
pub const DEFAULT_EVICTION_PASSES: usize = 2;

/// Fewest revolutions that still find a victim when every frame was
/// referenced: one to clear the bits, one to pick.
pub const MIN_EVICTION_PASSES: usize = 2;

/// Runtime policy for a [`Vm`](crate::Vm).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// One past the highest stack byte; the initial stack pointer.
    pub stack_top: VirtAddr,
    /// Largest size the stack may grow to, in bytes.
    pub stack_limit: usize,
    /// See [`DEFAULT_STACK_SLACK`].
    pub stack_slack: usize,
    /// See [`DEFAULT_EVICTION_PASSES`]. Raised to [`MIN_EVICTION_PASSES`]
    /// when smaller.
    pub eviction_passes: usize,
}

impl VmConfig {
    pub const fn new() -> Self {
        Self {
            stack_top: VirtAddr::new(OFFSET),
            stack_limit: USER_STACK_LIMIT,
            stack_slack: DEFAULT_STACK_SLACK,
            eviction_passes: DEFAULT_EVICTION_PASSES,
        }
    }

    #[must_use]
    pub const fn with_stack_top(mut self, stack_top: VirtAddr) -> Self {
        self.stack_top = stack_top;
        self
    }

    #[must_use]
    pub const fn with_stack_limit(mut self, stack_limit: usize) -> Self {
        self.stack_limit = stack_limit;
        self
    }

    #[must_use]
    pub const fn with_stack_slack(mut self, stack_slack: usize) -> Self {
        self.stack_slack = stack_slack;
        self
    }

    #[must_use]
    pub const fn with_eviction_passes(mut self, passes: usize) -> Self {
        self.eviction_passes = if passes < MIN_EVICTION_PASSES {
            MIN_EVICTION_PASSES
        } else {
            passes
        };
        self
    }

    /// Lowest address the stack may ever cover.
    pub const fn stack_bottom(&self) -> VirtAddr {
        VirtAddr::new(self.stack_top.as_usize().saturating_sub(self.stack_limit))
    }

    /// Whether `addr` lies in the region the stack is allowed to occupy.
    pub fn in_stack_region(&self, addr: VirtAddr) -> bool {
        self.stack_bottom() <= addr && addr < self.stack_top
    }

    /// Whether a fault at `addr` with stack pointer `esp` is a stack access
    /// that should grow the stack.
    pub fn is_stack_growth(&self, addr: VirtAddr, esp: VirtAddr) -> bool {
        self.in_stack_region(addr)
            && addr.as_usize().saturating_add(self.stack_slack) >= esp.as_usize()
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kidneyos_shared::sizes::KB;

    #[test]
    fn stack_region_bounds() {
        let config = VmConfig::new().with_stack_limit(64 * KB);
        let top = OFFSET;
        assert!(config.in_stack_region(VirtAddr::new(top - 1)));
        assert!(config.in_stack_region(VirtAddr::new(top - 64 * KB)));
        assert!(!config.in_stack_region(VirtAddr::new(top - 64 * KB - 1)));
        assert!(!config.in_stack_region(VirtAddr::new(top)));
    }

    #[test]
    fn growth_needs_stack_pointer_adjacency() {
        let config = VmConfig::new();
        let esp = VirtAddr::new(OFFSET - 4 * KB);
        // pusha
        assert!(config.is_stack_growth(VirtAddr::new(esp.as_usize() - 32), esp));
        assert!(!config.is_stack_growth(VirtAddr::new(esp.as_usize() - 33), esp));
        // Accesses above esp are always fine.
        assert!(config.is_stack_growth(VirtAddr::new(esp.as_usize() + 100), esp));
    }

    #[test]
    fn eviction_passes_have_a_floor() {
        assert_eq!(VmConfig::new().with_eviction_passes(0).eviction_passes, 2);
        assert_eq!(VmConfig::new().with_eviction_passes(1).eviction_passes, 2);
        assert_eq!(VmConfig::new().with_eviction_passes(5).eviction_passes, 5);
    }
}
