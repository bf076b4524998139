//! Engine options and execution limits.

use bitflags::bitflags;

bitflags! {
    /// Behavioral flags for a VM instance.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmOptions: u32 {
        /// Capture a backtrace while unwinding and trace dispatched opcodes.
        const DEBUG = 0b0001;
        /// Omit file names from ReferenceError messages.
        const QUIET = 0b0010;
    }
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions::empty()
    }
}

/// Restrictions on a VM instance, enforced at frame creation and `try_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmLimits {
    /// Upper bound on the summed slot counts of all live frames.
    pub max_stack_size: usize,

    /// Upper bound on the nesting depth of `try` regions within one frame.
    pub max_try_depth: usize,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            max_stack_size: 64 * 1024,
            max_try_depth: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = VmOptions::default();
        assert!(!options.contains(VmOptions::DEBUG));
        assert!(!options.contains(VmOptions::QUIET));
    }

    #[test]
    fn test_default_limits() {
        let limits = VmLimits::default();
        assert!(limits.max_stack_size > 0);
        assert!(limits.max_try_depth > 0);
    }
}
