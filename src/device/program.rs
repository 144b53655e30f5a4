use crate::error::Result;
use crate::kernels::KernelConstants;

/// One device kernel entry point. Kernels are built with their fixed
/// arguments (buffers, constants) baked in; per-dispatch values arrive as
/// the scalar argument list.
pub trait Kernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Execute the kernel over `gws` work-items grouped in `lws`-sized
    /// work-groups.
    fn run(&self, gws: usize, lws: usize, scalars: &[u64]) -> Result<()>;
}

/// A program built for one device from a compiler-option string. The
/// options embed every simulation constant (§ parameters, worksizes,
/// widths, RNG variant), letting kernels treat them as literals.
pub struct Program {
    options: String,
    constants: KernelConstants,
    threaded: bool,
}

impl Program {
    pub(super) fn build(options: &str, threaded: bool) -> Result<Self> {
        let constants = KernelConstants::parse(options).inspect_err(|e| {
            // Surface the build log the way a device compiler would.
            log::error!("program build log:\n{}", e);
        })?;
        log::debug!("program built with options: {}", options.trim_end());
        Ok(Self {
            options: options.to_string(),
            constants,
            threaded,
        })
    }

    /// A program with a given constant set, for kernel unit tests.
    #[cfg(test)]
    pub(crate) fn build_for_tests(constants: KernelConstants) -> Self {
        Self {
            options: String::new(),
            constants,
            threaded: false,
        }
    }

    pub fn constants(&self) -> &KernelConstants {
        &self.constants
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    /// Whether kernels may fan order-independent work out over threads.
    pub fn threaded(&self) -> bool {
        self.threaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_parses_constants() {
        let prg = Program::build("-D GRID_X=4 -D GRID_Y=8 ", false).unwrap();
        assert_eq!(prg.constants().grid_x, 4);
        assert_eq!(prg.constants().grid_y, 8);
        assert!(!prg.threaded());
    }

    #[test]
    fn build_fails_on_bad_constant() {
        assert!(Program::build("-D GRID_X=four", false).is_err());
    }
}
