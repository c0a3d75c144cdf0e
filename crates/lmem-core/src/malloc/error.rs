//! Allocation failures.

use thiserror::Error;

use super::system::SysError;
use crate::errno::ENOMEM;

/// Why a malloc-family request produced no block.
///
/// Every variant maps to `ENOMEM` at the C boundary; the variants exist so
/// embedders and logs can tell the causes apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The break boundary refused to move far enough for a new heap block.
    #[error("heap exhausted growing by {units} header units")]
    HeapExhausted {
        units: usize,
        #[source]
        source: SysError,
    },
    /// A dedicated mapping could not be created.
    #[error("mapping {len} bytes failed")]
    MapFailed {
        len: usize,
        #[source]
        source: SysError,
    },
    /// A dedicated mapping could not be resized. The old block is intact.
    #[error("remapping to {len} bytes failed")]
    RemapFailed {
        len: usize,
        #[source]
        source: SysError,
    },
    /// A size computation overflowed (checked mode only).
    #[error("{what} overflows the address space")]
    SizeOverflow { what: &'static str },
    /// Growing the heap would run the break past the end of the address
    /// space.
    #[error("heap growth would wrap the address space")]
    AddressSpaceExhausted,
}

impl AllocError {
    /// The errno a C caller observes.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        ENOMEM
    }

    /// The OS failure underneath, if any.
    #[must_use]
    pub const fn sys_error(&self) -> Option<SysError> {
        match self {
            Self::HeapExhausted { source, .. }
            | Self::MapFailed { source, .. }
            | Self::RemapFailed { source, .. } => Some(*source),
            Self::SizeOverflow { .. } | Self::AddressSpaceExhausted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno::EINVAL;

    #[test]
    fn every_failure_is_enomem_at_the_boundary() {
        let errors = [
            AllocError::HeapExhausted {
                units: 3,
                source: SysError::BreakExhausted { errno: ENOMEM },
            },
            AllocError::MapFailed {
                len: 4096,
                source: SysError::MapFailed { errno: EINVAL },
            },
            AllocError::SizeOverflow { what: "calloc size" },
            AllocError::AddressSpaceExhausted,
        ];
        for err in errors {
            assert_eq!(err.errno(), ENOMEM, "{err}");
        }
    }

    #[test]
    fn source_is_preserved() {
        let err = AllocError::RemapFailed {
            len: 8192,
            source: SysError::RemapFailed { errno: ENOMEM },
        };
        assert_eq!(err.sys_error(), Some(SysError::RemapFailed { errno: ENOMEM }));
        assert_eq!(err.to_string(), "remapping to 8192 bytes failed");
        assert_eq!(AllocError::AddressSpaceExhausted.sys_error(), None);
    }
}
