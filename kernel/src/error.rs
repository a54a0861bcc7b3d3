use core::fmt::Display;

use crate::exec::ExecError;
use crate::syscall::SysError;
use crate::virtio_disk::VirtioError;

/// Kernel error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Alloc,
    InvalidArgument,
    OutOfProc,
    InvalidPage,
    InvalidAddress,
    InvalidPte,
    Fs,
    Syscall(SysError),
    Exec(ExecError),
    VirtioError(VirtioError),
}

impl From<core::alloc::AllocError> for KernelError {
    fn from(_value: core::alloc::AllocError) -> Self {
        Self::Alloc
    }
}

impl From<SysError> for KernelError {
    fn from(value: SysError) -> Self {
        Self::Syscall(value)
    }
}

impl From<ExecError> for KernelError {
    fn from(value: ExecError) -> Self {
        Self::Exec(value)
    }
}

impl From<VirtioError> for KernelError {
    fn from(value: VirtioError) -> Self {
        Self::VirtioError(value)
    }
}

impl Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::Alloc => write!(f, "alloc error"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::OutOfProc => write!(f, "out of proc"),
            KernelError::InvalidPage => write!(f, "invalid page"),
            KernelError::InvalidAddress => write!(f, "invalid address"),
            KernelError::InvalidPte => write!(f, "invalid page table entry"),
            KernelError::Fs => write!(f, "filesystem error"),
            KernelError::Syscall(e) => write!(f, "syscall error: {}", e),
            KernelError::Exec(e) => write!(f, "exec error {}", e),
            KernelError::VirtioError(e) => write!(f, "virtio error {}", e),
        }
    }
}

/// Return an error, logging file:line. Use instead of `return Err(...)`.
#[macro_export]
macro_rules! err {
    ($e:expr) => {{
        #[cfg(debug_assertions)]
        {
            let _lock = $crate::proc::lock_current_cpu();
            #[allow(unused_unsafe)]
            let cpu_id = unsafe { $crate::proc::current_id() };
            $crate::println!(
                "! hart {} errored at {}:{}: {}",
                cpu_id,
                file!(),
                line!(),
                $e
            );
        }
        return Err($e.into());
    }};
}

/// Log error.
#[macro_export]
macro_rules! log {
    ($e:expr) => {
        match $e {
            Ok(v) => Ok(v),
            Err(e) => {
                #[cfg(debug_assertions)]
                $crate::println!("  at {}:{}", file!(), line!());
                Err(e)
            }
        }
    };
}

/// Propagate error with location logging. Use instead of `?`.
#[macro_export]
macro_rules! try_log {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => {
                #[cfg(debug_assertions)]
                $crate::println!("  at {}:{}", file!(), line!());
                return Err(e.into());
            }
        }
    };
}
