use alloc::vec::Vec;
use core::mem;

use crate::abi::{PROCESS_INFO_SIZE, ProcessInfo};
use crate::proc::{self, Channel, current_proc};
use crate::syscall::{SyscallArgs, SysError};
use crate::trap::TICKS_LOCK;

pub fn sys_exit(args: &SyscallArgs) -> ! {
    let n = args.get_int(0);
    proc::exit(n);
}

pub fn sys_getpid(_args: &SyscallArgs) -> Result<usize, SysError> {
    Ok(proc::getpid() as usize)
}

pub fn sys_getppid(_args: &SyscallArgs) -> Result<usize, SysError> {
    Ok(proc::getppid() as usize)
}

pub fn sys_fork(_args: &SyscallArgs) -> Result<usize, SysError> {
    match log!(proc::fork()) {
        Ok(pid) => Ok(pid as usize),
        Err(_) => Err(SysError::ResourceUnavailable),
    }
}

pub fn sys_clone(_args: &SyscallArgs) -> Result<usize, SysError> {
    match log!(proc::clone_proc()) {
        Ok(pid) => Ok(pid as usize),
        Err(_) => Err(SysError::ResourceUnavailable),
    }
}

pub fn sys_wait(args: &SyscallArgs) -> Result<usize, SysError> {
    let addr = args.get_addr(0);
    match proc::wait(addr) {
        Some(pid) => Ok(*pid),
        None => err!(SysError::ResourceUnavailable),
    }
}

pub fn sys_sbrk(args: &SyscallArgs) -> Result<usize, SysError> {
    let size = args.get_int(0);
    let addr = args.proc().data().size;

    match unsafe { log!(proc::grow(size)) } {
        Ok(_) => Ok(addr),
        Err(_) => Err(SysError::ResourceUnavailable),
    }
}

pub fn sys_sleep(args: &SyscallArgs) -> Result<usize, SysError> {
    let duration = args.get_int(0).max(0) as usize;

    let mut ticks = TICKS_LOCK.lock();
    let ticks0 = *ticks;

    while *ticks - ticks0 < duration {
        if current_proc().is_killed() {
            return Err(SysError::ResourceUnavailable);
        }

        ticks = proc::sleep(Channel::Ticks, ticks);
    }

    Ok(0)
}

pub fn sys_kill(args: &SyscallArgs) -> Result<usize, SysError> {
    let pid = args.get_int(0);

    if pid < 0 {
        err!(SysError::InvalidArgument);
    }

    if proc::kill(pid as usize) {
        Ok(0)
    } else {
        err!(SysError::NoProcess);
    }
}

pub fn sys_uptime(_args: &SyscallArgs) -> Result<usize, SysError> {
    let ticks = *TICKS_LOCK.lock();
    Ok(ticks)
}

/// Writes up to the process table's fixed capacity worth of in-namespace PIDs for processes in
/// the caller's namespace (and its descendant namespaces) into the buffer at `addr`, and returns
/// the total live count, regardless of how many fit.
pub fn sys_ps_list(args: &SyscallArgs) -> Result<usize, SysError> {
    ps_list_impl(args, false)
}

/// As `sys_ps_list`, but writes global pids instead of in-namespace ones.
pub fn sys_ps_list_global(args: &SyscallArgs) -> Result<usize, SysError> {
    ps_list_impl(args, true)
}

fn ps_list_impl(args: &SyscallArgs, global: bool) -> Result<usize, SysError> {
    let addr = args.get_addr(0);
    let cap = args.get_int(1);

    let (count, pids) = proc::ps_list(if cap < 0 { -1 } else { cap }, global);

    if cap > 0 {
        let mut bytes = Vec::with_capacity(pids.len() * mem::size_of::<u32>());
        for pid in &pids {
            bytes.extend_from_slice(&pid.to_le_bytes());
        }
        try_log!(proc::copy_to_user(&bytes, addr).map_err(|_| SysError::BadAddress));
    }

    Ok(count)
}

/// Packs the wire-format `process_info` record for `pid` (a global pid) into the buffer at
/// `addr`. Returns 0 on success, or `SysError::NoProcess` if no live process has that pid.
pub fn sys_ps_info(args: &SyscallArgs) -> Result<usize, SysError> {
    let pid = args.get_int(0);
    let addr = args.get_addr(1);

    if pid < 0 {
        err!(SysError::InvalidArgument);
    }

    let Some(info) = proc::ps_info(pid as usize) else {
        err!(SysError::NoProcess);
    };

    let wire = ProcessInfo::pack(&info);
    let bytes: [u8; PROCESS_INFO_SIZE] = wire.into();

    try_log!(proc::copy_to_user(&bytes, addr).map_err(|_| SysError::BadAddress));

    Ok(0)
}
