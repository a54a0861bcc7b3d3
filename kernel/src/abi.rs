// Exports common ABI types and constants for use by userspace programs.
pub use crate::file::{CONSOLE, OpenFlag};
pub use crate::fs::{DIRSIZE, Directory, InodeType, Stat};
pub use crate::param::{MAXPATH, NAME_SIZE, STATE_SIZE};
pub use crate::syscall::Syscall;

use crate::proc::ProcSnapshot;

/// Size in bytes of the `process_info` wire record returned by `ps_info`.
pub const PROCESS_INFO_SIZE: usize = 80;

/// Packed, little-endian, unpadded wire format for a single `ps_info` result:
///
/// | offset | size | field            |
/// |--------|------|------------------|
/// | 0      | 16   | state            |
/// | 16     | 4    | parent_pid       |
/// | 20     | 4    | mem_size         |
/// | 24     | 4    | files_count      |
/// | 28     | 16   | name             |
/// | 44     | 4    | proc_ticks       |
/// | 48     | 4    | run_time         |
/// | 52     | 4    | context_switches |
/// | 56     | 4    | user_ticks       |
/// | 60     | 4    | kernel_ticks     |
/// | 64     | 4    | waiting_ticks    |
/// | 68     | 4    | bytes_read       |
/// | 72     | 4    | bytes_write      |
/// | 76     | 4    | pages_count      |
#[derive(Debug, Clone, Copy)]
pub struct ProcessInfo {
    pub state: [u8; STATE_SIZE],
    pub parent_pid: i32,
    pub mem_size: i32,
    pub files_count: i32,
    pub name: [u8; NAME_SIZE],
    pub proc_ticks: u32,
    pub run_time: u32,
    pub context_switches: u32,
    pub user_ticks: u32,
    pub kernel_ticks: u32,
    pub waiting_ticks: u32,
    pub bytes_read: u32,
    pub bytes_write: u32,
    pub pages_count: u32,
}

impl ProcessInfo {
    /// Packs a kernel-side `ProcessInfo` snapshot into the wire layout, NUL-padding `state` and
    /// `name` and truncating them if they don't fit.
    pub fn pack(info: &ProcSnapshot) -> Self {
        let mut state = [0u8; STATE_SIZE];
        let state_bytes = info.state.as_bytes();
        let len = state_bytes.len().min(STATE_SIZE);
        state[..len].copy_from_slice(&state_bytes[..len]);

        let mut name = [0u8; NAME_SIZE];
        let name_bytes = info.name.as_bytes();
        let len = name_bytes.len().min(NAME_SIZE);
        name[..len].copy_from_slice(&name_bytes[..len]);

        Self {
            state,
            parent_pid: info.parent_pid,
            mem_size: info.mem_size,
            files_count: info.files_count,
            name,
            proc_ticks: info.proc_ticks,
            run_time: info.run_time,
            context_switches: info.context_switches,
            user_ticks: info.user_ticks,
            kernel_ticks: info.kernel_ticks,
            waiting_ticks: info.waiting_ticks,
            bytes_read: info.bytes_read,
            bytes_write: info.bytes_write,
            pages_count: info.pages_count,
        }
    }
}

impl From<ProcessInfo> for [u8; PROCESS_INFO_SIZE] {
    fn from(info: ProcessInfo) -> Self {
        let mut out = [0u8; PROCESS_INFO_SIZE];
        let mut at = 0;

        macro_rules! put {
            ($bytes:expr) => {{
                let bytes = $bytes;
                out[at..at + bytes.len()].copy_from_slice(&bytes);
                at += bytes.len();
            }};
        }

        put!(info.state);
        put!(info.parent_pid.to_le_bytes());
        put!(info.mem_size.to_le_bytes());
        put!(info.files_count.to_le_bytes());
        put!(info.name);
        put!(info.proc_ticks.to_le_bytes());
        put!(info.run_time.to_le_bytes());
        put!(info.context_switches.to_le_bytes());
        put!(info.user_ticks.to_le_bytes());
        put!(info.kernel_ticks.to_le_bytes());
        put!(info.waiting_ticks.to_le_bytes());
        put!(info.bytes_read.to_le_bytes());
        put!(info.bytes_write.to_le_bytes());
        put!(info.pages_count.to_le_bytes());

        debug_assert_eq!(at, PROCESS_INFO_SIZE);
        out
    }
}

impl From<[u8; PROCESS_INFO_SIZE]> for ProcessInfo {
    fn from(buf: [u8; PROCESS_INFO_SIZE]) -> Self {
        let mut state = [0u8; STATE_SIZE];
        state.copy_from_slice(&buf[0..16]);
        let mut name = [0u8; NAME_SIZE];
        name.copy_from_slice(&buf[28..44]);

        Self {
            state,
            parent_pid: i32::from_le_bytes(buf[16..20].try_into().unwrap()),
            mem_size: i32::from_le_bytes(buf[20..24].try_into().unwrap()),
            files_count: i32::from_le_bytes(buf[24..28].try_into().unwrap()),
            name,
            proc_ticks: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
            run_time: u32::from_le_bytes(buf[48..52].try_into().unwrap()),
            context_switches: u32::from_le_bytes(buf[52..56].try_into().unwrap()),
            user_ticks: u32::from_le_bytes(buf[56..60].try_into().unwrap()),
            kernel_ticks: u32::from_le_bytes(buf[60..64].try_into().unwrap()),
            waiting_ticks: u32::from_le_bytes(buf[64..68].try_into().unwrap()),
            bytes_read: u32::from_le_bytes(buf[68..72].try_into().unwrap()),
            bytes_write: u32::from_le_bytes(buf[72..76].try_into().unwrap()),
            pages_count: u32::from_le_bytes(buf[76..80].try_into().unwrap()),
        }
    }
}
