#![no_std]
#![no_main]

use user::*;

const MAX_PIDS: usize = 64;

fn cstr_field(bytes: &[u8]) -> &str {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    str::from_utf8(&bytes[..len]).unwrap_or("?")
}

fn print_info(pid: usize) {
    let Ok(info) = ps_info(pid) else {
        eprintln!("ps: no such process {}", pid);
        return;
    };

    println!(
        "pid={:<5} state={:<8} ppid={:<5} mem={:<8} files={:<3} name={}",
        pid,
        cstr_field(&info.state),
        info.parent_pid,
        info.mem_size,
        info.files_count,
        cstr_field(&info.name),
    );
    println!(
        "    ticks={} run={} user={} kernel={} waiting={} switches={}",
        info.proc_ticks,
        info.run_time,
        info.user_ticks,
        info.kernel_ticks,
        info.waiting_ticks,
        info.context_switches,
    );
    println!(
        "    read_bytes={} write_bytes={} heap_pages={}",
        info.bytes_read, info.bytes_write, info.pages_count,
    );
}

/// Lists in-namespace pids only; there is no `ps_info` equivalent since those pids aren't
/// globally unique.
fn list_namespace() {
    let mut buf = [0u32; MAX_PIDS];
    let count = ps_list(&mut buf).unwrap_or_else(|_| exit_with_msg("ps: ps_list failed"));
    let shown = count.min(MAX_PIDS);

    println!(
        "{} process(es) visible in this namespace ({} shown)",
        count, shown
    );
    for &pid in &buf[..shown] {
        println!("  {}", pid);
    }
}

/// Lists global pids, printing the full `ps_info` snapshot for each.
fn list_global() {
    let mut buf = [0u32; MAX_PIDS];
    let count = ps_list_global(&mut buf).unwrap_or_else(|_| exit_with_msg("ps: ps_list failed"));
    let shown = count.min(MAX_PIDS);

    println!("{} process(es) visible ({} shown)", count, shown);
    for &pid in &buf[..shown] {
        print_info(pid as usize);
    }
}

#[unsafe(no_mangle)]
fn main(args: Args) {
    match args.get_str(1) {
        Some("-g") => list_global(),
        Some(pid) => match pid.parse::<usize>() {
            Ok(pid) => print_info(pid),
            Err(_) => exit_with_msg("usage: ps [-g | pid]"),
        },
        None => list_namespace(),
    }
}
