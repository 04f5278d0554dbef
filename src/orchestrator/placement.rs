//! Best-effort CPU pinning and scheduling priority for controllers. Every
//! failure here is logged and otherwise ignored.

use log::{debug, warn};
use std::io;

/// The core a controller should run on: its configured core, or one per
/// launch slot wrapped around the available cores.
pub fn cpu_for(configured: Option<usize>, slot: usize) -> usize {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    configured.unwrap_or(slot) % cores
}

/// Pin `pid` (0 for the calling thread) to `cpu` and set its nice value.
pub fn place(name: &str, pid: u32, cpu: usize, nice: i32) {
    match pin_to_cpu(pid, cpu) {
        Ok(()) => debug!("{name} : pinned to cpu {cpu}"),
        Err(e) => warn!("{name} : could not pin to cpu {cpu} : {e}"),
    }
    match set_nice(pid, nice) {
        Ok(()) => debug!("{name} : nice {nice}"),
        Err(e) => warn!("{name} : could not set nice {nice} : {e}"),
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(pid: u32, cpu: usize) -> io::Result<()> {
    let ret = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(
            pid as libc::pid_t,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_pid: u32, _cpu: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "cpu affinity is only supported on linux",
    ))
}

fn set_nice(pid: u32, nice: i32) -> io::Result<()> {
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
