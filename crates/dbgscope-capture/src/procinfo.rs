//! Best-effort process name lookup.

/// Resolve the executable name of `pid`
///
/// Returns an empty string when the process cannot be inspected, for example
/// because it already exited. Callers show the pid alone in that case.
pub fn process_name(pid: u32) -> String {
    lookup(pid).unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn lookup(pid: u32) -> Option<String> {
    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    let name = comm.trim_end();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(not(target_os = "linux"))]
fn lookup(_pid: u32) -> Option<String> {
    None
}
