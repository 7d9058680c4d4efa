//! Port reservation manager.
//!
//! Before the registry binds anything, processes still listening on the
//! topology's ports (typically a previous run that did not exit cleanly) are
//! sent `SIGTERM`, and the ports are polled until released or the wait runs
//! out. This is a single-host convenience, not a lock.
//!
//! Linux only; on other platforms [`free`] logs and returns an empty report.

use std::time::Duration;

use mesh_core::Topology;

/// What [`free`] found and did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Ports that were held by another process and are now free.
    pub freed: Vec<u16>,
    /// Ports still listening when the wait ran out (including ones held by
    /// this process, which is never signalled).
    pub still_held: Vec<u16>,
}

/// A listening TCP socket from `/proc/net/tcp{,6}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenSocket {
    pub port: u16,
    pub inode: u64,
}

/// Parse the body of `/proc/net/tcp` or `/proc/net/tcp6`, keeping only
/// sockets in the LISTEN state.
pub fn parse_proc_net_tcp(content: &str) -> Vec<ListenSocket> {
    const TCP_LISTEN: &str = "0A";

    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = fields[9].parse::<u64>().ok()?;
            (inode != 0).then_some(ListenSocket { port, inode })
        })
        .collect()
}

/// Terminate whatever else listens on the topology's bound ports.
pub async fn free(topology: &Topology, wait: Duration) -> ReleaseReport {
    let ports = topology.bound_ports();
    if ports.is_empty() {
        return ReleaseReport::default();
    }
    imp::free(&ports, wait).await
}

#[cfg(target_os = "linux")]
mod imp {
    use std::time::Duration;

    use ahash::{AHashMap, AHashSet};
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use tracing::{debug, info, warn};

    use super::{ListenSocket, ReleaseReport, parse_proc_net_tcp};

    const POLL_INTERVAL: Duration = Duration::from_millis(50);

    pub(super) fn listening() -> Vec<ListenSocket> {
        ["/proc/net/tcp", "/proc/net/tcp6"]
            .iter()
            .filter_map(|p| std::fs::read_to_string(p).ok())
            .flat_map(|c| parse_proc_net_tcp(&c))
            .collect()
    }

    fn held(ports: &[u16]) -> Vec<u16> {
        let mut found: Vec<u16> = listening()
            .into_iter()
            .map(|s| s.port)
            .filter(|p| ports.contains(p))
            .collect();
        found.sort_unstable();
        found.dedup();
        found
    }

    /// Map socket inodes to the PIDs that have them open.
    fn owners(inodes: &AHashSet<u64>) -> AHashMap<u64, Vec<i32>> {
        let mut out: AHashMap<u64, Vec<i32>> = AHashMap::new();
        let Ok(proc_dir) = std::fs::read_dir("/proc") else {
            return out;
        };
        for entry in proc_dir.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            // Unreadable fd dirs belong to other users; skip them.
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                let Ok(link) = std::fs::read_link(fd.path()) else { continue };
                let Some(inode) = link
                    .to_str()
                    .and_then(|s| s.strip_prefix("socket:["))
                    .and_then(|s| s.strip_suffix(']'))
                    .and_then(|s| s.parse::<u64>().ok())
                else {
                    continue;
                };
                if inodes.contains(&inode) {
                    let pids = out.entry(inode).or_default();
                    if !pids.contains(&pid) {
                        pids.push(pid);
                    }
                }
            }
        }
        out
    }

    pub(super) async fn free(ports: &[u16], wait: Duration) -> ReleaseReport {
        let sockets: Vec<ListenSocket> = listening()
            .into_iter()
            .filter(|s| ports.contains(&s.port))
            .collect();
        if sockets.is_empty() {
            debug!("ports {ports:?} are free");
            return ReleaseReport::default();
        }

        let inodes: AHashSet<u64> = sockets.iter().map(|s| s.inode).collect();
        let owners = owners(&inodes);
        let me = std::process::id() as i32;

        let mut signalled: AHashSet<i32> = AHashSet::new();
        let mut targeted: Vec<u16> = Vec::new();
        for s in &sockets {
            let Some(pids) = owners.get(&s.inode) else {
                warn!(port = s.port, "port is held but its owner is not visible");
                continue;
            };
            for &pid in pids {
                if pid == me {
                    warn!(port = s.port, "port is held by this process, not signalling");
                    continue;
                }
                targeted.push(s.port);
                if !signalled.insert(pid) {
                    continue;
                }
                match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    Ok(()) => info!(port = s.port, pid, "sent SIGTERM to port owner"),
                    Err(e) => warn!(port = s.port, pid, "cannot terminate port owner: {e}"),
                }
            }
        }
        targeted.sort_unstable();
        targeted.dedup();

        // Only signalled ports can be released; self-held ones never are.
        let deadline = tokio::time::Instant::now() + wait;
        let mut pending = held(&targeted);
        while !pending.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            pending = held(&targeted);
        }

        let still = held(ports);
        let freed: Vec<u16> = targeted.into_iter().filter(|p| !still.contains(p)).collect();
        if !still.is_empty() {
            warn!("ports still held after {wait:?}: {still:?}");
        } else if !freed.is_empty() {
            info!("released ports {freed:?}");
        }
        ReleaseReport { freed, still_held: still }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::time::Duration;

    use super::ReleaseReport;

    pub(super) async fn free(ports: &[u16], _wait: Duration) -> ReleaseReport {
        tracing::info!("port release not supported on this platform, skipping {ports:?}");
        ReleaseReport::default()
    }
}
