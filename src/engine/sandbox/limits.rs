//! Child process confinement
//!
//! Everything here runs in the forked child before `exec`, so it sticks to
//! plain syscalls: no allocation, no locks, no logging.

use std::io;
use std::sync::OnceLock;

use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::setsid;
use tokio::process::Command;
use tracing::{info, warn};

use super::config::NetworkPolicy;

/// Resource limits for sandbox execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Soft RLIMIT_CPU in whole seconds; the hard limit is one second later
    pub cpu_secs: u64,
    /// RLIMIT_AS, when the runtime tolerates it
    pub address_space_bytes: Option<u64>,
    /// Maximum open files
    pub open_files: u64,
    /// Maximum size of any file the process writes
    pub fsize_bytes: u64,
    pub network: NetworkPolicy,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            cpu_secs: 10,
            address_space_bytes: None,
            open_files: 256,
            fsize_bytes: 256 * 1024 * 1024, // 256MB
            network: NetworkPolicy::default(),
        }
    }
}

impl Limits {
    /// CPU seconds for a wall-clock budget: rounded up, plus one second of slack
    pub fn cpu_secs_for(time_ms: u64) -> u64 {
        time_ms.div_ceil(1000) + 1
    }

    /// Arrange for the limits to be applied in the child between fork and exec
    pub fn install(&self, command: &mut Command) {
        let limits = *self;
        // SAFETY: `apply` only issues async-signal-safe syscalls and touches
        // no memory shared with the parent.
        unsafe {
            command.pre_exec(move || limits.apply());
        }
    }

    /// Confine the calling process; only meant to run inside `pre_exec`
    pub fn apply(&self) -> io::Result<()> {
        // Own session and process group so the whole tree can be killed at once
        setsid()?;

        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        // SIGXCPU at the soft limit; SIGKILL only if the program ignores it
        setrlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        setrlimit(Resource::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        setrlimit(Resource::RLIMIT_FSIZE, self.fsize_bytes, self.fsize_bytes)?;
        if let Some(bytes) = self.address_space_bytes {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }

        isolate_network(self.network)
    }
}

/// Move the process into an empty network namespace
fn isolate_network(policy: NetworkPolicy) -> io::Result<()> {
    if policy == NetworkPolicy::Off {
        return Ok(());
    }
    if unshare(CloneFlags::CLONE_NEWNET).is_ok() {
        return Ok(());
    }
    // Unprivileged hosts usually allow a user namespace to carry the net one
    match unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET) {
        Ok(()) => Ok(()),
        Err(e) if policy == NetworkPolicy::Enforce => Err(e.into()),
        Err(_) => Ok(()),
    }
}

/// Cached result of the network namespace probe
static NETWORK_ISOLATION: OnceLock<bool> = OnceLock::new();

/// Check once whether this host lets us create private network namespaces
pub async fn is_network_isolation_available() -> bool {
    if let Some(value) = NETWORK_ISOLATION.get() {
        return *value;
    }

    let mut command = Command::new("/bin/sh");
    command.args(["-c", "exit 0"]);
    Limits {
        network: NetworkPolicy::Enforce,
        ..Limits::default()
    }
    .install(&mut command);

    let available = match command.status().await {
        Ok(status) => status.success(),
        Err(_) => false,
    };

    if available {
        info!("Network namespaces available, sandboxed processes run offline");
    } else {
        warn!("Network namespaces unavailable, sandboxed processes keep host networking");
    }

    let _ = NETWORK_ISOLATION.set(available);
    available
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_secs_rounds_up() {
        assert_eq!(Limits::cpu_secs_for(10_000), 11);
        assert_eq!(Limits::cpu_secs_for(10_001), 12);
        assert_eq!(Limits::cpu_secs_for(1), 2);
    }

    #[tokio::test]
    async fn test_limits_visible_to_child() {
        let mut command = Command::new("/bin/sh");
        command.args(["-c", "ulimit -n"]);
        Limits {
            open_files: 64,
            network: NetworkPolicy::Off,
            ..Limits::default()
        }
        .install(&mut command);

        let output = command.output().await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "64");
    }

    #[tokio::test]
    async fn test_cpu_limit_delivers_sigxcpu() {
        use std::os::unix::process::ExitStatusExt;

        let mut command = Command::new("/bin/sh");
        command.args(["-c", "while :; do :; done"]);
        Limits {
            cpu_secs: 1,
            network: NetworkPolicy::Off,
            ..Limits::default()
        }
        .install(&mut command);

        let status = command.status().await.unwrap();
        assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGXCPU as i32));
    }

    #[tokio::test]
    async fn test_child_gets_own_session() {
        let mut command = Command::new("/bin/sh");
        // Session leader: pid, process group and session id all match
        command.args([
            "-c",
            "set -- $(cat /proc/$$/stat); [ \"$1\" = \"$5\" ] && [ \"$1\" = \"$6\" ]",
        ]);
        Limits {
            network: NetworkPolicy::Off,
            ..Limits::default()
        }
        .install(&mut command);

        assert!(command.status().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_probe_is_cached() {
        let first = is_network_isolation_available().await;
        assert_eq!(is_network_isolation_available().await, first);
    }
}
