//! OS-level process and port primitives
//!
//! Allocation and reclaim logic only sees [`ProcessInspector`] and [`PortProbe`].
//! On Linux processes are discovered through `/proc`; other Unix systems parse `ps`.

use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

/// A live tunnel client and the loopback port it forwards from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelProcess {
    pub pid: u32,
    pub local_port: u16,
    pub command: String,
}

#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// Every tunnel client currently forwarding a loopback port
    async fn list_tunnels(&self) -> io::Result<Vec<TunnelProcess>>;

    async fn find_tunnels(&self, local_port: u16) -> io::Result<Vec<TunnelProcess>> {
        Ok(self
            .list_tunnels()
            .await?
            .into_iter()
            .filter(|process| process.local_port == local_port)
            .collect())
    }

    /// Start a process that outlives the caller. Returns its pid.
    async fn spawn_detached(&self, argv: &[String]) -> io::Result<u32>;

    /// Ask a process to exit. A process that is already gone is not an error.
    async fn terminate(&self, pid: u32) -> io::Result<()>;
}

#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Whether something on this host is bound to the port
    fn is_listening(&self, port: u16) -> bool;

    /// Whether the loopback endpoint answers a request with any bytes at all
    async fn responds(&self, port: u16, timeout: Duration) -> bool;
}

/// Loopback port a tunnel command line forwards from, if any.
///
/// Matches the `-L 127.0.0.1:<port>:<host>:<port>` form produced by
/// [`crate::tunnel::ssh_command`].
pub fn forwarded_port<S: AsRef<str>>(args: &[S]) -> Option<u16> {
    args.windows(2).find_map(|pair| {
        if pair[0].as_ref() != "-L" {
            return None;
        }
        let forward = pair[1].as_ref().strip_prefix("127.0.0.1:")?;
        let (port, _) = forward.split_once(':')?;
        port.parse().ok()
    })
}

fn describe(args: &[String]) -> String {
    args.join(" ")
}

/// Process primitives of the host this manager runs on
#[derive(Debug, Default, Clone)]
pub struct SystemProcessInspector;

impl SystemProcessInspector {
    #[cfg(target_os = "linux")]
    fn scan() -> io::Result<Vec<TunnelProcess>> {
        let own_pid = std::process::id();
        let processes = procfs::process::all_processes().map_err(io::Error::other)?;

        let mut tunnels = Vec::new();
        for process in processes.flatten() {
            // Exited or inaccessible processes disappear between listing and reading
            let Ok(args) = process.cmdline() else {
                continue;
            };
            let Ok(pid) = u32::try_from(process.pid()) else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            if let Some(local_port) = forwarded_port(&args) {
                tunnels.push(TunnelProcess {
                    pid,
                    local_port,
                    command: describe(&args),
                });
            }
        }
        Ok(tunnels)
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    fn scan() -> io::Result<Vec<TunnelProcess>> {
        let output = std::process::Command::new("ps")
            .args(["-axo", "pid=,args="])
            .output()?;
        let own_pid = std::process::id();

        let listing = String::from_utf8_lossy(&output.stdout);
        let mut tunnels = Vec::new();
        for line in listing.lines() {
            let mut fields = line.split_whitespace();
            let Some(pid) = fields.next().and_then(|pid| pid.parse::<u32>().ok()) else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            let args: Vec<String> = fields.map(str::to_string).collect();
            if let Some(local_port) = forwarded_port(&args) {
                tunnels.push(TunnelProcess {
                    pid,
                    local_port,
                    command: describe(&args),
                });
            }
        }
        Ok(tunnels)
    }

    #[cfg(not(unix))]
    fn scan() -> io::Result<Vec<TunnelProcess>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process discovery is only implemented for Unix",
        ))
    }
}

#[async_trait]
impl ProcessInspector for SystemProcessInspector {
    async fn list_tunnels(&self) -> io::Result<Vec<TunnelProcess>> {
        tokio::task::spawn_blocking(Self::scan)
            .await
            .map_err(io::Error::other)?
    }

    async fn spawn_detached(&self, argv: &[String]) -> io::Result<u32> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Own process group, so signals aimed at the invoking shell do not reach the tunnel
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned process exited immediately"))?;
        debug!("Spawned detached process {}: {}", pid, describe(argv));
        // Dropping the handle leaves the process running; tokio reaps it if it exits first
        drop(child);
        Ok(pid)
    }

    #[cfg(unix)]
    async fn terminate(&self, pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!("Process {} already gone", pid);
            Ok(())
        } else {
            Err(err)
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&self, _pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process termination is only implemented for Unix",
        ))
    }
}

/// Probes sockets on this host
#[derive(Debug, Default, Clone)]
pub struct SystemPortProbe;

#[async_trait]
impl PortProbe for SystemPortProbe {
    fn is_listening(&self, port: u16) -> bool {
        // A tunnel binds loopback, anything else may bind the wildcard address
        [Ipv4Addr::LOCALHOST, Ipv4Addr::UNSPECIFIED]
            .into_iter()
            .any(|ip| TcpListener::bind(SocketAddr::from((ip, port))).is_err())
    }

    async fn responds(&self, port: u16, timeout: Duration) -> bool {
        let attempt = async {
            let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
            stream
                .write_all(b"HEAD / HTTP/1.0\r\nHost: 127.0.0.1\r\n\r\n")
                .await?;
            let mut buf = [0u8; 64];
            let read = stream.read(&mut buf).await?;
            Ok::<_, io::Error>(read > 0)
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(answered)) => answered,
            Ok(Err(e)) => {
                debug!("Port {} did not answer: {}", port, e);
                false
            }
            Err(_) => false,
        }
    }
}
