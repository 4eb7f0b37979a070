use std::{fmt, net::IpAddr, path::Path, time::Duration};

use anyhow::Context;
use preview_instance::PrNumber;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::oneshot,
};

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub pr: PrNumber,
    /// Working directory: the site sources inside the PR's checkout.
    pub cwd: &'a Path,
    pub port: u16,
    pub bind_addr: IpAddr,
}

/// Starts the static-site server for one preview.
pub trait SiteLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec<'_>) -> anyhow::Result<Box<dyn SiteServer>>;
}

/// A running site server. Dropping the handle stops the server too.
pub trait SiteServer: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;
    /// Asks the server to stop without waiting for it to exit.
    fn kill(&mut self);
}

/// Spawns a jekyll-style server: `<command...> -P <port> -H <addr> --no-watch`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(command: &[String]) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("server command must be non-empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl SiteLauncher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> anyhow::Result<Box<dyn SiteServer>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-P")
            .arg(spec.port.to_string())
            .arg("-H")
            .arg(spec.bind_addr.to_string())
            .arg("--no-watch")
            .current_dir(spec.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "spawn site server `{}` (cwd {})",
                self.program,
                spec.cwd.display()
            )
        })?;
        let pid = child.id();
        forward_output(&mut child, spec.pr);

        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(supervise(child, spec.pr, spec.port, stop_rx));

        tracing::info!(pr = %spec.pr, port = spec.port, pid = ?pid, "site server spawned");
        Ok(Box::new(ServerProcess {
            pid,
            stop: Some(stop_tx),
        }))
    }
}

#[derive(Debug)]
struct ServerProcess {
    pid: Option<u32>,
    stop: Option<oneshot::Sender<()>>,
}

impl SiteServer for ServerProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn forward_output(child: &mut Child, pr: PrNumber) {
    if let Some(out) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(pr = %pr, "[stdout] {line}");
            }
        });
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(pr = %pr, "[stderr] {line}");
            }
        });
    }
}

// Owns the child until it exits. A stop request (or the handle being dropped)
// sends SIGTERM to the process group and escalates to SIGKILL after a grace period.
async fn supervise(mut child: Child, pr: PrNumber, port: u16, stop_rx: oneshot::Receiver<()>) {
    let pgid = child.id().map(|p| p as i32);

    tokio::select! {
        res = child.wait() => {
            match res {
                Ok(status) => tracing::warn!(pr = %pr, port, exit_code = ?status.code(), "site server exited on its own"),
                Err(e) => tracing::warn!(pr = %pr, port, error = %e, "site server wait failed"),
            }
            return;
        }
        _ = stop_rx => {}
    }

    signal_group(pgid, Signal::Term);
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(pr = %pr, port, exit_code = ?status.code(), "site server stopped");
        }
        Ok(Err(e)) => tracing::warn!(pr = %pr, port, error = %e, "site server wait failed"),
        Err(_) => {
            signal_group(pgid, Signal::Kill);
            let _ = child.kill().await;
            tracing::warn!(pr = %pr, port, "site server killed after timeout");
        }
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: Option<i32>, signal: Signal) {
    let Some(pgid) = pgid else {
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(-pgid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<i32>, _signal: Signal) {}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the host dies, the server should not outlive it holding the port.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}
