//! Minimal Docker CLI wrapper for integration tests.
//!
//! Shells out to `docker`; no daemon API client, no serde.
//!
//! ```ignore
//! let container = Container::run(containers::postgres("16-alpine", "test"))?;
//! let port = container.wait_for_port(5432, Duration::from_secs(10))?;
//! // container is removed on drop
//! ```

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, Instant};

/// Errors from talking to the docker CLI.
#[derive(Debug)]
pub enum Error {
    /// The `docker` binary could not be spawned.
    Spawn(std::io::Error),
    /// `docker` exited unsuccessfully.
    Command { args: String, stderr: String },
    /// Waited too long for something.
    Timeout(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Spawn(e) => write!(f, "failed to run docker: {e}"),
            Error::Command { args, stderr } => {
                write!(f, "docker {args} failed: {}", stderr.trim())
            }
            Error::Timeout(what) => write!(f, "timed out waiting for {what}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// What to run.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub env: Vec<(String, String)>,
    pub ports: Vec<u16>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            env: Vec::new(),
            ports: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Publishes a container port on a random host port.
    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_owned(), "-d".to_owned(), "--rm".to_owned()];
        for (key, value) in &self.env {
            args.push("-e".to_owned());
            args.push(format!("{key}={value}"));
        }
        for port in &self.ports {
            args.push("-p".to_owned());
            args.push(format!("127.0.0.1::{port}"));
        }
        args.push(self.image.clone());
        args
    }
}

/// Ready-made specs.
pub mod containers {
    use super::ContainerSpec;

    /// `postgres:<tag>` with the given superuser password.
    pub fn postgres(tag: &str, password: &str) -> ContainerSpec {
        ContainerSpec::new(format!("postgres:{tag}"))
            .env("POSTGRES_PASSWORD", password)
            .port(5432)
    }
}

/// A running container. Removed (forcefully) on drop.
pub struct Container {
    id: String,
}

fn docker(args: &[&str]) -> Result<Output> {
    let output = Command::new("docker")
        .args(args)
        .output()
        .map_err(Error::Spawn)?;
    if !output.status.success() {
        return Err(Error::Command {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output)
}

impl Container {
    pub fn run(spec: ContainerSpec) -> Result<Self> {
        let args = spec.run_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = docker(&args)?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        Ok(Self { id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Combined stdout and stderr of the container so far.
    pub fn logs(&self) -> Result<String> {
        let output = docker(&["logs", &self.id])?;
        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    /// Polls the logs until `needle` shows up.
    pub fn wait_for_log(&self, needle: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.logs()?.contains(needle) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!("log line {needle:?}")));
            }
            thread::sleep(Duration::from_millis(200));
        }
    }

    /// Host port a container port is published on.
    pub fn host_port(&self, port: u16) -> Result<u16> {
        let output = docker(&["port", &self.id, &format!("{port}/tcp")])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // e.g. "127.0.0.1:49153"
        stdout
            .lines()
            .filter_map(|line| line.rsplit(':').next())
            .find_map(|p| p.trim().parse().ok())
            .ok_or_else(|| Error::Command {
                args: format!("port {} {port}/tcp", self.id),
                stderr: format!("unexpected output {stdout:?}"),
            })
    }

    /// Waits until the published port accepts TCP connections, returning
    /// the host port.
    pub fn wait_for_port(&self, port: u16, timeout: Duration) -> Result<u16> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(host_port) = self.host_port(port) {
                let addr = SocketAddr::from(([127, 0, 0, 1], host_port));
                if TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok() {
                    return Ok(host_port);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!("port {port}")));
            }
            thread::sleep(Duration::from_millis(200));
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        let _ = docker(&["rm", "-f", &self.id]);
    }
}
