// Copyright 2024-2026 the Gantry authors. MIT license.

//! Single-instance mutual exclusion. Two strategies behind one guard:
//! an advisory lock file, or a loopback-TCP handoff protocol where the
//! first arrival becomes the leader and later arrivals wait for its
//! socket to close.

use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use log::error;
use log::warn;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::error::ResolveError;
use crate::error::UserError;

pub const DEFAULT_MUTEX_FILENAME: &str = ".gantry-single-instance";
pub const DEFAULT_MUTEX_PORT: u16 = 31997;

const FILE_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const SOCKET_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A mutex scope from the command line: `file[:path]` or
/// `network[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutexSpecifier {
  File(Option<PathBuf>),
  Network(Option<u16>),
}

impl FromStr for MutexSpecifier {
  type Err = UserError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (kind, arg) = match s.split_once(':') {
      Some((kind, arg)) => (kind, Some(arg)),
      None => (s, None),
    };
    match kind {
      "file" => Ok(MutexSpecifier::File(arg.map(PathBuf::from))),
      "network" => match arg {
        None => Ok(MutexSpecifier::Network(None)),
        Some(port) => port
          .parse()
          .map(|port| MutexSpecifier::Network(Some(port)))
          .map_err(|_| {
            UserError(format!("Invalid single-instance port \"{port}\""))
          }),
      },
      _ => Err(UserError(format!(
        "Invalid single-instance specifier \"{s}\"; expected file[:path] or network[:port]"
      ))),
    }
  }
}

/// Held for the lifetime of the run; releasing hands the scope to the
/// next waiting instance.
pub enum SingleInstanceGuard {
  File(FileGuard),
  Network(NetworkGuard),
}

impl SingleInstanceGuard {
  pub async fn release(self) {
    match self {
      SingleInstanceGuard::File(guard) => guard.release(),
      SingleInstanceGuard::Network(guard) => guard.release().await,
    }
  }
}

/// Blocks until this process owns the mutex scope.
pub async fn acquire(
  specifier: &MutexSpecifier,
  cwd: &Path,
) -> Result<SingleInstanceGuard, ResolveError> {
  match specifier {
    MutexSpecifier::File(path) => {
      let path = path
        .clone()
        .unwrap_or_else(|| cwd.join(DEFAULT_MUTEX_FILENAME));
      Ok(SingleInstanceGuard::File(acquire_file(path).await?))
    }
    MutexSpecifier::Network(port) => {
      let port = port.unwrap_or(DEFAULT_MUTEX_PORT);
      Ok(SingleInstanceGuard::Network(
        acquire_network(port, cwd).await?,
      ))
    }
  }
}

pub struct FileGuard {
  path: PathBuf,
}

impl FileGuard {
  pub fn release(self) {
    // dropping runs the cleanup
  }
}

impl Drop for FileGuard {
  fn drop(&mut self) {
    if let Err(err) = std::fs::remove_file(&self.path) {
      warn!(
        "Failed removing single-instance file {}: {err}",
        self.path.display()
      );
    }
  }
}

async fn acquire_file(path: PathBuf) -> Result<FileGuard, ResolveError> {
  use std::io::Write;

  let mut warned = false;
  loop {
    match std::fs::OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(&path)
    {
      Ok(mut file) => {
        let _ = write!(file, "{}", std::process::id());
        return Ok(FileGuard { path });
      }
      Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
        if !warned {
          warn!(
            "Waiting for the other gantry instance holding {} to finish",
            path.display()
          );
          warned = true;
        }
        tokio::time::sleep(FILE_RETRY_INTERVAL).await;
      }
      Err(err) => {
        return Err(ResolveError::Unexpected(
          anyhow::Error::new(err).context(format!(
            "failed acquiring single-instance file {}",
            path.display()
          )),
        ));
      }
    }
  }
}

pub struct NetworkGuard {
  accept_task: JoinHandle<()>,
  connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl NetworkGuard {
  /// Shuts the server down and destroys every accepted socket, waking
  /// the waiting followers. If sockets somehow remain live past the
  /// grace period, the process force-exits.
  pub async fn release(self) {
    self.accept_task.abort();
    let handles = std::mem::take(&mut *self.connections.lock().unwrap());
    for handle in &handles {
      handle.abort();
    }
    let deadline = tokio::time::Instant::now() + SOCKET_CLOSE_GRACE;
    loop {
      let live = handles.iter().filter(|h| !h.is_finished()).count();
      if live == 0 {
        return;
      }
      if tokio::time::Instant::now() >= deadline {
        error!(
          "{live} single-instance socket(s) still active after shutdown; exiting"
        );
        std::process::exit(1);
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
  }
}

async fn acquire_network(
  port: u16,
  cwd: &Path,
) -> Result<NetworkGuard, ResolveError> {
  let mut warned = false;
  loop {
    match TcpListener::bind(("127.0.0.1", port)).await {
      Ok(listener) => {
        let body = serde_json::json!({
          "cwd": cwd.display().to_string(),
          "pid": std::process::id(),
        })
        .to_string();
        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> =
          Arc::new(Mutex::new(Vec::new()));
        let accept_task =
          tokio::spawn(accept_loop(listener, body, connections.clone()));
        return Ok(NetworkGuard {
          accept_task,
          connections,
        });
      }
      Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
        if !warned {
          warn_about_leader(port).await;
          warned = true;
        }
        wait_for_leader_exit(port).await;
        // the port should be free now; contend for it again
      }
      Err(err) => {
        return Err(ResolveError::Unexpected(
          anyhow::Error::new(err)
            .context(format!("failed binding single-instance port {port}")),
        ));
      }
    }
  }
}

async fn accept_loop(
  listener: TcpListener,
  body: String,
  connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
  loop {
    let Ok((socket, _)) = listener.accept().await else {
      break;
    };
    let body = body.clone();
    let handle = tokio::spawn(handle_connection(socket, body));
    connections.lock().unwrap().push(handle);
  }
}

async fn handle_connection(mut socket: TcpStream, body: String) {
  // the request line is irrelevant; every query gets the same answer
  let mut buf = [0u8; 1024];
  if matches!(socket.read(&mut buf).await, Ok(0) | Err(_)) {
    return;
  }
  let response = format!(
    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    body.len(),
    body
  );
  let _ = socket.write_all(response.as_bytes()).await;
  // hold the socket open until we are torn down; followers watch it
  // for the leader's exit
  let _ = socket.read(&mut buf).await;
}

/// Asks the leader who it is and logs the answer.
async fn warn_about_leader(port: u16) {
  let identity: Option<(String, u64)> = query_leader(port).await;
  match identity {
    Some((cwd, pid)) => warn!(
      "Waiting for the gantry instance running in {cwd} (pid {pid}) to finish"
    ),
    None => {
      warn!("Waiting for the other gantry instance on port {port} to finish")
    }
  }
}

async fn query_leader(port: u16) -> Option<(String, u64)> {
  let mut stream = TcpStream::connect(("127.0.0.1", port)).await.ok()?;
  stream
    .write_all(
      format!(
        "GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n"
      )
      .as_bytes(),
    )
    .await
    .ok()?;
  let mut response = Vec::new();
  let mut buf = [0u8; 1024];
  loop {
    match stream.read(&mut buf).await {
      Ok(0) | Err(_) => break,
      Ok(n) => {
        response.extend_from_slice(&buf[..n]);
        // the leader keeps the socket open after responding
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
          break;
        }
      }
    }
  }
  let response = String::from_utf8(response).ok()?;
  let body = response.split_once("\r\n\r\n")?.1;
  let value: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
  Some((
    value.get("cwd")?.as_str()?.to_string(),
    value.get("pid")?.as_u64()?,
  ))
}

/// Opens a raw connection to the leader and waits for it to close,
/// which signals the leader exited.
async fn wait_for_leader_exit(port: u16) {
  match TcpStream::connect(("127.0.0.1", port)).await {
    Ok(mut stream) => {
      let mut buf = [0u8; 256];
      loop {
        match stream.read(&mut buf).await {
          Ok(0) | Err(_) => break,
          Ok(_) => {}
        }
      }
    }
    Err(_) => {
      // the leader vanished between probes
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
  }
}

#[cfg(test)]
mod test {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn parses_specifiers() {
    assert_eq!(
      "file".parse::<MutexSpecifier>().unwrap(),
      MutexSpecifier::File(None)
    );
    assert_eq!(
      "file:/tmp/lock".parse::<MutexSpecifier>().unwrap(),
      MutexSpecifier::File(Some(PathBuf::from("/tmp/lock")))
    );
    assert_eq!(
      "network".parse::<MutexSpecifier>().unwrap(),
      MutexSpecifier::Network(None)
    );
    assert_eq!(
      "network:9010".parse::<MutexSpecifier>().unwrap(),
      MutexSpecifier::Network(Some(9010))
    );
    assert!("network:not-a-port".parse::<MutexSpecifier>().is_err());
    assert!("socket".parse::<MutexSpecifier>().is_err());
  }

  #[tokio::test]
  async fn file_mutex_excludes_second_instance() {
    let dir = tempfile::tempdir().unwrap();
    let specifier =
      MutexSpecifier::File(Some(dir.path().join("instance.lock")));

    let guard = acquire(&specifier, dir.path()).await.unwrap();

    // a second acquire stays pending while the first guard is held
    let contender = acquire(&specifier, dir.path());
    let outcome =
      tokio::time::timeout(Duration::from_millis(300), contender).await;
    assert!(outcome.is_err());

    guard.release().await;
    let second = tokio::time::timeout(
      Duration::from_secs(2),
      acquire(&specifier, dir.path()),
    )
    .await
    .expect("second instance should acquire after release")
    .unwrap();
    second.release().await;
  }

  #[tokio::test]
  async fn network_mutex_hands_over_on_release() {
    let dir = tempfile::tempdir().unwrap();
    let specifier = MutexSpecifier::Network(Some(48661));

    let leader = acquire(&specifier, dir.path()).await.unwrap();

    // the leader answers identity queries
    let (cwd, pid) = query_leader(48661).await.unwrap();
    assert_eq!(cwd, dir.path().display().to_string());
    assert_eq!(pid, std::process::id() as u64);

    // a follower stays pending until the leader releases
    let follower = tokio::spawn({
      let specifier = specifier.clone();
      let cwd = dir.path().to_path_buf();
      async move { acquire(&specifier, &cwd).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!follower.is_finished());

    leader.release().await;
    let follower_guard =
      tokio::time::timeout(Duration::from_secs(5), follower)
        .await
        .expect("follower should take over")
        .unwrap()
        .unwrap();
    follower_guard.release().await;
  }
}
