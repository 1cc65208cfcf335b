//! SSH transport: reaches a remote engine socket through an ssh2 channel.
//!
//! libssh2 is blocking, so the channel lives on a dedicated blocking thread
//! that shuttles bytes between the channel and one end of a local
//! socketpair; the async side gets the other end as a tokio stream.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use crate::{BoxedStream, EngineError};

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_path: PathBuf,
    /// Path of the engine socket on the remote host.
    pub socket_path: String,
}

impl SshTarget {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub async fn open_stream(target: &SshTarget) -> Result<BoxedStream, EngineError> {
    let target = target.clone();

    let (local, bridge) = std::os::unix::net::UnixStream::pair()
        .map_err(|err| EngineError::Protocol(format!("socketpair: {err}")))?;
    local
        .set_nonblocking(true)
        .map_err(|err| EngineError::Protocol(format!("socketpair: {err}")))?;
    let local = tokio::net::UnixStream::from_std(local)
        .map_err(|err| EngineError::Protocol(format!("socketpair: {err}")))?;

    // Fail fast on connect/auth errors instead of surfacing them as a dead
    // stream later.
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<Result<(), String>>();
    std::thread::Builder::new()
        .name("berth-ssh-pump".to_string())
        .spawn(move || pump(target, bridge, ready_tx))
        .map_err(|err| EngineError::Protocol(format!("spawn ssh pump: {err}")))?;

    match ready_rx.await {
        Ok(Ok(())) => Ok(Box::new(local)),
        Ok(Err(err)) => Err(EngineError::Unreachable(err)),
        Err(_) => Err(EngineError::Unreachable(
            "ssh pump exited before session setup".to_string(),
        )),
    }
}

fn pump(
    target: SshTarget,
    bridge: std::os::unix::net::UnixStream,
    ready_tx: tokio::sync::oneshot::Sender<Result<(), String>>,
) {
    let mut channel = match open_channel(&target) {
        Ok(channel) => channel,
        Err(err) => {
            let _ = ready_tx.send(Err(err.to_string()));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    if let Err(err) = shuttle(&mut channel, bridge) {
        tracing::debug!("ssh stream to {} ended: {}", target.addr(), err);
    }
    let _ = channel.close();
}

fn open_channel(target: &SshTarget) -> anyhow::Result<ssh2::Channel> {
    let tcp = std::net::TcpStream::connect(target.addr())?;
    let mut session = ssh2::Session::new()?;
    session.set_tcp_stream(tcp);
    session.handshake()?;
    session.userauth_pubkey_file(&target.username, None, &target.key_path, None)?;
    let channel = session.channel_direct_streamlocal(&target.socket_path, None)?;
    // Non-blocking from here on so one thread can service both directions.
    session.set_blocking(false);
    Ok(channel)
}

/// Copies bytes in both directions until either side closes. Both ends are
/// non-blocking; the loop parks briefly when neither direction has data.
fn shuttle(
    channel: &mut ssh2::Channel,
    bridge: std::os::unix::net::UnixStream,
) -> std::io::Result<()> {
    bridge.set_nonblocking(true)?;
    let mut bridge = bridge;
    let mut buf = [0u8; 16 * 1024];
    let mut local_open = true;

    loop {
        let mut progressed = false;

        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.eof() {
                    return Ok(());
                }
            }
            Ok(n) => {
                bridge_write_all(&mut bridge, &buf[..n])?;
                progressed = true;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }

        if local_open {
            match bridge.read(&mut buf) {
                Ok(0) => {
                    local_open = false;
                    let _ = channel.send_eof();
                }
                Ok(n) => {
                    channel_write_all(channel, &buf[..n])?;
                    progressed = true;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
        }

        if !progressed {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

fn bridge_write_all(
    bridge: &mut std::os::unix::net::UnixStream,
    mut data: &[u8],
) -> std::io::Result<()> {
    while !data.is_empty() {
        match bridge.write(data) {
            Ok(n) => data = &data[n..],
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn channel_write_all(channel: &mut ssh2::Channel, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        match channel.write(data) {
            Ok(n) => data = &data[n..],
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
