////////////////////////////////////////////////////////////////////////////////
//                                                                            //
//  Copyright (c) 2025 Leonardo Consoni                                       //
//                                                                            //
//  This file is part of Stimwalker.                                          //
//                                                                            //
//  Stimwalker is free software: you can redistribute it and/or modify        //
//  it under the terms of the GNU Lesser General Public License as published  //
//  by the Free Software Foundation, either version 3 of the License, or      //
//  (at your option) any later version.                                       //
//                                                                            //
//  Stimwalker is distributed in the hope that it will be useful,             //
//  but WITHOUT ANY WARRANTY; without even the implied warranty of            //
//  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the              //
//  GNU Lesser General Public License for more details.                       //
//                                                                            //
//  You should have received a copy of the GNU Lesser General Public License  //
//  along with Stimwalker. If not, see <http://www.gnu.org/licenses/>.        //
//                                                                            //
////////////////////////////////////////////////////////////////////////////////

//! Two-channel TCP front-end of the runner.
//!
//! A client opens the command channel first, then the data channel. Requests
//! arrive on the command channel and are answered there with `OK` or `ERROR`;
//! any payload goes out on the data channel first, framed as a big-endian `u32`
//! length followed by JSON. One client is served at a time.
//!
//! Requests are newline-terminated. A trailing request without a terminator is
//! still served once the client has been quiet for [`REQUEST_SETTLE`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::protocol::{self, Flow, Outcome};
use crate::runner::Runner;

const MAX_BIND_RETRY: Duration = Duration::from_secs(30);
pub const REQUEST_SETTLE: Duration = Duration::from_millis(50);

enum Pairing {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    ClientGone,
    Shutdown,
}

pub struct IpcServer {
    runner: Arc<Runner>,
    command_listener: TcpListener,
    data_listener: TcpListener,
    shutdown_notify: Arc<Notify>,
}

impl IpcServer {
    /// Binds both listeners, retrying with a growing delay until the ports are free.
    pub async fn bind(runner: Arc<Runner>, config: &ServerConfig) -> Result<Self> {
        let retry = Duration::from_millis(config.bind_retry_ms.max(1));
        let command_address = format!("{}:{}", config.address, config.command_port);
        let data_address = format!("{}:{}", config.address, config.data_port);

        let command_listener = Self::bind_with_retry(&command_address, retry).await;
        let data_listener = Self::bind_with_retry(&data_address, retry).await;

        let server = IpcServer {
            runner,
            command_listener,
            data_listener,
            shutdown_notify: Arc::new(Notify::new()),
        };
        let (command, data) = server.local_addrs()?;
        info!("IPC server bound to:");
        info!("  Commands: {}", command);
        info!("  Data: {}", data);
        Ok(server)
    }

    async fn bind_with_retry(address: &str, first_retry: Duration) -> TcpListener {
        let mut retry = first_retry;
        loop {
            match TcpListener::bind(address).await {
                Ok(listener) => return listener,
                Err(e) => {
                    warn!("Failed to bind {}: {}, retrying in {:?}", address, e, retry);
                    tokio::time::sleep(retry).await;
                    retry = (retry * 2).min(MAX_BIND_RETRY);
                }
            }
        }
    }

    pub fn local_addrs(&self) -> Result<(SocketAddr, SocketAddr)> {
        Ok((
            self.command_listener
                .local_addr()
                .context("Failed to read command listener address")?,
            self.data_listener
                .local_addr()
                .context("Failed to read data listener address")?,
        ))
    }

    /// `notify_one` on this handle stops [`IpcServer::run`].
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown_notify)
    }

    /// Serves clients one after the other until a `shutdown` request or notification.
    pub async fn run(self) -> Result<()> {
        info!("IPC server running");

        loop {
            debug!("Waiting for a command connection");
            let (mut command_stream, command_peer) = tokio::select! {
                accepted = self.command_listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept command connection: {}", e);
                        continue;
                    }
                },
                _ = self.shutdown_notify.notified() => break,
            };

            let (mut data_stream, data_peer) = match self.accept_data(&command_stream).await {
                Pairing::Accepted(Ok(accepted)) => accepted,
                Pairing::Accepted(Err(e)) => {
                    error!("Failed to accept data connection: {}", e);
                    continue;
                }
                Pairing::ClientGone => {
                    info!("Client {} left before opening its data channel", command_peer);
                    continue;
                }
                Pairing::Shutdown => break,
            };
            info!("Client connected: commands {}, data {}", command_peer, data_peer);

            let flow = self.serve_client(&mut command_stream, &mut data_stream).await;

            // Whatever the client left running is stopped before the next one
            let runner = Arc::clone(&self.runner);
            if let Err(e) = tokio::task::spawn_blocking(move || runner.teardown()).await {
                error!("Teardown task failed: {}", e);
            }
            info!("Client session closed");

            if flow == Flow::Shutdown {
                break;
            }
        }

        info!("IPC server stopped");
        Ok(())
    }

    /// Waits for the data connection, giving up if the command connection closes first.
    async fn accept_data(&self, command_stream: &TcpStream) -> Pairing {
        let mut first_byte = [0u8; 1];
        tokio::select! {
            accepted = self.data_listener.accept() => return Pairing::Accepted(accepted),
            peeked = command_stream.peek(&mut first_byte) => match peeked {
                Ok(0) | Err(_) => return Pairing::ClientGone,
                Ok(_) => {}
            },
            _ = self.shutdown_notify.notified() => return Pairing::Shutdown,
        }

        // Early request bytes are left queued for serve_client
        tokio::select! {
            accepted = self.data_listener.accept() => Pairing::Accepted(accepted),
            _ = self.shutdown_notify.notified() => Pairing::Shutdown,
        }
    }

    async fn serve_client(&self, command_stream: &mut TcpStream, data_stream: &mut TcpStream) -> Flow {
        let mut requests = RequestReader::default();

        loop {
            let next = tokio::select! {
                next = requests.next_request(command_stream) => next,
                _ = self.shutdown_notify.notified() => return Flow::Shutdown,
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("Command channel closed by client");
                    return Flow::Quit;
                }
                Err(e) => {
                    warn!("Command channel read error: {}", e);
                    return Flow::Quit;
                }
            };

            let outcome = self.handle_request(line).await;
            if let Some(payload) = &outcome.payload {
                if let Err(e) = write_payload(data_stream, payload).await {
                    warn!("Failed to send payload: {:#}", e);
                    return Flow::Quit;
                }
            }
            if let Err(e) = command_stream.write_all(outcome.ack.as_bytes()).await {
                warn!("Failed to send acknowledgment: {}", e);
                return Flow::Quit;
            }

            if outcome.flow != Flow::Continue {
                return outcome.flow;
            }
        }
    }

    /// Runner calls may block on devices, so they run off the async workers.
    async fn handle_request(&self, line: String) -> Outcome {
        let runner = Arc::clone(&self.runner);
        match tokio::task::spawn_blocking(move || protocol::handle_line(&runner, &line)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Request handler failed: {}", e);
                Outcome::error()
            }
        }
    }
}

/// Cuts the command byte stream into requests, carrying partial lines across reads.
#[derive(Debug, Default)]
pub struct RequestReader {
    pending: Vec<u8>,
}

impl RequestReader {
    /// Next non-empty request, or `None` once the stream is closed.
    pub async fn next_request<R>(&mut self, reader: &mut R) -> io::Result<Option<String>>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(end) = self.pending.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=end).collect();
                if let Some(request) = non_empty(&line) {
                    return Ok(Some(request));
                }
                continue;
            }

            let read = if self.pending.is_empty() {
                Some(reader.read(&mut chunk).await?)
            } else {
                tokio::time::timeout(REQUEST_SETTLE, reader.read(&mut chunk))
                    .await
                    .ok()
                    .transpose()?
            };

            match read {
                Some(0) => return Ok(self.take_pending()),
                Some(n) => self.pending.extend_from_slice(&chunk[..n]),
                // Unterminated request followed by silence
                None => {
                    if let Some(request) = self.take_pending() {
                        return Ok(Some(request));
                    }
                }
            }
        }
    }

    fn take_pending(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        non_empty(&rest)
    }
}

fn non_empty(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Writes one length-prefixed JSON payload.
pub async fn write_payload<W>(writer: &mut W, payload: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(payload).context("Failed to encode payload")?;
    let length = u32::try_from(bytes.len()).context("Payload too large")?;
    writer.write_all(&length.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_payload_framing() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        let payload = json!({"kinematicSeries": {"timeBlocks": [[0.0, 0.01]]}});
        write_payload(&mut writer, &payload).await.unwrap();

        let length = reader.read_u32().await.unwrap() as usize;
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await.unwrap();
        let decoded: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_request_split_across_writes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut requests = RequestReader::default();

        client.write_all(b"12:tri").await.unwrap();
        let reading = tokio::spawn(async move {
            let request = requests.next_request(&mut server).await.unwrap();
            (request, requests, server)
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        client.write_all(b"al.json\n3:\r\n\n").await.unwrap();

        let (request, mut requests, mut server) = reading.await.unwrap();
        assert_eq!(request.as_deref(), Some("12:trial.json"));
        assert_eq!(requests.next_request(&mut server).await.unwrap().as_deref(), Some("3:"));

        drop(client);
        assert!(requests.next_request(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unterminated_request_served_after_silence() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut requests = RequestReader::default();

        client.write_all(b"0:").await.unwrap();
        let request = tokio::time::timeout(Duration::from_secs(2), requests.next_request(&mut server))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.as_deref(), Some("0:"));

        client.write_all(b"13:").await.unwrap();
        drop(client);
        assert_eq!(requests.next_request(&mut server).await.unwrap().as_deref(), Some("13:"));
        assert!(requests.next_request(&mut server).await.unwrap().is_none());
    }

    #[test]
    fn test_bincode_and_json_agree_on_snapshot() {
        let snapshot = crate::session::Session::default().to_snapshot();
        let json = serde_json::to_vec(&snapshot).unwrap();
        let from_json: crate::session::SessionSnapshot = serde_json::from_slice(&json).unwrap();
        let binary = bincode::serialize(&snapshot).unwrap();
        let from_binary: crate::session::SessionSnapshot = bincode::deserialize(&binary).unwrap();
        assert_eq!(from_json, from_binary);
    }
}
