//! Length-prefixed TCP transport.
//!
//! Connections are one-directional: an agent sends over connections it opened and receives on
//! connections it accepted. Every connection starts with a hello frame naming the sender's listen
//! endpoint and, under certificate security, its certificate. Frames go through a
//! [`LengthDelimitedCodec`] with a little-endian `u32` length prefix.

use crate::{
    config::{SecurityProvider, SecuritySettings},
    endpoint::ListenEndpoint,
    transport::{InboundHandler, Transport},
    Error, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::{
    io::AsyncRead,
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Largest frame accepted from a peer.
pub const FRAME_SIZE_MAX: usize = 1 << 20;

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    endpoint: ListenEndpoint,
    certificate: Option<Vec<u8>>,
}

#[derive(Debug)]
struct Listener {
    task: JoinHandle<()>,
    security: Arc<Mutex<SecuritySettings>>,
}

type Connection = Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>>;

#[derive(Debug, Default)]
pub struct TcpTransport {
    listeners: Mutex<HashMap<ListenEndpoint, Listener>>,
    connections: Mutex<HashMap<(ListenEndpoint, ListenEndpoint), Connection>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn certificate_for(&self, local: &ListenEndpoint) -> Option<Vec<u8>> {
        let listeners = self.listeners.lock();
        let security = listeners.get(local)?.security.lock().clone();
        match security.provider {
            SecurityProvider::None => None,
            SecurityProvider::Certificate { thumbprint } => Some(thumbprint.into_bytes()),
        }
    }

    async fn connect(&self, local: &ListenEndpoint, remote: &ListenEndpoint) -> Result<Connection> {
        let key = (local.clone(), remote.clone());
        if let Some(connection) = self.connections.lock().get(&key) {
            return Ok(connection.clone());
        }
        let stream = TcpStream::connect((remote.address.as_str(), remote.port))
            .await
            .map_err(|e| Error::Transport(format!("connect to {remote} failed: {e}")))?;
        stream.set_nodelay(true)?;
        let (_, writer) = stream.into_split();
        let mut writer = FramedWrite::new(writer, frame_codec());
        let hello = Hello {
            endpoint: local.clone(),
            certificate: self.certificate_for(local),
        };
        let hello = serde_json::to_vec(&hello).map_err(|e| Error::Transport(e.to_string()))?;
        write_frame(&mut writer, Bytes::from(hello)).await?;
        debug!(%local, %remote, "connection established");
        let connection = Arc::new(tokio::sync::Mutex::new(writer));
        Ok(self
            .connections
            .lock()
            .entry(key)
            .or_insert(connection)
            .clone())
    }
}

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .max_frame_length(FRAME_SIZE_MAX)
        .new_codec()
}

async fn write_frame(writer: &mut FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>, frame: Bytes) -> Result<()> {
    writer
        .send(frame)
        .await
        .map_err(|e| Error::Transport(format!("write failed: {e}")))
}

/// Next frame from the peer, `None` once it closes cleanly between frames.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut FramedRead<R, LengthDelimitedCodec>) -> Result<Option<Bytes>> {
    match reader.next().await {
        None => Ok(None),
        Some(Ok(frame)) => Ok(Some(frame.freeze())),
        Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => Err(Error::MalformedMessage(e.to_string())),
        Some(Err(e)) => Err(e.into()),
    }
}

async fn serve_connection(
    local: ListenEndpoint,
    stream: TcpStream,
    handler: Arc<dyn InboundHandler>,
    security: Arc<Mutex<SecuritySettings>>,
) -> Result<()> {
    let (reader, _) = stream.into_split();
    let mut reader = FramedRead::new(reader, frame_codec());
    let Some(hello) = read_frame(&mut reader).await? else {
        return Ok(());
    };
    let hello: Hello =
        serde_json::from_slice(&hello).map_err(|e| Error::MalformedMessage(format!("bad hello: {e}")))?;
    let remote = hello.endpoint;
    if !handler.accept(&local, &remote) {
        return Ok(());
    }
    let requires_certificate = matches!(security.lock().provider, SecurityProvider::Certificate { .. });
    if requires_certificate {
        let Some(certificate) = hello.certificate else {
            warn!(%local, %remote, "peer presented no certificate");
            return Ok(());
        };
        if !handler.verify_certificate(&remote, Bytes::from(certificate)).await {
            warn!(%local, %remote, "peer certificate rejected");
            return Ok(());
        }
    }
    while let Some(frame) = read_frame(&mut reader).await? {
        handler.deliver(&remote, frame);
    }
    debug!(%local, %remote, "inbound connection closed");
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(
        &self,
        local: &ListenEndpoint,
        security: &SecuritySettings,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<()> {
        let listener = TcpListener::bind((local.address.as_str(), local.port))
            .await
            .map_err(|e| Error::Transport(format!("bind {local} failed: {e}")))?;
        info!(%local, "listening for lease traffic");
        let security = Arc::new(Mutex::new(security.clone()));
        let endpoint = local.clone();
        let shared = security.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(local = %endpoint, %error, "accept failed");
                        continue;
                    }
                };
                let local = endpoint.clone();
                let handler = handler.clone();
                let security = shared.clone();
                tokio::spawn(async move {
                    if let Err(error) = serve_connection(local.clone(), stream, handler, security).await {
                        warn!(%local, %peer, %error, "inbound connection failed");
                    }
                });
            }
        });
        if let Some(previous) = self
            .listeners
            .lock()
            .insert(local.clone(), Listener { task, security })
        {
            previous.task.abort();
        }
        Ok(())
    }

    async fn send(&self, local: &ListenEndpoint, remote: &ListenEndpoint, frame: Bytes) -> Result<()> {
        let connection = self.connect(local, remote).await?;
        let result = {
            let mut writer = connection.lock().await;
            write_frame(&mut writer, frame).await
        };
        if let Err(error) = &result {
            debug!(%local, %remote, %error, "send failed, dropping connection");
            self.abort(local, remote);
        }
        result
    }

    fn abort(&self, local: &ListenEndpoint, remote: &ListenEndpoint) {
        self.connections
            .lock()
            .remove(&(local.clone(), remote.clone()));
    }

    fn close(&self, local: &ListenEndpoint) {
        if let Some(listener) = self.listeners.lock().remove(local) {
            listener.task.abort();
        }
        self.connections.lock().retain(|(from, _), _| from != local);
    }

    fn update_security(&self, local: &ListenEndpoint, security: &SecuritySettings) {
        if let Some(listener) = self.listeners.lock().get(local) {
            *listener.security.lock() = security.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(input: Vec<u8>) -> FramedRead<Cursor<Vec<u8>>, LengthDelimitedCodec> {
        FramedRead::new(Cursor::new(input), frame_codec())
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let mut input = reader(((FRAME_SIZE_MAX + 1) as u32).to_le_bytes().to_vec());
        assert!(matches!(read_frame(&mut input).await, Err(Error::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn test_read_frame_eof_is_clean() {
        let mut input = reader(Vec::new());
        assert!(read_frame(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frames_are_little_endian_prefixed() {
        let mut input = 5u32.to_le_bytes().to_vec();
        input.extend_from_slice(b"lease");
        input.extend_from_slice(&0u32.to_le_bytes());
        let mut input = reader(input);
        assert_eq!(&read_frame(&mut input).await.unwrap().unwrap()[..], b"lease");
        assert!(read_frame(&mut input).await.unwrap().unwrap().is_empty());
        assert!(read_frame(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let mut input = 5u32.to_le_bytes().to_vec();
        input.extend_from_slice(b"le");
        assert!(read_frame(&mut reader(input)).await.is_err());
    }

    #[tokio::test]
    async fn test_frames_between_agents() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct Counter(AtomicUsize);

        #[async_trait]
        impl InboundHandler for Counter {
            fn accept(&self, _: &ListenEndpoint, _: &ListenEndpoint) -> bool {
                true
            }
            fn deliver(&self, _: &ListenEndpoint, frame: Bytes) {
                assert_eq!(&frame[..], b"lease");
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            async fn verify_certificate(&self, _: &ListenEndpoint, _: Bytes) -> bool {
                true
            }
        }

        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let transport = TcpTransport::new();
        let server = ListenEndpoint::new("127.0.0.1", port);
        let client = ListenEndpoint::new("127.0.0.1", 1);
        let counter = Arc::new(Counter::default());
        transport
            .listen(&server, &SecuritySettings::default(), counter.clone())
            .await
            .unwrap();
        transport
            .send(&client, &server, Bytes::from_static(b"lease"))
            .await
            .unwrap();
        transport
            .send(&client, &server, Bytes::from_static(b"lease"))
            .await
            .unwrap();
        for _ in 0..100 {
            if counter.0.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        transport.close(&server);
    }
}
