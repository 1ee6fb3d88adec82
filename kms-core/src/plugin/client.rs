use super::wire::{
    DecryptResult, EncryptResult, PluginRequest, RequestFrame, ResponseFrame, StatusResult,
    MAX_FRAME_LEN,
};
use super::{
    new_uid, DecryptRequest, EncryptResponse, KmsService, StatusResponse, PLUGIN_API_VERSION,
};
use crate::config::{ProviderConfig, RetryPolicy, SocketAddress};
use crate::errors::{Error, Result};
use crate::retry::retry_async;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

/// Persistent connection to one plugin socket.
///
/// Calls are serialized through a FIFO mutex, so concurrent callers are
/// served in arrival order. A call that fails or is cancelled mid-flight
/// discards the connection; the next call reconnects under the retry policy
/// and repeats the version handshake.
pub struct PluginClient {
    provider: String,
    address: SocketAddress,
    retry: RetryPolicy,
    connect_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

enum ConnectError {
    Transient(String),
    Incompatible(String),
}

impl ConnectError {
    fn into_error(self, provider: &str) -> Error {
        match self {
            Self::Transient(msg) => Error::unavailable(format!("{provider}: {msg}")),
            Self::Incompatible(version) => Error::unavailable(format!(
                "{provider}: plugin reports api version `{version}`, expected `{PLUGIN_API_VERSION}`"
            )),
        }
    }
}

impl PluginClient {
    /// Builds a client; no connection is opened until the first call.
    pub fn new(config: &ProviderConfig, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            provider: config.name.clone(),
            address: config.socket_address()?,
            retry,
            connect_timeout: config.timeout,
            conn: Mutex::new(None),
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    async fn call<T: DeserializeOwned>(&self, uid: &str, request: PluginRequest) -> Result<T> {
        let method = request.method();
        let span = info_span!("kms.call", provider = %self.provider, method, uid);
        async move {
            let frame = RequestFrame {
                uid: uid.to_string(),
                request,
            };

            let mut guard = self.conn.lock().await;
            let mut conn = match guard.take() {
                Some(conn) => conn,
                None => self.connect().await?,
            };
            let response = match conn.round_trip(&frame).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, "plugin call failed; dropping connection");
                    return Err(Error::unavailable(format!("{}: {err}", self.provider)));
                }
            };
            if response.uid != frame.uid {
                warn!(got = %response.uid, "plugin answered with a foreign uid; dropping connection");
                return Err(Error::unavailable(format!(
                    "{}: response uid mismatch",
                    self.provider
                )));
            }
            *guard = Some(conn);
            drop(guard);

            decode_response(&self.provider, method, response)
        }
        .instrument(span)
        .await
    }

    async fn connect(&self) -> Result<Connection> {
        retry_async(
            &self.retry,
            |attempt| self.connect_once(attempt),
            |err| matches!(err, ConnectError::Transient(_)),
        )
        .await
        .map_err(|err| err.into_error(&self.provider))
    }

    async fn connect_once(&self, attempt: usize) -> std::result::Result<Connection, ConnectError> {
        let stream = match tokio::time::timeout(self.connect_timeout, open_stream(&self.address))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(attempt, error = %err, address = %self.address, "plugin connect failed");
                return Err(ConnectError::Transient(format!(
                    "connect {}: {err}",
                    self.address
                )));
            }
            Err(_) => return Err(ConnectError::Transient("connect timed out".into())),
        };

        let mut conn = Connection::new(stream);
        let frame = RequestFrame {
            uid: new_uid(),
            request: PluginRequest::Status,
        };
        let response = match tokio::time::timeout(self.connect_timeout, conn.round_trip(&frame)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(ConnectError::Transient(format!("handshake: {err}"))),
            Err(_) => return Err(ConnectError::Transient("handshake timed out".into())),
        };
        let status: StatusResult = decode_response(&self.provider, "status", response)
            .map_err(|err| ConnectError::Transient(format!("handshake: {err}")))?;
        if status.version != PLUGIN_API_VERSION {
            warn!(version = %status.version, "incompatible kms plugin");
            return Err(ConnectError::Incompatible(status.version));
        }

        info!(
            address = %self.address,
            key_id = %status.key_id,
            attempt,
            "connected to kms plugin"
        );
        Ok(conn)
    }
}

async fn open_stream(address: &SocketAddress) -> io::Result<UnixStream> {
    match address {
        SocketAddress::Path(path) => UnixStream::connect(path).await,
        SocketAddress::Abstract(name) => {
            let name = name.clone();
            let stream = tokio::task::spawn_blocking(move || connect_abstract(&name))
                .await
                .map_err(io::Error::other)??;
            stream.set_nonblocking(true)?;
            UnixStream::from_std(stream)
        }
    }
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> io::Result<std::os::unix::net::UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixStream as StdUnixStream};

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    StdUnixStream::connect_addr(&addr)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(name: &str) -> io::Result<std::os::unix::net::UnixStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("abstract socket @{name} requires linux"),
    ))
}

fn decode_response<T: DeserializeOwned>(
    provider: &str,
    method: &str,
    response: ResponseFrame,
) -> Result<T> {
    if let Some(error) = response.error {
        return Err(Error::unavailable(format!(
            "{provider}: {method} rejected ({}): {}",
            error.code, error.message
        )));
    }
    let result = response.result.ok_or_else(|| {
        Error::unavailable(format!("{provider}: {method} response carries no result"))
    })?;
    serde_json::from_value(result).map_err(|err| {
        Error::unavailable(format!("{provider}: invalid {method} response: {err}"))
    })
}

struct Connection {
    stream: BufReader<UnixStream>,
}

impl Connection {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    async fn round_trip(&mut self, frame: &RequestFrame) -> io::Result<ResponseFrame> {
        let mut body = serde_json::to_vec(frame)?;
        body.push(b'\n');
        let writer = self.stream.get_mut();
        writer.write_all(&body).await?;
        writer.flush().await?;

        let mut line = Vec::new();
        let read = (&mut self.stream)
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "plugin closed the connection",
            ));
        }
        if line.last() != Some(&b'\n') {
            let reason = if line.len() > MAX_FRAME_LEN {
                "response frame exceeds size limit"
            } else {
                "truncated response frame"
            };
            return Err(io::Error::new(io::ErrorKind::InvalidData, reason));
        }
        Ok(serde_json::from_slice(&line)?)
    }
}

#[async_trait]
impl KmsService for PluginClient {
    async fn encrypt(&self, uid: &str, plaintext: &[u8]) -> Result<EncryptResponse> {
        let result: EncryptResult = self
            .call(
                uid,
                PluginRequest::Encrypt {
                    plaintext: plaintext.to_vec(),
                },
            )
            .await?;
        Ok(EncryptResponse {
            ciphertext: result.ciphertext,
            key_id: result.key_id,
            annotations: result.annotations,
        })
    }

    async fn decrypt(&self, uid: &str, request: &DecryptRequest) -> Result<Vec<u8>> {
        let result: DecryptResult = self
            .call(
                uid,
                PluginRequest::Decrypt {
                    ciphertext: request.ciphertext.clone(),
                    key_id: request.key_id.clone(),
                    annotations: request.annotations.clone(),
                },
            )
            .await?;
        Ok(result.plaintext)
    }

    async fn status(&self, uid: &str) -> Result<StatusResponse> {
        let result: StatusResult = self.call(uid, PluginRequest::Status).await?;
        Ok(StatusResponse {
            version: result.version,
            healthz: result.healthz,
            key_id: result.key_id,
        })
    }
}
