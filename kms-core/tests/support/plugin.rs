//! Fake KMS v2 plugin listening on a Unix socket.
//!
//! "Wraps" DEKs by base64-encoding them, so tests can unwrap a stored DEK
//! without going through the client.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kms_core::plugin::wire::{
    DecryptResult, EncryptResult, PluginRequest, RequestFrame, ResponseFrame, StatusResult,
};
use kms_core::PLUGIN_API_VERSION;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Default)]
struct State {
    failed: AtomicBool,
    encrypts: AtomicUsize,
    decrypts: AtomicUsize,
    statuses: AtomicUsize,
    last_encrypt: Mutex<Vec<u8>>,
    key_id: Mutex<String>,
    version: Mutex<String>,
}

pub struct Base64Plugin {
    path: PathBuf,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl Base64Plugin {
    pub async fn start(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let state = Arc::new(State {
            key_id: Mutex::new("key-1".into()),
            version: Mutex::new(PLUGIN_API_VERSION.into()),
            ..State::default()
        });
        Self::start_with(path.as_ref(), state)
    }

    fn start_with(path: &Path, state: Arc<State>) -> std::io::Result<Self> {
        let listener = UnixListener::bind(path)?;
        let task = tokio::spawn(accept_loop(listener, state.clone()));
        Ok(Self {
            path: path.to_path_buf(),
            state,
            task,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("unix://{}", self.path.display())
    }

    pub fn enter_failed_state(&self) {
        self.state.failed.store(true, Ordering::SeqCst);
    }

    pub fn exit_failed_state(&self) {
        self.state.failed.store(false, Ordering::SeqCst);
    }

    pub fn set_key_id(&self, key_id: &str) {
        *self.state.key_id.lock() = key_id.to_string();
    }

    pub fn set_version(&self, version: &str) {
        *self.state.version.lock() = version.to_string();
    }

    /// Plaintext DEK from the most recent encrypt call.
    pub fn last_encrypt_request(&self) -> Vec<u8> {
        self.state.last_encrypt.lock().clone()
    }

    pub fn encrypt_calls(&self) -> usize {
        self.state.encrypts.load(Ordering::SeqCst)
    }

    pub fn decrypt_calls(&self) -> usize {
        self.state.decrypts.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.state.statuses.load(Ordering::SeqCst)
    }

    /// Unwrap a DEK the way the plugin would.
    pub fn unwrap_dek(&self, wrapped: &[u8]) -> Vec<u8> {
        STANDARD.decode(wrapped).expect("base64 wrapped dek")
    }

    /// Stop serving, drop open connections and remove the socket.
    pub async fn stop(self) -> PluginHandle {
        let Self { path, state, task } = self;
        task.abort();
        let _ = task.await;
        let _ = std::fs::remove_file(&path);
        PluginHandle { path, state }
    }
}

/// A stopped plugin that can be started again with the same state.
pub struct PluginHandle {
    path: PathBuf,
    state: Arc<State>,
}

impl PluginHandle {
    pub fn restart(self) -> std::io::Result<Base64Plugin> {
        Base64Plugin::start_with(&self.path, self.state)
    }
}

async fn accept_loop(listener: UnixListener, state: Arc<State>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(serve(stream, state.clone()));
                }
                Err(_) => break,
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve(stream: UnixStream, state: Arc<State>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let response = match serde_json::from_str::<RequestFrame>(&line) {
            Ok(frame) => handle(&state, frame),
            Err(err) => ResponseFrame::err("", "bad_request", err.to_string()),
        };
        let mut body = serde_json::to_vec(&response).expect("encode response");
        body.push(b'\n');
        if write.write_all(&body).await.is_err() {
            break;
        }
    }
}

fn handle(state: &State, frame: RequestFrame) -> ResponseFrame {
    let uid = frame.uid;
    match frame.request {
        PluginRequest::Status => state.statuses.fetch_add(1, Ordering::SeqCst),
        PluginRequest::Encrypt { .. } => state.encrypts.fetch_add(1, Ordering::SeqCst),
        PluginRequest::Decrypt { .. } => state.decrypts.fetch_add(1, Ordering::SeqCst),
    };
    if state.failed.load(Ordering::SeqCst) {
        return ResponseFrame::err(uid, "unavailable", "plugin is in a failed state");
    }

    let key_id = state.key_id.lock().clone();
    let result = match frame.request {
        PluginRequest::Status => ResponseFrame::ok(
            &uid,
            &StatusResult {
                version: state.version.lock().clone(),
                healthz: "ok".into(),
                key_id,
            },
        ),
        PluginRequest::Encrypt { plaintext } => {
            let ciphertext = STANDARD.encode(&plaintext).into_bytes();
            *state.last_encrypt.lock() = plaintext;
            ResponseFrame::ok(
                &uid,
                &EncryptResult {
                    ciphertext,
                    key_id,
                    annotations: BTreeMap::from([(
                        "mock.kms.example.io".to_string(),
                        b"base64".to_vec(),
                    )]),
                },
            )
        }
        PluginRequest::Decrypt { ciphertext, .. } => match STANDARD.decode(&ciphertext) {
            Ok(plaintext) => ResponseFrame::ok(&uid, &DecryptResult { plaintext }),
            Err(err) => return ResponseFrame::err(uid, "invalid_ciphertext", err.to_string()),
        },
    };
    result.unwrap_or_else(|err| ResponseFrame::err(uid, "internal", err.to_string()))
}
