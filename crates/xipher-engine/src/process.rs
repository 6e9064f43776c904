//! Engine hosted in a child process.
//!
//! Protocol (one JSON object per line in each direction):
//! ```text
//! → {"op":"open_encrypter","key":"XPK_…","compress":true}
//! ← {"result":7}
//! → {"op":"feed_encrypter","id":7,"data":"<base64>"}
//! ← {"result":"<base64>"}
//! ← {"error":"bad key"}
//! ```
//! Byte payloads travel base64-encoded. A reply with neither field counts as an
//! empty result. Transport failures surface as engine errors; there is no
//! retry and no timeout.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::reply::{EngineReply, RawEngine, TransformerId};

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    NewSecretKey,
    PublicKey { key: &'a str, quantum_safe: bool },
    EncryptText { key: &'a str, text: &'a str, compress: bool },
    DecryptText { key: &'a str, ciphertext: &'a str },
    OpenEncrypter { key: &'a str, compress: bool },
    FeedEncrypter { id: u64, data: String },
    CloseEncrypter { id: u64 },
    OpenDecrypter { key: &'a str },
    FeedDecrypter { id: u64, data: String },
    CloseDecrypter { id: u64 },
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: Option<T>,
    error: Option<String>,
}

/// Decode one reply line. `error` wins over `result`; neither is `T::default()`.
fn decode_reply<T: DeserializeOwned + Default>(line: &str) -> EngineReply<T> {
    match serde_json::from_str::<Envelope<T>>(line) {
        Ok(Envelope {
            error: Some(message),
            ..
        }) => EngineReply::Err(message),
        Ok(Envelope { result, .. }) => EngineReply::Ok(result.unwrap_or_default()),
        Err(e) => EngineReply::Err(format!("malformed engine reply: {e}")),
    }
}

fn decode_bytes(reply: EngineReply<String>) -> EngineReply<Vec<u8>> {
    match reply {
        EngineReply::Ok(encoded) => BASE64
            .decode(encoded)
            .map_err(|e| format!("malformed engine payload: {e}"))
            .into(),
        EngineReply::Err(message) => EngineReply::Err(message),
    }
}

fn send_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes())?;
    stdin.flush()
}

struct Pipe {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// [`RawEngine`] backed by an external executable.
///
/// Calls are serialized over a single pipe; the engine is expected to answer
/// every request with exactly one line.
pub struct ProcessEngine {
    pipe: Mutex<Pipe>,
}

impl ProcessEngine {
    pub fn spawn(command: &Path, args: &[String]) -> std::io::Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("engine stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("engine stdout unavailable"))?;
        tracing::debug!(command = %command.display(), pid = child.id(), "engine process started");
        Ok(Self {
            pipe: Mutex::new(Pipe {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            }),
        })
    }

    fn pipe(&self) -> MutexGuard<'_, Pipe> {
        self.pipe.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call<T: DeserializeOwned + Default>(&self, request: &Request<'_>) -> EngineReply<T> {
        let mut line = match serde_json::to_string(request) {
            Ok(line) => line,
            Err(e) => return EngineReply::Err(format!("encoding engine request: {e}")),
        };
        line.push('\n');

        let mut pipe = self.pipe();
        let sent = send_line(&mut pipe.stdin, &line);
        line.zeroize();
        if let Err(e) = sent {
            return EngineReply::Err(format!("engine process: {e}"));
        }

        let mut reply = String::new();
        match pipe.stdout.read_line(&mut reply) {
            Ok(0) => EngineReply::Err("engine process exited".to_string()),
            Ok(_) => {
                let decoded = decode_reply(&reply);
                reply.zeroize();
                decoded
            }
            Err(e) => EngineReply::Err(format!("engine process: {e}")),
        }
    }

    fn call_id(&self, request: &Request<'_>) -> EngineReply<TransformerId> {
        match self.call::<u64>(request) {
            EngineReply::Ok(id) => EngineReply::Ok(TransformerId(id)),
            EngineReply::Err(message) => EngineReply::Err(message),
        }
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        let pipe = self.pipe.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = pipe.child.kill() {
            tracing::debug!("engine process already gone: {e}");
        }
        if let Err(e) = pipe.child.wait() {
            tracing::debug!("could not reap engine process: {e}");
        }
    }
}

impl RawEngine for ProcessEngine {
    fn new_secret_key(&self) -> EngineReply<String> {
        self.call(&Request::NewSecretKey)
    }

    fn public_key(&self, secret_or_password: &str, quantum_safe: bool) -> EngineReply<String> {
        self.call(&Request::PublicKey {
            key: secret_or_password,
            quantum_safe,
        })
    }

    fn encrypt_text(&self, key: &str, plaintext: &str, compress: bool) -> EngineReply<String> {
        self.call(&Request::EncryptText {
            key,
            text: plaintext,
            compress,
        })
    }

    fn decrypt_text(&self, key: &str, ciphertext: &str) -> EngineReply<String> {
        self.call(&Request::DecryptText { key, ciphertext })
    }

    fn open_encrypter(&self, key: &str, compress: bool) -> EngineReply<TransformerId> {
        self.call_id(&Request::OpenEncrypter { key, compress })
    }

    fn feed_encrypter(&self, id: TransformerId, chunk: &[u8]) -> EngineReply<Vec<u8>> {
        decode_bytes(self.call(&Request::FeedEncrypter {
            id: id.0,
            data: BASE64.encode(chunk),
        }))
    }

    fn close_encrypter(&self, id: TransformerId) -> EngineReply<Vec<u8>> {
        decode_bytes(self.call(&Request::CloseEncrypter { id: id.0 }))
    }

    fn open_decrypter(&self, key: &str) -> EngineReply<TransformerId> {
        self.call_id(&Request::OpenDecrypter { key })
    }

    fn feed_decrypter(&self, id: TransformerId, chunk: &[u8]) -> EngineReply<Vec<u8>> {
        decode_bytes(self.call(&Request::FeedDecrypter {
            id: id.0,
            data: BASE64.encode(chunk),
        }))
    }

    fn close_decrypter(&self, id: TransformerId) -> EngineReply<Vec<u8>> {
        decode_bytes(self.call(&Request::CloseDecrypter { id: id.0 }))
    }
}
