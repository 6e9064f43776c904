//! Deterministic in-process engine for tests.
//!
//! Not a cipher. Payload bytes are XORed with a BLAKE3 keystream of the key
//! material. Streams carry a 5-byte header (`0xA0 | compress`, 4-byte key tag)
//! so a wrong key is detected. Transformers only emit whole 16-byte blocks and
//! keep the remainder until `close`, which makes flush residuals observable.
//!
//! A secret key `XSK_x` and its public key `XPK_x` share key material `x`.
//! A password's public key is `XPK_` plus a digest of the password, and a
//! quantum-safe public key carries a `PQ.` tag in front of the material.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use xipher_core::types::{CIPHERTEXT_PREFIX, PUBLIC_KEY_PREFIX, SECRET_KEY_PREFIX};
use xipher_core::Mode;

use crate::reply::{EngineReply, RawEngine, TransformerId};

/// Transformer output granularity.
pub const MOCK_BLOCK: usize = 16;

const HEADER_MAGIC: u8 = 0xA0;
const HEADER_LEN: usize = 5;
const QUANTUM_TAG: &str = "PQ.";

#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
    fail_open: Option<String>,
    fail_feed_at: Option<usize>,
    empty: bool,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    next_key: u64,
    feeds: usize,
    transformers: HashMap<u64, MockTransformer>,
}

struct MockTransformer {
    mode: Mode,
    material: String,
    keystream: blake3::OutputReader,
    header: Vec<u8>,
    header_done: bool,
    pending: Vec<u8>,
}

/// The part of a public key that encryption to it depends on.
fn key_body(key: &str) -> String {
    if let Some(rest) = key.strip_prefix(SECRET_KEY_PREFIX) {
        rest.to_string()
    } else if let Some(rest) = key.strip_prefix(PUBLIC_KEY_PREFIX) {
        rest.strip_prefix(QUANTUM_TAG).unwrap_or(rest).to_string()
    } else {
        format!("PW{}", &blake3::hash(key.as_bytes()).to_hex()[..16])
    }
}

fn material(key: &str) -> String {
    format!("key:{}", key_body(key))
}

fn keystream(material: &str) -> blake3::OutputReader {
    let mut hasher = blake3::Hasher::new_derive_key("xipher mock engine keystream");
    hasher.update(material.as_bytes());
    hasher.finalize_xof()
}

fn key_tag(material: &str) -> [u8; 4] {
    let hash = blake3::hash(material.as_bytes());
    let mut tag = [0u8; 4];
    tag.copy_from_slice(&hash.as_bytes()[..4]);
    tag
}

fn header(material: &str, compress: bool) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.push(HEADER_MAGIC | u8::from(compress));
    header.extend_from_slice(&key_tag(material));
    header
}

fn check_header(material: &str, header: &[u8]) -> Result<(), String> {
    if header[0] & 0xF0 != HEADER_MAGIC {
        return Err("invalid xipher stream header".to_string());
    }
    if header[1..HEADER_LEN] != key_tag(material) {
        return Err("decryption failed: wrong key or password".to_string());
    }
    Ok(())
}

fn xor(keystream: &mut blake3::OutputReader, data: &mut [u8]) {
    let mut pad = vec![0u8; data.len()];
    keystream.fill(&mut pad);
    for (byte, k) in data.iter_mut().zip(pad) {
        *byte ^= k;
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `open_*` call fails with `message`.
    pub fn fail_open(mut self, message: &str) -> Self {
        self.fail_open = Some(message.to_string());
        self
    }

    /// The `n`-th feed call (zero-based, counted across all transformers) fails.
    pub fn fail_feed_at(mut self, n: usize) -> Self {
        self.fail_feed_at = Some(n);
        self
    }

    /// Every call answers `Ok` with an empty value.
    pub fn empty_replies(mut self) -> Self {
        self.empty = true;
        self
    }

    /// Transformers opened and not yet closed.
    pub fn open_transformers(&self) -> usize {
        self.state().transformers.len()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, mode: Mode, key: &str, compress: bool) -> EngineReply<TransformerId> {
        if self.empty {
            return EngineReply::Ok(TransformerId::default());
        }
        if let Some(message) = &self.fail_open {
            return EngineReply::Err(message.clone());
        }
        if key.is_empty() {
            return EngineReply::Err("key or password must not be empty".to_string());
        }
        let material = material(key);
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        state.transformers.insert(
            id,
            MockTransformer {
                mode,
                keystream: keystream(&material),
                header: match mode {
                    Mode::Encrypt => header(&material, compress),
                    Mode::Decrypt => Vec::new(),
                },
                material,
                header_done: false,
                pending: Vec::new(),
            },
        );
        EngineReply::Ok(TransformerId(id))
    }

    fn feed(&self, mode: Mode, id: TransformerId, chunk: &[u8]) -> EngineReply<Vec<u8>> {
        if self.empty {
            return EngineReply::Ok(Vec::new());
        }
        let mut state = self.state();
        let feed_no = state.feeds;
        state.feeds += 1;
        if self.fail_feed_at == Some(feed_no) {
            return EngineReply::Err("injected feed failure".to_string());
        }
        let Some(t) = state.transformers.get_mut(&id.0) else {
            return EngineReply::Err(format!("unknown {id}"));
        };
        if t.mode != mode {
            return EngineReply::Err(format!("{id} is not a {mode} transformer"));
        }
        t.pending.extend_from_slice(chunk);

        let mut out = Vec::new();
        match mode {
            Mode::Encrypt => {
                let whole = t.pending.len() - t.pending.len() % MOCK_BLOCK;
                if whole == 0 {
                    return EngineReply::Ok(out);
                }
                if !t.header_done {
                    out.extend_from_slice(&t.header);
                    t.header_done = true;
                }
                let mut block: Vec<u8> = t.pending.drain(..whole).collect();
                xor(&mut t.keystream, &mut block);
                out.extend(block);
            }
            Mode::Decrypt => {
                if !t.header_done {
                    if t.pending.len() < HEADER_LEN {
                        return EngineReply::Ok(out);
                    }
                    let header: Vec<u8> = t.pending.drain(..HEADER_LEN).collect();
                    if let Err(message) = check_header(&t.material, &header) {
                        return EngineReply::Err(message);
                    }
                    t.header = header;
                    t.header_done = true;
                }
                let whole = t.pending.len() - t.pending.len() % MOCK_BLOCK;
                let mut block: Vec<u8> = t.pending.drain(..whole).collect();
                xor(&mut t.keystream, &mut block);
                out.extend(block);
            }
        }
        EngineReply::Ok(out)
    }

    fn close(&self, mode: Mode, id: TransformerId) -> EngineReply<Vec<u8>> {
        if self.empty {
            return EngineReply::Ok(Vec::new());
        }
        let Some(mut t) = self.state().transformers.remove(&id.0) else {
            return EngineReply::Err(format!("unknown {id}"));
        };
        if t.mode != mode {
            return EngineReply::Err(format!("{id} is not a {mode} transformer"));
        }
        let mut out = Vec::new();
        match mode {
            Mode::Encrypt => {
                if !t.header_done {
                    out.extend_from_slice(&t.header);
                }
            }
            Mode::Decrypt => {
                if !t.header_done {
                    return EngineReply::Err("truncated xipher stream".to_string());
                }
            }
        }
        let mut rest = std::mem::take(&mut t.pending);
        xor(&mut t.keystream, &mut rest);
        out.extend(rest);
        EngineReply::Ok(out)
    }
}

impl RawEngine for MockEngine {
    fn new_secret_key(&self) -> EngineReply<String> {
        if self.empty {
            return EngineReply::Ok(String::new());
        }
        let mut state = self.state();
        state.next_key += 1;
        EngineReply::Ok(format!("{SECRET_KEY_PREFIX}MOCK{:04}", state.next_key))
    }

    fn public_key(&self, secret_or_password: &str, quantum_safe: bool) -> EngineReply<String> {
        if self.empty {
            return EngineReply::Ok(String::new());
        }
        if secret_or_password.is_empty() || secret_or_password == SECRET_KEY_PREFIX {
            return EngineReply::Err("invalid secret key or password".to_string());
        }
        if secret_or_password.starts_with(PUBLIC_KEY_PREFIX) {
            return EngineReply::Err("a public key has no public key".to_string());
        }
        let tag = if quantum_safe { QUANTUM_TAG } else { "" };
        EngineReply::Ok(format!(
            "{PUBLIC_KEY_PREFIX}{tag}{}",
            key_body(secret_or_password)
        ))
    }

    fn encrypt_text(&self, key: &str, plaintext: &str, compress: bool) -> EngineReply<String> {
        if self.empty {
            return EngineReply::Ok(String::new());
        }
        let material = material(key);
        let mut body = plaintext.as_bytes().to_vec();
        xor(&mut keystream(&material), &mut body);
        let mut blob = header(&material, compress);
        blob.extend(body);
        EngineReply::Ok(format!("{CIPHERTEXT_PREFIX}{}", BASE64.encode(blob)))
    }

    fn decrypt_text(&self, key: &str, ciphertext: &str) -> EngineReply<String> {
        if self.empty {
            return EngineReply::Ok(String::new());
        }
        let Some(encoded) = ciphertext.strip_prefix(CIPHERTEXT_PREFIX) else {
            return EngineReply::Err("invalid ciphertext".to_string());
        };
        let blob = match BASE64.decode(encoded) {
            Ok(blob) if blob.len() >= HEADER_LEN => blob,
            _ => return EngineReply::Err("invalid ciphertext".to_string()),
        };
        let material = material(key);
        if let Err(message) = check_header(&material, &blob[..HEADER_LEN]) {
            return EngineReply::Err(message);
        }
        let mut body = blob[HEADER_LEN..].to_vec();
        xor(&mut keystream(&material), &mut body);
        String::from_utf8(body)
            .map_err(|_| "decrypted text is not UTF-8".to_string())
            .into()
    }

    fn open_encrypter(&self, key: &str, compress: bool) -> EngineReply<TransformerId> {
        self.open(Mode::Encrypt, key, compress)
    }

    fn feed_encrypter(&self, id: TransformerId, chunk: &[u8]) -> EngineReply<Vec<u8>> {
        self.feed(Mode::Encrypt, id, chunk)
    }

    fn close_encrypter(&self, id: TransformerId) -> EngineReply<Vec<u8>> {
        self.close(Mode::Encrypt, id)
    }

    fn open_decrypter(&self, key: &str) -> EngineReply<TransformerId> {
        self.open(Mode::Decrypt, key, false)
    }

    fn feed_decrypter(&self, id: TransformerId, chunk: &[u8]) -> EngineReply<Vec<u8>> {
        self.feed(Mode::Decrypt, id, chunk)
    }

    fn close_decrypter(&self, id: TransformerId) -> EngineReply<Vec<u8>> {
        self.close(Mode::Decrypt, id)
    }
}
