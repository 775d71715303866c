// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Symmetric encryption/decryption through a stream.
//!
//! Supports all four permutations of (encrypt, decrypt) and (read, write),
//! one per instance. With an embedded IV the initialization vector is
//! generated randomly and prepended to the ciphertext on encrypt, and
//! extracted from the front of the ciphertext on decrypt.

use std::sync::Mutex;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes256};
use rand::RngCore;

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};

use super::filter::{FilterBase, FilterStream};
use super::{CloseType, StreamHandle};

const BLOCK: usize = 16;
const CHUNK: usize = 16 * 1024;

/// Supported ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoCipher {
    Aes128Cbc,
    Aes256Cbc,
}

impl CryptoCipher {
    fn key_len(self) -> usize {
        match self {
            CryptoCipher::Aes128Cbc => 16,
            CryptoCipher::Aes256Cbc => 32,
        }
    }
}

/// Which side of the parent this instance drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoDirection {
    /// Pick from the parent's capabilities; exactly one of read/write must
    /// be supported.
    Infer,
    Read,
    Write,
}

/// What to do to the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoOperation {
    /// Encrypt on write, decrypt on read.
    Auto,
    Decrypt,
    Encrypt,
}

enum CbcCtx {
    Encrypt128(cbc::Encryptor<Aes128>),
    Encrypt256(cbc::Encryptor<Aes256>),
    Decrypt128(cbc::Decryptor<Aes128>),
    Decrypt256(cbc::Decryptor<Aes256>),
}

impl CbcCtx {
    fn new(cipher: CryptoCipher, encrypt: bool, key: &[u8], iv: &[u8]) -> StreamResult<CbcCtx> {
        let invalid = |_| StreamError::Unsupported("invalid key or iv length");
        Ok(match (cipher, encrypt) {
            (CryptoCipher::Aes128Cbc, true) => {
                CbcCtx::Encrypt128(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CryptoCipher::Aes256Cbc, true) => {
                CbcCtx::Encrypt256(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CryptoCipher::Aes128Cbc, false) => {
                CbcCtx::Decrypt128(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CryptoCipher::Aes256Cbc, false) => {
                CbcCtx::Decrypt256(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
        })
    }

    fn process(&mut self, block: &mut [u8]) {
        debug_assert_eq!(BLOCK, block.len());
        let block = GenericArray::from_mut_slice(block);
        match self {
            CbcCtx::Encrypt128(ctx) => ctx.encrypt_block_mut(block),
            CbcCtx::Encrypt256(ctx) => ctx.encrypt_block_mut(block),
            CbcCtx::Decrypt128(ctx) => ctx.decrypt_block_mut(block),
            CbcCtx::Decrypt256(ctx) => ctx.decrypt_block_mut(block),
        }
    }
}

struct Engine {
    cipher: CryptoCipher,
    encrypt: bool,
    key: Vec<u8>,
    explicit_iv: Option<Vec<u8>>,
    ctx: Option<CbcCtx>,
    iv_partial: Vec<u8>,
    staged: Vec<u8>,
    finished: bool,
}

impl Engine {
    fn ensure_ctx(&mut self, out: &mut Vec<u8>) -> StreamResult<()> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let iv = match &self.explicit_iv {
            Some(iv) => iv.clone(),
            None => {
                // Embedded-IV encrypt: generate and emit it first.
                debug_assert!(self.encrypt);
                let mut iv = vec![0u8; BLOCK];
                rand::thread_rng().fill_bytes(&mut iv);
                out.extend_from_slice(&iv);
                iv
            }
        };
        self.ctx = Some(CbcCtx::new(self.cipher, self.encrypt, &self.key, &iv)?);
        Ok(())
    }

    fn feed(&mut self, mut data: &[u8]) -> StreamResult<Vec<u8>> {
        debug_assert!(!self.finished);
        let mut out = Vec::new();
        if !self.encrypt && self.explicit_iv.is_none() && self.ctx.is_none() {
            // Embedded-IV decrypt: the front of the ciphertext is the IV.
            let need = BLOCK - self.iv_partial.len();
            let take = need.min(data.len());
            self.iv_partial.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.iv_partial.len() == BLOCK {
                let iv = std::mem::take(&mut self.iv_partial);
                self.ctx = Some(CbcCtx::new(self.cipher, false, &self.key, &iv)?);
            } else {
                return Ok(out);
            }
        }
        if data.is_empty() {
            return Ok(out);
        }
        self.ensure_ctx(&mut out)?;
        self.staged.extend_from_slice(data);
        // Decrypt holds the last block back until more data or EOF proves
        // it is not the padding block.
        let holdback = if self.encrypt { 0 } else { BLOCK };
        let ctx = self.ctx.as_mut().expect("ctx ensured");
        while self.staged.len() >= BLOCK + holdback {
            let mut block: Vec<u8> = self.staged.drain(..BLOCK).collect();
            ctx.process(&mut block);
            out.extend_from_slice(&block);
        }
        Ok(out)
    }

    fn finish(&mut self) -> StreamResult<Vec<u8>> {
        debug_assert!(!self.finished);
        self.finished = true;
        let mut out = Vec::new();
        if self.encrypt {
            self.ensure_ctx(&mut out)?;
            let pad = BLOCK - self.staged.len() % BLOCK;
            let mut tail = std::mem::take(&mut self.staged);
            tail.extend(std::iter::repeat(pad as u8).take(pad));
            let ctx = self.ctx.as_mut().expect("ctx ensured");
            for block in tail.chunks_mut(BLOCK) {
                ctx.process(block);
                out.extend_from_slice(block);
            }
            return Ok(out);
        }
        if self.ctx.is_none() && self.staged.is_empty() && self.iv_partial.is_empty() {
            return Ok(out);
        }
        if self.staged.len() != BLOCK {
            return Err(StreamError::Corrupted);
        }
        let mut block = std::mem::take(&mut self.staged);
        self.ctx
            .as_mut()
            .ok_or(StreamError::Corrupted)?
            .process(&mut block);
        let pad = *block.last().expect("block is non-empty") as usize;
        if pad == 0 || pad > BLOCK || block[BLOCK - pad..].iter().any(|&b| b as usize != pad) {
            return Err(StreamError::Corrupted);
        }
        block.truncate(BLOCK - pad);
        out.extend_from_slice(&block);
        Ok(out)
    }
}

struct CryptoState {
    engine: Engine,
    pending: Buffer,
    eof: bool,
}

pub struct CryptoStream {
    base: FilterBase,
    direction: CryptoDirection,
    state: Mutex<CryptoState>,
}

impl CryptoStream {
    /// `iv` of `None` selects the embedded random IV mode.
    pub fn new(
        parent: StreamHandle,
        own: bool,
        cipher: CryptoCipher,
        key: &[u8],
        iv: Option<&[u8]>,
        direction: CryptoDirection,
        operation: CryptoOperation,
    ) -> StreamResult<Self> {
        if key.len() != cipher.key_len() {
            return Err(StreamError::Unsupported("invalid key or iv length"));
        }
        let direction = match direction {
            CryptoDirection::Infer => {
                if parent.supports_read() && !parent.supports_write() {
                    CryptoDirection::Read
                } else if parent.supports_write() && !parent.supports_read() {
                    CryptoDirection::Write
                } else {
                    return Err(StreamError::Unsupported(
                        "cannot infer direction from a full-duplex parent",
                    ));
                }
            }
            resolved => resolved,
        };
        let encrypt = match operation {
            CryptoOperation::Encrypt => true,
            CryptoOperation::Decrypt => false,
            CryptoOperation::Auto => direction == CryptoDirection::Write,
        };
        Ok(CryptoStream {
            base: FilterBase::new(parent, own),
            direction,
            state: Mutex::new(CryptoState {
                engine: Engine {
                    cipher,
                    encrypt,
                    key: key.to_vec(),
                    explicit_iv: iv.map(<[u8]>::to_vec),
                    ctx: None,
                    iv_partial: Vec::new(),
                    staged: Vec::new(),
                    finished: false,
                },
                pending: Buffer::new(),
                eof: false,
            }),
        })
    }
}

impl FilterStream for CryptoStream {
    fn parent(&self) -> StreamHandle {
        self.base.parent()
    }

    fn owns_parent(&self) -> bool {
        self.base.owns_parent()
    }

    fn mutates(&self) -> bool {
        true
    }

    fn supports_read(&self) -> bool {
        self.direction == CryptoDirection::Read
    }

    fn supports_write(&self) -> bool {
        self.direction == CryptoDirection::Write
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        if self.direction != CryptoDirection::Read {
            return Err(StreamError::Unsupported("read"));
        }
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.pending.is_empty() {
                let take = state.pending.read_available().min(len);
                buffer.copy_in_from(&state.pending, take);
                state.pending.consume(take);
                return Ok(take);
            }
            if state.eof {
                return Ok(0);
            }
            let mut raw = Buffer::new();
            let read = self.parent().read(&mut raw, CHUNK)?;
            if read == 0 {
                let out = state.engine.finish()?;
                state.eof = true;
                state.pending.copy_in(&out);
                continue;
            }
            let flat = raw.to_vec();
            let out = state.engine.feed(&flat)?;
            state.pending.copy_in(&out);
        }
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        if self.direction != CryptoDirection::Write {
            return Err(StreamError::Unsupported("write"));
        }
        let mut window = Buffer::new();
        window.copy_in_from(buffer, len);
        let flat = window.to_vec();
        let out = {
            let mut state = self.state.lock().unwrap();
            state.engine.feed(&flat)?
        };
        if !out.is_empty() {
            super::write_all(&*self.parent(), &out)?;
        }
        Ok(len)
    }

    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        if self.direction == CryptoDirection::Write && close_type.closes_write() {
            let out = {
                let mut state = self.state.lock().unwrap();
                if state.engine.finished {
                    Vec::new()
                } else {
                    state.engine.finish()?
                }
            };
            if !out.is_empty() {
                super::write_all(&*self.parent(), &out)?;
            }
        }
        if self.owns_parent() {
            self.parent().close(close_type)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::memory::MemoryStream;
    use crate::streams::{transfer_all, write_all, Stream};
    use std::sync::Arc;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn encrypt(payload: &[u8], iv: Option<&[u8]>) -> Vec<u8> {
        let sink = Arc::new(MemoryStream::new());
        let stream = CryptoStream::new(
            sink.clone(),
            false,
            CryptoCipher::Aes256Cbc,
            KEY,
            iv,
            CryptoDirection::Write,
            CryptoOperation::Auto,
        )
        .unwrap();
        write_all(&stream, payload).unwrap();
        Stream::close(&stream, CloseType::Both).unwrap();
        sink.to_vec()
    }

    fn decrypt(ciphertext: &[u8], iv: Option<&[u8]>) -> Vec<u8> {
        let source = Arc::new(MemoryStream::from(ciphertext));
        let stream = CryptoStream::new(
            source,
            false,
            CryptoCipher::Aes256Cbc,
            KEY,
            iv,
            CryptoDirection::Read,
            CryptoOperation::Auto,
        )
        .unwrap();
        let out = MemoryStream::new();
        transfer_all(&stream, &out).unwrap();
        out.to_vec()
    }

    #[test]
    fn explicit_iv_round_trips() {
        let iv = [7u8; 16];
        let ciphertext = encrypt(b"attack at dawn", Some(&iv));
        assert_eq!(decrypt(&ciphertext, Some(&iv)), b"attack at dawn");
    }

    #[test]
    fn embedded_iv_round_trips() {
        let ciphertext = encrypt(b"a longer message spanning multiple aes blocks", None);
        // IV block plus padded payload.
        assert!(ciphertext.len() >= 16 + 48);
        assert_eq!(
            decrypt(&ciphertext, None),
            b"a longer message spanning multiple aes blocks"
        );
    }

    #[test]
    fn embedded_ivs_differ_between_runs() {
        let first = encrypt(b"same plaintext", None);
        let second = encrypt(b"same plaintext", None);
        assert_ne!(first[..16], second[..16]);
    }

    #[test]
    fn tampered_padding_is_corrupted() {
        let iv = [7u8; 16];
        let mut ciphertext = encrypt(b"payload", Some(&iv));
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        let source = Arc::new(MemoryStream::from(&ciphertext));
        let stream = CryptoStream::new(
            source,
            false,
            CryptoCipher::Aes256Cbc,
            KEY,
            Some(&iv),
            CryptoDirection::Read,
            CryptoOperation::Auto,
        )
        .unwrap();
        let out = MemoryStream::new();
        assert!(matches!(
            transfer_all(&stream, &out),
            Err(StreamError::Corrupted)
        ));
    }
}
