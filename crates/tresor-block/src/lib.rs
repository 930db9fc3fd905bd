#![forbid(unsafe_code)]
//! Block I/O module and the raw block backends it drives.
//!
//! The backend is the narrow seam to the out-of-scope block device: fixed
//! 4096-byte blocks addressed by PBA, read/write/sync, nothing else. The
//! [`BlockIo`] module wraps a backend behind the engine's channel protocol
//! and additionally drives the symmetric-crypto collaborator for the
//! client-data operations (decrypt after read, encrypt before write).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use tresor_crypto::CryptoProvider;
use tresor_error::{BackendError, ProtocolError};
use tresor_module::{BlockIoOp, BlockIoRequest, Module, Request, RequestId};
use tresor_types::{sha256_4k_hash, Block, Pba, BLOCK_SIZE};

const MODULE_NAME: &str = "block_io";

/// Number of request channels of the Block I/O module.
pub const NR_OF_CHANNELS: usize = 1;

// ── Backends ────────────────────────────────────────────────────────────────

/// Raw block device seam: fixed-size blocks, PBA-addressed.
pub trait BlockBackend {
    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Read the block at `pba` into `block`.
    fn read_block(&mut self, pba: Pba, block: &mut Block) -> Result<(), BackendError>;

    /// Write `block` to `pba`.
    fn write_block(&mut self, pba: Pba, block: &Block) -> Result<(), BackendError>;

    /// Flush pending writes to stable storage.
    fn sync(&mut self) -> Result<(), BackendError>;
}

fn check_range(pba: Pba, capacity: u64) -> Result<(), BackendError> {
    if pba.0 >= capacity {
        return Err(BackendError::OutOfRange {
            pba: pba.0,
            count: 1,
            capacity,
        });
    }
    Ok(())
}

/// File-backed block device using positional I/O.
///
/// `FileExt::read_exact_at`/`write_all_at` need no shared seek position, so
/// the handle carries no extra state.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    block_count: u64,
}

impl FileBackend {
    /// Open an existing image. Its length must be a whole number of blocks.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(BackendError::Io(std::io::Error::other(format!(
                "image length {len} is not a multiple of the block size"
            ))));
        }
        Ok(Self {
            file,
            block_count: len / BLOCK_SIZE as u64,
        })
    }

    /// Create (or truncate) an image holding `block_count` zeroed blocks.
    pub fn create(path: impl AsRef<Path>, block_count: u64) -> Result<Self, BackendError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_count * BLOCK_SIZE as u64)?;
        Ok(Self { file, block_count })
    }
}

impl BlockBackend for FileBackend {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&mut self, pba: Pba, block: &mut Block) -> Result<(), BackendError> {
        check_range(pba, self.block_count)?;
        self.file
            .read_exact_at(block.as_bytes_mut(), pba.0 * BLOCK_SIZE as u64)?;
        Ok(())
    }

    fn write_block(&mut self, pba: Pba, block: &Block) -> Result<(), BackendError> {
        check_range(pba, self.block_count)?;
        self.file
            .write_all_at(block.as_bytes(), pba.0 * BLOCK_SIZE as u64)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), BackendError> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory block device for tests and tooling.
#[derive(Debug, Clone)]
pub struct MemBackend {
    bytes: Vec<u8>,
}

impl MemBackend {
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self {
            bytes: vec![0_u8; block_count as usize * BLOCK_SIZE],
        }
    }

    /// Direct view of a stored block, for test assertions and fault
    /// injection.
    #[must_use]
    pub fn block_bytes(&self, pba: Pba) -> &[u8] {
        let off = pba.0 as usize * BLOCK_SIZE;
        &self.bytes[off..off + BLOCK_SIZE]
    }

    /// Mutable view of a stored block.
    #[must_use]
    pub fn block_bytes_mut(&mut self, pba: Pba) -> &mut [u8] {
        let off = pba.0 as usize * BLOCK_SIZE;
        &mut self.bytes[off..off + BLOCK_SIZE]
    }
}

impl BlockBackend for MemBackend {
    fn block_count(&self) -> u64 {
        (self.bytes.len() / BLOCK_SIZE) as u64
    }

    fn read_block(&mut self, pba: Pba, block: &mut Block) -> Result<(), BackendError> {
        check_range(pba, self.block_count())?;
        block.as_bytes_mut().copy_from_slice(self.block_bytes(pba));
        Ok(())
    }

    fn write_block(&mut self, pba: Pba, block: &Block) -> Result<(), BackendError> {
        check_range(pba, self.block_count())?;
        self.block_bytes_mut(pba).copy_from_slice(block.as_bytes());
        Ok(())
    }

    fn sync(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

// ── Block I/O module ────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    #[default]
    Inactive,
    Submitted,
    Pending,
    Complete,
    EncryptClientDataPending,
    EncryptClientDataInProgress,
    EncryptClientDataComplete,
    DecryptClientDataPending,
    DecryptClientDataInProgress,
    DecryptClientDataComplete,
}

#[derive(Default)]
struct Channel {
    state: State,
    request: Option<BlockIoRequest>,
    /// Staging buffer for the client-data paths (ciphertext on write,
    /// plaintext on read).
    blk_buf: Block,
    generated_req_success: bool,
}

/// Block I/O module: serves READ/WRITE/SYNC against the backend and the
/// client-data operations through the crypto provider.
pub struct BlockIo<B: BlockBackend> {
    backend: B,
    crypto: Option<Box<dyn CryptoProvider>>,
    channels: [Channel; NR_OF_CHANNELS],
}

impl<B: BlockBackend> BlockIo<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            crypto: None,
            channels: Default::default(),
        }
    }

    /// Attach the crypto provider required by the client-data operations.
    #[must_use]
    pub fn with_crypto(mut self, crypto: Box<dyn CryptoProvider>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn mark_req_failed(channel: &mut Channel, progress: &mut bool, step: &str) {
        if let Some(req) = channel.request.as_mut() {
            tracing::error!(
                target: "tresor::block_io",
                request = %req,
                step,
                "request_failed"
            );
            req.success = false;
        }
        channel.state = State::Complete;
        *progress = true;
    }

    fn mark_req_successful(channel: &mut Channel, progress: &mut bool) {
        if let Some(req) = channel.request.as_mut() {
            req.success = true;
        }
        channel.state = State::Complete;
        *progress = true;
    }

    fn execute_read(backend: &mut B, channel: &mut Channel, progress: &mut bool) {
        if channel.state != State::Pending {
            return;
        }
        let Some(req) = channel.request.as_mut() else {
            return;
        };
        match backend.read_block(req.pba, &mut req.block) {
            Ok(()) => Self::mark_req_successful(channel, progress),
            Err(err) => {
                tracing::error!(
                    target: "tresor::block_io",
                    pba = req.pba.0,
                    error = %err,
                    "backend_read_failed"
                );
                Self::mark_req_failed(channel, progress, "read from backend");
            }
        }
    }

    fn execute_write(backend: &mut B, channel: &mut Channel, progress: &mut bool) {
        if channel.state != State::Pending {
            return;
        }
        let Some(req) = channel.request.as_ref() else {
            return;
        };
        match backend.write_block(req.pba, &req.block) {
            Ok(()) => Self::mark_req_successful(channel, progress),
            Err(err) => {
                tracing::error!(
                    target: "tresor::block_io",
                    pba = req.pba.0,
                    error = %err,
                    "backend_write_failed"
                );
                Self::mark_req_failed(channel, progress, "write to backend");
            }
        }
    }

    fn execute_sync(backend: &mut B, channel: &mut Channel, progress: &mut bool) {
        if channel.state != State::Pending {
            return;
        }
        match backend.sync() {
            Ok(()) => Self::mark_req_successful(channel, progress),
            Err(err) => {
                tracing::error!(
                    target: "tresor::block_io",
                    error = %err,
                    "backend_sync_failed"
                );
                Self::mark_req_failed(channel, progress, "sync backend");
            }
        }
    }

    fn execute_read_client_data(
        backend: &mut B,
        crypto: Option<&mut Box<dyn CryptoProvider>>,
        channel: &mut Channel,
        progress: &mut bool,
    ) {
        match channel.state {
            State::Pending => {
                let Some(req) = channel.request.as_ref() else {
                    return;
                };
                match backend.read_block(req.pba, &mut channel.blk_buf) {
                    Ok(()) => {
                        channel.state = State::DecryptClientDataPending;
                        *progress = true;
                    }
                    Err(err) => {
                        tracing::error!(
                            target: "tresor::block_io",
                            pba = req.pba.0,
                            error = %err,
                            "backend_read_failed"
                        );
                        Self::mark_req_failed(channel, progress, "read client data");
                    }
                }
            }
            State::DecryptClientDataPending => {
                let Some(crypto) = crypto else {
                    Self::mark_req_failed(channel, progress, "decrypt without crypto provider");
                    return;
                };
                let Some(req) = channel.request.as_ref() else {
                    return;
                };
                match crypto.submit_decryption_request(
                    req.vba.0,
                    req.key_id,
                    channel.blk_buf.as_bytes(),
                ) {
                    Ok(true) => {
                        channel.state = State::DecryptClientDataInProgress;
                        *progress = true;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::error!(
                            target: "tresor::block_io",
                            error = %err,
                            "crypto_submit_failed"
                        );
                        Self::mark_req_failed(channel, progress, "submit decryption");
                    }
                }
            }
            State::DecryptClientDataInProgress => {
                let Some(crypto) = crypto else {
                    return;
                };
                match crypto.decryption_request_complete(channel.blk_buf.as_bytes_mut()) {
                    Ok(Some(completion)) => {
                        channel.generated_req_success = completion.valid;
                        channel.state = State::DecryptClientDataComplete;
                        *progress = true;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(
                            target: "tresor::block_io",
                            error = %err,
                            "crypto_poll_failed"
                        );
                        Self::mark_req_failed(channel, progress, "poll decryption");
                    }
                }
            }
            State::DecryptClientDataComplete => {
                if !channel.generated_req_success {
                    Self::mark_req_failed(channel, progress, "decrypt client data");
                    return;
                }
                if let Some(req) = channel.request.as_mut() {
                    req.block.as_bytes_mut().copy_from_slice(channel.blk_buf.as_bytes());
                }
                Self::mark_req_successful(channel, progress);
            }
            _ => {}
        }
    }

    fn execute_write_client_data(
        backend: &mut B,
        crypto: Option<&mut Box<dyn CryptoProvider>>,
        channel: &mut Channel,
        progress: &mut bool,
    ) {
        match channel.state {
            State::Pending => {
                channel.state = State::EncryptClientDataPending;
                *progress = true;
            }
            State::EncryptClientDataPending => {
                let Some(crypto) = crypto else {
                    Self::mark_req_failed(channel, progress, "encrypt without crypto provider");
                    return;
                };
                let Some(req) = channel.request.as_ref() else {
                    return;
                };
                match crypto.submit_encryption_request(req.vba.0, req.key_id, req.block.as_bytes())
                {
                    Ok(true) => {
                        channel.state = State::EncryptClientDataInProgress;
                        *progress = true;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::error!(
                            target: "tresor::block_io",
                            error = %err,
                            "crypto_submit_failed"
                        );
                        Self::mark_req_failed(channel, progress, "submit encryption");
                    }
                }
            }
            State::EncryptClientDataInProgress => {
                let Some(crypto) = crypto else {
                    return;
                };
                match crypto.encryption_request_complete(channel.blk_buf.as_bytes_mut()) {
                    Ok(Some(completion)) => {
                        channel.generated_req_success = completion.valid;
                        channel.state = State::EncryptClientDataComplete;
                        *progress = true;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(
                            target: "tresor::block_io",
                            error = %err,
                            "crypto_poll_failed"
                        );
                        Self::mark_req_failed(channel, progress, "poll encryption");
                    }
                }
            }
            State::EncryptClientDataComplete => {
                if !channel.generated_req_success {
                    Self::mark_req_failed(channel, progress, "encrypt client data");
                    return;
                }
                let Some(req) = channel.request.as_mut() else {
                    return;
                };
                req.hash = sha256_4k_hash(&channel.blk_buf);
                let pba = req.pba;
                match backend.write_block(pba, &channel.blk_buf) {
                    Ok(()) => Self::mark_req_successful(channel, progress),
                    Err(err) => {
                        tracing::error!(
                            target: "tresor::block_io",
                            pba = pba.0,
                            error = %err,
                            "backend_write_failed"
                        );
                        Self::mark_req_failed(channel, progress, "write client data");
                    }
                }
            }
            _ => {}
        }
    }
}

impl<B: BlockBackend> Module for BlockIo<B> {
    fn ready_to_submit_request(&self) -> bool {
        self.channels
            .iter()
            .any(|channel| channel.state == State::Inactive)
    }

    fn submit_request(&mut self, req: Request) -> Result<(), ProtocolError> {
        let Request::BlockIo(mut req) = req else {
            return Err(ProtocolError::WrongModule {
                expected: MODULE_NAME,
                got: req.envelope().dst.name(),
            });
        };
        for (id, channel) in self.channels.iter_mut().enumerate() {
            if channel.state == State::Inactive {
                req.env.dst_request_id = RequestId(id as u64);
                channel.request = Some(req);
                channel.state = State::Submitted;
                channel.generated_req_success = false;
                return Ok(());
            }
        }
        Err(ProtocolError::NoFreeChannel {
            module: MODULE_NAME,
        })
    }

    fn execute(&mut self, progress: &mut bool) {
        if let Some(crypto) = self.crypto.as_mut() {
            if crypto.execute() {
                *progress = true;
            }
        }
        for channel in &mut self.channels {
            if channel.state == State::Inactive || channel.state == State::Complete {
                continue;
            }
            if channel.state == State::Submitted {
                channel.state = State::Pending;
                *progress = true;
            }
            let Some(op) = channel.request.as_ref().map(|req| req.op) else {
                continue;
            };
            match op {
                BlockIoOp::Read => Self::execute_read(&mut self.backend, channel, progress),
                BlockIoOp::Write => Self::execute_write(&mut self.backend, channel, progress),
                BlockIoOp::Sync => Self::execute_sync(&mut self.backend, channel, progress),
                BlockIoOp::ReadClientData => Self::execute_read_client_data(
                    &mut self.backend,
                    self.crypto.as_mut(),
                    channel,
                    progress,
                ),
                BlockIoOp::WriteClientData => Self::execute_write_client_data(
                    &mut self.backend,
                    self.crypto.as_mut(),
                    channel,
                    progress,
                ),
                BlockIoOp::Invalid => {}
            }
        }
    }

    fn peek_completed_request(&self) -> Option<Request> {
        self.channels
            .iter()
            .filter(|channel| channel.state == State::Complete)
            .find_map(|channel| channel.request.clone().map(Request::BlockIo))
    }

    fn drop_completed_request(&mut self, req: &Request) -> Result<(), ProtocolError> {
        let id = req.envelope().dst_request_id.0;
        let channel = self.channels.get_mut(id as usize).ok_or(
            ProtocolError::UnknownChannel {
                module: MODULE_NAME,
                id,
            },
        )?;
        if channel.state != State::Complete {
            return Err(ProtocolError::NotComplete {
                module: MODULE_NAME,
                id,
            });
        }
        *channel = Channel::default();
        Ok(())
    }

    fn peek_generated_request(&self) -> Option<Request> {
        // Crypto is driven inline through the provider seam; this module
        // emits no sub-requests.
        None
    }

    fn drop_generated_request(&mut self, req: &Request) -> Result<(), ProtocolError> {
        Err(ProtocolError::NoGeneratedRequest {
            module: MODULE_NAME,
            id: req.envelope().src_request_id.0,
        })
    }

    fn generated_request_complete(&mut self, req: Request) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnexpectedCompletion {
            module: MODULE_NAME,
            id: req.envelope().src_request_id.0,
            detail: "module emits no sub-requests",
        })
    }
}
