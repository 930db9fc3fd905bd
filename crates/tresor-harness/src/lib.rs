#![forbid(unsafe_code)]
//! Engine wiring and test doubles for driving the Tresor modules end to end.
//!
//! The harness composes the real modules — Block Allocator, Block I/O over a
//! shared in-memory backend, Free-Tree Checker, VBD Initializer — behind a
//! [`Composition`] and drives them the way a platform driver loop would:
//! execute all modules until a full pass makes no progress, then drain the
//! client-facing completion. The shared backend handle stays with the
//! caller, so tests can inspect and corrupt on-disk state between requests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

use tresor_alloc::BlockAllocator;
use tresor_block::{BlockBackend, BlockIo};
use tresor_crypto::{
    check_dst_buffer, check_key_value, CryptoCompletion, CryptoProvider, KeySlots,
};
use tresor_error::{BackendError, CryptoError};
use tresor_module::{
    CheckRequest, Composition, InitRequest, Module, ModuleId, Request, RequestId,
};
use tresor_types::{Block, Generation, KeyId, Pba, TreeShape, Type1Node, BLOCK_SIZE, KEY_SIZE};

// ── Shared in-memory backend ────────────────────────────────────────────────

/// In-memory block device whose storage is shared between the engine and the
/// test: clones see the same bytes.
#[derive(Debug, Clone)]
pub struct SharedMemBackend {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl SharedMemBackend {
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self {
            bytes: Rc::new(RefCell::new(vec![0_u8; block_count as usize * BLOCK_SIZE])),
        }
    }

    /// Copy of the stored bytes of one block.
    #[must_use]
    pub fn block_bytes(&self, pba: Pba) -> Vec<u8> {
        let off = pba.0 as usize * BLOCK_SIZE;
        self.bytes.borrow()[off..off + BLOCK_SIZE].to_vec()
    }

    /// Decode the stored bytes of one block.
    #[must_use]
    pub fn read_stored_block(&self, pba: Pba) -> Block {
        let mut block = Block::ZERO;
        block.as_bytes_mut().copy_from_slice(&self.block_bytes(pba));
        block
    }

    /// Mutate the stored bytes of one block in place (fault injection).
    pub fn modify_block(&self, pba: Pba, mutate: impl FnOnce(&mut [u8])) {
        let off = pba.0 as usize * BLOCK_SIZE;
        mutate(&mut self.bytes.borrow_mut()[off..off + BLOCK_SIZE]);
    }
}

impl BlockBackend for SharedMemBackend {
    fn block_count(&self) -> u64 {
        (self.bytes.borrow().len() / BLOCK_SIZE) as u64
    }

    fn read_block(&mut self, pba: Pba, block: &mut Block) -> Result<(), BackendError> {
        let capacity = self.block_count();
        if pba.0 >= capacity {
            return Err(BackendError::OutOfRange {
                pba: pba.0,
                count: 1,
                capacity,
            });
        }
        let off = pba.0 as usize * BLOCK_SIZE;
        block
            .as_bytes_mut()
            .copy_from_slice(&self.bytes.borrow()[off..off + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&mut self, pba: Pba, block: &Block) -> Result<(), BackendError> {
        let capacity = self.block_count();
        if pba.0 >= capacity {
            return Err(BackendError::OutOfRange {
                pba: pba.0,
                count: 1,
                capacity,
            });
        }
        let off = pba.0 as usize * BLOCK_SIZE;
        self.bytes.borrow_mut()[off..off + BLOCK_SIZE].copy_from_slice(block.as_bytes());
        Ok(())
    }

    fn sync(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

// ── I/O counting wrapper ────────────────────────────────────────────────────

/// Counters observed by [`CountingBackend`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IoCounters {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
}

/// Backend wrapper that counts operations into a shared cell.
#[derive(Debug, Clone)]
pub struct CountingBackend<B: BlockBackend> {
    inner: B,
    counters: Rc<RefCell<IoCounters>>,
}

impl<B: BlockBackend> CountingBackend<B> {
    #[must_use]
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            counters: Rc::new(RefCell::new(IoCounters::default())),
        }
    }

    /// Shared handle to the counters; stays valid after the backend moves
    /// into the engine.
    #[must_use]
    pub fn counters(&self) -> Rc<RefCell<IoCounters>> {
        Rc::clone(&self.counters)
    }
}

impl<B: BlockBackend> BlockBackend for CountingBackend<B> {
    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn read_block(&mut self, pba: Pba, block: &mut Block) -> Result<(), BackendError> {
        self.counters.borrow_mut().reads += 1;
        self.inner.read_block(pba, block)
    }

    fn write_block(&mut self, pba: Pba, block: &Block) -> Result<(), BackendError> {
        self.counters.borrow_mut().writes += 1;
        self.inner.write_block(pba, block)
    }

    fn sync(&mut self) -> Result<(), BackendError> {
        self.counters.borrow_mut().syncs += 1;
        self.inner.sync()
    }
}

// ── Keystream crypto test double ────────────────────────────────────────────

struct KeystreamOp {
    block_number: u64,
    bytes: Vec<u8>,
    ready: bool,
}

/// Polled crypto provider for exercising the client-data paths.
///
/// Derives a SHA-256 keystream from `(key, block number, chunk index)` and
/// XORs it over the block, so encryption and decryption are the same
/// transform. A stand-in for the out-of-scope cipher engine, not a cipher.
#[derive(Default)]
pub struct KeystreamCrypto {
    slots: KeySlots,
    keys: HashMap<u32, [u8; KEY_SIZE]>,
    encrypt_op: Option<KeystreamOp>,
    decrypt_op: Option<KeystreamOp>,
}

impl KeystreamCrypto {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn transform(key: &[u8; KEY_SIZE], block_number: u64, src: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(src.len());
        for (chunk_idx, chunk) in src.chunks(32).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(key);
            hasher.update(block_number.to_le_bytes());
            hasher.update((chunk_idx as u64).to_le_bytes());
            let keystream = hasher.finalize();
            out.extend(chunk.iter().zip(keystream.iter()).map(|(b, k)| b ^ k));
        }
        out
    }

    fn submit(
        &mut self,
        encrypt: bool,
        block_number: u64,
        key_id: KeyId,
        src: &[u8],
    ) -> Result<bool, CryptoError> {
        let slot = if encrypt {
            &self.encrypt_op
        } else {
            &self.decrypt_op
        };
        if slot.is_some() {
            return Ok(false);
        }
        if src.len() != BLOCK_SIZE {
            return Err(CryptoError::BufferTooSmall {
                need: BLOCK_SIZE,
                got: src.len(),
            });
        }
        let key = self
            .keys
            .get(&key_id.0)
            .ok_or(CryptoError::UnknownKey { id: key_id.0 })?;
        let op = KeystreamOp {
            block_number,
            bytes: Self::transform(key, block_number, src),
            ready: false,
        };
        if encrypt {
            self.encrypt_op = Some(op);
        } else {
            self.decrypt_op = Some(op);
        }
        Ok(true)
    }

    fn complete(
        slot: &mut Option<KeystreamOp>,
        dst: &mut [u8],
    ) -> Result<Option<CryptoCompletion>, CryptoError> {
        check_dst_buffer(dst)?;
        match slot {
            Some(op) if op.ready => {
                let op = slot.take().expect("checked above");
                dst[..op.bytes.len()].copy_from_slice(&op.bytes);
                Ok(Some(CryptoCompletion {
                    valid: true,
                    block_number: op.block_number,
                }))
            }
            _ => Ok(None),
        }
    }
}

impl CryptoProvider for KeystreamCrypto {
    fn execute(&mut self) -> bool {
        let mut progress = false;
        for op in [&mut self.encrypt_op, &mut self.decrypt_op].into_iter().flatten() {
            if !op.ready {
                op.ready = true;
                progress = true;
            }
        }
        progress
    }

    fn add_key(&mut self, id: KeyId, value: &[u8]) -> Result<(), CryptoError> {
        check_key_value(value)?;
        self.slots.store(id)?;
        let mut key = [0_u8; KEY_SIZE];
        key.copy_from_slice(value);
        self.keys.insert(id.0, key);
        Ok(())
    }

    fn remove_key(&mut self, id: KeyId) -> Result<(), CryptoError> {
        self.slots.remove(id)?;
        self.keys.remove(&id.0);
        Ok(())
    }

    fn submit_encryption_request(
        &mut self,
        block_number: u64,
        key_id: KeyId,
        src: &[u8],
    ) -> Result<bool, CryptoError> {
        self.submit(true, block_number, key_id, src)
    }

    fn encryption_request_complete(
        &mut self,
        dst: &mut [u8],
    ) -> Result<Option<CryptoCompletion>, CryptoError> {
        Self::complete(&mut self.encrypt_op, dst)
    }

    fn submit_decryption_request(
        &mut self,
        block_number: u64,
        key_id: KeyId,
        src: &[u8],
    ) -> Result<bool, CryptoError> {
        self.submit(false, block_number, key_id, src)
    }

    fn decryption_request_complete(
        &mut self,
        dst: &mut [u8],
    ) -> Result<Option<CryptoCompletion>, CryptoError> {
        Self::complete(&mut self.decrypt_op, dst)
    }
}

// ── Engine wiring ───────────────────────────────────────────────────────────

/// Construction parameters for a test engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the backing store, in blocks.
    pub block_count: u64,
    /// First address the allocator hands out. Keep above 0 so that a used
    /// leaf entry is never all-zero on the wire.
    pub first_allocatable_pba: Pba,
    /// Number of blocks the allocator may hand out.
    pub nr_of_allocatable_blocks: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_count: 1024,
            first_allocatable_pba: Pba(128),
            nr_of_allocatable_blocks: 512,
        }
    }
}

/// All engine modules wired into one composition, plus the shared handles a
/// test needs to observe the backing store.
pub struct Engine {
    composition: Composition,
    backend: SharedMemBackend,
    counters: Rc<RefCell<IoCounters>>,
}

impl Engine {
    /// Build an engine over a fresh in-memory store.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Self::with_crypto(config, None)
    }

    /// Build an engine whose Block I/O module drives `crypto`.
    pub fn with_crypto(
        config: &EngineConfig,
        crypto: Option<Box<dyn CryptoProvider>>,
    ) -> Result<Self> {
        let backend = SharedMemBackend::new(config.block_count);
        let counting = CountingBackend::new(backend.clone());
        let counters = counting.counters();

        let mut block_io = BlockIo::new(counting);
        if let Some(crypto) = crypto {
            block_io = block_io.with_crypto(crypto);
        }

        let mut composition = Composition::new();
        composition
            .add_module(ModuleId::BlockIo, Box::new(block_io))
            .context("register block_io")?;
        composition
            .add_module(
                ModuleId::BlockAllocator,
                Box::new(BlockAllocator::new(
                    config.first_allocatable_pba,
                    config.nr_of_allocatable_blocks,
                )),
            )
            .context("register block_allocator")?;
        composition
            .add_module(ModuleId::FtCheck, Box::new(tresor_check::FtCheck::new()))
            .context("register ft_check")?;
        composition
            .add_module(
                ModuleId::VbdInitializer,
                Box::new(tresor_init::VbdInitializer::new()),
            )
            .context("register vbd_initializer")?;

        Ok(Self {
            composition,
            backend,
            counters,
        })
    }

    #[must_use]
    pub fn backend(&self) -> &SharedMemBackend {
        &self.backend
    }

    #[must_use]
    pub fn io_counters(&self) -> IoCounters {
        *self.counters.borrow()
    }

    #[must_use]
    pub fn composition_mut(&mut self) -> &mut Composition {
        &mut self.composition
    }

    /// Submit a client request to the module named in its envelope.
    pub fn submit(&mut self, req: Request) -> Result<()> {
        let dst = req.envelope().dst;
        let module = self
            .composition
            .module_mut(dst)
            .with_context(|| format!("module {dst} not registered"))?;
        module.submit_request(req)?;
        Ok(())
    }

    /// Drive the composition until the client-facing completion of `module`
    /// is available, then drain and return it.
    pub fn run_until_complete(&mut self, module: ModuleId) -> Result<Request> {
        loop {
            let progress = self.composition.execute_modules()?;

            if let Some(serving) = self.composition.module_mut(module) {
                if let Some(req) = serving.peek_completed_request() {
                    if req.envelope().src == ModuleId::Client {
                        serving.drop_completed_request(&req)?;
                        tracing::debug!(
                            target: "tresor::harness",
                            module = module.name(),
                            request = %req,
                            success = req.success(),
                            "client_request_complete"
                        );
                        return Ok(req);
                    }
                }
            }

            if !progress {
                bail!("engine stalled before {module} completed a client request");
            }
        }
    }

    /// Build a tree of `shape` stamped with `generation`; returns the
    /// completed initializer request (root node included).
    pub fn init_tree(&mut self, shape: TreeShape, generation: Generation) -> Result<InitRequest> {
        self.submit(Request::Init(InitRequest::init(
            ModuleId::Client,
            RequestId(0),
            shape,
            generation,
        )))?;
        match self.run_until_complete(ModuleId::VbdInitializer)? {
            Request::Init(req) => Ok(req),
            other => bail!("unexpected completion: {other}"),
        }
    }

    /// Verify a tree of `shape` rooted at `root`; returns the completed
    /// checker request.
    pub fn check_tree(&mut self, shape: TreeShape, root: Type1Node) -> Result<CheckRequest> {
        self.submit(Request::Check(CheckRequest::check(
            ModuleId::Client,
            RequestId(0),
            shape,
            root,
        )))?;
        match self.run_until_complete(ModuleId::FtCheck)? {
            Request::Check(req) => Ok(req),
            other => bail!("unexpected completion: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystream_round_trips() {
        let mut crypto = KeystreamCrypto::new();
        crypto.add_key(KeyId(1), &[7_u8; KEY_SIZE]).expect("add key");

        let mut plaintext = vec![0_u8; BLOCK_SIZE];
        plaintext[..6].copy_from_slice(b"tresor");

        assert!(crypto
            .submit_encryption_request(42, KeyId(1), &plaintext)
            .expect("submit"));
        // Busy until the outstanding request is drained.
        assert!(!crypto
            .submit_encryption_request(43, KeyId(1), &plaintext)
            .expect("busy submit"));

        assert!(crypto.execute());
        let mut ciphertext = vec![0_u8; BLOCK_SIZE];
        let done = crypto
            .encryption_request_complete(&mut ciphertext)
            .expect("complete")
            .expect("ready");
        assert!(done.valid);
        assert_eq!(done.block_number, 42);
        assert_ne!(ciphertext, plaintext);

        assert!(crypto
            .submit_decryption_request(42, KeyId(1), &ciphertext)
            .expect("submit decrypt"));
        crypto.execute();
        let mut recovered = vec![0_u8; BLOCK_SIZE];
        crypto
            .decryption_request_complete(&mut recovered)
            .expect("complete")
            .expect("ready");
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn keystream_depends_on_block_number() {
        let key = [9_u8; KEY_SIZE];
        let src = vec![0xA5_u8; BLOCK_SIZE];
        let one = KeystreamCrypto::transform(&key, 1, &src);
        let two = KeystreamCrypto::transform(&key, 2, &src);
        assert_ne!(one, two);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut crypto = KeystreamCrypto::new();
        let src = vec![0_u8; BLOCK_SIZE];
        assert_eq!(
            crypto.submit_encryption_request(0, KeyId(3), &src),
            Err(CryptoError::UnknownKey { id: 3 })
        );
    }

    #[test]
    fn counting_backend_counts() {
        let counting = CountingBackend::new(SharedMemBackend::new(4));
        let counters = counting.counters();
        let mut backend = counting;

        let mut block = Block::ZERO;
        backend.write_block(Pba(0), &block).expect("write");
        backend.read_block(Pba(0), &mut block).expect("read");
        backend.sync().expect("sync");

        assert_eq!(
            *counters.borrow(),
            IoCounters {
                reads: 1,
                writes: 1,
                syncs: 1
            }
        );
    }

    #[test]
    fn shared_backend_is_shared() {
        let handle = SharedMemBackend::new(2);
        let mut engine_side = handle.clone();

        let mut block = Block::ZERO;
        block.as_bytes_mut()[0] = 0xAA;
        engine_side.write_block(Pba(1), &block).expect("write");
        assert_eq!(handle.block_bytes(Pba(1))[0], 0xAA);

        handle.modify_block(Pba(1), |bytes| bytes[0] = 0xBB);
        engine_side.read_block(Pba(1), &mut block).expect("read");
        assert_eq!(block.as_bytes()[0], 0xBB);
    }
}
