#![forbid(unsafe_code)]
//! Module execution contract and cross-module request plumbing.
//!
//! Every component of the engine is a *module*: a bundle of fixed channels,
//! each holding at most one in-flight request plus that module's private
//! state machine. Modules never call each other. A module in the middle of
//! serving a request emits a *generated* sub-request addressed to another
//! module; the [`Composition`] relays it, and later feeds the completed
//! sub-request back via [`Module::generated_request_complete`]. The whole
//! engine is single-threaded and non-blocking: "waiting" is a channel
//! sitting in a non-terminal state across [`Module::execute`] calls.
//!
//! The request vocabulary is a closed set ([`Request`]); dispatch happens on
//! the enum, not through open-ended inheritance.

use std::fmt;

use tresor_error::ProtocolError;
use tresor_types::{Block, Generation, KeyId, Pba, TreeShape, TresorHash, Type1Node, Vba};

/// Upper bound on the in-memory size of one relayed request.
///
/// The relay copies requests by value between modules; this bound keeps the
/// envelope cheap to move and is enforced at compile time.
pub const MAX_REQUEST_BYTES: usize = 4000;

const _: () = assert!(std::mem::size_of::<Request>() <= MAX_REQUEST_BYTES);

/// The closed set of modules that can originate or serve requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleId {
    /// A client outside the engine; never registered in a composition.
    Client,
    BlockIo,
    BlockAllocator,
    VbdInitializer,
    FtCheck,
}

/// Number of distinct [`ModuleId`] values.
pub const NR_OF_MODULE_IDS: usize = 5;

impl ModuleId {
    /// Stable name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::BlockIo => "block_io",
            Self::BlockAllocator => "block_allocator",
            Self::VbdInitializer => "vbd_initializer",
            Self::FtCheck => "ft_check",
        }
    }

    #[must_use]
    fn index(self) -> usize {
        match self {
            Self::Client => 0,
            Self::BlockIo => 1,
            Self::BlockAllocator => 2,
            Self::VbdInitializer => 3,
            Self::FtCheck => 4,
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-module request identifier; assigned the channel index at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

pub const INVALID_REQUEST_ID: RequestId = RequestId(u64::MAX);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == INVALID_REQUEST_ID {
            f.write_str("invalid")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Routing header shared by every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub src: ModuleId,
    pub src_request_id: RequestId,
    pub dst: ModuleId,
    pub dst_request_id: RequestId,
}

impl RequestEnvelope {
    /// Envelope for a fresh request; the destination request id is assigned
    /// by the serving module at submission.
    #[must_use]
    pub fn new(src: ModuleId, src_request_id: RequestId, dst: ModuleId) -> Self {
        Self {
            src,
            src_request_id,
            dst,
            dst_request_id: INVALID_REQUEST_ID,
        }
    }
}

// ── Request payloads ────────────────────────────────────────────────────────

/// Block Allocator operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocOp {
    Invalid,
    Get,
}

impl AllocOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Get => "get",
        }
    }
}

/// Request served by the Block Allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRequest {
    pub env: RequestEnvelope,
    pub op: AllocOp,
    /// Allocated address, filled in on success.
    pub blk_nr: Pba,
    pub success: bool,
}

impl AllocRequest {
    #[must_use]
    pub fn get(src: ModuleId, src_request_id: RequestId) -> Self {
        Self {
            env: RequestEnvelope::new(src, src_request_id, ModuleId::BlockAllocator),
            op: AllocOp::Get,
            blk_nr: Pba(0),
            success: false,
        }
    }
}

impl fmt::Display for AllocRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op.as_str())
    }
}

/// Block I/O operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockIoOp {
    Invalid,
    Read,
    Write,
    Sync,
    ReadClientData,
    WriteClientData,
}

impl BlockIoOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Read => "read",
            Self::Write => "write",
            Self::Sync => "sync",
            Self::ReadClientData => "read_client_data",
            Self::WriteClientData => "write_client_data",
        }
    }
}

/// Request served by the Block I/O module.
///
/// The payload buffer is owned; completions carry the data back by value
/// instead of writing through caller pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIoRequest {
    pub env: RequestEnvelope,
    pub op: BlockIoOp,
    pub client_req_offset: u64,
    pub client_req_tag: u64,
    pub key_id: KeyId,
    pub pba: Pba,
    pub vba: Vba,
    pub blk_count: u64,
    pub block: Box<Block>,
    pub hash: TresorHash,
    pub success: bool,
}

impl BlockIoRequest {
    #[must_use]
    pub fn read(src: ModuleId, src_request_id: RequestId, pba: Pba) -> Self {
        Self {
            env: RequestEnvelope::new(src, src_request_id, ModuleId::BlockIo),
            op: BlockIoOp::Read,
            client_req_offset: 0,
            client_req_tag: 0,
            key_id: KeyId(0),
            pba,
            vba: Vba(0),
            blk_count: 1,
            block: Box::new(Block::ZERO),
            hash: TresorHash::ZERO,
            success: false,
        }
    }

    #[must_use]
    pub fn write(src: ModuleId, src_request_id: RequestId, pba: Pba, block: Box<Block>) -> Self {
        Self {
            env: RequestEnvelope::new(src, src_request_id, ModuleId::BlockIo),
            op: BlockIoOp::Write,
            client_req_offset: 0,
            client_req_tag: 0,
            key_id: KeyId(0),
            pba,
            vba: Vba(0),
            blk_count: 1,
            block,
            hash: TresorHash::ZERO,
            success: false,
        }
    }

    #[must_use]
    pub fn sync(src: ModuleId, src_request_id: RequestId) -> Self {
        Self {
            env: RequestEnvelope::new(src, src_request_id, ModuleId::BlockIo),
            op: BlockIoOp::Sync,
            client_req_offset: 0,
            client_req_tag: 0,
            key_id: KeyId(0),
            pba: Pba(0),
            vba: Vba(0),
            blk_count: 0,
            block: Box::new(Block::ZERO),
            hash: TresorHash::ZERO,
            success: false,
        }
    }

    #[must_use]
    pub fn read_client_data(
        src: ModuleId,
        src_request_id: RequestId,
        pba: Pba,
        vba: Vba,
        key_id: KeyId,
        client_req_offset: u64,
        client_req_tag: u64,
    ) -> Self {
        Self {
            env: RequestEnvelope::new(src, src_request_id, ModuleId::BlockIo),
            op: BlockIoOp::ReadClientData,
            client_req_offset,
            client_req_tag,
            key_id,
            pba,
            vba,
            blk_count: 1,
            block: Box::new(Block::ZERO),
            hash: TresorHash::ZERO,
            success: false,
        }
    }

    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn write_client_data(
        src: ModuleId,
        src_request_id: RequestId,
        pba: Pba,
        vba: Vba,
        key_id: KeyId,
        client_req_offset: u64,
        client_req_tag: u64,
        block: Box<Block>,
    ) -> Self {
        Self {
            env: RequestEnvelope::new(src, src_request_id, ModuleId::BlockIo),
            op: BlockIoOp::WriteClientData,
            client_req_offset,
            client_req_tag,
            key_id,
            pba,
            vba,
            blk_count: 1,
            block,
            hash: TresorHash::ZERO,
            success: false,
        }
    }
}

impl fmt::Display for BlockIoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pba {} count {}", self.op.as_str(), self.pba, self.blk_count)
    }
}

/// Free-Tree Checker operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOp {
    Invalid,
    Check,
}

impl CheckOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Check => "check",
        }
    }
}

/// Request served by the Free-Tree Checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub env: RequestEnvelope,
    pub op: CheckOp,
    pub shape: TreeShape,
    pub root: Type1Node,
    pub success: bool,
}

impl CheckRequest {
    #[must_use]
    pub fn check(src: ModuleId, src_request_id: RequestId, shape: TreeShape, root: Type1Node) -> Self {
        Self {
            env: RequestEnvelope::new(src, src_request_id, ModuleId::FtCheck),
            op: CheckOp::Check,
            shape,
            root,
            success: false,
        }
    }
}

impl fmt::Display for CheckRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} root {}", self.op.as_str(), self.root)
    }
}

/// VBD Initializer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOp {
    Invalid,
    Init,
}

impl InitOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Init => "init",
        }
    }
}

/// Request served by the VBD Initializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRequest {
    pub env: RequestEnvelope,
    pub op: InitOp,
    pub shape: TreeShape,
    /// Generation recorded into every written node and the returned root.
    pub generation: Generation,
    /// Root of the constructed tree, filled in on success.
    pub root: Type1Node,
    pub success: bool,
}

impl InitRequest {
    #[must_use]
    pub fn init(
        src: ModuleId,
        src_request_id: RequestId,
        shape: TreeShape,
        generation: Generation,
    ) -> Self {
        Self {
            env: RequestEnvelope::new(src, src_request_id, ModuleId::VbdInitializer),
            op: InitOp::Init,
            shape,
            generation,
            root: Type1Node::ZERO,
            success: false,
        }
    }
}

impl fmt::Display for InitRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op.as_str())
    }
}

/// The closed set of requests relayed between modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Alloc(AllocRequest),
    BlockIo(BlockIoRequest),
    Check(CheckRequest),
    Init(InitRequest),
}

impl Request {
    #[must_use]
    pub fn envelope(&self) -> &RequestEnvelope {
        match self {
            Self::Alloc(req) => &req.env,
            Self::BlockIo(req) => &req.env,
            Self::Check(req) => &req.env,
            Self::Init(req) => &req.env,
        }
    }

    #[must_use]
    pub fn envelope_mut(&mut self) -> &mut RequestEnvelope {
        match self {
            Self::Alloc(req) => &mut req.env,
            Self::BlockIo(req) => &mut req.env,
            Self::Check(req) => &mut req.env,
            Self::Init(req) => &mut req.env,
        }
    }

    /// Stable operation name for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Alloc(req) => req.op.as_str(),
            Self::BlockIo(req) => req.op.as_str(),
            Self::Check(req) => req.op.as_str(),
            Self::Init(req) => req.op.as_str(),
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        match self {
            Self::Alloc(req) => req.success,
            Self::BlockIo(req) => req.success,
            Self::Check(req) => req.success,
            Self::Init(req) => req.success,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc(req) => req.fmt(f),
            Self::BlockIo(req) => req.fmt(f),
            Self::Check(req) => req.fmt(f),
            Self::Init(req) => req.fmt(f),
        }
    }
}

/// Lifecycle of a channel with no module-specific sub-states.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Inactive,
    Submitted,
    Pending,
    InProgress,
    Complete,
}

// ── Module contract ─────────────────────────────────────────────────────────

/// The execution contract every module implements.
///
/// `execute` advances every active channel by at most one step and must be
/// safe to call repeatedly until it reports no progress; it never blocks.
/// The peek/drop pairs move requests across the module boundary by value.
pub trait Module {
    /// Whether at least one channel is free to take a request.
    fn ready_to_submit_request(&self) -> bool;

    /// Claim a free channel for `req`, assigning its destination request id.
    fn submit_request(&mut self, req: Request) -> Result<(), ProtocolError>;

    /// Advance every active channel's state machine by one step; set
    /// `progress` whenever any channel changed state.
    fn execute(&mut self, progress: &mut bool);

    /// Copy of the first completed request, if any. Does not mutate state.
    fn peek_completed_request(&self) -> Option<Request>;

    /// Release the channel of a completed request for reuse.
    fn drop_completed_request(&mut self, req: &Request) -> Result<(), ProtocolError>;

    /// Copy of the first undropped generated sub-request, if any.
    fn peek_generated_request(&self) -> Option<Request>;

    /// Mark a generated sub-request as consumed by the relay.
    fn drop_generated_request(&mut self, req: &Request) -> Result<(), ProtocolError>;

    /// Deliver the outcome of a generated sub-request back to the channel
    /// that emitted it.
    fn generated_request_complete(&mut self, req: Request) -> Result<(), ProtocolError>;
}

// ── Composition ─────────────────────────────────────────────────────────────

/// Closed-set composition of modules: round-robins execution, relays each
/// module's generated sub-requests, and routes completions back to their
/// source module.
///
/// Completions whose source module is not registered (client-originated
/// requests) are left in place for the client to peek and drop through
/// [`Composition::module_mut`].
#[derive(Default)]
pub struct Composition {
    slots: [Option<Box<dyn Module>>; NR_OF_MODULE_IDS],
}

impl Composition {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module` under `id`.
    pub fn add_module(
        &mut self,
        id: ModuleId,
        module: Box<dyn Module>,
    ) -> Result<(), ProtocolError> {
        let slot = &mut self.slots[id.index()];
        if slot.is_some() {
            return Err(ProtocolError::ModuleAlreadyRegistered { module: id.name() });
        }
        *slot = Some(module);
        Ok(())
    }

    /// Remove and return the module registered under `id`.
    pub fn remove_module(&mut self, id: ModuleId) -> Result<Box<dyn Module>, ProtocolError> {
        self.slots[id.index()]
            .take()
            .ok_or(ProtocolError::ModuleNotRegistered { module: id.name() })
    }

    #[must_use]
    pub fn module(&self, id: ModuleId) -> Option<&dyn Module> {
        self.slots[id.index()].as_deref()
    }

    #[must_use]
    pub fn module_mut(&mut self, id: ModuleId) -> Option<&mut (dyn Module + 'static)> {
        self.slots[id.index()].as_deref_mut()
    }

    /// One round-robin pass over all registered modules.
    ///
    /// Returns whether any module made progress. Callers drive the engine by
    /// looping until a full pass reports no progress, then draining their
    /// own completed requests.
    pub fn execute_modules(&mut self) -> Result<bool, ProtocolError> {
        let mut progress = false;
        for idx in 0..NR_OF_MODULE_IDS {
            if self.slots[idx].is_none() {
                continue;
            }

            if let Some(module) = self.slots[idx].as_mut() {
                module.execute(&mut progress);
            }

            self.relay_generated_requests(idx, &mut progress)?;
            self.route_completions(idx, &mut progress)?;
        }
        Ok(progress)
    }

    /// Run passes until a full pass reports no progress.
    pub fn execute_until_idle(&mut self) -> Result<(), ProtocolError> {
        while self.execute_modules()? {}
        Ok(())
    }

    fn relay_generated_requests(
        &mut self,
        idx: usize,
        progress: &mut bool,
    ) -> Result<(), ProtocolError> {
        loop {
            let Some(req) = self.slots[idx].as_ref().and_then(|m| m.peek_generated_request())
            else {
                return Ok(());
            };
            let dst = req.envelope().dst;
            let src = req.envelope().src;

            let Some(dst_module) = self.slots[dst.index()].as_mut() else {
                return Err(ProtocolError::ModuleNotRegistered { module: dst.name() });
            };
            if !dst_module.ready_to_submit_request() {
                tracing::trace!(
                    target: "tresor::composition",
                    src = src.name(),
                    dst = dst.name(),
                    request = %req,
                    "relay_backpressure"
                );
                return Ok(());
            }
            dst_module.submit_request(req.clone())?;
            tracing::trace!(
                target: "tresor::composition",
                src = src.name(),
                src_request_id = %req.envelope().src_request_id,
                dst = dst.name(),
                request = %req,
                "relay_submitted"
            );

            if let Some(src_module) = self.slots[idx].as_mut() {
                src_module.drop_generated_request(&req)?;
            }
            *progress = true;
        }
    }

    fn route_completions(&mut self, idx: usize, progress: &mut bool) -> Result<(), ProtocolError> {
        loop {
            let Some(req) = self.slots[idx].as_ref().and_then(|m| m.peek_completed_request())
            else {
                return Ok(());
            };
            let src = req.envelope().src;

            // A completion addressed outside the composition stays peekable
            // for the client.
            if self.slots[src.index()].is_none() {
                return Ok(());
            }

            tracing::trace!(
                target: "tresor::composition",
                src = src.name(),
                src_request_id = %req.envelope().src_request_id,
                dst = req.envelope().dst.name(),
                request = %req,
                success = req.success(),
                "completion_routed"
            );

            if let Some(src_module) = self.slots[src.index()].as_mut() {
                src_module.generated_request_complete(req.clone())?;
            }
            if let Some(dst_module) = self.slots[idx].as_mut() {
                dst_module.drop_completed_request(&req)?;
            }
            *progress = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_names_are_stable() {
        let shape = TreeShape::new(2, 63, 64).expect("shape");
        assert_eq!(
            Request::Alloc(AllocRequest::get(ModuleId::Client, RequestId(0))).type_name(),
            "get"
        );
        assert_eq!(
            Request::BlockIo(BlockIoRequest::read(ModuleId::Client, RequestId(0), Pba(1)))
                .type_name(),
            "read"
        );
        assert_eq!(
            Request::Check(CheckRequest::check(
                ModuleId::Client,
                RequestId(0),
                shape,
                Type1Node::ZERO,
            ))
            .type_name(),
            "check"
        );
        assert_eq!(
            Request::Init(InitRequest::init(
                ModuleId::Client,
                RequestId(0),
                shape,
                Generation(1),
            ))
            .type_name(),
            "init"
        );
        assert_eq!(AllocOp::Invalid.as_str(), "invalid");
        assert_eq!(BlockIoOp::Invalid.as_str(), "invalid");
        assert_eq!(CheckOp::Invalid.as_str(), "invalid");
        assert_eq!(InitOp::Invalid.as_str(), "invalid");
    }

    #[test]
    fn envelope_starts_without_destination_id() {
        let req = AllocRequest::get(ModuleId::VbdInitializer, RequestId(0));
        assert_eq!(req.env.src, ModuleId::VbdInitializer);
        assert_eq!(req.env.dst, ModuleId::BlockAllocator);
        assert_eq!(req.env.dst_request_id, INVALID_REQUEST_ID);
    }

    #[test]
    fn module_names() {
        assert_eq!(ModuleId::FtCheck.name(), "ft_check");
        assert_eq!(ModuleId::BlockIo.to_string(), "block_io");
    }

    #[test]
    fn composition_rejects_double_registration() {
        struct Idle;
        impl Module for Idle {
            fn ready_to_submit_request(&self) -> bool {
                false
            }
            fn submit_request(&mut self, _req: Request) -> Result<(), ProtocolError> {
                Err(ProtocolError::NoFreeChannel { module: "idle" })
            }
            fn execute(&mut self, _progress: &mut bool) {}
            fn peek_completed_request(&self) -> Option<Request> {
                None
            }
            fn drop_completed_request(&mut self, _req: &Request) -> Result<(), ProtocolError> {
                Err(ProtocolError::NotComplete {
                    module: "idle",
                    id: 0,
                })
            }
            fn peek_generated_request(&self) -> Option<Request> {
                None
            }
            fn drop_generated_request(&mut self, _req: &Request) -> Result<(), ProtocolError> {
                Err(ProtocolError::NoGeneratedRequest {
                    module: "idle",
                    id: 0,
                })
            }
            fn generated_request_complete(&mut self, _req: Request) -> Result<(), ProtocolError> {
                Err(ProtocolError::UnexpectedCompletion {
                    module: "idle",
                    id: 0,
                    detail: "idle module",
                })
            }
        }

        let mut composition = Composition::new();
        composition
            .add_module(ModuleId::BlockIo, Box::new(Idle))
            .expect("first registration");
        assert_eq!(
            composition.add_module(ModuleId::BlockIo, Box::new(Idle)),
            Err(ProtocolError::ModuleAlreadyRegistered { module: "block_io" })
        );

        assert!(composition.module(ModuleId::BlockIo).is_some());
        composition.remove_module(ModuleId::BlockIo).expect("remove");
        assert!(composition.module(ModuleId::BlockIo).is_none());
        assert!(composition.remove_module(ModuleId::BlockIo).is_err());
    }

    #[test]
    fn idle_composition_reports_no_progress() {
        let mut composition = Composition::new();
        assert_eq!(composition.execute_modules(), Ok(false));
    }
}
