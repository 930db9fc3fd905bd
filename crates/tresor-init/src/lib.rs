#![forbid(unsafe_code)]
//! VBD Initializer module.
//!
//! Builds a fresh virtual-block-device tree bottom-up: leaf entries receive
//! freshly allocated physical addresses (generated Block Allocator `GET`s),
//! inner node blocks are hashed and persisted (generated Block I/O `WRITE`s)
//! once the level beneath them is complete, and the root node — address,
//! generation, hash of the top-level block — is returned in the request.
//!
//! Leaf entries are recorded with the initial generation: their data blocks
//! are allocated but never written, so a later integrity check expects no
//! hash for them. Inner nodes and the root carry the generation given in
//! the request.

use tresor_error::ProtocolError;
use tresor_module::{
    AllocRequest, BlockIoRequest, InitRequest, Module, ModuleId, Request, RequestId,
};
use tresor_types::{
    sha256_4k_hash, Block, Pba, Type1Node, NR_OF_T1_NODES_PER_BLK, TREE_MAX_NR_OF_LEVELS,
};

const MODULE_NAME: &str = "vbd_initializer";

/// Number of request channels of the initializer.
pub const NR_OF_CHANNELS: usize = 1;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    #[default]
    Inactive,
    Submitted,
    Pending,
    InProgress,
    Complete,
    BlockAllocPending,
    BlockAllocInProgress,
    BlockAllocComplete,
    BlockIoPending,
    BlockIoInProgress,
    BlockIoComplete,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ChildState {
    #[default]
    Done,
    InitBlock,
    InitNode,
    WriteBlock,
}

/// One level of node records under construction. Level 1 holds the leaf
/// entries; levels above it hold inner nodes.
struct NodeLevel {
    nodes: [Type1Node; NR_OF_T1_NODES_PER_BLK],
    states: [ChildState; NR_OF_T1_NODES_PER_BLK],
}

impl NodeLevel {
    fn reset(&mut self, state: ChildState) {
        self.nodes = [Type1Node::ZERO; NR_OF_T1_NODES_PER_BLK];
        self.states = [state; NR_OF_T1_NODES_PER_BLK];
    }

    fn to_block(&self) -> Block {
        let mut block = Block::ZERO;
        for (idx, node) in self.nodes.iter().enumerate() {
            node.write_to(&mut block, idx);
        }
        block
    }
}

impl Default for NodeLevel {
    fn default() -> Self {
        Self {
            nodes: [Type1Node::ZERO; NR_OF_T1_NODES_PER_BLK],
            states: [ChildState::Done; NR_OF_T1_NODES_PER_BLK],
        }
    }
}

struct Channel {
    state: State,
    request: Option<InitRequest>,
    root_node: Type1Node,
    root_state: ChildState,
    levels: [NodeLevel; TREE_MAX_NR_OF_LEVELS],
    nr_of_leaves: u64,
    level_to_write: u32,
    child_pba: Pba,
    blk_nr: Pba,
    generated_req_success: bool,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            state: State::Inactive,
            request: None,
            root_node: Type1Node::ZERO,
            root_state: ChildState::Done,
            levels: std::array::from_fn(|_| NodeLevel::default()),
            nr_of_leaves: 0,
            level_to_write: 0,
            child_pba: Pba(0),
            blk_nr: Pba(0),
            generated_req_success: false,
        }
    }
}

/// VBD Initializer: constructs a tree of the requested shape bottom-up.
#[derive(Default)]
pub struct VbdInitializer {
    channels: [Channel; NR_OF_CHANNELS],
}

impl VbdInitializer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mark_req_failed(channel: &mut Channel, progress: &mut bool, step: &str) {
        if let Some(req) = channel.request.as_mut() {
            tracing::error!(
                target: "tresor::vbd_initializer",
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
            req.root = channel.root_node;
            req.success = true;
        }
        channel.state = State::Complete;
        *progress = true;
    }

    fn execute_leaf_child(channel: &mut Channel, child_idx: usize, progress: &mut bool) {
        match channel.levels[1].states[child_idx] {
            ChildState::InitBlock => {
                channel.levels[1].states[child_idx] = ChildState::InitNode;
                *progress = true;
            }
            ChildState::InitNode => {
                if channel.nr_of_leaves == 0 {
                    channel.levels[1].nodes[child_idx] = Type1Node::ZERO;
                    channel.levels[1].states[child_idx] = ChildState::Done;
                    *progress = true;
                    tracing::trace!(
                        target: "tresor::vbd_initializer",
                        lvl = 1,
                        child = child_idx,
                        "leaf unused"
                    );
                    return;
                }
                match channel.state {
                    State::InProgress => {
                        channel.state = State::BlockAllocPending;
                        *progress = true;
                    }
                    State::BlockAllocComplete => {
                        if !channel.generated_req_success {
                            Self::mark_req_failed(channel, progress, "allocate leaf block");
                            return;
                        }
                        channel.state = State::InProgress;
                        channel.levels[1].nodes[child_idx] = Type1Node {
                            pba: channel.blk_nr,
                            ..Type1Node::ZERO
                        };
                        channel.levels[1].states[child_idx] = ChildState::Done;
                        channel.nr_of_leaves -= 1;
                        *progress = true;
                        tracing::trace!(
                            target: "tresor::vbd_initializer",
                            lvl = 1,
                            child = child_idx,
                            pba = channel.blk_nr.0,
                            leaves_left = channel.nr_of_leaves,
                            "leaf assigned"
                        );
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    /// Advance one inner child (or the root when `is_root`). `lvl` is the
    /// child's own level; the block it persists is level `lvl - 1`.
    fn execute_inner_child(
        channel: &mut Channel,
        lvl: u32,
        child_idx: usize,
        is_root: bool,
        progress: &mut bool,
    ) {
        let state = if is_root {
            channel.root_state
        } else {
            channel.levels[lvl as usize].states[child_idx]
        };
        let generation = channel
            .request
            .as_ref()
            .map(|req| req.generation)
            .unwrap_or_default();

        match state {
            ChildState::InitBlock => {
                if channel.nr_of_leaves == 0 {
                    Self::set_child(channel, lvl, child_idx, is_root, Type1Node::ZERO);
                    Self::set_child_state(channel, lvl, child_idx, is_root, ChildState::Done);
                    *progress = true;
                    tracing::trace!(
                        target: "tresor::vbd_initializer",
                        lvl,
                        child = child_idx,
                        "inner node unused"
                    );
                } else {
                    channel.levels[lvl as usize - 1].reset(ChildState::InitBlock);
                    Self::set_child_state(channel, lvl, child_idx, is_root, ChildState::InitNode);
                    *progress = true;
                    tracing::trace!(
                        target: "tresor::vbd_initializer",
                        lvl,
                        child = child_idx,
                        reset_lvl = lvl - 1,
                        "descend"
                    );
                }
            }
            ChildState::InitNode => match channel.state {
                State::InProgress => {
                    channel.state = State::BlockAllocPending;
                    *progress = true;
                }
                State::BlockAllocComplete => {
                    if !channel.generated_req_success {
                        Self::mark_req_failed(channel, progress, "allocate inner block");
                        return;
                    }
                    channel.state = State::InProgress;
                    let node = Type1Node {
                        pba: channel.blk_nr,
                        gen: generation,
                        hash: sha256_4k_hash(&channel.levels[lvl as usize - 1].to_block()),
                    };
                    Self::set_child(channel, lvl, child_idx, is_root, node);
                    Self::set_child_state(channel, lvl, child_idx, is_root, ChildState::WriteBlock);
                    *progress = true;
                    tracing::trace!(
                        target: "tresor::vbd_initializer",
                        lvl,
                        child = child_idx,
                        pba = channel.blk_nr.0,
                        "inner node assigned"
                    );
                }
                _ => {}
            },
            ChildState::WriteBlock => match channel.state {
                State::InProgress => {
                    channel.state = State::BlockIoPending;
                    channel.child_pba = if is_root {
                        channel.root_node.pba
                    } else {
                        channel.levels[lvl as usize].nodes[child_idx].pba
                    };
                    channel.level_to_write = lvl - 1;
                    *progress = true;
                }
                State::BlockIoComplete => {
                    if !channel.generated_req_success {
                        Self::mark_req_failed(channel, progress, "write node block");
                        return;
                    }
                    channel.state = State::InProgress;
                    Self::set_child_state(channel, lvl, child_idx, is_root, ChildState::Done);
                    *progress = true;
                    tracing::trace!(
                        target: "tresor::vbd_initializer",
                        lvl,
                        child = child_idx,
                        pba = channel.child_pba.0,
                        write_lvl = lvl - 1,
                        "node block written"
                    );
                }
                _ => {}
            },
            ChildState::Done => {}
        }
    }

    fn set_child(channel: &mut Channel, lvl: u32, child_idx: usize, is_root: bool, node: Type1Node) {
        if is_root {
            channel.root_node = node;
        } else {
            channel.levels[lvl as usize].nodes[child_idx] = node;
        }
    }

    fn set_child_state(
        channel: &mut Channel,
        lvl: u32,
        child_idx: usize,
        is_root: bool,
        state: ChildState,
    ) {
        if is_root {
            channel.root_state = state;
        } else {
            channel.levels[lvl as usize].states[child_idx] = state;
        }
    }

    /// One step of the construction: lowest unfinished level first, then the
    /// root, then the final budget check.
    fn execute_tree(channel: &mut Channel, progress: &mut bool) {
        let Some((max_level, max_child_idx)) = channel
            .request
            .as_ref()
            .map(|req| (req.shape.max_level(), req.shape.max_child_idx()))
        else {
            return;
        };

        for lvl in 1..=max_level {
            for child_idx in 0..=max_child_idx {
                if channel.levels[lvl as usize].states[child_idx] != ChildState::Done {
                    if lvl == 1 {
                        Self::execute_leaf_child(channel, child_idx, progress);
                    } else {
                        Self::execute_inner_child(channel, lvl, child_idx, false, progress);
                    }
                    return;
                }
            }
        }

        if channel.root_state != ChildState::Done {
            Self::execute_inner_child(channel, max_level + 1, 0, true, progress);
            return;
        }

        if channel.nr_of_leaves == 0 {
            Self::mark_req_successful(channel, progress);
        } else {
            Self::mark_req_failed(channel, progress, "initialize tree");
        }
    }

    fn execute_init(channel: &mut Channel, progress: &mut bool) {
        match channel.state {
            State::Submitted => {
                for level in &mut channel.levels {
                    level.reset(ChildState::Done);
                }
                channel.level_to_write = 0;
                channel.root_node = Type1Node::ZERO;
                channel.root_state = ChildState::InitBlock;
                channel.state = State::Pending;
                *progress = true;
            }
            State::Pending => {
                channel.state = State::InProgress;
                *progress = true;
            }
            State::InProgress | State::BlockAllocComplete | State::BlockIoComplete => {
                Self::execute_tree(channel, progress);
            }
            // Alloc and I/O sub-states in flight are advanced through the
            // module API, not here.
            _ => {}
        }
    }
}

impl Module for VbdInitializer {
    fn ready_to_submit_request(&self) -> bool {
        self.channels
            .iter()
            .any(|channel| channel.state == State::Inactive)
    }

    fn submit_request(&mut self, req: Request) -> Result<(), ProtocolError> {
        let Request::Init(mut req) = req else {
            return Err(ProtocolError::WrongModule {
                expected: MODULE_NAME,
                got: req.envelope().dst.name(),
            });
        };
        for (id, channel) in self.channels.iter_mut().enumerate() {
            if channel.state == State::Inactive {
                req.env.dst_request_id = RequestId(id as u64);
                channel.nr_of_leaves = req.shape.nr_of_leaves();
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
        for channel in &mut self.channels {
            if channel.state == State::Inactive || channel.state == State::Complete {
                continue;
            }
            Self::execute_init(channel, progress);
        }
    }

    fn peek_completed_request(&self) -> Option<Request> {
        self.channels
            .iter()
            .filter(|channel| channel.state == State::Complete)
            .find_map(|channel| channel.request.clone().map(Request::Init))
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
        for (id, channel) in self.channels.iter().enumerate() {
            match channel.state {
                State::BlockAllocPending => {
                    return Some(Request::Alloc(AllocRequest::get(
                        ModuleId::VbdInitializer,
                        RequestId(id as u64),
                    )));
                }
                State::BlockIoPending => {
                    let block =
                        Box::new(channel.levels[channel.level_to_write as usize].to_block());
                    return Some(Request::BlockIo(BlockIoRequest::write(
                        ModuleId::VbdInitializer,
                        RequestId(id as u64),
                        channel.child_pba,
                        block,
                    )));
                }
                _ => {}
            }
        }
        None
    }

    fn drop_generated_request(&mut self, req: &Request) -> Result<(), ProtocolError> {
        let id = req.envelope().src_request_id.0;
        let channel = self.channels.get_mut(id as usize).ok_or(
            ProtocolError::UnknownChannel {
                module: MODULE_NAME,
                id,
            },
        )?;
        match channel.state {
            State::BlockAllocPending => {
                channel.state = State::BlockAllocInProgress;
                Ok(())
            }
            State::BlockIoPending => {
                channel.state = State::BlockIoInProgress;
                Ok(())
            }
            _ => Err(ProtocolError::NoGeneratedRequest {
                module: MODULE_NAME,
                id,
            }),
        }
    }

    fn generated_request_complete(&mut self, req: Request) -> Result<(), ProtocolError> {
        let id = req.envelope().src_request_id.0;
        let channel = self.channels.get_mut(id as usize).ok_or(
            ProtocolError::UnknownChannel {
                module: MODULE_NAME,
                id,
            },
        )?;
        match req {
            Request::Alloc(alloc) => {
                if channel.state != State::BlockAllocInProgress {
                    return Err(ProtocolError::UnexpectedCompletion {
                        module: MODULE_NAME,
                        id,
                        detail: "no allocation in flight",
                    });
                }
                channel.state = State::BlockAllocComplete;
                channel.blk_nr = alloc.blk_nr;
                channel.generated_req_success = alloc.success;
                Ok(())
            }
            Request::BlockIo(io) => {
                if channel.state != State::BlockIoInProgress {
                    return Err(ProtocolError::UnexpectedCompletion {
                        module: MODULE_NAME,
                        id,
                        detail: "no write in flight",
                    });
                }
                channel.state = State::BlockIoComplete;
                channel.generated_req_success = io.success;
                Ok(())
            }
            _ => Err(ProtocolError::UnexpectedCompletion {
                module: MODULE_NAME,
                id,
                detail: "completion is neither allocation nor block I/O",
            }),
        }
    }
}
