#![forbid(unsafe_code)]
//! Free-Tree Checker module.
//!
//! Verifies the integrity of a copy-on-write tree (free tree or meta tree)
//! top-down: every reachable node block is fetched through a generated Block
//! I/O read, its SHA-256 hash is recomputed and compared against the hash
//! stored in the parent, and every leaf's usage state is counted against the
//! leaf total declared by the caller. The first discrepancy fails the whole
//! request; there is no partial continuation.
//!
//! Level numbering follows the on-disk tree: the Type-2 leaf level is
//! level 1, Type-1 inner levels run from [`LOWEST_T1_LEVEL`] up to the
//! request's `max_level`, and the root node — carried in the request, not
//! read from disk — sits alone above `max_level`. Reading a node's block
//! populates the level below it and re-arms that level's child states, so
//! the walk proceeds depth-first with at most one block in flight per
//! channel.

use tresor_error::ProtocolError;
use tresor_module::{BlockIoRequest, CheckRequest, Module, ModuleId, Request, RequestId};
use tresor_types::{
    check_sha256_4k_hash, Block, Pba, Type1Node, Type2Node, INITIAL_GENERATION, LOWEST_T1_LEVEL,
    NR_OF_T1_NODES_PER_BLK, NR_OF_T2_NODES_PER_BLK, TREE_MAX_NR_OF_LEVELS,
};

const MODULE_NAME: &str = "ft_check";

/// Number of request channels of the checker.
pub const NR_OF_CHANNELS: usize = 1;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ChildState {
    ReadBlock,
    CheckHash,
    #[default]
    Done,
}

/// One Type-1 level of the walk: the raw block last read for this level and
/// the per-child progress. Hash checks run over the raw bytes; nodes are
/// decoded on access.
struct Type1Level {
    states: [ChildState; NR_OF_T1_NODES_PER_BLK],
    block: Block,
}

impl Default for Type1Level {
    fn default() -> Self {
        Self {
            states: [ChildState::Done; NR_OF_T1_NODES_PER_BLK],
            block: Block::ZERO,
        }
    }
}

/// The Type-2 leaf level of the walk.
struct Type2Level {
    states: [ChildState; NR_OF_T2_NODES_PER_BLK],
    block: Block,
}

impl Default for Type2Level {
    fn default() -> Self {
        Self {
            states: [ChildState::Done; NR_OF_T2_NODES_PER_BLK],
            block: Block::ZERO,
        }
    }
}

/// The channel's one outstanding generated Block I/O read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GeneratedPrimitive {
    pba: Pba,
    dropped: bool,
    completed: bool,
    success: bool,
}

struct Channel {
    request: Option<CheckRequest>,
    root_state: ChildState,
    leaf_level: Type2Level,
    inner_levels: [Type1Level; TREE_MAX_NR_OF_LEVELS],
    nr_of_leaves: u64,
    lvl_to_read: u32,
    gen_prim: Option<GeneratedPrimitive>,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            request: None,
            root_state: ChildState::Done,
            leaf_level: Type2Level::default(),
            inner_levels: std::array::from_fn(|_| Type1Level::default()),
            nr_of_leaves: 0,
            lvl_to_read: 0,
            gen_prim: None,
        }
    }
}

/// Free-Tree Checker: walks a tree root-down, verifying hashes and leaf
/// usage against the declared shape.
#[derive(Default)]
pub struct FtCheck {
    channels: [Channel; NR_OF_CHANNELS],
}

impl FtCheck {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mark_req_failed(channel: &mut Channel, progress: &mut bool, step: &str) {
        if let Some(req) = channel.request.as_mut() {
            tracing::error!(
                target: "tresor::ft_check",
                request = %req,
                step,
                "request_failed"
            );
            req.success = false;
        }
        channel.root_state = ChildState::Done;
        *progress = true;
    }

    fn execute_leaf_child(channel: &mut Channel, child_idx: usize, progress: &mut bool) {
        if channel.leaf_level.states[child_idx] != ChildState::ReadBlock {
            return;
        }
        let child = Type2Node::read_from(&channel.leaf_level.block, child_idx);

        if channel.nr_of_leaves == 0 {
            if child.valid() {
                tracing::trace!(
                    target: "tresor::ft_check",
                    lvl = 1,
                    child = child_idx,
                    "leaf unexpectedly in use"
                );
                Self::mark_req_failed(channel, progress, "check for unused leaf");
            } else {
                channel.leaf_level.states[child_idx] = ChildState::Done;
                *progress = true;
                tracing::trace!(
                    target: "tresor::ft_check",
                    lvl = 1,
                    child = child_idx,
                    "leaf unused"
                );
            }
        } else if child.valid() {
            channel.nr_of_leaves -= 1;
            channel.leaf_level.states[child_idx] = ChildState::Done;
            *progress = true;
            tracing::trace!(
                target: "tresor::ft_check",
                lvl = 1,
                child = child_idx,
                leaves_left = channel.nr_of_leaves,
                "leaf done"
            );
        } else {
            tracing::trace!(
                target: "tresor::ft_check",
                lvl = 1,
                child = child_idx,
                "leaf unexpectedly unused"
            );
            Self::mark_req_failed(channel, progress, "check for used leaf");
        }
    }

    /// Advance one inner child (or the root when `is_root`). `lvl` is the
    /// child's own level; its block, once read, populates level `lvl - 1`.
    fn execute_inner_child(
        channel: &mut Channel,
        child: Type1Node,
        lvl: u32,
        child_idx: usize,
        is_root: bool,
        progress: &mut bool,
    ) {
        let state = if is_root {
            channel.root_state
        } else {
            channel.inner_levels[lvl as usize].states[child_idx]
        };

        match state {
            ChildState::ReadBlock => {
                if !child.valid() {
                    if channel.nr_of_leaves == 0 {
                        Self::set_child_state(channel, lvl, child_idx, is_root, ChildState::Done);
                        *progress = true;
                        tracing::trace!(
                            target: "tresor::ft_check",
                            lvl,
                            child = child_idx,
                            "child unused"
                        );
                    } else {
                        tracing::trace!(
                            target: "tresor::ft_check",
                            lvl,
                            child = child_idx,
                            "child unexpectedly unused"
                        );
                        Self::mark_req_failed(channel, progress, "check for valid child");
                    }
                } else if channel.gen_prim.is_none() {
                    channel.gen_prim = Some(GeneratedPrimitive {
                        pba: child.pba,
                        dropped: false,
                        completed: false,
                        success: false,
                    });
                    channel.lvl_to_read = lvl - 1;
                    *progress = true;
                    tracing::trace!(
                        target: "tresor::ft_check",
                        lvl,
                        child = child_idx,
                        pba = child.pba.0,
                        load_to_lvl = lvl - 1,
                        "load child block"
                    );
                } else if let Some(prim) = channel.gen_prim {
                    // Completion-side guard already rejected mismatched
                    // reads; an uncompleted primitive is simply outstanding.
                    if !prim.completed {
                        return;
                    }
                    if !prim.success {
                        Self::mark_req_failed(channel, progress, "read node block");
                        return;
                    }
                    Self::rearm_level_below(channel, lvl);
                    channel.gen_prim = None;
                    Self::set_child_state(channel, lvl, child_idx, is_root, ChildState::CheckHash);
                    *progress = true;
                }
            }
            ChildState::CheckHash => {
                let block_below = if lvl == LOWEST_T1_LEVEL {
                    &channel.leaf_level.block
                } else {
                    &channel.inner_levels[lvl as usize - 1].block
                };
                if child.gen == INITIAL_GENERATION || check_sha256_4k_hash(block_below, &child.hash)
                {
                    tracing::trace!(
                        target: "tresor::ft_check",
                        lvl,
                        child = child_idx,
                        "good hash"
                    );
                    if is_root {
                        if channel.nr_of_leaves == 0 {
                            if let Some(req) = channel.request.as_mut() {
                                req.success = true;
                            }
                            channel.root_state = ChildState::Done;
                            *progress = true;
                        } else {
                            Self::mark_req_failed(channel, progress, "check leaf count");
                        }
                    } else {
                        channel.inner_levels[lvl as usize].states[child_idx] = ChildState::Done;
                        *progress = true;
                    }
                } else {
                    tracing::trace!(
                        target: "tresor::ft_check",
                        lvl,
                        child = child_idx,
                        "bad hash"
                    );
                    Self::mark_req_failed(channel, progress, "check inner hash");
                }
            }
            ChildState::Done => {}
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
            channel.inner_levels[lvl as usize].states[child_idx] = state;
        }
    }

    /// Re-arm every child of the level a fresh block was just read into.
    fn rearm_level_below(channel: &mut Channel, lvl: u32) {
        if lvl == LOWEST_T1_LEVEL {
            channel.leaf_level.states = [ChildState::ReadBlock; NR_OF_T2_NODES_PER_BLK];
        } else {
            channel.inner_levels[lvl as usize - 1].states =
                [ChildState::ReadBlock; NR_OF_T1_NODES_PER_BLK];
        }
    }

    /// One step of the walk: leaves first, then inner levels innermost to
    /// outermost, then the root.
    fn execute_check(channel: &mut Channel, progress: &mut bool) {
        let Some((max_level, max_child_idx, root)) = channel
            .request
            .as_ref()
            .map(|req| (req.shape.max_level(), req.shape.max_child_idx(), req.root))
        else {
            return;
        };

        for child_idx in 0..=max_child_idx {
            if channel.leaf_level.states[child_idx] != ChildState::Done {
                Self::execute_leaf_child(channel, child_idx, progress);
                return;
            }
        }
        for lvl in LOWEST_T1_LEVEL..=max_level {
            for child_idx in 0..=max_child_idx {
                if channel.inner_levels[lvl as usize].states[child_idx] != ChildState::Done {
                    let child =
                        Type1Node::read_from(&channel.inner_levels[lvl as usize].block, child_idx);
                    Self::execute_inner_child(channel, child, lvl, child_idx, false, progress);
                    return;
                }
            }
        }
        if channel.root_state != ChildState::Done {
            Self::execute_inner_child(channel, root, max_level + 1, 0, true, progress);
        }
    }
}

impl Module for FtCheck {
    fn ready_to_submit_request(&self) -> bool {
        self.channels.iter().any(|channel| channel.request.is_none())
    }

    fn submit_request(&mut self, req: Request) -> Result<(), ProtocolError> {
        let Request::Check(mut req) = req else {
            return Err(ProtocolError::WrongModule {
                expected: MODULE_NAME,
                got: req.envelope().dst.name(),
            });
        };
        for (id, channel) in self.channels.iter_mut().enumerate() {
            if channel.request.is_none() {
                req.env.dst_request_id = RequestId(id as u64);
                *channel = Channel {
                    nr_of_leaves: req.shape.nr_of_leaves(),
                    root_state: ChildState::ReadBlock,
                    request: Some(req),
                    ..Channel::default()
                };
                return Ok(());
            }
        }
        Err(ProtocolError::NoFreeChannel {
            module: MODULE_NAME,
        })
    }

    fn execute(&mut self, progress: &mut bool) {
        for channel in &mut self.channels {
            if channel.request.is_none() || channel.root_state == ChildState::Done {
                continue;
            }
            Self::execute_check(channel, progress);
        }
    }

    fn peek_completed_request(&self) -> Option<Request> {
        self.channels
            .iter()
            .filter(|channel| channel.root_state == ChildState::Done)
            .find_map(|channel| channel.request.clone().map(Request::Check))
    }

    fn drop_completed_request(&mut self, req: &Request) -> Result<(), ProtocolError> {
        let id = req.envelope().dst_request_id.0;
        let channel = self.channels.get_mut(id as usize).ok_or(
            ProtocolError::UnknownChannel {
                module: MODULE_NAME,
                id,
            },
        )?;
        if channel.request.is_none() || channel.root_state != ChildState::Done {
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
            if let Some(prim) = channel.gen_prim {
                if !prim.dropped {
                    return Some(Request::BlockIo(BlockIoRequest::read(
                        ModuleId::FtCheck,
                        RequestId(id as u64),
                        prim.pba,
                    )));
                }
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
        match channel.gen_prim.as_mut() {
            Some(prim) if !prim.dropped => {
                prim.dropped = true;
                Ok(())
            }
            _ => Err(ProtocolError::NoGeneratedRequest {
                module: MODULE_NAME,
                id,
            }),
        }
    }

    fn generated_request_complete(&mut self, req: Request) -> Result<(), ProtocolError> {
        let Request::BlockIo(req) = req else {
            return Err(ProtocolError::UnexpectedCompletion {
                module: MODULE_NAME,
                id: req.envelope().src_request_id.0,
                detail: "completion is not a block I/O request",
            });
        };
        let id = req.env.src_request_id.0;
        let channel = self.channels.get_mut(id as usize).ok_or(
            ProtocolError::UnknownChannel {
                module: MODULE_NAME,
                id,
            },
        )?;
        let Some(prim) = channel.gen_prim.as_mut() else {
            return Err(ProtocolError::UnexpectedCompletion {
                module: MODULE_NAME,
                id,
                detail: "no read outstanding",
            });
        };
        if !prim.dropped || prim.completed {
            return Err(ProtocolError::UnexpectedCompletion {
                module: MODULE_NAME,
                id,
                detail: "read not in flight",
            });
        }
        // Hard invariant: a completion is honored only for the read it was
        // requested for.
        if req.pba != prim.pba {
            return Err(ProtocolError::UnexpectedCompletion {
                module: MODULE_NAME,
                id,
                detail: "pba does not match outstanding read",
            });
        }
        prim.completed = true;
        prim.success = req.success;
        if req.success {
            let target = if channel.lvl_to_read == 1 {
                &mut channel.leaf_level.block
            } else {
                &mut channel.inner_levels[channel.lvl_to_read as usize].block
            };
            target.as_bytes_mut().copy_from_slice(req.block.as_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tresor_module::CheckRequest;
    use tresor_types::{
        sha256_4k_hash, Generation, TreeShape, Type1NodeBlock, Type2NodeBlock, BLOCK_SIZE,
    };

    /// Serve generated reads from a block map until the request completes.
    fn drive(check: &mut FtCheck, store: &HashMap<u64, Block>) -> CheckRequest {
        loop {
            let mut progress = false;
            check.execute(&mut progress);

            if let Some(generated) = check.peek_generated_request() {
                check.drop_generated_request(&generated).expect("drop generated");
                let Request::BlockIo(mut io) = generated else {
                    panic!("checker generated a non-I/O request");
                };
                match store.get(&io.pba.0) {
                    Some(block) => {
                        io.block = Box::new(block.clone());
                        io.success = true;
                    }
                    None => io.success = false,
                }
                check
                    .generated_request_complete(Request::BlockIo(io))
                    .expect("deliver completion");
                progress = true;
            }

            if let Some(completed) = check.peek_completed_request() {
                check.drop_completed_request(&completed).expect("drop completed");
                let Request::Check(req) = completed else {
                    panic!("unexpected completion kind");
                };
                return req;
            }
            assert!(progress, "checker stalled without completing");
        }
    }

    struct TestTree {
        store: HashMap<u64, Block>,
        root: Type1Node,
        shape: TreeShape,
    }

    /// Hand-build a two-level tree: one inner block at PBA 100 holding
    /// `leaf_blocks` entries, each pointing at a leaf block with
    /// `leaves_per_block` used leaves.
    fn build_two_level_tree(leaf_blocks: usize, leaves_per_block: usize) -> TestTree {
        let gen = Generation(5);
        let mut store = HashMap::new();
        let mut inner = Type1NodeBlock::ZERO;

        for blk_idx in 0..leaf_blocks {
            let mut leaf = Type2NodeBlock::ZERO;
            for leaf_idx in 0..leaves_per_block {
                leaf.nodes[leaf_idx].pba = Pba(1000 + (blk_idx * 64 + leaf_idx) as u64);
            }
            let block = leaf.to_block();
            let pba = 200 + blk_idx as u64;
            inner.nodes[blk_idx] = Type1Node {
                pba: Pba(pba),
                gen,
                hash: sha256_4k_hash(&block),
            };
            store.insert(pba, block);
        }

        let inner_block = inner.to_block();
        store.insert(100, inner_block.clone());
        let root = Type1Node {
            pba: Pba(100),
            gen,
            hash: sha256_4k_hash(&inner_block),
        };
        let shape = TreeShape::new(2, 63, (leaf_blocks * leaves_per_block) as u64).expect("shape");
        TestTree { store, root, shape }
    }

    fn submit(check: &mut FtCheck, shape: TreeShape, root: Type1Node) {
        check
            .submit_request(Request::Check(CheckRequest::check(
                ModuleId::Client,
                RequestId(0),
                shape,
                root,
            )))
            .expect("submit check");
    }

    #[test]
    fn sound_tree_passes() {
        let tree = build_two_level_tree(2, 64);
        let mut check = FtCheck::new();
        submit(&mut check, tree.shape, tree.root);
        assert!(drive(&mut check, &tree.store).success);
    }

    #[test]
    fn partially_filled_leaf_block_passes() {
        let tree = build_two_level_tree(1, 17);
        let mut check = FtCheck::new();
        submit(&mut check, tree.shape, tree.root);
        assert!(drive(&mut check, &tree.store).success);
    }

    #[test]
    fn three_level_tree_passes() {
        let gen = Generation(9);
        let mut store = HashMap::new();

        let mut leaf = Type2NodeBlock::ZERO;
        leaf.nodes[0].pba = Pba(1000);
        let leaf_block = leaf.to_block();
        store.insert(300, leaf_block.clone());

        let mut lvl2 = Type1NodeBlock::ZERO;
        lvl2.nodes[0] = Type1Node {
            pba: Pba(300),
            gen,
            hash: sha256_4k_hash(&leaf_block),
        };
        let lvl2_block = lvl2.to_block();
        store.insert(200, lvl2_block.clone());

        let mut lvl3 = Type1NodeBlock::ZERO;
        lvl3.nodes[0] = Type1Node {
            pba: Pba(200),
            gen,
            hash: sha256_4k_hash(&lvl2_block),
        };
        let lvl3_block = lvl3.to_block();
        store.insert(100, lvl3_block.clone());

        let root = Type1Node {
            pba: Pba(100),
            gen,
            hash: sha256_4k_hash(&lvl3_block),
        };
        let shape = TreeShape::new(3, 63, 1).expect("shape");

        let mut check = FtCheck::new();
        submit(&mut check, shape, root);
        assert!(drive(&mut check, &store).success);
    }

    #[test]
    fn corrupted_stored_hash_fails() {
        let mut tree = build_two_level_tree(2, 64);
        // Flip one bit of the first leaf-block hash stored in the inner
        // block, and re-hash the inner block so only the deep level is bad.
        let inner_block = tree.store.get_mut(&100).expect("inner block");
        inner_block.as_bytes_mut()[16] ^= 0x01;
        tree.root.hash = sha256_4k_hash(inner_block);

        let mut check = FtCheck::new();
        submit(&mut check, tree.shape, tree.root);
        assert!(!drive(&mut check, &tree.store).success);
    }

    #[test]
    fn corrupted_root_hash_fails() {
        let mut tree = build_two_level_tree(1, 64);
        tree.root.hash.0[0] ^= 0x80;

        let mut check = FtCheck::new();
        submit(&mut check, tree.shape, tree.root);
        assert!(!drive(&mut check, &tree.store).success);
    }

    #[test]
    fn initial_generation_skips_hash_check() {
        let mut tree = build_two_level_tree(1, 64);
        // Declare the inner child never-written: generation 0 with a bogus
        // hash must be accepted without a hash comparison.
        let inner_block = tree.store.get_mut(&100).expect("inner block");
        let mut child = Type1Node::read_from(inner_block, 0);
        child.gen = Generation(0);
        child.hash = tresor_types::TresorHash([0xFF; 32]);
        child.write_to(inner_block, 0);
        tree.root.hash = sha256_4k_hash(inner_block);

        let mut check = FtCheck::new();
        submit(&mut check, tree.shape, tree.root);
        assert!(drive(&mut check, &tree.store).success);
    }

    #[test]
    fn declared_leaf_count_too_high_fails() {
        let tree = build_two_level_tree(1, 17);
        let shape = TreeShape::new(2, 63, 18).expect("shape");
        let mut check = FtCheck::new();
        submit(&mut check, shape, tree.root);
        assert!(!drive(&mut check, &tree.store).success);
    }

    #[test]
    fn declared_leaf_count_too_low_fails() {
        let tree = build_two_level_tree(1, 17);
        let shape = TreeShape::new(2, 63, 16).expect("shape");
        let mut check = FtCheck::new();
        submit(&mut check, shape, tree.root);
        assert!(!drive(&mut check, &tree.store).success);
    }

    #[test]
    fn failed_block_read_fails_the_request() {
        let mut tree = build_two_level_tree(1, 64);
        // Drop the leaf block from the store; its read completes
        // unsuccessfully.
        tree.store.remove(&200);

        let mut check = FtCheck::new();
        submit(&mut check, tree.shape, tree.root);
        assert!(!drive(&mut check, &tree.store).success);
    }

    #[test]
    fn mismatched_completion_is_a_protocol_error() {
        let tree = build_two_level_tree(1, 64);
        let mut check = FtCheck::new();
        submit(&mut check, tree.shape, tree.root);

        let mut progress = false;
        check.execute(&mut progress);
        let generated = check.peek_generated_request().expect("generated read");
        check.drop_generated_request(&generated).expect("drop generated");

        // Answer with a completion for a different block.
        let mut stale = BlockIoRequest::read(ModuleId::FtCheck, RequestId(0), Pba(0xDEAD));
        stale.success = true;
        assert_eq!(
            check.generated_request_complete(Request::BlockIo(stale)),
            Err(ProtocolError::UnexpectedCompletion {
                module: "ft_check",
                id: 0,
                detail: "pba does not match outstanding read",
            })
        );
    }

    #[test]
    fn completion_without_outstanding_read_is_rejected() {
        let mut check = FtCheck::new();
        let io = BlockIoRequest::read(ModuleId::FtCheck, RequestId(0), Pba(1));
        assert!(matches!(
            check.generated_request_complete(Request::BlockIo(io)),
            Err(ProtocolError::UnexpectedCompletion { .. })
        ));
    }

    #[test]
    fn channel_discipline() {
        let tree = build_two_level_tree(1, 64);
        let mut check = FtCheck::new();
        assert!(check.ready_to_submit_request());
        submit(&mut check, tree.shape, tree.root);
        assert!(!check.ready_to_submit_request());

        assert_eq!(
            check.submit_request(Request::Check(CheckRequest::check(
                ModuleId::Client,
                RequestId(1),
                tree.shape,
                tree.root,
            ))),
            Err(ProtocolError::NoFreeChannel { module: "ft_check" })
        );

        let mut in_flight = CheckRequest::check(ModuleId::Client, RequestId(0), tree.shape, tree.root);
        in_flight.env.dst_request_id = RequestId(0);
        assert_eq!(
            check.drop_completed_request(&Request::Check(in_flight)),
            Err(ProtocolError::NotComplete {
                module: "ft_check",
                id: 0
            })
        );
    }

    #[test]
    fn generated_read_targets_the_root_block_first() {
        let tree = build_two_level_tree(1, 64);
        let mut check = FtCheck::new();
        submit(&mut check, tree.shape, tree.root);

        let mut progress = false;
        check.execute(&mut progress);
        assert!(progress);

        let generated = check.peek_generated_request().expect("generated read");
        let Request::BlockIo(io) = &generated else {
            panic!("expected a block I/O read");
        };
        assert_eq!(io.pba, Pba(100));
        assert_eq!(io.blk_count, 1);
        assert_eq!(io.block.as_bytes().len(), BLOCK_SIZE);
    }
}
