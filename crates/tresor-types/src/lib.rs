#![forbid(unsafe_code)]
//! Core value types for the Tresor block-storage engine.
//!
//! Everything at this layer is a plain value: block addresses, generation
//! counters, 64-byte tree-node records and their little-endian codecs, the
//! 4096-byte block buffer, and the SHA-256 4K-block hash helpers. No I/O,
//! no channels, no state machines.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Fixed block size of the backing store, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Size of a tree-node hash, in bytes (SHA-256).
pub const HASH_SIZE: usize = 32;

/// Size of a symmetric key, in bytes.
pub const KEY_SIZE: usize = 32;

/// On-disk size of a Type-1 (inner) node record.
pub const T1_NODE_STORAGE_SIZE: usize = 64;

/// On-disk size of a Type-2 (leaf) node record.
pub const T2_NODE_STORAGE_SIZE: usize = 64;

/// Number of Type-1 node records per 4K block.
pub const NR_OF_T1_NODES_PER_BLK: usize = BLOCK_SIZE / T1_NODE_STORAGE_SIZE;

/// Number of Type-2 node records per 4K block.
pub const NR_OF_T2_NODES_PER_BLK: usize = BLOCK_SIZE / T2_NODE_STORAGE_SIZE;

/// Maximum tree degree (children per node block).
pub const TREE_MAX_DEGREE: usize = NR_OF_T1_NODES_PER_BLK;

/// Highest supported tree level index.
pub const TREE_MAX_LEVEL: u32 = 6;

/// Number of per-channel level slots (levels `0..=TREE_MAX_LEVEL`).
pub const TREE_MAX_NR_OF_LEVELS: usize = TREE_MAX_LEVEL as usize + 1;

/// Lowest Type-1 level of a free/meta tree; the Type-2 leaf level sits at 1.
pub const LOWEST_T1_LEVEL: u32 = 2;

pub const MAX_PBA: u64 = u64::MAX;
pub const INVALID_PBA: u64 = MAX_PBA;

const _: () = assert!(T1_NODE_STORAGE_SIZE * NR_OF_T1_NODES_PER_BLK == BLOCK_SIZE);
const _: () = assert!(T2_NODE_STORAGE_SIZE * NR_OF_T2_NODES_PER_BLK == BLOCK_SIZE);

/// Physical block address in the backing store.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Pba(pub u64);

impl Pba {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

/// Virtual block address inside a VBD tree.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Vba(pub u64);

/// Copy-on-write generation counter.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

/// Marks a node that was never written: semantically absent, not corrupt.
pub const INITIAL_GENERATION: Generation = Generation(0);

/// Identifier of a symmetric key held by the crypto collaborator.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct KeyId(pub u32);

pub const INVALID_KEY_ID: KeyId = KeyId(0);

impl fmt::Display for Pba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Vba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 digest of one 4K block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TresorHash(pub [u8; HASH_SIZE]);

impl TresorHash {
    pub const ZERO: Self = Self([0_u8; HASH_SIZE]);

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0_u8; HASH_SIZE]
    }
}

impl fmt::Display for TresorHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…")
    }
}

/// Owned 4096-byte block buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Block(pub [u8; BLOCK_SIZE]);

impl Block {
    pub const ZERO: Self = Self([0_u8; BLOCK_SIZE]);

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block(")?;
        for byte in &self.0[..16] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…)")
    }
}

// ── Little-endian field codecs ──────────────────────────────────────────────
//
// Node records live at fixed 64-byte offsets inside a block; offsets are
// compile-time constants, so the helpers below index infallibly.

#[inline]
fn get_le_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[inline]
fn get_le_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
fn put_le_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_le_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Inner-tree node record: physical address, generation, subtree hash.
///
/// A zeroed record marks an unused child slot. On-disk layout (64 bytes):
/// `pba` LE u64 at 0, `gen` LE u64 at 8, `hash` at 16, zero padding to 64.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Type1Node {
    pub pba: Pba,
    pub gen: Generation,
    pub hash: TresorHash,
}

impl Type1Node {
    pub const ZERO: Self = Self {
        pba: Pba(0),
        gen: Generation(0),
        hash: TresorHash::ZERO,
    };

    /// Whether this slot is in use (differs from the zeroed record).
    #[must_use]
    pub fn valid(&self) -> bool {
        *self != Self::ZERO
    }

    /// Decode the record at slot `idx` of a node block.
    ///
    /// `idx` must be below [`NR_OF_T1_NODES_PER_BLK`].
    #[must_use]
    pub fn read_from(block: &Block, idx: usize) -> Self {
        assert!(idx < NR_OF_T1_NODES_PER_BLK);
        let off = idx * T1_NODE_STORAGE_SIZE;
        let bytes = block.as_bytes();
        let mut hash = [0_u8; HASH_SIZE];
        hash.copy_from_slice(&bytes[off + 16..off + 16 + HASH_SIZE]);
        Self {
            pba: Pba(get_le_u64(bytes, off)),
            gen: Generation(get_le_u64(bytes, off + 8)),
            hash: TresorHash(hash),
        }
    }

    /// Encode the record into slot `idx` of a node block, zeroing the padding.
    pub fn write_to(&self, block: &mut Block, idx: usize) {
        assert!(idx < NR_OF_T1_NODES_PER_BLK);
        let off = idx * T1_NODE_STORAGE_SIZE;
        let bytes = block.as_bytes_mut();
        bytes[off..off + T1_NODE_STORAGE_SIZE].fill(0);
        put_le_u64(bytes, off, self.pba.0);
        put_le_u64(bytes, off + 8, self.gen.0);
        bytes[off + 16..off + 16 + HASH_SIZE].copy_from_slice(&self.hash.0);
    }
}

impl fmt::Display for Type1Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pba {} gen {} hash {}", self.pba, self.gen, self.hash)
    }
}

/// Leaf-tree node record of a free/meta tree.
///
/// A zeroed record marks an unused leaf. On-disk layout (64 bytes): four LE
/// u64 fields at 0/8/16/24, `last_key_id` LE u32 at 32, `reserved` at 36,
/// zero padding to 64.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Type2Node {
    pub pba: Pba,
    pub last_vba: Vba,
    pub alloc_gen: Generation,
    pub free_gen: Generation,
    pub last_key_id: KeyId,
    pub reserved: bool,
}

impl Type2Node {
    pub const ZERO: Self = Self {
        pba: Pba(0),
        last_vba: Vba(0),
        alloc_gen: Generation(0),
        free_gen: Generation(0),
        last_key_id: KeyId(0),
        reserved: false,
    };

    /// Whether this slot is in use (differs from the zeroed record).
    #[must_use]
    pub fn valid(&self) -> bool {
        *self != Self::ZERO
    }

    /// Decode the record at slot `idx` of a node block.
    ///
    /// `idx` must be below [`NR_OF_T2_NODES_PER_BLK`].
    #[must_use]
    pub fn read_from(block: &Block, idx: usize) -> Self {
        assert!(idx < NR_OF_T2_NODES_PER_BLK);
        let off = idx * T2_NODE_STORAGE_SIZE;
        let bytes = block.as_bytes();
        Self {
            pba: Pba(get_le_u64(bytes, off)),
            last_vba: Vba(get_le_u64(bytes, off + 8)),
            alloc_gen: Generation(get_le_u64(bytes, off + 16)),
            free_gen: Generation(get_le_u64(bytes, off + 24)),
            last_key_id: KeyId(get_le_u32(bytes, off + 32)),
            reserved: bytes[off + 36] != 0,
        }
    }

    /// Encode the record into slot `idx` of a node block, zeroing the padding.
    pub fn write_to(&self, block: &mut Block, idx: usize) {
        assert!(idx < NR_OF_T2_NODES_PER_BLK);
        let off = idx * T2_NODE_STORAGE_SIZE;
        let bytes = block.as_bytes_mut();
        bytes[off..off + T2_NODE_STORAGE_SIZE].fill(0);
        put_le_u64(bytes, off, self.pba.0);
        put_le_u64(bytes, off + 8, self.last_vba.0);
        put_le_u64(bytes, off + 16, self.alloc_gen.0);
        put_le_u64(bytes, off + 24, self.free_gen.0);
        put_le_u32(bytes, off + 32, self.last_key_id.0);
        bytes[off + 36] = u8::from(self.reserved);
    }
}

impl fmt::Display for Type2Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pba {} last_vba {} alloc_gen {} free_gen {} last_key {}",
            self.pba, self.last_vba, self.alloc_gen, self.free_gen, self.last_key_id
        )
    }
}

/// One block's worth of Type-1 node records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type1NodeBlock {
    pub nodes: [Type1Node; NR_OF_T1_NODES_PER_BLK],
}

impl Type1NodeBlock {
    pub const ZERO: Self = Self {
        nodes: [Type1Node::ZERO; NR_OF_T1_NODES_PER_BLK],
    };

    /// Encode all records into one 4K block.
    #[must_use]
    pub fn to_block(&self) -> Block {
        let mut block = Block::ZERO;
        for (idx, node) in self.nodes.iter().enumerate() {
            node.write_to(&mut block, idx);
        }
        block
    }

    /// Decode all records from one 4K block.
    #[must_use]
    pub fn from_block(block: &Block) -> Self {
        let mut out = Self::ZERO;
        for (idx, node) in out.nodes.iter_mut().enumerate() {
            *node = Type1Node::read_from(block, idx);
        }
        out
    }
}

impl Default for Type1NodeBlock {
    fn default() -> Self {
        Self::ZERO
    }
}

/// One block's worth of Type-2 node records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type2NodeBlock {
    pub nodes: [Type2Node; NR_OF_T2_NODES_PER_BLK],
}

impl Type2NodeBlock {
    pub const ZERO: Self = Self {
        nodes: [Type2Node::ZERO; NR_OF_T2_NODES_PER_BLK],
    };

    /// Encode all records into one 4K block.
    #[must_use]
    pub fn to_block(&self) -> Block {
        let mut block = Block::ZERO;
        for (idx, node) in self.nodes.iter().enumerate() {
            node.write_to(&mut block, idx);
        }
        block
    }

    /// Decode all records from one 4K block.
    #[must_use]
    pub fn from_block(block: &Block) -> Self {
        let mut out = Self::ZERO;
        for (idx, node) in out.nodes.iter_mut().enumerate() {
            *node = Type2Node::read_from(block, idx);
        }
        out
    }
}

impl Default for Type2NodeBlock {
    fn default() -> Self {
        Self::ZERO
    }
}

// ── 4K-block hashing ────────────────────────────────────────────────────────

/// SHA-256 over the full 4096 bytes of a block.
#[must_use]
pub fn sha256_4k_hash(block: &Block) -> TresorHash {
    let digest = Sha256::digest(block.as_bytes());
    let mut out = [0_u8; HASH_SIZE];
    out.copy_from_slice(&digest);
    TresorHash(out)
}

/// Recompute a block's hash and compare against an expected digest.
#[must_use]
pub fn check_sha256_4k_hash(block: &Block, expected: &TresorHash) -> bool {
    sha256_4k_hash(block) == *expected
}

// ── Tree geometry ───────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("invalid tree shape: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Validated shape of a free/meta tree: highest level index, highest child
/// slot per node block, and the declared number of in-use leaves.
///
/// Levels are numbered the way the engine walks them: the Type-2 leaf level
/// is level 1, Type-1 inner levels run from [`LOWEST_T1_LEVEL`] to
/// `max_level`, and the root node sits alone above `max_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeShape {
    max_level: u32,
    max_child_idx: usize,
    nr_of_leaves: u64,
}

impl TreeShape {
    /// Create a `TreeShape`, validating every bound.
    pub fn new(max_level: u32, max_child_idx: usize, nr_of_leaves: u64) -> Result<Self, ShapeError> {
        if !(LOWEST_T1_LEVEL..=TREE_MAX_LEVEL).contains(&max_level) {
            return Err(ShapeError::InvalidField {
                field: "max_level",
                reason: "must be in LOWEST_T1_LEVEL..=TREE_MAX_LEVEL",
            });
        }
        if max_child_idx >= NR_OF_T1_NODES_PER_BLK {
            return Err(ShapeError::InvalidField {
                field: "max_child_idx",
                reason: "must be below NR_OF_T1_NODES_PER_BLK",
            });
        }
        let degree = max_child_idx as u64 + 1;
        let capacity = degree
            .checked_pow(max_level)
            .ok_or(ShapeError::InvalidField {
                field: "max_level",
                reason: "leaf capacity overflows u64",
            })?;
        if nr_of_leaves == 0 || nr_of_leaves > capacity {
            return Err(ShapeError::InvalidField {
                field: "nr_of_leaves",
                reason: "must be in 1..=degree^max_level",
            });
        }
        Ok(Self {
            max_level,
            max_child_idx,
            nr_of_leaves,
        })
    }

    #[must_use]
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    #[must_use]
    pub fn max_child_idx(&self) -> usize {
        self.max_child_idx
    }

    #[must_use]
    pub fn nr_of_leaves(&self) -> u64 {
        self.nr_of_leaves
    }
}

/// Highest virtual block address reachable through a tree of the given
/// degree and level count.
#[must_use]
pub fn tree_max_max_vba(degree: u64, max_level: u32) -> Option<Vba> {
    degree
        .checked_pow(max_level)
        .and_then(|count| count.checked_sub(1))
        .map(Vba)
}

/// Child slot selecting `vba` at Type-1 level `lvl` of a tree whose degree
/// is a power of two.
#[must_use]
pub fn t1_child_idx_for_vba(vba: Vba, lvl: u32, degree: u64) -> usize {
    debug_assert!(degree.is_power_of_two());
    let degree_log2 = u64::from(degree.trailing_zeros());
    let mask = degree - 1;
    let shift = degree_log2 * u64::from(lvl - 1);
    ((vba.0 >> shift) & mask) as usize
}

/// Child slot selecting `vba` at the Type-2 leaf level.
#[must_use]
pub fn t2_child_idx_for_vba(vba: Vba, degree: u64) -> usize {
    debug_assert!(degree.is_power_of_two());
    (vba.0 & (degree - 1)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t1_node_codec_round_trip() {
        let node = Type1Node {
            pba: Pba(0x1122_3344_5566_7788),
            gen: Generation(7),
            hash: TresorHash([0xAB; HASH_SIZE]),
        };
        let mut block = Block::ZERO;
        node.write_to(&mut block, 3);
        assert_eq!(Type1Node::read_from(&block, 3), node);
        // Neighbouring slots stay zeroed.
        assert!(!Type1Node::read_from(&block, 2).valid());
        assert!(!Type1Node::read_from(&block, 4).valid());
    }

    #[test]
    fn t1_node_layout_is_little_endian() {
        let node = Type1Node {
            pba: Pba(0x0102_0304_0506_0708),
            gen: Generation(0x1112_1314_1516_1718),
            hash: TresorHash([0xCC; HASH_SIZE]),
        };
        let mut block = Block::ZERO;
        node.write_to(&mut block, 0);
        let bytes = block.as_bytes();
        assert_eq!(&bytes[..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..16], &[0x18, 0x17, 0x16, 0x15, 0x14, 0x13, 0x12, 0x11]);
        assert_eq!(&bytes[16..48], &[0xCC; 32]);
        assert_eq!(&bytes[48..64], &[0_u8; 16]);
    }

    #[test]
    fn t2_node_codec_round_trip() {
        let node = Type2Node {
            pba: Pba(99),
            last_vba: Vba(4),
            alloc_gen: Generation(2),
            free_gen: Generation(3),
            last_key_id: KeyId(1),
            reserved: true,
        };
        let mut block = Block::ZERO;
        node.write_to(&mut block, 63);
        assert_eq!(Type2Node::read_from(&block, 63), node);
    }

    #[test]
    fn zeroed_nodes_are_invalid() {
        assert!(!Type1Node::ZERO.valid());
        assert!(!Type2Node::ZERO.valid());

        let pba_only = Type1Node {
            pba: Pba(1),
            ..Type1Node::ZERO
        };
        assert!(pba_only.valid());
    }

    #[test]
    fn t1_leaf_record_reads_as_t2_record() {
        // The initializer stores leaf entries as pba-only Type-1 records;
        // the checker interprets the same bytes as Type-2 records. A used
        // leaf must stay visible across that reinterpretation.
        let leaf = Type1Node {
            pba: Pba(1234),
            ..Type1Node::ZERO
        };
        let mut block = Block::ZERO;
        leaf.write_to(&mut block, 17);

        let as_t2 = Type2Node::read_from(&block, 17);
        assert!(as_t2.valid());
        assert_eq!(as_t2.pba, Pba(1234));
        assert!(!Type2Node::read_from(&block, 16).valid());
    }

    #[test]
    fn node_block_codec_round_trip() {
        let mut node_block = Type1NodeBlock::ZERO;
        for (idx, node) in node_block.nodes.iter_mut().enumerate() {
            node.pba = Pba(idx as u64 + 1);
            node.gen = Generation(42);
        }
        let block = node_block.to_block();
        assert_eq!(Type1NodeBlock::from_block(&block), node_block);
    }

    #[test]
    fn node_block_encoding_is_stable() {
        // Encoding must be deterministic byte-for-byte: the initializer
        // hashes the encoded block and the checker re-hashes what it reads.
        let mut node_block = Type2NodeBlock::ZERO;
        node_block.nodes[0].pba = Pba(7);
        let first = node_block.to_block();
        let second = Type2NodeBlock::from_block(&first).to_block();
        assert_eq!(first, second);
    }

    #[test]
    fn hash_4k_matches_and_detects_corruption() {
        let mut block = Block::ZERO;
        block.as_bytes_mut()[100] = 0x5A;
        let hash = sha256_4k_hash(&block);
        assert!(check_sha256_4k_hash(&block, &hash));

        block.as_bytes_mut()[100] ^= 0x01;
        assert!(!check_sha256_4k_hash(&block, &hash));
    }

    #[test]
    fn tree_shape_validation() {
        assert!(TreeShape::new(2, 63, 64).is_ok());
        assert!(TreeShape::new(TREE_MAX_LEVEL, 63, 1).is_ok());

        // Level below the lowest Type-1 level.
        assert!(TreeShape::new(1, 63, 64).is_err());
        // Level above the maximum.
        assert!(TreeShape::new(TREE_MAX_LEVEL + 1, 63, 1).is_err());
        // Child index beyond the node block.
        assert!(TreeShape::new(2, 64, 1).is_err());
        // Zero leaves.
        assert!(TreeShape::new(2, 63, 0).is_err());
        // More leaves than the shape can hold: 64^2 = 4096.
        assert!(TreeShape::new(2, 63, 4096).is_ok());
        assert!(TreeShape::new(2, 63, 4097).is_err());
    }

    #[test]
    fn child_idx_helpers() {
        assert_eq!(t2_child_idx_for_vba(Vba(0), 64), 0);
        assert_eq!(t2_child_idx_for_vba(Vba(63), 64), 63);
        assert_eq!(t2_child_idx_for_vba(Vba(64), 64), 0);

        assert_eq!(t1_child_idx_for_vba(Vba(64), 2, 64), 1);
        assert_eq!(t1_child_idx_for_vba(Vba(64 * 64), 3, 64), 1);
        assert_eq!(t1_child_idx_for_vba(Vba(5), 1, 64), 5);
    }

    #[test]
    fn max_vba_helper() {
        assert_eq!(tree_max_max_vba(64, 2), Some(Vba(4095)));
        assert_eq!(tree_max_max_vba(1, 6), Some(Vba(0)));
    }

    #[test]
    fn display_formats() {
        assert_eq!(Pba(9).to_string(), "9");
        assert_eq!(Generation(3).to_string(), "3");
        let hash = TresorHash([0xAB; HASH_SIZE]);
        assert_eq!(hash.to_string(), "abababab…");
    }
}
