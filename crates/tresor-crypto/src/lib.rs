#![forbid(unsafe_code)]
//! Interface to the symmetric-cipher collaborator.
//!
//! The cipher engine itself is outside the engine's trust boundary and
//! outside this repository's scope; the storage core drives it exclusively
//! through [`CryptoProvider`]: keys are loaded into a bounded set of slots,
//! encryption/decryption requests are submitted per block and polled to
//! completion. Nothing here blocks.

use tresor_error::CryptoError;
use tresor_types::{KeyId, BLOCK_SIZE, KEY_SIZE};

/// Number of keys a provider holds concurrently (current plus previous,
/// for rekeying).
pub const NR_OF_KEY_SLOTS: usize = 2;

/// Outcome of a polled encryption/decryption request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoCompletion {
    pub valid: bool,
    pub block_number: u64,
}

/// Bounded set of active key ids.
///
/// Key id 0 marks a free slot, matching the engine-wide invalid key id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeySlots {
    store: [KeyId; NR_OF_KEY_SLOTS],
}

impl KeySlots {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Occupy a free slot with `id`; fails when all slots are taken.
    pub fn store(&mut self, id: KeyId) -> Result<(), CryptoError> {
        for slot in &mut self.store {
            if slot.0 == 0 {
                *slot = id;
                return Ok(());
            }
        }
        Err(CryptoError::NoFreeKeySlot)
    }

    /// Release the slot holding `id`; fails when `id` is not loaded.
    pub fn remove(&mut self, id: KeyId) -> Result<(), CryptoError> {
        for slot in &mut self.store {
            if *slot == id {
                *slot = KeyId(0);
                return Ok(());
            }
        }
        Err(CryptoError::UnknownKey { id: id.0 })
    }

    #[must_use]
    pub fn contains(&self, id: KeyId) -> bool {
        self.store.iter().any(|slot| *slot == id && slot.0 != 0)
    }

    /// Iterate over the occupied slots.
    pub fn for_each_key(&self, mut func: impl FnMut(KeyId)) {
        for slot in &self.store {
            if slot.0 != 0 {
                func(*slot);
            }
        }
    }
}

/// Polled symmetric-crypto contract.
///
/// Submission returns `Ok(false)` when the provider is busy; the caller
/// retries on a later poll. Completions are retrieved in submission order
/// through the `*_request_complete` calls, which write the transformed
/// block into `dst`.
pub trait CryptoProvider {
    /// Advance internal state; returns whether anything progressed.
    fn execute(&mut self) -> bool;

    /// Load a key into a free slot. The value must be exactly
    /// [`KEY_SIZE`] bytes.
    fn add_key(&mut self, id: KeyId, value: &[u8]) -> Result<(), CryptoError>;

    /// Unload a key.
    fn remove_key(&mut self, id: KeyId) -> Result<(), CryptoError>;

    /// Submit one block for encryption. `src` must be exactly
    /// [`BLOCK_SIZE`] bytes. Returns `Ok(false)` when busy.
    fn submit_encryption_request(
        &mut self,
        block_number: u64,
        key_id: KeyId,
        src: &[u8],
    ) -> Result<bool, CryptoError>;

    /// Poll for a finished encryption. `dst` must hold at least
    /// [`BLOCK_SIZE`] bytes.
    fn encryption_request_complete(
        &mut self,
        dst: &mut [u8],
    ) -> Result<Option<CryptoCompletion>, CryptoError>;

    /// Submit one block for decryption. `src` must be exactly
    /// [`BLOCK_SIZE`] bytes. Returns `Ok(false)` when busy.
    fn submit_decryption_request(
        &mut self,
        block_number: u64,
        key_id: KeyId,
        src: &[u8],
    ) -> Result<bool, CryptoError>;

    /// Poll for a finished decryption. `dst` must hold at least
    /// [`BLOCK_SIZE`] bytes.
    fn decryption_request_complete(
        &mut self,
        dst: &mut [u8],
    ) -> Result<Option<CryptoCompletion>, CryptoError>;
}

/// Validate a key value's length against [`KEY_SIZE`].
pub fn check_key_value(value: &[u8]) -> Result<(), CryptoError> {
    if value.len() != KEY_SIZE {
        return Err(CryptoError::KeyValueSizeMismatch {
            need: KEY_SIZE,
            got: value.len(),
        });
    }
    Ok(())
}

/// Validate an output buffer's capacity against [`BLOCK_SIZE`].
pub fn check_dst_buffer(dst: &[u8]) -> Result<(), CryptoError> {
    if dst.len() < BLOCK_SIZE {
        return Err(CryptoError::BufferTooSmall {
            need: BLOCK_SIZE,
            got: dst.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_slots_are_bounded() {
        let mut slots = KeySlots::new();
        slots.store(KeyId(1)).expect("first slot");
        slots.store(KeyId(2)).expect("second slot");
        assert_eq!(slots.store(KeyId(3)), Err(CryptoError::NoFreeKeySlot));

        assert!(slots.contains(KeyId(1)));
        assert!(slots.contains(KeyId(2)));
        assert!(!slots.contains(KeyId(3)));
    }

    #[test]
    fn removing_frees_a_slot() {
        let mut slots = KeySlots::new();
        slots.store(KeyId(1)).expect("store");
        slots.store(KeyId(2)).expect("store");

        slots.remove(KeyId(1)).expect("remove");
        assert!(!slots.contains(KeyId(1)));
        slots.store(KeyId(3)).expect("slot freed");
        assert!(slots.contains(KeyId(3)));
    }

    #[test]
    fn removing_unknown_key_fails() {
        let mut slots = KeySlots::new();
        assert_eq!(slots.remove(KeyId(7)), Err(CryptoError::UnknownKey { id: 7 }));
    }

    #[test]
    fn for_each_key_visits_occupied_slots() {
        let mut slots = KeySlots::new();
        slots.store(KeyId(4)).expect("store");
        slots.store(KeyId(9)).expect("store");
        slots.remove(KeyId(4)).expect("remove");

        let mut seen = Vec::new();
        slots.for_each_key(|id| seen.push(id));
        assert_eq!(seen, vec![KeyId(9)]);
    }

    #[test]
    fn buffer_and_key_validation() {
        assert!(check_key_value(&[0_u8; KEY_SIZE]).is_ok());
        assert_eq!(
            check_key_value(&[0_u8; 16]),
            Err(CryptoError::KeyValueSizeMismatch { need: 32, got: 16 })
        );

        assert!(check_dst_buffer(&[0_u8; BLOCK_SIZE]).is_ok());
        assert_eq!(
            check_dst_buffer(&[0_u8; 100]),
            Err(CryptoError::BufferTooSmall {
                need: BLOCK_SIZE,
                got: 100
            })
        );
    }
}
