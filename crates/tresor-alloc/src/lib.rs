#![forbid(unsafe_code)]
//! Block Allocator module.
//!
//! Hands out monotonically increasing physical block addresses from a
//! reserved range. The k-th successful `GET` returns `first_block + k`;
//! once the configured capacity is exhausted every further `GET` completes
//! unsuccessfully. No generated sub-requests, no dependencies on other
//! modules.

use tresor_error::ProtocolError;
use tresor_module::{AllocRequest, ChannelState, Module, Request, RequestId};
use tresor_types::Pba;

const MODULE_NAME: &str = "block_allocator";

/// Number of request channels. With a single channel, allocation order is
/// globally monotonic.
pub const NR_OF_CHANNELS: usize = 1;

#[derive(Default)]
struct Channel {
    state: ChannelState,
    request: Option<AllocRequest>,
}

/// Single-channel bump allocator over `[first_block, first_block + capacity)`.
pub struct BlockAllocator {
    first_block: Pba,
    nr_of_blks: u64,
    blocks_allocated: u64,
    channels: [Channel; NR_OF_CHANNELS],
}

impl BlockAllocator {
    #[must_use]
    pub fn new(first_block: Pba, nr_of_blks: u64) -> Self {
        Self {
            first_block,
            nr_of_blks,
            blocks_allocated: 0,
            channels: Default::default(),
        }
    }

    /// Number of successful allocations so far.
    #[must_use]
    pub fn blocks_allocated(&self) -> u64 {
        self.blocks_allocated
    }

    fn execute_get(&mut self, id: usize, progress: &mut bool) {
        let channel = &mut self.channels[id];
        if channel.state != ChannelState::Pending {
            return;
        }
        let Some(req) = channel.request.as_mut() else {
            return;
        };
        if self.blocks_allocated < self.nr_of_blks {
            req.blk_nr = Pba(self.first_block.0 + self.blocks_allocated);
            self.blocks_allocated += 1;
            req.success = true;
        } else {
            tracing::error!(
                target: "tresor::block_allocator",
                first_block = self.first_block.0,
                capacity = self.nr_of_blks,
                "request_failed: out of blocks"
            );
            req.success = false;
        }
        channel.state = ChannelState::Complete;
        *progress = true;
    }
}

impl Module for BlockAllocator {
    fn ready_to_submit_request(&self) -> bool {
        self.channels
            .iter()
            .any(|channel| channel.state == ChannelState::Inactive)
    }

    fn submit_request(&mut self, req: Request) -> Result<(), ProtocolError> {
        let Request::Alloc(mut req) = req else {
            return Err(ProtocolError::WrongModule {
                expected: MODULE_NAME,
                got: req.envelope().dst.name(),
            });
        };
        for (id, channel) in self.channels.iter_mut().enumerate() {
            if channel.state == ChannelState::Inactive {
                req.env.dst_request_id = RequestId(id as u64);
                channel.request = Some(req);
                channel.state = ChannelState::Submitted;
                return Ok(());
            }
        }
        Err(ProtocolError::NoFreeChannel {
            module: MODULE_NAME,
        })
    }

    fn execute(&mut self, progress: &mut bool) {
        for id in 0..NR_OF_CHANNELS {
            match self.channels[id].state {
                ChannelState::Inactive | ChannelState::Complete => continue,
                ChannelState::Submitted => {
                    self.channels[id].state = ChannelState::Pending;
                    *progress = true;
                }
                _ => {}
            }
            self.execute_get(id, progress);
        }
    }

    fn peek_completed_request(&self) -> Option<Request> {
        self.channels
            .iter()
            .filter(|channel| channel.state == ChannelState::Complete)
            .find_map(|channel| channel.request.clone().map(Request::Alloc))
    }

    fn drop_completed_request(&mut self, req: &Request) -> Result<(), ProtocolError> {
        let id = req.envelope().dst_request_id.0;
        let channel = self.channels.get_mut(id as usize).ok_or(
            ProtocolError::UnknownChannel {
                module: MODULE_NAME,
                id,
            },
        )?;
        if channel.state != ChannelState::Complete {
            return Err(ProtocolError::NotComplete {
                module: MODULE_NAME,
                id,
            });
        }
        *channel = Channel::default();
        Ok(())
    }

    fn peek_generated_request(&self) -> Option<Request> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tresor_module::ModuleId;

    fn get_one(alloc: &mut BlockAllocator) -> AllocRequest {
        alloc
            .submit_request(Request::Alloc(AllocRequest::get(
                ModuleId::Client,
                RequestId(0),
            )))
            .expect("submit");
        loop {
            let mut progress = false;
            alloc.execute(&mut progress);
            if !progress {
                break;
            }
        }
        let completed = alloc.peek_completed_request().expect("completed");
        alloc.drop_completed_request(&completed).expect("drop");
        match completed {
            Request::Alloc(req) => req,
            other => panic!("unexpected request kind: {other}"),
        }
    }

    #[test]
    fn allocation_is_monotonic() {
        let mut alloc = BlockAllocator::new(Pba(128), 10);
        for idx in 0..10 {
            let req = get_one(&mut alloc);
            assert!(req.success);
            assert_eq!(req.blk_nr, Pba(128 + idx));
        }
        assert_eq!(alloc.blocks_allocated(), 10);
    }

    #[test]
    fn exhaustion_is_a_domain_failure() {
        let mut alloc = BlockAllocator::new(Pba(5), 2);
        assert!(get_one(&mut alloc).success);
        assert!(get_one(&mut alloc).success);

        let exhausted = get_one(&mut alloc);
        assert!(!exhausted.success);
        // A failed GET allocates nothing.
        assert_eq!(alloc.blocks_allocated(), 2);

        // Failure is terminal but the channel stays usable for new requests.
        assert!(!get_one(&mut alloc).success);
    }

    #[test]
    fn submit_without_free_channel_is_rejected() {
        let mut alloc = BlockAllocator::new(Pba(0), 4);
        let req = Request::Alloc(AllocRequest::get(ModuleId::Client, RequestId(0)));
        alloc.submit_request(req.clone()).expect("first submit");
        assert!(!alloc.ready_to_submit_request());
        assert_eq!(
            alloc.submit_request(req),
            Err(ProtocolError::NoFreeChannel {
                module: "block_allocator"
            })
        );
    }

    #[test]
    fn drop_of_incomplete_request_is_rejected() {
        let mut alloc = BlockAllocator::new(Pba(0), 4);
        let mut req = AllocRequest::get(ModuleId::Client, RequestId(0));
        alloc
            .submit_request(Request::Alloc(req.clone()))
            .expect("submit");
        req.env.dst_request_id = RequestId(0);
        assert_eq!(
            alloc.drop_completed_request(&Request::Alloc(req.clone())),
            Err(ProtocolError::NotComplete {
                module: "block_allocator",
                id: 0
            })
        );

        req.env.dst_request_id = RequestId(99);
        assert_eq!(
            alloc.drop_completed_request(&Request::Alloc(req)),
            Err(ProtocolError::UnknownChannel {
                module: "block_allocator",
                id: 99
            })
        );
    }

    #[test]
    fn wrong_request_kind_is_rejected() {
        let mut alloc = BlockAllocator::new(Pba(0), 4);
        let req = Request::BlockIo(tresor_module::BlockIoRequest::sync(
            ModuleId::Client,
            RequestId(0),
        ));
        assert!(matches!(
            alloc.submit_request(req),
            Err(ProtocolError::WrongModule { .. })
        ));
    }
}
