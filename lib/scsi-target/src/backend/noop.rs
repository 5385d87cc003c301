// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use super::{Backend, BackendIo, LunInfo, Operation, DEFAULT_BLOCK_SIZE};
use crate::sense::Status;

/// Backend which discards all writes and returns zeroes for reads.
///
/// Commands are completed inline from the submitting worker, which makes
/// this backend useful for measuring the performance of the target core
/// without any actual storage operations.
pub struct NoopBackend {
    info: LunInfo,
}
impl NoopBackend {
    pub fn create(size: u64) -> Arc<Self> {
        Self::with_block_size(size, DEFAULT_BLOCK_SIZE)
    }
    pub fn with_block_size(size: u64, block_size: u32) -> Arc<Self> {
        let info = LunInfo {
            block_size,
            num_blocks: size / u64::from(block_size),
            read_only: false,
            supports_unmap: true,
        };
        Arc::new(Self { info })
    }
}
impl Backend for NoopBackend {
    fn info(&self) -> LunInfo {
        self.info
    }

    fn data_submit(&self, mut io: BackendIo) {
        if let Operation::Read { blocks, .. } = *io.op() {
            let len = blocks as usize * self.info.block_size as usize;
            *io.data_mut() = vec![0u8; len];
        }
        io.complete(Status::good());
    }

    fn config_write(&self, io: BackendIo) {
        io.complete(Status::good());
    }

    fn config_read(&self, io: BackendIo) {
        io.complete_inquire(&self.info);
    }
}
