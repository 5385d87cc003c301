// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Error, ErrorKind, Result};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use super::{Backend, BackendIo, LunInfo, Operation};
use crate::sense::{SenseData, Status};

/// Backend storing its contents in a byte vector, serviced by a small pool
/// of worker threads.
pub struct InMemoryBackend {
    shared_state: Arc<SharedState>,
    queue: Mutex<Option<Sender<BackendIo>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}
struct SharedState {
    bytes: Mutex<Vec<u8>>,
    info: LunInfo,
}
impl SharedState {
    fn processing_loop(&self, rx: Receiver<BackendIo>) {
        while let Ok(mut io) = rx.recv() {
            if self.info.read_only && io.op().is_write() {
                io.complete(Status::check(SenseData::write_protected()));
                continue;
            }
            let res = match io.op().clone() {
                Operation::Read { lba, blocks } => {
                    self.process_read(lba, blocks).map(|data| {
                        *io.data_mut() = data;
                    })
                }
                Operation::Write { lba, blocks } => {
                    self.process_write(lba, blocks, io.data())
                }
                Operation::Verify { lba, blocks } => {
                    self.byte_range(lba, blocks).map(|_| ())
                }
                Operation::WriteSame { lba, blocks } => {
                    self.process_write_same(lba, blocks, io.data())
                }
                Operation::CompareAndWrite { lba, blocks } => {
                    let status = self.process_compare_and_write(
                        lba,
                        blocks,
                        io.data(),
                    );
                    io.complete(status);
                    continue;
                }
                Operation::Unmap(extents) => {
                    let mut bytes = self.bytes.lock().unwrap();
                    extents.iter().try_for_each(|ext| {
                        let (start, end) = self.byte_range(ext.lba, ext.len)?;
                        bytes[start..end].fill(0);
                        Ok(())
                    })
                }
                Operation::Format => {
                    self.bytes.lock().unwrap().fill(0);
                    Ok(())
                }
                Operation::Flush | Operation::StartStop { .. } => Ok(()),
                Operation::Inquire => {
                    io.complete_inquire(&self.info);
                    continue;
                }
            };
            match res {
                Ok(()) => io.complete(Status::good()),
                Err(_) => {
                    io.complete(Status::check(SenseData::lba_out_of_range()))
                }
            }
        }
    }

    fn byte_range(&self, lba: u64, blocks: u64) -> Result<(usize, usize)> {
        let bs = u64::from(self.info.block_size);
        let start = lba.checked_mul(bs);
        let end = lba
            .checked_add(blocks)
            .and_then(|last| last.checked_mul(bs));
        match (start, end) {
            (Some(start), Some(end))
                if end <= self.info.num_blocks * bs =>
            {
                Ok((start as usize, end as usize))
            }
            _ => Err(Error::new(
                ErrorKind::InvalidInput,
                format!("invalid lba {lba} and len {blocks}"),
            )),
        }
    }

    fn process_read(&self, lba: u64, blocks: u64) -> Result<Vec<u8>> {
        let (start, end) = self.byte_range(lba, blocks)?;
        let bytes = self.bytes.lock().unwrap();
        Ok(bytes[start..end].to_vec())
    }

    fn process_write_same(
        &self,
        lba: u64,
        blocks: u64,
        data: &[u8],
    ) -> Result<()> {
        let (start, end) = self.byte_range(lba, blocks)?;
        let bs = self.info.block_size as usize;
        if data.len() < bs {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("short write same buffer {} < {bs}", data.len()),
            ));
        }
        let mut bytes = self.bytes.lock().unwrap();
        for chunk in bytes[start..end].chunks_exact_mut(bs) {
            chunk.copy_from_slice(&data[..bs]);
        }
        Ok(())
    }

    fn process_compare_and_write(
        &self,
        lba: u64,
        blocks: u64,
        data: &[u8],
    ) -> Status {
        let Ok((start, end)) = self.byte_range(lba, blocks) else {
            return Status::check(SenseData::lba_out_of_range());
        };
        let len = end - start;
        if data.len() < 2 * len {
            return Status::check(SenseData::phase_error());
        }
        let (verify, write) = data.split_at(len);

        // Compare and write are atomic with respect to other commands
        let mut bytes = self.bytes.lock().unwrap();
        let current = &mut bytes[start..end];
        if let Some(off) = current.iter().zip(verify).position(|(a, b)| a != b)
        {
            return Status::check(SenseData::miscompare(off as u32));
        }
        current.copy_from_slice(&write[..len]);
        Status::good()
    }

    fn process_write(&self, lba: u64, blocks: u64, data: &[u8]) -> Result<()> {
        let (start, end) = self.byte_range(lba, blocks)?;
        if data.len() < end - start {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("short write buffer {} < {}", data.len(), end - start),
            ));
        }
        let mut bytes = self.bytes.lock().unwrap();
        bytes[start..end].copy_from_slice(&data[..end - start]);
        Ok(())
    }
}

impl InMemoryBackend {
    pub fn create(
        bytes: Vec<u8>,
        block_size: u32,
        read_only: bool,
        worker_count: NonZeroUsize,
    ) -> Result<Arc<Self>> {
        let len = bytes.len();
        if len == 0 {
            return Err(Error::new(ErrorKind::Other, "size cannot be 0"));
        } else if (len % block_size as usize) != 0 {
            return Err(Error::new(
                ErrorKind::Other,
                format!(
                    "size {} not multiple of block size {}!",
                    len, block_size,
                ),
            ));
        }

        let info = LunInfo {
            block_size,
            num_blocks: len as u64 / u64::from(block_size),
            read_only,
            supports_unmap: true,
        };
        let shared_state =
            Arc::new(SharedState { bytes: Mutex::new(bytes), info });
        let (tx, rx) = crossbeam_channel::unbounded();

        let this = Self {
            shared_state,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
        };
        this.spawn_workers(worker_count, rx)?;
        Ok(Arc::new(this))
    }

    fn spawn_workers(
        &self,
        count: NonZeroUsize,
        rx: Receiver<BackendIo>,
    ) -> Result<()> {
        let mut workers = self.workers.lock().unwrap();
        for n in 0..count.get() {
            let shared_state = self.shared_state.clone();
            let rx = rx.clone();
            let hdl = std::thread::Builder::new()
                .name(format!("in-memory worker {n}"))
                .spawn(move || shared_state.processing_loop(rx))?;
            workers.push(hdl);
        }
        Ok(())
    }

    fn submit(&self, io: BackendIo) {
        let guard = self.queue.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => {
                if let Err(e) = tx.send(io) {
                    e.into_inner()
                        .complete(Status::check(SenseData::internal_failure()));
                }
            }
            None => io.complete(Status::check(SenseData::internal_failure())),
        }
    }
}

impl Backend for InMemoryBackend {
    fn info(&self) -> LunInfo {
        self.shared_state.info
    }
    fn data_submit(&self, io: BackendIo) {
        self.submit(io)
    }
    fn config_write(&self, io: BackendIo) {
        self.submit(io)
    }
    fn config_read(&self, io: BackendIo) {
        self.submit(io)
    }
    fn shutdown(&self) {
        // Closing the channel ends each processing loop
        drop(self.queue.lock().unwrap().take());
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        let me = std::thread::current().id();
        for hdl in workers {
            if hdl.thread().id() != me {
                let _ = hdl.join();
            }
        }
    }
}
impl Drop for InMemoryBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
