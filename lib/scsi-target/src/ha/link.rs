// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport for inter-controller messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use super::{HaError, HaReceiver};

/// Channel to the partner controller.
///
/// Sends must not block for long: they are issued from worker threads.
/// Inbound messages are handed to the [HaReceiver] obtained from the local
/// controller.
pub trait HaLink: Send + Sync + 'static {
    fn send(&self, buf: &[u8]) -> Result<(), HaError>;
}

/// State common to both ends of a [LoopbackLink]
struct Wire {
    severed: AtomicBool,
    tx: Mutex<[Option<Sender<Vec<u8>>>; 2]>,
}

/// One end of an in-process HA link.
pub struct LoopbackLink {
    name: String,
    side: usize,
    wire: Arc<Wire>,
    rx: Mutex<Option<Receiver<Vec<u8>>>>,
}
impl LoopbackLink {
    /// Create both ends of a link.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_b) = crossbeam_channel::unbounded();
        let (tx_b, rx_a) = crossbeam_channel::unbounded();
        let wire = Arc::new(Wire {
            severed: AtomicBool::new(false),
            tx: Mutex::new([Some(tx_a), Some(tx_b)]),
        });
        let end = |name: &str, side, rx| {
            Arc::new(Self {
                name: name.to_string(),
                side,
                wire: wire.clone(),
                rx: Mutex::new(Some(rx)),
            })
        };
        (end("ha-a", 0, rx_a), end("ha-b", 1, rx_b))
    }

    /// Start delivering inbound messages to `receiver`.
    pub fn attach(&self, receiver: HaReceiver) -> std::io::Result<()> {
        let Some(rx) = self.rx.lock().unwrap().take() else {
            return Ok(());
        };
        let wire = self.wire.clone();
        // The pump is detached: it exits once the peer's sender is gone
        let _ = std::thread::Builder::new()
            .name(format!("{} pump", self.name))
            .spawn(move || {
                while let Ok(buf) = rx.recv() {
                    if wire.severed.load(Ordering::Acquire) {
                        break;
                    }
                    receiver.deliver(&buf);
                }
                receiver.link_lost();
            })?;
        Ok(())
    }

    /// Cut the link in both directions, as if the interconnect failed.
    pub fn sever(&self) {
        self.wire.severed.store(true, Ordering::Release);
        let senders = std::mem::take(&mut *self.wire.tx.lock().unwrap());
        drop(senders);
    }

    pub fn is_severed(&self) -> bool {
        self.wire.severed.load(Ordering::Acquire)
    }
}
impl HaLink for LoopbackLink {
    fn send(&self, buf: &[u8]) -> Result<(), HaError> {
        if self.is_severed() {
            return Err(HaError::LinkDown);
        }
        let guard = self.wire.tx.lock().unwrap();
        let tx = guard[self.side].as_ref().ok_or(HaError::LinkDown)?;
        tx.send(buf.to_vec()).map_err(|_| HaError::LinkDown)
    }
}
impl Drop for LoopbackLink {
    fn drop(&mut self) {
        // Disconnecting our sender ends the peer's pump
        drop(self.wire.tx.lock().unwrap()[self.side].take());
    }
}
