//! Loader/plugin rendezvous.
//!
//! The two sides synchronize through a pair of words living in loader
//! memory and aliased into the plugin through their physical
//! addresses: the loader announces transitions in `event`, the plugin
//! acknowledges in `reply`. Wake-ups go through the address arbiter,
//! acknowledgement waits are bounded so an unresponsive plugin can
//! never hold a swap or an exit hostage.

use std::sync::atomic::{AtomicI32, Ordering};

use kernel::{ArbitrationType, Handle, Kernel};

/// Nothing pending / transition acknowledged
pub const EVENT_OK: i32 = 0;
/// The arena is about to be evicted to the swap file
pub const EVENT_ABOUT_TO_SWAP: i32 = 1;
/// The game process is about to be terminated
pub const EVENT_ABOUT_TO_EXIT: i32 = 2;

/// Written to `reply` before waiting for the plugin. Below `EVENT_OK`
/// so the arbiter "wait while less than" test holds until the plugin
/// stores its acknowledgement.
pub const REPLY_WAIT: i32 = -1;

/// How long the loader waits for a plugin acknowledgement
const REPLY_TIMEOUT_NS: u64 = 5_000_000_000;

pub struct Rendezvous {
    event: AtomicI32,
    reply: AtomicI32,
}

impl Rendezvous {
    pub fn new() -> Rendezvous {
        Rendezvous {
            event: AtomicI32::new(EVENT_OK),
            reply: AtomicI32::new(EVENT_OK),
        }
    }

    /// Physical address of the event word, as advertised to the
    /// plugin in its header
    pub fn event_pa<K: Kernel>(&self, kernel: &mut K) -> u32 {
        kernel.pa_from_va(&self.event as *const AtomicI32 as usize)
    }

    /// Physical address of the reply word
    pub fn reply_pa<K: Kernel>(&self, kernel: &mut K) -> u32 {
        kernel.pa_from_va(&self.reply as *const AtomicI32 as usize)
    }

    /// Publish `event` to the plugin. The store retries until it
    /// lands so an interleaved write from the other side can't eat
    /// it, and the plugin is guaranteed to observe the value before
    /// the arbiter wakes it.
    pub fn notify<K: Kernel>(&self, kernel: &mut K, arbiter: Handle,
                             event: i32, signal: bool) {
        store_exclusive(&self.event, event);

        if signal {
            let pa = self.event_pa(kernel);

            let _ = kernel.arbitrate_address(arbiter, pa,
                                             ArbitrationType::Signal,
                                             1, 0);
        }
    }

    /// Wait for the plugin to acknowledge the pending event. Returns
    /// unconditionally after the timeout: a plugin that doesn't
    /// answer in time is considered unresponsive and the transition
    /// proceeds without it.
    pub fn wait_reply<K: Kernel>(&self, kernel: &mut K,
                                 arbiter: Handle) {
        store_exclusive(&self.reply, REPLY_WAIT);

        let pa = self.reply_pa(kernel);

        let _ = kernel.arbitrate_address(
            arbiter, pa,
            ArbitrationType::WaitIfLessThanTimeout,
            EVENT_OK, REPLY_TIMEOUT_NS);
    }

    pub fn event(&self) -> i32 {
        self.event.load(Ordering::SeqCst)
    }

    pub fn reply(&self) -> i32 {
        self.reply.load(Ordering::SeqCst)
    }
}

/// Store with a compare-exchange retry loop, the portable spelling of
/// the load-linked/store-conditional sequence used on the words both
/// processes write to
fn store_exclusive(word: &AtomicI32, val: i32) {
    let mut current = word.load(Ordering::Relaxed);

    loop {
        match word.compare_exchange_weak(current, val,
                                         Ordering::SeqCst,
                                         Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}
