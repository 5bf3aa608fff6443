// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Counting semaphore. Blocking and wakeup are driven by the kernel;
//! this type only holds the counter and the FIFO of waiters.

extern crate alloc;

use alloc::collections::VecDeque;

use crate::ec::EcId;

#[derive(Debug, Default)]
pub struct Sm {
    pub counter: u64,
    waiters: VecDeque<EcId>,
}

impl Sm {
    pub fn new(counter: u64) -> Self {
        Self { counter, waiters: VecDeque::new() }
    }

    /// Takes one unit, or all of them with `zero`. Fails if the counter is zero.
    pub fn try_down(&mut self, zero: bool) -> bool {
        if self.counter == 0 {
            return false;
        }
        self.counter = if zero { 0 } else { self.counter - 1 };
        true
    }

    pub fn enqueue(&mut self, ec: EcId) {
        self.waiters.push_back(ec);
    }

    pub fn dequeue(&mut self) -> Option<EcId> {
        self.waiters.pop_front()
    }

    /// Drops `ec` from the wait queue (timeout).
    pub fn remove(&mut self, ec: EcId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| *w != ec);
        before != self.waiters.len()
    }

    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_count_drains_counter() {
        let mut sm = Sm::new(3);
        assert!(sm.try_down(false));
        assert_eq!(sm.counter, 2);
        assert!(sm.try_down(true));
        assert_eq!(sm.counter, 0);
        assert!(!sm.try_down(false));
    }
}
