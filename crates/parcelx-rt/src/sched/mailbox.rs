// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker inbox: any thread mails, only the owning worker receives.

use std::collections::VecDeque;

use parking_lot::Mutex;

pub(crate) struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn send(&self, value: T) {
        self.queue.lock().push_back(value);
    }

    /// Take everything mailed so far, oldest first.
    pub fn take_all(&self) -> VecDeque<T> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn delivers_in_order() {
        let mb = Mailbox::new();
        mb.send(1);
        mb.send(2);
        assert_eq!(mb.len(), 2);
        assert_eq!(mb.take_all().into_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert!(mb.is_empty());
    }

    #[test]
    fn many_producers() {
        let mb = Arc::new(Mailbox::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let mb = mb.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        mb.send(t * 100 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut all: Vec<_> = mb.take_all().into_iter().collect();
        all.sort();
        assert_eq!(all, (0..400).collect::<Vec<_>>());
    }
}
