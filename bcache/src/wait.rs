//! Broadcast wake-ups for suspended tasks.

use futures::channel::oneshot;

/// A set of suspended tasks waiting for the same condition.
///
/// Registration and the check of the condition must happen under the same lock as the
/// [WaitSet::wake_all] that signals it, otherwise a wake-up can be missed.
#[derive(Default)]
pub(crate) struct WaitSet {
    waiters: Vec<oneshot::Sender<()>>,
}

impl WaitSet {
    /// Register a new waiter, returning the receiver to await.
    ///
    /// The receiver resolves (with either `Ok` or `Canceled`) once [WaitSet::wake_all] is called.
    pub fn register(&mut self) -> oneshot::Receiver<()> {
        self.waiters.retain(|waiter| !waiter.is_canceled());
        let (sender, receiver) = oneshot::channel();
        self.waiters.push(sender);
        receiver
    }

    /// Wake every registered waiter, returning how many were woken.
    pub fn wake_all(&mut self) -> usize {
        let mut woken = 0;
        for waiter in self.waiters.drain(..) {
            if waiter.send(()).is_ok() {
                woken += 1;
            }
        }
        woken
    }

    /// The number of registered waiters.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_wake_all() {
        let mut set = WaitSet::default();
        let first = set.register();
        let second = set.register();
        assert_eq!(set.len(), 2);

        assert_eq!(set.wake_all(), 2);
        assert_eq!(set.len(), 0);
        assert!(block_on(first).is_ok());
        assert!(block_on(second).is_ok());

        // Nothing left to wake
        assert_eq!(set.wake_all(), 0);
    }

    #[test]
    fn test_abandoned_waiters_pruned() {
        let mut set = WaitSet::default();
        let abandoned = set.register();
        drop(abandoned);
        let _kept = set.register();
        assert_eq!(set.len(), 1);
        assert_eq!(set.wake_all(), 1);
    }
}
