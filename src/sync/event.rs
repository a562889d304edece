use event_listener::Event;

/// A notify-all wakeup primitive for state guarded elsewhere.
///
/// [`Signal`] plays the role of a condition variable for async waiters: a
/// state change is published by calling [`notify_all`](Signal::notify_all)
/// *after* the change is visible, and waiters poll their predicate through
/// [`wait_until`](Signal::wait_until), which re-checks between registering a
/// listener and awaiting it so that no notification can be lost.
///
/// The primitive itself carries no state; the predicate closure is expected
/// to read the guarded state (typically behind a mutex or an atomic).
#[derive(Default)]
pub(crate) struct Signal {
    event: Event,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self { event: Event::new() }
    }

    /// Wakes every currently registered waiter.
    pub(crate) fn notify_all(&self) {
        self.event.notify(usize::MAX);
    }

    /// Waits until `pred` returns true.
    ///
    /// The predicate is evaluated before registering a listener, again right
    /// after registering (a notification may have fired in between), and once
    /// more after every wakeup.
    pub(crate) async fn wait_until<F>(&self, pred: F)
    where
        F: Fn() -> bool,
    {
        loop {
            if pred() {
                return;
            }

            let listener = self.event.listen();

            if pred() {
                return;
            }

            listener.await;
        }
    }

    /// Waits for one notification, whatever the state.
    ///
    /// Callers are responsible for re-checking their predicate afterwards,
    /// exactly as with a bare condition variable.
    pub(crate) async fn wait(&self) {
        self.event.listen().await;
    }
}
