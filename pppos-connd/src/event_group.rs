//! Named conditions shared between notification handlers and the orchestrator.
//!
//! Handlers [`EventGroup::set`] conditions from any task or thread. The
//! orchestrator clears the ones it is about to wait for and then blocks in
//! [`EventGroup::wait_any`] until at least one of them holds.

use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, time};

/// A set of conditions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Conditions(u8);

impl Conditions {
    /// An IPv4 address was acquired on the data link.
    pub const CONNECTED: Self = Self(1 << 0);
    /// The traffic probe received application data.
    pub const GOT_DATA: Self = Self(1 << 2);
    /// The transport lost the physical device.
    pub const DEVICE_DISCONNECTED: Self = Self(1 << 3);

    pub const ALL: Self = Self(
        Self::CONNECTED.0 | Self::GOT_DATA.0 | Self::DEVICE_DISCONNECTED.0,
    );

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every condition in `other` is in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if `self` and `other` share at least one condition.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for Conditions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Conditions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Conditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Conditions, &str); 3] = [
            (Conditions::CONNECTED, "CONNECTED"),
            (Conditions::GOT_DATA, "GOT_DATA"),
            (Conditions::DEVICE_DISCONNECTED, "DEVICE_DISCONNECTED"),
        ];

        if self.is_empty() {
            return f.write_str("(empty)");
        }

        let mut first = true;
        for (cond, name) in NAMES {
            if self.contains(cond) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }

        Ok(())
    }
}

/// Cheap to clone; all clones observe the same conditions.
#[derive(Clone, Debug)]
pub struct EventGroup {
    tx: Arc<watch::Sender<Conditions>>,
}

impl Default for EventGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl EventGroup {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Conditions::empty());
        Self { tx: Arc::new(tx) }
    }

    /// Sets `conds`, waking every waiter interested in any of them.
    pub fn set(&self, conds: Conditions) {
        self.tx.send_if_modified(|current| {
            let before = *current;
            *current |= conds;
            *current != before
        });
    }

    pub fn clear(&self, conds: Conditions) {
        self.tx.send_if_modified(|current| {
            let before = *current;
            *current = current.difference(conds);
            *current != before
        });
    }

    pub fn get(&self) -> Conditions {
        *self.tx.borrow()
    }

    /// Blocks until at least one of `conds` is set and returns the subset of
    /// `conds` that holds. Conditions are not consumed by waiting.
    ///
    /// Returns an empty set if `timeout` elapses first. `None` waits forever.
    pub async fn wait_any(&self, conds: Conditions, timeout: Option<Duration>) -> Conditions {
        let mut rx = self.tx.subscribe();
        let wait = async move {
            match rx.wait_for(|current| current.intersects(conds)).await {
                Ok(current) => current.intersection(conds),
                // unreachable while `self` holds the sender
                Err(_) => Conditions::empty(),
            }
        };

        match timeout {
            None => wait.await,
            Some(timeout) => time::timeout(timeout, wait).await.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_immediately_when_already_set() {
        let events = EventGroup::new();
        events.set(Conditions::CONNECTED);

        let seen = events
            .wait_any(Conditions::CONNECTED, Some(Duration::from_millis(10)))
            .await;

        assert_eq!(seen, Conditions::CONNECTED);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_empty_set() {
        let events = EventGroup::new();
        events.set(Conditions::GOT_DATA);

        let seen = events
            .wait_any(Conditions::CONNECTED, Some(Duration::from_secs(90)))
            .await;

        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn wakes_on_set_from_another_thread() {
        let events = EventGroup::new();
        let setter = events.clone();

        let waiter = tokio::spawn(async move {
            events
                .wait_any(
                    Conditions::GOT_DATA | Conditions::DEVICE_DISCONNECTED,
                    None,
                )
                .await
        });

        std::thread::spawn(move || setter.set(Conditions::GOT_DATA))
            .join()
            .unwrap();

        assert_eq!(waiter.await.unwrap(), Conditions::GOT_DATA);
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_conditions_do_not_satisfy_a_wait() {
        let events = EventGroup::new();
        events.set(Conditions::CONNECTED);
        events.clear(Conditions::CONNECTED);

        let seen = events
            .wait_any(Conditions::CONNECTED, Some(Duration::from_secs(1)))
            .await;

        assert!(seen.is_empty());
        assert_eq!(events.get(), Conditions::empty());
    }

    #[tokio::test]
    async fn reports_only_the_awaited_subset() {
        let events = EventGroup::new();
        events.set(Conditions::GOT_DATA | Conditions::DEVICE_DISCONNECTED);

        let seen = events
            .wait_any(Conditions::CONNECTED | Conditions::DEVICE_DISCONNECTED, None)
            .await;

        assert_eq!(seen, Conditions::DEVICE_DISCONNECTED);
        // waiting does not consume
        assert_eq!(
            events.get(),
            Conditions::GOT_DATA | Conditions::DEVICE_DISCONNECTED
        );
    }

    #[test]
    fn debug_lists_condition_names() {
        assert_eq!(format!("{:?}", Conditions::empty()), "(empty)");
        assert_eq!(
            format!("{:?}", Conditions::CONNECTED | Conditions::DEVICE_DISCONNECTED),
            "CONNECTED | DEVICE_DISCONNECTED"
        );
        assert_eq!(
            format!("{:?}", Conditions::ALL.difference(Conditions::CONNECTED)),
            "GOT_DATA | DEVICE_DISCONNECTED"
        );
    }
}
