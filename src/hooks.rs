//! Event hook table.
//!
//! One optional callback per hook kind; registering again replaces the
//! previous callback. The table only stores hooks. The reactor fetches a
//! hook and invokes it after the table's lock has been released, so a hook
//! may freely call back into the engine.

use crate::conn::{Conn, NewConn};
use std::sync::{Arc, PoisonError, RwLock};

pub type OnConnect = Arc<dyn Fn(&Arc<dyn Conn>) + Send + Sync>;
pub type OnData = Arc<dyn Fn(&Arc<dyn Conn>, &[u8]) + Send + Sync>;
pub type OnClose = Arc<dyn Fn(&Arc<dyn Conn>) + Send + Sync>;
pub type OnNewConn = Arc<dyn Fn(&NewConn) + Send + Sync>;

#[derive(Default, Clone)]
struct Slots {
    connect: Option<OnConnect>,
    data: Option<OnData>,
    close: Option<OnClose>,
    new_conn: Option<OnNewConn>,
    new_inbound_conn: Option<OnNewConn>,
    new_outbound_conn: Option<OnNewConn>,
}

/// Holds the last-registered callback for each hook kind.
#[derive(Default)]
pub struct EventHooks {
    slots: RwLock<Slots>,
}

macro_rules! hook_slot {
    ($set:ident, $get:ident, $field:ident, $ty:ty) => {
        pub fn $set(&self, hook: $ty) {
            self.slots
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .$field = Some(hook);
        }

        pub fn $get(&self) -> Option<$ty> {
            self.slots
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .$field
                .clone()
        }
    };
}

impl EventHooks {
    pub fn new() -> Self {
        Self::default()
    }

    hook_slot!(set_connect, connect, connect, OnConnect);
    hook_slot!(set_data, data, data, OnData);
    hook_slot!(set_close, close, close, OnClose);
    hook_slot!(set_new_conn, new_conn, new_conn, OnNewConn);
    hook_slot!(
        set_new_inbound_conn,
        new_inbound_conn,
        new_inbound_conn,
        OnNewConn
    );
    hook_slot!(
        set_new_outbound_conn,
        new_outbound_conn,
        new_outbound_conn,
        OnNewConn
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnKind, Direction};
    use crate::testing::StubConn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unset_hooks_are_none() {
        let hooks = EventHooks::new();
        assert!(hooks.connect().is_none());
        assert!(hooks.data().is_none());
        assert!(hooks.close().is_none());
        assert!(hooks.new_conn().is_none());
        assert!(hooks.new_inbound_conn().is_none());
        assert!(hooks.new_outbound_conn().is_none());
    }

    #[test]
    fn test_last_registration_wins() {
        let hooks = EventHooks::new();
        let hits = Arc::new(AtomicUsize::new(0));

        hooks.set_data(Arc::new(|_: &Arc<dyn Conn>, _: &[u8]| {
            panic!("replaced hook must not run")
        }));
        let counter = Arc::clone(&hits);
        hooks.set_data(Arc::new(move |_: &Arc<dyn Conn>, data: &[u8]| {
            counter.fetch_add(data.len(), Ordering::SeqCst);
        }));

        let conn: Arc<dyn Conn> = StubConn::new(1);
        let hook = hooks.data().unwrap();
        hook(&conn, &b"hello"[..]);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_slots_are_independent() {
        let hooks = EventHooks::new();
        let inbound = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&inbound);
        hooks.set_new_inbound_conn(Arc::new(move |info: &NewConn| {
            assert_eq!(info.direction, Direction::Inbound);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(hooks.new_conn().is_none());
        assert!(hooks.new_outbound_conn().is_none());

        let info = NewConn {
            fd: 4,
            kind: ConnKind::Stream,
            direction: Direction::Inbound,
            local_addr: None,
            peer_addr: None,
        };
        hooks.new_inbound_conn().unwrap()(&info);
        assert_eq!(inbound.load(Ordering::SeqCst), 1);
    }
}
