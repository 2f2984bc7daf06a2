use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use clap::ValueEnum;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::message::{Author, Message, SessionId, User};

/// Delivery handle the hub pushes a participant's messages through. The
/// receiving half stays with that participant's session; the hub never
/// holds it.
pub type Delivery = mpsc::Sender<Message>;

// Senders block once this many membership/broadcast events are queued.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// What the hub does with a participant whose outbound buffer is full at
/// fan-out time. The hub itself never blocks on a recipient either way.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the message for that participant and keep them registered.
    DropNewest,
    /// Evict the participant; closing their queue ends their session.
    Disconnect,
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Messages buffered per participant before `overflow` applies.
    pub outbound_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            overflow: OverflowPolicy::DropNewest,
        }
    }
}

enum HubEvent {
    Join { user: User, outbound: Delivery },
    Leave { user: User },
    Broadcast { message: Message },
}

struct Member {
    session: SessionId,
    outbound: Delivery,
}

/// The one task allowed to touch the membership table. Sessions reach it
/// exclusively through [`HubHandle`] events, applied strictly one at a
/// time: a join, leave, or broadcast is finished before the next event
/// is looked at.
pub struct Hub {
    events: mpsc::Receiver<HubEvent>,
    members: HashMap<Arc<str>, Member>,
    config: HubConfig,
}

impl Hub {
    /// Spawns the hub event loop and returns the handle everything else
    /// uses to reach it. The loop ends once every handle is dropped and
    /// the queued events are drained.
    pub fn spawn(config: HubConfig) -> HubHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let hub = Hub {
            events: events_rx,
            members: HashMap::new(),
            config,
        };
        tokio::spawn(hub.run());
        HubHandle {
            events: events_tx,
            sessions: Arc::new(AtomicU64::new(1)),
            outbound_capacity: config.outbound_capacity,
        }
    }

    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.apply(event);
        }
        debug!("hub event loop finished");
    }

    fn apply(&mut self, event: HubEvent) {
        match event {
            HubEvent::Join { user, outbound } => {
                // Dropping a displaced entry's sender closes that
                // session's queue, which ends its session.
                let displaced = self.members.insert(
                    user.name.clone(),
                    Member {
                        session: user.session,
                        outbound,
                    },
                );
                if displaced.is_some() {
                    warn!(user = %user.name, "name re-registered; earlier session displaced");
                }
                info!(user = %user.name, participants = self.members.len(), "joined");
                self.fan_out(Message::new(
                    Author::Bot,
                    format!("{} has joined", user.name),
                ));
            }
            HubEvent::Leave { user } => {
                // The entry only comes out if it still belongs to this
                // session; a later join under the same name keeps its
                // slot. The announcement goes out either way.
                if self
                    .members
                    .get(&user.name)
                    .is_some_and(|member| member.session == user.session)
                {
                    self.members.remove(&user.name);
                }
                info!(user = %user.name, participants = self.members.len(), "left");
                self.fan_out(Message::new(Author::Bot, format!("{} has left", user.name)));
            }
            HubEvent::Broadcast { message } => self.fan_out(message),
        }
    }

    fn fan_out(&mut self, message: Message) {
        let mut evicted = Vec::new();
        for (name, member) in &self.members {
            match member.outbound.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => match self.config.overflow {
                    OverflowPolicy::DropNewest => {
                        warn!(user = %name, "outbound buffer full; message dropped");
                    }
                    OverflowPolicy::Disconnect => {
                        warn!(user = %name, "outbound buffer full; disconnecting");
                        evicted.push(name.clone());
                    }
                },
                // Queue already closed: the session is tearing down and
                // its own leave event will announce the departure.
                Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(name.clone()),
            }
        }
        for name in evicted {
            self.members.remove(&name);
        }
    }
}

/// Cloneable front door to the hub: one per session plus one kept by the
/// server. All membership and broadcast traffic funnels through it as
/// events.
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::Sender<HubEvent>,
    sessions: Arc<AtomicU64>,
    outbound_capacity: usize,
}

impl HubHandle {
    /// Mints the identity for one connection. The session id is what
    /// distinguishes two connections that registered the same name.
    pub fn new_user(&self, name: impl Into<Arc<str>>) -> User {
        User::new(name, self.sessions.fetch_add(1, Ordering::Relaxed))
    }

    /// Opens a participant's outbound queue. The sender half is handed
    /// to the hub at join time; the receiver stays with the session's
    /// writer half.
    pub fn outbound_channel(&self) -> (Delivery, mpsc::Receiver<Message>) {
        mpsc::channel(self.outbound_capacity)
    }

    pub async fn join(&self, user: User, outbound: Delivery) {
        self.send(HubEvent::Join { user, outbound }).await;
    }

    pub async fn leave(&self, user: User) {
        self.send(HubEvent::Leave { user }).await;
    }

    pub async fn broadcast(&self, message: Message) {
        self.send(HubEvent::Broadcast { message }).await;
    }

    async fn send(&self, event: HubEvent) {
        if self.events.send(event).await.is_err() {
            warn!("hub event loop is gone; event discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hub(config: HubConfig) -> Hub {
        let (_events_tx, events) = mpsc::channel(1);
        Hub {
            events,
            members: HashMap::new(),
            config,
        }
    }

    fn join(hub: &mut Hub, name: &str, session: SessionId, capacity: usize) -> mpsc::Receiver<Message> {
        let (outbound, rx) = mpsc::channel(capacity);
        hub.apply(HubEvent::Join {
            user: User::new(name, session),
            outbound,
        });
        rx
    }

    fn chat(name: &str, text: &str) -> Message {
        Message::new(Author::User(name.into()), text)
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) {
        while rx.try_recv().is_ok() {}
    }

    #[test]
    fn joining_session_hears_its_own_join_notice() {
        let mut hub = test_hub(HubConfig::default());
        let mut rx = join(&mut hub, "alice", 1, 8);

        let notice = rx.try_recv().expect("join notice queued");
        assert_eq!(notice.sender, Author::Bot);
        assert_eq!(notice.text, "alice has joined");
    }

    #[test]
    fn broadcast_reaches_every_member_exactly_once() {
        let mut hub = test_hub(HubConfig::default());
        let mut receivers = vec![
            join(&mut hub, "alice", 1, 8),
            join(&mut hub, "bob", 2, 8),
            join(&mut hub, "carol", 3, 8),
        ];
        for rx in &mut receivers {
            drain(rx);
        }

        hub.apply(HubEvent::Broadcast {
            message: chat("alice", "hello"),
        });

        for rx in &mut receivers {
            let delivered = rx.try_recv().expect("one delivery per member");
            assert_eq!(delivered.sender, Author::User("alice".into()));
            assert_eq!(delivered.text, "hello");
            assert!(rx.try_recv().is_err(), "no duplicate deliveries");
        }
    }

    #[test]
    fn left_member_no_longer_receives_broadcasts() {
        let mut hub = test_hub(HubConfig::default());
        let mut alice = join(&mut hub, "alice", 1, 8);
        let mut bob = join(&mut hub, "bob", 2, 8);
        drain(&mut alice);
        drain(&mut bob);

        hub.apply(HubEvent::Leave {
            user: User::new("bob", 2),
        });
        hub.apply(HubEvent::Broadcast {
            message: chat("alice", "anyone?"),
        });

        assert_eq!(alice.try_recv().expect("leave notice").text, "bob has left");
        assert_eq!(alice.try_recv().expect("delivery").text, "anyone?");
        // bob's queue closed when the hub dropped its sender; the leave
        // notice itself was fanned out after his removal
        assert!(matches!(
            bob.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn second_join_with_the_same_name_takes_over_the_entry() {
        let mut hub = test_hub(HubConfig::default());
        let mut first = join(&mut hub, "alice", 1, 8);
        drain(&mut first);

        let mut second = join(&mut hub, "alice", 2, 8);

        assert_eq!(hub.members.len(), 1);
        assert_eq!(hub.members["alice"].session, 2);
        assert!(matches!(
            first.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(second.try_recv().expect("join notice").text, "alice has joined");

        // a leave from the displaced session keeps the takeover
        // registered but is still announced
        hub.apply(HubEvent::Leave {
            user: User::new("alice", 1),
        });
        assert_eq!(hub.members.len(), 1);
        assert_eq!(second.try_recv().expect("leave notice").text, "alice has left");

        hub.apply(HubEvent::Broadcast {
            message: chat("bob", "still there?"),
        });
        assert_eq!(second.try_recv().expect("delivery").text, "still there?");
    }

    #[test]
    fn full_buffer_drops_the_newest_message_under_the_default_policy() {
        let mut hub = test_hub(HubConfig {
            outbound_capacity: 1,
            overflow: OverflowPolicy::DropNewest,
        });
        let mut rx = join(&mut hub, "alice", 1, 1);

        // the join notice occupies the single slot, so this one overflows
        hub.apply(HubEvent::Broadcast {
            message: chat("bob", "dropped"),
        });

        assert_eq!(rx.try_recv().expect("buffered notice").text, "alice has joined");
        hub.apply(HubEvent::Broadcast {
            message: chat("bob", "delivered"),
        });
        assert_eq!(
            rx.try_recv().expect("delivery resumes once drained").text,
            "delivered"
        );
    }

    #[test]
    fn full_buffer_evicts_the_member_under_the_disconnect_policy() {
        let mut hub = test_hub(HubConfig {
            outbound_capacity: 1,
            overflow: OverflowPolicy::Disconnect,
        });
        let mut slow = join(&mut hub, "slow", 1, 1);
        let mut fast = join(&mut hub, "fast", 2, 8);

        // fast's join notice overflowed slow's single occupied slot
        assert_eq!(hub.members.len(), 1);
        assert!(hub.members.contains_key("fast"));
        assert_eq!(slow.try_recv().expect("buffered notice").text, "slow has joined");
        assert!(matches!(
            slow.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        hub.apply(HubEvent::Broadcast {
            message: chat("fast", "hello"),
        });
        assert_eq!(fast.try_recv().expect("join notice").text, "fast has joined");
        assert_eq!(fast.try_recv().expect("delivery").text, "hello");
    }

    #[tokio::test]
    async fn handle_preserves_broadcast_order_per_recipient() {
        let hub = Hub::spawn(HubConfig::default());
        let user = hub.new_user("alice");
        let (outbound, mut rx) = hub.outbound_channel();
        hub.join(user.clone(), outbound).await;

        for text in ["one", "two", "three"] {
            hub.broadcast(Message::new(Author::User(user.name.clone()), text))
                .await;
        }

        assert_eq!(rx.recv().await.expect("join notice").text, "alice has joined");
        for text in ["one", "two", "three"] {
            assert_eq!(rx.recv().await.expect("ordered delivery").text, text);
        }
    }
}
