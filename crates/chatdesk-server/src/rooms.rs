use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use chatdesk_core::ids::SessionId;

use crate::client::{ClientId, ClientRegistry};

/// A named delivery group.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Room {
    /// Everyone watching one chat session.
    Session(SessionId),
    /// Every agent connection.
    Agents,
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session:{id}"),
            Self::Agents => f.write_str("agents"),
        }
    }
}

/// Per-broadcast delivery counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

/// Room membership for live connections.
///
/// Two indexes are kept: room → members for fan-out and client → rooms for
/// teardown. A client whose registration is gone is never left subscribed.
pub struct RoomRouter {
    registry: Arc<ClientRegistry>,
    rooms: DashMap<Room, HashSet<ClientId>>,
    memberships: DashMap<ClientId, HashSet<Room>>,
}

impl RoomRouter {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self {
            registry,
            rooms: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Add `client_id` to `room`. Returns true if newly subscribed.
    /// Repeated subscriptions are no-ops.
    pub fn subscribe(&self, client_id: &ClientId, room: Room) -> bool {
        if !self.registry.contains(client_id) {
            return false;
        }

        let added = self
            .rooms
            .entry(room.clone())
            .or_default()
            .insert(client_id.clone());
        self.memberships
            .entry(client_id.clone())
            .or_default()
            .insert(room.clone());

        // Raced with teardown: undo so no stale member lingers.
        if !self.registry.contains(client_id) {
            self.unsubscribe_all(client_id);
            return false;
        }

        if added {
            tracing::debug!(client_id = %client_id, room = %room, "subscribed");
        }
        added
    }

    pub fn unsubscribe(&self, client_id: &ClientId, room: &Room) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(mut members) => members.remove(client_id),
            None => false,
        };
        self.rooms.remove_if(room, |_, members| members.is_empty());

        if let Some(mut rooms) = self.memberships.get_mut(client_id) {
            rooms.remove(room);
        }
        self.memberships
            .remove_if(client_id, |_, rooms| rooms.is_empty());

        removed
    }

    /// Drop every subscription held by `client_id`. Returns how many rooms it left.
    pub fn unsubscribe_all(&self, client_id: &ClientId) -> usize {
        let Some((_, rooms)) = self.memberships.remove(client_id) else {
            return 0;
        };
        for room in &rooms {
            if let Some(mut members) = self.rooms.get_mut(room) {
                members.remove(client_id);
            }
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
        rooms.len()
    }

    pub fn members(&self, room: &Room) -> Vec<ClientId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, client_id: &ClientId) -> Vec<Room> {
        self.memberships
            .get(client_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Deliver `message` to every member of `room`.
    pub fn broadcast(&self, room: &Room, message: &str) -> Delivery {
        self.deliver(self.members(room), message)
    }

    /// Deliver `message` once to each connection in any of `rooms`.
    pub fn broadcast_union(&self, rooms: &[Room], message: &str) -> Delivery {
        self.broadcast_union_with(rooms, None, message)
    }

    /// Like [`broadcast_union`](Self::broadcast_union), but `origin` also
    /// receives the message even when it is not a member of any room.
    pub fn broadcast_union_with(
        &self,
        rooms: &[Room],
        origin: Option<&ClientId>,
        message: &str,
    ) -> Delivery {
        let mut targets: HashSet<ClientId> = origin.into_iter().cloned().collect();
        for room in rooms {
            if let Some(members) = self.rooms.get(room) {
                targets.extend(members.iter().cloned());
            }
        }
        self.deliver(targets, message)
    }

    fn deliver(&self, targets: impl IntoIterator<Item = ClientId>, message: &str) -> Delivery {
        let mut delivery = Delivery::default();
        for client_id in targets {
            if self.registry.send_to(&client_id, message.to_string()) {
                delivery.delivered += 1;
            } else {
                delivery.dropped += 1;
            }
        }
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn router() -> RoomRouter {
        RoomRouter::new(Arc::new(ClientRegistry::new(16)))
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn session_room(id: &str) -> Room {
        Room::Session(SessionId::from_raw(id))
    }

    #[test]
    fn room_display() {
        assert_eq!(session_room("chat_1").to_string(), "session:chat_1");
        assert_eq!(Room::Agents.to_string(), "agents");
    }

    #[test]
    fn subscribe_is_idempotent() {
        let router = router();
        let (client, mut rx) = router.registry().register();

        assert!(router.subscribe(&client, session_room("chat_1")));
        assert!(!router.subscribe(&client, session_room("chat_1")));
        assert_eq!(router.members(&session_room("chat_1")), vec![client.clone()]);

        let delivery = router.broadcast(&session_room("chat_1"), "once");
        assert_eq!(delivery.delivered, 1);
        assert_eq!(drain(&mut rx), vec!["once"]);
    }

    #[test]
    fn unregistered_client_cannot_subscribe() {
        let router = router();
        assert!(!router.subscribe(&ClientId::new(), Room::Agents));
        assert_eq!(router.room_count(), 0);
    }

    #[test]
    fn broadcast_reaches_only_room_members() {
        let router = router();
        let (a, mut rx_a) = router.registry().register();
        let (b, mut rx_b) = router.registry().register();
        router.subscribe(&a, session_room("chat_1"));
        router.subscribe(&b, session_room("chat_2"));

        router.broadcast(&session_room("chat_1"), "for one");

        assert_eq!(drain(&mut rx_a), vec!["for one"]);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn broadcast_union_delivers_once_per_connection() {
        let router = router();
        let (agent, mut rx_agent) = router.registry().register();
        let (visitor, mut rx_visitor) = router.registry().register();
        router.subscribe(&agent, Room::Agents);
        router.subscribe(&agent, session_room("chat_1"));
        router.subscribe(&visitor, session_room("chat_1"));

        let delivery =
            router.broadcast_union(&[session_room("chat_1"), Room::Agents], "hello");

        assert_eq!(delivery.delivered, 2);
        assert_eq!(drain(&mut rx_agent), vec!["hello"]);
        assert_eq!(drain(&mut rx_visitor), vec!["hello"]);
    }

    #[test]
    fn origin_is_included_once() {
        let router = router();
        let (member, mut rx_member) = router.registry().register();
        let (outsider, mut rx_outsider) = router.registry().register();
        router.subscribe(&member, session_room("chat_1"));

        let delivery =
            router.broadcast_union_with(&[session_room("chat_1")], Some(&outsider), "hi");
        assert_eq!(delivery.delivered, 2);
        assert_eq!(drain(&mut rx_outsider), vec!["hi"]);

        let delivery =
            router.broadcast_union_with(&[session_room("chat_1")], Some(&member), "again");
        assert_eq!(delivery.delivered, 1);
        assert_eq!(drain(&mut rx_member), vec!["hi", "again"]);
    }

    #[test]
    fn unsubscribe_all_clears_both_indexes() {
        let router = router();
        let (client, _rx) = router.registry().register();
        router.subscribe(&client, Room::Agents);
        router.subscribe(&client, session_room("chat_1"));
        assert_eq!(router.rooms_of(&client).len(), 2);

        assert_eq!(router.unsubscribe_all(&client), 2);
        assert!(router.rooms_of(&client).is_empty());
        assert!(router.members(&Room::Agents).is_empty());
        assert_eq!(router.room_count(), 0);
    }

    #[test]
    fn unsubscribe_single_room() {
        let router = router();
        let (client, _rx) = router.registry().register();
        router.subscribe(&client, Room::Agents);
        router.subscribe(&client, session_room("chat_1"));

        assert!(router.unsubscribe(&client, &Room::Agents));
        assert!(!router.unsubscribe(&client, &Room::Agents));
        assert_eq!(router.rooms_of(&client), vec![session_room("chat_1")]);
    }

    #[test]
    fn disconnected_member_counts_as_dropped() {
        let router = router();
        let (gone, rx) = router.registry().register();
        let (live, mut rx_live) = router.registry().register();
        router.subscribe(&gone, Room::Agents);
        router.subscribe(&live, Room::Agents);
        drop(rx);

        let delivery = router.broadcast(&Room::Agents, "ping");
        assert_eq!(delivery, Delivery { delivered: 1, dropped: 1 });
        assert_eq!(drain(&mut rx_live), vec!["ping"]);
    }
}
