// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokio driver for a single connection.
//!
//! The state machine itself is synchronous; this actor gives it a mailbox,
//! a clock and a place to put outgoing envelopes. Each connection gets its
//! own task, which serializes all access to the machine. The task yields
//! between queued deliveries so observers can witness intermediate states.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cohort_core::Hash;
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::{ConnectionEvent, ConnectionLike};
use crate::message::Envelope;

/// Inputs accepted by a running connection actor.
#[derive(Debug)]
pub enum Command {
    Deliver(Envelope),
    LocalUpdate(Hash),
    Stop,
}

/// Handle for feeding a spawned connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    pub fn deliver(&self, envelope: Envelope) {
        let _ = self.commands.send(Command::Deliver(envelope));
    }

    pub fn local_update(&self, head: Hash) {
        let _ = self.commands.send(Command::LocalUpdate(head));
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

/// Spawn a connection onto the runtime.
///
/// Outgoing envelopes are pushed into `outbound` for the transport adapter;
/// events are pushed into `events` for the application. The task ends once
/// the connection disconnects or every handle is dropped.
pub fn spawn(
    mut connection: impl ConnectionLike + 'static,
    outbound: mpsc::UnboundedSender<Envelope>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> ConnectionHandle {
    let (commands, mut mailbox) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        connection.start(now_millis());
        if flush(&mut connection, &outbound, &events) {
            return;
        }

        loop {
            let wait = connection
                .deadline()
                .map(|deadline| deadline.saturating_sub(now_millis()));

            tokio::select! {
                command = mailbox.recv() => match command {
                    Some(Command::Deliver(envelope)) => {
                        connection.deliver(envelope, now_millis());
                    }
                    Some(Command::LocalUpdate(head)) => {
                        connection.local_update(head, now_millis());
                    }
                    Some(Command::Stop) | None => {
                        connection.stop(now_millis());
                        flush(&mut connection, &outbound, &events);
                        break;
                    }
                },
                _ = tokio::time::sleep(Duration::from_millis(wait.unwrap_or(0))), if wait.is_some() => {
                    connection.on_timeout(now_millis());
                }
            }

            if flush(&mut connection, &outbound, &events) {
                break;
            }

            // Let observers see intermediate states between deliveries.
            tokio::task::yield_now().await;
        }
        debug!(peer = %connection.peer_id(), "connection actor finished");
    });

    ConnectionHandle { commands }
}

/// Forward pending output; returns `true` once the connection disconnected.
fn flush(
    connection: &mut impl ConnectionLike,
    outbound: &mpsc::UnboundedSender<Envelope>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> bool {
    for envelope in connection.take_outbox() {
        if outbound.send(envelope).is_err() {
            return true;
        }
    }
    let mut finished = false;
    for event in connection.take_events() {
        if matches!(event, ConnectionEvent::Disconnected { .. }) {
            finished = true;
        }
        let _ = events.send(event);
    }
    finished
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, RwLock};

    use cohort_auth::Team;
    use cohort_auth::state::ADMIN_ROLE;
    use cohort_auth::test_utils::{context_for, member_record};
    use cohort_core::crypto::Rng;
    use tokio::sync::mpsc;

    use crate::connection::{Connection, ConnectionEvent};

    use super::spawn;

    #[tokio::test]
    async fn actors_drive_two_peers_to_connected() {
        let mut alice =
            Team::create("spies", context_for("alice"), Rng::from_seed([1; 32])).unwrap();
        alice
            .add_member(member_record("bob", false), vec![ADMIN_ROLE.to_string()])
            .unwrap();
        let bytes = alice.save().unwrap();
        let bob = Team::load(&bytes, context_for("bob"), Rng::from_seed([2; 32])).unwrap();

        let a = Connection::new_member(
            "alice-laptop".into(),
            "bob-laptop".into(),
            Arc::new(RwLock::new(Some(alice))),
            Rng::from_seed([11; 32]),
        )
        .unwrap();
        let b = Connection::new_member(
            "bob-laptop".into(),
            "alice-laptop".into(),
            Arc::new(RwLock::new(Some(bob))),
            Rng::from_seed([12; 32]),
        )
        .unwrap();

        let (a_out_tx, mut a_out_rx) = mpsc::unbounded_channel();
        let (a_events_tx, mut a_events_rx) = mpsc::unbounded_channel();
        let (b_out_tx, mut b_out_rx) = mpsc::unbounded_channel();
        let (b_events_tx, mut b_events_rx) = mpsc::unbounded_channel();

        let a_handle = spawn(a, a_out_tx, a_events_tx);
        let b_handle = spawn(b, b_out_tx, b_events_tx);

        // Relay envelopes between the two actors.
        let b_for_relay = b_handle.clone();
        tokio::spawn(async move {
            while let Some(envelope) = a_out_rx.recv().await {
                b_for_relay.deliver(envelope);
            }
        });
        let a_for_relay = a_handle.clone();
        tokio::spawn(async move {
            while let Some(envelope) = b_out_rx.recv().await {
                a_for_relay.deliver(envelope);
            }
        });

        let wait_connected = async move {
            let mut a_connected = false;
            let mut b_connected = false;
            while !(a_connected && b_connected) {
                tokio::select! {
                    event = a_events_rx.recv() => {
                        if matches!(event, Some(ConnectionEvent::Connected)) {
                            a_connected = true;
                        }
                    }
                    event = b_events_rx.recv() => {
                        if matches!(event, Some(ConnectionEvent::Connected)) {
                            b_connected = true;
                        }
                    }
                }
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), wait_connected)
            .await
            .expect("both sides reach connected");

        a_handle.stop();
        b_handle.stop();
    }
}
