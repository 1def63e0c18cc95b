//! Session table and the per-packet state machine.
//!
//! All mutation happens under one lock shared by the datagram handler, the
//! inactivity sweeper, and the shutdown path. The machine itself is
//! synchronous and returns the datagrams to send, keeping the I/O loop thin
//! and the sequencing rules testable without sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uap_protocol::{Command, LogicalClock, Packet};

/// How long a closed session id is remembered so a stale datagram racing
/// the sweeper does not provoke a second GOODBYE.
const CLOSED_TTL: Duration = Duration::from_secs(60);

/// State carried for one open session, keyed by session id in the table.
#[derive(Debug, Clone)]
pub struct Session {
    /// UDP address the session was created from; replies go here.
    pub peer: SocketAddr,
    /// Last time a non-duplicate packet was accepted.
    pub last_active: Instant,
    /// The next sequence number this session should produce.
    pub expected_seq: u32,
}

/// A datagram the state machine wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub packet: Packet,
    pub to: SocketAddr,
}

/// Open sessions, recently closed ids, and the server's logical clock.
///
/// A session id is present in `sessions` iff the session is open; closing
/// always deletes the entry and records the id in the closed memory.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<u32, Session>,
    closed: HashMap<u32, Instant>,
    clock: LogicalClock,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains(&self, session_id: u32) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Expected sequence number for an open session, if any. Test hook.
    pub fn expected_seq(&self, session_id: u32) -> Option<u32> {
        self.sessions.get(&session_id).map(|s| s.expected_seq)
    }

    /// Whether a closed id is still inside its remembered window.
    pub fn is_recently_closed(&self, session_id: u32) -> bool {
        self.closed.contains_key(&session_id)
    }

    /// Run one received packet through the state machine.
    ///
    /// Returns the replies to send. Packets that fail the duplicate check
    /// produce no reply; a regression beyond a duplicate terminates the
    /// session with a GOODBYE.
    pub fn handle_packet(&mut self, packet: &Packet, from: SocketAddr, now: Instant) -> Vec<Outgoing> {
        self.clock.observe(packet.clock);
        let sid = packet.session_id;
        let seq = packet.seq;

        let Some(session) = self.sessions.get(&sid) else {
            // Any command opens a session; a reused id sheds its closed marker.
            self.closed.remove(&sid);
            println!("{sid:#x} [{seq}] Session created");
            self.sessions.insert(
                sid,
                Session {
                    peer: from,
                    last_active: now,
                    expected_seq: seq,
                },
            );
            return vec![self.reply(Command::Alive, seq.wrapping_add(1), sid, from)];
        };

        let expected = session.expected_seq;
        let peer = session.peer;

        if expected.checked_sub(1) == Some(seq) {
            println!("{sid:#x} [{seq}] Duplicate packet");
            return Vec::new();
        }

        if seq < expected {
            // Regressed further than a retransmit could explain.
            println!("{sid:#x} [{seq}] Protocol Error");
            println!("{sid:#x} Session closed");
            self.close(sid, now);
            return vec![self.reply(Command::Goodbye, seq.wrapping_add(1), sid, peer)];
        }

        if seq > expected {
            for missing in expected..seq {
                if missing != 0 {
                    println!("{sid:#x} [{missing}] Lost packet");
                }
            }
        }

        if let Some(session) = self.sessions.get_mut(&sid) {
            session.expected_seq = seq.wrapping_add(1);
            session.last_active = now;
        }

        match packet.command {
            Command::Hello => vec![self.reply(Command::Alive, seq.wrapping_add(1), sid, peer)],
            Command::Data => {
                if packet.payload.trim().eq_ignore_ascii_case("q") {
                    println!("{sid:#x} [{seq}] Terminating session as requested by client");
                    let goodbye = self.reply(Command::Goodbye, seq.wrapping_add(1), sid, peer);
                    println!("{sid:#x} Session closed");
                    self.close(sid, now);
                    vec![goodbye]
                } else {
                    println!("{sid:#x} [{seq}] {}", packet.payload);
                    vec![self.reply(Command::Alive, seq.wrapping_add(1), sid, peer)]
                }
            }
            // Clients do not normally send ALIVE; accept it without replying.
            Command::Alive => Vec::new(),
            Command::Goodbye => {
                println!("{sid:#x} [{seq}] GOODBYE from client");
                println!("{sid:#x} Session closed");
                let goodbye = self.reply(Command::Goodbye, seq.wrapping_add(1), sid, peer);
                self.close(sid, now);
                vec![goodbye]
            }
        }
    }

    /// Close sessions idle past `bound` and prune the closed-id memory.
    ///
    /// Callers run this every second while holding the table lock.
    pub fn sweep(&mut self, now: Instant, bound: Duration) -> Vec<Outgoing> {
        self.closed
            .retain(|_, closed_at| now.duration_since(*closed_at) < CLOSED_TTL);

        let expired: Vec<u32> = self
            .sessions
            .iter()
            .filter(|(_, session)| now.duration_since(session.last_active) > bound)
            .map(|(sid, _)| *sid)
            .collect();

        let mut goodbyes = Vec::with_capacity(expired.len());
        for sid in expired {
            // One lock serializes the handler, this sweeper, and shutdown,
            // and every close removes the id from the table in the same
            // call, so an expired id is never already in the closed memory.
            // No membership check is needed before the GOODBYE.
            if let Some(session) = self.sessions.remove(&sid) {
                self.closed.insert(sid, now);
                goodbyes.push(self.reply(Command::Goodbye, 0, sid, session.peer));
                println!(
                    "{sid:#x} Session timed out due to inactivity. Sent GOODBYE to {}.",
                    session.peer
                );
            }
        }
        goodbyes
    }

    /// Send GOODBYE to every open session and clear the table.
    ///
    /// The operator-quit path: the server is about to exit.
    pub fn terminate_all(&mut self, now: Instant) -> Vec<Outgoing> {
        let open: Vec<(u32, SocketAddr)> = self
            .sessions
            .iter()
            .map(|(sid, session)| (*sid, session.peer))
            .collect();

        let mut goodbyes = Vec::with_capacity(open.len());
        for (sid, peer) in open {
            goodbyes.push(self.reply(Command::Goodbye, 0, sid, peer));
            println!("{sid:#x} Terminating session. Sent GOODBYE to {peer}.");
            self.closed.insert(sid, now);
        }
        self.sessions.clear();
        goodbyes
    }

    fn close(&mut self, session_id: u32, now: Instant) {
        self.sessions.remove(&session_id);
        self.closed.insert(session_id, now);
    }

    fn reply(&mut self, command: Command, seq: u32, session_id: u32, to: SocketAddr) -> Outgoing {
        let clock = self.clock.tick();
        Outgoing {
            packet: Packet::control(command, seq, session_id, clock),
            to,
        }
    }
}
