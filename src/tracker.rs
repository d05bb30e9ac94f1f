use std::time::{Duration, Instant};

/// Keepalive bookkeeping for a single connection. The keepalive task asks
/// it when to ping and when the peer should be considered dead
#[derive(Debug)]
pub(crate) struct Tracker {
    /// Last outgoing packet time
    last_outgoing: Instant,
    /// Last incoming packet time
    last_incoming: Instant,
    /// Time the unanswered pingreq went out
    pending_ping: Option<Instant>,
}

impl Tracker {
    pub fn new() -> Tracker {
        Tracker {
            last_outgoing: Instant::now(),
            last_incoming: Instant::now(),
            pending_ping: None,
        }
    }

    pub fn packet_sent(&mut self) {
        self.last_outgoing = Instant::now();
    }

    pub fn packet_received(&mut self) {
        self.last_incoming = Instant::now();
    }

    pub fn ping_sent(&mut self) {
        self.pending_ping = Some(Instant::now());
        self.packet_sent();
    }

    pub fn pong_received(&mut self) {
        self.pending_ping = None;
        self.packet_received();
    }

    /// Time since the last incoming and outgoing packet
    pub fn silence(&self) -> (Duration, Duration) {
        (self.last_incoming.elapsed(), self.last_outgoing.elapsed())
    }

    /// Ping after half a keepalive of write side silence, but never while
    /// one is already in flight
    pub fn should_ping(&self, keep_alive: Duration) -> bool {
        self.pending_ping.is_none() && self.last_outgoing.elapsed() >= keep_alive / 2
    }

    /// The peer is dead once a pingreq went unanswered for a full
    /// keepalive interval
    pub fn dead(&self, keep_alive: Duration) -> bool {
        matches!(self.pending_ping, Some(sent) if sent.elapsed() >= keep_alive)
    }
}
