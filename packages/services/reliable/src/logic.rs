use std::collections::{HashMap, VecDeque};

use rand::Rng;
use satlink_codec::Value;

use crate::{
    config::{negotiate, ReliableConfig},
    error::ReliableError,
    frame::{Frame, LEVEL_RESET, LEVEL_RESET_ACK, LEVEL_RESET_ACK2},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reset requested, waiting for the peer's ack.
    Reset1,
    /// Peer's reset acked, waiting for its ack2 or first data.
    Reset2,
    Up,
    Closed,
}

#[derive(Debug, PartialEq)]
pub enum ReliableOutput<C> {
    Transmit(Value),
    Deliver(Value),
    Acked(C),
    Failed(C),
    Up,
    Down,
    Closed(Option<String>),
    Fatal(String),
}

struct Pending<C> {
    value: Value,
    done: Option<C>,
    ephemeral: Option<u32>,
}

struct SendSlot<C> {
    msg: Pending<C>,
    /// `None` once selectively acked.
    deadline: Option<u64>,
    retries: u32,
}

fn fresh_nonce() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

/// Sans-io sliding window ARQ.
///
/// Both directions keep a head and a tail. Sending, the head is the next
/// sequence number to use and the tail the oldest unacked one. Receiving, the
/// head is one past the newest accepted frame and the tail the oldest frame
/// not yet delivered. Neither side lets head and tail drift more than half a
/// window apart, which lets the receiver tell stale retransmits from new frames.
///
/// `C` is an opaque completion handle, returned via [`ReliableOutput::Acked`]
/// or [`ReliableOutput::Failed`].
pub struct ReliableLogic<C> {
    config: ReliableConfig,
    window: u32,
    timeout_ms: u64,
    phase: Phase,
    nonce: u32,
    peer_nonce: u32,
    reset_deadline: Option<u64>,
    reset_attempts: u32,
    send_head: u32,
    send_tail: u32,
    recv_head: u32,
    recv_tail: u32,
    send_slots: HashMap<u32, SendSlot<C>>,
    recv_slots: HashMap<u32, Value>,
    queue: VecDeque<Pending<C>>,
    ack_due: Option<u64>,
    gap_deadline: Option<u64>,
    output: VecDeque<ReliableOutput<C>>,
}

impl<C> ReliableLogic<C> {
    /// Starts in [`Phase::Reset1`] with a reset request already queued for transmission.
    pub fn new(config: ReliableConfig, now_ms: u64) -> Self {
        let mut logic = Self {
            window: config.window,
            timeout_ms: config.timeout_ms,
            config,
            phase: Phase::Reset1,
            nonce: 0,
            peer_nonce: 0,
            reset_deadline: None,
            reset_attempts: 0,
            send_head: 0,
            send_tail: 0,
            recv_head: 0,
            recv_tail: 0,
            send_slots: Default::default(),
            recv_slots: Default::default(),
            queue: Default::default(),
            ack_due: None,
            gap_deadline: None,
            output: Default::default(),
        };
        logic.enter_reset1(now_ms, "start");
        logic
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Negotiated window and timeout of the current session.
    pub fn params(&self) -> (u32, u64) {
        (self.window, self.timeout_ms)
    }

    pub fn in_flight(&self) -> u32 {
        self.dist(self.send_tail, self.send_head)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn push_msg(&mut self, now_ms: u64, value: Value, done: C) {
        if self.phase == Phase::Closed {
            self.output.push_back(ReliableOutput::Failed(done));
            return;
        }
        self.queue.push_back(Pending {
            value,
            done: Some(done),
            ephemeral: None,
        });
        self.fill_window(now_ms);
    }

    /// Queue `value` behind the other messages without a completion handle.
    pub fn push_detached(&mut self, now_ms: u64, value: Value) {
        if self.phase == Phase::Closed {
            return;
        }
        self.queue.push_back(Pending {
            value,
            done: None,
            ephemeral: None,
        });
        self.fill_window(now_ms);
    }

    /// Replaces a still untransmitted value of the same channel, or queues a new one.
    pub fn push_ephemeral(&mut self, now_ms: u64, channel: u32, value: Value) {
        if self.phase == Phase::Closed {
            return;
        }
        if let Some(pending) = self.queue.iter_mut().find(|p| p.ephemeral == Some(channel)) {
            log::trace!("[ReliableLogic] replace queued ephemeral on channel {}", channel);
            pending.value = value;
            return;
        }
        self.queue.push_back(Pending {
            value,
            done: None,
            ephemeral: Some(channel),
        });
        self.fill_window(now_ms);
    }

    pub fn on_frame(&mut self, now_ms: u64, value: Value) {
        if self.phase == Phase::Closed {
            log::debug!("[ReliableLogic] drop frame after close");
            return;
        }
        let frame = match Frame::from_value(&value) {
            Ok(frame) => frame,
            Err(e) => {
                self.protocol_violation(now_ms, e);
                return;
            }
        };
        match frame {
            Frame::Closed { reason } => {
                log::info!("[ReliableLogic] peer closed: {:?}", reason);
                self.fail_all();
                self.phase = Phase::Closed;
                self.output.push_back(ReliableOutput::Closed(reason));
            }
            Frame::Reset {
                level,
                window,
                timeout_ms,
                nonce,
                echo,
            } => self.on_control(now_ms, level, window, timeout_ms, nonce, echo),
            frame @ Frame::Data { .. } => {
                match self.phase {
                    Phase::Reset1 => {
                        log::debug!("[ReliableLogic] data while waiting for reset ack, resend reset");
                        self.send_control(LEVEL_RESET);
                        return;
                    }
                    Phase::Reset2 => {
                        log::info!("[ReliableLogic] data in reset level 2, peer is up");
                        self.go_up(now_ms);
                    }
                    _ => {}
                }
                if let Err(e) = frame.check_bounds(self.window) {
                    self.protocol_violation(now_ms, e);
                    return;
                }
                if let Frame::Data { seq, ack, selective, payload } = frame {
                    self.on_data(now_ms, seq, ack, &selective, payload);
                }
            }
        }
    }

    pub fn on_tick(&mut self, now_ms: u64) {
        match self.phase {
            Phase::Closed => {}
            Phase::Reset1 | Phase::Reset2 => {
                if self.reset_deadline.map_or(false, |d| d <= now_ms) {
                    self.reset_attempts += 1;
                    if self.reset_attempts > self.config.retries {
                        self.fatal(&format!("no answer to {} reset requests", self.reset_attempts));
                        return;
                    }
                    let level = if self.phase == Phase::Reset1 { LEVEL_RESET } else { LEVEL_RESET_ACK };
                    log::info!("[ReliableLogic] resend reset level {} attempt {}", level, self.reset_attempts);
                    self.send_control(level);
                    self.reset_deadline = Some(now_ms + self.timeout_ms);
                }
            }
            Phase::Up => {
                let mut due = vec![];
                let mut exhausted = None;
                let mut seq = self.send_tail;
                while seq != self.send_head {
                    if let Some(slot) = self.send_slots.get_mut(&seq) {
                        if slot.deadline.map_or(false, |d| d <= now_ms) {
                            slot.retries += 1;
                            if slot.retries > self.config.retries {
                                exhausted = Some(seq);
                                break;
                            }
                            slot.deadline = Some(now_ms + self.timeout_ms);
                            due.push(seq);
                        }
                    }
                    seq = (seq + 1) % self.window;
                }
                if let Some(seq) = exhausted {
                    self.enter_reset1(now_ms, &format!("seq {} retransmitted {} times", seq, self.config.retries));
                    return;
                }
                for seq in due {
                    log::debug!("[ReliableLogic] retransmit seq {}", seq);
                    self.transmit_data(seq);
                }
                if self.gap_deadline.map_or(false, |d| d <= now_ms) {
                    self.send_ack_only();
                    self.gap_deadline = Some(now_ms + self.timeout_ms);
                }
                if self.ack_due.map_or(false, |d| d <= now_ms) {
                    self.send_ack_only();
                }
                self.fill_window(now_ms);
            }
        }
    }

    /// Writing to the link failed. Starts a local reset when the session was up.
    pub fn on_link_error(&mut self, now_ms: u64, reason: &str) {
        if self.phase == Phase::Up {
            self.enter_reset1(now_ms, reason);
        } else {
            log::warn!("[ReliableLogic] link error during {:?}: {}", self.phase, reason);
        }
    }

    pub fn close(&mut self, reason: Option<String>) {
        if self.phase == Phase::Closed {
            return;
        }
        log::info!("[ReliableLogic] close: {:?}", reason);
        self.output.push_back(ReliableOutput::Transmit(Frame::Closed { reason: reason.clone() }.to_value()));
        self.fail_all();
        self.phase = Phase::Closed;
        self.output.push_back(ReliableOutput::Closed(reason));
    }

    pub fn next_deadline(&self) -> Option<u64> {
        match self.phase {
            Phase::Closed => None,
            Phase::Reset1 | Phase::Reset2 => self.reset_deadline,
            Phase::Up => self.send_slots.values().filter_map(|s| s.deadline).chain(self.gap_deadline).chain(self.ack_due).min(),
        }
    }

    pub fn pop_output(&mut self) -> Option<ReliableOutput<C>> {
        self.output.pop_front()
    }

    fn dist(&self, from: u32, to: u32) -> u32 {
        (to + self.window - from) % self.window
    }

    fn on_control(&mut self, now_ms: u64, level: u8, window: u32, timeout_ms: u64, nonce: u32, echo: u32) {
        match level {
            LEVEL_RESET => match self.phase {
                Phase::Reset1 => {
                    log::info!("[ReliableLogic] crossing reset, answer with level 2");
                    self.phase = Phase::Reset2;
                    self.peer_nonce = nonce;
                    self.merge(window, timeout_ms);
                    self.send_control(LEVEL_RESET_ACK);
                    self.reset_deadline = Some(now_ms + self.timeout_ms);
                }
                Phase::Reset2 => {
                    self.peer_nonce = nonce;
                    self.merge(window, timeout_ms);
                    self.send_control(LEVEL_RESET_ACK);
                }
                Phase::Up if nonce != 0 && nonce == self.peer_nonce => {
                    log::debug!("[ReliableLogic] repeated reset from current session, resend level 2");
                    self.send_control(LEVEL_RESET_ACK);
                }
                Phase::Up => self.enter_reset2(now_ms, nonce, window, timeout_ms),
                Phase::Closed => {}
            },
            LEVEL_RESET_ACK => {
                if echo != 0 && echo != self.nonce {
                    log::debug!("[ReliableLogic] ignore stale reset ack");
                    return;
                }
                match self.phase {
                    Phase::Reset1 | Phase::Reset2 => {
                        self.peer_nonce = nonce;
                        self.merge(window, timeout_ms);
                        self.send_control(LEVEL_RESET_ACK2);
                        self.go_up(now_ms);
                    }
                    Phase::Up => self.send_control(LEVEL_RESET_ACK2),
                    Phase::Closed => {}
                }
            }
            LEVEL_RESET_ACK2 => {
                if echo != 0 && echo != self.nonce {
                    log::debug!("[ReliableLogic] ignore stale reset ack2");
                    return;
                }
                match self.phase {
                    Phase::Reset1 => self.send_control(LEVEL_RESET),
                    Phase::Reset2 => {
                        self.merge(window, timeout_ms);
                        self.go_up(now_ms);
                    }
                    _ => {}
                }
            }
            _ => log::warn!("[ReliableLogic] unknown control level {}", level),
        }
    }

    fn on_data(&mut self, now_ms: u64, seq: u32, ack: u32, selective: &[u32], payload: Option<Value>) {
        let half = self.window / 2;
        let seq_dist = self.dist(self.recv_tail, seq);
        let head_dist = self.dist(self.recv_tail, self.recv_head);
        if let Some(payload) = payload {
            self.ack_due.get_or_insert(now_ms + self.config.ack_delay_ms);
            if seq_dist >= head_dist {
                if seq_dist < half {
                    self.recv_slots.insert(seq, payload);
                    self.recv_head = (seq + 1) % self.window;
                } else {
                    log::trace!("[ReliableLogic] drop stale seq {}", seq);
                }
            } else {
                self.recv_slots.entry(seq).or_insert(payload);
            }
        } else if seq_dist >= head_dist && seq_dist < half {
            self.recv_head = seq;
        }

        let in_flight = self.in_flight();
        if self.dist(self.send_tail, ack) <= in_flight {
            while self.send_tail != ack {
                if let Some(slot) = self.send_slots.remove(&self.send_tail) {
                    if let Some(done) = slot.msg.done {
                        self.output.push_back(ReliableOutput::Acked(done));
                    }
                }
                self.send_tail = (self.send_tail + 1) % self.window;
            }
        } else {
            log::trace!("[ReliableLogic] ignore stale ack {}", ack);
        }
        let in_flight = self.in_flight();
        for x in selective {
            if self.dist(self.send_tail, *x) >= in_flight {
                continue;
            }
            if let Some(slot) = self.send_slots.get_mut(x) {
                slot.deadline = None;
                if let Some(done) = slot.msg.done.take() {
                    self.output.push_back(ReliableOutput::Acked(done));
                }
            }
        }

        while self.recv_tail != self.recv_head {
            match self.recv_slots.remove(&self.recv_tail) {
                Some(value) => {
                    self.output.push_back(ReliableOutput::Deliver(value));
                    self.recv_tail = (self.recv_tail + 1) % self.window;
                }
                None => break,
            }
        }
        if self.recv_tail == self.recv_head {
            self.gap_deadline = None;
        } else if self.gap_deadline.is_none() {
            self.gap_deadline = Some(now_ms + self.timeout_ms);
        }

        self.fill_window(now_ms);
        if self.ack_due.map_or(false, |d| d <= now_ms) {
            self.send_ack_only();
        }
    }

    fn fill_window(&mut self, now_ms: u64) {
        if self.phase != Phase::Up {
            return;
        }
        while self.in_flight() < self.window / 2 {
            let msg = match self.queue.pop_front() {
                Some(msg) => msg,
                None => break,
            };
            let seq = self.send_head;
            self.send_head = (seq + 1) % self.window;
            self.send_slots.insert(
                seq,
                SendSlot {
                    msg,
                    deadline: Some(now_ms + self.timeout_ms),
                    retries: 0,
                },
            );
            self.transmit_data(seq);
        }
    }

    fn selective_list(&self) -> Vec<u32> {
        let mut list = vec![];
        let mut seq = self.recv_tail;
        while seq != self.recv_head {
            if self.recv_slots.contains_key(&seq) {
                list.push(seq);
            }
            seq = (seq + 1) % self.window;
        }
        list
    }

    fn transmit_data(&mut self, seq: u32) {
        let payload = match self.send_slots.get(&seq) {
            Some(slot) => slot.msg.value.clone(),
            None => return,
        };
        let frame = Frame::Data {
            seq,
            ack: self.recv_tail,
            selective: self.selective_list(),
            payload: Some(payload),
        };
        self.ack_due = None;
        self.output.push_back(ReliableOutput::Transmit(frame.to_value()));
    }

    fn send_ack_only(&mut self) {
        let frame = Frame::Data {
            seq: self.send_head,
            ack: self.recv_tail,
            selective: self.selective_list(),
            payload: None,
        };
        self.ack_due = None;
        self.output.push_back(ReliableOutput::Transmit(frame.to_value()));
    }

    fn send_control(&mut self, level: u8) {
        let frame = Frame::Reset {
            level,
            window: self.window,
            timeout_ms: self.timeout_ms,
            nonce: self.nonce,
            echo: self.peer_nonce,
        };
        self.output.push_back(ReliableOutput::Transmit(frame.to_value()));
    }

    fn merge(&mut self, window: u32, timeout_ms: u64) {
        let (window, timeout_ms) = negotiate(self.window, self.timeout_ms, window, timeout_ms);
        self.window = window;
        self.timeout_ms = timeout_ms;
    }

    /// Drop both windows, keeping unacked messages at the front of the queue.
    fn clear_windows(&mut self) {
        let mut requeue = vec![];
        let mut seq = self.send_tail;
        while seq != self.send_head {
            if let Some(slot) = self.send_slots.remove(&seq) {
                requeue.push(slot.msg);
            }
            seq = (seq + 1) % self.window;
        }
        for msg in requeue.into_iter().rev() {
            self.queue.push_front(msg);
        }
        if !self.queue.is_empty() {
            log::info!("[ReliableLogic] {} messages queued for the next session", self.queue.len());
        }
        self.recv_slots.clear();
        self.send_head = 0;
        self.send_tail = 0;
        self.recv_head = 0;
        self.recv_tail = 0;
        self.ack_due = None;
        self.gap_deadline = None;
        self.window = self.config.window;
        self.timeout_ms = self.config.timeout_ms;
    }

    fn enter_reset1(&mut self, now_ms: u64, reason: &str) {
        log::warn!("[ReliableLogic] reset: {}", reason);
        if self.phase == Phase::Up {
            self.reset_attempts = 0;
            self.output.push_back(ReliableOutput::Down);
        }
        self.clear_windows();
        self.phase = Phase::Reset1;
        self.nonce = fresh_nonce();
        self.peer_nonce = 0;
        self.send_control(LEVEL_RESET);
        self.reset_deadline = Some(now_ms + self.timeout_ms);
    }

    fn enter_reset2(&mut self, now_ms: u64, peer_nonce: u32, window: u32, timeout_ms: u64) {
        log::warn!("[ReliableLogic] peer started a new session");
        if self.phase == Phase::Up {
            self.output.push_back(ReliableOutput::Down);
        }
        self.clear_windows();
        self.phase = Phase::Reset2;
        self.reset_attempts = 0;
        self.nonce = fresh_nonce();
        self.peer_nonce = peer_nonce;
        self.merge(window, timeout_ms);
        self.send_control(LEVEL_RESET_ACK);
        self.reset_deadline = Some(now_ms + self.timeout_ms);
    }

    fn go_up(&mut self, now_ms: u64) {
        log::info!("[ReliableLogic] up, window {} timeout {} ms", self.window, self.timeout_ms);
        self.phase = Phase::Up;
        self.reset_deadline = None;
        self.reset_attempts = 0;
        self.output.push_back(ReliableOutput::Up);
        self.fill_window(now_ms);
    }

    fn protocol_violation(&mut self, now_ms: u64, err: ReliableError) {
        if self.phase == Phase::Up {
            self.enter_reset1(now_ms, &err.to_string());
        } else {
            log::warn!("[ReliableLogic] {} while resetting, dropped", err);
        }
    }

    fn fatal(&mut self, reason: &str) {
        log::error!("[ReliableLogic] fatal: {}", reason);
        self.output.push_back(ReliableOutput::Transmit(
            Frame::Closed {
                reason: Some(reason.to_string()),
            }
            .to_value(),
        ));
        self.fail_all();
        self.phase = Phase::Closed;
        self.output.push_back(ReliableOutput::Fatal(reason.to_string()));
    }

    fn fail_all(&mut self) {
        let mut seq = self.send_tail;
        while seq != self.send_head {
            if let Some(done) = self.send_slots.remove(&seq).and_then(|s| s.msg.done) {
                self.output.push_back(ReliableOutput::Failed(done));
            }
            seq = (seq + 1) % self.window;
        }
        for pending in self.queue.drain(..) {
            if let Some(done) = pending.done {
                self.output.push_back(ReliableOutput::Failed(done));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
    use satlink_codec::Value;

    use super::{Phase, ReliableLogic, ReliableOutput};
    use crate::{config::ReliableConfig, frame::Frame};

    struct Side {
        logic: ReliableLogic<u32>,
        delivered: Vec<Value>,
        acked: Vec<u32>,
        failed: Vec<u32>,
        ups: usize,
        downs: usize,
        closed: Option<Option<String>>,
        fatal: Option<String>,
    }

    impl Side {
        fn new(config: ReliableConfig) -> Self {
            Self {
                logic: ReliableLogic::new(config, 0),
                delivered: vec![],
                acked: vec![],
                failed: vec![],
                ups: 0,
                downs: 0,
                closed: None,
                fatal: None,
            }
        }

        fn drain(&mut self) -> Vec<Value> {
            let mut wire = vec![];
            while let Some(out) = self.logic.pop_output() {
                match out {
                    ReliableOutput::Transmit(v) => wire.push(v),
                    ReliableOutput::Deliver(v) => self.delivered.push(v),
                    ReliableOutput::Acked(c) => self.acked.push(c),
                    ReliableOutput::Failed(c) => self.failed.push(c),
                    ReliableOutput::Up => self.ups += 1,
                    ReliableOutput::Down => self.downs += 1,
                    ReliableOutput::Closed(r) => self.closed = Some(r),
                    ReliableOutput::Fatal(r) => self.fatal = Some(r),
                }
            }
            wire
        }
    }

    fn pump(a: &mut Side, b: &mut Side, now: u64, wire: &mut impl FnMut(Vec<Value>) -> Vec<Value>) {
        loop {
            let from_a = a.drain();
            let from_b = b.drain();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for frame in wire(from_a) {
                b.logic.on_frame(now, frame);
            }
            for frame in wire(from_b) {
                a.logic.on_frame(now, frame);
            }
        }
    }

    fn run(a: &mut Side, b: &mut Side, from: u64, until: u64, wire: &mut impl FnMut(Vec<Value>) -> Vec<Value>) {
        let mut now = from;
        while now < until {
            a.logic.on_tick(now);
            b.logic.on_tick(now);
            pump(a, b, now, wire);
            now += 10;
        }
    }

    fn clean(frames: Vec<Value>) -> Vec<Value> {
        frames
    }

    fn cut(_frames: Vec<Value>) -> Vec<Value> {
        vec![]
    }

    fn config(window: u32) -> ReliableConfig {
        ReliableConfig {
            window,
            timeout_ms: 100,
            retries: 5,
            ack_delay_ms: 20,
        }
    }

    #[test]
    fn handshake_negotiates_params() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(ReliableConfig { window: 20, timeout_ms: 300, ..config(20) });
        pump(&mut a, &mut b, 0, &mut clean);
        assert_eq!(a.logic.phase(), Phase::Up);
        assert_eq!(b.logic.phase(), Phase::Up);
        assert_eq!(a.logic.params(), (8, 300));
        assert_eq!(b.logic.params(), (8, 300));
        assert_eq!((a.ups, b.ups), (1, 1));
        assert_eq!((a.downs, b.downs), (0, 0));
    }

    #[test]
    fn one_sided_reset_while_peer_silent() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(config(8));
        // b's initial request is lost, only a's gets through
        b.drain();
        pump(&mut a, &mut b, 0, &mut clean);
        assert_eq!(a.logic.phase(), Phase::Up);
        assert_eq!(b.logic.phase(), Phase::Up);
    }

    #[test]
    fn ordered_delivery_clean_link() {
        for window in [4, 8, 20] {
            let mut a = Side::new(config(window));
            let mut b = Side::new(config(window));
            for i in 0..10u32 {
                a.logic.push_msg(0, Value::from(i), i);
            }
            run(&mut a, &mut b, 0, 2000, &mut clean);
            assert_eq!(b.delivered, (0..10).map(Value::from).collect::<Vec<_>>(), "window {}", window);
            assert_eq!(a.acked, (0..10).collect::<Vec<_>>());
            assert!(a.logic.in_flight() <= window / 2);
        }
    }

    #[test]
    fn detached_messages_keep_order_without_completion() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(config(8));
        a.logic.push_msg(0, Value::from(0), 0);
        for i in 1..6 {
            a.logic.push_detached(0, Value::from(i));
        }
        a.logic.push_msg(0, Value::from(6), 6);
        run(&mut a, &mut b, 0, 2000, &mut clean);
        assert_eq!(b.delivered, (0..7).map(Value::from).collect::<Vec<_>>());
        assert_eq!(a.acked, vec![0, 6]);
        assert!(a.failed.is_empty());
    }

    #[test]
    fn ordered_delivery_under_loss_and_duplication() {
        for window in [4, 8, 20] {
            let mut a = Side::new(ReliableConfig { retries: 50, ..config(window) });
            let mut b = Side::new(ReliableConfig { retries: 50, ..config(window) });
            pump(&mut a, &mut b, 0, &mut clean);
            for i in 0..30u32 {
                a.logic.push_msg(0, Value::from(i), i);
                b.logic.push_msg(0, Value::from(100 + i), i);
            }
            let mut rng = StdRng::seed_from_u64(window as u64);
            let mut lossy = |frames: Vec<Value>| {
                let mut out = vec![];
                for frame in frames {
                    if rng.gen_bool(0.25) {
                        continue;
                    }
                    if rng.gen_bool(0.1) {
                        out.push(frame.clone());
                    }
                    out.push(frame);
                }
                if rng.gen_bool(0.3) {
                    out.shuffle(&mut rng);
                }
                out
            };
            run(&mut a, &mut b, 0, 60_000, &mut lossy);
            assert_eq!(b.delivered, (0..30).map(Value::from).collect::<Vec<_>>(), "window {}", window);
            assert_eq!(a.delivered, (100..130).map(Value::from).collect::<Vec<_>>(), "window {}", window);
            assert_eq!(a.acked.len(), 30);
            assert_eq!(b.acked.len(), 30);
            assert_eq!((a.downs, b.downs), (0, 0));
        }
    }

    #[test]
    fn replayed_frame_delivers_once() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(config(8));
        pump(&mut a, &mut b, 0, &mut clean);
        a.logic.push_msg(0, Value::from("once"), 1);
        let frames = a.drain();
        assert_eq!(frames.len(), 1);
        for _ in 0..3 {
            b.logic.on_frame(0, frames[0].clone());
        }
        b.drain();
        assert_eq!(b.delivered, vec![Value::from("once")]);

        // after delivery, the window moved on and the replay is stale
        run(&mut a, &mut b, 0, 500, &mut clean);
        b.logic.on_frame(500, frames[0].clone());
        b.drain();
        assert_eq!(b.delivered, vec![Value::from("once")]);
    }

    #[test]
    fn out_of_order_waits_for_gap() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(config(8));
        pump(&mut a, &mut b, 0, &mut clean);
        a.logic.push_msg(0, Value::from(0), 0);
        a.logic.push_msg(0, Value::from(1), 1);
        let frames = a.drain();
        assert_eq!(frames.len(), 2);
        b.logic.on_frame(0, frames[1].clone());
        b.drain();
        assert!(b.delivered.is_empty());
        b.logic.on_frame(0, frames[0].clone());
        b.drain();
        assert_eq!(b.delivered, vec![Value::from(0), Value::from(1)]);
    }

    #[test]
    fn selective_ack_completes_sender() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(config(8));
        pump(&mut a, &mut b, 0, &mut clean);
        a.logic.push_msg(0, Value::from(0), 0);
        a.logic.push_msg(0, Value::from(1), 1);
        let frames = a.drain();
        b.logic.on_frame(0, frames[1].clone());
        b.logic.on_tick(100);
        let acks = b.drain();
        let ack = acks.last().expect("should ack").clone();
        assert!(matches!(Frame::from_value(&ack), Ok(Frame::Data { ack: 0, ref selective, payload: None, .. }) if selective == &vec![1]));
        a.logic.on_frame(100, ack);
        a.drain();
        assert_eq!(a.acked, vec![1]);
    }

    #[test]
    fn simultaneous_reset_converges() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(config(4));
        // both requests cross on the wire
        let from_a = a.drain();
        let from_b = b.drain();
        for f in from_a {
            b.logic.on_frame(0, f);
        }
        for f in from_b {
            a.logic.on_frame(0, f);
        }
        pump(&mut a, &mut b, 0, &mut clean);
        assert_eq!(a.logic.phase(), Phase::Up);
        assert_eq!(b.logic.phase(), Phase::Up);
        assert_eq!(a.logic.params(), b.logic.params());
        assert_eq!(a.logic.params().0, 4);
        assert_eq!((a.downs, b.downs), (0, 0));
    }

    #[test]
    fn delayed_reset_request_does_not_tear_down() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(config(8));
        let first_request = a.drain();
        for f in &first_request {
            b.logic.on_frame(0, f.clone());
        }
        pump(&mut a, &mut b, 0, &mut clean);
        assert_eq!(b.logic.phase(), Phase::Up);
        for f in first_request {
            b.logic.on_frame(10, f);
        }
        pump(&mut a, &mut b, 10, &mut clean);
        assert_eq!(a.logic.phase(), Phase::Up);
        assert_eq!(b.logic.phase(), Phase::Up);
        assert_eq!((a.downs, b.downs), (0, 0));
    }

    #[test]
    fn peer_restart_requeues_unacked() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(config(8));
        pump(&mut a, &mut b, 0, &mut clean);
        a.logic.push_msg(0, Value::from("lost"), 7);
        a.drain();

        // b restarts and starts a fresh session
        let mut b = Side::new(config(8));
        pump(&mut a, &mut b, 0, &mut clean);
        assert_eq!(a.downs, 1);
        assert_eq!(a.logic.phase(), Phase::Up);
        run(&mut a, &mut b, 0, 500, &mut clean);
        assert_eq!(b.delivered, vec![Value::from("lost")]);
        assert_eq!(a.acked, vec![7]);
    }

    #[test]
    fn retry_exhaustion_resets_then_fatal() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(config(8));
        pump(&mut a, &mut b, 0, &mut clean);
        a.logic.push_msg(0, Value::from(1), 1);
        // the peer is gone from here on
        run(&mut a, &mut b, 0, 5000, &mut cut);
        assert_eq!(a.downs, 1);
        assert_eq!(a.logic.phase(), Phase::Closed);
        assert!(a.fatal.is_some());
        assert_eq!(a.failed, vec![1]);
        assert_eq!(a.logic.next_deadline(), None);
    }

    #[test]
    fn ephemeral_replaced_before_transmit() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(config(8));
        a.logic.push_ephemeral(0, 3, Value::from("old"));
        a.logic.push_ephemeral(0, 3, Value::from("new"));
        a.logic.push_ephemeral(0, 4, Value::from("other"));
        assert_eq!(a.logic.queued(), 2);
        run(&mut a, &mut b, 0, 500, &mut clean);
        assert_eq!(b.delivered, vec![Value::from("new"), Value::from("other")]);

        // once on the wire a newer value is a new message
        a.logic.push_ephemeral(500, 3, Value::from("v1"));
        a.logic.push_ephemeral(500, 3, Value::from("v2"));
        run(&mut a, &mut b, 500, 1000, &mut clean);
        assert_eq!(b.delivered[2..], [Value::from("v1"), Value::from("v2")]);
    }

    #[test]
    fn close_fails_pending_and_notifies_peer() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(config(8));
        pump(&mut a, &mut b, 0, &mut clean);
        b.logic.push_msg(0, Value::from(1), 1);
        b.drain();
        b.logic.push_msg(0, Value::from(2), 2);
        a.logic.close(Some("bye".into()));
        pump(&mut a, &mut b, 0, &mut clean);
        assert_eq!(a.closed, Some(Some("bye".into())));
        assert_eq!(b.closed, Some(Some("bye".into())));
        assert_eq!(b.failed, vec![1, 2]);
        b.logic.push_msg(0, Value::from(3), 3);
        b.drain();
        assert_eq!(b.failed, vec![1, 2, 3]);
    }

    #[test]
    fn protocol_violation_resets() {
        let mut a = Side::new(config(8));
        let mut b = Side::new(config(8));
        pump(&mut a, &mut b, 0, &mut clean);
        a.logic.on_frame(0, Value::list([Value::from(9), Value::from(0), Value::from("x")]));
        assert_eq!(a.logic.phase(), Phase::Reset1);
        pump(&mut a, &mut b, 0, &mut clean);
        assert_eq!(a.logic.phase(), Phase::Up);
        assert_eq!(b.logic.phase(), Phase::Up);
        assert_eq!(a.downs, 1);
    }
}
