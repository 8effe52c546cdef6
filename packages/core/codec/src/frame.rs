use std::collections::VecDeque;

pub const DEFAULT_MAX_FRAME: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("payload too large: {0} bytes")]
    TooLarge(usize),
    #[error("empty payload")]
    Empty,
    #[error("bad length {0}")]
    BadLength(usize),
    #[error("crc mismatch: expected {expected:04x}, got {got:04x}")]
    Crc { expected: u16, got: u16 },
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xffff, no reflection).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

/// `[lead-in?][len hi][len lo][payload][crc hi][crc lo]`
pub fn encode_frame(lead_in: Option<u8>, payload: &[u8], max_len: usize) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::Empty);
    }
    if payload.len() > max_len || payload.len() > u16::MAX as usize {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(payload.len() + 5);
    if let Some(lead) = lead_in {
        buf.push(lead);
    }
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&crc16(payload).to_be_bytes());
    Ok(buf)
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameEvent {
    Packet(Vec<u8>),
    /// One line of console text seen outside any frame, without the newline.
    Console(Vec<u8>),
    Corrupt(FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Idle,
    Len { got: usize, len: usize },
    Payload { len: usize },
    Crc { got: usize, crc: u16 },
}

/// Incremental decoder for [`encode_frame`] output.
///
/// Without a lead-in every byte belongs to a frame. With one, bytes between
/// frames are collected as console lines.
pub struct FrameDecoder {
    lead_in: Option<u8>,
    max_len: usize,
    state: DecodeState,
    payload: Vec<u8>,
    console: Vec<u8>,
    output: VecDeque<FrameEvent>,
}

impl FrameDecoder {
    pub fn new(lead_in: Option<u8>, max_len: usize) -> Self {
        Self {
            lead_in,
            max_len,
            state: Self::start_state(lead_in),
            payload: vec![],
            console: vec![],
            output: Default::default(),
        }
    }

    fn start_state(lead_in: Option<u8>) -> DecodeState {
        match lead_in {
            Some(_) => DecodeState::Idle,
            None => DecodeState::Len { got: 0, len: 0 },
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        for &b in data {
            self.on_byte(b);
        }
    }

    fn on_byte(&mut self, b: u8) {
        self.state = match self.state {
            DecodeState::Idle => {
                if Some(b) == self.lead_in {
                    DecodeState::Len { got: 0, len: 0 }
                } else {
                    self.on_console(b);
                    DecodeState::Idle
                }
            }
            DecodeState::Len { got, len } => {
                let len = (len << 8) | b as usize;
                if got == 0 {
                    DecodeState::Len { got: 1, len }
                } else if len == 0 || len > self.max_len {
                    log::warn!("[FrameDecoder] bad frame length {}", len);
                    self.output.push_back(FrameEvent::Corrupt(FrameError::BadLength(len)));
                    Self::start_state(self.lead_in)
                } else {
                    self.payload = Vec::with_capacity(len);
                    DecodeState::Payload { len }
                }
            }
            DecodeState::Payload { len } => {
                self.payload.push(b);
                if self.payload.len() == len {
                    DecodeState::Crc { got: 0, crc: 0 }
                } else {
                    DecodeState::Payload { len }
                }
            }
            DecodeState::Crc { got, crc } => {
                let crc = (crc << 8) | b as u16;
                if got == 0 {
                    DecodeState::Crc { got: 1, crc }
                } else {
                    let payload = std::mem::take(&mut self.payload);
                    let expected = crc16(&payload);
                    if expected == crc {
                        self.output.push_back(FrameEvent::Packet(payload));
                    } else {
                        log::warn!("[FrameDecoder] crc mismatch on {} byte frame", payload.len());
                        self.output.push_back(FrameEvent::Corrupt(FrameError::Crc { expected, got: crc }));
                    }
                    Self::start_state(self.lead_in)
                }
            }
        };
    }

    fn on_console(&mut self, b: u8) {
        match b {
            b'\n' => {
                let line = std::mem::take(&mut self.console);
                log::debug!("[FrameDecoder] console: {}", String::from_utf8_lossy(&line));
                self.output.push_back(FrameEvent::Console(line));
            }
            b'\r' => {}
            _ => self.console.push(b),
        }
    }

    pub fn pop_event(&mut self) -> Option<FrameEvent> {
        self.output.pop_front()
    }
}
