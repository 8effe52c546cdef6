use satlink_codec::Value;

use crate::error::ReliableError;

pub const LEVEL_CLOSED: u8 = 0;
pub const LEVEL_RESET: u8 = 1;
pub const LEVEL_RESET_ACK: u8 = 2;
pub const LEVEL_RESET_ACK2: u8 = 3;

/// Positional ARQ frame.
///
/// Data and ack frames are `[s, r, payload?]`, or `[s, -1-r, [x...], payload?]`
/// when out-of-order sequence numbers are reported. Control frames start with
/// a negative number: `[-1-level, window, timeout, nonce, echo?]` for reset
/// levels, `[-1, reason?]` for closed.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data {
        /// Own sequence number, or the send head on an ack-only frame.
        seq: u32,
        /// Receive tail of the sender.
        ack: u32,
        selective: Vec<u32>,
        payload: Option<Value>,
    },
    Reset {
        level: u8,
        window: u32,
        timeout_ms: u64,
        nonce: u32,
        /// Nonce of the peer this frame answers, 0 when unknown.
        echo: u32,
    },
    Closed {
        reason: Option<String>,
    },
}

fn protocol(msg: &str) -> ReliableError {
    ReliableError::Protocol(msg.to_string())
}

fn non_negative(v: &Value, field: &str) -> Result<u64, ReliableError> {
    match v.as_int() {
        Some(i) if i >= 0 => Ok(i as u64),
        _ => Err(ReliableError::Protocol(format!("{} is not a non-negative int", field))),
    }
}

fn opt_param(items: &[Value], idx: usize, field: &str) -> Result<u64, ReliableError> {
    match items.get(idx) {
        None | Some(Value::Nil) => Ok(0),
        Some(v) => non_negative(v, field),
    }
}

impl Frame {
    pub fn to_value(&self) -> Value {
        match self {
            Frame::Data { seq, ack, selective, payload } => {
                let mut items = vec![Value::from(*seq)];
                if selective.is_empty() {
                    items.push(Value::from(*ack));
                } else {
                    items.push(Value::Int(-1 - *ack as i64));
                    items.push(Value::List(selective.iter().map(|x| Value::from(*x)).collect()));
                }
                if let Some(payload) = payload {
                    items.push(payload.clone());
                }
                Value::List(items)
            }
            Frame::Reset { level, window, timeout_ms, nonce, echo } => {
                let mut items = vec![Value::Int(-1 - *level as i64), Value::from(*window), Value::Int(*timeout_ms as i64), Value::from(*nonce)];
                if *echo != 0 {
                    items.push(Value::from(*echo));
                }
                Value::List(items)
            }
            Frame::Closed { reason } => {
                let mut items = vec![Value::Int(-1)];
                if let Some(reason) = reason {
                    items.push(Value::Str(reason.clone()));
                }
                Value::List(items)
            }
        }
    }

    /// Checks shape only; window bounds are checked by the receiver.
    pub fn from_value(value: &Value) -> Result<Frame, ReliableError> {
        let items = value.as_list().ok_or_else(|| protocol("frame is not a list"))?;
        let head = items.first().and_then(Value::as_int).ok_or_else(|| protocol("frame has no leading int"))?;
        if head < 0 {
            let level = -1 - head;
            return match level {
                0 => Ok(Frame::Closed {
                    reason: items.get(1).and_then(Value::as_str).map(str::to_string),
                }),
                1..=3 => Ok(Frame::Reset {
                    level: level as u8,
                    window: opt_param(items, 1, "window")?.min(u32::MAX as u64) as u32,
                    timeout_ms: opt_param(items, 2, "timeout")?,
                    nonce: opt_param(items, 3, "nonce")? as u32,
                    echo: opt_param(items, 4, "echo")? as u32,
                }),
                _ => Err(ReliableError::Protocol(format!("unknown control level {}", level))),
            };
        }
        let seq = u32::try_from(head).map_err(|_| protocol("sequence number too large"))?;
        let ack_raw = items.get(1).and_then(Value::as_int).ok_or_else(|| protocol("frame has no ack"))?;
        let (ack, selective, rest) = if ack_raw < 0 {
            let list = items.get(2).and_then(Value::as_list).ok_or_else(|| protocol("negated ack without list"))?;
            let selective = list.iter().map(|x| non_negative(x, "selective ack").map(|x| x as u32)).collect::<Result<Vec<_>, _>>()?;
            (-1 - ack_raw, selective, &items[3..])
        } else {
            (ack_raw, vec![], &items[2..])
        };
        let ack = u32::try_from(ack).map_err(|_| protocol("ack too large"))?;
        if rest.len() > 1 {
            return Err(protocol("more than one payload element"));
        }
        Ok(Frame::Data {
            seq,
            ack,
            selective,
            payload: rest.first().cloned(),
        })
    }

    /// All sequence numbers inside `[0, window)`.
    pub fn check_bounds(&self, window: u32) -> Result<(), ReliableError> {
        if let Frame::Data { seq, ack, selective, .. } = self {
            if *seq >= window || *ack >= window || selective.iter().any(|x| *x >= window) {
                return Err(ReliableError::Protocol(format!("R/S out of bounds for window {}", window)));
            }
        }
        Ok(())
    }
}

impl TryFrom<&[u8]> for Frame {
    type Error = ReliableError;

    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        let value = Value::try_from(buf).map_err(|e| ReliableError::Protocol(e.to_string()))?;
        Frame::from_value(&value)
    }
}
