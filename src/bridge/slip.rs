// src/bridge/slip.rs - SLIP framing for the ROM loader protocol
pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Wrap `payload` in a SLIP frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 32 + 2);
    out.push(END);
    for &b in payload {
        match b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            b => out.push(b),
        }
    }
    out.push(END);
    out
}

/// Incremental decoder; bytes outside a frame are ignored.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    frame: Vec<u8>,
    in_frame: bool,
    escaped: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte, returning a frame when it completes.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match (self.in_frame, byte) {
            (false, END) => {
                self.in_frame = true;
                None
            }
            (false, _) => None,
            (true, END) if self.frame.is_empty() => None,
            (true, END) => {
                self.in_frame = false;
                self.escaped = false;
                Some(std::mem::take(&mut self.frame))
            }
            (true, ESC) => {
                self.escaped = true;
                None
            }
            (true, b) if self.escaped => {
                self.escaped = false;
                self.frame.push(match b {
                    ESC_END => END,
                    ESC_ESC => ESC,
                    other => other,
                });
                None
            }
            (true, b) => {
                self.frame.push(b);
                None
            }
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
