//! Locating message boundaries in an unframed INDI stream.
//!
//! INDI has no length prefix: a message ends where its top-level XML element closes.
//! [`FrameScanner`] walks the bytes once, keeping its state between calls, and reports the
//! length of the longest prefix that ends on a top-level boundary. Text between top-level
//! elements counts as complete. Quoted attribute values, comments, CDATA sections,
//! processing instructions and self-closing tags are understood; everything else about
//! well-formedness is left to the XML parser.

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
enum State {
    #[default]
    Text,
    Open,
    StartTag {
        quote: Option<u8>,
        slash: bool,
    },
    EndTag,
    Bang,
    BangDash,
    CDataOpen {
        matched: usize,
    },
    Comment {
        dashes: usize,
    },
    CData {
        brackets: usize,
    },
    Instruction {
        question: bool,
    },
    Declaration,
}

const CDATA_OPEN: &[u8] = b"[CDATA[";

/// Incremental scanner for top-level element boundaries.
#[derive(Clone, Debug, Default)]
pub struct FrameScanner {
    scanned: usize,
    complete: usize,
    depth: usize,
    state: State,
}

impl FrameScanner {
    pub fn new() -> FrameScanner {
        FrameScanner::default()
    }

    /// Scans the bytes of `buf` that were not seen by a previous call and returns the
    /// length of the longest prefix of `buf` that ends on a top-level boundary.
    ///
    /// `buf` must start with the bytes passed earlier, minus whatever was reported
    /// through [`FrameScanner::consume`].
    pub fn scan(&mut self, buf: &[u8]) -> usize {
        if buf.len() < self.scanned {
            self.reset();
        }
        for (pos, &b) in buf.iter().enumerate().skip(self.scanned) {
            self.step(pos, b);
        }
        self.scanned = buf.len();
        self.complete
    }

    /// The first `n` bytes were removed from the front of the buffer.
    pub fn consume(&mut self, n: usize) {
        self.scanned = self.scanned.saturating_sub(n);
        self.complete = self.complete.saturating_sub(n);
    }

    pub fn reset(&mut self) {
        *self = FrameScanner::default();
    }

    /// Nesting depth at the scan position; 0 between top-level elements.
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn close_markup(&mut self, pos: usize) {
        self.state = State::Text;
        if self.depth == 0 {
            self.complete = pos + 1;
        }
    }

    fn step(&mut self, pos: usize, b: u8) {
        match self.state {
            State::Text => {
                if b == b'<' {
                    self.state = State::Open;
                } else if self.depth == 0 {
                    self.complete = pos + 1;
                }
            }
            State::Open => match b {
                b'/' => self.state = State::EndTag,
                b'!' => self.state = State::Bang,
                b'?' => self.state = State::Instruction { question: false },
                b'>' => {
                    self.depth += 1;
                    self.state = State::Text;
                }
                _ => {
                    self.state = State::StartTag {
                        quote: None,
                        slash: false,
                    }
                }
            },
            State::StartTag {
                quote: Some(q),
                slash,
            } => {
                if b == q {
                    self.state = State::StartTag { quote: None, slash };
                }
            }
            State::StartTag { quote: None, slash } => match b {
                b'"' | b'\'' => {
                    self.state = State::StartTag {
                        quote: Some(b),
                        slash: false,
                    }
                }
                b'>' if slash => self.close_markup(pos),
                b'>' => {
                    self.depth += 1;
                    self.state = State::Text;
                }
                _ => {
                    self.state = State::StartTag {
                        quote: None,
                        slash: b == b'/',
                    }
                }
            },
            State::EndTag => {
                if b == b'>' {
                    self.depth = self.depth.saturating_sub(1);
                    self.close_markup(pos);
                }
            }
            State::Bang => match b {
                b'-' => self.state = State::BangDash,
                b'[' => self.state = State::CDataOpen { matched: 1 },
                b'>' => self.close_markup(pos),
                _ => self.state = State::Declaration,
            },
            State::BangDash => match b {
                b'-' => self.state = State::Comment { dashes: 0 },
                b'>' => self.close_markup(pos),
                _ => self.state = State::Declaration,
            },
            State::CDataOpen { matched } => {
                if b == CDATA_OPEN[matched] {
                    if matched + 1 == CDATA_OPEN.len() {
                        self.state = State::CData { brackets: 0 };
                    } else {
                        self.state = State::CDataOpen {
                            matched: matched + 1,
                        };
                    }
                } else if b == b'>' {
                    self.close_markup(pos);
                } else {
                    self.state = State::Declaration;
                }
            }
            State::Comment { dashes } => match b {
                b'-' => self.state = State::Comment { dashes: dashes + 1 },
                b'>' if dashes >= 2 => self.close_markup(pos),
                _ => self.state = State::Comment { dashes: 0 },
            },
            State::CData { brackets } => match b {
                b']' => {
                    self.state = State::CData {
                        brackets: brackets + 1,
                    }
                }
                b'>' if brackets >= 2 => self.close_markup(pos),
                _ => self.state = State::CData { brackets: 0 },
            },
            State::Instruction { question } => match b {
                b'>' if question => self.close_markup(pos),
                _ => self.state = State::Instruction { question: b == b'?' },
            },
            State::Declaration => {
                if b == b'>' {
                    self.close_markup(pos);
                }
            }
        }
    }
}

/// Accumulates stream bytes and hands out complete top-level fragments, byte for byte.
#[derive(Clone, Debug, Default)]
pub struct FrameSplitter {
    buffer: Vec<u8>,
    scanner: FrameScanner,
}

impl FrameSplitter {
    pub fn new() -> FrameSplitter {
        FrameSplitter::default()
    }

    /// Appends `chunk` and returns every byte up to the last top-level boundary, if any.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let complete = self.scanner.scan(&self.buffer);
        if complete == 0 {
            return None;
        }
        let rest = self.buffer.split_off(complete);
        let frame = std::mem::replace(&mut self.buffer, rest);
        self.scanner.consume(complete);
        Some(frame)
    }

    /// Bytes held back because their element is still open.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanner.reset();
    }
}
