//! Minimal telnet (RFC 854) framing for telnet-mode ports.
//!
//! Inbound network bytes pass through [`TelnetSession::process`], which
//! strips command sequences, answers option negotiation and hands back the
//! plain data bytes for the device. Outbound device bytes go through
//! [`escape_iac`] so a literal 0xFF survives the trip.
//!
//! Supported option subset:
//!
//! | Option | We offer | Peer may enable on our side | Peer may enable on its side |
//! |--------|----------|-----------------------------|-----------------------------|
//! | ECHO | WILL | yes | no |
//! | SUPPRESS-GO-AHEAD | WILL | yes | yes |
//! | BINARY | - | yes | yes |
//! | LINEMODE | DONT | no | no |
//!
//! Everything else is refused with WONT/DONT, once per option: a request
//! for a state already in effect gets no reply (RFC 1143). Subnegotiations
//! are skipped.
//! `IAC BREAK` is surfaced as [`TelnetEvent::Break`]; other commands are
//! dropped.

use std::collections::HashSet;

/// Interpret As Command.
pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
/// Subnegotiation begin.
pub const SB: u8 = 250;
pub const GA: u8 = 249;
pub const EL: u8 = 248;
pub const EC: u8 = 247;
pub const AYT: u8 = 246;
pub const AO: u8 = 245;
pub const IP: u8 = 244;
pub const BREAK: u8 = 243;
pub const DM: u8 = 242;
pub const NOP: u8 = 241;
/// Subnegotiation end.
pub const SE: u8 = 240;

/// Telnet option codes used by the negotiation subset.
pub mod option {
    pub const BINARY: u8 = 0;
    pub const ECHO: u8 = 1;
    pub const SUPPRESS_GO_AHEAD: u8 = 3;
    pub const LINEMODE: u8 = 34;
}

/// Out-of-band events decoded from the inbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelnetEvent {
    /// `IAC BREAK`: the client wants a serial break.
    Break,
    /// A command outside the supported subset was received and ignored.
    Ignored(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Data,
    Iac,
    Verb(u8),
    Sub,
    SubIac,
}

/// Per-connection telnet state.
#[derive(Debug)]
pub struct TelnetSession {
    state: ParseState,
    /// Options enabled on our side (we WILL).
    local: HashSet<u8>,
    /// Options enabled on the peer's side (it WILLs).
    remote: HashSet<u8>,
    /// Our offers still waiting for an answer, as (verb, option).
    pending: HashSet<(u8, u8)>,
    /// Options we answered WONT to.
    refused_local: HashSet<u8>,
    /// Options we answered DONT to.
    refused_remote: HashSet<u8>,
}

impl Default for TelnetSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetSession {
    /// Creates a session with nothing negotiated.
    pub fn new() -> Self {
        Self {
            state: ParseState::Data,
            local: HashSet::new(),
            remote: HashSet::new(),
            pending: HashSet::new(),
            refused_local: HashSet::new(),
            refused_remote: HashSet::new(),
        }
    }

    /// Appends our opening offers to `out` and starts tracking their answers.
    pub fn start(&mut self, out: &mut Vec<u8>) {
        for opt in [option::SUPPRESS_GO_AHEAD, option::ECHO] {
            self.local.insert(opt);
            self.pending.insert((WILL, opt));
            out.extend_from_slice(&[IAC, WILL, opt]);
        }
        self.pending.insert((DONT, option::LINEMODE));
        out.extend_from_slice(&[IAC, DONT, option::LINEMODE]);
    }

    /// Returns true once every offer made by [`start`](Self::start) was answered.
    pub fn negotiation_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns true if `opt` is enabled on our side.
    pub fn local_enabled(&self, opt: u8) -> bool {
        self.local.contains(&opt)
    }

    /// Returns true if `opt` is enabled on the peer's side.
    pub fn remote_enabled(&self, opt: u8) -> bool {
        self.remote.contains(&opt)
    }

    /// Decodes `input`.
    ///
    /// Plain data bytes are appended to `data`, negotiation replies to
    /// `reply`, and out-of-band events to `events`. Sequences split across
    /// calls are resumed on the next call.
    pub fn process(
        &mut self,
        input: &[u8],
        data: &mut Vec<u8>,
        reply: &mut Vec<u8>,
        events: &mut Vec<TelnetEvent>,
    ) {
        for &byte in input {
            self.state = match self.state {
                ParseState::Data => {
                    if byte == IAC {
                        ParseState::Iac
                    } else {
                        data.push(byte);
                        ParseState::Data
                    }
                }
                ParseState::Iac => match byte {
                    IAC => {
                        data.push(IAC);
                        ParseState::Data
                    }
                    WILL | WONT | DO | DONT => ParseState::Verb(byte),
                    SB => ParseState::Sub,
                    BREAK => {
                        events.push(TelnetEvent::Break);
                        ParseState::Data
                    }
                    NOP | DM | GA => ParseState::Data,
                    other => {
                        events.push(TelnetEvent::Ignored(other));
                        ParseState::Data
                    }
                },
                ParseState::Verb(verb) => {
                    self.negotiate(verb, byte, reply);
                    ParseState::Data
                }
                ParseState::Sub => {
                    if byte == IAC {
                        ParseState::SubIac
                    } else {
                        ParseState::Sub
                    }
                }
                ParseState::SubIac => match byte {
                    SE => ParseState::Data,
                    _ => ParseState::Sub,
                },
            };
        }
    }

    fn negotiate(&mut self, verb: u8, opt: u8, reply: &mut Vec<u8>) {
        match verb {
            DO => {
                let offered = self.pending.remove(&(WILL, opt));
                if offered || self.local.contains(&opt) {
                    return;
                }
                if local_supported(opt) {
                    self.local.insert(opt);
                    reply.extend_from_slice(&[IAC, WILL, opt]);
                } else if self.refused_local.insert(opt) {
                    reply.extend_from_slice(&[IAC, WONT, opt]);
                }
            }
            DONT => {
                let offered = self.pending.remove(&(WILL, opt));
                if self.local.remove(&opt) && !offered {
                    reply.extend_from_slice(&[IAC, WONT, opt]);
                }
            }
            WILL => {
                if self.pending.remove(&(DONT, opt)) && !remote_supported(opt) {
                    // Peer insists on something we turned down.
                    self.refused_remote.insert(opt);
                    reply.extend_from_slice(&[IAC, DONT, opt]);
                    return;
                }
                if self.remote.contains(&opt) {
                    return;
                }
                if remote_supported(opt) {
                    self.remote.insert(opt);
                    reply.extend_from_slice(&[IAC, DO, opt]);
                } else if self.refused_remote.insert(opt) {
                    reply.extend_from_slice(&[IAC, DONT, opt]);
                }
            }
            WONT => {
                self.pending.remove(&(DONT, opt));
                if self.remote.remove(&opt) {
                    reply.extend_from_slice(&[IAC, DONT, opt]);
                }
            }
            _ => {}
        }
    }
}

fn local_supported(opt: u8) -> bool {
    matches!(
        opt,
        option::ECHO | option::SUPPRESS_GO_AHEAD | option::BINARY
    )
}

fn remote_supported(opt: u8) -> bool {
    matches!(opt, option::SUPPRESS_GO_AHEAD | option::BINARY)
}

/// Appends `input` to `out`, doubling every IAC byte.
pub fn escape_iac(input: &[u8], out: &mut Vec<u8>) {
    for &byte in input {
        if byte == IAC {
            out.push(IAC);
        }
        out.push(byte);
    }
}
