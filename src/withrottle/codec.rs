//! WiThrottle line protocol: framing, command encoding and message parsing.
//!
//! Everything here is pure and synchronous so it can be tested without a
//! socket. The [`client`](super::client) module wires it to TCP.
//!
//! # Wire grammar
//!
//! | Direction | Line | Meaning |
//! |-----------|------|---------|
//! | out | `N<name>` | device name |
//! | out | `HU<id>` | hardware id |
//! | out | `PPA1` / `PPA0` | track power on / off |
//! | out | `M0+S3<;>S3` | acquire short address 3 on throttle 0 |
//! | out | `M0-*<;>r` | release everything on throttle 0 |
//! | out | `M0AS3<;>V50` | speed 50 |
//! | out | `M0AS3<;>R1` | direction forward (`R0` reverse) |
//! | out | `M0AS3<;>F12` | function 2 on (`F0<n>` off) |
//! | out | `M0AS3<;>qV` / `qR` | query speed / direction |
//! | both | `*` | heartbeat |
//! | in | `PW12080` | web (JSON) port |
//! | in | `PPA1` | global track power |
//! | in | `RL2]\[LocoA}|{3}|{S]\[LocoB}|{40}|{L` | roster |
//! | in | `M0AS3<;>V50` | throttle update |
//! | in | `M0AS3<;>s1` | speed-step mode (1, 2, 4, 8, 16) |
//! | in | `M0+S3<;>` | acquisition acknowledged |
//! | in | `M0-S3<;>` / `M0-*<;>` | released by server (one address / anything) |
//! | in | `M0LS3<;>]\[Light]\[Bell` | function labels |
//! | in | `VN2.0` | protocol version |

use tracing::{debug, warn};

use crate::connection::PowerState;
use crate::error::{Error, Result};
use crate::locomotive::{
    AddressType, Direction, LocoAddress, SpeedStepMode, FUNCTION_COUNT, MAX_SPEED,
};
use crate::roster::{Roster, RosterEntry, MAX_ROSTER_ENTRIES};

/// Separates the target address from the action in throttle lines.
pub const SEPARATOR: &str = "<;>";

/// Opens a roster entry (also the label-list separator).
pub const ENTRY_OPEN: &str = "\\[";

/// Separates roster entries and function labels.
pub const ENTRY_SEPARATOR: &str = "]\\[";

/// Separates fields within a roster entry.
pub const FIELD_SEPARATOR: &str = "}|{";

/// Largest partial line kept while waiting for a newline.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Highest throttle slot addressable with a single-character id.
pub const MAX_THROTTLE_ID: u8 = 9;

// ============================================================================
// Framing
// ============================================================================

/// Accumulates raw socket bytes and yields complete lines.
///
/// Both `\n` and `\r\n` endings are accepted. Empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                lines.push(line.to_owned());
            }
        }
        if self.buf.len() > MAX_LINE_LEN {
            warn!(len = self.buf.len(), "discarding oversized partial line");
            self.buf.clear();
        }
        lines
    }

    /// Bytes waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drops any partial line.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// ============================================================================
// Outbound commands
// ============================================================================

/// A command sent to the WiThrottle server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `N<name>`
    DeviceName(String),
    /// `HU<id>`
    HardwareId(String),
    /// `PPA{0|1}`
    TrackPower(bool),
    /// `M<t>+<addr><;><addr>`
    Acquire {
        /// Throttle slot.
        throttle: u8,
        /// Address to acquire.
        address: LocoAddress,
    },
    /// `M<t>-*<;>r`
    Release {
        /// Throttle slot.
        throttle: u8,
    },
    /// `M<t>A<addr><;>V<speed>`
    Speed {
        /// Throttle slot.
        throttle: u8,
        /// Acquired address.
        address: LocoAddress,
        /// Speed step, clamped to 0..=126 when encoded.
        speed: u8,
    },
    /// `M<t>A<addr><;>R{0|1}`
    Direction {
        /// Throttle slot.
        throttle: u8,
        /// Acquired address.
        address: LocoAddress,
        /// New direction.
        direction: Direction,
    },
    /// `M<t>A<addr><;>F{0|1}<n>`
    Function {
        /// Throttle slot.
        throttle: u8,
        /// Acquired address.
        address: LocoAddress,
        /// Function number.
        function: u8,
        /// On or off.
        on: bool,
    },
    /// `M<t>A<addr><;>qV`
    QuerySpeed {
        /// Throttle slot.
        throttle: u8,
        /// Acquired address.
        address: LocoAddress,
    },
    /// `M<t>A<addr><;>qR`
    QueryDirection {
        /// Throttle slot.
        throttle: u8,
        /// Acquired address.
        address: LocoAddress,
    },
    /// `*`
    Heartbeat,
}

impl Command {
    /// Encodes the command without its trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Command::DeviceName(name) => format!("N{name}"),
            Command::HardwareId(id) => format!("HU{id}"),
            Command::TrackPower(on) => format!("PPA{}", u8::from(*on)),
            Command::Acquire { throttle, address } => {
                format!("M{throttle}+{address}{SEPARATOR}{address}")
            }
            Command::Release { throttle } => format!("M{throttle}-*{SEPARATOR}r"),
            Command::Speed {
                throttle,
                address,
                speed,
            } => format!(
                "M{throttle}A{address}{SEPARATOR}V{}",
                (*speed).min(MAX_SPEED)
            ),
            Command::Direction {
                throttle,
                address,
                direction,
            } => format!(
                "M{throttle}A{address}{SEPARATOR}R{}",
                direction_digit(*direction)
            ),
            Command::Function {
                throttle,
                address,
                function,
                on,
            } => format!(
                "M{throttle}A{address}{SEPARATOR}F{}{function}",
                u8::from(*on)
            ),
            Command::QuerySpeed { throttle, address } => {
                format!("M{throttle}A{address}{SEPARATOR}qV")
            }
            Command::QueryDirection { throttle, address } => {
                format!("M{throttle}A{address}{SEPARATOR}qR")
            }
            Command::Heartbeat => "*".to_owned(),
        }
    }
}

fn direction_digit(direction: Direction) -> char {
    match direction {
        Direction::Forward => '1',
        Direction::Reverse => '0',
    }
}

/// Encodes roster entries as an `RL` line, the way the server sends them.
pub fn encode_roster(entries: &[RosterEntry]) -> String {
    let mut line = format!("RL{}", entries.len());
    for entry in entries {
        line.push_str(ENTRY_SEPARATOR);
        line.push_str(&entry.name);
        line.push_str(FIELD_SEPARATOR);
        line.push_str(&entry.address.number.to_string());
        line.push_str(FIELD_SEPARATOR);
        line.push(entry.address.kind.as_char());
    }
    line
}

// ============================================================================
// Inbound messages
// ============================================================================

/// A function state change carried by a throttle update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionUpdate {
    /// Function number (0..=28).
    pub number: u8,
    /// On or off.
    pub on: bool,
}

/// Per-throttle state pushed by the server. Absent fields are `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThrottleUpdate {
    /// Throttle slot.
    pub throttle: u8,
    /// Address the update refers to.
    pub address: LocoAddress,
    /// New speed, clamped to 0..=126.
    pub speed: Option<u8>,
    /// New direction.
    pub direction: Option<Direction>,
    /// Function change.
    pub function: Option<FunctionUpdate>,
    /// Decoder speed-step mode.
    pub speed_steps: Option<SpeedStepMode>,
}

impl ThrottleUpdate {
    /// An update with no fields present.
    pub fn empty(throttle: u8, address: LocoAddress) -> Self {
        Self {
            throttle,
            address,
            speed: None,
            direction: None,
            function: None,
            speed_steps: None,
        }
    }

    /// True if no field is present.
    pub fn is_empty(&self) -> bool {
        self.speed.is_none()
            && self.direction.is_none()
            && self.function.is_none()
            && self.speed_steps.is_none()
    }
}

/// A parsed server line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// `PW<port>`: port of the JSON/web server.
    WebPort(u16),
    /// `PPA<state>`: global track power.
    TrackPower(PowerState),
    /// `RL...`: full roster.
    Roster(Roster),
    /// `M<t>A...`: throttle state.
    ThrottleUpdate(ThrottleUpdate),
    /// `M<t>+...`: the server confirmed an acquisition.
    Acquired {
        /// Throttle slot.
        throttle: u8,
        /// Acquired address.
        address: LocoAddress,
    },
    /// `M<t>-...`: the server released the throttle.
    Released {
        /// Throttle slot.
        throttle: u8,
        /// Released address, `None` for `*` (whatever the slot holds).
        address: Option<LocoAddress>,
    },
    /// `M<t>L...`: function labels for an acquired address.
    FunctionLabels {
        /// Throttle slot.
        throttle: u8,
        /// Address the labels belong to.
        address: LocoAddress,
        /// Labels in function-number order.
        labels: Vec<String>,
    },
    /// `VN<version>`
    ServerVersion(String),
    /// Leading `*`: answer with a heartbeat.
    Heartbeat,
}

/// Parses one line.
///
/// Returns `Ok(None)` for lines with an unrecognized prefix and
/// `Err(Error::Malformed)` for recognized lines that cannot be decoded.
pub fn parse_line(line: &str) -> Result<Option<Inbound>> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(first) = line.chars().next() else {
        return Ok(None);
    };
    match first {
        '*' => Ok(Some(Inbound::Heartbeat)),
        'P' => parse_power_family(&line[1..]),
        'R' => match line[1..].strip_prefix('L') {
            Some(body) => Ok(Some(Inbound::Roster(parse_roster(body)))),
            None => Ok(None),
        },
        'M' => parse_multi_throttle(&line[1..]),
        'V' => match line[1..].strip_prefix('N') {
            Some(version) => Ok(Some(Inbound::ServerVersion(version.to_owned()))),
            None => Ok(None),
        },
        _ => Ok(None),
    }
}

fn parse_power_family(rest: &str) -> Result<Option<Inbound>> {
    if let Some(port) = rest.strip_prefix('W') {
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| Error::Malformed(format!("bad web port: PW{port}")))?;
        return Ok(Some(Inbound::WebPort(port)));
    }
    if let Some(state) = rest.strip_prefix("PA") {
        let power = match state.chars().next() {
            Some('1') => PowerState::On,
            Some('0') => PowerState::Off,
            _ => PowerState::Unknown,
        };
        return Ok(Some(Inbound::TrackPower(power)));
    }
    Ok(None)
}

/// Parses the body of an `RL` line (everything after `RL`).
///
/// Entries are read until the first malformed one; the entries before it
/// are kept and the rest of the line is discarded. At most
/// [`MAX_ROSTER_ENTRIES`] are kept.
pub fn parse_roster(body: &str) -> Roster {
    let digits = body.bytes().take_while(u8::is_ascii_digit).count();
    let announced: Option<usize> = body[..digits].parse().ok();
    let mut roster = Roster::new();

    // Each `\[` opens an entry; the `]` before the next opener closes the
    // previous one.
    for (i, chunk) in body[digits..].split(ENTRY_OPEN).skip(1).enumerate() {
        let raw = chunk.strip_suffix(']').unwrap_or(chunk);
        let Some(entry) = parse_roster_entry(raw) else {
            warn!(index = i, entry = raw, "malformed roster entry, ignoring remainder");
            break;
        };
        if roster.push(entry).is_err() {
            warn!(limit = MAX_ROSTER_ENTRIES, "roster truncated");
            break;
        }
    }

    if let Some(count) = announced {
        if count != roster.len() {
            debug!(announced = count, parsed = roster.len(), "roster count mismatch");
        }
    }
    roster
}

fn parse_roster_entry(raw: &str) -> Option<RosterEntry> {
    let mut fields = raw.split(FIELD_SEPARATOR);
    let name = fields.next()?;
    let number = fields.next()?.trim().parse::<u16>().ok()?;
    let kind = AddressType::from_char(fields.next()?.trim().chars().next()?)?;
    if fields.next().is_some() {
        return None;
    }
    Some(RosterEntry::new(name, number, kind))
}

fn parse_multi_throttle(rest: &str) -> Result<Option<Inbound>> {
    let mut chars = rest.chars();
    let (Some(id), Some(action)) = (chars.next(), chars.next()) else {
        return Err(Error::Malformed(format!("short throttle line: M{rest}")));
    };
    let throttle = id
        .to_digit(10)
        .map(|d| d as u8)
        .ok_or_else(|| Error::Malformed(format!("bad throttle id {id:?}")))?;

    let body = chars.as_str();
    let (target, fields) = match body.split_once(SEPARATOR) {
        Some((target, fields)) => (target, fields),
        None => (body, ""),
    };

    match action {
        'A' => {
            let address = parse_target(target)?;
            let update = parse_update_fields(throttle, address, fields);
            Ok((!update.is_empty()).then_some(Inbound::ThrottleUpdate(update)))
        }
        '+' => Ok(Some(Inbound::Acquired {
            throttle,
            address: parse_target(target)?,
        })),
        '-' => {
            let address = match target {
                "*" | "" => None,
                other => Some(parse_target(other)?),
            };
            Ok(Some(Inbound::Released { throttle, address }))
        }
        'L' => {
            let labels = fields
                .split(ENTRY_SEPARATOR)
                .skip(1)
                .map(str::to_owned)
                .collect();
            Ok(Some(Inbound::FunctionLabels {
                throttle,
                address: parse_target(target)?,
                labels,
            }))
        }
        _ => Ok(None),
    }
}

fn parse_target(target: &str) -> Result<LocoAddress> {
    LocoAddress::parse(target).ok_or_else(|| Error::Malformed(format!("bad address {target:?}")))
}

fn parse_update_fields(throttle: u8, address: LocoAddress, fields: &str) -> ThrottleUpdate {
    let mut update = ThrottleUpdate::empty(throttle, address);
    for field in fields.split(SEPARATOR) {
        let mut chars = field.chars();
        match chars.next() {
            Some('V') => {
                if let Some(speed) = parse_speed(chars.as_str()) {
                    update.speed = Some(speed);
                }
            }
            Some('s') => {
                let mode = chars.as_str().trim().parse::<u8>().ok();
                match mode.and_then(SpeedStepMode::from_wire) {
                    Some(mode) => update.speed_steps = Some(mode),
                    None => debug!(field, "unknown speed-step mode"),
                }
            }
            Some('R') => match chars.next() {
                Some('1') => update.direction = Some(Direction::Forward),
                Some('0') => update.direction = Some(Direction::Reverse),
                _ => {}
            },
            Some('F') => {
                let on = match chars.next() {
                    Some('1') => true,
                    Some('0') => false,
                    _ => continue,
                };
                if let Ok(number) = chars.as_str().parse::<u8>() {
                    if usize::from(number) < FUNCTION_COUNT {
                        update.function = Some(FunctionUpdate { number, on });
                    }
                }
            }
            _ => {}
        }
    }
    update
}

/// Speed value clamped to 0..=126. Digit runs too long for an integer
/// saturate instead of being dropped.
fn parse_speed(text: &str) -> Option<u8> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if negative {
        return Some(0);
    }
    let value = digits.parse::<u64>().unwrap_or(u64::MAX);
    Some(value.min(u64::from(MAX_SPEED)) as u8)
}
