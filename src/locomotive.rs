//! Locomotive data model: addressing, direction and function state.
//!
//! A [`Locomotive`] is owned by exactly one throttle slot. It is created
//! fresh from a roster entry when the slot acquires it and dropped when the
//! slot releases it, so nothing here is shared between throttles.
//!
//! # Example
//!
//! ```rust
//! use rs_knobcab::{AddressType, Direction, LocoAddress, Locomotive};
//!
//! let mut loco = Locomotive::new("GP38", LocoAddress::long(4012));
//! assert_eq!(loco.address().to_string(), "L4012");
//!
//! loco.set_speed(200);
//! assert_eq!(loco.speed(), 126);
//! loco.set_direction(Direction::Reverse);
//! loco.set_function(0, true);
//! assert!(loco.function(0).unwrap().on);
//! assert_eq!(loco.address().kind, AddressType::Long);
//! ```

use core::fmt;

use serde::{Deserialize, Serialize};

/// Highest speed step the protocol accepts (128-step mode, 0..=126).
pub const MAX_SPEED: u8 = 126;

/// Number of decoder functions tracked per locomotive (F0..=F28).
pub const FUNCTION_COUNT: usize = 29;

/// Direction of travel.
///
/// Defaults to [`Forward`](Self::Forward); a released throttle always
/// comes back facing forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Moving forward.
    #[default]
    Forward,
    /// Moving in reverse.
    Reverse,
}

impl Direction {
    /// Returns the direction as a lowercase string.
    ///
    /// ```
    /// use rs_knobcab::Direction;
    ///
    /// assert_eq!(Direction::Forward.as_str(), "forward");
    /// assert_eq!(Direction::Reverse.as_str(), "reverse");
    /// ```
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
        }
    }

    /// `+1` for forward, `-1` for reverse.
    #[inline]
    pub const fn sign(self) -> i32 {
        match self {
            Direction::Forward => 1,
            Direction::Reverse => -1,
        }
    }
}

/// DCC address length class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    /// Short (primary) address, 1..=127.
    #[default]
    Short,
    /// Long (extended) address.
    Long,
}

impl AddressType {
    /// Wire character used by WiThrottle (`S` or `L`).
    #[inline]
    pub const fn as_char(&self) -> char {
        match self {
            AddressType::Short => 'S',
            AddressType::Long => 'L',
        }
    }

    /// Parse the WiThrottle address-type character.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'S' | 's' => Some(AddressType::Short),
            'L' | 'l' => Some(AddressType::Long),
            _ => None,
        }
    }
}

/// A DCC address together with its length class.
///
/// Displays as the WiThrottle address token, e.g. `S3` or `L4012`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocoAddress {
    /// Numeric DCC address.
    pub number: u16,
    /// Short or long addressing.
    pub kind: AddressType,
}

impl LocoAddress {
    /// Creates an address with an explicit length class.
    pub const fn new(number: u16, kind: AddressType) -> Self {
        Self { number, kind }
    }

    /// Short address.
    pub const fn short(number: u16) -> Self {
        Self::new(number, AddressType::Short)
    }

    /// Long address.
    pub const fn long(number: u16) -> Self {
        Self::new(number, AddressType::Long)
    }

    /// Parses a token such as `S3` or `L4012`.
    pub fn parse(token: &str) -> Option<Self> {
        let mut chars = token.chars();
        let kind = AddressType::from_char(chars.next()?)?;
        let number = chars.as_str().parse().ok()?;
        Some(Self { number, kind })
    }
}

impl fmt::Display for LocoAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.as_char(), self.number)
    }
}

/// Decoder speed-step mode as reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpeedStepMode {
    /// 14 speed steps.
    Steps14,
    /// 27 speed steps.
    Steps27,
    /// 28 speed steps.
    Steps28,
    /// 128 speed steps (126 usable).
    #[default]
    Steps128,
}

impl SpeedStepMode {
    /// Maps the WiThrottle `s<mode>` value (1, 2, 4, 8, 16).
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(SpeedStepMode::Steps128),
            2 | 16 => Some(SpeedStepMode::Steps28),
            4 => Some(SpeedStepMode::Steps27),
            8 => Some(SpeedStepMode::Steps14),
            _ => None,
        }
    }
}

/// State and label of one decoder function.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionSlot {
    /// Whether the function is currently on.
    pub on: bool,
    /// Server-provided label, empty if unknown.
    pub label: String,
}

/// A locomotive under control of a throttle slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Locomotive {
    name: String,
    address: LocoAddress,
    speed: u8,
    direction: Direction,
    speed_steps: SpeedStepMode,
    functions: [FunctionSlot; FUNCTION_COUNT],
}

impl Locomotive {
    /// Creates a stopped, forward-facing locomotive with all functions off.
    pub fn new(name: impl Into<String>, address: LocoAddress) -> Self {
        Self {
            name: name.into(),
            address,
            speed: 0,
            direction: Direction::Forward,
            speed_steps: SpeedStepMode::default(),
            functions: core::array::from_fn(|_| FunctionSlot::default()),
        }
    }

    /// Roster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// DCC address.
    pub fn address(&self) -> LocoAddress {
        self.address
    }

    /// Current speed step (0..=126).
    pub fn speed(&self) -> u8 {
        self.speed
    }

    /// Sets the speed, clamping to [`MAX_SPEED`].
    pub fn set_speed(&mut self, speed: u8) {
        self.speed = speed.min(MAX_SPEED);
    }

    /// Current direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Sets the direction.
    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    /// Speed-step mode.
    pub fn speed_steps(&self) -> SpeedStepMode {
        self.speed_steps
    }

    /// Sets the speed-step mode.
    pub fn set_speed_steps(&mut self, mode: SpeedStepMode) {
        self.speed_steps = mode;
    }

    /// Function slot `number`, or `None` if out of range.
    pub fn function(&self, number: u8) -> Option<&FunctionSlot> {
        self.functions.get(usize::from(number))
    }

    /// All function slots, indexed by function number.
    pub fn functions(&self) -> &[FunctionSlot] {
        &self.functions
    }

    /// Sets function state. Returns `false` if `number` is out of range.
    pub fn set_function(&mut self, number: u8, on: bool) -> bool {
        match self.functions.get_mut(usize::from(number)) {
            Some(slot) => {
                slot.on = on;
                true
            }
            None => false,
        }
    }

    /// Replaces function labels in order, starting at F0. Extra labels
    /// are ignored; missing ones become empty.
    pub fn set_function_labels<S: AsRef<str>>(&mut self, labels: &[S]) {
        for (i, slot) in self.functions.iter_mut().enumerate() {
            slot.label = labels
                .get(i)
                .map(|l| l.as_ref().to_owned())
                .unwrap_or_default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_and_parse() {
        assert_eq!(LocoAddress::short(3).to_string(), "S3");
        assert_eq!(LocoAddress::long(40).to_string(), "L40");
        assert_eq!(LocoAddress::parse("S3"), Some(LocoAddress::short(3)));
        assert_eq!(LocoAddress::parse("L4012"), Some(LocoAddress::long(4012)));
        assert_eq!(LocoAddress::parse("X3"), None);
        assert_eq!(LocoAddress::parse("S"), None);
        assert_eq!(LocoAddress::parse(""), None);
    }

    #[test]
    fn test_speed_clamps() {
        let mut loco = Locomotive::new("A", LocoAddress::short(3));
        loco.set_speed(127);
        assert_eq!(loco.speed(), MAX_SPEED);
        loco.set_speed(50);
        assert_eq!(loco.speed(), 50);
    }

    #[test]
    fn test_function_range() {
        let mut loco = Locomotive::new("A", LocoAddress::short(3));
        assert!(loco.set_function(28, true));
        assert!(!loco.set_function(29, true));
        assert!(loco.function(28).unwrap().on);
        assert!(loco.function(29).is_none());
        assert_eq!(loco.functions().len(), FUNCTION_COUNT);
    }

    #[test]
    fn test_function_labels() {
        let mut loco = Locomotive::new("A", LocoAddress::short(3));
        loco.set_function_labels(&["Headlight", "Bell", "Horn"]);
        assert_eq!(loco.function(1).unwrap().label, "Bell");
        assert_eq!(loco.function(3).unwrap().label, "");

        loco.set_function_labels::<&str>(&[]);
        assert_eq!(loco.function(0).unwrap().label, "");
    }

    #[test]
    fn test_direction_sign() {
        assert_eq!(Direction::default(), Direction::Forward);
        assert_eq!(Direction::Reverse.sign(), -1);
    }

    #[test]
    fn test_speed_step_wire_values() {
        assert_eq!(SpeedStepMode::from_wire(1), Some(SpeedStepMode::Steps128));
        assert_eq!(SpeedStepMode::from_wire(16), Some(SpeedStepMode::Steps28));
        assert_eq!(SpeedStepMode::from_wire(8), Some(SpeedStepMode::Steps14));
        assert_eq!(SpeedStepMode::from_wire(0), None);
    }
}
