use std::ops;

/// Readiness/interest bits a `Channel` can register and a demultiplexer can
/// report back. Level-triggered only -- there is no edge or oneshot mode,
/// every backend re-arms on every wait. `hup` and `rdhup` are kept distinct
/// because the channel dispatch treats them differently: a bare HUP with no
/// readable data closes the connection, while RDHUP (peer shut down its
/// write half) is folded into the read path so the read callback observes
/// the EOF via a zero-length `read`.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Ready(u8);

const READABLE: u8 = 0b000001;
const WRITABLE: u8 = 0b000010;
const ERROR: u8 = 0b000100;
const HUP: u8 = 0b001000;
const RDHUP: u8 = 0b010000;
const INVALID: u8 = 0b100000;

impl Ready {
    pub fn empty() -> Ready {
        Ready(0)
    }

    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    pub fn error() -> Ready {
        Ready(ERROR)
    }

    pub fn hup() -> Ready {
        Ready(HUP)
    }

    pub fn rdhup() -> Ready {
        Ready(RDHUP)
    }

    /// `POLLNVAL` -- the fd isn't open/valid from the poller's point of
    /// view. Kept distinct from [`Ready::error`] so the dispatcher can warn
    /// about it specifically, even though it still folds into the same
    /// error-handling branch afterward.
    pub fn invalid() -> Ready {
        Ready(INVALID)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }

    pub fn is_hup(self) -> bool {
        self.0 & HUP != 0
    }

    pub fn is_rdhup(self) -> bool {
        self.0 & RDHUP != 0
    }

    pub fn is_invalid(self) -> bool {
        self.0 & INVALID != 0
    }

    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl std::fmt::Debug for Ready {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut first = true;
        write!(f, "Ready(")?;
        for (flag, name) in [
            (Ready::readable(), "R"),
            (Ready::writable(), "W"),
            (Ready::error(), "E"),
            (Ready::hup(), "H"),
            (Ready::rdhup(), "RH"),
            (Ready::invalid(), "NV"),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, ")")
    }
}
