use std::fmt;
use std::str::FromStr;

/// The role this node plays for a request: originating, terminating, or
/// originating again after a terminating-side retarget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionCase {
    Originating,
    Terminating,
    OriginatingCdiv,
}

impl SessionCase {
    pub fn is_originating(&self) -> bool {
        matches!(self, SessionCase::Originating | SessionCase::OriginatingCdiv)
    }

    pub fn is_terminating(&self) -> bool {
        *self == SessionCase::Terminating
    }

    /// Whether an iFC session-case code from a subscriber profile applies.
    ///
    /// Profile codes: 0 originating, 1 terminating-registered,
    /// 2 terminating-unregistered, 3 originating-unregistered,
    /// 4 originating-cdiv.
    pub fn matches_profile_code(&self, code: u8, is_registered: bool) -> bool {
        match (self, code) {
            (SessionCase::Originating, 0) => is_registered,
            (SessionCase::Originating, 3) => !is_registered,
            (SessionCase::Terminating, 1) => is_registered,
            (SessionCase::Terminating, 2) => !is_registered,
            (SessionCase::OriginatingCdiv, 4) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCase::Originating => write!(f, "orig"),
            SessionCase::Terminating => write!(f, "term"),
            SessionCase::OriginatingCdiv => write!(f, "orig-cdiv"),
        }
    }
}

impl FromStr for SessionCase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "orig" => Ok(SessionCase::Originating),
            "term" => Ok(SessionCase::Terminating),
            "orig-cdiv" => Ok(SessionCase::OriginatingCdiv),
            _ => Err(()),
        }
    }
}
