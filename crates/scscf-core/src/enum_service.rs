//! ENUM seam: TEL-number to SIP-URI translation is an external
//! collaborator; the node only consumes its answer.

/// Number translation service.
pub trait EnumService: Send + Sync {
    /// Translate a subscriber number into a routable URI string, or `None`
    /// when no mapping exists.
    fn translate(&self, number: &str) -> Option<String>;
}

/// No ENUM deployment: every TEL URI stays untranslated and breaks out via
/// the BGCF.
pub struct NullEnumService;

impl EnumService for NullEnumService {
    fn translate(&self, _number: &str) -> Option<String> {
        None
    }
}
