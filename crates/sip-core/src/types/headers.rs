use std::fmt;
use std::str::FromStr;

/// Header names this node recognises, with `Other` carrying anything else
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HeaderName {
    Via,
    To,
    From,
    Contact,
    CallId,
    CSeq,
    MaxForwards,
    Expires,
    MinExpires,
    ContentType,
    ContentLength,
    Route,
    RecordRoute,
    Path,
    ServiceRoute,
    Supported,
    Require,
    Authorization,
    Event,
    SubscriptionState,
    SessionExpires,
    PAssociatedUri,
    PAssertedIdentity,
    PPreferredIdentity,
    PServedUser,
    PCalledPartyId,
    PChargingVector,
    PChargingFunctionAddresses,
    PAccessNetworkInfo,
    PVisitedNetworkId,
    Privacy,
    Reason,
    Other(String),
}

impl HeaderName {
    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::To => "To",
            HeaderName::From => "From",
            HeaderName::Contact => "Contact",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::Expires => "Expires",
            HeaderName::MinExpires => "Min-Expires",
            HeaderName::ContentType => "Content-Type",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::Path => "Path",
            HeaderName::ServiceRoute => "Service-Route",
            HeaderName::Supported => "Supported",
            HeaderName::Require => "Require",
            HeaderName::Authorization => "Authorization",
            HeaderName::Event => "Event",
            HeaderName::SubscriptionState => "Subscription-State",
            HeaderName::SessionExpires => "Session-Expires",
            HeaderName::PAssociatedUri => "P-Associated-URI",
            HeaderName::PAssertedIdentity => "P-Asserted-Identity",
            HeaderName::PPreferredIdentity => "P-Preferred-Identity",
            HeaderName::PServedUser => "P-Served-User",
            HeaderName::PCalledPartyId => "P-Called-Party-ID",
            HeaderName::PChargingVector => "P-Charging-Vector",
            HeaderName::PChargingFunctionAddresses => "P-Charging-Function-Addresses",
            HeaderName::PAccessNetworkInfo => "P-Access-Network-Info",
            HeaderName::PVisitedNetworkId => "P-Visited-Network-Id",
            HeaderName::Privacy => "Privacy",
            HeaderName::Reason => "Reason",
            HeaderName::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HeaderName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let known = [
            HeaderName::Via,
            HeaderName::To,
            HeaderName::From,
            HeaderName::Contact,
            HeaderName::CallId,
            HeaderName::CSeq,
            HeaderName::MaxForwards,
            HeaderName::Expires,
            HeaderName::MinExpires,
            HeaderName::ContentType,
            HeaderName::ContentLength,
            HeaderName::Route,
            HeaderName::RecordRoute,
            HeaderName::Path,
            HeaderName::ServiceRoute,
            HeaderName::Supported,
            HeaderName::Require,
            HeaderName::Authorization,
            HeaderName::Event,
            HeaderName::SubscriptionState,
            HeaderName::SessionExpires,
            HeaderName::PAssociatedUri,
            HeaderName::PAssertedIdentity,
            HeaderName::PPreferredIdentity,
            HeaderName::PServedUser,
            HeaderName::PCalledPartyId,
            HeaderName::PChargingVector,
            HeaderName::PChargingFunctionAddresses,
            HeaderName::PAccessNetworkInfo,
            HeaderName::PVisitedNetworkId,
            HeaderName::Privacy,
            HeaderName::Reason,
        ];
        for name in known {
            if s.eq_ignore_ascii_case(name.as_str()) {
                return Ok(name);
            }
        }
        Ok(HeaderName::Other(s.to_string()))
    }
}

/// A raw header: recognised name plus unparsed value.  Typed accessors on
/// the message parse values on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: HeaderName,
    pub value: String,
}

impl Header {
    pub fn new(name: HeaderName, value: impl Into<String>) -> Self {
        Header {
            name,
            value: value.into(),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// An ordered header collection.  Order is preserved because it is
/// significant for Via, Route and Record-Route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: HeaderName, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    /// Insert a header immediately before the first header of the same
    /// name, or append if none exists.  This is how a Route or Record-Route
    /// gains a new topmost entry.
    pub fn push_front(&mut self, name: HeaderName, value: impl Into<String>) {
        let header = Header::new(name.clone(), value);
        match self.0.iter().position(|h| h.name == name) {
            Some(idx) => self.0.insert(idx, header),
            None => self.0.push(header),
        }
    }

    /// First value for `name`.
    pub fn first(&self, name: &HeaderName) -> Option<&str> {
        self.0
            .iter()
            .find(|h| &h.name == name)
            .map(|h| h.value.as_str())
    }

    /// All values for `name`, in order.
    pub fn all(&self, name: &HeaderName) -> impl Iterator<Item = &str> {
        let name = name.clone();
        self.0
            .iter()
            .filter(move |h| h.name == name)
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &HeaderName) -> bool {
        self.first(name).is_some()
    }

    /// Replace all values of `name` with a single value.
    pub fn set(&mut self, name: HeaderName, value: impl Into<String>) {
        self.remove(&name);
        self.push(name, value);
    }

    /// Remove all values of `name`, returning how many were removed.
    pub fn remove(&mut self, name: &HeaderName) -> usize {
        let before = self.0.len();
        self.0.retain(|h| &h.name != name);
        before - self.0.len()
    }

    /// Remove the first value of `name`, returning it.
    pub fn remove_first(&mut self, name: &HeaderName) -> Option<Header> {
        let idx = self.0.iter().position(|h| &h.name == name)?;
        Some(self.0.remove(idx))
    }

    /// Replace the first value of `name` in place (position preserved).
    pub fn replace_first(&mut self, name: &HeaderName, value: impl Into<String>) -> bool {
        match self.0.iter_mut().find(|h| &h.name == name) {
            Some(h) => {
                h.value = value.into();
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_parse_is_case_insensitive() {
        let name: HeaderName = "call-id".parse().unwrap();
        assert_eq!(name, HeaderName::CallId);
        let name: HeaderName = "X-Custom".parse().unwrap();
        assert_eq!(name, HeaderName::Other("X-Custom".to_string()));
    }

    #[test]
    fn push_front_precedes_existing() {
        let mut headers = Headers::new();
        headers.push(HeaderName::Route, "<sip:b.com;lr>");
        headers.push_front(HeaderName::Route, "<sip:a.com;lr>");
        let routes: Vec<_> = headers.all(&HeaderName::Route).collect();
        assert_eq!(routes, vec!["<sip:a.com;lr>", "<sip:b.com;lr>"]);
    }

    #[test]
    fn set_replaces_all() {
        let mut headers = Headers::new();
        headers.push(HeaderName::Expires, "300");
        headers.push(HeaderName::Expires, "600");
        headers.set(HeaderName::Expires, "0");
        assert_eq!(headers.all(&HeaderName::Expires).count(), 1);
        assert_eq!(headers.first(&HeaderName::Expires), Some("0"));
    }
}
