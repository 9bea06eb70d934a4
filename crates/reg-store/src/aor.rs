//! The AoR record: the atomic unit of registration state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One registered contact of an AoR.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Contact URI the UE registered.
    pub uri: String,
    /// Ordered path-route list learnt from Path headers (RFC 3327).
    pub path_headers: Vec<String>,
    /// Call-ID of the REGISTER that created or last refreshed this binding.
    pub cid: String,
    /// CSeq of that REGISTER; stale retransmissions carry an older value.
    pub cseq: u32,
    /// q-value in thousandths (0-1000).
    pub priority: u16,
    /// Contact parameters as received, minus server-managed names.
    pub params: BTreeMap<String, String>,
    /// Private identity that authenticated this binding.
    pub private_id: String,
    /// Absolute expiry time in seconds since the epoch.
    pub expires: u64,
    /// Emergency registrations resist de-registration and expiry shortening.
    pub emergency: bool,
    /// Opaque timer-service handle for the expiry pop.
    #[serde(default)]
    pub timer_id: String,
}

impl Binding {
    /// The `+sip.instance` value recorded in the parameter map, if any.
    pub fn instance_id(&self) -> Option<&str> {
        self.params.get("+sip.instance").map(|v| {
            let v = v.as_str();
            if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
                &v[1..v.len() - 1]
            } else {
                v
            }
        })
    }
}

/// A reginfo-package watcher on an AoR, keyed by its dialog (the To tag the
/// node assigned on SUBSCRIBE).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// URI of the watcher (the SUBSCRIBE's From).
    pub from_uri: String,
    pub from_tag: String,
    /// URI watched (the SUBSCRIBE's To).
    pub to_uri: String,
    pub to_tag: String,
    /// Where NOTIFYs are sent (the SUBSCRIBE's Contact).
    pub req_uri: String,
    /// Route set for NOTIFYs, learnt from Record-Route.
    pub route_hdrs: Vec<String>,
    pub cid: String,
    /// Absolute expiry time in seconds since the epoch.
    pub expires: u64,
    #[serde(default)]
    pub timer_id: String,
}

/// Classification of a binding change, carried in reginfo NOTIFY bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactEvent {
    Created,
    Refreshed,
    Expired,
    Deactivated,
    Unregistered,
}

impl ContactEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactEvent::Created => "created",
            ContactEvent::Refreshed => "refreshed",
            ContactEvent::Expired => "expired",
            ContactEvent::Deactivated => "deactivated",
            ContactEvent::Unregistered => "unregistered",
        }
    }

    /// Whether the contact remains active after this event.
    pub fn is_active(&self) -> bool {
        matches!(self, ContactEvent::Created | ContactEvent::Refreshed)
    }
}

/// A pending change to one binding, queued on the record between the mutation
/// and the NOTIFY fan-out at write time.
#[derive(Debug, Clone)]
pub struct BindingEvent {
    pub binding_id: String,
    pub event: ContactEvent,
    pub contact_uri: String,
    /// Absolute expiry of the binding after the event.
    pub expires: u64,
}

/// The atomic unit of storage: all registration state for one AoR.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AoR {
    pub bindings: BTreeMap<String, Binding>,
    pub subscriptions: BTreeMap<String, Subscription>,
    /// Monotonically increasing sequence used for NOTIFY CSeq and reginfo
    /// version.
    pub notify_cseq: u32,

    /// CAS token observed at read time; 0 for a record not yet written.
    #[serde(skip)]
    pub cas: u64,
    /// Whether the record had any binding when it was read, before reaping.
    /// Drives the `all_bindings_expired` outcome.
    #[serde(skip)]
    pub had_bindings_at_read: bool,
    /// Binding changes queued for the NOTIFY fan-out on the next write.
    #[serde(skip)]
    pub pending_events: Vec<BindingEvent>,
}

impl AoR {
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty() && self.subscriptions.is_empty()
    }

    pub fn get_binding(&self, id: &str) -> Option<&Binding> {
        self.bindings.get(id)
    }

    pub fn get_or_create_binding(&mut self, id: &str) -> &mut Binding {
        self.bindings.entry(id.to_string()).or_default()
    }

    /// Remove a binding, queueing the given event for NOTIFY.
    pub fn remove_binding(&mut self, id: &str, event: ContactEvent) -> Option<Binding> {
        let binding = self.bindings.remove(id)?;
        if !binding.emergency {
            self.pending_events.push(BindingEvent {
                binding_id: id.to_string(),
                event,
                contact_uri: binding.uri.clone(),
                expires: 0,
            });
        }
        Some(binding)
    }

    /// Remove every non-emergency binding (wildcard de-registration).
    /// Emergency bindings are only ever removed by natural expiry.
    pub fn clear_non_emergency(&mut self) {
        let ids: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, b)| !b.emergency)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.remove_binding(&id, ContactEvent::Deactivated);
        }
    }

    /// Record a created/refreshed event for a live binding.
    pub fn note_binding_event(&mut self, id: &str, event: ContactEvent) {
        if let Some(b) = self.bindings.get(id) {
            if !b.emergency {
                self.pending_events.push(BindingEvent {
                    binding_id: id.to_string(),
                    event,
                    contact_uri: b.uri.clone(),
                    expires: b.expires,
                });
            }
        }
    }

    /// Drop bindings whose expiry has passed, queueing Expired events for
    /// the non-emergency ones.  Returns the removed bindings so their
    /// timers can be cancelled.
    pub fn expire_bindings(&mut self, now: u64) -> Vec<(String, Binding)> {
        let expired_ids: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.expires <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut removed = Vec::new();
        for id in expired_ids {
            if let Some(binding) = self.bindings.remove(&id) {
                if !binding.emergency {
                    self.pending_events.push(BindingEvent {
                        binding_id: id.clone(),
                        event: ContactEvent::Expired,
                        contact_uri: binding.uri.clone(),
                        expires: 0,
                    });
                }
                removed.push((id, binding));
            }
        }
        removed
    }

    /// Drop subscriptions whose expiry has passed.
    pub fn expire_subscriptions(&mut self, now: u64) -> Vec<(String, Subscription)> {
        let expired_ids: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.expires <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| self.subscriptions.remove(&id).map(|s| (id, s)))
            .collect()
    }

    /// Earliest expiry across live bindings, used to schedule the pop timer.
    pub fn next_expiry(&self) -> Option<u64> {
        self.bindings.values().map(|b| b.expires).min()
    }

    /// Bindings that have not yet expired.
    pub fn active_bindings(&self, now: u64) -> impl Iterator<Item = (&String, &Binding)> {
        self.bindings.iter().filter(move |(_, b)| b.expires > now)
    }

    /// Subscriptions that have not yet expired.
    pub fn active_subscriptions(&self, now: u64) -> impl Iterator<Item = (&String, &Subscription)> {
        self.subscriptions
            .iter()
            .filter(move |(_, s)| s.expires > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn binding(expires: u64, emergency: bool) -> Binding {
        Binding {
            uri: "sip:alice@192.0.2.1".to_string(),
            cid: "cid-1".to_string(),
            cseq: 1,
            priority: 1000,
            expires,
            emergency,
            ..Default::default()
        }
    }

    #[test]
    fn expire_reaps_and_queues_events() {
        let mut aor = AoR::default();
        aor.bindings.insert("b1".to_string(), binding(100, false));
        aor.bindings.insert("b2".to_string(), binding(500, false));
        let removed = aor.expire_bindings(200);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "b1");
        assert_eq!(aor.bindings.len(), 1);
        assert_eq!(aor.pending_events.len(), 1);
        assert_eq!(aor.pending_events[0].event, ContactEvent::Expired);
    }

    #[test]
    fn emergency_binding_expiry_is_silent() {
        let mut aor = AoR::default();
        aor.bindings.insert("sos1".to_string(), binding(100, true));
        let removed = aor.expire_bindings(200);
        assert_eq!(removed.len(), 1);
        assert!(aor.pending_events.is_empty());
    }

    #[test]
    fn wildcard_clear_spares_emergency() {
        let mut aor = AoR::default();
        aor.bindings.insert("b1".to_string(), binding(500, false));
        aor.bindings.insert("sos1".to_string(), binding(500, true));
        aor.clear_non_emergency();
        assert_eq!(aor.bindings.len(), 1);
        assert!(aor.bindings.contains_key("sos1"));
        assert_eq!(aor.pending_events[0].event, ContactEvent::Deactivated);
    }

    #[test]
    fn serde_round_trip_preserves_sets() {
        let mut aor = AoR::default();
        aor.bindings.insert("b1".to_string(), binding(500, false));
        aor.subscriptions.insert(
            "tag1".to_string(),
            Subscription {
                from_uri: "sip:watcher@example.com".to_string(),
                from_tag: "ft".to_string(),
                to_uri: "sip:alice@example.com".to_string(),
                to_tag: "tag1".to_string(),
                req_uri: "sip:watcher@192.0.2.9".to_string(),
                cid: "sub-cid".to_string(),
                expires: 900,
                ..Default::default()
            },
        );
        aor.notify_cseq = 7;

        let encoded = serde_json::to_vec(&aor).unwrap();
        let decoded: AoR = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.bindings, aor.bindings);
        assert_eq!(decoded.subscriptions, aor.subscriptions);
        assert_eq!(decoded.notify_cseq, 7);
    }
}
