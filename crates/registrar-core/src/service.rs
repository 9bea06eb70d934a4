//! Store-facing maintenance operations shared by the timer callback
//! endpoint and the third-party REGISTER failure path.

use std::sync::Arc;

use tracing::{debug, warn};

use scscf_hss_client::{HssProvider, RegOp};
use scscf_reg_store::{RegStore, SetOutcome};

/// Handle for driving registration maintenance from outside the SIP plane
/// (the timer-service callback endpoint).
pub struct RegistrarService {
    store: Arc<RegStore>,
    remote_store: Option<Arc<RegStore>>,
    hss: Arc<dyn HssProvider>,
}

impl RegistrarService {
    pub fn new(
        store: Arc<RegStore>,
        remote_store: Option<Arc<RegStore>>,
        hss: Arc<dyn HssProvider>,
    ) -> Self {
        RegistrarService {
            store,
            remote_store,
            hss,
        }
    }

    /// A binding-expiry timer popped: sweep the AoR, committing any reaping
    /// through the normal CAS write so NOTIFYs fire, and release HSS state
    /// when the last binding went.
    pub async fn handle_timer_pop(&self, aor: &str) {
        debug!(aor, "binding-expiry timer popped");
        let all_expired = sweep(&self.store, aor, true).await;
        if let Some(remote) = &self.remote_store {
            sweep(remote, aor, false).await;
        }
        if all_expired {
            if let Err(e) = self
                .hss
                .update_registration_state(aor, "", RegOp::DeregUser, 0)
                .await
            {
                warn!(aor, error = %e, "HSS de-registration failed");
            }
        }
    }
}

/// Reap expired state on one store.  Returns whether the write emptied a
/// previously-bound record.
async fn sweep(store: &RegStore, aor: &str, send_notify: bool) -> bool {
    loop {
        let mut record = match store.get_aor(aor).await {
            Ok(r) => r,
            Err(e) => {
                warn!(aor, error = %e, "expiry sweep read failed");
                return false;
            }
        };
        match store.set_aor(aor, &mut record, send_notify).await {
            Ok(SetOutcome::Written {
                all_bindings_expired,
            }) => return all_bindings_expired,
            Ok(SetOutcome::Contention) => continue,
            Err(e) => {
                warn!(aor, error = %e, "expiry sweep write failed");
                return false;
            }
        }
    }
}

/// De-register every non-emergency binding of a public identity and tell
/// the HSS.  Used when a session-terminated iFC's server rejects its
/// third-party REGISTER.
pub(crate) async fn administrative_deregister(
    store: &RegStore,
    hss: &dyn HssProvider,
    public_id: &str,
) {
    loop {
        let mut record = match store.get_aor(public_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(public_id, error = %e, "de-registration read failed");
                return;
            }
        };
        record.clear_non_emergency();
        match store.set_aor(public_id, &mut record, true).await {
            Ok(SetOutcome::Written { .. }) => break,
            Ok(SetOutcome::Contention) => continue,
            Err(e) => {
                warn!(public_id, error = %e, "de-registration write failed");
                return;
            }
        }
    }
    if let Err(e) = hss
        .update_registration_state(public_id, "", RegOp::DeregAdmin, 0)
        .await
    {
        warn!(public_id, error = %e, "HSS administrative de-registration failed");
    }
}
