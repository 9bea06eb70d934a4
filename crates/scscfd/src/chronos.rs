//! Client for the external timer service: one timer per binding, popping
//! back into this node's `/timers` endpoint.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use scscf_reg_store::TimerService;

pub struct ChronosTimerService {
    http: reqwest::Client,
    base_url: String,
    callback_uri: String,
}

impl ChronosTimerService {
    pub fn new(base_url: String, callback_uri: String) -> Self {
        ChronosTimerService {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            callback_uri,
        }
    }
}

#[async_trait]
impl TimerService for ChronosTimerService {
    async fn set_timer(
        &self,
        aor: &str,
        binding_id: &str,
        old_id: Option<&str>,
        pop_at: u64,
    ) -> Option<String> {
        if let Some(old_id) = old_id {
            self.cancel_timer(old_id).await;
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let interval = pop_at.saturating_sub(now).max(1);
        let body = json!({
            "timing": { "interval": interval, "repeat-for": interval },
            "callback": {
                "http": {
                    "uri": self.callback_uri,
                    "opaque": json!({ "aor": aor, "binding": binding_id }).to_string(),
                }
            }
        });
        let rsp = self
            .http
            .post(format!("{}/timers", self.base_url))
            .json(&body)
            .send()
            .await;
        match rsp {
            Ok(rsp) if rsp.status().is_success() => {
                let id = rsp
                    .headers()
                    .get("Location")
                    .and_then(|v| v.to_str().ok())
                    .map(|loc| loc.rsplit('/').next().unwrap_or(loc).to_string());
                debug!(aor, binding_id, timer = ?id, "timer set");
                id
            }
            Ok(rsp) => {
                warn!(aor, status = rsp.status().as_u16(), "timer service refused timer");
                None
            }
            Err(e) => {
                warn!(aor, error = %e, "timer service unreachable");
                None
            }
        }
    }

    async fn cancel_timer(&self, id: &str) {
        if let Err(e) = self
            .http
            .delete(format!("{}/timers/{}", self.base_url, id))
            .send()
            .await
        {
            debug!(timer = id, error = %e, "timer cancel failed");
        }
    }
}
