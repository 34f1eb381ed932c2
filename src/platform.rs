//! Control-plane HTTP client: `SignalStart`, `SignalCompletion`, and the
//! presigned-upload-URL request used by [`crate::upload`].
//!
//! `spec.md` §1 lists "the control-plane HTTP client" as an out-of-scope
//! external collaborator, referenced only through its contract from §4.F
//! steps 7/12. That contract is implemented here in full rather than
//! stubbed, grounded on
//! `original_source/.../internal/platform/client.go`, because dispatcher
//! steps 7 and 11/12 (§4.F, §4.G) call it directly and a stub would leave
//! those steps unimplemented. Uses `ureq`, a pack enrichment — the teacher
//! has no HTTP client dependency — grounded on `ureq` usage in
//! `other_examples/.../cortex-works-cortex-act` and the `ProvableHQ-leo`
//! manifest.

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::types::{CompletionRequest, UploadUrlRequest, UploadUrlResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SIGNAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PlatformClient {
    base_url: String,
    token: String,
    agent: ureq::Agent,
}

impl PlatformClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        PlatformClient {
            base_url: base_url.into(),
            token: token.into(),
            agent,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.token.is_empty()
    }

    pub fn request_upload_urls(
        &self,
        job_id: &str,
        files: &[UploadUrlRequest],
    ) -> Result<UploadUrlResponse> {
        if !self.is_configured() {
            return Err(anyhow!("platform client not configured"));
        }
        let url = format!(
            "{}/api/v1/docker/jobs/{}/request-presigned-urls",
            self.base_url, job_id
        );
        let resp = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Content-Type", "application/json")
            .send_json(serde_json::to_value(files)?)
            .map_err(|e| anyhow!("request upload URLs failed: {e}"))?;
        Ok(resp.into_json()?)
    }

    pub fn signal_start(&self, job_id: &str) -> Result<()> {
        if !self.is_configured() {
            return Err(anyhow!("platform client not configured"));
        }
        let url = format!("{}/api/v1/docker/jobs/{}/start", self.base_url, job_id);
        let resp = self
            .agent
            .post(&url)
            .timeout(SIGNAL_TIMEOUT)
            .set("Authorization", &format!("Bearer {}", self.token))
            .call();
        match resp {
            Ok(r) if r.status() == 200 || r.status() == 204 => Ok(()),
            Ok(r) => Err(anyhow!("platform returned status {}", r.status())),
            Err(e) => Err(anyhow!("start-signal request failed: {e}")),
        }
    }

    pub fn signal_completion(&self, job_id: &str, req: &CompletionRequest) -> Result<()> {
        if !self.is_configured() {
            return Err(anyhow!("platform client not configured"));
        }
        let url = format!("{}/api/v1/docker/jobs/{}/complete", self.base_url, job_id);
        let resp = self
            .agent
            .post(&url)
            .timeout(SIGNAL_TIMEOUT)
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Content-Type", "application/json")
            .send_json(serde_json::to_value(req)?);
        match resp {
            Ok(r) if r.status() == 200 || r.status() == 204 => Ok(()),
            Ok(r) => Err(anyhow!("platform returned status {}", r.status())),
            Err(e) => Err(anyhow!("completion-signal request failed: {e}")),
        }
    }
}
