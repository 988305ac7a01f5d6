// ── Canopy Intelligence: Pending-Change Submitter ──────────────────────────
//
// Transforms a resolver verdict into a review-queue submission: stable id,
// org/team routing tags, proposed and previous value payloads, reasoning,
// confidence, evidence.
//
// Delivery is fire-and-forget: one HTTP POST to the internal review
// service; on any failure the change is kept in the local fallback store
// and ingestion continues. Review-service availability never blocks
// ingestion.

use log::{info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::json;

use crate::atoms::intelligence_types::PendingKnowledgeChange;

pub struct PendingChangeSubmitter {
    client: Client,
    api_url: Option<String>,
    org_id: String,
    team_id: String,
    local_store: Mutex<Vec<PendingKnowledgeChange>>,
    submitted_count: Mutex<usize>,
}

impl PendingChangeSubmitter {
    pub fn new(api_url: Option<String>, org_id: impl Into<String>, team_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url,
            org_id: org_id.into(),
            team_id: team_id.into(),
            local_store: Mutex::new(Vec::new()),
            submitted_count: Mutex::new(0),
        }
    }

    /// Local-only submitter (no review service configured).
    pub fn local_only() -> Self {
        Self::new(None, "default", "default")
    }

    /// Submit a pending change. Returns its stable id; never errors.
    pub async fn submit(&self, change: PendingKnowledgeChange) -> String {
        let change_id = change.id.clone();

        if let Some(base) = &self.api_url {
            match self.post(base, &change).await {
                Ok(()) => {
                    *self.submitted_count.lock() += 1;
                    info!("[intel:pending] ✓ submitted change {} for review", change_id);
                    return change_id;
                }
                Err(e) => {
                    warn!(
                        "[intel:pending] review service unreachable ({}), storing locally",
                        e
                    );
                }
            }
        }

        self.local_store.lock().push(change);
        *self.submitted_count.lock() += 1;
        info!("[intel:pending] stored change {} locally", change_id);
        change_id
    }

    async fn post(&self, base: &str, change: &PendingKnowledgeChange) -> Result<(), String> {
        let url = format!("{}/api/v1/internal/pending-changes", base.trim_end_matches('/'));
        let body = json!({
            "id": change.id,
            "change_type": change.change_type,
            "org_id": self.org_id,
            "team_id": self.team_id,
            "title": change.title,
            "description": change.description,
            "proposed_value": {
                "content": change.new_content,
                "source": change.source,
                "ai_reasoning": change.reasoning,
                "confidence": change.confidence,
                "evidence": change.evidence,
            },
            "previous_value": {
                "content": change.existing_content,
                "node_id": change.existing_node_id,
            },
            "requested_by": change.proposed_by,
            "reason": change.conflict_relationship,
            "status": change.status,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("review service returned {}", resp.status()));
        }
        Ok(())
    }

    /// Changes that could not reach the review service.
    pub fn local_pending(&self) -> Vec<PendingKnowledgeChange> {
        self.local_store.lock().clone()
    }

    pub fn submitted_count(&self) -> usize {
        *self.submitted_count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::intelligence_types::ConflictRelationship;

    fn change() -> PendingKnowledgeChange {
        PendingKnowledgeChange {
            id: uuid::Uuid::new_v4().to_string(),
            change_type: "knowledge".into(),
            status: "pending".into(),
            title: "Conflicting information detected".into(),
            description: "desc".into(),
            new_content: "new".into(),
            existing_content: "old".into(),
            existing_node_id: Some(7),
            conflict_relationship: ConflictRelationship::Contradicts,
            reasoning: "contradiction".into(),
            confidence: 0.6,
            evidence: vec![],
            source: "runbook_v2".into(),
            proposed_by: "content_analyzer".into(),
            proposed_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn no_api_stores_locally_and_returns_id() {
        let submitter = PendingChangeSubmitter::local_only();
        let c = change();
        let id = c.id.clone();
        let got = submitter.submit(c).await;
        assert_eq!(got, id);
        assert_eq!(submitter.local_pending().len(), 1);
        assert_eq!(submitter.submitted_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_api_falls_back_locally() {
        // Nothing listens on this port; the POST must fail fast and fall back.
        let submitter =
            PendingChangeSubmitter::new(Some("http://127.0.0.1:1".into()), "org", "team");
        let got = submitter.submit(change()).await;
        assert!(!got.is_empty());
        assert_eq!(submitter.local_pending().len(), 1);
    }
}
