// ── Canopy Intelligence: Conflict Resolver ─────────────────────────────────
//
// Decides what happens when new content closely resembles existing tree
// nodes: skip, replace, merge, add-as-new, or flag for human review.
//
// Matches below the similarity threshold are ignored. Each surviving match
// gets one LLM comparison; the highest-similarity match's recommendation is
// what gets applied. LLM failure defaults to flag-review with low
// confidence — new content is never silently dropped.

use log::{info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::atoms::error::EngineResult;
use crate::atoms::intelligence_types::{
    ChangeEvidence, ConflictRecommendation, ConflictRelationship, ConflictResolutionResult,
    ContentAnalysisResult, ExistingMatch, ImportanceAdjustment, PendingKnowledgeChange,
    ResolutionOutcome,
};
use crate::atoms::types::{Node, Tree};
use crate::engine::intelligence::pending::PendingChangeSubmitter;
use crate::engine::models::llm::StructuredLlm;

/// New content under consideration, with its analysis.
#[derive(Debug, Clone)]
pub struct NewContent {
    pub content: String,
    pub source: String,
    pub analysis: ContentAnalysisResult,
}

pub struct ConflictResolver {
    llm: Option<Arc<dyn StructuredLlm>>,
    similarity_threshold: f32,
    max_retries: usize,
}

impl ConflictResolver {
    pub fn new(llm: Option<Arc<dyn StructuredLlm>>) -> Self {
        Self { llm, similarity_threshold: 0.75, max_retries: 3 }
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Resolution
    // ═══════════════════════════════════════════════════════════════════════

    /// Compare the new content against every match above the threshold.
    pub async fn check_conflicts(
        &self,
        new: &NewContent,
        existing_matches: &[ExistingMatch],
    ) -> Vec<(ExistingMatch, ConflictResolutionResult)> {
        let mut results = Vec::new();
        for existing in existing_matches {
            if existing.similarity_score < self.similarity_threshold {
                continue;
            }
            let resolution = self.resolve_conflict(new, existing).await;
            results.push((existing.clone(), resolution));
        }
        results
    }

    /// One LLM comparison. Falls back to flag-review on persistent failure.
    pub async fn resolve_conflict(
        &self,
        new: &NewContent,
        existing: &ExistingMatch,
    ) -> ConflictResolutionResult {
        let Some(llm) = &self.llm else {
            return fallback_resolution();
        };

        let prompt = format!(
            "NEW content (source '{}'):\n{}\n\nEXISTING content (node {}, source '{}', \
             updated {}):\n{}\n\nSimilarity score: {:.2}\n\nDecide how these relate and what to \
             do with the new content.",
            new.source,
            new.content,
            existing.node_id,
            existing.source,
            existing.updated_at.to_rfc3339(),
            existing.content,
            existing.similarity_score,
        );
        let schema = r#"{
  "relationship": "duplicate|supersedes|contradicts|complements|unrelated",
  "recommendation": "skip|replace|merge|add_as_new|flag_review",
  "confidence": 0.0,
  "importance_adjustment": {"existing_multiplier": 1.0, "new_importance": 0.5},
  "reasoning": "...",
  "merged_content": null
}"#;

        for attempt in 1..=self.max_retries {
            match llm
                .complete_structured(
                    "You resolve knowledge conflicts for an SRE knowledge base. Your decisions \
                     affect what engineers see during incidents. Be thorough and careful.",
                    &prompt,
                    schema,
                    1024,
                )
                .await
            {
                Ok(value) => {
                    if let Some(result) = parse_resolution(&value) {
                        info!(
                            "[intel:conflict] node {}: {:?} → {:?} (confidence {:.2})",
                            existing.node_id,
                            result.relationship,
                            result.recommendation,
                            result.confidence
                        );
                        return result;
                    }
                    warn!(
                        "[intel:conflict] attempt {}/{}: unparseable resolution",
                        attempt, self.max_retries
                    );
                }
                Err(e) => {
                    warn!(
                        "[intel:conflict] attempt {}/{} failed: {}",
                        attempt, self.max_retries, e
                    );
                }
            }
        }

        fallback_resolution()
    }

    /// Full workflow: resolve against the matches and apply the winning
    /// recommendation to the tree.
    pub async fn resolve_and_apply(
        &self,
        new: NewContent,
        existing_matches: Vec<ExistingMatch>,
        tree: &mut Tree,
        submitter: &PendingChangeSubmitter,
    ) -> EngineResult<ResolutionOutcome> {
        let conflicts = self.check_conflicts(&new, &existing_matches).await;

        if conflicts.is_empty() {
            let node_id = store_as_new(tree, &new, None);
            return Ok(ResolutionOutcome {
                action: "added_new".into(),
                node_id: Some(node_id),
                pending_change_id: None,
                conflicts_resolved: 0,
            });
        }

        // Apply the most significant conflict: highest similarity wins.
        let (existing, resolution) = conflicts
            .into_iter()
            .max_by(|a, b| {
                a.0.similarity_score
                    .partial_cmp(&b.0.similarity_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("non-empty");

        match resolution.recommendation {
            ConflictRecommendation::Skip => {
                info!("[intel:conflict] skipping duplicate of node {}", existing.node_id);
                Ok(ResolutionOutcome {
                    action: "skipped_duplicate".into(),
                    node_id: Some(existing.node_id),
                    pending_change_id: None,
                    conflicts_resolved: 1,
                })
            }
            ConflictRecommendation::Replace => {
                apply_replace(tree, &existing, &new, &resolution);
                info!("[intel:conflict] ✓ replaced content of node {}", existing.node_id);
                Ok(ResolutionOutcome {
                    action: "replaced".into(),
                    node_id: Some(existing.node_id),
                    pending_change_id: None,
                    conflicts_resolved: 1,
                })
            }
            ConflictRecommendation::Merge => {
                apply_merge(tree, &existing, &new, &resolution);
                info!("[intel:conflict] ✓ merged content into node {}", existing.node_id);
                Ok(ResolutionOutcome {
                    action: "merged".into(),
                    node_id: Some(existing.node_id),
                    pending_change_id: None,
                    conflicts_resolved: 1,
                })
            }
            ConflictRecommendation::AddAsNew => {
                let node_id = store_as_new(tree, &new, Some(existing.node_id));
                info!(
                    "[intel:conflict] ✓ added node {} related to {}",
                    node_id, existing.node_id
                );
                Ok(ResolutionOutcome {
                    action: "added_as_related".into(),
                    node_id: Some(node_id),
                    pending_change_id: None,
                    conflicts_resolved: 1,
                })
            }
            ConflictRecommendation::FlagReview => {
                let change = build_pending_change(&new, &existing, &resolution);
                let change_id = submitter.submit(change).await;
                info!("[intel:conflict] flagged for review: {}", change_id);
                Ok(ResolutionOutcome {
                    action: "flagged_for_review".into(),
                    node_id: None,
                    pending_change_id: Some(change_id),
                    conflicts_resolved: 0,
                })
            }
        }
    }

    /// Bounded-concurrency batch resolution with per-item error isolation.
    pub async fn resolve_batch(
        &self,
        items: Vec<BatchConflictItem>,
        tree: &tokio::sync::Mutex<Tree>,
        submitter: &PendingChangeSubmitter,
        max_concurrent: usize,
    ) -> Vec<ResolutionOutcome> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let futures = items.into_iter().map(|item| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let mut guard = tree.lock().await;
                match self
                    .resolve_and_apply(item.new, item.existing_matches, &mut guard, submitter)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("[intel:conflict] batch item failed: {}", e);
                        ResolutionOutcome {
                            action: "error".into(),
                            node_id: None,
                            pending_change_id: None,
                            conflicts_resolved: 0,
                        }
                    }
                }
            }
        });
        futures::future::join_all(futures).await
    }
}

/// One unit of batch work.
pub struct BatchConflictItem {
    pub new: NewContent,
    pub existing_matches: Vec<ExistingMatch>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Application
// ═══════════════════════════════════════════════════════════════════════════

fn apply_replace(
    tree: &mut Tree,
    existing: &ExistingMatch,
    new: &NewContent,
    resolution: &ConflictResolutionResult,
) {
    if let Some(node) = tree.all_nodes.get_mut(&existing.node_id) {
        node.text = new.content.clone();
        node.metadata.source_url = Some(new.source.clone());
        node.metadata.knowledge_type =
            Some(format!("{:?}", new.analysis.knowledge_type.knowledge_type).to_lowercase());
        node.metadata.importance =
            resolution.importance_adjustment.new_importance.clamp(0.0, 1.0);
        node.keywords = new.analysis.keywords.clone();
        node.metadata.touch();
    }
}

fn apply_merge(
    tree: &mut Tree,
    existing: &ExistingMatch,
    new: &NewContent,
    resolution: &ConflictResolutionResult,
) {
    if let Some(node) = tree.all_nodes.get_mut(&existing.node_id) {
        node.text = resolution
            .merged_content
            .clone()
            .unwrap_or_else(|| format!("{}\n\n---\n\n{}", existing.content, new.content));
        node.metadata.source_url = Some(format!("{}, {}", existing.source, new.source));
        let multiplier = resolution
            .importance_adjustment
            .existing_multiplier
            .max(resolution.importance_adjustment.new_importance);
        node.metadata.importance = (node.metadata.importance * multiplier).clamp(0.0, 1.0);
        node.metadata.touch();
    }
}

fn store_as_new(tree: &mut Tree, new: &NewContent, related_to: Option<u64>) -> u64 {
    let index = tree.next_index();
    let mut node = Node::leaf(index, new.content.clone());
    node.metadata.source_url = Some(new.source.clone());
    node.metadata.importance = new.analysis.importance.overall_importance;
    node.metadata.knowledge_type =
        Some(format!("{:?}", new.analysis.knowledge_type.knowledge_type).to_lowercase());
    node.keywords = new.analysis.keywords.clone();
    if let Some(related) = related_to {
        node.metadata
            .extensions
            .insert("related_to".into(), serde_json::json!([related]));
    }
    tree.all_nodes.insert(index, node);
    tree.layer_to_nodes.entry(0).or_default().push(index);
    index
}

fn build_pending_change(
    new: &NewContent,
    existing: &ExistingMatch,
    resolution: &ConflictResolutionResult,
) -> PendingKnowledgeChange {
    let title = match resolution.relationship {
        ConflictRelationship::Contradicts => "Conflicting information detected",
        ConflictRelationship::Supersedes => "Potentially outdated information found",
        _ => "Knowledge update requires review",
    };
    let description = format!(
        "New content from '{}' conflicts with existing knowledge from '{}' \
         (relationship: {:?}).\n\nAnalysis:\n{}",
        new.source, existing.source, resolution.relationship, resolution.reasoning
    );
    let evidence = vec![
        ChangeEvidence {
            kind: "similarity_score".into(),
            value: serde_json::json!(existing.similarity_score),
            description: "Content similarity score".into(),
        },
        ChangeEvidence {
            kind: "conflict_relationship".into(),
            value: serde_json::json!(resolution.relationship),
            description: "Detected relationship between contents".into(),
        },
        ChangeEvidence {
            kind: "ai_confidence".into(),
            value: serde_json::json!(resolution.confidence),
            description: "Model confidence in the analysis".into(),
        },
    ];

    PendingKnowledgeChange {
        id: uuid::Uuid::new_v4().to_string(),
        change_type: "knowledge".into(),
        status: "pending".into(),
        title: title.into(),
        description,
        new_content: new.content.clone(),
        existing_content: existing.content.clone(),
        existing_node_id: Some(existing.node_id),
        conflict_relationship: resolution.relationship,
        reasoning: resolution.reasoning.clone(),
        confidence: resolution.confidence,
        evidence,
        source: new.source.clone(),
        proposed_by: "content_analyzer".into(),
        proposed_at: chrono::Utc::now(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Parsing / fallback
// ═══════════════════════════════════════════════════════════════════════════

fn parse_resolution(value: &Value) -> Option<ConflictResolutionResult> {
    let relationship: ConflictRelationship =
        serde_json::from_value(value.get("relationship")?.clone()).ok()?;
    let recommendation: ConflictRecommendation =
        serde_json::from_value(value.get("recommendation")?.clone()).ok()?;
    let adjustment = value
        .get("importance_adjustment")
        .and_then(|v| serde_json::from_value::<ImportanceAdjustment>(v.clone()).ok())
        .unwrap_or_default();
    Some(ConflictResolutionResult {
        relationship,
        recommendation,
        confidence: value
            .get("confidence")
            .and_then(|v| v.as_f64())
            .map(|f| f as f32)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0),
        importance_adjustment: adjustment,
        reasoning: value
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        merged_content: value
            .get("merged_content")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

fn fallback_resolution() -> ConflictResolutionResult {
    ConflictResolutionResult {
        relationship: ConflictRelationship::Unrelated,
        recommendation: ConflictRecommendation::FlagReview,
        confidence: 0.3,
        importance_adjustment: ImportanceAdjustment::default(),
        reasoning: "Conflict resolution failed; flagging for human review as a precaution."
            .into(),
        merged_content: None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::intelligence_types::{
        ImportanceAssessment, KnowledgeTypeResult,
    };
    use async_trait::async_trait;
    use serde_json::json;

    struct ScriptedLlm {
        value: Value,
    }

    #[async_trait]
    impl StructuredLlm for ScriptedLlm {
        fn model_id(&self) -> &str {
            "scripted"
        }
        async fn complete_structured(
            &self,
            _system: &str,
            _prompt: &str,
            _schema: &str,
            _max_tokens: usize,
        ) -> EngineResult<Value> {
            Ok(self.value.clone())
        }
    }

    fn new_content(text: &str, source: &str) -> NewContent {
        NewContent {
            content: text.into(),
            source: source.into(),
            analysis: ContentAnalysisResult {
                chunk_id: "c1".into(),
                source_url: Some(source.into()),
                knowledge_type: KnowledgeTypeResult::default(),
                entities: vec![],
                relationships: vec![],
                importance: ImportanceAssessment::default(),
                summary: "s".into(),
                keywords: vec!["redis".into()],
            },
        }
    }

    fn tree_with_node(text: &str) -> Tree {
        Tree::from_leaves(vec![Node::leaf(0, text)])
    }

    fn existing(node_id: u64, content: &str, source: &str, sim: f32) -> ExistingMatch {
        ExistingMatch {
            node_id,
            content: content.into(),
            source: source.into(),
            updated_at: chrono::Utc::now(),
            similarity_score: sim,
        }
    }

    fn resolver_with(value: Value) -> ConflictResolver {
        ConflictResolver::new(Some(Arc::new(ScriptedLlm { value })))
    }

    #[tokio::test]
    async fn below_threshold_matches_are_ignored() {
        let resolver = resolver_with(json!({}));
        let conflicts = resolver
            .check_conflicts(
                &new_content("x", "s"),
                &[existing(0, "y", "old", 0.5)],
            )
            .await;
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn replace_updates_existing_node_in_place() {
        let resolver = resolver_with(json!({
            "relationship": "supersedes",
            "recommendation": "replace",
            "confidence": 0.91,
            "importance_adjustment": {"existing_multiplier": 0.8, "new_importance": 0.9},
            "reasoning": "version bump"
        }));
        let mut tree = tree_with_node("Use Redis 6.0 for the session store");
        let submitter = PendingChangeSubmitter::local_only();

        let outcome = resolver
            .resolve_and_apply(
                new_content("Use Redis 7.2 for the session store", "runbook_v2"),
                vec![existing(0, "Use Redis 6.0 for the session store", "runbook_v1", 0.92)],
                &mut tree,
                &submitter,
            )
            .await
            .unwrap();

        assert_eq!(outcome.action, "replaced");
        assert_eq!(outcome.node_id, Some(0));
        assert_eq!(tree.all_nodes[&0].text, "Use Redis 7.2 for the session store");
        assert_eq!(tree.all_nodes[&0].metadata.source_url.as_deref(), Some("runbook_v2"));
        assert_eq!(tree.all_nodes.len(), 1, "no new node on replace");
        assert_eq!(submitter.submitted_count(), 0, "no pending change on replace");
    }

    #[tokio::test]
    async fn flag_review_emits_pending_change_and_preserves_node() {
        let resolver = resolver_with(json!({
            "relationship": "contradicts",
            "recommendation": "flag_review",
            "confidence": 0.7,
            "reasoning": "sources disagree"
        }));
        let mut tree = tree_with_node("TTL is 30 minutes");
        let submitter = PendingChangeSubmitter::local_only();

        let outcome = resolver
            .resolve_and_apply(
                new_content("TTL is 10 minutes", "wiki_v2"),
                vec![existing(0, "TTL is 30 minutes", "wiki_v1", 0.85)],
                &mut tree,
                &submitter,
            )
            .await
            .unwrap();

        assert_eq!(outcome.action, "flagged_for_review");
        assert!(outcome.pending_change_id.is_some());
        assert_eq!(tree.all_nodes[&0].text, "TTL is 30 minutes", "existing node unchanged");

        let pending = submitter.local_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].conflict_relationship, ConflictRelationship::Contradicts);
        assert_eq!(pending[0].new_content, "TTL is 10 minutes");
        assert_eq!(pending[0].existing_content, "TTL is 30 minutes");
        assert!(!pending[0].reasoning.is_empty());
    }

    #[tokio::test]
    async fn merge_concatenates_without_merged_content() {
        let resolver = resolver_with(json!({
            "relationship": "complements",
            "recommendation": "merge",
            "confidence": 0.8,
            "importance_adjustment": {"existing_multiplier": 1.2, "new_importance": 0.6},
            "reasoning": "complementary detail"
        }));
        let mut tree = tree_with_node("old detail");
        let submitter = PendingChangeSubmitter::local_only();

        let outcome = resolver
            .resolve_and_apply(
                new_content("new detail", "s2"),
                vec![existing(0, "old detail", "s1", 0.8)],
                &mut tree,
                &submitter,
            )
            .await
            .unwrap();

        assert_eq!(outcome.action, "merged");
        let node = &tree.all_nodes[&0];
        assert!(node.text.contains("old detail") && node.text.contains("new detail"));
        assert_eq!(node.metadata.source_url.as_deref(), Some("s1, s2"));
    }

    #[tokio::test]
    async fn add_as_new_records_cross_reference() {
        let resolver = resolver_with(json!({
            "relationship": "complements",
            "recommendation": "add_as_new",
            "confidence": 0.75,
            "reasoning": "distinct but related"
        }));
        let mut tree = tree_with_node("existing");
        let submitter = PendingChangeSubmitter::local_only();

        let outcome = resolver
            .resolve_and_apply(
                new_content("fresh knowledge", "s2"),
                vec![existing(0, "existing", "s1", 0.8)],
                &mut tree,
                &submitter,
            )
            .await
            .unwrap();

        let new_id = outcome.node_id.unwrap();
        assert_ne!(new_id, 0);
        let related = &tree.all_nodes[&new_id].metadata.extensions["related_to"];
        assert_eq!(related[0], 0);
    }

    #[tokio::test]
    async fn llm_failure_defaults_to_flag_review() {
        struct Failing;
        #[async_trait]
        impl StructuredLlm for Failing {
            fn model_id(&self) -> &str {
                "failing"
            }
            async fn complete_structured(
                &self,
                _s: &str,
                _p: &str,
                _h: &str,
                _m: usize,
            ) -> EngineResult<Value> {
                Err(crate::atoms::error::EngineError::provider("failing", "down"))
            }
        }
        let resolver = ConflictResolver::new(Some(Arc::new(Failing)));
        let resolution = resolver
            .resolve_conflict(&new_content("a", "s"), &existing(0, "b", "s1", 0.9))
            .await;
        assert_eq!(resolution.recommendation, ConflictRecommendation::FlagReview);
        assert!(resolution.confidence <= 0.3);
    }

    #[tokio::test]
    async fn no_surviving_matches_stores_as_new() {
        let resolver = resolver_with(json!({}));
        let mut tree = tree_with_node("existing");
        let submitter = PendingChangeSubmitter::local_only();
        let outcome = resolver
            .resolve_and_apply(new_content("unrelated", "s"), vec![], &mut tree, &submitter)
            .await
            .unwrap();
        assert_eq!(outcome.action, "added_new");
        assert_eq!(tree.all_nodes.len(), 2);
    }
}
