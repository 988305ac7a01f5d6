// ── Canopy Intelligence: Content Analyzer ──────────────────────────────────
//
// Structured extraction over one content chunk: knowledge type, entities,
// relationships, importance, summary, keywords.
//
// Two execution modes:
//   combined — one LLM round trip with the full schema
//   stepwise — four parallel calls (type, entities, importance, summary),
//              then one dependent relationship call over the entity list;
//              keywords are derived locally from entities + content
//
// Fallback contract: after max_retries the analyzer returns a minimal
// result (default low scores, empty lists). It never errors to the caller —
// ingestion must not stall on a flaky model.

use futures::future::join_all;
use log::{info, warn};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::atoms::error::EngineResult;
use crate::atoms::graph_types::{EntityType, RelationshipType};
use crate::atoms::intelligence_types::{
    ContentAnalysisResult, ExtractedEntity, ExtractedRelationship, ImportanceAssessment,
    KnowledgeType, KnowledgeTypeResult,
};
use crate::engine::models::llm::StructuredLlm;
use crate::engine::tree::keywords::{normalize_keywords, tfidf_keywords};

const ANALYZER_MAX_TOKENS: usize = 2048;

pub struct ContentAnalyzer {
    llm: Option<Arc<dyn StructuredLlm>>,
    max_retries: usize,
    /// Bounds concurrent chunk analyses during batch ingestion.
    max_concurrent: usize,
}

impl ContentAnalyzer {
    pub fn new(llm: Option<Arc<dyn StructuredLlm>>) -> Self {
        Self { llm, max_retries: 3, max_concurrent: 4 }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Content-addressed chunk id: sha256 over source + content, truncated.
    pub fn chunk_id_for(content: &str, source_url: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_url.unwrap_or("").as_bytes());
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())[..16].to_string()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Combined mode
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn analyze(
        &self,
        content: &str,
        source_url: Option<&str>,
        chunk_id: Option<&str>,
    ) -> ContentAnalysisResult {
        let chunk_id = chunk_id
            .map(str::to_string)
            .unwrap_or_else(|| Self::chunk_id_for(content, source_url));

        let Some(llm) = &self.llm else {
            return self.fallback_result(&chunk_id, content, source_url);
        };

        let prompt = format!(
            "Analyze this operational documentation chunk.\n\
             chunk_id: {chunk_id}\nsource: {}\n\nContent:\n{content}",
            source_url.unwrap_or("unknown")
        );
        let schema = r#"{
  "knowledge_type": {"knowledge_type": "procedural|factual|relational|temporal|social|contextual|policy|meta", "confidence": 0.0, "reasoning": "..."},
  "entities": [{"name": "...", "entity_type": "service|person|team|runbook|incident|document|technology|alert_rule|metric|environment|namespace|custom", "confidence": 0.0, "context": "..."}],
  "relationships": [{"source": "...", "target": "...", "relationship_type": "depends_on|owns|...", "confidence": 0.0, "evidence": "..."}],
  "importance": {"authority": 0.0, "criticality": 0.0, "uniqueness": 0.0, "actionability": 0.0, "freshness": 0.0, "overall_importance": 0.0},
  "summary": "<= 150 chars",
  "keywords": ["..."]
}"#;

        for attempt in 1..=self.max_retries {
            match llm
                .complete_structured(
                    "You are an expert technical content analyzer for SRE knowledge bases.",
                    &prompt,
                    schema,
                    ANALYZER_MAX_TOKENS,
                )
                .await
            {
                Ok(value) => {
                    let result = parse_analysis(&value, &chunk_id, content, source_url);
                    info!(
                        "[intel:analyzer] ✓ chunk {}: type={:?} entities={} relationships={}",
                        chunk_id,
                        result.knowledge_type.knowledge_type,
                        result.entities.len(),
                        result.relationships.len()
                    );
                    return result;
                }
                Err(e) => {
                    warn!(
                        "[intel:analyzer] attempt {}/{} failed for {}: {}",
                        attempt, self.max_retries, chunk_id, e
                    );
                }
            }
        }

        self.fallback_result(&chunk_id, content, source_url)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Stepwise mode
    // ═══════════════════════════════════════════════════════════════════════

    /// Higher-quality multi-call analysis for high-value content. Four
    /// independent calls run in parallel; the relationship call depends on
    /// the extracted entity list.
    pub async fn analyze_stepwise(
        &self,
        content: &str,
        source_url: Option<&str>,
        chunk_id: Option<&str>,
    ) -> ContentAnalysisResult {
        let chunk_id = chunk_id
            .map(str::to_string)
            .unwrap_or_else(|| Self::chunk_id_for(content, source_url));

        let Some(llm) = &self.llm else {
            return self.fallback_result(&chunk_id, content, source_url);
        };

        let (type_result, entity_result, importance_result, summary_result) = tokio::join!(
            self.classify_knowledge_type(llm, content),
            self.extract_entities(llm, content),
            self.assess_importance(llm, content, source_url),
            self.generate_summary(llm, content),
        );

        let knowledge_type = type_result.unwrap_or_default();
        let entities = entity_result.unwrap_or_default();
        let importance = importance_result.unwrap_or_default();
        let summary = summary_result.unwrap_or_else(|| truncate_summary(content));

        let relationships = if entities.is_empty() {
            Vec::new()
        } else {
            match self.extract_relationships(llm, content, &entities).await {
                Some(rels) => rels,
                None => {
                    warn!("[intel:analyzer] relationship extraction failed for {}", chunk_id);
                    Vec::new()
                }
            }
        };

        let keywords = local_keywords(content, &entities);

        ContentAnalysisResult {
            chunk_id,
            source_url: source_url.map(str::to_string),
            knowledge_type,
            entities,
            relationships,
            importance,
            summary,
            keywords,
        }
    }

    /// Analyze many chunks under the concurrency bound. Order is preserved.
    pub async fn analyze_batch(
        &self,
        items: Vec<(String, Option<String>)>,
    ) -> EngineResult<Vec<ContentAnalysisResult>> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let futures = items.iter().map(|(content, source)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                self.analyze(content, source.as_deref(), None).await
            }
        });
        Ok(join_all(futures).await)
    }

    async fn classify_knowledge_type(
        &self,
        llm: &Arc<dyn StructuredLlm>,
        content: &str,
    ) -> Option<KnowledgeTypeResult> {
        let value = llm
            .complete_structured(
                "You classify technical documentation.",
                &format!("Classify the knowledge type of this content:\n{content}"),
                r#"{"knowledge_type": "procedural|factual|relational|temporal|social|contextual|policy|meta", "confidence": 0.0, "reasoning": "..."}"#,
                512,
            )
            .await
            .ok()?;
        Some(parse_knowledge_type(&value))
    }

    async fn extract_entities(
        &self,
        llm: &Arc<dyn StructuredLlm>,
        content: &str,
    ) -> Option<Vec<ExtractedEntity>> {
        let value = llm
            .complete_structured(
                "You extract technical entities from documentation.",
                &format!("Extract entities (services, people, teams, runbooks, incidents, technologies) from:\n{content}"),
                r#"{"entities": [{"name": "...", "entity_type": "...", "confidence": 0.0, "context": "..."}]}"#,
                1024,
            )
            .await
            .ok()?;
        Some(parse_entities(value.get("entities").unwrap_or(&value)))
    }

    async fn assess_importance(
        &self,
        llm: &Arc<dyn StructuredLlm>,
        content: &str,
        source_url: Option<&str>,
    ) -> Option<ImportanceAssessment> {
        let value = llm
            .complete_structured(
                "You assess how important a piece of operational knowledge is.",
                &format!(
                    "Score this content from source '{}' on authority, criticality, uniqueness, \
                     actionability, freshness (all 0-1):\n{content}",
                    source_url.unwrap_or("unknown")
                ),
                r#"{"authority": 0.0, "criticality": 0.0, "uniqueness": 0.0, "actionability": 0.0, "freshness": 0.0, "overall_importance": 0.0}"#,
                512,
            )
            .await
            .ok()?;
        Some(parse_importance(&value))
    }

    async fn generate_summary(&self, llm: &Arc<dyn StructuredLlm>, content: &str) -> Option<String> {
        let value = llm
            .complete_structured(
                "You write one-line abstracts.",
                &format!("Summarize in at most 150 characters:\n{content}"),
                r#"{"summary": "..."}"#,
                256,
            )
            .await
            .ok()?;
        value
            .get("summary")
            .and_then(|v| v.as_str())
            .or_else(|| value.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    async fn extract_relationships(
        &self,
        llm: &Arc<dyn StructuredLlm>,
        content: &str,
        entities: &[ExtractedEntity],
    ) -> Option<Vec<ExtractedRelationship>> {
        let entity_list = entities
            .iter()
            .map(|e| format!("- {} ({:?}): {}", e.name, e.entity_type, e.context))
            .collect::<Vec<_>>()
            .join("\n");
        let value = llm
            .complete_structured(
                "You identify relationships in technical documentation.",
                &format!(
                    "Given these entities:\n{entity_list}\n\nExtract relationships supported by \
                     the content:\n{content}"
                ),
                r#"{"relationships": [{"source": "...", "target": "...", "relationship_type": "...", "confidence": 0.0, "evidence": "..."}]}"#,
                1024,
            )
            .await
            .ok()?;
        Some(parse_relationships(value.get("relationships").unwrap_or(&value)))
    }

    /// Minimal result after exhausted retries: default low scores, empty
    /// entity/relationship lists, heuristic keywords.
    fn fallback_result(
        &self,
        chunk_id: &str,
        content: &str,
        source_url: Option<&str>,
    ) -> ContentAnalysisResult {
        ContentAnalysisResult {
            chunk_id: chunk_id.to_string(),
            source_url: source_url.map(str::to_string),
            knowledge_type: KnowledgeTypeResult::default(),
            entities: Vec::new(),
            relationships: Vec::new(),
            importance: ImportanceAssessment::default(),
            summary: truncate_summary(content),
            keywords: local_keywords(content, &[]),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Defensive parsing
// ═══════════════════════════════════════════════════════════════════════════

/// Lowercased, kebab-cased canonical entity name for dedup and graph lookup.
pub fn canonical_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn f32_of(value: &Value, key: &str, default: f32) -> f32 {
    value.get(key).and_then(|v| v.as_f64()).map(|f| f as f32).unwrap_or(default).clamp(0.0, 1.0)
}

fn str_of(value: &Value, key: &str) -> String {
    value.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

fn parse_entity_type(raw: &str) -> EntityType {
    match raw.trim().to_lowercase().replace('-', "_").as_str() {
        "service" => EntityType::Service,
        "person" => EntityType::Person,
        "team" => EntityType::Team,
        "runbook" => EntityType::Runbook,
        "incident" => EntityType::Incident,
        "document" => EntityType::Document,
        "technology" => EntityType::Technology,
        "alert_rule" => EntityType::AlertRule,
        "metric" => EntityType::Metric,
        "environment" => EntityType::Environment,
        "namespace" => EntityType::Namespace,
        _ => EntityType::Custom,
    }
}

fn parse_relationship_type(raw: &str) -> RelationshipType {
    serde_json::from_value(Value::String(raw.trim().to_lowercase().replace('-', "_")))
        .unwrap_or(RelationshipType::RelatedTo)
}

fn parse_knowledge_type(value: &Value) -> KnowledgeTypeResult {
    // Accept either the wrapped or the bare shape.
    let inner = value.get("knowledge_type").filter(|v| v.is_object()).unwrap_or(value);
    let kind = inner
        .get("knowledge_type")
        .and_then(|v| v.as_str())
        .or_else(|| value.get("knowledge_type").and_then(|v| v.as_str()))
        .unwrap_or("contextual");
    let knowledge_type: KnowledgeType =
        serde_json::from_value(Value::String(kind.trim().to_lowercase()))
            .unwrap_or(KnowledgeType::Contextual);
    KnowledgeTypeResult {
        knowledge_type,
        confidence: f32_of(inner, "confidence", 0.5),
        reasoning: str_of(inner, "reasoning"),
    }
}

fn parse_entities(value: &Value) -> Vec<ExtractedEntity> {
    let Some(items) = value.as_array() else { return Vec::new() };
    items
        .iter()
        .filter_map(|item| {
            let name = str_of(item, "name");
            if name.is_empty() {
                return None;
            }
            Some(ExtractedEntity {
                canonical_name: canonical_name(&name),
                entity_type: parse_entity_type(
                    item.get("entity_type").and_then(|v| v.as_str()).unwrap_or("custom"),
                ),
                confidence: f32_of(item, "confidence", 0.5),
                context: str_of(item, "context"),
                attributes: item
                    .get("attributes")
                    .and_then(|v| v.as_object())
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default(),
                name,
            })
        })
        .collect()
}

fn parse_relationships(value: &Value) -> Vec<ExtractedRelationship> {
    let Some(items) = value.as_array() else { return Vec::new() };
    items
        .iter()
        .filter_map(|item| {
            let source = str_of(item, "source");
            let target = str_of(item, "target");
            if source.is_empty() || target.is_empty() {
                return None;
            }
            Some(ExtractedRelationship {
                source: canonical_name(&source),
                target: canonical_name(&target),
                relationship_type: parse_relationship_type(
                    item.get("relationship_type").and_then(|v| v.as_str()).unwrap_or("related_to"),
                ),
                confidence: f32_of(item, "confidence", 0.5),
                evidence: str_of(item, "evidence"),
            })
        })
        .collect()
}

fn parse_importance(value: &Value) -> ImportanceAssessment {
    let inner = value.get("importance").filter(|v| v.is_object()).unwrap_or(value);
    let authority = f32_of(inner, "authority", 0.3);
    let criticality = f32_of(inner, "criticality", 0.3);
    let uniqueness = f32_of(inner, "uniqueness", 0.3);
    let actionability = f32_of(inner, "actionability", 0.3);
    let freshness = f32_of(inner, "freshness", 0.5);
    let fallback = (authority + criticality + uniqueness + actionability + freshness) / 5.0;
    ImportanceAssessment {
        authority,
        criticality,
        uniqueness,
        actionability,
        freshness,
        overall_importance: f32_of(inner, "overall_importance", fallback),
    }
}

fn parse_analysis(
    value: &Value,
    chunk_id: &str,
    content: &str,
    source_url: Option<&str>,
) -> ContentAnalysisResult {
    let entities = parse_entities(value.get("entities").unwrap_or(&Value::Null));
    let summary = value
        .get("summary")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| truncate_summary(content));
    let mut keywords: Vec<String> = value
        .get("keywords")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    if keywords.is_empty() {
        keywords = local_keywords(content, &entities);
    } else {
        keywords = normalize_keywords(&keywords, 12);
    }

    ContentAnalysisResult {
        chunk_id: chunk_id.to_string(),
        source_url: source_url.map(str::to_string),
        knowledge_type: parse_knowledge_type(value),
        relationships: parse_relationships(value.get("relationships").unwrap_or(&Value::Null)),
        importance: parse_importance(value),
        summary,
        keywords,
        entities,
    }
}

fn truncate_summary(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut end = flat.len().min(150);
    while end > 0 && !flat.is_char_boundary(end) {
        end -= 1;
    }
    flat[..end].to_string()
}

/// Keywords derived without the LLM: entity canonical names first, then
/// distinctive content terms.
fn local_keywords(content: &str, entities: &[ExtractedEntity]) -> Vec<String> {
    let mut raw: Vec<String> = entities.iter().map(|e| e.canonical_name.clone()).collect();
    raw.extend(tfidf_keywords(content, None, 12));
    normalize_keywords(&raw, 12)
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
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

    struct FailingLlm;

    #[async_trait]
    impl StructuredLlm for FailingLlm {
        fn model_id(&self) -> &str {
            "failing"
        }
        async fn complete_structured(
            &self,
            _system: &str,
            _prompt: &str,
            _schema: &str,
            _max_tokens: usize,
        ) -> EngineResult<Value> {
            Err(crate::atoms::error::EngineError::provider("failing", "down"))
        }
    }

    #[test]
    fn canonical_name_kebab_cases() {
        assert_eq!(canonical_name("Payment Service"), "payment-service");
        assert_eq!(canonical_name("  API_Gateway  "), "api-gateway");
        assert_eq!(canonical_name(canonical_name("Payment Service").as_str()), "payment-service");
    }

    #[test]
    fn chunk_id_is_stable_and_source_sensitive() {
        let a = ContentAnalyzer::chunk_id_for("text", Some("s1"));
        let b = ContentAnalyzer::chunk_id_for("text", Some("s1"));
        let c = ContentAnalyzer::chunk_id_for("text", Some("s2"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn combined_mode_parses_full_result() {
        let llm: Arc<dyn StructuredLlm> = Arc::new(ScriptedLlm {
            value: json!({
                "knowledge_type": {"knowledge_type": "procedural", "confidence": 0.9, "reasoning": "steps"},
                "entities": [{"name": "Payment Service", "entity_type": "service", "confidence": 0.8, "context": "the payment service"}],
                "relationships": [{"source": "Payment Service", "target": "Redis", "relationship_type": "uses", "confidence": 0.7, "evidence": "uses redis"}],
                "importance": {"authority": 0.8, "criticality": 0.9, "uniqueness": 0.4, "actionability": 0.9, "freshness": 0.6, "overall_importance": 0.75},
                "summary": "How the payment service uses redis.",
                "keywords": ["payment service", "redis"]
            }),
        });
        let analyzer = ContentAnalyzer::new(Some(llm));
        let result = analyzer.analyze("content", Some("https://wiki/p"), None).await;
        assert_eq!(result.knowledge_type.knowledge_type, KnowledgeType::Procedural);
        assert_eq!(result.entities[0].canonical_name, "payment-service");
        assert_eq!(result.relationships[0].relationship_type, RelationshipType::Uses);
        assert!((result.importance.overall_importance - 0.75).abs() < 1e-6);
        assert!(result.keywords.contains(&"redis".to_string()));
    }

    #[tokio::test]
    async fn malformed_fields_degrade_not_fail() {
        let llm: Arc<dyn StructuredLlm> = Arc::new(ScriptedLlm {
            value: json!({
                "knowledge_type": "not-an-object",
                "entities": "not-an-array",
                "importance": {"criticality": 2.5},
                "summary": ""
            }),
        });
        let analyzer = ContentAnalyzer::new(Some(llm));
        let result = analyzer.analyze("some kafka content here", None, None).await;
        assert_eq!(result.knowledge_type.knowledge_type, KnowledgeType::Contextual);
        assert!(result.entities.is_empty());
        // Out-of-range scores clamp.
        assert!(result.importance.criticality <= 1.0);
        assert!(!result.summary.is_empty());
    }

    #[tokio::test]
    async fn failing_llm_yields_fallback() {
        let analyzer = ContentAnalyzer::new(Some(Arc::new(FailingLlm)));
        let result = analyzer
            .analyze("kafka back-pressure handling for consumers", None, None)
            .await;
        assert!(result.entities.is_empty());
        assert!(result.relationships.is_empty());
        assert!(result.importance.overall_importance <= 0.5);
        assert!(!result.keywords.is_empty(), "fallback still derives local keywords");
    }

    #[tokio::test]
    async fn no_llm_yields_fallback() {
        let analyzer = ContentAnalyzer::new(None);
        let result = analyzer.analyze("redis session store notes", None, None).await;
        assert_eq!(result.knowledge_type.confidence, 0.3);
        assert!(!result.summary.is_empty());
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let analyzer = ContentAnalyzer::new(None).with_max_concurrent(2);
        let items = vec![
            ("first chunk about kafka".to_string(), None),
            ("second chunk about redis".to_string(), None),
            ("third chunk about postgres".to_string(), None),
        ];
        let results = analyzer.analyze_batch(items).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].summary.contains("first"));
        assert!(results[2].summary.contains("third"));
    }
}
