// ── Canopy Tree: Keyword Extraction ────────────────────────────────────────
//
// Hybrid keyword pipeline:
//   1. Optional LLM call (strict JSON array output, defensive parse)
//   2. TF-IDF over a corpus context (1–3-grams, english stopwords,
//      max_features = 2·max_keywords)
//   3. Pattern entity extraction (proper nouns, kebab-case, acronyms,
//      domain term list)
//   4. Optional semantic expansion (plural/singular variants at cosine ≥
//      threshold)
// then multi-factor scoring and a cap of MAX_KEYWORDS_PER_NODE.
//
// Hierarchical propagation regenerates keywords bottom-up after a build:
// leaves from extraction, parents synthesized from own summary + child
// keywords, terms appearing in both ranked first.

use log::warn;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::atoms::constants::MAX_KEYWORDS_PER_NODE;
use crate::atoms::error::EngineResult;
use crate::atoms::types::Tree;
use crate::engine::models::embedding::{cosine_similarity, Embedder};
use crate::engine::models::llm::{extract_json, StructuredLlm};

const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any",
    "are", "as", "at", "be", "because", "been", "before", "being", "below", "between",
    "both", "but", "by", "can", "did", "do", "does", "doing", "down", "during", "each",
    "few", "for", "from", "further", "had", "has", "have", "having", "he", "her", "here",
    "hers", "him", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just",
    "me", "more", "most", "my", "no", "nor", "not", "now", "of", "off", "on", "once",
    "only", "or", "other", "our", "out", "over", "own", "same", "she", "should", "so",
    "some", "such", "than", "that", "the", "their", "them", "then", "there", "these",
    "they", "this", "those", "through", "to", "too", "under", "until", "up", "very",
    "was", "we", "were", "what", "when", "where", "which", "while", "who", "whom",
    "why", "will", "with", "you", "your",
];

/// Infra terms that always count as entities when present.
const DOMAIN_TERMS: &[&str] = &[
    "kubernetes", "k8s", "docker", "terraform", "helm", "prometheus", "grafana",
    "kafka", "redis", "postgres", "postgresql", "mysql", "mongodb", "elasticsearch",
    "rabbitmq", "nats", "nginx", "envoy", "istio", "aws", "gcp", "azure", "s3",
    "lambda", "cloudwatch", "pagerduty", "configmap", "statefulset", "deployment",
    "namespace", "ingress", "oauth", "jwt", "tls", "grpc", "graphql", "webhook",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS.binary_search(&word).is_ok()
}

/// Lowercase, collapse whitespace, trim punctuation. Idempotent:
/// normalize(normalize(k)) == normalize(k).
pub fn normalize_keyword(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize, dedup (order-preserving), cap.
pub fn normalize_keywords(raw: &[String], max_keywords: usize) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for kw in raw {
        let norm = normalize_keyword(kw);
        if norm.len() < 2 || is_stopword(&norm) {
            continue;
        }
        if seen.insert(norm.clone()) {
            out.push(norm);
            if out.len() >= max_keywords {
                break;
            }
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════
// Extractor
// ═══════════════════════════════════════════════════════════════════════════

/// Context handed in for hierarchical-consistency scoring.
#[derive(Debug, Default, Clone)]
pub struct NodeKeywordContext {
    pub parent_keywords: Vec<String>,
    pub child_keywords: Vec<String>,
}

pub struct KeywordExtractor {
    llm: Option<Arc<dyn StructuredLlm>>,
    embedder: Option<Arc<dyn Embedder>>,
    pub use_tfidf: bool,
    pub use_entities: bool,
    pub use_semantic_expansion: bool,
    pub semantic_threshold: f32,
    entity_patterns: Vec<Regex>,
}

impl Default for KeywordExtractor {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl KeywordExtractor {
    pub fn new(llm: Option<Arc<dyn StructuredLlm>>, embedder: Option<Arc<dyn Embedder>>) -> Self {
        let entity_patterns = vec![
            // Proper nouns ("Kubernetes", "Payment Service")
            Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b").expect("static regex"),
            // Kebab-case identifiers ("payment-service", "node-port")
            Regex::new(r"\b[a-z]+-[a-z]+(?:-[a-z]+)*\b").expect("static regex"),
            // Acronyms ("API", "SLO", "PVC")
            Regex::new(r"\b[A-Z][A-Z0-9_]{1,}\b").expect("static regex"),
        ];
        Self {
            use_semantic_expansion: embedder.is_some(),
            llm,
            embedder,
            use_tfidf: true,
            use_entities: true,
            semantic_threshold: 0.85,
            entity_patterns,
        }
    }

    /// Extract and rank keywords from one text.
    pub async fn extract(
        &self,
        text: &str,
        max_keywords: usize,
        corpus_context: Option<&[String]>,
        node_context: Option<&NodeKeywordContext>,
    ) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut candidates: BTreeSet<String> = BTreeSet::new();

        if let Some(llm) = &self.llm {
            match self.llm_keywords(llm, text, max_keywords * 2).await {
                Ok(kws) => candidates.extend(kws),
                Err(e) => warn!("[canopy:keywords] llm extraction failed: {}", e),
            }
        }

        if self.use_tfidf {
            candidates.extend(tfidf_keywords(text, corpus_context, max_keywords * 2));
        }

        if self.use_entities {
            candidates.extend(self.pattern_entities(text));
        }

        if self.use_semantic_expansion {
            if let Some(embedder) = &self.embedder {
                let list: Vec<String> = candidates.iter().cloned().collect();
                candidates.extend(self.semantic_expand(embedder, &list).await);
            }
        }

        let ranked = self.score(candidates, text, corpus_context, node_context);
        normalize_keywords(&ranked, max_keywords.min(MAX_KEYWORDS_PER_NODE))
    }

    /// Parent keyword synthesis: terms shared between the parent summary and
    /// child keywords first, then remaining parent terms, then important
    /// child-only terms.
    pub async fn synthesize(
        &self,
        text: &str,
        child_keywords: &[String],
        max_keywords: usize,
    ) -> Vec<String> {
        let parent_keywords = self.extract(text, max_keywords * 2, None, None).await;
        let mut merged: Vec<String> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        let child_norm: Vec<String> =
            child_keywords.iter().map(|k| normalize_keyword(k)).collect();

        for pk in &parent_keywords {
            let matched = child_norm
                .iter()
                .any(|ck| pk == ck || pk.contains(ck.as_str()) || ck.contains(pk.as_str()));
            if matched && seen.insert(pk.clone()) {
                merged.push(pk.clone());
            }
        }
        for pk in &parent_keywords {
            if merged.len() >= max_keywords {
                break;
            }
            if seen.insert(pk.clone()) {
                merged.push(pk.clone());
            }
        }
        for ck in &child_norm {
            if merged.len() >= max_keywords {
                break;
            }
            if !ck.is_empty() && seen.insert(ck.clone()) {
                merged.push(ck.clone());
            }
        }

        normalize_keywords(&merged, max_keywords.min(MAX_KEYWORDS_PER_NODE))
    }

    /// Regenerate keywords bottom-up across an entire tree.
    pub async fn propagate_hierarchical(&self, tree: &mut Tree) -> EngineResult<()> {
        for layer in 0..=tree.num_layers {
            let ids = tree.sorted_layer(layer);
            for id in ids {
                let (text, child_keywords) = {
                    let node = match tree.all_nodes.get(&id) {
                        Some(n) => n,
                        None => continue,
                    };
                    let child_kws: Vec<String> = node
                        .children
                        .iter()
                        .filter_map(|c| tree.all_nodes.get(c))
                        .flat_map(|c| c.keywords.iter().cloned())
                        .collect();
                    (node.text.clone(), child_kws)
                };

                let keywords = if layer == 0 {
                    self.extract(&text, MAX_KEYWORDS_PER_NODE, None, None).await
                } else {
                    self.synthesize(&text, &child_keywords, MAX_KEYWORDS_PER_NODE).await
                };

                if let Some(node) = tree.all_nodes.get_mut(&id) {
                    node.keywords = keywords;
                    node.metadata.touch();
                }
            }
        }
        Ok(())
    }

    async fn llm_keywords(
        &self,
        llm: &Arc<dyn StructuredLlm>,
        text: &str,
        max_keywords: usize,
    ) -> EngineResult<Vec<String>> {
        let value = llm
            .complete_structured(
                "You extract search keywords from operational documentation.",
                &format!(
                    "Extract at most {max_keywords} keywords/keyphrases from the text. \
                     Output ONLY a JSON array of strings.\n\nText:\n{text}"
                ),
                "[\"keyword\", ...]",
                512,
            )
            .await?;

        let arr = match value {
            serde_json::Value::Array(items) => items,
            // Some models wrap the array in an object; probe common keys.
            serde_json::Value::Object(map) => map
                .get("keywords")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default(),
            serde_json::Value::String(s) => {
                extract_json(&s).and_then(|v| v.as_array().cloned()).unwrap_or_default()
            }
            _ => Vec::new(),
        };
        Ok(arr.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
    }

    fn pattern_entities(&self, text: &str) -> Vec<String> {
        let mut entities: BTreeSet<String> = BTreeSet::new();
        for pattern in &self.entity_patterns {
            for m in pattern.find_iter(text) {
                if m.as_str().len() >= 2 {
                    entities.insert(m.as_str().to_string());
                }
            }
        }
        let lower = text.to_lowercase();
        for term in DOMAIN_TERMS {
            if lower.contains(term) {
                entities.insert((*term).to_string());
            }
        }
        entities.into_iter().take(15).collect()
    }

    /// Add plural/singular variants confirmed by embedding similarity.
    async fn semantic_expand(
        &self,
        embedder: &Arc<dyn Embedder>,
        keywords: &[String],
    ) -> Vec<String> {
        if keywords.len() < 2 {
            return Vec::new();
        }
        let mut embeddings: HashMap<&str, Vec<f32>> = HashMap::new();
        for kw in keywords {
            if let Ok(emb) = embedder.embed(kw).await {
                embeddings.insert(kw.as_str(), emb);
            }
        }

        let mut expanded = Vec::new();
        for (i, a) in keywords.iter().enumerate() {
            for b in keywords.iter().skip(i + 1) {
                if !is_plural_variant(a, b) {
                    continue;
                }
                if let (Some(ea), Some(eb)) =
                    (embeddings.get(a.as_str()), embeddings.get(b.as_str()))
                {
                    if cosine_similarity(ea, eb) >= self.semantic_threshold {
                        expanded.push(a.clone());
                        expanded.push(b.clone());
                    }
                }
            }
        }
        expanded
    }

    /// Multi-factor scoring: TF-IDF weight, heading appearance, frequency,
    /// 2–3-word phrase preference, hierarchical consistency bonus.
    fn score(
        &self,
        candidates: BTreeSet<String>,
        text: &str,
        corpus: Option<&[String]>,
        node_context: Option<&NodeKeywordContext>,
    ) -> Vec<String> {
        let text_lower = text.to_lowercase();
        let heading_text: String = text
            .lines()
            .filter(|l| l.trim_start().starts_with('#'))
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let tfidf_set: HashSet<String> =
            tfidf_keywords(text, corpus, 40).into_iter().collect();
        let context_set: HashSet<String> = node_context
            .map(|ctx| {
                ctx.parent_keywords
                    .iter()
                    .chain(ctx.child_keywords.iter())
                    .map(|k| normalize_keyword(k))
                    .collect()
            })
            .unwrap_or_default();

        let mut scored: Vec<(String, f32)> = candidates
            .into_iter()
            .filter_map(|kw| {
                let norm = normalize_keyword(&kw);
                if norm.len() < 2 || is_stopword(&norm) {
                    return None;
                }
                let mut score = 0.0f32;
                if tfidf_set.contains(&norm) {
                    score += 0.3;
                }
                if !heading_text.is_empty() && heading_text.contains(&norm) {
                    score += 0.2;
                }
                let count = text_lower.matches(&norm).count();
                if count > 0 {
                    score += 0.15 * (count as f32 / 10.0).min(1.0);
                }
                match norm.split_whitespace().count() {
                    2 | 3 => score += 0.15,
                    1 => score += 0.05,
                    _ => {}
                }
                if context_set.contains(&norm) {
                    score += 0.2;
                }
                Some((norm, score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0))
        });
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        for (kw, _) in scored {
            if seen.insert(kw.clone()) {
                out.push(kw);
            }
        }
        out
    }
}

fn is_plural_variant(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    a.clone() + "s" == b || b.clone() + "s" == a
}

// ═══════════════════════════════════════════════════════════════════════════
// TF-IDF (1–3-grams)
// ═══════════════════════════════════════════════════════════════════════════

fn ngrams_of(text: &str) -> Vec<String> {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() >= 2 && !is_stopword(w))
        .collect();

    let mut grams = Vec::new();
    for n in 1..=3usize {
        if words.len() < n {
            break;
        }
        for window in words.windows(n) {
            grams.push(window.join(" "));
        }
    }
    grams
}

/// Top terms of `text` by TF-IDF against the corpus context. Without a
/// corpus the text is its own corpus (pure TF ranking).
pub fn tfidf_keywords(text: &str, corpus: Option<&[String]>, max_features: usize) -> Vec<String> {
    let mut docs: Vec<Vec<String>> = Vec::new();
    if let Some(corpus) = corpus {
        for doc in corpus {
            docs.push(ngrams_of(doc));
        }
    }
    docs.push(ngrams_of(text));
    let n_docs = docs.len() as f32;

    // Document frequency per term.
    let mut df: HashMap<&str, usize> = HashMap::new();
    for doc in &docs {
        let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
        for term in unique {
            *df.entry(term).or_insert(0) += 1;
        }
    }

    // TF of the last document (the text under extraction).
    let target = docs.last().expect("at least one doc");
    if target.is_empty() {
        return Vec::new();
    }
    let mut tf: HashMap<&str, usize> = HashMap::new();
    for term in target {
        *tf.entry(term.as_str()).or_insert(0) += 1;
    }

    let mut scored: Vec<(&str, f32)> = tf
        .into_iter()
        .map(|(term, count)| {
            let idf = (n_docs / (1.0 + df.get(term).copied().unwrap_or(0) as f32)).ln() + 1.0;
            (term, (count as f32 / target.len() as f32) * idf)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(b.0))
    });

    scored.into_iter().take(max_features).map(|(t, _)| t.to_string()).collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Inverted keyword index
// ═══════════════════════════════════════════════════════════════════════════

/// keyword → node indices, for cheap keyword lookups against one tree.
#[derive(Debug, Default, Clone)]
pub struct KeywordIndex {
    map: BTreeMap<String, BTreeSet<u64>>,
}

impl KeywordIndex {
    pub fn build(tree: &Tree) -> Self {
        let mut map: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
        for node in tree.all_nodes.values() {
            for kw in &node.keywords {
                map.entry(normalize_keyword(kw)).or_default().insert(node.index);
            }
        }
        Self { map }
    }

    pub fn lookup(&self, keyword: &str) -> Vec<u64> {
        self.map
            .get(&normalize_keyword(keyword))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Union of nodes matching any of the keywords.
    pub fn lookup_any(&self, keywords: &[String]) -> Vec<u64> {
        let mut out: BTreeSet<u64> = BTreeSet::new();
        for kw in keywords {
            if let Some(ids) = self.map.get(&normalize_keyword(kw)) {
                out.extend(ids.iter().copied());
            }
        }
        out.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::Node;

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["  Kafka Back-Pressure! ", "REDIS", "node-port", "a  b   c"] {
            let once = normalize_keyword(raw);
            assert_eq!(normalize_keyword(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn normalize_keywords_dedups_and_caps() {
        let raw = vec![
            "Kafka".to_string(),
            "kafka".to_string(),
            "KAFKA ".to_string(),
            "redis".to_string(),
        ];
        let out = normalize_keywords(&raw, 12);
        assert_eq!(out, vec!["kafka", "redis"]);
    }

    #[test]
    fn stopwords_are_dropped() {
        let raw = vec!["the".to_string(), "with".to_string(), "kafka".to_string()];
        assert_eq!(normalize_keywords(&raw, 12), vec!["kafka"]);
    }

    #[test]
    fn tfidf_prefers_distinctive_terms() {
        let corpus = vec![
            "deployment rollback procedures for services".to_string(),
            "deployment monitoring dashboards for services".to_string(),
        ];
        let text = "deployment kafka back-pressure tuning for consumer services";
        let terms = tfidf_keywords(text, Some(&corpus), 10);
        let kafka_pos = terms.iter().position(|t| t.contains("kafka"));
        let deploy_pos = terms.iter().position(|t| t == "deployment");
        assert!(kafka_pos.is_some(), "kafka missing from {terms:?}");
        if let (Some(k), Some(d)) = (kafka_pos, deploy_pos) {
            assert!(k < d, "distinctive term should outrank common term: {terms:?}");
        }
    }

    #[tokio::test]
    async fn extraction_finds_domain_entities() {
        let extractor = KeywordExtractor::default();
        let kws = extractor
            .extract(
                "The payment-service publishes to Kafka and caches sessions in Redis.",
                12,
                None,
                None,
            )
            .await;
        assert!(kws.iter().any(|k| k == "kafka"), "kafka missing: {kws:?}");
        assert!(kws.iter().any(|k| k == "payment-service"), "kebab entity missing: {kws:?}");
    }

    #[tokio::test]
    async fn extraction_caps_at_max() {
        let extractor = KeywordExtractor::default();
        let text = "alpha bravo charlie delta echo foxtrot golf hotel india juliett \
                    kilo lima mike november oscar papa quebec romeo sierra tango";
        let kws = extractor.extract(text, 5, None, None).await;
        assert!(kws.len() <= 5);
    }

    #[tokio::test]
    async fn synthesize_prioritizes_shared_terms() {
        let extractor = KeywordExtractor::default();
        let child_kws =
            vec!["kafka".to_string(), "back-pressure".to_string(), "zookeeper".to_string()];
        let merged = extractor
            .synthesize("Handling kafka back-pressure in stream processors", &child_kws, 12)
            .await;
        assert!(!merged.is_empty());
        let kafka_pos = merged.iter().position(|k| k == "kafka").unwrap_or(usize::MAX);
        assert!(kafka_pos < 4, "shared term should rank early: {merged:?}");
        // Child-only terms still make it in.
        assert!(merged.iter().any(|k| k == "zookeeper"), "child-only term lost: {merged:?}");
    }

    #[tokio::test]
    async fn propagation_fills_every_node() {
        let mut a = Node::leaf(0, "kafka consumer lag runbook with partition rebalancing");
        let mut b = Node::leaf(1, "kafka broker throttling and back-pressure handling");
        let mut parent = Node::leaf(2, "kafka operational guidance overview");
        parent.children.insert(0);
        parent.children.insert(1);
        a.parent_ids.push(2);
        b.parent_ids.push(2);
        let mut tree = Tree::from_leaves(vec![a, b]);
        tree.all_nodes.insert(2, parent);
        tree.layer_to_nodes.insert(1, vec![2]);
        tree.num_layers = 1;

        let extractor = KeywordExtractor::default();
        extractor.propagate_hierarchical(&mut tree).await.unwrap();

        for node in tree.all_nodes.values() {
            assert!(!node.keywords.is_empty(), "node {} has no keywords", node.index);
            assert!(node.keywords.len() <= MAX_KEYWORDS_PER_NODE);
        }
        assert!(tree.all_nodes[&2].keywords.iter().any(|k| k == "kafka"));
    }

    #[test]
    fn keyword_index_lookup() {
        let mut a = Node::leaf(0, "x");
        a.keywords = vec!["kafka".to_string()];
        let mut b = Node::leaf(1, "y");
        b.keywords = vec!["kafka".to_string(), "redis".to_string()];
        let tree = Tree::from_leaves(vec![a, b]);

        let index = KeywordIndex::build(&tree);
        assert_eq!(index.lookup("Kafka"), vec![0, 1]);
        assert_eq!(index.lookup("redis"), vec![1]);
        assert!(index.lookup("postgres").is_empty());
        assert_eq!(index.lookup_any(&["redis".to_string(), "missing".to_string()]), vec![1]);
    }
}
