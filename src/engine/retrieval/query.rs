// ── Canopy Retrieval: Query Analysis ───────────────────────────────────────
//
// Classifies a query's intent, extracts content keywords and urgency, and
// optionally resolves entity mentions against the knowledge graph. Keyword
// heuristics only — fast, deterministic, no model calls.

use crate::atoms::retrieval_types::{QueryAnalysis, QueryIntent};
use crate::engine::graph::SharedGraph;

const QUERY_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "do", "for", "how", "i", "in", "is", "of", "the", "to",
    "we", "what", "when", "where", "why", "with",
];

fn contains_any(s: &str, terms: &[&str]) -> bool {
    terms.iter().any(|t| s.contains(t))
}

/// Analyze a query: intent, keywords, urgency, and graph-known entities.
pub fn analyze_query(query: &str, graph: Option<&SharedGraph>) -> QueryAnalysis {
    let q = query.to_lowercase();

    // Intent, most specific cue first.
    let intent = if contains_any(&q, &["how to", "how do", "steps to", "procedure", "runbook"]) {
        QueryIntent::Procedural
    } else if contains_any(&q, &["error", "fail", "issue", "debug", "fix", "broken", "outage", "crash"])
    {
        QueryIntent::Troubleshooting
    } else if contains_any(&q, &["compare", "difference", " vs ", "better", "tradeoff"]) {
        QueryIntent::Comparative
    } else if contains_any(&q, &["who ", "owns", "responsible", "team", "contact", "depends on"]) {
        QueryIntent::Relational
    } else if contains_any(&q, &["when ", "last ", "history", "changed", "recently"]) {
        QueryIntent::Temporal
    } else if contains_any(&q, &["overview", "explain", "tell me about", "explore"]) {
        QueryIntent::Exploratory
    } else {
        QueryIntent::Factual
    };

    // Content keywords: stopwords out, short tokens out.
    let keywords: Vec<String> = q
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '-'))
        .filter(|w| w.len() > 2 && !QUERY_STOPWORDS.contains(w))
        .map(str::to_string)
        .collect();

    // Urgency cues.
    let urgency = if contains_any(&q, &["urgent", "asap", "critical", "down", "outage", "sev1"]) {
        0.9
    } else if contains_any(&q, &["important", "production", "prod", "customer"]) {
        0.7
    } else {
        0.5
    };

    // Entity mentions via graph name/alias lookup.
    let mut entities_mentioned = Vec::new();
    if let Some(graph) = graph {
        let guard = graph.read();
        for entity in guard.find_entities(None, None, None) {
            let name = entity.name.to_lowercase();
            let hit = q.contains(&name)
                || entity.aliases.iter().any(|a| q.contains(&a.to_lowercase()));
            if hit {
                entities_mentioned.push(entity.entity_id.clone());
            }
        }
    }

    QueryAnalysis {
        original_query: query.to_string(),
        intent,
        entities_mentioned,
        keywords,
        scope_hints: Vec::new(),
        urgency,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
