//! Lexical relevance shared by the store and the in-memory overlay.

use std::cmp::Ordering;

use super::store::SearchHit;

/// Lowercased, deduplicated alphanumeric terms of a query.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Fraction of `terms` present in `text`, in `[0.0, 1.0]`.
///
/// An empty term list scores every text as 0.0.
pub fn lexical_score(terms: &[String], text: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    hits as f64 / terms.len() as f64
}

/// Score descending, then most recent execution first.
pub fn rank(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.record.completed_at.cmp(&a.record.completed_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terms_are_normalised() {
        assert_eq!(query_terms("Deploy, deploy the API!"), vec!["deploy", "the", "api"]);
        assert!(query_terms("  ,, ").is_empty());
    }

    #[test]
    fn score_is_fraction_of_terms() {
        let terms = query_terms("rust tokio axum");
        assert_eq!(lexical_score(&terms, "Built with Rust and Tokio"), 2.0 / 3.0);
        assert_eq!(lexical_score(&terms, "nothing relevant"), 0.0);
        assert_eq!(lexical_score(&[], "anything"), 0.0);
    }
}
