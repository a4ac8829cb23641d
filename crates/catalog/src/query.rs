//! Full-text search queries.

use serde::{Deserialize, Serialize};

use marketplace_core::{DomainError, DomainResult, EntityId, EntityType};

use crate::digest::short_digest;
use crate::document::{SearchDocument, tokenize};
use crate::filter::{DEFAULT_LIMIT, MAX_LIMIT};

/// A tenant-agnostic search request. The tenant scope is supplied separately
/// by the caller's context and can never come from the query itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Free text. Empty or `*` matches every document.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(default)]
    pub category_id: Option<EntityId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub include_inactive: bool,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn of_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    pub fn is_wildcard(&self) -> bool {
        let t = self.text.trim();
        t.is_empty() || t == "*"
    }

    pub fn terms(&self) -> Vec<String> {
        if self.is_wildcard() {
            Vec::new()
        } else {
            tokenize(&self.text)
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        for bound in [self.min_price, self.max_price].into_iter().flatten() {
            if !bound.is_finite() || bound < 0.0 {
                return Err(DomainError::validation("price bounds must be non-negative numbers"));
            }
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(DomainError::validation("min_price cannot exceed max_price"));
            }
        }
        Ok(())
    }

    /// Stable digest embedded in search cache keys.
    ///
    /// Free text is normalized to its tokens, so `"Blue  widget"` and
    /// `"blue widget"` share a key.
    pub fn query_hash(&self) -> String {
        let mut tags: Vec<String> = self.tags.iter().map(|t| t.to_lowercase()).collect();
        tags.sort();
        tags.dedup();
        short_digest(&(
            self.terms(),
            self.entity_type,
            self.category_id,
            tags,
            self.min_price,
            self.max_price,
            self.include_inactive,
            self.limit(),
            self.offset(),
        ))
    }

    /// Score a document against this query; `None` when it does not match.
    ///
    /// Every term must prefix-match some token. Title hits weigh more than
    /// body hits.
    pub fn score(&self, doc: &SearchDocument) -> Option<f64> {
        if !self.passes_filters(doc) {
            return None;
        }
        let terms = self.terms();
        if terms.is_empty() {
            return Some(0.0);
        }

        let title = tokenize(&doc.title);
        let rest = doc.tokens();
        let mut score = 0.0;
        for term in &terms {
            let in_title = title.iter().filter(|t| t.starts_with(term.as_str())).count();
            let anywhere = rest.iter().filter(|t| t.starts_with(term.as_str())).count();
            if anywhere == 0 {
                return None;
            }
            score += 2.0 * in_title as f64 + anywhere as f64;
        }
        Some(score)
    }

    fn passes_filters(&self, doc: &SearchDocument) -> bool {
        if !self.include_inactive && !doc.is_active {
            return false;
        }
        if self.entity_type.is_some_and(|t| t != doc.entity_type) {
            return false;
        }
        if self.category_id.is_some() && self.category_id != doc.category_id {
            return false;
        }
        if !self.tags.is_empty()
            && !self
                .tags
                .iter()
                .all(|wanted| doc.tags.iter().any(|t| t.eq_ignore_ascii_case(wanted)))
        {
            return false;
        }
        if let Some(min) = self.min_price {
            if doc.price.is_none_or(|p| p < min) {
                return false;
            }
        }
        if let Some(max) = self.max_price {
            if doc.price.is_none_or(|p| p > max) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NewEntity;
    use chrono::Utc;
    use marketplace_core::TenantId;
    use serde_json::json;

    fn doc(payload: serde_json::Value) -> SearchDocument {
        let entity = NewEntity::prepare(TenantId::new(), EntityType::Product, payload, None)
            .unwrap()
            .into_entity(Utc::now());
        SearchDocument::project(&entity).unwrap()
    }

    #[test]
    fn prefix_terms_match_and_title_outranks_body() {
        let titled = doc(json!({"name": "Blue Widget", "sku": "A", "price": 5}));
        let described = doc(json!({"name": "Gadget", "sku": "B", "price": 5, "description": "a widget holder"}));
        let q = SearchQuery::text("widg");
        assert!(q.score(&titled).unwrap() > q.score(&described).unwrap());
        assert_eq!(q.score(&doc(json!({"name": "Lamp", "sku": "C", "price": 1}))), None);
    }

    #[test]
    fn wildcard_matches_everything_active() {
        let d = doc(json!({"name": "Lamp", "sku": "C", "price": 1}));
        assert_eq!(SearchQuery::text("*").score(&d), Some(0.0));
        let inactive = doc(json!({"name": "Lamp", "sku": "D", "price": 1, "is_active": false}));
        assert_eq!(SearchQuery::text("").score(&inactive), None);
    }

    #[test]
    fn price_range_filters() {
        let d = doc(json!({"name": "Lamp", "sku": "C", "price": 15}));
        let q = SearchQuery {
            min_price: Some(10.0),
            max_price: Some(20.0),
            ..SearchQuery::default()
        };
        assert!(q.score(&d).is_some());
        let q = SearchQuery { max_price: Some(9.0), ..q };
        assert!(q.validate().is_err());
    }

    #[test]
    fn equivalent_text_hashes_equal() {
        assert_eq!(
            SearchQuery::text("Blue  widget").query_hash(),
            SearchQuery::text("blue widget").query_hash()
        );
        assert_ne!(
            SearchQuery::text("blue").query_hash(),
            SearchQuery::text("blue").of_type(EntityType::Category).query_hash()
        );
    }
}
