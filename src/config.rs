//! Configuration types.
//!
//! `EngineConfig` covers runtime knobs; `IntentPatterns` is the loadable
//! keyword/pattern table the resolver cascade matches against. Patterns ship
//! with compiled-in defaults but can be loaded per deployment from a JSON
//! file so accounts can customize word lists without a redeploy.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Graph API base URL (version included).
    pub graph_api_url: String,
    /// Timeout for outbound platform calls.
    pub http_timeout: Duration,
    /// Timeout for user-configured webhook sinks.
    pub webhook_timeout: Duration,
    /// Maximum delay a flow node may run inline; longer delays are scheduled.
    pub max_inline_delay: Duration,
    /// Advisory backoff after a rate-limit response.
    pub rate_limit_backoff: Duration,
    /// Participant profiles older than this are refreshed from the platform.
    pub profile_freshness: Duration,
    /// Unknown intents below this confidence escalate to human handoff.
    pub fallback_confidence_threshold: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            graph_api_url: "https://graph.facebook.com/v24.0".to_string(),
            http_timeout: Duration::from_secs(15),
            webhook_timeout: Duration::from_secs(10),
            max_inline_delay: Duration::from_secs(60),
            rate_limit_backoff: Duration::from_secs(60),
            profile_freshness: Duration::from_secs(12 * 3600), // 12 hours
            fallback_confidence_threshold: 0.3,
        }
    }
}

/// One general-intent category: patterns plus a fixed confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralCategory {
    /// Substring patterns (matched case-insensitively).
    pub patterns: Vec<String>,
    /// Fixed confidence reported when a pattern matches.
    pub confidence: f32,
}

/// Loadable keyword/pattern tables for the intent resolver.
///
/// Word lists cover the languages the product serves (Uzbek, Russian,
/// English). All matching is case-insensitive on the caller's side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentPatterns {
    /// System command word lists, keyed by command value
    /// (`start_flow`, `stop_flow`, `human_handoff`, `main_menu`, `go_back`).
    pub system_commands: BTreeMap<String, Vec<String>>,
    /// Complaint/issue substring patterns.
    pub complaint_patterns: Vec<String>,
    /// Complaint sub-category lookup: category → patterns.
    pub complaint_categories: BTreeMap<String, Vec<String>>,
    /// General intent categories, in match order.
    pub general_categories: BTreeMap<String, GeneralCategory>,
    /// Keywords that request a live operator regardless of other matches.
    pub handoff_keywords: Vec<String>,
}

impl IntentPatterns {
    /// Load pattern tables from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl Default for IntentPatterns {
    fn default() -> Self {
        let mut system_commands = BTreeMap::new();
        system_commands.insert(
            "start_flow".to_string(),
            word_list(&["start", "boshlash", "boshla", "старт", "начать", "begin"]),
        );
        system_commands.insert(
            "stop_flow".to_string(),
            word_list(&["stop", "to'xtatish", "toxta", "стоп", "отмена", "cancel", "bekor"]),
        );
        system_commands.insert(
            "human_handoff".to_string(),
            word_list(&["operator", "оператор", "human", "odam", "человек"]),
        );
        system_commands.insert(
            "main_menu".to_string(),
            word_list(&["menu", "menyu", "меню", "help", "yordam", "помощь"]),
        );
        system_commands.insert(
            "go_back".to_string(),
            word_list(&["back", "orqaga", "назад"]),
        );

        let complaint_patterns = word_list(&[
            "shikoyat", "muammo", "жалоба", "проблема", "complaint", "problem", "issue",
            "qaytarib", "возврат", "refund", "buzuq", "nosoz", "брак", "defect", "broken",
            "kechikdi", "kechikish", "опоздал", "задержка", "late", "delayed",
            "aldov", "firibgar", "обман", "мошенник", "scam", "fraud",
            "yomon", "norozi", "плохо", "недоволен", "bad service", "terrible",
        ]);

        let mut complaint_categories = BTreeMap::new();
        complaint_categories.insert(
            "complaint".to_string(),
            word_list(&["shikoyat", "жалоба", "complaint"]),
        );
        complaint_categories.insert(
            "issue".to_string(),
            word_list(&["muammo", "проблема", "problem", "issue"]),
        );
        complaint_categories.insert(
            "refund".to_string(),
            word_list(&["qaytarib", "возврат", "refund"]),
        );
        complaint_categories.insert(
            "defect".to_string(),
            word_list(&["buzuq", "nosoz", "брак", "defect", "broken"]),
        );
        complaint_categories.insert(
            "delay".to_string(),
            word_list(&["kechik", "опоздал", "задержка", "late", "delayed"]),
        );
        complaint_categories.insert(
            "fraud".to_string(),
            word_list(&["aldov", "firibgar", "обман", "мошенник", "scam", "fraud"]),
        );
        complaint_categories.insert(
            "dissatisfaction".to_string(),
            word_list(&["yomon", "norozi", "плохо", "недоволен", "bad service", "terrible"]),
        );

        let mut general_categories = BTreeMap::new();
        general_categories.insert(
            "price_inquiry".to_string(),
            GeneralCategory {
                patterns: word_list(&[
                    "narx", "qancha", "necha pul", "цена", "сколько стоит", "price", "how much",
                ]),
                confidence: 0.8,
            },
        );
        general_categories.insert(
            "order_intent".to_string(),
            GeneralCategory {
                patterns: word_list(&[
                    "buyurtma", "sotib olmoqchi", "olmoqchiman", "заказ", "купить", "order", "buy",
                ]),
                confidence: 0.8,
            },
        );
        general_categories.insert(
            "info_request".to_string(),
            GeneralCategory {
                patterns: word_list(&[
                    "ma'lumot", "batafsil", "qanday", "информация", "подробнее", "info", "details",
                ]),
                confidence: 0.6,
            },
        );
        general_categories.insert(
            "delivery_status".to_string(),
            GeneralCategory {
                patterns: word_list(&[
                    "yetkazib", "qachon keladi", "доставка", "когда придет", "delivery", "shipping",
                ]),
                confidence: 0.7,
            },
        );
        general_categories.insert(
            "greeting".to_string(),
            GeneralCategory {
                patterns: word_list(&[
                    "salom", "assalomu", "привет", "здравствуйте", "hello", "hi",
                ]),
                confidence: 0.8,
            },
        );
        general_categories.insert(
            "thanks".to_string(),
            GeneralCategory {
                patterns: word_list(&["rahmat", "спасибо", "thanks", "thank you"]),
                confidence: 0.8,
            },
        );

        let handoff_keywords = word_list(&[
            "operator", "оператор", "человек", "менеджер", "menejer", "manager", "jonli",
            "живой", "support", "yordam bering", "помощь",
        ]);

        Self {
            system_commands,
            complaint_patterns,
            complaint_categories,
            general_categories,
            handoff_keywords,
        }
    }
}

fn word_list(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_patterns_have_all_six_general_categories() {
        let patterns = IntentPatterns::default();
        for category in [
            "price_inquiry",
            "order_intent",
            "info_request",
            "delivery_status",
            "greeting",
            "thanks",
        ] {
            assert!(
                patterns.general_categories.contains_key(category),
                "missing category {category}"
            );
        }
    }

    #[test]
    fn general_confidences_within_range() {
        let patterns = IntentPatterns::default();
        for (name, cat) in &patterns.general_categories {
            assert!(
                (0.6..=0.8).contains(&cat.confidence),
                "{name} confidence {} out of range",
                cat.confidence
            );
        }
    }

    #[test]
    fn patterns_round_trip_through_json() {
        let patterns = IntentPatterns::default();
        let json = serde_json::to_string(&patterns).unwrap();
        let loaded: IntentPatterns = serde_json::from_str(&json).unwrap();
        assert_eq!(
            loaded.system_commands.len(),
            patterns.system_commands.len()
        );
        assert_eq!(loaded.complaint_patterns, patterns.complaint_patterns);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        let patterns = IntentPatterns::default();
        std::fs::write(&path, serde_json::to_string(&patterns).unwrap()).unwrap();

        let loaded = IntentPatterns::load(&path).unwrap();
        assert!(loaded.system_commands.contains_key("start_flow"));
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(IntentPatterns::load(Path::new("/nonexistent/patterns.json")).is_err());
    }
}
