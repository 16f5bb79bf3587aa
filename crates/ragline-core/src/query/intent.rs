//! Intent recognition and slot gate.
//!
//! The gate classifies the original query, tags every output query with the
//! recognised intent and, when a [`SlotTemplate`] exists for that intent,
//! checks that the required slots can be filled from the query text. When
//! they cannot, a [`Clarification`] is stored on the context so the caller
//! can ask the user instead of (or before) retrieving.
//!
//! Two metadata keys on the original query carry conversation state from
//! earlier turns: `known_slots` (an object of already-filled slots) and
//! `clarification_count` (how many times this request has been clarified).

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use anyhow::anyhow;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::context::{Clarification, PipelineConfig, QueryContext};
use super::pipeline::QueryStage;
use crate::model::ModelProvider;
use crate::models::{Metadata, Query};

static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)").unwrap());
static INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)").unwrap());
static DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}[-/]\d{1,2}[-/]\d{1,2})").unwrap());
static TIME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{1,2}:\d{2}(?::\d{2})?)").unwrap());
static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})").unwrap());
static PHONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(1[3-9]\d{9})").unwrap());
static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(https?://[^\s]+)").unwrap());

/// Default number of clarification rounds before the gate lets a request
/// through with missing slots.
pub const DEFAULT_MAX_CLARIFICATION_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
    /// Matched against the slot's examples only.
    #[default]
    Text,
    Number,
    Integer,
    Date,
    Time,
    Email,
    Phone,
    Url,
}

impl SlotType {
    fn pattern(&self) -> Option<&'static Regex> {
        match self {
            SlotType::Text => None,
            SlotType::Number => Some(&*NUMBER),
            SlotType::Integer => Some(&*INTEGER),
            SlotType::Date => Some(&*DATE),
            SlotType::Time => Some(&*TIME),
            SlotType::Email => Some(&*EMAIL),
            SlotType::Phone => Some(&*PHONE),
            SlotType::Url => Some(&*URL),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotDefinition {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, rename = "type")]
    pub slot_type: SlotType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub hint: Option<String>,
    /// Position used when listing missing slots; unset sorts last.
    #[serde(default)]
    pub order: Option<i32>,
}

impl SlotDefinition {
    pub fn new(name: impl Into<String>, slot_type: SlotType) -> Self {
        Self {
            name: name.into(),
            label: None,
            slot_type,
            required: false,
            examples: Vec::new(),
            hint: None,
            order: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    /// Value for this slot found in `text`: the first pattern match for
    /// typed slots, else the first example contained in the text.
    pub fn extract(&self, text: &str) -> Option<String> {
        if let Some(caps) = self.slot_type.pattern().and_then(|re| re.captures(text)) {
            if let Some(m) = caps.get(1) {
                return Some(m.as_str().to_string());
            }
        }
        self.examples
            .iter()
            .find(|e| !e.is_empty() && text.contains(e.as_str()))
            .cloned()
    }

    fn sort_key(&self) -> i32 {
        self.order.unwrap_or(999)
    }
}

fn default_threshold() -> f64 {
    1.0
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_CLARIFICATION_ATTEMPTS
}

/// Slots expected for one intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotTemplate {
    pub intent_code: String,
    #[serde(default)]
    pub slots: Vec<SlotDefinition>,
    /// Clarify only when completeness falls below this ratio.
    #[serde(default = "default_threshold")]
    pub completeness_threshold: f64,
    #[serde(default)]
    pub block_retrieval_on_missing: bool,
    /// Custom question per slot name.
    #[serde(default)]
    pub clarification_templates: BTreeMap<String, String>,
    #[serde(default = "default_max_attempts")]
    pub max_clarification_attempts: u32,
}

/// Result of checking a query against a [`SlotTemplate`].
#[derive(Debug, Clone, PartialEq)]
pub struct SlotEvaluation<'a> {
    pub extracted: Metadata,
    /// Missing required slots, ordered by `order`.
    pub missing: Vec<&'a SlotDefinition>,
    /// Filled required slots / required slots (1.0 when none are required).
    pub completeness: f64,
}

impl SlotTemplate {
    pub fn new(intent_code: impl Into<String>) -> Self {
        Self {
            intent_code: intent_code.into(),
            slots: Vec::new(),
            completeness_threshold: default_threshold(),
            block_retrieval_on_missing: false,
            clarification_templates: BTreeMap::new(),
            max_clarification_attempts: DEFAULT_MAX_CLARIFICATION_ATTEMPTS,
        }
    }

    pub fn with_slot(mut self, slot: SlotDefinition) -> Self {
        self.slots.push(slot);
        self
    }

    /// Fill slots from `known` (earlier turns) and then from `text`.
    pub fn evaluate(&self, text: &str, known: &Metadata) -> SlotEvaluation<'_> {
        let mut extracted = Metadata::new();
        for slot in &self.slots {
            if let Some(v) = known.get(&slot.name).filter(|v| !v.is_null()) {
                extracted.insert(slot.name.clone(), v.clone());
            }
            if let Some(v) = slot.extract(text) {
                extracted.insert(slot.name.clone(), Value::String(v));
            }
        }

        let required: Vec<&SlotDefinition> = self.slots.iter().filter(|s| s.required).collect();
        let mut missing: Vec<&SlotDefinition> = required
            .iter()
            .copied()
            .filter(|s| !extracted.contains_key(&s.name))
            .collect();
        missing.sort_by_key(|s| s.sort_key());

        let completeness = if required.is_empty() {
            1.0
        } else {
            (required.len() - missing.len()) as f64 / required.len() as f64
        };

        SlotEvaluation {
            extracted,
            missing,
            completeness,
        }
    }

    /// The question asked for a missing slot: the custom template, else the
    /// hint, else the label with up to three examples.
    pub fn question_for(&self, slot: &SlotDefinition) -> String {
        if let Some(q) = self
            .clarification_templates
            .get(&slot.name)
            .filter(|q| !q.trim().is_empty())
        {
            return q.clone();
        }
        if let Some(hint) = slot.hint.as_deref().filter(|h| !h.trim().is_empty()) {
            return format!("Please provide {}: {}", slot.display_label(), hint);
        }
        let base = format!("Please provide {}", slot.display_label());
        if slot.examples.is_empty() {
            return base;
        }
        let examples: Vec<&str> = slot.examples.iter().take(3).map(String::as_str).collect();
        format!("{} (e.g. {})", base, examples.join(", "))
    }
}

/// A recognised intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentMatch {
    pub code: String,
    pub confidence: f64,
}

/// Maps query text to an intent.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> anyhow::Result<Option<IntentMatch>>;
}

/// Keyword list for one intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRule {
    pub code: String,
    pub keywords: Vec<String>,
}

/// Picks the intent with the most keyword hits (case-insensitive substring
/// match). Confidence is the fraction of the rule's keywords that matched.
#[derive(Debug, Clone, Default)]
pub struct KeywordIntentClassifier {
    rules: Vec<IntentRule>,
}

impl KeywordIntentClassifier {
    pub fn new(rules: Vec<IntentRule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(&self, text: &str) -> anyhow::Result<Option<IntentMatch>> {
        let lower = text.to_lowercase();
        let mut best: Option<(usize, IntentMatch)> = None;

        for rule in &self.rules {
            if rule.keywords.is_empty() {
                continue;
            }
            let hits = rule
                .keywords
                .iter()
                .filter(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
                .count();
            if hits == 0 {
                continue;
            }
            let confidence = hits as f64 / rule.keywords.len() as f64;
            let better = match &best {
                None => true,
                Some((h, m)) => hits > *h || (hits == *h && confidence > m.confidence),
            };
            if better {
                best = Some((
                    hits,
                    IntentMatch {
                        code: rule.code.clone(),
                        confidence,
                    },
                ));
            }
        }
        Ok(best.map(|(_, m)| m))
    }
}

#[derive(Debug, Deserialize)]
struct ModelIntentReply {
    intent: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Asks a chat model to pick one of a fixed set of intent codes.
pub struct ModelIntentClassifier {
    provider: Arc<dyn ModelProvider>,
    model_id: i64,
    intents: Vec<String>,
}

impl ModelIntentClassifier {
    pub fn new(provider: Arc<dyn ModelProvider>, model_id: i64, intents: Vec<String>) -> Self {
        Self {
            provider,
            model_id,
            intents,
        }
    }

    fn prompt(&self, text: &str) -> String {
        format!(
            "Classify the user query into exactly one of these intents: {}.\n\
             Reply with JSON only: {{\"intent\": \"<code or none>\", \"confidence\": <0.0-1.0>}}\n\
             Query: {}",
            self.intents.join(", "),
            text
        )
    }

    fn known_code(&self, candidate: &str) -> Option<String> {
        let candidate = candidate.trim().trim_matches('"');
        self.intents
            .iter()
            .find(|c| c.eq_ignore_ascii_case(candidate))
            .cloned()
    }

    fn parse_reply(&self, reply: &str) -> Option<IntentMatch> {
        let json = reply
            .find('{')
            .zip(reply.rfind('}'))
            .filter(|(start, end)| start < end)
            .and_then(|(start, end)| serde_json::from_str::<ModelIntentReply>(&reply[start..=end]).ok());

        match json {
            Some(parsed) => {
                let code = self.known_code(parsed.intent.as_deref()?)?;
                Some(IntentMatch {
                    code,
                    confidence: parsed.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
                })
            }
            None => self.known_code(reply).map(|code| IntentMatch {
                code,
                confidence: 1.0,
            }),
        }
    }
}

#[async_trait]
impl IntentClassifier for ModelIntentClassifier {
    async fn classify(&self, text: &str) -> anyhow::Result<Option<IntentMatch>> {
        if self.intents.is_empty() {
            return Ok(None);
        }
        let reply = self
            .provider
            .chat(self.model_id, &self.prompt(text))
            .await
            .map_err(|e| anyhow!("intent model call failed: {}", e))?;
        Ok(self.parse_reply(&reply))
    }
}

/// Pipeline stage combining intent recognition with slot checking.
pub struct IntentSlotGate {
    classifier: Arc<dyn IntentClassifier>,
    templates: HashMap<String, SlotTemplate>,
    min_confidence: f64,
}

impl IntentSlotGate {
    pub const NAME: &'static str = "intent_slot_gate";

    pub fn new(classifier: Arc<dyn IntentClassifier>, templates: Vec<SlotTemplate>) -> Self {
        Self {
            classifier,
            templates: templates
                .into_iter()
                .map(|t| (t.intent_code.clone(), t))
                .collect(),
            min_confidence: 0.0,
        }
    }

    /// Ignore classifications below `min_confidence`.
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    fn check_slots(&self, ctx: &mut QueryContext, template: &SlotTemplate) {
        let original = ctx.original_query().clone();
        let known = original
            .metadata()
            .get("known_slots")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let eval = template.evaluate(original.text(), &known);
        let missing: Vec<String> = eval.missing.iter().map(|s| s.name.clone()).collect();

        ctx.set_attribute(
            "slot_filling",
            json!({
                "intent": template.intent_code,
                "extracted": eval.extracted,
                "missing": missing,
                "completeness": eval.completeness,
            }),
        );

        if missing.is_empty() || eval.completeness >= template.completeness_threshold {
            return;
        }

        let attempts = original
            .metadata()
            .get("clarification_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if attempts >= u64::from(template.max_clarification_attempts) {
            warn!(
                intent = %template.intent_code,
                attempts,
                "clarification attempts exhausted, continuing with missing slots"
            );
            return;
        }

        let questions = eval.missing.iter().map(|s| template.question_for(s)).collect();
        debug!(intent = %template.intent_code, missing = ?missing, "clarification required");
        ctx.set_clarification(Clarification {
            intent_code: template.intent_code.clone(),
            missing_slots: missing,
            questions,
            extracted_slots: eval.extracted,
            block_retrieval: template.block_retrieval_on_missing,
        });
    }
}

#[async_trait]
impl QueryStage for IntentSlotGate {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_enabled(&self, config: &PipelineConfig) -> bool {
        config.intent_recognition_enabled
    }

    async fn apply(&self, ctx: &mut QueryContext, queries: Vec<Query>) -> anyhow::Result<Vec<Query>> {
        let text = ctx.original_query().text().to_string();
        let intent = match self.classifier.classify(&text).await {
            Ok(Some(m)) if m.confidence >= self.min_confidence => m,
            Ok(_) => {
                debug!("no intent recognised");
                return Ok(queries);
            }
            Err(e) => {
                ctx.report_stage_error(format!("{:#}", e));
                return Ok(queries);
            }
        };

        ctx.set_attribute(
            "intent",
            json!({ "code": intent.code, "confidence": intent.confidence }),
        );
        if let Some(template) = self.templates.get(&intent.code) {
            self.check_slots(ctx, template);
        }

        Ok(queries
            .iter()
            .map(|q| q.with_metadata("intent", json!(intent.code)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CoreResult;

    fn order_template() -> SlotTemplate {
        let mut order_id = SlotDefinition::new("order_id", SlotType::Integer).required();
        order_id.label = Some("order number".into());
        order_id.order = Some(1);
        order_id.examples = vec!["12345".into()];

        let mut phone = SlotDefinition::new("phone", SlotType::Phone).required();
        phone.hint = Some("the phone used for the order".into());
        phone.order = Some(2);

        let mut reason = SlotDefinition::new("reason", SlotType::Text).required();
        reason.examples = vec!["damaged".into(), "late".into(), "wrong size".into(), "other".into()];
        reason.order = Some(0);

        let mut t = SlotTemplate::new("refund")
            .with_slot(order_id)
            .with_slot(phone)
            .with_slot(reason);
        t.block_retrieval_on_missing = true;
        t
    }

    fn gate() -> IntentSlotGate {
        let classifier = KeywordIntentClassifier::new(vec![
            IntentRule {
                code: "refund".into(),
                keywords: vec!["refund".into(), "money back".into()],
            },
            IntentRule {
                code: "shipping".into(),
                keywords: vec!["ship".into(), "delivery".into()],
            },
        ]);
        IntentSlotGate::new(Arc::new(classifier), vec![order_template()])
    }

    fn enabled() -> PipelineConfig {
        PipelineConfig {
            intent_recognition_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn typed_slots_extract() {
        let cases = [
            (SlotType::Number, "price 12.50 total", "12.50"),
            (SlotType::Date, "on 2024-03-09 please", "2024-03-09"),
            (SlotType::Time, "at 9:30 tomorrow", "9:30"),
            (SlotType::Email, "mail a.b@example.com now", "a.b@example.com"),
            (SlotType::Phone, "call 13812345678", "13812345678"),
            (SlotType::Url, "see https://x.io/a?b=1 ok", "https://x.io/a?b=1"),
        ];
        for (ty, text, want) in cases {
            let slot = SlotDefinition::new("s", ty);
            assert_eq!(slot.extract(text).as_deref(), Some(want), "{:?}", ty);
        }
        assert_eq!(SlotDefinition::new("s", SlotType::Phone).extract("call 12345"), None);
    }

    #[test]
    fn missing_slots_sorted_by_order() {
        let t = order_template();
        let eval = t.evaluate("I want a refund", &Metadata::new());
        let names: Vec<&str> = eval.missing.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["reason", "order_id", "phone"]);
        assert_eq!(eval.completeness, 0.0);
    }

    #[test]
    fn known_slots_count_as_filled() {
        let t = order_template();
        let mut known = Metadata::new();
        known.insert("phone".into(), json!("13812345678"));
        let eval = t.evaluate("refund order 998 damaged", &known);
        assert!(eval.missing.is_empty());
        assert_eq!(eval.extracted["order_id"], json!("998"));
        assert_eq!(eval.extracted["reason"], json!("damaged"));
    }

    #[test]
    fn question_precedence() {
        let mut t = order_template();
        let slots = t.slots.clone();
        assert_eq!(
            t.question_for(&slots[0]),
            "Please provide order number (e.g. 12345)"
        );
        assert_eq!(
            t.question_for(&slots[1]),
            "Please provide phone: the phone used for the order"
        );
        assert_eq!(
            t.question_for(&slots[2]),
            "Please provide reason (e.g. damaged, late, wrong size)"
        );
        t.clarification_templates
            .insert("phone".into(), "Which phone number did you order with?".into());
        assert_eq!(
            t.question_for(&slots[1]),
            "Which phone number did you order with?"
        );
    }

    #[tokio::test]
    async fn keyword_classifier_picks_most_hits() {
        let classifier = KeywordIntentClassifier::new(vec![
            IntentRule {
                code: "a".into(),
                keywords: vec!["refund".into()],
            },
            IntentRule {
                code: "b".into(),
                keywords: vec!["refund".into(), "late".into(), "x".into()],
            },
        ]);
        let m = classifier.classify("Refund, it was LATE").await.unwrap().unwrap();
        assert_eq!(m.code, "b");
        assert!(classifier.classify("hello").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn gate_tags_queries_and_clarifies() {
        let mut ctx = QueryContext::new(Query::new("I want a refund"), enabled());
        let out = gate()
            .apply(&mut ctx, vec![Query::new("I want a refund"), Query::new("refund please")])
            .await
            .unwrap();

        assert!(out.iter().all(|q| q.metadata()["intent"] == json!("refund")));
        assert_eq!(ctx.attribute("intent").unwrap()["code"], json!("refund"));
        let c = ctx.clarification().unwrap();
        assert_eq!(c.missing_slots, vec!["reason", "order_id", "phone"]);
        assert_eq!(c.questions.len(), 3);
        assert!(c.block_retrieval);
    }

    #[tokio::test]
    async fn gate_without_missing_slots_does_not_clarify() {
        let q = Query::new("refund order 12345 damaged, phone 13812345678");
        let mut ctx = QueryContext::new(q.clone(), enabled());
        gate().apply(&mut ctx, vec![q]).await.unwrap();
        assert!(ctx.clarification().is_none());
        assert_eq!(ctx.attribute("slot_filling").unwrap()["completeness"], json!(1.0));
    }

    #[tokio::test]
    async fn gate_threshold_allows_partial() {
        let mut template = order_template();
        template.completeness_threshold = 0.5;
        let classifier = KeywordIntentClassifier::new(vec![IntentRule {
            code: "refund".into(),
            keywords: vec!["refund".into()],
        }]);
        let gate = IntentSlotGate::new(Arc::new(classifier), vec![template]);
        let q = Query::new("refund order 12345 damaged");
        let mut ctx = QueryContext::new(q.clone(), enabled());
        gate.apply(&mut ctx, vec![q]).await.unwrap();
        assert!(ctx.clarification().is_none());
    }

    #[tokio::test]
    async fn gate_stops_after_max_attempts() {
        let q = Query::new("refund").with_metadata("clarification_count", json!(3));
        let mut ctx = QueryContext::new(q.clone(), enabled());
        gate().apply(&mut ctx, vec![q]).await.unwrap();
        assert!(ctx.clarification().is_none());
    }

    #[tokio::test]
    async fn unknown_intent_passes_through() {
        let q = Query::new("hello there");
        let mut ctx = QueryContext::new(q.clone(), enabled());
        let out = gate().apply(&mut ctx, vec![q.clone()]).await.unwrap();
        assert_eq!(out, vec![q]);
        assert!(ctx.attribute("intent").is_none());
    }

    struct Reply(&'static str);

    #[async_trait]
    impl ModelProvider for Reply {
        async fn chat(&self, _: i64, _: &str) -> CoreResult<String> {
            Ok(self.0.to_string())
        }
        async fn embed(&self, _: i64, _: &str) -> CoreResult<Vec<f32>> {
            Ok(vec![])
        }
        async fn score(&self, _: i64, _: &str, _: &str) -> CoreResult<f32> {
            Ok(0.0)
        }
    }

    #[tokio::test]
    async fn model_classifier_parses_json_and_plain() {
        let intents = vec!["refund".to_string(), "shipping".to_string()];
        let json_reply = ModelIntentClassifier::new(
            Arc::new(Reply("Sure: {\"intent\": \"Refund\", \"confidence\": 0.8}")),
            1,
            intents.clone(),
        );
        let m = json_reply.classify("q").await.unwrap().unwrap();
        assert_eq!(m.code, "refund");
        assert!((m.confidence - 0.8).abs() < 1e-9);

        let plain = ModelIntentClassifier::new(Arc::new(Reply("shipping\n")), 1, intents.clone());
        assert_eq!(plain.classify("q").await.unwrap().unwrap().code, "shipping");

        let none = ModelIntentClassifier::new(Arc::new(Reply("{\"intent\": \"none\"}")), 1, intents);
        assert!(none.classify("q").await.unwrap().is_none());
    }
}
