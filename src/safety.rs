//! Guardrail validator: the last check before any outbound message.
//!
//! `validate` is pure. It reads the proposed message and the lead context
//! and never touches the store or a gateway.

use std::collections::HashSet;

use chrono::Timelike;
use regex::Regex;

use crate::agent::LeadContext;
use crate::channels::OutboundMessage;
use crate::config::GuardrailConfig;
use crate::leads::ChannelKind;

/// A single failed rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub rule: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(rule: &'static str, message: impl Into<String>) -> Self {
        Self {
            rule,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.rule, self.message)
    }
}

/// Result of validating a proposed message.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Error summary for activity notes.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A clock time mentioned in message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClockTime {
    hour: u32,
    minute: Option<u32>,
}

pub struct GuardrailValidator {
    config: GuardrailConfig,
    promise_re: Regex,
    clock_re: Regex,
}

impl GuardrailValidator {
    pub fn new(config: GuardrailConfig) -> Self {
        Self {
            config,
            promise_re: Regex::new(
                r"(?i)\b(?:i'll|i will|we'll|we will|i'm going to|we're going to|i am going to|we are going to|expect)\s+(?:give you a\s+)?(?:call|ring|phone|text|email|reach out to|follow up with|touch base with|a call)\b(?:[ap]\.m\.|[^.!?\n])*",
            )
            .expect("static regex"),
            clock_re: Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(am|pm|a\.m\.|p\.m\.)")
                .expect("static regex"),
        }
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    pub fn validate(&self, proposed: &OutboundMessage, ctx: &LeadContext) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let content = proposed.content.trim();

        if content.is_empty() {
            errors.push(ValidationError::new("empty_content", "message has no content"));
        }

        if !ctx.lead.can_use(proposed.channel) {
            errors.push(ValidationError::new(
                "consent",
                format!("no consent or address for {}", proposed.channel),
            ));
        }

        if ctx.lead.status.is_terminal() {
            errors.push(ValidationError::new(
                "prohibited_status",
                format!("lead is {}", ctx.lead.status),
            ));
        }

        let max = self.max_chars(proposed.channel);
        let len = content.chars().count();
        if len > max {
            errors.push(ValidationError::new(
                "length",
                format!("{len} chars exceeds {} limit of {max}", proposed.channel),
            ));
        }

        if !content.is_empty() && self.is_repetition(content, ctx) {
            errors.push(ValidationError::new(
                "repetition",
                "materially identical to a recent outbound message",
            ));
        }

        if let Some(promise) = self.uncommitted_promise(content, ctx) {
            errors.push(ValidationError::new(
                "uncommitted_promise",
                format!("promises contact with no matching appointment: \"{promise}\""),
            ));
        }

        // ── Warnings ────────────────────────────────────────────────
        if ctx.outbound_last_24h() + 1 >= self.config.daily_soft_ceiling as i64 {
            warnings.push(format!(
                "{} outbound messages in the last 24h (soft ceiling {})",
                ctx.outbound_last_24h() + 1,
                self.config.daily_soft_ceiling
            ));
        }
        if is_shouting(content) {
            warnings.push("message is mostly upper case".to_string());
        }
        if content.contains("!!") {
            warnings.push("repeated exclamation marks".to_string());
        }
        if proposed.channel == ChannelKind::Sms && len > 160 {
            warnings.push(format!("SMS spans multiple segments ({len} chars)"));
        }

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    fn max_chars(&self, channel: ChannelKind) -> usize {
        match channel {
            ChannelKind::Sms => self.config.sms_max_chars,
            ChannelKind::Email => self.config.email_max_chars,
            ChannelKind::Voice => self.config.voice_max_chars,
        }
    }

    fn is_repetition(&self, content: &str, ctx: &LeadContext) -> bool {
        let candidate = normalize(content);
        let candidate_words = word_set(&candidate);
        ctx.recent_outbound.iter().any(|prev| {
            let prev = normalize(&prev.content);
            prev == candidate
                || jaccard(&candidate_words, &word_set(&prev)) >= self.config.repetition_similarity
        })
    }

    /// The promise text, if the message promises future contact that no
    /// upcoming appointment backs.
    fn uncommitted_promise(&self, content: &str, ctx: &LeadContext) -> Option<String> {
        let text = content.replace(['\u{2019}', '\u{2018}'], "'");
        for m in self.promise_re.find_iter(&text) {
            let phrase = m.as_str();
            let backed = match self.clock_time(phrase) {
                Some(clock) => ctx.upcoming_appointments.iter().any(|a| {
                    let local = ctx.local_time(a.scheduled_at);
                    local.hour() == clock.hour
                        && clock.minute.is_none_or(|min| local.minute() == min)
                }),
                None => !ctx.upcoming_appointments.is_empty(),
            };
            if !backed {
                return Some(phrase.trim().to_string());
            }
        }
        None
    }

    fn clock_time(&self, phrase: &str) -> Option<ClockTime> {
        let caps = self.clock_re.captures(phrase)?;
        let hour: u32 = caps.get(1)?.as_str().parse().ok()?;
        let minute = caps.get(2).and_then(|m| m.as_str().parse().ok());
        let pm = caps.get(3)?.as_str().to_ascii_lowercase().starts_with('p');
        if !(1..=12).contains(&hour) {
            return None;
        }
        let hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h,
        };
        Some(ClockTime { hour, minute })
    }
}

fn normalize(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn word_set(s: &str) -> HashSet<&str> {
    s.split_whitespace().collect()
}

fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    inter / union
}

fn is_shouting(s: &str) -> bool {
    let letters: Vec<char> = s.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 10 {
        return false;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    upper * 10 >= letters.len() * 7
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::cadence::CadenceInput;
    use crate::leads::{Appointment, Communication, Consent, Lead, LeadStatus};

    fn validator() -> GuardrailValidator {
        GuardrailValidator::new(GuardrailConfig::default())
    }

    fn ctx_at(now: DateTime<Utc>) -> LeadContext {
        let lead = Lead::new("Morgan", now - Duration::days(2))
            .with_phone("+15550130")
            .with_email("morgan@example.com")
            .with_consent(Consent::all());
        LeadContext {
            cadence: CadenceInput {
                created_at: lead.created_at,
                outbound_count: 1,
                outbound_last_24h: 0,
                last_outbound_at: Some(now - Duration::days(1)),
                has_replied: false,
            },
            lead,
            history: vec![],
            recent_outbound: vec![],
            upcoming_appointments: vec![],
            last_inbound_at: None,
            now,
        }
    }

    fn sms(text: &str) -> OutboundMessage {
        OutboundMessage::new(ChannelKind::Sms, text)
    }

    #[test]
    fn plain_message_passes() {
        let ctx = ctx_at(Utc::now());
        let r = validator().validate(&sms("Hi Morgan, any questions about your pre-approval?"), &ctx);
        assert!(r.valid, "{:?}", r.errors);
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn consent_is_checked_per_channel() {
        let mut ctx = ctx_at(Utc::now());
        ctx.lead.consent.sms = false;
        let r = validator().validate(&sms("Hello"), &ctx);
        assert!(!r.valid);
        assert_eq!(r.errors[0].rule, "consent");

        let email = OutboundMessage::new(ChannelKind::Email, "Hello").with_subject("Hi");
        assert!(validator().validate(&email, &ctx).valid);
    }

    #[test]
    fn empty_and_terminal_are_rejected() {
        let mut ctx = ctx_at(Utc::now());
        ctx.lead.status = LeadStatus::Converted;
        let r = validator().validate(&sms("   "), &ctx);
        let rules: Vec<_> = r.errors.iter().map(|e| e.rule).collect();
        assert!(rules.contains(&"empty_content"));
        assert!(rules.contains(&"prohibited_status"));
    }

    #[test]
    fn length_limit_per_channel() {
        let ctx = ctx_at(Utc::now());
        let r = validator().validate(&sms(&"a ".repeat(300)), &ctx);
        assert!(r.errors.iter().any(|e| e.rule == "length"));
    }

    #[test]
    fn near_duplicate_is_rejected() {
        let now = Utc::now();
        let mut ctx = ctx_at(now);
        ctx.recent_outbound.push(Communication::outbound(
            ctx.lead.id,
            ChannelKind::Email,
            "Hi Morgan! Just checking in on your refinance questions.",
            now - Duration::days(3),
        ));
        let r = validator().validate(&sms("hi morgan, just checking in on your refinance questions"), &ctx);
        assert!(r.errors.iter().any(|e| e.rule == "repetition"));

        let r = validator().validate(&sms("Rates dipped this week, want a fresh quote?"), &ctx);
        assert!(r.valid);
    }

    #[test]
    fn promise_without_appointment_is_blocked() {
        let ctx = ctx_at(Utc::now());
        let r = validator().validate(&sms("Great chatting! I'll call you at 5pm tomorrow."), &ctx);
        assert!(!r.valid);
        assert_eq!(r.errors[0].rule, "uncommitted_promise");

        let r = validator().validate(&sms("We’ll give you a call later this week"), &ctx);
        assert!(r.errors.iter().any(|e| e.rule == "uncommitted_promise"));
    }

    #[test]
    fn promise_matching_appointment_in_local_time_passes() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut ctx = ctx_at(now);
        ctx.lead.utc_offset_minutes = -5 * 60;
        // 22:00 UTC is 5pm at UTC-5.
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 22, 0, 0).unwrap();
        ctx.upcoming_appointments
            .push(Appointment::new(ctx.lead.id, at, now));

        let ok = validator().validate(&sms("Confirmed, I'll call you at 5pm tomorrow."), &ctx);
        assert!(ok.valid, "{:?}", ok.errors);

        let wrong_hour = validator().validate(&sms("I'll call you at 3:30 pm tomorrow."), &ctx);
        assert!(!wrong_hour.valid);

        let no_hour = validator().validate(&sms("I will call you tomorrow as planned."), &ctx);
        assert!(no_hour.valid);

        let dotted = validator().validate(&sms("Thanks! I'll call you at 5 p.m. to go over rates."), &ctx);
        assert!(dotted.valid, "{:?}", dotted.errors);

        let dotted_wrong = validator().validate(&sms("Thanks! I'll call you at 3 p.m. to go over rates."), &ctx);
        assert!(!dotted_wrong.valid);
        assert!(dotted_wrong.errors.iter().any(|e| e.rule == "uncommitted_promise"));
    }

    #[test]
    fn dotted_meridiem_promise_must_match_booking() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let mut ctx = ctx_at(now);
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        ctx.upcoming_appointments
            .push(Appointment::new(ctx.lead.id, at, now));

        let r = validator().validate(&sms("Thanks! I'll call you at 5 p.m. to go over rates."), &ctx);
        assert!(!r.valid);

        let r = validator().validate(&sms("Thanks! I'll call you at 10 a.m. to go over rates."), &ctx);
        assert!(r.valid, "{:?}", r.errors);
    }

    #[test]
    fn tone_and_volume_warnings() {
        let mut ctx = ctx_at(Utc::now());
        ctx.cadence.outbound_last_24h = 2;
        let r = validator().validate(&sms("RATES ARE DROPPING FAST, ACT NOW!!"), &ctx);
        assert!(r.valid);
        assert_eq!(r.warnings.len(), 3);
    }

    #[test]
    fn long_sms_warns() {
        let ctx = ctx_at(Utc::now());
        let text = "Just following up on the documents for your loan application. ".repeat(3);
        let r = validator().validate(&sms(&text), &ctx);
        assert!(r.valid);
        assert!(r.warnings.iter().any(|w| w.contains("segments")));
    }

    #[test]
    fn clock_parsing() {
        let v = validator();
        assert_eq!(v.clock_time("at 12am"), Some(ClockTime { hour: 0, minute: None }));
        assert_eq!(v.clock_time("at 9:15 a.m."), Some(ClockTime { hour: 9, minute: Some(15) }));
        assert_eq!(v.clock_time("no time here"), None);
    }
}
