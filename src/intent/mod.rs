//! Query classification and trigger-keyword stripping

use crate::config::Config;
use crate::engine::EngineState;

/// Where a query should go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Home-automation conversation agent
    HomeAutomationVoice,
    /// Home-automation text entity
    HomeAutomationText,
    /// Chat-completion provider
    ChatAi,
    /// Leave the device's own answer alone
    Passthrough,
}

impl Intent {
    /// Whether the device's native reply must be interrupted first
    #[must_use]
    pub const fn interrupts_device(self) -> bool {
        !matches!(self, Self::Passthrough)
    }
}

/// Classification result with the query as forwarded downstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub intent: Intent,
    /// Query with the matched keyword set removed
    pub cleaned: String,
}

/// Ordered keyword rules: HA voice, HA text, chat, passthrough
#[derive(Debug, Clone, Default)]
pub struct IntentRouter {
    voice_keywords: Vec<String>,
    text_keywords: Vec<String>,
    chat_keywords: Vec<String>,
}

impl IntentRouter {
    #[must_use]
    pub fn new(
        voice_keywords: Vec<String>,
        text_keywords: Vec<String>,
        chat_keywords: Vec<String>,
    ) -> Self {
        let clean = |v: Vec<String>| -> Vec<String> {
            v.into_iter().filter(|k| !k.is_empty()).collect()
        };
        Self {
            voice_keywords: clean(voice_keywords),
            text_keywords: clean(text_keywords),
            chat_keywords: clean(chat_keywords),
        }
    }

    /// Build from configuration; home-automation rules are only active when
    /// the bridge is configured
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let ha = &config.home_assistant;
        let (voice, text) = if ha.is_configured() {
            (ha.voice_keywords.clone(), ha.text_keywords.clone())
        } else {
            (Vec::new(), Vec::new())
        };
        Self::new(voice, text, config.chat.keywords.clone())
    }

    /// Classify a query; chat routing is only considered when `ai_enabled`
    #[must_use]
    pub fn classify(&self, query: &str, ai_enabled: bool) -> Intent {
        let hit = |keywords: &[String]| keywords.iter().any(|k| query.contains(k.as_str()));

        if hit(&self.voice_keywords) {
            Intent::HomeAutomationVoice
        } else if hit(&self.text_keywords) {
            Intent::HomeAutomationText
        } else if ai_enabled && hit(&self.chat_keywords) {
            Intent::ChatAi
        } else {
            Intent::Passthrough
        }
    }

    /// Classify against the shared engine state and strip the matched set
    ///
    /// Both home-automation intents strip the union of both HA sets.
    #[must_use]
    pub fn route(&self, query: &str, state: &EngineState) -> Routed {
        let intent = self.classify(query, state.ai_enabled);
        let cleaned = match intent {
            Intent::HomeAutomationVoice | Intent::HomeAutomationText => {
                let union: Vec<String> = self
                    .voice_keywords
                    .iter()
                    .chain(&self.text_keywords)
                    .cloned()
                    .collect();
                strip(query, &union)
            }
            Intent::ChatAi => strip(query, &self.chat_keywords),
            Intent::Passthrough => query.to_string(),
        };
        Routed { intent, cleaned }
    }

    /// Chat trigger keywords
    #[must_use]
    pub fn chat_keywords(&self) -> &[String] {
        &self.chat_keywords
    }
}

/// Remove every literal occurrence of every keyword, trimming as it goes
#[must_use]
pub fn strip(query: &str, keywords: &[String]) -> String {
    keywords
        .iter()
        .filter(|k| !k.is_empty())
        .fold(query.trim().to_string(), |acc, k| {
            acc.replace(k.as_str(), "").trim().to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    fn router() -> IntentRouter {
        IntentRouter::new(
            strings(&["小周", "小洲"]),
            strings(&["小爱"]),
            strings(&["请", "帮我", "问一下", "AI"]),
        )
    }

    fn state(ai_enabled: bool) -> EngineState {
        EngineState {
            ai_enabled,
            ..EngineState::default()
        }
    }

    #[test]
    fn chat_keywords_are_stripped() {
        let routed = router().route("请帮我查一下天气", &state(true));
        assert_eq!(routed.intent, Intent::ChatAi);
        assert_eq!(routed.cleaned, "查一下天气");
    }

    #[test]
    fn voice_keywords_win_over_everything() {
        let routed = router().route("小周请帮我打开小爱灯", &state(true));
        assert_eq!(routed.intent, Intent::HomeAutomationVoice);
        assert_eq!(routed.cleaned, "请帮我打开灯");
    }

    #[test]
    fn text_keywords_beat_chat() {
        let routed = router().route("请小爱关灯", &state(true));
        assert_eq!(routed.intent, Intent::HomeAutomationText);
        assert_eq!(routed.cleaned, "请关灯");
    }

    #[test]
    fn chat_requires_ai_enabled() {
        let r = router();
        assert_eq!(r.classify("请讲个笑话", false), Intent::Passthrough);
        let routed = r.route("请讲个笑话", &state(false));
        assert_eq!(routed.cleaned, "请讲个笑话");
        assert!(!routed.intent.interrupts_device());
    }

    #[test]
    fn home_rules_still_apply_with_ai_disabled() {
        assert_eq!(
            router().classify("小爱开灯", false),
            Intent::HomeAutomationText
        );
    }

    #[test]
    fn plain_queries_pass_through() {
        assert_eq!(router().classify("今天几号", true), Intent::Passthrough);
    }

    #[test]
    fn strip_removes_repeats_and_trims() {
        assert_eq!(strip("  AI AI 你好 ", &strings(&["AI"])), "你好");
        assert_eq!(strip("问一下", &strings(&["问一下"])), "");
        assert_eq!(strip("abc", &strings(&[""])), "abc");
    }

    #[test]
    fn unconfigured_home_automation_is_inactive() {
        let config = crate::config::Config::from_sources(
            crate::config::file::BridgeConfigFile::default(),
            |_| None,
        )
        .unwrap();
        let r = IntentRouter::from_config(&config);
        assert_eq!(r.classify("小爱开灯", true), Intent::Passthrough);
        assert_eq!(r.classify("请开灯", true), Intent::ChatAi);
    }
}
