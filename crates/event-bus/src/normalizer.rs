use serde::{Deserialize, Serialize};

/// How the configured prefix and suffix are removed from event type names.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventNameTrimming {
    /// Every leading character contained in the prefix and every trailing
    /// character contained in the suffix is removed. Routing keys match
    /// other services on the same bus that trim affixes as character sets.
    #[default]
    Characters,

    /// The prefix and suffix are stripped once each, as whole strings. A
    /// name that consists only of an affix is left untouched.
    Affix,
}

/// Derives canonical event names (routing keys) from event type names.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EventNameNormalizer {
    prefix: Option<String>,
    suffix: Option<String>,
    trimming: EventNameTrimming,
}

impl EventNameNormalizer {
    /// Creates a normalizer trimming affix characters. Empty strings disable
    /// trimming.
    #[must_use]
    pub fn new(prefix: Option<String>, suffix: Option<String>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
            suffix: suffix.filter(|s| !s.is_empty()),
            trimming: EventNameTrimming::default(),
        }
    }

    /// Selects how affixes are removed.
    #[must_use]
    pub const fn with_trimming(mut self, trimming: EventNameTrimming) -> Self {
        self.trimming = trimming;
        self
    }

    /// Returns the canonical event name for `raw`.
    #[must_use]
    pub fn normalize(&self, raw: &str) -> String {
        let prefix = self.prefix.as_deref();
        let suffix = self.suffix.as_deref();

        let name = match self.trimming {
            EventNameTrimming::Characters => {
                let name = prefix.map_or(raw, |prefix| {
                    raw.trim_start_matches(|c: char| prefix.contains(c))
                });
                suffix.map_or(name, |suffix| {
                    name.trim_end_matches(|c: char| suffix.contains(c))
                })
            }
            EventNameTrimming::Affix => {
                let name = prefix
                    .and_then(|prefix| raw.strip_prefix(prefix))
                    .filter(|rest| !rest.is_empty())
                    .unwrap_or(raw);
                suffix
                    .and_then(|suffix| name.strip_suffix(suffix))
                    .filter(|rest| !rest.is_empty())
                    .unwrap_or(name)
            }
        };

        name.to_string()
    }
}
