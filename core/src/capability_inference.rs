//! Optional collaborator (§4.3): when a delegated task carries no explicit
//! `requiredCapabilities`, this infers them from the prompt text. The
//! scheduler treats whatever the inferrer returns as authoritative — it is
//! a pluggable heuristic, not a core algorithm this crate needs to perfect.

pub trait CapabilityInferrer: Send + Sync {
    fn infer(&self, prompt: &str) -> Vec<String>;
}

/// Matches a small fixed vocabulary of capability keywords against the
/// prompt text. Deployments needing smarter inference supply their own
/// `CapabilityInferrer`.
pub struct KeywordCapabilityInferrer {
    vocabulary: Vec<(&'static str, &'static str)>,
}

impl Default for KeywordCapabilityInferrer {
    fn default() -> Self {
        Self {
            vocabulary: vec![
                ("test", "code"),
                ("implement", "code"),
                ("refactor", "code"),
                ("bug", "code"),
                ("deploy", "ops"),
                ("infrastructure", "ops"),
                ("provision", "ops"),
                ("model", "ml"),
                ("train", "ml"),
                ("dataset", "ml"),
                ("design", "design"),
                ("mockup", "design"),
            ],
        }
    }
}

impl CapabilityInferrer for KeywordCapabilityInferrer {
    fn infer(&self, prompt: &str) -> Vec<String> {
        let lowered = prompt.to_lowercase();
        let mut found: Vec<String> = self
            .vocabulary
            .iter()
            .filter(|(keyword, _)| lowered.contains(keyword))
            .map(|(_, capability)| capability.to_string())
            .collect();
        found.sort();
        found.dedup();
        found
    }
}

/// Infers nothing; used when inference should be opt-in only.
#[derive(Default)]
pub struct NoopCapabilityInferrer;

impl CapabilityInferrer for NoopCapabilityInferrer {
    fn infer(&self, _prompt: &str) -> Vec<String> {
        Vec::new()
    }
}
