use fanout_core::{FanoutError, FanoutResult, Task};
use serde::Deserialize;

/// Body of `POST /orchestrate` and `POST /orchestrate/stream`.
///
/// Both `agentCount` and `agent_count` are accepted, as a number or a numeric
/// string. A missing count means one worker.
#[derive(Debug, Default, Deserialize)]
pub struct OrchestrateRequest {
    /// The prompt every worker receives.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Requested number of workers.
    #[serde(default, rename = "agentCount", alias = "agent_count")]
    pub agent_count: Option<AgentCount>,
}

/// A worker count as sent by the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AgentCount {
    /// A JSON number.
    Number(i64),
    /// A numeric string such as `"3"`.
    Text(String),
}

impl AgentCount {
    fn resolve(&self) -> FanoutResult<usize> {
        let n = match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse::<i64>().map_err(|_| {
                FanoutError::Validation(format!("agentCount must be an integer, got '{s}'"))
            })?,
        };
        // Negative counts fall through to the range check as zero.
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

impl OrchestrateRequest {
    /// Parse a raw request body. An empty or malformed body is a validation error.
    pub fn from_body(body: &[u8]) -> FanoutResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(FanoutError::Validation(
                "Request body must be a JSON object".to_string(),
            ));
        }
        serde_json::from_slice(body)
            .map_err(|e| FanoutError::Validation(format!("Invalid request body: {e}")))
    }

    /// Requested worker count, defaulting to one.
    pub fn agent_count(&self) -> FanoutResult<usize> {
        self.agent_count.as_ref().map_or(Ok(1), AgentCount::resolve)
    }

    /// Validate into a [`Task`] capped at `max_agents`.
    pub fn into_task(self, max_agents: usize) -> FanoutResult<Task> {
        let agent_count = self.agent_count()?;
        Task::with_limit(self.prompt.unwrap_or_default(), agent_count, max_agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(body: &str) -> FanoutResult<Task> {
        OrchestrateRequest::from_body(body.as_bytes())?.into_task(10)
    }

    #[test]
    fn test_camel_case_count() {
        let task = task(r#"{"prompt":"summarize X","agentCount":3}"#).unwrap();
        assert_eq!(task.agent_count(), 3);
        assert_eq!(task.prompt(), "summarize X");
    }

    #[test]
    fn test_snake_case_alias_and_numeric_string() {
        let task = task(r#"{"prompt":"p","agent_count":"4"}"#).unwrap();
        assert_eq!(task.agent_count(), 4);
    }

    #[test]
    fn test_missing_count_defaults_to_one() {
        assert_eq!(task(r#"{"prompt":"p"}"#).unwrap().agent_count(), 1);
    }

    #[test]
    fn test_out_of_range_and_non_numeric_counts() {
        for body in [
            r#"{"prompt":"p","agentCount":0}"#,
            r#"{"prompt":"p","agentCount":11}"#,
            r#"{"prompt":"p","agentCount":-2}"#,
            r#"{"prompt":"p","agentCount":"many"}"#,
        ] {
            assert!(matches!(task(body), Err(FanoutError::Validation(_))), "{body}");
        }
    }

    #[test]
    fn test_prompt_required() {
        for body in [r#"{"agentCount":2}"#, r#"{"prompt":"   ","agentCount":2}"#] {
            let err = task(body).unwrap_err();
            assert!(err.to_string().contains("Prompt is required"));
        }
    }

    #[test]
    fn test_bad_bodies() {
        assert!(OrchestrateRequest::from_body(b"").is_err());
        assert!(OrchestrateRequest::from_body(b"not json").is_err());
        assert!(OrchestrateRequest::from_body(b"[1,2]").is_err());
    }
}
