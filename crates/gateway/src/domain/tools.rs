//! Bounded tool-call loop.
//!
//! Drives model → tool execution → model until the model stops emitting
//! tool calls. Repeated `tool_call_id`s replay the cached result instead of
//! re-executing, malformed arguments are fed back as structured errors so
//! the model can repair the call, and a run of failing executions aborts the
//! loop.

use {
    model::{CompletionRequest, CompletionResult, ErrorCode, Message, Usage},
    serde_json::json,
    std::collections::HashMap,
};

#[derive(Clone, Copy, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ToolLoopConfig {
    pub max_iterations: u32,
    pub abort_on_consecutive_failures: u32,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            abort_on_consecutive_failures: 3,
        }
    }
}

/// One model turn. The router implements this over the selected provider
/// and model so the loop stays ignorant of transport concerns.
#[async_trait::async_trait]
pub trait Generate: Send + Sync {
    async fn generate(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResult>;
}

/// Executes one tool call with already-parsed arguments.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Executor for deployments without registered tools: every call fails,
/// which the loop reports back to the model.
pub struct NoopToolExecutor;

#[async_trait::async_trait]
impl ToolExecutor for NoopToolExecutor {
    async fn execute(
        &self,
        name: &str,
        _: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        anyhow::bail!("no executor registered for tool {name:?}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolLoopError {
    #[error("model exceeded {0} tool-call iterations")]
    MaxIterations(u32),
    #[error("{0} consecutive tool executions failed")]
    ConsecutiveFailures(u32),
    #[error(transparent)]
    Generate(anyhow::Error),
}

impl ToolLoopError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::MaxIterations(_) => Some(ErrorCode::ToolCallMaxIterations),
            Self::ConsecutiveFailures(_) => Some(ErrorCode::ToolCallConsecutiveFailures),
            Self::Generate(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct ToolLoopOutcome {
    /// The first model turn that returned no tool calls.
    pub result: CompletionResult,
    /// Usage summed over every model turn in the loop.
    pub total_usage: Usage,
    pub model_turns: u32,
}

/// Runs the loop to completion. Terminates in at most
/// `max_iterations + 1` model turns.
pub async fn invoke_with_tools(
    model: &dyn Generate,
    executor: &dyn ToolExecutor,
    mut request: CompletionRequest,
    config: ToolLoopConfig,
) -> Result<ToolLoopOutcome, ToolLoopError> {
    let mut total_usage = Usage::default();
    let mut model_turns = 0u32;
    let mut iterations = 0u32;
    let mut consecutive_failures = 0u32;
    let mut executed: HashMap<String, String> = HashMap::new();

    let mut result = turn(model, &request, &mut total_usage, &mut model_turns).await?;
    while !result.is_final() {
        iterations += 1;
        if iterations > config.max_iterations {
            return Err(ToolLoopError::MaxIterations(config.max_iterations));
        }

        for call in &result.tool_calls {
            let payload = if let Some(cached) = executed.get(&call.id) {
                tracing::debug!(id = %call.id, tool = %call.name, "replaying cached tool result");
                cached.clone()
            } else {
                match serde_json::from_str::<serde_json::Value>(&call.arguments) {
                    Err(err) => {
                        // Feed the parse error back instead of executing so
                        // the model can emit a repaired call next turn.
                        tracing::debug!(id = %call.id, tool = %call.name, %err, "malformed tool arguments");
                        json!({
                            "error": "malformed_arguments",
                            "message": err.to_string(),
                        })
                        .to_string()
                    }
                    Ok(arguments) => match executor.execute(&call.name, &arguments).await {
                        Ok(value) => {
                            consecutive_failures = 0;
                            let payload = value.to_string();
                            executed.insert(call.id.clone(), payload.clone());
                            payload
                        }
                        Err(err) => {
                            consecutive_failures += 1;
                            if consecutive_failures >= config.abort_on_consecutive_failures {
                                return Err(ToolLoopError::ConsecutiveFailures(
                                    consecutive_failures,
                                ));
                            }
                            json!({
                                "error": "tool_execution_failed",
                                "message": err.to_string(),
                            })
                            .to_string()
                        }
                    },
                }
            };
            request.messages.push(Message::tool_result(&call.id, payload));
        }

        result = turn(model, &request, &mut total_usage, &mut model_turns).await?;
    }

    Ok(ToolLoopOutcome {
        result,
        total_usage,
        model_turns,
    })
}

async fn turn(
    model: &dyn Generate,
    request: &CompletionRequest,
    total_usage: &mut Usage,
    model_turns: &mut u32,
) -> Result<CompletionResult, ToolLoopError> {
    let result = model
        .generate(request)
        .await
        .map_err(ToolLoopError::Generate)?;
    total_usage.prompt_tokens += result.usage.prompt_tokens;
    total_usage.completion_tokens += result.usage.completion_tokens;
    total_usage.reasoning_tokens += result.usage.reasoning_tokens;
    *model_turns += 1;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        model::ToolCall,
        std::sync::{
            Mutex,
            atomic::{AtomicU32, Ordering},
        },
    };

    struct Script(Mutex<Vec<CompletionResult>>);

    impl Script {
        fn new(turns: Vec<CompletionResult>) -> Self {
            Self(Mutex::new(turns))
        }
    }

    #[async_trait::async_trait]
    impl Generate for Script {
        async fn generate(&self, _: &CompletionRequest) -> anyhow::Result<CompletionResult> {
            let mut turns = self.0.lock().unwrap();
            if turns.is_empty() {
                anyhow::bail!("script exhausted");
            }
            Ok(turns.remove(0))
        }
    }

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ToolExecutor for CountingExecutor {
        async fn execute(
            &self,
            _: &str,
            _: &serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(json!({"ok": true}))
        }
    }

    fn tool_turn(calls: &[(&str, &str, &str)]) -> CompletionResult {
        CompletionResult {
            tool_calls: calls
                .iter()
                .map(|(id, name, arguments)| ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn final_turn(content: &str) -> CompletionResult {
        CompletionResult {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn repeated_tool_call_id_executes_once() {
        let model = Script::new(vec![
            tool_turn(&[("T1", "search", "{}")]),
            tool_turn(&[("T1", "search", "{}")]),
            final_turn("Done"),
        ]);
        let executor = CountingExecutor::default();
        let outcome = invoke_with_tools(
            &model,
            &executor,
            CompletionRequest::default(),
            ToolLoopConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.result.content, "Done");
        assert_eq!(outcome.model_turns, 3);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn iteration_cap_is_enforced() {
        let config = ToolLoopConfig {
            max_iterations: 2,
            ..Default::default()
        };
        let model = Script::new(vec![
            tool_turn(&[("T1", "a", "{}")]),
            tool_turn(&[("T2", "a", "{}")]),
            tool_turn(&[("T3", "a", "{}")]),
            final_turn("never reached"),
        ]);
        let executor = CountingExecutor::default();
        let err = invoke_with_tools(&model, &executor, CompletionRequest::default(), config)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ToolCallMaxIterations));
    }

    #[tokio::test]
    async fn consecutive_failures_abort() {
        let model = Script::new(vec![
            tool_turn(&[("T1", "a", "{}"), ("T2", "a", "{}"), ("T3", "a", "{}")]),
            final_turn("never reached"),
        ]);
        let executor = CountingExecutor {
            fail: true,
            ..Default::default()
        };
        let err = invoke_with_tools(
            &model,
            &executor,
            CompletionRequest::default(),
            ToolLoopConfig::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ToolCallConsecutiveFailures));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn malformed_arguments_are_repaired_not_executed() {
        let model = Script::new(vec![
            tool_turn(&[("T1", "search", "{not json")]),
            tool_turn(&[("T2", "search", "{\"q\": \"fixed\"}")]),
            final_turn("Done"),
        ]);
        let executor = CountingExecutor::default();
        let outcome = invoke_with_tools(
            &model,
            &executor,
            CompletionRequest::default(),
            ToolLoopConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.result.content, "Done");
        // Only the repaired call executed.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        struct Alternating(AtomicU32);
        #[async_trait::async_trait]
        impl ToolExecutor for Alternating {
            async fn execute(
                &self,
                _: &str,
                _: &serde_json::Value,
            ) -> anyhow::Result<serde_json::Value> {
                // fail, fail, ok, fail, fail, ok, ...
                if self.0.fetch_add(1, Ordering::SeqCst) % 3 == 2 {
                    Ok(json!({}))
                } else {
                    anyhow::bail!("flaky")
                }
            }
        }
        let model = Script::new(vec![
            tool_turn(&[("T1", "a", "{}"), ("T2", "a", "{}"), ("T3", "a", "{}")]),
            tool_turn(&[("T4", "a", "{}"), ("T5", "a", "{}"), ("T6", "a", "{}")]),
            final_turn("Done"),
        ]);
        let executor = Alternating(AtomicU32::new(0));
        let outcome = invoke_with_tools(
            &model,
            &executor,
            CompletionRequest::default(),
            ToolLoopConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.result.content, "Done");
        assert_eq!(outcome.model_turns, 3);
    }

    #[tokio::test]
    async fn usage_accumulates_across_turns() {
        let with_usage = |mut turn: CompletionResult| {
            turn.usage = Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                reasoning_tokens: 1,
            };
            turn
        };
        let model = Script::new(vec![
            with_usage(tool_turn(&[("T1", "a", "{}")])),
            with_usage(final_turn("Done")),
        ]);
        let executor = CountingExecutor::default();
        let outcome = invoke_with_tools(
            &model,
            &executor,
            CompletionRequest::default(),
            ToolLoopConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.total_usage.prompt_tokens, 20);
        assert_eq!(outcome.total_usage.completion_tokens, 10);
        assert_eq!(outcome.total_usage.reasoning_tokens, 2);
    }
}
