use std::sync::Arc;

use serde_json::json;

use sandfork_core::fakes::{MemorySandbox, ScriptedModel};
use sandfork_core::fork_log::ForkLogEvent;
use sandfork_core::model::{ContentBlock, Role};
use sandfork_core::session::TURN_BUDGET_OVERFLOW;
use sandfork_core::{
    AgentSession, AgentTask, CompletionResponse, ExecOutput, FailureKind, ForkOutcome,
    MemoryForkLog, PolicyEngine, SessionDeps, ToolCallRequest, Usage,
};

fn usage() -> Usage {
    Usage {
        input_tokens: 20,
        output_tokens: 10,
    }
}

fn bash(id: &str, cmd: &str) -> ToolCallRequest {
    ToolCallRequest::new(id, "Bash", json!({ "command": cmd }))
}

fn deps(model: Arc<ScriptedModel>, sandbox: Arc<MemorySandbox>) -> SessionDeps {
    SessionDeps::new(model, sandbox, Arc::new(PolicyEngine::standard().unwrap()))
}

#[tokio::test]
async fn overflow_calls_get_synthetic_results_and_never_execute() {
    let calls = (0..5).map(|i| bash(&format!("c{i}"), &format!("echo {i}"))).collect();
    let model = Arc::new(ScriptedModel::new(vec![
        Ok(CompletionResponse::tool_use(calls, usage())),
        Ok(CompletionResponse::text("ok", usage())),
    ]));
    let sandbox = Arc::new(MemorySandbox::new());
    let task = AgentTask::new(0, "sonnet", "t").with_max_tool_calls_per_turn(3);

    let result = AgentSession::uncancellable(task, "sb", deps(model.clone(), sandbox.clone()))
        .run()
        .await;

    assert!(result.success);
    assert_eq!(sandbox.commands(), vec!["echo 0", "echo 1", "echo 2"]);
    assert_eq!(result.metrics.tool_calls, 3);
    assert_eq!(result.metrics.rejected_tool_calls, 2);

    // Every call gets a result, in call order.
    let second = &model.requests()[1];
    let last = second.messages.last().unwrap();
    assert_eq!(last.role, Role::User);
    assert_eq!(last.content.len(), 5);
    match &last.content[4] {
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            assert_eq!(tool_use_id, "c4");
            assert!(content.contains(TURN_BUDGET_OVERFLOW));
            assert!(is_error);
        }
        other => panic!("unexpected block {other:?}"),
    }
}

#[tokio::test]
async fn turn_budget_exhaustion_fails_with_turns_equal_to_budget() {
    let model = Arc::new(ScriptedModel::repeating(CompletionResponse::tool_use(
        vec![bash("t", "ls")],
        usage(),
    )));
    let task = AgentTask::new(0, "sonnet", "t").with_max_turns(3);

    let result = AgentSession::uncancellable(task, "sb", deps(model.clone(), Arc::new(MemorySandbox::new())))
        .run()
        .await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("turn budget exceeded"));
    assert_eq!(
        result.outcome,
        ForkOutcome::Failed {
            kind: FailureKind::TurnBudgetExceeded
        }
    );
    assert_eq!(result.metrics.turns, 3);
    assert_eq!(model.requests().len(), 3);
    assert_eq!(result.metrics.total_tokens(), 90);
}

#[tokio::test]
async fn denied_write_never_reaches_the_sandbox() {
    let model = Arc::new(ScriptedModel::new(vec![
        Ok(CompletionResponse::tool_use(
            vec![ToolCallRequest::new(
                "w",
                "Write",
                json!({"file_path": "/etc/passwd", "content": "root::0:0"}),
            )],
            usage(),
        )),
        Ok(CompletionResponse::text("stopped", usage())),
    ]));
    let sandbox = Arc::new(MemorySandbox::new());
    let log = Arc::new(MemoryForkLog::new());

    let result = AgentSession::uncancellable(
        AgentTask::new(5, "sonnet", "t"),
        "sb",
        deps(model.clone(), sandbox.clone()).with_log(log.clone()),
    )
    .run()
    .await;

    assert_eq!(sandbox.total_calls(), 0);
    assert_eq!(result.metrics.violations, 1);

    let content = match &model.requests()[1].messages.last().unwrap().content[0] {
        ContentBlock::ToolResult { content, .. } => content.clone(),
        other => panic!("unexpected block {other:?}"),
    };
    assert!(content.contains("SECURITY VIOLATION"));
    assert!(content.contains("deny-list"));

    let denied = log
        .entries_for(5)
        .into_iter()
        .find_map(|e| match e.event {
            ForkLogEvent::ToolCall {
                decision, result, ..
            } => Some((decision, result)),
            _ => None,
        })
        .unwrap();
    assert!(!denied.0.allow);
    assert!(denied.1.is_none());
}

#[tokio::test]
async fn failed_command_is_turn_content_not_fork_failure() {
    let sandbox = Arc::new(MemorySandbox::new());
    sandbox.on_command(
        "cargo test",
        ExecOutput {
            stdout: "running 1 test".into(),
            stderr: "test failed".into(),
            exit_code: 101,
        },
    );
    let model = Arc::new(ScriptedModel::new(vec![
        Ok(CompletionResponse::tool_use(vec![bash("t", "cargo test")], usage())),
        Ok(CompletionResponse::text("tests fail", usage())),
    ]));

    let result = AgentSession::uncancellable(
        AgentTask::new(0, "sonnet", "t"),
        "sb",
        deps(model.clone(), sandbox),
    )
    .run()
    .await;

    assert!(result.success);
    assert_eq!(result.metrics.errors, 1);
    let content = match &model.requests()[1].messages.last().unwrap().content[0] {
        ContentBlock::ToolResult { content, .. } => content.clone(),
        other => panic!("unexpected block {other:?}"),
    };
    assert!(content.contains("STDERR:\ntest failed"));
    assert!(content.contains("Exit code: 101"));
}

#[tokio::test]
async fn unreachable_sandbox_fails_the_fork() {
    let sandbox = Arc::new(MemorySandbox::new());
    sandbox.set_unavailable(true);
    let model = Arc::new(ScriptedModel::repeating(CompletionResponse::tool_use(
        vec![bash("t", "ls")],
        usage(),
    )));

    let result = AgentSession::uncancellable(
        AgentTask::new(0, "sonnet", "t"),
        "sb",
        deps(model, sandbox),
    )
    .run()
    .await;

    assert_eq!(
        result.outcome,
        ForkOutcome::Failed {
            kind: FailureKind::CollaboratorFault
        }
    );
    assert_eq!(result.metrics.turns, 1);
}
