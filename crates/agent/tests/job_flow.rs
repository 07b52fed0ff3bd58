use std::sync::Arc;
use std::time::Duration;

use builder_agent::completion::CompletionSignal;
use builder_agent::job::{CodeAgentJob, JobConfig};
use builder_agent::llm::{ChatMessage, ChatModel, ModelReply};
use builder_agent::local_sandbox::{LocalSandbox, LocalSandboxConfig};
use builder_agent::memory::InMemoryStore;
use builder_agent::persist::ERROR_REPLY;
use builder_agent::sandbox::Sandbox;
use builder_agent::steps::StepContext;
use builder_agent::testing::{call, say, use_tools, ScriptedModel, UnreachableModel};
use builder_core::model::{CodeAgentRun, MessageType, Role};
use serde_json::json;

struct Harness {
    dir: tempfile::TempDir,
    sandbox: Arc<dyn Sandbox>,
    store: Arc<InMemoryStore>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let sandbox: Arc<dyn Sandbox> = Arc::new(LocalSandbox::new(LocalSandboxConfig::new(dir.path())));
    Harness {
        dir,
        sandbox,
        store: Arc::new(InMemoryStore::new()),
    }
}

fn config(max_iter: usize) -> JobConfig {
    JobConfig {
        max_iter,
        sandbox_timeout: Duration::from_secs(60),
        ..JobConfig::default()
    }
}

fn event(value: &str) -> CodeAgentRun {
    CodeAgentRun {
        value: value.into(),
        project_id: "p1".into(),
    }
}

fn write_page(id: &str, content: &str) -> ModelReply {
    use_tools(vec![call(
        id,
        "createOrUpdateFiles",
        json!({"files": [{"path": "app/page.tsx", "content": content}]}),
    )])
}

async fn run(
    h: &Harness,
    model: Arc<dyn ChatModel>,
    max_iter: usize,
    job_id: &str,
) -> builder_core::model::JobResult {
    let job = CodeAgentJob::new(h.sandbox.clone(), model, config(max_iter));
    let mut steps = StepContext::new(job_id, h.store.clone());
    job.run(&event("build a todo app"), h.store.clone(), &mut steps)
        .await
        .unwrap()
}

#[tokio::test]
async fn completed_run_persists_result_with_fragment() {
    let h = harness();
    h.store.seed("p1", Role::User, "build a todo app").await;
    let model = Arc::new(
        ScriptedModel::new([
            write_page("c1", "export default function Page() {}"),
            say("<task_summary>Built a todo app.</task_summary>"),
        ])
        .with_single_shot([say("Todo App"), say("Here is your todo app.")]),
    );

    let result = run(&h, model.clone(), 10, "job-1").await;

    assert_eq!(result.title, "Todo App");
    assert!(result.url.starts_with("https://3000-"));
    assert!(result.url.ends_with(".localhost"));
    assert_eq!(result.summary, "<task_summary>Built a todo app.</task_summary>");
    assert_eq!(result.files["app/page.tsx"], "export default function Page() {}");
    assert_eq!(model.agent_calls(), 2);

    let messages = h.store.messages("p1").await;
    assert_eq!(messages.len(), 2);
    let reply = &messages[1];
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.message_type, MessageType::Result);
    assert_eq!(reply.content, "Here is your todo app.");
    let fragment = reply.fragment.as_ref().unwrap();
    assert_eq!(fragment.sandbox_url, result.url);
    assert_eq!(fragment.title, "Todo App");
    assert_eq!(fragment.files, result.files);

    assert_eq!(
        h.store.step_keys("job-1").await,
        vec![
            "get-sandbox-id",
            "get-previous-messages",
            "code-agent:inference",
            "createOrUpdateFiles",
            "code-agent:inference:1",
            "fragment-title-generator",
            "response-generator",
            "get-sandbox-url",
            "save-result",
        ]
    );
}

#[tokio::test]
async fn files_without_summary_persist_error() {
    let h = harness();
    let model = Arc::new(ScriptedModel::new(Vec::new()).with_fallback(write_page("c", "x")));

    let result = run(&h, model.clone(), 5, "job-1").await;

    assert_eq!(model.agent_calls(), 5);
    assert_eq!(model.single_shot_calls(), 0);
    assert!(result.summary.is_empty());
    assert!(!result.files.is_empty());

    let messages = h.store.messages("p1").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Error);
    assert_eq!(messages[0].content, ERROR_REPLY);
    assert!(messages[0].fragment.is_none());
}

#[tokio::test]
async fn summary_without_files_persists_error() {
    let h = harness();
    let model = Arc::new(ScriptedModel::new([say("<task_summary>nothing</task_summary>")]));

    let result = run(&h, model.clone(), 5, "job-1").await;

    assert_eq!(model.agent_calls(), 1);
    assert!(result.files.is_empty());
    let messages = h.store.messages("p1").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Error);
}

#[tokio::test]
async fn empty_post_processing_output_uses_defaults() {
    let h = harness();
    let model = Arc::new(ScriptedModel::new([
        write_page("c1", "x"),
        say("<task_summary>done</task_summary>"),
    ]));

    let result = run(&h, model, 5, "job-1").await;

    assert_eq!(result.title, "Fragment");
    let messages = h.store.messages("p1").await;
    assert_eq!(messages[0].content, "Here you go");
}

#[tokio::test]
async fn history_is_passed_to_the_agent() {
    let h = harness();
    h.store.seed("p1", Role::User, "first prompt").await;
    h.store.seed("p1", Role::Assistant, "first reply").await;
    let model = Arc::new(ScriptedModel::new([say("<task_summary>x</task_summary>")]));

    run(&h, model.clone(), 5, "job-1").await;

    let first = &model.calls()[0].messages;
    assert_eq!(
        first[1],
        ChatMessage::User {
            content: "first prompt".into()
        }
    );
    assert_eq!(
        first[2],
        ChatMessage::Assistant {
            content: Some("first reply".into()),
            tool_calls: vec![]
        }
    );
    assert_eq!(
        first.last(),
        Some(&ChatMessage::User {
            content: "build a todo app".into()
        })
    );
}

#[tokio::test]
async fn retried_job_replays_recorded_steps() {
    let h = harness();
    let model = Arc::new(
        ScriptedModel::new([
            write_page("c1", "v1"),
            say("<task_summary>done</task_summary>"),
        ])
        .with_single_shot([say("Title"), say("Reply")]),
    );
    let first = run(&h, model, 5, "job-1").await;

    let replayed = run(&h, Arc::new(UnreachableModel), 5, "job-1").await;

    assert_eq!(replayed, first);
    assert_eq!(h.store.messages("p1").await.len(), 1);
}

#[tokio::test]
async fn separate_jobs_run_independently() {
    let h = harness();
    for job_id in ["job-1", "job-2"] {
        let model = Arc::new(ScriptedModel::new([
            write_page("c1", job_id),
            say("<task_summary>done</task_summary>"),
        ]));
        run(&h, model.clone(), 5, job_id).await;
        assert_eq!(model.agent_calls(), 2);
    }
    assert_eq!(h.store.messages("p1").await.len(), 2);
}

#[tokio::test]
async fn interrupted_job_resumes_its_session_on_a_restarted_worker() {
    let h = harness();
    let interrupted = Arc::new(ScriptedModel::new([write_page("c1", "v1")]).unavailable_after_script());
    let job = CodeAgentJob::new(h.sandbox.clone(), interrupted, config(5));
    let mut steps = StepContext::new("job-1", h.store.clone());
    let err = job
        .run(&event("build a todo app"), h.store.clone(), &mut steps)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(h.store.messages("p1").await.is_empty());

    let restarted: Arc<dyn Sandbox> =
        Arc::new(LocalSandbox::new(LocalSandboxConfig::new(h.dir.path())));
    let model = Arc::new(
        ScriptedModel::new([
            use_tools(vec![call("c2", "readFile", json!({"files": ["app/page.tsx"]}))]),
            say("<task_summary>done</task_summary>"),
        ])
        .with_single_shot([say("Title"), say("Reply")]),
    );
    let job = CodeAgentJob::new(restarted, model.clone(), config(5));
    let mut steps = StepContext::new("job-1", h.store.clone());
    let result = job
        .run(&event("build a todo app"), h.store.clone(), &mut steps)
        .await
        .unwrap();

    assert_eq!(model.agent_calls(), 2);
    let read_back = model.calls()[1].messages.last().cloned();
    match read_back {
        Some(ChatMessage::Tool { content, .. }) => assert!(content.contains("v1"), "{content}"),
        other => panic!("expected a tool result, got {other:?}"),
    }
    assert_eq!(result.files["app/page.tsx"], "v1");
    assert_eq!(result.title, "Title");
    let messages = h.store.messages("p1").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Result);
}

#[tokio::test]
async fn custom_completion_marker_ends_the_run() {
    let h = harness();
    let model = Arc::new(
        ScriptedModel::new([write_page("c1", "x"), say("[[DONE]] Built it.")])
            .with_single_shot([say("Title"), say("Reply")]),
    );
    let cfg = JobConfig {
        completion: CompletionSignal::new("[[DONE]]"),
        ..config(5)
    };
    let job = CodeAgentJob::new(h.sandbox.clone(), model.clone(), cfg);
    let mut steps = StepContext::new("job-1", h.store.clone());
    let result = job
        .run(&event("build a todo app"), h.store.clone(), &mut steps)
        .await
        .unwrap();

    assert_eq!(model.agent_calls(), 2);
    assert_eq!(result.summary, "[[DONE]] Built it.");
    let system = &model.calls()[0].messages[0];
    match system {
        ChatMessage::System { content } => assert!(content.contains("[[DONE]]")),
        other => panic!("expected the system prompt, got {other:?}"),
    }
    assert_eq!(h.store.messages("p1").await[0].message_type, MessageType::Result);
}
