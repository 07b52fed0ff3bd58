//! Integration tests for the core crate.

use builder_core::api::CreateMessageRequest;
use builder_core::model::{
    CodeAgentRun, FileMap, JobOutcome, JobResult, JobStatus, Message, MessageType, NewFragment,
    NewMessage, Role, Turn, TurnRole,
};

#[test]
fn test_role_serde() {
    let serialized = serde_json::to_string(&Role::Assistant).unwrap();
    assert_eq!(serialized, r#""ASSISTANT""#);
    let deserialized: Role = serde_json::from_str(r#""USER""#).unwrap();
    assert_eq!(deserialized, Role::User);
}

#[test]
fn test_message_type_serde() {
    let serialized = serde_json::to_string(&MessageType::Error).unwrap();
    assert_eq!(serialized, r#""ERROR""#);
    let deserialized: MessageType = serde_json::from_str(r#""RESULT""#).unwrap();
    assert_eq!(deserialized, MessageType::Result);
}

#[test]
fn test_event_payload_uses_camel_case() {
    let event: CodeAgentRun =
        serde_json::from_str(r#"{"value":"build a todo app","projectId":"p1"}"#).unwrap();
    assert_eq!(event.project_id, "p1");

    let serialized = serde_json::to_value(&event).unwrap();
    assert_eq!(serialized["projectId"], "p1");
    assert_eq!(serialized["value"], "build a todo app");
}

#[test]
fn test_create_message_request_accepts_project_id_field() {
    let req: CreateMessageRequest =
        serde_json::from_str(r#"{"value":"add dark mode","projectId":"p9"}"#).unwrap();
    assert_eq!(req.project_id, "p9");
}

#[test]
fn test_turn_from_message_collapses_roles() {
    let mut message = Message {
        message_id: "m1".into(),
        project_id: "p1".into(),
        content: "hello".into(),
        role: Role::User,
        message_type: MessageType::Result,
        fragment: None,
        created_at_ms: 1,
        updated_at_ms: 1,
    };
    assert_eq!(
        Turn::from(&message),
        Turn {
            role: TurnRole::User,
            content: "hello".into()
        }
    );

    message.role = Role::Assistant;
    assert_eq!(Turn::from(&message).role, TurnRole::Assistant);
}

#[test]
fn test_new_message_type_field_name() {
    let msg = NewMessage {
        project_id: "p1".into(),
        content: "done".into(),
        role: Role::Assistant,
        message_type: MessageType::Result,
        fragment: Some(NewFragment {
            sandbox_url: "https://3000-abc.localhost".into(),
            title: "Todo App".into(),
            files: FileMap::from([("app/page.tsx".to_string(), "x".to_string())]),
        }),
    };
    let value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["type"], "RESULT");
    assert_eq!(value["fragment"]["files"]["app/page.tsx"], "x");
}

#[test]
fn test_job_outcome_is_tagged_by_status() {
    let outcome = JobOutcome::Succeeded {
        result: JobResult {
            url: "https://3000-abc.localhost".into(),
            title: "Fragment".into(),
            files: FileMap::new(),
            summary: "<task_summary>ok</task_summary>".into(),
        },
    };
    let value = serde_json::to_value(&outcome).unwrap();
    assert_eq!(value["status"], "succeeded");
    assert_eq!(outcome.status(), JobStatus::Succeeded);

    let failed: JobOutcome =
        serde_json::from_str(r#"{"status":"failed","error":"sandbox gone"}"#).unwrap();
    assert_eq!(failed.status(), JobStatus::Failed);
    assert!(failed.status().is_terminal());
    assert!(!JobStatus::Running.is_terminal());
}
