// SPDX-License-Identifier: PMPL-1.0-or-later
//! Integration tests for the incremental executor.

mod common;

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

use common::*;
use weft_executor::{
    execute, ActiveState, DeferredOperationLoader, ExecuteConfig, ExecutionEvent, Executor, ExecutorError, ExecutorState,
    LocalPartitions, OptimisticConfig, PartitionAccess, QueuedScheduler, ResponseSource, SUBSCRIPTION_ROOT_ID_KEY,
};
use weft_record::{
    ActorChange, Argument, ArgumentDefinition, DataId, Defer, LinkedField, ModuleImport, NormalizationNode,
    PartitionId, ScalarField, Selection, Stream, Variables,
};
use weft_store::{store_updater, Store};

// ===========================================================================
// Fixtures
// ===========================================================================

fn user_selections() -> Vec<Selection> {
    vec![Selection::Linked(linked("user", "User", vec![scalar("id"), scalar("name")]))]
}

fn friends_field() -> LinkedField {
    LinkedField::new("friends")
        .plural()
        .with_concrete_type("User")
        .with_selections(vec![scalar("id"), scalar("name")])
}

fn root_stream_query() -> weft_record::OperationDescriptor {
    query(
        "FriendsQuery",
        vec![Selection::Stream(Stream {
            label: "FriendsQuery$stream$friends".into(),
            if_variable: None,
            field: friends_field(),
        })],
    )
}

fn stream_item(index: usize, id: &str, name: &str) -> serde_json::Value {
    json!({
        "label": "FriendsQuery$stream$friends",
        "path": ["friends", index],
        "data": {"id": id, "name": name}
    })
}

fn renderer_query(args: Vec<Argument>) -> weft_record::OperationDescriptor {
    query(
        "FeedQuery",
        vec![Selection::Linked(linked(
            "renderer",
            "MarkdownRenderer",
            vec![Selection::ModuleImport(ModuleImport {
                args,
                document_name: "Feed_renderer".into(),
                fragment_name: "MarkdownRenderer_renderer".into(),
                fragment_prop_name: "renderer".into(),
            })],
        ))],
    )
}

fn renderer_response() -> serde_json::Value {
    json!({
        "data": {"renderer": {
            "__module_operation_Feed_renderer": "Markdown$normalization",
            "__module_component_Feed_renderer": "Markdown.react",
            "markdown": "# hello"
        }},
        "extensions": {"is_final": true}
    })
}

fn markdown_node() -> NormalizationNode {
    NormalizationNode::split_operation("Markdown$normalization", vec![], vec![scalar("markdown")])
}

const RENDERER_ID: &str = "client:root:renderer";

// ===========================================================================
// Basic execution
// ===========================================================================

#[test]
fn test_final_chunk_stores_record_and_completes_tracker_once() {
    init_tracing();
    let partitions = Arc::new(LocalPartitions::default());
    let tracker = Arc::new(RecordingTracker::default());
    let source = ResponseSource::from_responses([json!({"data": {"user": {"id": "1", "name": "Ann"}}})]);
    let config = ExecuteConfig::new(query("UserQuery", user_selections()), source, partitions.clone())
        .with_operation_tracker(tracker.clone());
    let executions = config.operation_executions.clone();

    let (executor, mut output) = execute(config);
    let events = output.collect_available();

    assert_eq!(next_payloads(&events).len(), 1);
    assert!(is_complete(&events));
    assert_eq!(executor.state(), ExecutorState::Completed);
    assert_eq!(field(&partitions, &default_partition(), "1", "name"), Some(json!("Ann")));
    assert_eq!(tracker.complete_count(), 1);
    assert!(executions.lock().is_empty());
}

#[test]
fn test_source_error_is_surfaced() {
    let partitions = Arc::new(LocalPartitions::default());
    let source = ResponseSource::from_error(ExecutorError::Source("offline".into()));
    let (executor, mut output) = execute(ExecuteConfig::new(query("UserQuery", user_selections()), source, partitions));

    let events = output.collect_available();
    assert_eq!(events, vec![ExecutionEvent::Error(ExecutorError::Source("offline".into()))]);
    assert_eq!(executor.state(), ExecutorState::Completed);
}

#[test]
fn test_batch_is_forwarded_as_batch() {
    let partitions = Arc::new(LocalPartitions::default());
    let batch = json!([
        {"data": {"user": {"id": "1", "name": "Ann"}}},
        {"data": {"user": {"id": "2", "name": "Bob"}}}
    ]);
    let source = ResponseSource::from_responses([batch.clone()]);
    let (_executor, mut output) = execute(ExecuteConfig::new(query("UserQuery", user_selections()), source, partitions.clone()));

    let events = output.collect_available();
    assert_eq!(next_payloads(&events), vec![batch]);
    assert_eq!(field(&partitions, &default_partition(), "1", "name"), Some(json!("Ann")));
    assert_eq!(field(&partitions, &default_partition(), "2", "name"), Some(json!("Bob")));
}

// ===========================================================================
// Errors and continuations
// ===========================================================================

#[test]
fn test_error_chunk_cancels_and_leaves_store_unchanged() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let mut seed = weft_record::Record::new(DataId::new("1"), "User");
    seed.set_value("name", json!("Before"));
    {
        let queue = partitions.publish_queue(&partition);
        let mut queue = queue.lock();
        queue.commit_source(std::iter::once(seed).collect());
        queue.run(None).unwrap();
    }
    let before = partitions.in_memory_store(&partition).get_source();

    let source = ResponseSource::from_responses([json!({"data": null, "errors": [{"message": "boom"}]})]);
    let (executor, mut output) = execute(ExecuteConfig::new(query("UserQuery", user_selections()), source, partitions.clone()));

    let events = output.collect_available();
    assert_eq!(events.len(), 1);
    let error = error_of(&events).unwrap();
    assert!(error.to_string().contains("boom"));
    assert!(matches!(error, ExecutorError::NoData { ref operation, .. } if operation == "UserQuery"));
    assert_eq!(executor.state(), ExecutorState::Completed);
    assert_eq!(partitions.in_memory_store(&partition).get_source(), before);
}

#[test]
fn test_present_but_empty_errors_are_fatal() {
    let cases = [
        (json!(null), "(No errors)"),
        (json!([]), ""),
        (json!([{"message": "first"}, {"message": "second"}]), "first\nsecond"),
    ];
    for (errors, expected) in cases {
        let partitions = Arc::new(LocalPartitions::default());
        let source = ResponseSource::from_responses([json!({"data": null, "errors": errors})]);
        let (_executor, mut output) = execute(ExecuteConfig::new(query("UserQuery", user_selections()), source, partitions));

        match error_of(&output.collect_available()) {
            Some(ExecutorError::NoData { messages, .. }) => assert_eq!(messages, expected),
            other => panic!("expected NoData, got {other:?}"),
        }
    }
}

#[test]
fn test_continuation_without_errors_is_forwarded_untouched() {
    let partitions = Arc::new(LocalPartitions::default());
    let (sender, source) = ResponseSource::channel();
    let (executor, mut output) = execute(ExecuteConfig::new(query("UserQuery", user_selections()), source, partitions.clone()));

    sender.next(json!({"data": {"user": {"id": "1", "name": "Ann"}}}));
    let continuation = json!({"data": null, "extensions": {"is_final": true}});
    sender.next(continuation.clone());
    executor.drain();

    let events = output.collect_available();
    assert_eq!(next_payloads(&events)[1], continuation);
    assert!(error_of(&events).is_none());
    assert_eq!(executor.state(), ExecutorState::LoadingFinal);
    assert_eq!(field(&partitions, &default_partition(), "1", "name"), Some(json!("Ann")));
}

#[test]
fn test_part_with_label_but_no_path_is_invariant() {
    let partitions = Arc::new(LocalPartitions::default());
    let source = ResponseSource::from_responses([json!({"label": "L1", "data": {"id": "1"}})]);
    let (_executor, mut output) = execute(ExecuteConfig::new(query("UserQuery", user_selections()), source, partitions));

    assert!(matches!(error_of(&output.collect_available()), Some(ExecutorError::Invariant(_))));
}

// ===========================================================================
// Optimistic updates
// ===========================================================================

fn rename_mutation() -> weft_record::OperationDescriptor {
    mutation(
        "RenameUser",
        vec![Selection::Linked(linked(
            "user",
            "User",
            vec![scalar("id"), scalar("name"), scalar("nickname")],
        ))],
    )
}

fn optimistic_rename() -> OptimisticConfig {
    OptimisticConfig {
        response: Some(json!({"user": {"id": "1", "name": "Optimistic", "nickname": "opt"}})),
        updater: None,
    }
}

#[test]
fn test_optimistic_then_real_leaves_no_residue() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let (sender, source) = ResponseSource::channel();
    let config = ExecuteConfig::new(rename_mutation(), source, partitions.clone()).with_optimistic(optimistic_rename());
    let (executor, mut output) = execute(config);

    assert_eq!(field(&partitions, &partition, "1", "name"), Some(json!("Optimistic")));
    assert!(partitions.in_memory_store(&partition).has_optimistic_overlay());
    assert!(output.collect_available().is_empty());

    sender.next(json!({"data": {"user": {"id": "1", "name": "Real"}}}));
    sender.complete();
    executor.drain();

    assert_eq!(field(&partitions, &partition, "1", "name"), Some(json!("Real")));
    assert_eq!(field(&partitions, &partition, "1", "nickname"), None);
    assert!(!partitions.in_memory_store(&partition).has_optimistic_overlay());
    assert!(is_complete(&output.collect_available()));
}

#[test]
fn test_second_optimistic_response_is_invariant_and_store_recovers() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let source = ResponseSource::from_responses([json!({
        "data": {"user": {"id": "1", "name": "Again"}},
        "extensions": {"isOptimistic": true}
    })]);
    let config = ExecuteConfig::new(rename_mutation(), source, partitions.clone()).with_optimistic(optimistic_rename());
    let (_executor, mut output) = execute(config);

    match error_of(&output.collect_available()) {
        Some(ExecutorError::Invariant(message)) => assert!(message.contains("only one optimistic response")),
        other => panic!("expected invariant violation, got {other:?}"),
    }
    assert!(record(&partitions, &partition, "1").is_none());
    assert!(!partitions.in_memory_store(&partition).has_optimistic_overlay());
    assert_eq!(partitions.publish_queue(&partition).lock().applied_update_count(), 0);
}

#[test]
fn test_batched_optimistic_is_invariant() {
    let partitions = Arc::new(LocalPartitions::default());
    let source = ResponseSource::from_responses([json!([
        {"data": {"user": {"id": "1", "name": "A"}}, "extensions": {"isOptimistic": true}},
        {"data": {"user": {"id": "1", "name": "B"}}}
    ])]);
    let (_executor, mut output) = execute(ExecuteConfig::new(rename_mutation(), source, partitions));

    match error_of(&output.collect_available()) {
        Some(ExecutorError::Invariant(message)) => assert!(message.contains("batched")),
        other => panic!("expected invariant violation, got {other:?}"),
    }
}

#[test]
fn test_optimistic_after_server_payload_is_invariant() {
    let partitions = Arc::new(LocalPartitions::default());
    let source = ResponseSource::from_responses([
        json!({"data": {"user": {"id": "1", "name": "Server"}}}),
        json!({"data": {"user": {"id": "1", "name": "Late"}}, "extensions": {"isOptimistic": true}}),
    ]);
    let (_executor, mut output) = execute(ExecuteConfig::new(rename_mutation(), source, partitions.clone()));

    match error_of(&output.collect_available()) {
        Some(ExecutorError::Invariant(message)) => assert!(message.contains("after server payload")),
        other => panic!("expected invariant violation, got {other:?}"),
    }
    assert_eq!(field(&partitions, &default_partition(), "1", "name"), Some(json!("Server")));
}

#[test]
fn test_network_optimistic_chunk_is_reverted_on_cancel() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let before = partitions.in_memory_store(&partition).get_source();
    let (sender, source) = ResponseSource::channel();
    let (executor, _output) = execute(ExecuteConfig::new(rename_mutation(), source, partitions.clone()));

    sender.next(json!({
        "data": {"user": {"id": "1", "name": "Opt"}},
        "extensions": {"isOptimistic": true}
    }));
    executor.drain();
    assert_eq!(executor.state(), ExecutorState::Started);
    assert_eq!(field(&partitions, &partition, "1", "name"), Some(json!("Opt")));
    assert!(partitions.in_memory_store(&partition).has_optimistic_overlay());
    assert!(partitions.in_memory_store(&partition).base_source().get(&DataId::new("1")).is_none());

    executor.cancel();
    assert_eq!(partitions.in_memory_store(&partition).get_source(), before);
    assert!(!partitions.in_memory_store(&partition).has_optimistic_overlay());
}

#[test]
fn test_optimistic_updater_only() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let updater = store_updater(|proxy| {
        proxy.get_or_create(DataId::new("counter"), "Counter");
        proxy.set_value(&DataId::new("counter"), "count", json!(1))
    });
    let config = ExecuteConfig::new(rename_mutation(), ResponseSource::never(), partitions.clone()).with_optimistic(
        OptimisticConfig {
            response: None,
            updater: Some(updater),
        },
    );
    let (executor, _output) = execute(config);
    assert_eq!(field(&partitions, &partition, "counter", "count"), Some(json!(1)));

    executor.cancel();
    assert!(record(&partitions, &partition, "counter").is_none());
}

#[test]
fn test_cancel_is_idempotent() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let tracker = Arc::new(RecordingTracker::default());
    let config = ExecuteConfig::new(rename_mutation(), ResponseSource::never(), partitions.clone())
        .with_optimistic(optimistic_rename())
        .with_operation_tracker(tracker.clone());
    let (executor, mut output) = execute(config);

    executor.cancel();
    executor.cancel();

    assert_eq!(tracker.complete_count(), 1);
    assert!(record(&partitions, &partition, "1").is_none());
    assert_eq!(partitions.publish_queue(&partition).lock().applied_update_count(), 0);
    assert_eq!(executor.state(), ExecutorState::Completed);
    assert!(output.collect_available().is_empty());
}

// ===========================================================================
// Incremental delivery
// ===========================================================================

#[test]
fn test_stream_item_before_announcing_payload_is_replayed() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let (sender, source) = ResponseSource::channel();
    let (executor, mut output) = execute(ExecuteConfig::new(root_stream_query(), source, partitions.clone()));

    sender.next(stream_item(0, "f0", "Ann"));
    executor.drain();
    assert!(record(&partitions, &partition, "f0").is_none());

    sender.next(json!({"data": {"friends": []}}));
    executor.drain();

    let root = record(&partitions, &partition, DataId::root().as_str()).unwrap();
    assert_eq!(root.get_linked_ids("friends").unwrap(), &[Some(DataId::new("f0"))]);
    assert_eq!(field(&partitions, &partition, "f0", "name"), Some(json!("Ann")));
    assert_eq!(next_payloads(&output.collect_available()).len(), 2);
}

#[test]
fn test_stream_items_append_in_order() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let source = ResponseSource::from_responses([
        json!({"data": {"friends": [{"id": "f0", "name": "Ann"}]}}),
        stream_item(1, "f1", "Bob"),
        stream_item(2, "f2", "Cy"),
        json!({"data": null, "extensions": {"is_final": true}}),
    ]);
    let (executor, mut output) = execute(ExecuteConfig::new(root_stream_query(), source, partitions.clone()));

    let root = record(&partitions, &partition, DataId::root().as_str()).unwrap();
    assert_eq!(
        root.get_linked_ids("friends").unwrap(),
        &[Some(DataId::new("f0")), Some(DataId::new("f1")), Some(DataId::new("f2"))]
    );
    assert!(is_complete(&output.collect_available()));
    assert_eq!(executor.state(), ExecutorState::Completed);
}

#[test]
fn test_stream_insert_skips_when_list_changed_externally() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let (sender, source) = ResponseSource::channel();
    let (executor, _output) = execute(ExecuteConfig::new(root_stream_query(), source, partitions.clone()));

    sender.next(json!({"data": {"friends": []}}));
    sender.next(stream_item(0, "f0", "Ann"));
    executor.drain();

    {
        let queue = partitions.publish_queue(&partition);
        let mut queue = queue.lock();
        queue.commit_update(store_updater(|proxy| {
            proxy.set_linked_ids(&DataId::root(), "friends", vec![Some(DataId::new("external"))])
        }));
        queue.run(None).unwrap();
    }

    sender.next(stream_item(1, "f1", "Bob"));
    executor.drain();

    let root = record(&partitions, &partition, DataId::root().as_str()).unwrap();
    assert_eq!(root.get_linked_ids("friends").unwrap(), &[Some(DataId::new("external"))]);
}

#[test]
fn test_stream_inside_defer_waits_for_the_deferred_payload() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let me = linked(
        "me",
        "User",
        vec![
            scalar("id"),
            Selection::Defer(Defer {
                label: "ProfileQuery$defer$Friends".into(),
                if_variable: None,
                selections: vec![Selection::Stream(Stream {
                    label: "ProfileQuery$stream$friends".into(),
                    if_variable: None,
                    field: friends_field(),
                })],
            }),
        ],
    );
    let (sender, source) = ResponseSource::channel();
    let (executor, _output) = execute(ExecuteConfig::new(
        query("ProfileQuery", vec![Selection::Linked(me)]),
        source,
        partitions.clone(),
    ));

    sender.next(json!({"data": {"me": {"id": "4"}}}));
    sender.next(json!({
        "label": "ProfileQuery$stream$friends",
        "path": ["me", "friends", 0],
        "data": {"id": "f0", "name": "Ann"}
    }));
    executor.drain();
    assert!(record(&partitions, &partition, "f0").is_none());

    sender.next(json!({
        "label": "ProfileQuery$defer$Friends",
        "path": ["me"],
        "data": {"friends": []}
    }));
    executor.drain();

    let me = record(&partitions, &partition, "4").unwrap();
    assert_eq!(me.get_linked_ids("friends").unwrap(), &[Some(DataId::new("f0"))]);
    assert_eq!(executor.state(), ExecutorState::LoadingIncremental);
}

fn deferred_name_query() -> weft_record::OperationDescriptor {
    query(
        "ProfileQuery",
        vec![Selection::Linked(linked(
            "me",
            "User",
            vec![
                scalar("id"),
                Selection::Defer(Defer {
                    label: "ProfileQuery$defer$Name".into(),
                    if_variable: None,
                    selections: vec![scalar("name")],
                }),
            ],
        ))],
    )
}

#[test]
fn test_operation_retained_while_incremental_payloads_pending() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let operation = deferred_name_query();
    let (sender, source) = ResponseSource::channel();
    let (executor, _output) = execute(ExecuteConfig::new(operation.clone(), source, partitions.clone()));

    sender.next(json!({"data": {"me": {"id": "4", "name": "Zuck"}}}));
    executor.drain();
    let store = partitions.in_memory_store(&partition);
    assert!(store.is_retained(operation.identifier()));
    // Deferred fields wait for their own payload.
    assert_eq!(field(&partitions, &partition, "4", "name"), None);

    sender.next(json!({"label": "ProfileQuery$defer$Name", "path": ["me"], "data": {"name": "Zuck"}}));
    executor.drain();
    assert_eq!(field(&partitions, &partition, "4", "name"), Some(json!("Zuck")));

    executor.cancel();
    assert!(!store.is_retained(operation.identifier()));
}

#[test]
fn test_client_payload_resolves_defers_immediately() {
    let partitions = Arc::new(LocalPartitions::default());
    let source = ResponseSource::from_responses([json!({"data": {"me": {"id": "4", "name": "Zuck"}}})]);
    let config = ExecuteConfig::new(deferred_name_query(), source, partitions.clone()).client_payload();
    let (_executor, mut output) = execute(config);

    assert_eq!(field(&partitions, &default_partition(), "4", "name"), Some(json!("Zuck")));
    assert!(is_complete(&output.collect_available()));
}

#[test]
fn test_stream_item_without_index_is_invariant() {
    let partitions = Arc::new(LocalPartitions::default());
    let source = ResponseSource::from_responses([
        json!({"data": {"friends": []}}),
        json!({"label": "FriendsQuery$stream$friends", "path": ["friends"], "data": {}}),
    ]);
    let (_executor, mut output) = execute(ExecuteConfig::new(root_stream_query(), source, partitions));
    assert!(matches!(error_of(&output.collect_available()), Some(ExecutorError::Invariant(_))));
}

#[test]
fn test_response_kind_must_match_placeholder_kind() {
    // A stream whose label happens to carry the defer marker: its items are
    // read as deferred fragments and rejected.
    let partitions = Arc::new(LocalPartitions::default());
    let operation = query(
        "OddQuery",
        vec![Selection::Stream(Stream {
            label: "OddQuery$defer$friends".into(),
            if_variable: None,
            field: friends_field(),
        })],
    );
    let source = ResponseSource::from_responses([
        json!({"data": {"friends": []}}),
        json!({"label": "OddQuery$defer$friends", "path": [], "data": {"id": "f0"}}),
    ]);
    let (_executor, mut output) = execute(ExecuteConfig::new(operation, source, partitions));
    match error_of(&output.collect_available()) {
        Some(ExecutorError::Invariant(message)) => assert!(message.contains("does not match")),
        other => panic!("expected invariant violation, got {other:?}"),
    }
}

// ===========================================================================
// Subscriptions
// ===========================================================================

#[test]
fn test_subscription_payloads_get_fresh_roots() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let operation = subscription(
        "OnMessage",
        vec![Selection::Linked(linked("message", "Message", vec![scalar("id"), scalar("text")]))],
    );
    let source = ResponseSource::from_responses([
        json!({"data": {"message": {"id": "m1", "text": "a"}}}),
        json!({"data": {"message": {"id": "m2", "text": "b"}}}),
    ]);
    let (_executor, mut output) = execute(ExecuteConfig::new(operation, source, partitions.clone()));

    let payloads = next_payloads(&output.collect_available());
    let roots: Vec<String> = payloads
        .iter()
        .map(|payload| payload["extensions"][SUBSCRIPTION_ROOT_ID_KEY].as_str().unwrap().to_string())
        .collect();
    assert_eq!(roots.len(), 2);
    assert_ne!(roots[0], roots[1]);
    assert!(roots.iter().all(|root| root.starts_with("client:local:")));

    let first = record(&partitions, &partition, &roots[0]).unwrap();
    assert_eq!(first.get_linked_id("message"), Some(&DataId::new("m1")));
    let second = record(&partitions, &partition, &roots[1]).unwrap();
    assert_eq!(second.get_linked_id("message"), Some(&DataId::new("m2")));
}

// ===========================================================================
// Followups
// ===========================================================================

#[test]
fn test_actor_followup_writes_only_its_partition() {
    let partitions = Arc::new(LocalPartitions::default());
    let tracker = Arc::new(RecordingTracker::default());
    let a = PartitionId::new("a");
    let b = PartitionId::new("b");
    let watched = || NormalizationNode::fragment("ViewerName", vec![scalar("name")]);
    let _in_a = watch(&partitions, &a, "v1", watched(), "ViewerInA");
    let _in_b = watch(&partitions, &b, "v1", watched(), "ViewerInB");

    let operation = query(
        "ViewerQuery",
        vec![Selection::ActorChange(ActorChange {
            field: linked("viewer", "Viewer", vec![scalar("id"), scalar("name")]),
        })],
    );
    let source = ResponseSource::from_responses([json!({
        "data": {"viewer": {"actor_key": "b", "id": "v1", "name": "Other"}}
    })]);
    let config = ExecuteConfig::new(operation, source, partitions.clone())
        .with_partition(a.clone())
        .with_operation_tracker(tracker.clone());
    let (_executor, mut output) = execute(config);

    assert!(is_complete(&output.collect_available()));
    assert_eq!(field(&partitions, &b, "v1", "name"), Some(json!("Other")));
    assert!(record(&partitions, &a, "v1").is_none());
    assert!(record(&partitions, &a, DataId::root().as_str()).is_some());

    let owners = tracker.updated_owners();
    assert!(owners.contains(&weft_record::RequestIdentifier::new("ViewerInB")));
    assert!(!owners.contains(&weft_record::RequestIdentifier::new("ViewerInA")));
}

#[test]
fn test_sync_module_import_uses_split_operation_variables() {
    let partitions = Arc::new(LocalPartitions::default());
    let markdown = ScalarField::new("markdown").with_args(vec![Argument::variable("size", "size")]);
    let node = NormalizationNode::split_operation(
        "Markdown$normalization",
        vec![ArgumentDefinition {
            name: "size".into(),
            default_value: json!(1),
        }],
        vec![Selection::Scalar(markdown.clone())],
    );
    let loader = Arc::new(DeferredOperationLoader::new().with_node("Markdown$normalization", node));
    let source = ResponseSource::from_responses([renderer_response()]);
    let config = ExecuteConfig::new(
        renderer_query(vec![Argument::literal("size", json!(2))]),
        source,
        partitions.clone(),
    )
    .with_operation_loader(loader);
    let (_executor, mut output) = execute(config);

    assert!(is_complete(&output.collect_available()));
    let mut variables = Variables::new();
    variables.insert("size".into(), json!(2));
    let key = markdown.storage_key(&variables);
    assert_eq!(field(&partitions, &default_partition(), RENDERER_ID, &key), Some(json!("# hello")));
}

#[test]
fn test_async_module_import_completes_after_load() {
    let partitions = Arc::new(LocalPartitions::default());
    let loader = Arc::new(DeferredOperationLoader::new());
    let source = ResponseSource::from_responses([renderer_response()]);
    let config = ExecuteConfig::new(renderer_query(vec![]), source, partitions.clone())
        .with_operation_loader(loader.clone());
    let executions = config.operation_executions.clone();
    let operation = config.operation.clone();
    let (executor, mut output) = execute(config);

    let events = output.collect_available();
    assert_eq!(next_payloads(&events).len(), 1);
    assert!(!is_complete(&events));
    assert_eq!(executor.state(), ExecutorState::LoadingFinal);
    assert_eq!(executions.lock().get(operation.identifier()), Some(&ActiveState::Active));
    assert_eq!(field(&partitions, &default_partition(), RENDERER_ID, "markdown"), None);

    assert_eq!(loader.resolve("Markdown$normalization", Some(markdown_node())), 1);
    executor.drain();

    assert_eq!(field(&partitions, &default_partition(), RENDERER_ID, "markdown"), Some(json!("# hello")));
    assert!(is_complete(&output.collect_available()));
    assert!(executions.lock().is_empty());
}

#[test]
fn test_module_load_failure_fails_execution() {
    let partitions = Arc::new(LocalPartitions::default());
    let loader = Arc::new(DeferredOperationLoader::new());
    let source = ResponseSource::from_responses([renderer_response()]);
    let config = ExecuteConfig::new(renderer_query(vec![]), source, partitions).with_operation_loader(loader.clone());
    let (executor, mut output) = execute(config);

    loader.fail("Markdown$normalization", "chunk missing");
    executor.drain();

    assert_eq!(
        error_of(&output.collect_available()),
        Some(ExecutorError::ModuleLoad("chunk missing".into()))
    );
    assert_eq!(executor.state(), ExecutorState::Completed);
}

#[test]
fn test_cancel_during_async_module_load() {
    let partitions = Arc::new(LocalPartitions::default());
    let loader = Arc::new(DeferredOperationLoader::new());
    let tracker = Arc::new(RecordingTracker::default());
    let (sender, source) = ResponseSource::channel();
    let config = ExecuteConfig::new(renderer_query(vec![]), source, partitions.clone())
        .with_operation_loader(loader.clone())
        .with_operation_tracker(tracker.clone());
    let (executor, _output) = execute(config);

    sender.next(renderer_response());
    executor.drain();
    assert_eq!(loader.pending("Markdown$normalization"), 1);
    assert_eq!(tracker.complete_count(), 0);

    executor.cancel();
    assert_eq!(tracker.complete_count(), 1);
    assert!(sender.is_closed());

    assert_eq!(loader.resolve("Markdown$normalization", Some(markdown_node())), 0);
    executor.drain();
    executor.cancel();

    assert_eq!(field(&partitions, &default_partition(), RENDERER_ID, "markdown"), None);
    assert_eq!(tracker.complete_count(), 1);
}

#[test]
fn test_module_import_without_loader_is_invariant() {
    let partitions = Arc::new(LocalPartitions::default());
    let source = ResponseSource::from_responses([renderer_response()]);
    let (_executor, mut output) = execute(ExecuteConfig::new(renderer_query(vec![]), source, partitions));

    match error_of(&output.collect_available()) {
        Some(ExecutorError::Invariant(message)) => assert!(message.contains("operation loader")),
        other => panic!("expected invariant violation, got {other:?}"),
    }
}

// ===========================================================================
// Scheduling
// ===========================================================================

#[test]
fn test_queued_scheduler_defers_store_work() {
    let partitions = Arc::new(LocalPartitions::default());
    let scheduler = Arc::new(QueuedScheduler::new());
    let source = ResponseSource::from_responses([json!({"data": {"user": {"id": "1", "name": "Ann"}}})]);
    let config = ExecuteConfig::new(query("UserQuery", user_selections()), source, partitions.clone())
        .with_scheduler(scheduler.clone());
    let (executor, mut output) = execute(config);

    assert_eq!(scheduler.pending(), 1);
    assert!(record(&partitions, &default_partition(), "1").is_none());
    assert!(output.collect_available().is_empty());

    assert_eq!(scheduler.run_pending(), 1);
    assert_eq!(field(&partitions, &default_partition(), "1", "name"), Some(json!("Ann")));
    let events = output.collect_available();
    assert_eq!(next_payloads(&events).len(), 1);
    assert!(is_complete(&events));
    assert_eq!(executor.state(), ExecutorState::Completed);
}

#[test]
fn test_cancel_drops_scheduled_work() {
    let partitions = Arc::new(LocalPartitions::default());
    let scheduler = Arc::new(QueuedScheduler::new());
    let source = ResponseSource::from_responses([json!({"data": {"user": {"id": "1", "name": "Ann"}}})]);
    let config = ExecuteConfig::new(query("UserQuery", user_selections()), source, partitions.clone())
        .with_scheduler(scheduler.clone());
    let (executor, _output) = execute(config);

    executor.cancel();
    assert_eq!(scheduler.pending(), 0);
    scheduler.run_pending();
    assert!(record(&partitions, &default_partition(), "1").is_none());
}

// ===========================================================================
// Subscribers
// ===========================================================================

#[test]
fn test_subscriber_may_call_back_into_executor() {
    init_tracing();
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let (sender, source) = ResponseSource::channel();
    let (executor, mut output) = execute(ExecuteConfig::new(query("UserQuery", user_selections()), source, partitions.clone()));

    let slot: Arc<Mutex<Option<Executor>>> = Arc::new(Mutex::new(None));
    let observed = Arc::new(Mutex::new(Vec::new()));
    let callback_slot = Arc::clone(&slot);
    let states = Arc::clone(&observed);
    let _subscription = watch_with(
        &partitions,
        &partition,
        "1",
        NormalizationNode::operation("UserName", vec![scalar("name")]),
        "UserName",
        Arc::new(move |_| {
            let executor = callback_slot.lock().clone();
            if let Some(executor) = executor {
                states.lock().push(executor.state());
                executor.cancel();
            }
        }),
    );
    *slot.lock() = Some(executor.clone());

    sender.next(json!({"data": {"user": {"id": "1", "name": "Ann"}}}));
    executor.drain();

    let states = observed.lock().clone();
    assert_eq!(states.len(), 1);
    assert_ne!(states[0], ExecutorState::Completed);
    assert_eq!(executor.state(), ExecutorState::Completed);
    assert_eq!(field(&partitions, &partition, "1", "name"), Some(json!("Ann")));
    let events = output.collect_available();
    assert_eq!(next_payloads(&events).len(), 1);
    assert!(!is_complete(&events));
}

#[test]
fn test_subscriber_may_call_back_into_scheduled_executor() {
    let partitions = Arc::new(LocalPartitions::default());
    let partition = default_partition();
    let scheduler = Arc::new(QueuedScheduler::new());
    let source = ResponseSource::from_responses([json!({"data": {"user": {"id": "1", "name": "Ann"}}})]);
    let config = ExecuteConfig::new(query("UserQuery", user_selections()), source, partitions.clone())
        .with_scheduler(scheduler.clone());
    let (executor, _output) = execute(config);

    let observed = Arc::new(Mutex::new(Vec::new()));
    let callback_executor = executor.clone();
    let states = Arc::clone(&observed);
    let _subscription = watch_with(
        &partitions,
        &partition,
        "1",
        NormalizationNode::operation("UserName", vec![scalar("name")]),
        "UserName",
        Arc::new(move |_| states.lock().push(callback_executor.state())),
    );

    assert_eq!(scheduler.run_pending(), 1);
    assert_eq!(observed.lock().len(), 1);
    assert_eq!(executor.state(), ExecutorState::Completed);
}
