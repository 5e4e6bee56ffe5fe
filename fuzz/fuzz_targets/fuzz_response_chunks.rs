// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target feeding arbitrary response chunks to the executor

#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use std::sync::Arc;

use weft_executor::{execute, ExecuteConfig, LocalPartitions, ResponseSource};
use weft_normalizer::{NormalizeOptions, Normalizer, ResponseNormalizer};
use weft_record::{
    CacheConfig, ConcreteRequest, Defer, LinkedField, NormalizationNode, OperationDescriptor, ScalarField,
    Selection, Stream, Variables, ROOT_TYPE,
};

fn operation() -> OperationDescriptor {
    let user = vec![
        Selection::Scalar(ScalarField::new("id")),
        Selection::Scalar(ScalarField::new("name")),
    ];
    let node = NormalizationNode::operation(
        "FuzzQuery",
        vec![
            Selection::Linked(
                LinkedField::new("me")
                    .with_concrete_type("User")
                    .with_selections(vec![
                        Selection::Scalar(ScalarField::new("id")),
                        Selection::Defer(Defer {
                            label: "FuzzQuery$defer$profile".into(),
                            if_variable: None,
                            selections: vec![Selection::Scalar(ScalarField::new("bio"))],
                        }),
                    ]),
            ),
            Selection::Stream(Stream {
                label: "FuzzQuery$stream$friends".into(),
                if_variable: None,
                field: LinkedField::new("friends")
                    .plural()
                    .with_concrete_type("User")
                    .with_selections(user),
            }),
        ],
    );
    OperationDescriptor::new(Arc::new(ConcreteRequest::query(node)), Variables::new(), CacheConfig::default())
}

fuzz_target!(|data: &[u8]| {
    // One chunk per line; malformed JSON is skipped
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let chunks: Vec<Value> = text
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    if chunks.is_empty() {
        return;
    }

    let operation = operation();

    // Normalizing any chunk must not panic
    for chunk in &chunks {
        let _ = ResponseNormalizer.normalize(chunk, &operation.root, ROOT_TYPE, &NormalizeOptions::default());
    }

    // Neither must executing the whole sequence
    let partitions = Arc::new(LocalPartitions::default());
    let (executor, mut output) = execute(ExecuteConfig::new(operation, ResponseSource::from_responses(chunks), partitions));
    let _ = output.collect_available();
    executor.cancel();
});
