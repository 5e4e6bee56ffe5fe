// SPDX-License-Identifier: PMPL-1.0-or-later
//! Field handlers run against `FieldPayload`s at commit time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use weft_record::RecordError;

use crate::payload::FieldPayload;
use crate::proxy::RecordSourceProxy;

pub trait FieldHandler: Send + Sync {
    fn update(&self, proxy: &mut RecordSourceProxy<'_>, payload: &FieldPayload) -> Result<(), RecordError>;
}

/// Mirrors the raw field value into the handle's storage key.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyFieldHandler;

impl FieldHandler for CopyFieldHandler {
    fn update(&self, proxy: &mut RecordSourceProxy<'_>, payload: &FieldPayload) -> Result<(), RecordError> {
        match proxy.get_field(&payload.data_id, &payload.field_key) {
            Some(value) => proxy.set_field(&payload.data_id, &payload.handle_key, value),
            None => Ok(()),
        }
    }
}

/// Handlers keyed by handle name.
#[derive(Clone, Default)]
pub struct HandlerProvider {
    handlers: HashMap<String, Arc<dyn FieldHandler>>,
}

impl HandlerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handle: impl Into<String>, handler: Arc<dyn FieldHandler>) -> Self {
        self.register(handle, handler);
        self
    }

    pub fn register(&mut self, handle: impl Into<String>, handler: Arc<dyn FieldHandler>) {
        self.handlers.insert(handle.into(), handler);
    }

    pub fn get(&self, handle: &str) -> Option<&Arc<dyn FieldHandler>> {
        self.handlers.get(handle)
    }
}

impl fmt::Debug for HandlerProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handles: Vec<&String> = self.handlers.keys().collect();
        handles.sort();
        f.debug_struct("HandlerProvider").field("handles", &handles).finish()
    }
}
