//! Result sink: where finished generations leave the scheduler.
//!
//! The real sink is the conversation store (it appends the generated content
//! as a message and hands back a reference). The scheduler calls exactly one
//! of `write_result` / `write_error` per job that reaches `completed` or a
//! permanent `failed`.

use std::sync::Mutex;

use thiserror::Error;

use genqueue_core::{ConversationId, OutputRef};

/// Failure delivering a result to the conversation store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("result sink unavailable: {0}")]
pub struct SinkError(pub String);

/// Consumer of finished generations.
pub trait ResultSink: Send + Sync {
    /// Deliver generated content; returns a reference to the stored result.
    fn write_result(
        &self,
        conversation_id: ConversationId,
        output: &str,
    ) -> Result<OutputRef, SinkError>;

    /// Deliver a terminal error message for the conversation.
    fn write_error(&self, conversation_id: ConversationId, error: &str) -> Result<(), SinkError>;
}

/// A single recorded sink delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Output {
        conversation_id: ConversationId,
        output_ref: OutputRef,
        content: String,
    },
    Error {
        conversation_id: ConversationId,
        message: String,
    },
}

/// In-memory sink for tests/dev; records every delivery in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    deliveries: Mutex<Vec<Delivery>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    /// Output deliveries only, in delivery order.
    pub fn outputs(&self) -> Vec<(ConversationId, String)> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|d| match d {
                Delivery::Output {
                    conversation_id,
                    content,
                    ..
                } => Some((*conversation_id, content.clone())),
                Delivery::Error { .. } => None,
            })
            .collect()
    }

    /// Error deliveries only, in delivery order.
    pub fn errors(&self) -> Vec<(ConversationId, String)> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|d| match d {
                Delivery::Error {
                    conversation_id,
                    message,
                } => Some((*conversation_id, message.clone())),
                Delivery::Output { .. } => None,
            })
            .collect()
    }
}

impl ResultSink for MemorySink {
    fn write_result(
        &self,
        conversation_id: ConversationId,
        output: &str,
    ) -> Result<OutputRef, SinkError> {
        let mut deliveries = self.deliveries.lock().unwrap();
        let output_ref = OutputRef::new(format!("msg-{}", deliveries.len() + 1));
        deliveries.push(Delivery::Output {
            conversation_id,
            output_ref: output_ref.clone(),
            content: output.to_string(),
        });
        Ok(output_ref)
    }

    fn write_error(&self, conversation_id: ConversationId, error: &str) -> Result<(), SinkError> {
        self.deliveries.lock().unwrap().push(Delivery::Error {
            conversation_id,
            message: error.to_string(),
        });
        Ok(())
    }
}
