// Scripted queue adapters shared by the subscriber scenario tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use drover_subscriber::{AdapterError, Message, QueueAdapter};
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

/// What `receive` answers with
#[derive(Debug, Clone)]
pub enum Script {
    /// Every call returns one message with the given id
    Repeat(String),
    /// The first call returns one message, later calls return nothing
    Once(String),
    /// Every call returns nothing
    Empty,
    /// Every call fails
    Fail,
}

/// Recorded `extend_lease` call
#[derive(Debug, Clone)]
pub struct Extension {
    pub message_id: String,
    pub lease_token: Option<String>,
    pub seconds: u64,
    pub at: Instant,
}

/// Adapter whose `receive` follows a fixed script and which records every call
pub struct ScriptedAdapter {
    script: Script,
    max_batch_size: usize,
    delivered: AtomicBool,
    receives: AtomicUsize,
    requested: Mutex<Vec<usize>>,
    acknowledged: Mutex<Vec<Message>>,
    extensions: Mutex<Vec<Extension>>,
}

impl ScriptedAdapter {
    pub fn new(script: Script) -> Arc<Self> {
        Self::with_batch_size(script, 10)
    }

    pub fn with_batch_size(script: Script, max_batch_size: usize) -> Arc<Self> {
        Arc::new(Self {
            script,
            max_batch_size,
            delivered: AtomicBool::new(false),
            receives: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
            acknowledged: Mutex::new(Vec::new()),
            extensions: Mutex::new(Vec::new()),
        })
    }

    pub fn receive_count(&self) -> usize {
        self.receives.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<usize> {
        self.requested.lock().clone()
    }

    pub fn acknowledged(&self) -> Vec<Message> {
        self.acknowledged.lock().clone()
    }

    pub fn extensions(&self) -> Vec<Extension> {
        self.extensions.lock().clone()
    }

    pub fn extend_count(&self) -> usize {
        self.extensions.lock().len()
    }

    fn message(&self, id: &str, call: usize) -> Message {
        Message::new(id, json!({ "call": call })).with_lease_token(format!("lease-{call}"))
    }
}

#[async_trait]
impl QueueAdapter for ScriptedAdapter {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<Message>, AdapterError> {
        let call = self.receives.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().push(max_messages);

        match &self.script {
            Script::Repeat(id) => Ok(vec![self.message(id, call)]),
            Script::Once(id) => {
                if self.delivered.swap(true, Ordering::SeqCst) {
                    Ok(Vec::new())
                } else {
                    Ok(vec![self.message(id, call)])
                }
            }
            Script::Empty => Ok(Vec::new()),
            Script::Fail => Err(AdapterError::Backend("connection refused".into())),
        }
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), AdapterError> {
        self.acknowledged.lock().push(message.clone());
        Ok(())
    }

    async fn extend_lease(&self, message: &Message, seconds: u64) -> Result<(), AdapterError> {
        self.extensions.lock().push(Extension {
            message_id: message.id.clone(),
            lease_token: message.lease_token.clone(),
            seconds,
            at: Instant::now(),
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ScriptedAdapter"
    }
}

/// Shared counter for callbacks
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
