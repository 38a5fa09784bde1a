//! Scripted transport for unit tests

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::transport::{CommandTransport, Reply, TransportError};

type Scripted = Result<Reply, TransportError>;

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Scripted>>,
    fallback: HashMap<String, Scripted>,
    delays: HashMap<String, Duration>,
    gates: HashMap<String, Arc<Semaphore>>,
    calls: HashMap<String, Vec<Value>>,
}

/// Transport whose replies are set per command by the test
#[derive(Default)]
pub struct StubTransport {
    script: Mutex<Script>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply used whenever nothing is queued for `command`
    pub fn reply(&self, command: &str, reply: Result<Value, TransportError>) {
        self.script
            .lock()
            .unwrap()
            .fallback
            .insert(command.to_string(), reply.map(Some));
    }

    /// Reply with no body at all
    pub fn empty(&self, command: &str) {
        self.script
            .lock()
            .unwrap()
            .fallback
            .insert(command.to_string(), Ok(None));
    }

    /// One-shot reply, consumed before the fallback
    pub fn push(&self, command: &str, reply: Result<Value, TransportError>) {
        self.script
            .lock()
            .unwrap()
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(reply.map(Some));
    }

    pub fn delay(&self, command: &str, delay: Duration) {
        self.script
            .lock()
            .unwrap()
            .delays
            .insert(command.to_string(), delay);
    }

    /// Block `command` until [`StubTransport::release`] is called
    pub fn hold(&self, command: &str) {
        self.script
            .lock()
            .unwrap()
            .gates
            .insert(command.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, command: &str) {
        if let Some(gate) = self.script.lock().unwrap().gates.get(command) {
            gate.add_permits(1);
        }
    }

    pub fn calls(&self, command: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .get(command)
            .map_or(0, Vec::len)
    }

    pub fn last_args(&self, command: &str) -> Option<Value> {
        self.script
            .lock()
            .unwrap()
            .calls
            .get(command)
            .and_then(|args| args.last().cloned())
    }
}

#[async_trait]
impl CommandTransport for StubTransport {
    async fn invoke(&self, command: &str, args: Value) -> Result<Reply, TransportError> {
        let (delay, gate) = {
            let mut script = self.script.lock().unwrap();
            script
                .calls
                .entry(command.to_string())
                .or_default()
                .push(args);
            (
                script.delays.get(command).copied(),
                script.gates.get(command).cloned(),
            )
        };

        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock().unwrap();
        if let Some(reply) = script.queued.get_mut(command).and_then(VecDeque::pop_front) {
            return reply;
        }
        script
            .fallback
            .get(command)
            .cloned()
            .unwrap_or_else(|| Err(TransportError::Unavailable(format!("no reply scripted for {}", command))))
    }
}
