//! Script dispatch seam.
//!
//! The core invokes named entity methods (`onStartSeeing`, `onTimer`, ...) through
//! [`ScriptDispatch`]. Scripts never touch core state directly; anything they want changed
//! comes back as [`ScriptRequest`]s that the caller applies to the same entity immediately
//! after the callback returns, which is where vision detects cancellation.

use crate::error::CellError;
use crate::math::Vec3;
use crate::{EntityId, SpaceId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScriptArg {
    /// A locally resolvable entity.
    Entity(EntityId),
    /// An id that cannot be resolved on this process.
    Id(EntityId),
    Int(i64),
    Value(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptCall {
    pub entity: EntityId,
    pub method: String,
    pub args: Vec<ScriptArg>,
}

impl ScriptCall {
    #[must_use]
    pub fn new(entity: EntityId, method: &str, args: Vec<ScriptArg>) -> Self {
        Self {
            entity,
            method: method.to_owned(),
            args,
        }
    }
}

/// Follow-up work a callback asks for on the entity it was invoked on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScriptRequest {
    DetachVision,
    SetVisionRange {
        half_angle: f32,
        range: f32,
        seeing_height: f32,
    },
    SetProperty {
        name: String,
        value: serde_json::Value,
    },
    Teleport {
        space: SpaceId,
        position: Vec3,
    },
    Destroy,
}

pub trait ScriptDispatch: Send {
    /// Fire-and-forget invocation; errors are logged by the caller and never propagated.
    fn callback(&mut self, call: &ScriptCall) -> Result<Vec<ScriptRequest>, CellError>;
}

/// Dispatcher for processes with no scripting attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScript;

impl ScriptDispatch for NullScript {
    fn callback(&mut self, _call: &ScriptCall) -> Result<Vec<ScriptRequest>, CellError> {
        Ok(Vec::new())
    }
}

/// Records every call and answers with canned requests per method name.
#[derive(Debug, Default, Clone)]
pub struct RecordingScript {
    calls: Arc<Mutex<Vec<ScriptCall>>>,
    reactions: HashMap<String, Vec<ScriptRequest>>,
    failing: Vec<String>,
}

impl RecordingScript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the call log; stays valid after the script is boxed into a process.
    #[must_use]
    pub fn calls(&self) -> Arc<Mutex<Vec<ScriptCall>>> {
        Arc::clone(&self.calls)
    }

    /// Answer every call of `method` with `requests`.
    #[must_use]
    pub fn react(mut self, method: &str, requests: Vec<ScriptRequest>) -> Self {
        self.reactions.insert(method.to_owned(), requests);
        self
    }

    /// Make every call of `method` fail after being recorded.
    #[must_use]
    pub fn fail_on(mut self, method: &str) -> Self {
        self.failing.push(method.to_owned());
        self
    }
}

impl ScriptDispatch for RecordingScript {
    fn callback(&mut self, call: &ScriptCall) -> Result<Vec<ScriptRequest>, CellError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());
        if self.failing.iter().any(|m| *m == call.method) {
            return Err(CellError::Script(format!("{} raised", call.method)));
        }
        Ok(self.reactions.get(&call.method).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_script_logs_and_reacts() {
        let mut script = RecordingScript::new()
            .react("onStartSeeing", vec![ScriptRequest::DetachVision])
            .fail_on("onTimer");
        let log = script.calls();
        let seen = ScriptCall::new(
            EntityId(1),
            "onStartSeeing",
            vec![ScriptArg::Entity(EntityId(2))],
        );
        assert_eq!(
            script.callback(&seen).expect("callback"),
            vec![ScriptRequest::DetachVision]
        );
        assert!(
            script
                .callback(&ScriptCall::new(EntityId(1), "onTimer", Vec::new()))
                .is_err()
        );
        assert_eq!(log.lock().expect("log").len(), 2);
    }
}
