//! Schedule trace: a serializable, replayable log of schedule primitive
//! invocations.
//!
//! A [`ScheduleDesc`] records every primitive applied to a schedule as a
//! [`Step`]: the registered kind name, named handle inputs, named attribute
//! values, and the handles the primitive produced. Handles are only meaningful
//! inside one schedule instance, so the persisted form never stores raw handle
//! identity — each input is encoded positionally as "output j of step i", and
//! replay re-threads freshly produced handles through the same positions.
//!
//! Replay is not transactional: the first failing step aborts the replay and
//! leaves the schedule partially mutated. Callers must discard the schedule on
//! any replay error and restart from a fresh copy.

pub mod registry;

use crate::ir::module::NodeId;
use crate::ir::schedule::IrSchedule;
use crate::utils::errors::{ScheduleError, TraceError};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A non-handle operation parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    /// Boolean flag
    Bool(bool),
    /// Integer scalar
    Int(i64),
    /// Float scalar
    Float(f64),
    /// String label (memory type, thread axis, block name, ...)
    Str(String),
    /// Ordered integer list (split factors, loop indices, ...)
    Ints(Vec<i64>),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{}", v),
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Float(v) => write!(f, "{:?}", v),
            AttrValue::Str(v) => write!(f, "\"{}\"", v),
            AttrValue::Ints(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::Ints(v)
    }
}

/// A handle-valued operation parameter: one handle or an ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleInput {
    /// A single node handle
    Single(NodeId),
    /// An ordered list of node handles
    List(Vec<NodeId>),
}

impl HandleInput {
    /// The handles in this input, in order.
    pub fn handles(&self) -> Vec<NodeId> {
        match self {
            HandleInput::Single(h) => vec![*h],
            HandleInput::List(hs) => hs.clone(),
        }
    }
}

/// Named handle inputs of one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInputs(pub BTreeMap<String, HandleInput>);

impl StepInputs {
    /// Fetch a required single-handle parameter.
    pub fn single(&self, name: &str) -> Result<NodeId, ScheduleError> {
        match self.0.get(name) {
            Some(HandleInput::Single(h)) => Ok(*h),
            Some(HandleInput::List(_)) => Err(ScheduleError::ParameterType(name.to_string())),
            None => Err(ScheduleError::MissingParameter(name.to_string())),
        }
    }

    /// Fetch a required handle-list parameter.
    pub fn list(&self, name: &str) -> Result<Vec<NodeId>, ScheduleError> {
        match self.0.get(name) {
            Some(HandleInput::List(hs)) => Ok(hs.clone()),
            Some(HandleInput::Single(h)) => Ok(vec![*h]),
            None => Err(ScheduleError::MissingParameter(name.to_string())),
        }
    }
}

/// Named attribute values of one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepAttrs(pub BTreeMap<String, AttrValue>);

impl StepAttrs {
    /// Fetch a required integer attribute.
    pub fn int(&self, name: &str) -> Result<i64, ScheduleError> {
        match self.0.get(name) {
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(_) => Err(ScheduleError::ParameterType(name.to_string())),
            None => Err(ScheduleError::MissingParameter(name.to_string())),
        }
    }

    /// Fetch a required boolean attribute.
    pub fn boolean(&self, name: &str) -> Result<bool, ScheduleError> {
        match self.0.get(name) {
            Some(AttrValue::Bool(v)) => Ok(*v),
            Some(_) => Err(ScheduleError::ParameterType(name.to_string())),
            None => Err(ScheduleError::MissingParameter(name.to_string())),
        }
    }

    /// Fetch a required string attribute.
    pub fn string(&self, name: &str) -> Result<String, ScheduleError> {
        match self.0.get(name) {
            Some(AttrValue::Str(v)) => Ok(v.clone()),
            Some(_) => Err(ScheduleError::ParameterType(name.to_string())),
            None => Err(ScheduleError::MissingParameter(name.to_string())),
        }
    }

    /// Fetch a required integer-list attribute.
    pub fn ints(&self, name: &str) -> Result<Vec<i64>, ScheduleError> {
        match self.0.get(name) {
            Some(AttrValue::Ints(v)) => Ok(v.clone()),
            Some(_) => Err(ScheduleError::ParameterType(name.to_string())),
            None => Err(ScheduleError::MissingParameter(name.to_string())),
        }
    }

    /// Fetch an arbitrary attribute value.
    pub fn value(&self, name: &str) -> Result<AttrValue, ScheduleError> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| ScheduleError::MissingParameter(name.to_string()))
    }
}

/// One recorded primitive invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Registered operation kind name
    pub kind: String,
    /// Handle-valued parameters
    pub inputs: StepInputs,
    /// Non-handle parameters
    pub attrs: StepAttrs,
    /// Handles the invocation produced (possibly empty)
    pub outputs: Vec<NodeId>,
}

impl Step {
    /// Start building a step of the given kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            inputs: StepInputs::default(),
            attrs: StepAttrs::default(),
            outputs: Vec::new(),
        }
    }

    /// Add a single-handle input.
    pub fn input(mut self, name: impl Into<String>, handle: NodeId) -> Self {
        self.inputs
            .0
            .insert(name.into(), HandleInput::Single(handle));
        self
    }

    /// Add a handle-list input.
    pub fn input_list(mut self, name: impl Into<String>, handles: &[NodeId]) -> Self {
        self.inputs
            .0
            .insert(name.into(), HandleInput::List(handles.to_vec()));
        self
    }

    /// Add an attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.0.insert(name.into(), value.into());
        self
    }

    /// Record the produced handles.
    pub fn outputs(mut self, outputs: Vec<NodeId>) -> Self {
        self.outputs = outputs;
        self
    }
}

/// Positional reference to one output of an earlier step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    /// Index of the producing step
    pub step: usize,
    /// Index into that step's output list
    pub output: usize,
}

/// Persisted form of a handle input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputProto {
    /// Single handle
    Single(OutputRef),
    /// Ordered handle list
    List(Vec<OutputRef>),
}

/// Persisted form of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProto {
    /// Operation kind name
    pub kind: String,
    /// Handle inputs, positionally encoded
    pub inputs: BTreeMap<String, InputProto>,
    /// Attribute values
    pub attrs: BTreeMap<String, AttrValue>,
    /// How many handles the step produced (sizes replay threading; carries no
    /// identity)
    pub num_outputs: usize,
}

/// Persisted form of a whole trace. This is the only durable artifact of the
/// engine and must stay byte-stable for a given engine version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TraceProto {
    /// Steps in append order
    pub steps: Vec<StepProto>,
}

/// An ordered, append-only log of schedule primitive invocations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleDesc {
    steps: Vec<Step>,
}

impl ScheduleDesc {
    /// An empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step. The only well-formedness requirement is a non-empty
    /// kind name; kind existence is checked at replay time.
    pub fn append(&mut self, step: Step) {
        debug_assert!(!step.kind.is_empty(), "step kind must be non-empty");
        self.steps.push(step);
    }

    /// The recorded steps in append order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no step has been recorded.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Replay the trace against a schedule, returning the handles produced by
    /// the last step.
    ///
    /// Recorded handles belong to the schedule the trace was captured on;
    /// each step's inputs are resolved against the outputs earlier steps
    /// produced *in this replay*. On error the schedule is left partially
    /// mutated and must be discarded.
    pub fn replay(&self, sched: &mut IrSchedule) -> Result<Vec<NodeId>, TraceError> {
        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        let mut last = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            let mut inputs = StepInputs::default();
            for (name, input) in &step.inputs.0 {
                let resolved = match input {
                    HandleInput::Single(h) => HandleInput::Single(Self::resolve(
                        &remap, *h, i, name,
                    )?),
                    HandleInput::List(hs) => HandleInput::List(
                        hs.iter()
                            .map(|h| Self::resolve(&remap, *h, i, name))
                            .collect::<Result<_, _>>()?,
                    ),
                };
                inputs.0.insert(name.clone(), resolved);
            }
            let outputs = registry::global().invoke(&step.kind, &inputs, &step.attrs, sched)?;
            if outputs.len() != step.outputs.len() {
                warn!(
                    "step {} ({}) produced {} outputs, {} recorded",
                    i,
                    step.kind,
                    outputs.len(),
                    step.outputs.len()
                );
            }
            for (old, new) in step.outputs.iter().zip(outputs.iter()) {
                remap.insert(*old, *new);
            }
            last = outputs;
        }
        Ok(last)
    }

    fn resolve(
        remap: &HashMap<NodeId, NodeId>,
        handle: NodeId,
        step: usize,
        param: &str,
    ) -> Result<NodeId, TraceError> {
        remap
            .get(&handle)
            .copied()
            .ok_or_else(|| TraceError::UnresolvedHandle {
                step,
                param: param.to_string(),
            })
    }

    /// Encode the trace into its persisted form. Every input handle must have
    /// been produced by a strictly earlier step.
    pub fn to_proto(&self) -> Result<TraceProto, TraceError> {
        // Maps each handle to the latest position that produced it.
        let mut producers: HashMap<NodeId, OutputRef> = HashMap::new();
        let mut steps = Vec::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            let mut inputs = BTreeMap::new();
            for (name, input) in &step.inputs.0 {
                let encode = |h: &NodeId| {
                    producers
                        .get(h)
                        .copied()
                        .ok_or_else(|| TraceError::UnresolvedHandle {
                            step: i,
                            param: name.clone(),
                        })
                };
                let proto = match input {
                    HandleInput::Single(h) => InputProto::Single(encode(h)?),
                    HandleInput::List(hs) => {
                        InputProto::List(hs.iter().map(encode).collect::<Result<_, _>>()?)
                    }
                };
                inputs.insert(name.clone(), proto);
            }
            steps.push(StepProto {
                kind: step.kind.clone(),
                inputs,
                attrs: step.attrs.0.clone(),
                num_outputs: step.outputs.len(),
            });
            for (j, h) in step.outputs.iter().enumerate() {
                producers.insert(*h, OutputRef { step: i, output: j });
            }
        }
        Ok(TraceProto { steps })
    }

    /// Decode a persisted trace. The reconstructed steps carry synthetic
    /// handles that preserve the positional structure; they are never
    /// dereferenced, only re-threaded during replay.
    pub fn from_proto(proto: &TraceProto) -> Result<Self, TraceError> {
        let mut outputs_per_step: Vec<Vec<NodeId>> = Vec::with_capacity(proto.steps.len());
        let mut next_handle = 0u32;
        let mut steps = Vec::with_capacity(proto.steps.len());
        for (i, sp) in proto.steps.iter().enumerate() {
            let mut inputs = StepInputs::default();
            for (name, input) in &sp.inputs {
                let decode = |r: &OutputRef| -> Result<NodeId, TraceError> {
                    if r.step >= i {
                        return Err(TraceError::CorruptTrace(format!(
                            "step {} references step {} which is not earlier",
                            i, r.step
                        )));
                    }
                    outputs_per_step[r.step].get(r.output).copied().ok_or_else(|| {
                        TraceError::CorruptTrace(format!(
                            "step {} references output {} of step {} which has {} outputs",
                            i,
                            r.output,
                            r.step,
                            outputs_per_step[r.step].len()
                        ))
                    })
                };
                let resolved = match input {
                    InputProto::Single(r) => HandleInput::Single(decode(r)?),
                    InputProto::List(rs) => HandleInput::List(
                        rs.iter().map(decode).collect::<Result<_, _>>()?,
                    ),
                };
                inputs.0.insert(name.clone(), resolved);
            }
            let outputs: Vec<NodeId> = (0..sp.num_outputs)
                .map(|_| {
                    let h = NodeId(next_handle);
                    next_handle += 1;
                    h
                })
                .collect();
            outputs_per_step.push(outputs.clone());
            steps.push(Step {
                kind: sp.kind.clone(),
                inputs,
                attrs: StepAttrs(sp.attrs.clone()),
                outputs,
            });
        }
        Ok(Self { steps })
    }

    /// Serialize to bytes (JSON encoding of the positional form).
    pub fn to_bytes(&self) -> Result<Vec<u8>, TraceError> {
        let proto = self.to_proto()?;
        serde_json::to_vec_pretty(&proto)
            .map_err(|e| TraceError::CorruptTrace(format!("encode failed: {}", e)))
    }

    /// Deserialize from bytes produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TraceError> {
        let proto: TraceProto = serde_json::from_slice(bytes)
            .map_err(|e| TraceError::CorruptTrace(format!("decode failed: {}", e)))?;
        Self::from_proto(&proto)
    }

    /// Replay a persisted trace against a schedule, returning the handles
    /// produced by the last step.
    pub fn replay_proto(
        proto: &TraceProto,
        sched: &mut IrSchedule,
    ) -> Result<Vec<NodeId>, TraceError> {
        Self::from_proto(proto)?.replay(sched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_value_round_trip() {
        let values = vec![
            AttrValue::Bool(true),
            AttrValue::Int(-7),
            AttrValue::Float(1.5),
            AttrValue::Str("local".to_string()),
            AttrValue::Ints(vec![4, -1]),
        ];
        for v in values {
            let bytes = serde_json::to_vec(&v).unwrap();
            let back: AttrValue = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(v, back);
        }
    }

    #[test]
    fn test_proto_round_trip_positional_structure() {
        let a = NodeId(100);
        let b = NodeId(101);
        let c = NodeId(102);
        let mut trace = ScheduleDesc::new();
        trace.append(
            Step::new("GetBlock")
                .attr("block_name", "B")
                .outputs(vec![a]),
        );
        trace.append(Step::new("GetLoops").input("block", a).outputs(vec![b, c]));
        trace.append(
            Step::new("Split")
                .input_list("loop", &[b])
                .attr("factors", vec![4i64, -1])
                .outputs(vec![]),
        );

        let proto = trace.to_proto().unwrap();
        assert_eq!(proto.steps.len(), 3);
        assert_eq!(
            proto.steps[1].inputs.get("block"),
            Some(&InputProto::Single(OutputRef { step: 0, output: 0 }))
        );
        assert_eq!(
            proto.steps[2].inputs.get("loop"),
            Some(&InputProto::List(vec![OutputRef { step: 1, output: 0 }]))
        );

        // Decoding preserves structure; synthetic handles re-thread the same
        // positions.
        let decoded = ScheduleDesc::from_proto(&proto).unwrap();
        assert_eq!(decoded.to_proto().unwrap(), proto);
    }

    #[test]
    fn test_unresolved_handle_fails_serialization() {
        let mut trace = ScheduleDesc::new();
        trace.append(Step::new("GetLoops").input("block", NodeId(9)).outputs(vec![]));
        let err = trace.to_proto().unwrap_err();
        assert!(matches!(err, TraceError::UnresolvedHandle { step: 0, .. }));
    }

    #[test]
    fn test_corrupt_bytes() {
        let err = ScheduleDesc::from_bytes(b"{not json").unwrap_err();
        assert!(matches!(err, TraceError::CorruptTrace(_)));

        // Structurally valid JSON with an out-of-range output reference.
        let json = br#"{"steps":[
            {"kind":"GetBlock","inputs":{},"attrs":{},"num_outputs":1},
            {"kind":"GetLoops","inputs":{"block":{"Single":{"step":0,"output":5}}},"attrs":{},"num_outputs":0}
        ]}"#;
        let err = ScheduleDesc::from_bytes(json).unwrap_err();
        assert!(matches!(err, TraceError::CorruptTrace(_)));
    }

    #[test]
    fn test_forward_reference_is_corrupt() {
        let json = br#"{"steps":[
            {"kind":"GetLoops","inputs":{"block":{"Single":{"step":0,"output":0}}},"attrs":{},"num_outputs":0}
        ]}"#;
        let err = ScheduleDesc::from_bytes(json).unwrap_err();
        assert!(matches!(err, TraceError::CorruptTrace(_)));
    }
}
