//! Wire codec for the sampler's private `tracestate` entry.
//!
//! The entry value is a `;` separated list of sub-entries:
//!
//! ```text
//! w:<result>:<path>:<parent path>   workflow bookkeeping, paths in hex
//! s:<strategy>[:<args>]             strategy that sampled the current hop
//! r:<strategy>                      strategy that sampled the trace root
//! ```
//!
//! Sub-entries at their default value are omitted. Sub-entries with an unknown
//! prefix are kept verbatim so newer peers can add fields without breaking
//! older ones. A malformed field of a known sub-entry is ignored on its own,
//! the rest of the value is still parsed.
use crate::strategy::Strategy;
use opentelemetry::otel_debug;
use opentelemetry::trace::TraceState as OtelTraceState;
use std::fmt::{self, Write as _};

/// Vendor key of the sampler entry in the W3C `tracestate` header.
pub const TRACE_STATE_KEY: &str = "as";

const ENTRY_SEPARATOR: char = ';';
const FIELD_SEPARATOR: char = ':';

/// Outcome of the workflow path sampler for one hop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WorkflowResult {
    /// The workflow sampler did not run for this hop.
    #[default]
    NotExist = 0,
    /// The edge was already seen, or the insertion budget was exhausted.
    Drop = 1,
    /// The hop was kept because its caller discovered the edge.
    Sample = 2,
    /// The upstream hop used the legacy protocol and was sampled.
    RandomLegacy = 3,
    /// The hop discovered a new edge.
    Path = 4,
}

impl WorkflowResult {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(WorkflowResult::NotExist),
            1 => Some(WorkflowResult::Drop),
            2 => Some(WorkflowResult::Sample),
            3 => Some(WorkflowResult::RandomLegacy),
            4 => Some(WorkflowResult::Path),
            _ => None,
        }
    }

    /// Attribute friendly name.
    pub fn name(self) -> &'static str {
        match self {
            WorkflowResult::NotExist => "not_exist",
            WorkflowResult::Drop => "drop",
            WorkflowResult::Sample => "sample",
            WorkflowResult::RandomLegacy => "random_legacy",
            WorkflowResult::Path => "path",
        }
    }
}

/// Workflow bookkeeping carried from hop to hop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct WorkflowState {
    /// What the workflow sampler decided for the hop that wrote this state.
    pub result: WorkflowResult,
    /// Id of the current call-graph node, `0` when unknown.
    pub path: u64,
    /// Id of the caller's call-graph node, `0` when unknown.
    pub parent_path: u64,
}

impl WorkflowState {
    fn is_default(&self) -> bool {
        *self == WorkflowState::default()
    }
}

/// Sampling lineage of a trace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SampleState {
    /// Strategy that decided the current hop.
    pub sampled_strategy: Strategy,
    /// Strategy that decided the root of the trace. Descendants keep it
    /// verbatim unless the lineage is explicitly reset.
    pub root_strategy: Strategy,
    args: Option<String>,
}

impl Default for SampleState {
    fn default() -> Self {
        SampleState {
            sampled_strategy: Strategy::NotExist,
            root_strategy: Strategy::NotExist,
            args: None,
        }
    }
}

impl SampleState {
    /// Optional free-form argument attached to the hop strategy.
    pub fn args(&self) -> Option<&str> {
        self.args.as_deref()
    }
}

/// A single sub-entry borrowed from an encoded value.
///
/// Fields that failed to parse are `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry<'a> {
    /// `w:<result>:<path>:<parent path>`
    Workflow {
        /// Workflow result.
        result: Option<WorkflowResult>,
        /// Current node id.
        path: Option<u64>,
        /// Caller node id.
        parent_path: Option<u64>,
    },
    /// `s:<strategy>[:<args>]`
    Sample {
        /// Hop strategy.
        strategy: Option<Strategy>,
        /// Strategy arguments.
        args: Option<&'a str>,
    },
    /// `r:<strategy>`
    Root(Option<Strategy>),
    /// Anything else, kept verbatim.
    Unknown(&'a str),
}

/// Iterator over the sub-entries of an encoded value. See [`entries`].
#[derive(Clone, Debug)]
pub struct Entries<'a> {
    rest: &'a str,
}

/// Scans an encoded value without allocating.
pub fn entries(value: &str) -> Entries<'_> {
    Entries { rest: value }
}

impl<'a> Iterator for Entries<'a> {
    type Item = Entry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.rest.is_empty() {
                return None;
            }
            let raw = match self.rest.find(ENTRY_SEPARATOR) {
                Some(idx) => {
                    let raw = &self.rest[..idx];
                    self.rest = &self.rest[idx + 1..];
                    raw
                }
                None => std::mem::take(&mut self.rest),
            };
            if !raw.is_empty() {
                return Some(parse_entry(raw));
            }
        }
    }
}

fn parse_entry(raw: &str) -> Entry<'_> {
    let (prefix, body) = match raw.split_once(FIELD_SEPARATOR) {
        Some(parts) => parts,
        None => return Entry::Unknown(raw),
    };
    match prefix {
        "w" => {
            let mut fields = body.splitn(3, FIELD_SEPARATOR);
            let result = fields
                .next()
                .and_then(|v| v.parse::<u8>().ok())
                .and_then(WorkflowResult::from_u8);
            let path = fields.next().and_then(parse_hex);
            let parent_path = fields.next().and_then(parse_hex);
            Entry::Workflow {
                result,
                path,
                parent_path,
            }
        }
        "s" => {
            let (strategy, args) = match body.split_once(FIELD_SEPARATOR) {
                Some((strategy, args)) => (strategy, Some(args).filter(|a| !a.is_empty())),
                None => (body, None),
            };
            Entry::Sample {
                strategy: parse_strategy(strategy),
                args,
            }
        }
        "r" => Entry::Root(parse_strategy(body)),
        _ => Entry::Unknown(raw),
    }
}

fn parse_hex(value: &str) -> Option<u64> {
    if value.is_empty() || value.len() > 16 {
        return None;
    }
    u64::from_str_radix(value, 16).ok()
}

fn parse_strategy(value: &str) -> Option<Strategy> {
    value.parse::<i8>().ok().and_then(Strategy::from_i8)
}

fn valid_args(args: &str) -> bool {
    !args.is_empty()
        && args.len() <= 64
        && args
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b';' && b != b',' && b != b'=')
}

/// The sampler's per-hop state, owned and mutable.
///
/// It is parsed from the parent's wire value at ingress, updated by the
/// sampling stages, and encoded again at egress.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceState {
    /// Workflow bookkeeping.
    pub workflow: WorkflowState,
    /// Sampling lineage.
    pub sample: SampleState,
    unknown: Option<String>,
}

impl TraceState {
    /// Parses an encoded value.
    ///
    /// An empty value means the upstream hop uses an older protocol: both
    /// strategies are [`Strategy::NotExist`], so callers fall back to the
    /// legacy sampled flag. In a non-empty value, absent strategies default to
    /// [`Strategy::NotMatch`].
    pub fn parse(value: &str) -> Self {
        let mut state = TraceState::default();
        if value.is_empty() {
            return state;
        }
        state.sample.sampled_strategy = Strategy::NotMatch;
        state.sample.root_strategy = Strategy::NotMatch;

        for entry in entries(value) {
            match entry {
                Entry::Workflow {
                    result,
                    path,
                    parent_path,
                } => {
                    if let Some(result) = result {
                        state.workflow.result = result;
                    }
                    if let Some(path) = path {
                        state.workflow.path = path;
                    }
                    if let Some(parent_path) = parent_path {
                        state.workflow.parent_path = parent_path;
                    }
                }
                Entry::Sample { strategy, args } => {
                    if let Some(strategy) = strategy {
                        state.sample.sampled_strategy = strategy;
                    }
                    state.sample.args = args.filter(|a| valid_args(a)).map(str::to_owned);
                }
                Entry::Root(Some(strategy)) => state.sample.root_strategy = strategy,
                Entry::Root(None) => {}
                Entry::Unknown(raw) => {
                    let unknown = state.unknown.get_or_insert_with(String::new);
                    if !unknown.is_empty() {
                        unknown.push(ENTRY_SEPARATOR);
                    }
                    unknown.push_str(raw);
                }
            }
        }
        state
    }

    /// Reads the sampler entry out of a W3C trace state.
    pub fn from_otel(trace_state: &OtelTraceState) -> Self {
        TraceState::parse(trace_state.get(TRACE_STATE_KEY).unwrap_or(""))
    }

    /// Returns `true` when the upstream hop carried no sampler state.
    pub fn is_legacy(&self) -> bool {
        self.sample.sampled_strategy == Strategy::NotExist
    }

    /// Sets the strategy arguments. Arguments that can not be carried in a
    /// `tracestate` value are discarded.
    pub fn set_args(&mut self, args: Option<&str>) {
        self.sample.args = args.filter(|a| valid_args(a)).map(str::to_owned);
    }

    /// Unknown sub-entries, verbatim and `;` separated.
    pub fn unknown(&self) -> Option<&str> {
        self.unknown.as_deref()
    }

    /// Breaks the sampling lineage so downstream hops act as a new root.
    pub fn reset_lineage(&mut self) {
        self.sample.sampled_strategy = Strategy::NotMatch;
        self.sample.root_strategy = Strategy::NotMatch;
        self.sample.args = None;
    }

    /// Encodes the state. This is the exact inverse of [`TraceState::parse`].
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(32);
        // infallible, writing into a String
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) -> fmt::Result {
        let sample = &self.sample;
        if self.workflow.is_default()
            && self.unknown.is_none()
            && sample.args.is_none()
            && sample.sampled_strategy == Strategy::NotExist
            && sample.root_strategy == Strategy::NotExist
        {
            return Ok(());
        }

        let mut sep = "";
        if !self.workflow.is_default() {
            write!(
                out,
                "w:{}:{:x}:{:x}",
                self.workflow.result as u8, self.workflow.path, self.workflow.parent_path
            )?;
            sep = ";";
        }
        if sample.sampled_strategy != Strategy::NotMatch || sample.args.is_some() {
            write!(out, "{sep}s:{}", sample.sampled_strategy.as_i8())?;
            if let Some(args) = &sample.args {
                write!(out, ":{args}")?;
            }
            sep = ";";
        }
        if sample.root_strategy != Strategy::NotMatch {
            write!(out, "{sep}r:{}", sample.root_strategy.as_i8())?;
            sep = ";";
        }
        if let Some(unknown) = &self.unknown {
            write!(out, "{sep}{unknown}")?;
            sep = ";";
        }
        if sep.is_empty() {
            // every field is at its default, but the peer does speak the
            // protocol, which an empty value would deny
            out.push_str("s:0");
        }
        Ok(())
    }

    /// The state as it should leave this process.
    ///
    /// When the only known reason for sampling is [`Strategy::Follow`] the
    /// original root reason is lost, so the root is marked with the generic
    /// [`Strategy::Match`].
    pub fn to_egress(&self) -> TraceState {
        let mut egress = self.clone();
        let sample = &mut egress.sample;
        if sample.root_strategy == Strategy::Follow
            || (sample.sampled_strategy == Strategy::Follow && !sample.root_strategy.is_sampled())
        {
            sample.root_strategy = Strategy::Match;
        }
        egress
    }

    /// Writes the egress form of this state into `trace_state`, keeping the
    /// entries of other vendors.
    pub fn apply_to(&self, trace_state: &OtelTraceState) -> OtelTraceState {
        let value = self.to_egress().encode();
        let updated = if value.is_empty() {
            trace_state.delete(TRACE_STATE_KEY)
        } else {
            trace_state.insert(TRACE_STATE_KEY, value)
        };
        updated.unwrap_or_else(|err| {
            otel_debug!(
                name: "AdaptiveSampler.TraceStateRejected",
                error = format!("{:?}", err)
            );
            trace_state.clone()
        })
    }
}

impl fmt::Display for TraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
