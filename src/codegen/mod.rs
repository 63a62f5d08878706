//! Code generator: turns a [`BlockGraph`] into MicroPython statements.
//!
//! Generation is a pure function of the graph. The same graph always yields
//! byte-identical output, which the linker and the device bridge rely on for
//! content-addressed upload skipping.

pub mod blocks;
pub mod fragment;

use crate::blocks::{BlockGraph, BlockInstance, Binding, FieldValue, SocketKind, ValueType};
use fragment::{bool_literal, number_literal, string_literal, Fragment};
use std::collections::BTreeSet;

pub use fragment::Precedence;

/// Nesting (sockets inside sockets) followed before falling back to defaults.
pub const MAX_NESTING: usize = 64;

pub const INDENT: &str = "    ";

/// Modules a program imports beyond `board`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Import {
    Random,
    Time,
}

impl Import {
    pub fn module(self) -> &'static str {
        match self {
            Import::Random => "random",
            Import::Time => "time",
        }
    }
}

/// Stateful or shared helper definitions the linker places in the helper region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Helper {
    ToneFor,
    Shake,
}

impl Helper {
    pub fn imports(self) -> &'static [Import] {
        match self {
            Helper::ToneFor => &[Import::Time],
            Helper::Shake => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    pub imports: BTreeSet<Import>,
    pub helpers: BTreeSet<Helper>,
}

impl Requirements {
    pub fn import(&mut self, import: Import) {
        self.imports.insert(import);
    }

    pub fn helper(&mut self, helper: Helper) {
        self.helpers.insert(helper);
        self.imports.extend(helper.imports().iter().copied());
    }
}

/// Generator output: the user-authored statements plus what they need linked in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedCode {
    pub body: String,
    pub requirements: Requirements,
}

impl GeneratedCode {
    pub fn new(body: impl Into<String>, requirements: Requirements) -> Self {
        Self { body: body.into(), requirements }
    }
}

/// Generate the statements for every top-level chain of `graph`, in order.
pub fn generate(graph: &BlockGraph) -> GeneratedCode {
    let mut generator = Generator::default();
    let mut body = String::new();
    for root in &graph.blocks {
        body.push_str(&generator.chain(root));
    }
    tracing::debug!(
        "Generated {} bytes from {} top-level chains",
        body.len(),
        graph.blocks.len()
    );
    GeneratedCode { body, requirements: generator.requirements }
}

/// Walks the graph, collecting requirements as blocks are visited.
#[derive(Debug, Default)]
pub(crate) struct Generator {
    requirements: Requirements,
    depth: usize,
}

impl Generator {
    /// Statements of a chain in `next` order, unindented.
    fn chain(&mut self, first: &BlockInstance) -> String {
        let mut out = String::new();
        let mut cursor = Some(first);
        while let Some(block) = cursor {
            out.push_str(&self.statement(block));
            cursor = block.next.as_deref();
        }
        out
    }

    /// Run `f` one level deeper, or return `None` past [`MAX_NESTING`].
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> Option<T> {
        if self.depth >= MAX_NESTING {
            return None;
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        Some(result)
    }

    /// Indented body of a statement socket; `pass` when empty.
    fn body(&mut self, block: &BlockInstance, socket: &str) -> String {
        let code = match block.input(socket) {
            Some(Binding::Block(first)) if first.kind.is_statement() => {
                self.nested(|g| g.chain(first)).unwrap_or_else(|| {
                    tracing::warn!(
                        "Block {} nests deeper than {} levels; {} body replaced with pass",
                        block_id(block),
                        MAX_NESTING,
                        socket
                    );
                    String::new()
                })
            }
            Some(_) => {
                tracing::warn!("Block {} has a non-statement {} body; ignored", block_id(block), socket);
                String::new()
            }
            None => String::new(),
        };
        if code.trim().is_empty() {
            indent("pass\n")
        } else {
            indent(&code)
        }
    }

    /// Expression for a value socket: the bound child, a checked literal, or the socket default.
    fn input(&mut self, block: &BlockInstance, socket: &str) -> Fragment {
        let Some((check, default)) = value_socket(block, socket) else {
            debug_assert!(false, "{:?} has no value socket {}", block.kind, socket);
            return Fragment::atomic("None");
        };
        match block.input(socket) {
            None => Fragment::atomic(default),
            Some(Binding::Literal(v)) => self.literal(block, socket, check, default, v),
            Some(Binding::Block(child)) if child.kind.is_statement() => {
                tracing::warn!(
                    "Statement block {:?} plugged into {} of block {}; using default",
                    child.kind,
                    socket,
                    block_id(block)
                );
                Fragment::atomic(default)
            }
            Some(Binding::Block(child)) => self.nested(|g| g.value(child)).unwrap_or_else(|| {
                tracing::warn!(
                    "Block {} nests deeper than {} levels; {} uses its default",
                    block_id(block),
                    MAX_NESTING,
                    socket
                );
                Fragment::atomic(default)
            }),
        }
    }

    fn literal(
        &mut self,
        block: &BlockInstance,
        socket: &str,
        check: ValueType,
        default: &'static str,
        v: &FieldValue,
    ) -> Fragment {
        match (check, v) {
            (ValueType::Number, _) | (ValueType::Any, FieldValue::Number(_)) => {
                match v.as_number().filter(|n| blocks::literal_in_range(block.kind, socket, *n)) {
                    Some(n) => number_literal(n),
                    None => {
                        tracing::warn!(
                            "Block {} {} literal {:?} out of range; using default {}",
                            block_id(block),
                            socket,
                            v,
                            default
                        );
                        Fragment::atomic(default)
                    }
                }
            }
            (ValueType::Boolean, FieldValue::Bool(b)) | (ValueType::Any, FieldValue::Bool(b)) => {
                bool_literal(*b)
            }
            (ValueType::Boolean, FieldValue::Text(t)) if t.eq_ignore_ascii_case("true") => bool_literal(true),
            (ValueType::Boolean, FieldValue::Text(t)) if t.eq_ignore_ascii_case("false") => bool_literal(false),
            (ValueType::Boolean, _) => {
                tracing::warn!("Block {} {} expects a boolean; using default", block_id(block), socket);
                Fragment::atomic(default)
            }
            (ValueType::Text, _) | (ValueType::Any, FieldValue::Text(_)) => string_literal(&v.as_text()),
        }
    }

    /// Dropdown field value, falling back to the documented default.
    fn choice(&self, block: &BlockInstance, name: &str) -> &'static str {
        let Some(spec) = block.kind.definition().field(name) else {
            debug_assert!(false, "{:?} has no field {}", block.kind, name);
            return "";
        };
        match block.field(name) {
            None => spec.default,
            Some(value) => {
                let text = value.as_text();
                match spec.choices.iter().find(|c| c.eq_ignore_ascii_case(text.trim())) {
                    Some(choice) => choice,
                    None => {
                        tracing::warn!(
                            "Block {} field {} has unknown value {:?}; using {}",
                            block_id(block),
                            name,
                            text,
                            spec.default
                        );
                        spec.default
                    }
                }
            }
        }
    }
}

fn value_socket(block: &BlockInstance, socket: &str) -> Option<(ValueType, &'static str)> {
    match block.kind.definition().socket(socket)?.kind {
        SocketKind::Value { check, default } => Some((check, default)),
        SocketKind::Statements => None,
    }
}

fn block_id(block: &BlockInstance) -> &str {
    block.id.as_deref().unwrap_or("<unnamed>")
}

/// Prefix every line with one indentation level.
pub fn indent(code: &str) -> String {
    let mut out = String::with_capacity(code.len() + 16);
    for line in code.lines() {
        if !line.is_empty() {
            out.push_str(INDENT);
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}
