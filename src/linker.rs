// src/linker.rs - Wraps generated statements into a standalone device program
use crate::blocks::{BlockGraph, GraphError};
use crate::codegen::{self, GeneratedCode, Helper};
use sha2::{Digest, Sha256};
use std::ops::Range;

pub const HELPERS_BEGIN: &str = "# ==== BEGIN HELPERS ====";
pub const HELPERS_END: &str = "# ==== END HELPERS ====";
pub const USER_CODE_BEGIN: &str = "# ==== BEGIN USER CODE ====";
pub const USER_CODE_END: &str = "# ==== END USER CODE ====";

/// Summed absolute accelerometer delta (in g) that counts as a shake.
pub const SHAKE_THRESHOLD: f64 = 1.5;

const TICK_LOOP: &str = "while True:\n    board.tick()\n";

const TONE_FOR_HELPER: &str = "\
def play_tone_for(freq, ms):
    board.speaker.tone(freq)
    time.sleep_ms(ms)
    board.speaker.off()
";

fn shake_helper() -> String {
    format!(
        "\
SHAKE_THRESHOLD = {threshold}


class ShakeState:
    def __init__(self):
        self.last = None


def shake_happened(state):
    sample = board.accel()
    last = state.last
    state.last = sample
    if last is None:
        return False
    delta = abs(sample[0] - last[0]) + abs(sample[1] - last[1]) + abs(sample[2] - last[2])
    return delta > SHAKE_THRESHOLD


_shake = ShakeState()
",
        threshold = SHAKE_THRESHOLD
    )
}

fn helper_source(helper: Helper) -> String {
    match helper {
        Helper::ToneFor => TONE_FOR_HELPER.to_string(),
        Helper::Shake => shake_helper(),
    }
}

/// A linked program with its delimited regions located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledProgram {
    source: String,
    helpers: Range<usize>,
    user_code: Range<usize>,
}

impl CompiledProgram {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn into_source(self) -> String {
        self.source
    }

    /// Exactly the generator output (trailing whitespace trimmed).
    pub fn user_code(&self) -> &str {
        &self.source[self.user_code.clone()]
    }

    pub fn helpers(&self) -> &str {
        &self.source[self.helpers.clone()]
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// SHA-256 of the source, lowercase hex.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.source.as_bytes()))
    }
}

/// Link generated statements into a complete program.
pub fn link(code: &GeneratedCode) -> CompiledProgram {
    let body = code.body.trim_end();
    let requirements = &code.requirements;

    let mut source = String::from("import board\n");
    for import in &requirements.imports {
        source.push_str("import ");
        source.push_str(import.module());
        source.push('\n');
    }
    source.push_str("\nboard.init()\n\n");

    source.push_str(HELPERS_BEGIN);
    source.push('\n');
    let helpers_start = source.len();
    let helpers = requirements
        .helpers
        .iter()
        .map(|h| helper_source(*h))
        .collect::<Vec<_>>()
        .join("\n\n");
    source.push_str(&helpers);
    let helpers_end = source.len();
    if !helpers.is_empty() {
        source.push('\n');
    }
    source.push_str(HELPERS_END);
    source.push_str("\n\n");

    source.push_str(USER_CODE_BEGIN);
    source.push('\n');
    let user_start = source.len();
    source.push_str(body);
    let user_end = source.len();
    if !body.is_empty() {
        source.push('\n');
    }
    source.push_str(USER_CODE_END);
    source.push_str("\n\n");
    source.push_str(TICK_LOOP);

    tracing::debug!(
        "Linked program: {} bytes, {} imports, {} helpers",
        source.len(),
        requirements.imports.len(),
        requirements.helpers.len()
    );

    CompiledProgram {
        source,
        helpers: helpers_start..helpers_end,
        user_code: user_start..user_end,
    }
}

/// Generate and link in one step.
pub fn compile(graph: &BlockGraph) -> CompiledProgram {
    link(&codegen::generate(graph))
}

/// Parse editor JSON, then compile it.
pub fn compile_json(json: &str) -> Result<CompiledProgram, GraphError> {
    Ok(compile(&BlockGraph::from_json(json)?))
}

/// The user-code region of a linked source, if both markers are present.
///
/// Markers only count when they fill a whole line.
pub fn extract_user_code(source: &str) -> Option<&str> {
    let begin = marker_line(source, USER_CODE_BEGIN, 0)?;
    let end = marker_line(source, USER_CODE_END, begin.end)?;
    let region = &source[begin.end..end.start];
    Some(region.strip_suffix('\n').unwrap_or(region))
}

/// Byte range of the first line at or after `from` that is exactly `marker`.
fn marker_line(source: &str, marker: &str, from: usize) -> Option<Range<usize>> {
    let mut pos = from;
    for line in source[from..].split_inclusive('\n') {
        let end = pos + line.len();
        if line.strip_suffix('\n').unwrap_or(line) == marker {
            return Some(pos..end);
        }
        pos = end;
    }
    None
}
