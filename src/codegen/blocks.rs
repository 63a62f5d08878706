// src/codegen/blocks.rs - Per-kind MicroPython generation
use super::fragment::{bool_literal, number_literal, string_literal, Fragment, Precedence};
use super::{block_id, Generator, Helper, Import};
use crate::blocks::{Binding, BlockInstance, BlockKind, Shape, ValueType};

/// Accepted literal range for a numeric socket.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LiteralRange {
    min: f64,
    max: f64,
    integral: bool,
}

const fn range(min: f64, max: f64, integral: bool) -> Option<LiteralRange> {
    Some(LiteralRange { min, max, integral })
}

fn literal_range(kind: BlockKind, socket: &str) -> Option<LiteralRange> {
    match (kind, socket) {
        (BlockKind::PlayTone, "FREQUENCY") => range(20.0, 20_000.0, true),
        (BlockKind::PlayTone, "DURATION") => range(0.0, 60_000.0, true),
        (BlockKind::WaitMs, "MS") => range(0.0, 600_000.0, true),
        (BlockKind::RepeatTimes, "TIMES") => range(0.0, 100_000.0, true),
        (BlockKind::RandomInt, "FROM" | "TO") => range(-1e9, 1e9, true),
        (BlockKind::DisplayRect, "W" | "H") | (BlockKind::DisplayCircle, "R") => range(0.0, 1_000.0, true),
        (
            BlockKind::DisplayText | BlockKind::DisplayRect | BlockKind::DisplayCircle | BlockKind::DisplayNumber,
            "X" | "Y",
        ) => range(-1_000.0, 1_000.0, true),
        _ => None,
    }
}

/// Whether a numeric literal is acceptable for `socket` of `kind`.
pub fn literal_in_range(kind: BlockKind, socket: &str, n: f64) -> bool {
    match literal_range(kind, socket) {
        Some(r) => n >= r.min && n <= r.max && (!r.integral || n.fract() == 0.0),
        None => n.is_finite(),
    }
}

/// Whether a value block is known to evaluate to a Python `int`.
fn produces_integer(block: &BlockInstance) -> bool {
    match block.kind {
        BlockKind::RandomInt => true,
        BlockKind::Number => block
            .field("NUM")
            .is_none_or(|v| v.as_number().is_none_or(|n| n.fract() == 0.0)),
        BlockKind::Negate => match block.input("NUM") {
            None => true,
            Some(Binding::Literal(v)) => v.as_number().is_none_or(|n| n.fract() == 0.0),
            Some(Binding::Block(child)) => produces_integer(child),
        },
        // Statement children are replaced by the integer socket default.
        kind => kind.is_statement(),
    }
}

fn arithmetic_operator(op: &str) -> (&'static str, Precedence, Precedence, Precedence) {
    use Precedence::*;
    match op {
        "MINUS" => ("-", Additive, Additive, Multiplicative),
        "MULTIPLY" => ("*", Multiplicative, Multiplicative, Unary),
        "DIVIDE" => ("/", Multiplicative, Multiplicative, Unary),
        "FLOOR_DIVIDE" => ("//", Multiplicative, Multiplicative, Unary),
        "MODULO" => ("%", Multiplicative, Multiplicative, Unary),
        // Right-associative and binds tighter than a unary minus on its left.
        "POWER" => ("**", Exponent, Call, Unary),
        _ => ("+", Additive, Additive, Multiplicative),
    }
}

fn compare_operator(op: &str) -> &'static str {
    match op {
        "NEQ" => "!=",
        "LT" => "<",
        "LTE" => "<=",
        "GT" => ">",
        "GTE" => ">=",
        _ => "==",
    }
}

fn color_constant(color: &str) -> String {
    format!("board.{}", color.to_ascii_uppercase())
}

impl Generator {
    /// Terminated source lines for one block at statement position.
    pub(super) fn statement(&mut self, block: &BlockInstance) -> String {
        match block.kind {
            BlockKind::DisplayText => {
                let mut args = vec![self.text_input(block, "TEXT")];
                args.extend(self.coordinates(block, &["X", "Y"]));
                args.extend(self.color_override(block));
                format!("board.display.text({})\n", args.join(", "))
            }
            BlockKind::DisplayClear => {
                let color = self.color_override(block).unwrap_or_default();
                format!("board.display.clear({})\n", color)
            }
            BlockKind::DisplayRect => {
                let method = if self.filled(block) { "fill_rect" } else { "rect" };
                let mut args = self.coordinates(block, &["X", "Y", "W", "H"]);
                args.extend(self.color_override(block));
                format!("board.display.{}({})\n", method, args.join(", "))
            }
            BlockKind::DisplayCircle => {
                let method = if self.filled(block) { "fill_circle" } else { "circle" };
                let mut args = self.coordinates(block, &["X", "Y", "R"]);
                args.extend(self.color_override(block));
                format!("board.display.{}({})\n", method, args.join(", "))
            }
            BlockKind::DisplayNumber => {
                let mut args = vec![self.input(block, "VALUE").fit(Precedence::None)];
                args.extend(self.coordinates(block, &["X", "Y"]));
                args.extend(self.color_override(block));
                format!("board.display.number({})\n", args.join(", "))
            }
            BlockKind::PlayTone => {
                let frequency = self.integer_input(block, "FREQUENCY").fit(Precedence::None);
                let duration = self.integer_input(block, "DURATION").fit(Precedence::None);
                if duration == "0" {
                    format!("board.speaker.tone({})\n", frequency)
                } else {
                    self.requirements.helper(Helper::ToneFor);
                    format!("play_tone_for({}, {})\n", frequency, duration)
                }
            }
            BlockKind::StopSound => "board.speaker.off()\n".to_string(),
            BlockKind::SetLed => {
                format!("board.led.set({})\n", color_constant(self.choice(block, "COLOR")))
            }
            BlockKind::WaitMs => {
                self.requirements.import(Import::Time);
                let ms = self.integer_input(block, "MS").fit(Precedence::None);
                format!("time.sleep_ms({})\n", ms)
            }
            BlockKind::IfElse => {
                let condition = self.input(block, "IF").fit(Precedence::None);
                let mut out = format!("if {}:\n{}", condition, self.body(block, "DO"));
                if let Some(Binding::Block(_)) = block.input("ELSE") {
                    out.push_str("else:\n");
                    out.push_str(&self.body(block, "ELSE"));
                }
                out
            }
            BlockKind::RepeatTimes => {
                let times = self.integer_input(block, "TIMES").fit(Precedence::None);
                format!("for _ in range({}):\n{}", times, self.body(block, "DO"))
            }
            BlockKind::PrintLine => {
                format!("print({})\n", self.input(block, "VALUE").fit(Precedence::None))
            }
            BlockKind::ButtonPressed
            | BlockKind::AccelRead
            | BlockKind::ShakeDetected
            | BlockKind::RandomInt
            | BlockKind::Number
            | BlockKind::Text
            | BlockKind::Boolean
            | BlockKind::Arithmetic
            | BlockKind::Compare
            | BlockKind::LogicOp
            | BlockKind::LogicNot
            | BlockKind::Negate => {
                // Loose value blocks become expression statements.
                format!("{}\n", self.value(block).code)
            }
        }
    }

    /// Expression for one value block.
    pub(super) fn value(&mut self, block: &BlockInstance) -> Fragment {
        match block.kind {
            BlockKind::ButtonPressed => {
                let button = string_literal(self.choice(block, "BUTTON"));
                Fragment::call(format!("board.button_pressed({})", button.code))
            }
            BlockKind::AccelRead => {
                let index = match self.choice(block, "AXIS") {
                    "y" => 1,
                    "z" => 2,
                    _ => 0,
                };
                Fragment::call(format!("board.accel()[{}]", index))
            }
            BlockKind::ShakeDetected => {
                self.requirements.helper(Helper::Shake);
                Fragment::call("shake_happened(_shake)")
            }
            BlockKind::RandomInt => {
                self.requirements.import(Import::Random);
                let from = self.integer_input(block, "FROM").fit(Precedence::None);
                let to = self.integer_input(block, "TO").fit(Precedence::None);
                let (from, to) = match (from.parse::<i64>(), to.parse::<i64>()) {
                    (Ok(a), Ok(b)) if a > b => {
                        tracing::warn!("Block {} has FROM > TO; bounds swapped", block_id(block));
                        (to, from)
                    }
                    _ => (from, to),
                };
                Fragment::call(format!("random.randint({}, {})", from, to))
            }
            BlockKind::Number => match block.field("NUM") {
                None => number_literal(0.0),
                Some(v) => v.as_number().map(number_literal).unwrap_or_else(|| {
                    tracing::warn!("Block {} has non-numeric NUM {:?}; using 0", block_id(block), v);
                    number_literal(0.0)
                }),
            },
            BlockKind::Text => {
                string_literal(&block.field("TEXT").map(|v| v.as_text()).unwrap_or_default())
            }
            BlockKind::Boolean => bool_literal(self.choice(block, "BOOL") == "true"),
            BlockKind::Arithmetic => {
                let (symbol, precedence, left, right) = arithmetic_operator(self.choice(block, "OP"));
                self.binary(block, symbol, precedence, left, right)
            }
            BlockKind::Compare => {
                let symbol = compare_operator(self.choice(block, "OP"));
                let operand = Precedence::Relational.tighter();
                self.binary(block, symbol, Precedence::Relational, operand, operand)
            }
            BlockKind::LogicOp => {
                let (symbol, precedence) = match self.choice(block, "OP") {
                    "OR" => ("or", Precedence::LogicalOr),
                    _ => ("and", Precedence::LogicalAnd),
                };
                self.binary(block, symbol, precedence, precedence, precedence.tighter())
            }
            BlockKind::LogicNot => {
                let operand = self.input(block, "BOOL").fit(Precedence::LogicalNot);
                Fragment::new(format!("not {}", operand), Precedence::LogicalNot)
            }
            BlockKind::Negate => {
                let operand = self.input(block, "NUM").fit(Precedence::Unary);
                Fragment::new(format!("-{}", operand), Precedence::Unary)
            }
            BlockKind::DisplayText
            | BlockKind::DisplayClear
            | BlockKind::DisplayRect
            | BlockKind::DisplayCircle
            | BlockKind::DisplayNumber
            | BlockKind::PlayTone
            | BlockKind::StopSound
            | BlockKind::SetLed
            | BlockKind::WaitMs
            | BlockKind::IfElse
            | BlockKind::RepeatTimes
            | BlockKind::PrintLine => {
                tracing::warn!("Statement block {} used as a value", block_id(block));
                Fragment::atomic("None")
            }
        }
    }

    fn binary(
        &mut self,
        block: &BlockInstance,
        symbol: &str,
        precedence: Precedence,
        left: Precedence,
        right: Precedence,
    ) -> Fragment {
        let a = self.input(block, "A").fit(left);
        let b = self.input(block, "B").fit(right);
        Fragment::new(format!("{} {} {}", a, symbol, b), precedence)
    }

    /// Text argument; non-text children are converted with `str()`.
    fn text_input(&mut self, block: &BlockInstance, socket: &str) -> String {
        let is_text = match block.input(socket) {
            Some(Binding::Block(child)) => {
                child.kind.definition().shape == Shape::Value { output: ValueType::Text }
            }
            _ => true,
        };
        let code = match block.input(socket) {
            Some(Binding::Literal(v)) => string_literal(&v.as_text()),
            _ => self.input(block, socket),
        };
        if is_text {
            code.fit(Precedence::None)
        } else {
            format!("str({})", code.fit(Precedence::None))
        }
    }

    /// Numeric argument that must be an `int` on the device.
    fn integer_input(&mut self, block: &BlockInstance, socket: &str) -> Fragment {
        let wrap = matches!(block.input(socket), Some(Binding::Block(child)) if !produces_integer(child));
        let code = self.input(block, socket);
        if wrap {
            Fragment::call(format!("int({})", code.fit(Precedence::None)))
        } else {
            code
        }
    }

    fn coordinates(&mut self, block: &BlockInstance, sockets: &[&str]) -> Vec<String> {
        sockets
            .iter()
            .map(|s| self.integer_input(block, s).fit(Precedence::None))
            .collect()
    }

    /// Colour constant, omitted when it equals the block's default colour.
    fn color_override(&self, block: &BlockInstance) -> Option<String> {
        let color = self.choice(block, "COLOR");
        let default = block.kind.definition().field("COLOR").map(|f| f.default);
        (Some(color) != default).then(|| color_constant(color))
    }

    fn filled(&self, block: &BlockInstance) -> bool {
        self.choice(block, "FILL") == "true"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_ranges() {
        assert!(literal_in_range(BlockKind::PlayTone, "FREQUENCY", 440.0));
        assert!(!literal_in_range(BlockKind::PlayTone, "FREQUENCY", 19.0));
        assert!(!literal_in_range(BlockKind::PlayTone, "FREQUENCY", 20_001.0));
        assert!(!literal_in_range(BlockKind::WaitMs, "MS", 2.5));
        assert!(literal_in_range(BlockKind::Arithmetic, "A", 2.5));
        assert!(literal_in_range(BlockKind::DisplayText, "X", -5.0));
    }

    #[test]
    fn test_produces_integer() {
        assert!(produces_integer(&BlockInstance::new(BlockKind::RandomInt)));
        assert!(produces_integer(&BlockInstance::new(BlockKind::Number).with_field("NUM", 3i64)));
        assert!(!produces_integer(&BlockInstance::new(BlockKind::Number).with_field("NUM", 2.5)));
        assert!(!produces_integer(&BlockInstance::new(BlockKind::AccelRead)));
        let negated = BlockInstance::new(BlockKind::Negate)
            .with_input("NUM", BlockInstance::new(BlockKind::RandomInt));
        assert!(produces_integer(&negated));
    }

    #[test]
    fn test_operator_tables() {
        assert_eq!(arithmetic_operator("POWER").0, "**");
        assert_eq!(arithmetic_operator("bogus").0, "+");
        assert_eq!(compare_operator("GTE"), ">=");
        assert_eq!(color_constant("white"), "board.WHITE");
    }
}
