// src/codegen/fragment.rs - Generated fragments, precedence and literal formatting

/// Python operator precedence, tightest first.
///
/// The derived ordering is what parenthesization compares: a fragment is
/// wrapped when its precedence is greater (looser) than the bound its
/// position allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    Atomic,
    /// Calls, attribute access and subscripts.
    Call,
    Exponent,
    /// Unary `-` and `+`.
    Unary,
    Multiplicative,
    Additive,
    Relational,
    LogicalNot,
    LogicalAnd,
    LogicalOr,
    /// Argument lists and statement-level positions accept anything.
    None,
}

impl Precedence {
    /// The next tighter class, used for the non-associative side of an operator.
    pub fn tighter(self) -> Precedence {
        match self {
            Precedence::Atomic | Precedence::Call => Precedence::Atomic,
            Precedence::Exponent => Precedence::Call,
            Precedence::Unary => Precedence::Exponent,
            Precedence::Multiplicative => Precedence::Unary,
            Precedence::Additive => Precedence::Multiplicative,
            Precedence::Relational => Precedence::Additive,
            Precedence::LogicalNot => Precedence::Relational,
            Precedence::LogicalAnd => Precedence::LogicalNot,
            Precedence::LogicalOr => Precedence::LogicalAnd,
            Precedence::None => Precedence::LogicalOr,
        }
    }
}

/// Output of one value-block generator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub code: String,
    pub precedence: Precedence,
}

impl Fragment {
    pub fn new(code: impl Into<String>, precedence: Precedence) -> Self {
        Self { code: code.into(), precedence }
    }

    pub fn atomic(code: impl Into<String>) -> Self {
        Self::new(code, Precedence::Atomic)
    }

    pub fn call(code: impl Into<String>) -> Self {
        Self::new(code, Precedence::Call)
    }

    /// Code for a position that accepts at most `bound`, parenthesized if needed.
    pub fn fit(self, bound: Precedence) -> String {
        if self.precedence > bound {
            format!("({})", self.code)
        } else {
            self.code
        }
    }
}

/// Python source for a number. Integral values print without a fraction.
pub fn number_literal(n: f64) -> Fragment {
    let code = if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    };
    if n < 0.0 {
        Fragment::new(code, Precedence::Unary)
    } else {
        Fragment::atomic(code)
    }
}

/// Python source for a double-quoted string.
pub fn string_literal(s: &str) -> Fragment {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // Keeps text from ever forming a comment marker line.
            '#' => out.push_str("\\x23"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    Fragment::atomic(out)
}

pub fn bool_literal(b: bool) -> Fragment {
    Fragment::atomic(if b { "True" } else { "False" })
}
