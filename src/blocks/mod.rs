//! Block registry: the closed catalog of block kinds the editor can place.
//!
//! Every kind is a variant of [`BlockKind`]; adding a kind means adding a
//! variant, which makes every `match` over kinds (definition, code
//! generation) fail to compile until the new kind is handled.

pub mod model;

use serde::{Deserialize, Serialize};

pub use model::{BlockGraph, BlockInstance, Binding, FieldValue, GraphError};

/// Editor toolbox category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Display,
    Sound,
    Input,
    Light,
    Timing,
    Motion,
    Math,
    Logic,
    Control,
    Text,
}

/// Visual connection shape: statement blocks stack, value blocks plug in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Statement,
    Value { output: ValueType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Number,
    Text,
    Boolean,
    Any,
}

/// What a socket accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SocketKind {
    /// A value socket; `default` is substituted when nothing is plugged in.
    Value { check: ValueType, default: &'static str },
    /// A nested statement chain (loop or branch body).
    Statements,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SocketSpec {
    pub name: &'static str,
    pub kind: SocketKind,
}

/// A literal field on the block face (dropdown, number box).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Documented value used when the field is missing or out of range.
    pub default: &'static str,
    pub choices: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockDefinition {
    pub kind: BlockKind,
    pub category: Category,
    pub shape: Shape,
    pub label: &'static str,
    pub fields: &'static [FieldSpec],
    pub sockets: &'static [SocketSpec],
}

impl BlockDefinition {
    pub fn socket(&self, name: &str) -> Option<&SocketSpec> {
        self.sockets.iter().find(|s| s.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    DisplayText,
    DisplayClear,
    DisplayRect,
    DisplayCircle,
    DisplayNumber,
    PlayTone,
    StopSound,
    ButtonPressed,
    SetLed,
    WaitMs,
    AccelRead,
    ShakeDetected,
    RandomInt,
    Number,
    Text,
    Boolean,
    Arithmetic,
    Compare,
    LogicOp,
    LogicNot,
    Negate,
    IfElse,
    RepeatTimes,
    PrintLine,
}

const fn value(name: &'static str, check: ValueType, default: &'static str) -> SocketSpec {
    SocketSpec { name, kind: SocketKind::Value { check, default } }
}

const fn statements(name: &'static str) -> SocketSpec {
    SocketSpec { name, kind: SocketKind::Statements }
}

const fn field(name: &'static str, default: &'static str, choices: &'static [&'static str]) -> FieldSpec {
    FieldSpec { name, default, choices }
}

pub const COLORS: &[&str] = &["white", "black", "red", "green", "blue", "yellow", "cyan", "magenta"];
pub const BUTTONS: &[&str] = &["A", "B"];
pub const AXES: &[&str] = &["x", "y", "z"];
pub const ARITHMETIC_OPS: &[&str] = &["ADD", "MINUS", "MULTIPLY", "DIVIDE", "FLOOR_DIVIDE", "MODULO", "POWER"];
pub const COMPARE_OPS: &[&str] = &["EQ", "NEQ", "LT", "LTE", "GT", "GTE"];
pub const LOGIC_OPS: &[&str] = &["AND", "OR"];

const STATEMENT: Shape = Shape::Statement;
const NUMBER: Shape = Shape::Value { output: ValueType::Number };
const BOOLEAN: Shape = Shape::Value { output: ValueType::Boolean };
const TEXT: Shape = Shape::Value { output: ValueType::Text };
const FLAGS: &[&str] = &["true", "false"];

const fn def(
    kind: BlockKind,
    category: Category,
    shape: Shape,
    label: &'static str,
    fields: &'static [FieldSpec],
    sockets: &'static [SocketSpec],
) -> BlockDefinition {
    BlockDefinition { kind, category, shape, label, fields, sockets }
}

const DISPLAY_TEXT: BlockDefinition = def(
    BlockKind::DisplayText,
    Category::Display,
    STATEMENT,
    "show text %TEXT at x %X y %Y",
    &[field("COLOR", "white", COLORS)],
    &[
        value("TEXT", ValueType::Any, "\"\""),
        value("X", ValueType::Number, "0"),
        value("Y", ValueType::Number, "0"),
    ],
);
const DISPLAY_CLEAR: BlockDefinition = def(
    BlockKind::DisplayClear,
    Category::Display,
    STATEMENT,
    "clear screen",
    &[field("COLOR", "black", COLORS)],
    &[],
);
const DISPLAY_RECT: BlockDefinition = def(
    BlockKind::DisplayRect,
    Category::Display,
    STATEMENT,
    "draw rectangle x %X y %Y width %W height %H",
    &[field("COLOR", "white", COLORS), field("FILL", "false", FLAGS)],
    &[
        value("X", ValueType::Number, "0"),
        value("Y", ValueType::Number, "0"),
        value("W", ValueType::Number, "10"),
        value("H", ValueType::Number, "10"),
    ],
);
const DISPLAY_CIRCLE: BlockDefinition = def(
    BlockKind::DisplayCircle,
    Category::Display,
    STATEMENT,
    "draw circle x %X y %Y radius %R",
    &[field("COLOR", "white", COLORS), field("FILL", "false", FLAGS)],
    &[
        value("X", ValueType::Number, "0"),
        value("Y", ValueType::Number, "0"),
        value("R", ValueType::Number, "10"),
    ],
);
const DISPLAY_NUMBER: BlockDefinition = def(
    BlockKind::DisplayNumber,
    Category::Display,
    STATEMENT,
    "show number %VALUE at x %X y %Y",
    &[field("COLOR", "white", COLORS)],
    &[
        value("VALUE", ValueType::Number, "0"),
        value("X", ValueType::Number, "0"),
        value("Y", ValueType::Number, "0"),
    ],
);
const PLAY_TONE: BlockDefinition = def(
    BlockKind::PlayTone,
    Category::Sound,
    STATEMENT,
    "play tone %FREQUENCY Hz for %DURATION ms",
    &[],
    &[
        value("FREQUENCY", ValueType::Number, "440"),
        value("DURATION", ValueType::Number, "0"),
    ],
);
const STOP_SOUND: BlockDefinition =
    def(BlockKind::StopSound, Category::Sound, STATEMENT, "stop sound", &[], &[]);
const BUTTON_PRESSED: BlockDefinition = def(
    BlockKind::ButtonPressed,
    Category::Input,
    BOOLEAN,
    "button %BUTTON pressed",
    &[field("BUTTON", "A", BUTTONS)],
    &[],
);
const SET_LED: BlockDefinition = def(
    BlockKind::SetLed,
    Category::Light,
    STATEMENT,
    "set light to %COLOR",
    &[field("COLOR", "green", COLORS)],
    &[],
);
const WAIT_MS: BlockDefinition = def(
    BlockKind::WaitMs,
    Category::Timing,
    STATEMENT,
    "wait %MS ms",
    &[],
    &[value("MS", ValueType::Number, "1000")],
);
const ACCEL_READ: BlockDefinition = def(
    BlockKind::AccelRead,
    Category::Motion,
    NUMBER,
    "acceleration %AXIS",
    &[field("AXIS", "x", AXES)],
    &[],
);
const SHAKE_DETECTED: BlockDefinition =
    def(BlockKind::ShakeDetected, Category::Motion, BOOLEAN, "shake happened", &[], &[]);
const RANDOM_INT: BlockDefinition = def(
    BlockKind::RandomInt,
    Category::Math,
    NUMBER,
    "random integer from %FROM to %TO",
    &[],
    &[value("FROM", ValueType::Number, "1"), value("TO", ValueType::Number, "10")],
);
const NUMBER_LITERAL: BlockDefinition =
    def(BlockKind::Number, Category::Math, NUMBER, "%NUM", &[field("NUM", "0", &[])], &[]);
const TEXT_LITERAL: BlockDefinition =
    def(BlockKind::Text, Category::Text, TEXT, "\"%TEXT\"", &[field("TEXT", "", &[])], &[]);
const BOOLEAN_LITERAL: BlockDefinition = def(
    BlockKind::Boolean,
    Category::Logic,
    BOOLEAN,
    "%BOOL",
    &[field("BOOL", "true", FLAGS)],
    &[],
);
const ARITHMETIC: BlockDefinition = def(
    BlockKind::Arithmetic,
    Category::Math,
    NUMBER,
    "%A %OP %B",
    &[field("OP", "ADD", ARITHMETIC_OPS)],
    &[value("A", ValueType::Number, "0"), value("B", ValueType::Number, "0")],
);
const COMPARE: BlockDefinition = def(
    BlockKind::Compare,
    Category::Logic,
    BOOLEAN,
    "%A %OP %B",
    &[field("OP", "EQ", COMPARE_OPS)],
    &[value("A", ValueType::Any, "0"), value("B", ValueType::Any, "0")],
);
const LOGIC_OP: BlockDefinition = def(
    BlockKind::LogicOp,
    Category::Logic,
    BOOLEAN,
    "%A %OP %B",
    &[field("OP", "AND", LOGIC_OPS)],
    &[value("A", ValueType::Boolean, "False"), value("B", ValueType::Boolean, "False")],
);
const LOGIC_NOT: BlockDefinition = def(
    BlockKind::LogicNot,
    Category::Logic,
    BOOLEAN,
    "not %BOOL",
    &[],
    &[value("BOOL", ValueType::Boolean, "True")],
);
const NEGATE: BlockDefinition = def(
    BlockKind::Negate,
    Category::Math,
    NUMBER,
    "- %NUM",
    &[],
    &[value("NUM", ValueType::Number, "0")],
);
const IF_ELSE: BlockDefinition = def(
    BlockKind::IfElse,
    Category::Control,
    STATEMENT,
    "if %IF do %DO else %ELSE",
    &[],
    &[value("IF", ValueType::Boolean, "False"), statements("DO"), statements("ELSE")],
);
const REPEAT_TIMES: BlockDefinition = def(
    BlockKind::RepeatTimes,
    Category::Control,
    STATEMENT,
    "repeat %TIMES times %DO",
    &[],
    &[value("TIMES", ValueType::Number, "10"), statements("DO")],
);
const PRINT_LINE: BlockDefinition = def(
    BlockKind::PrintLine,
    Category::Text,
    STATEMENT,
    "print %VALUE",
    &[],
    &[value("VALUE", ValueType::Any, "\"\"")],
);

impl BlockKind {
    pub const ALL: &'static [BlockKind] = &[
        BlockKind::DisplayText,
        BlockKind::DisplayClear,
        BlockKind::DisplayRect,
        BlockKind::DisplayCircle,
        BlockKind::DisplayNumber,
        BlockKind::PlayTone,
        BlockKind::StopSound,
        BlockKind::ButtonPressed,
        BlockKind::SetLed,
        BlockKind::WaitMs,
        BlockKind::AccelRead,
        BlockKind::ShakeDetected,
        BlockKind::RandomInt,
        BlockKind::Number,
        BlockKind::Text,
        BlockKind::Boolean,
        BlockKind::Arithmetic,
        BlockKind::Compare,
        BlockKind::LogicOp,
        BlockKind::LogicNot,
        BlockKind::Negate,
        BlockKind::IfElse,
        BlockKind::RepeatTimes,
        BlockKind::PrintLine,
    ];

    pub fn definition(self) -> &'static BlockDefinition {
        match self {
            BlockKind::DisplayText => &DISPLAY_TEXT,
            BlockKind::DisplayClear => &DISPLAY_CLEAR,
            BlockKind::DisplayRect => &DISPLAY_RECT,
            BlockKind::DisplayCircle => &DISPLAY_CIRCLE,
            BlockKind::DisplayNumber => &DISPLAY_NUMBER,
            BlockKind::PlayTone => &PLAY_TONE,
            BlockKind::StopSound => &STOP_SOUND,
            BlockKind::ButtonPressed => &BUTTON_PRESSED,
            BlockKind::SetLed => &SET_LED,
            BlockKind::WaitMs => &WAIT_MS,
            BlockKind::AccelRead => &ACCEL_READ,
            BlockKind::ShakeDetected => &SHAKE_DETECTED,
            BlockKind::RandomInt => &RANDOM_INT,
            BlockKind::Number => &NUMBER_LITERAL,
            BlockKind::Text => &TEXT_LITERAL,
            BlockKind::Boolean => &BOOLEAN_LITERAL,
            BlockKind::Arithmetic => &ARITHMETIC,
            BlockKind::Compare => &COMPARE,
            BlockKind::LogicOp => &LOGIC_OP,
            BlockKind::LogicNot => &LOGIC_NOT,
            BlockKind::Negate => &NEGATE,
            BlockKind::IfElse => &IF_ELSE,
            BlockKind::RepeatTimes => &REPEAT_TIMES,
            BlockKind::PrintLine => &PRINT_LINE,
        }
    }

    pub fn is_statement(self) -> bool {
        matches!(self.definition().shape, Shape::Statement)
    }
}

/// Every block definition, in toolbox order.
pub fn registry() -> Vec<&'static BlockDefinition> {
    BlockKind::ALL.iter().map(|k| k.definition()).collect()
}
