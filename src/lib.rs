//! blocklink: compiles visual block programs to MicroPython and drives the board
//! over USB serial (firmware flashing, live terminal).

pub mod blocks;
pub mod bridge;
pub mod codegen;
pub mod config;
pub mod firmware;
pub mod hardware;
pub mod linker;
pub mod web;

pub use blocks::{BlockGraph, BlockInstance, BlockKind};
pub use bridge::{BridgeError, BridgeHandle, BridgeState};
pub use config::{load_config, Config};
pub use linker::{compile, compile_json, CompiledProgram};
