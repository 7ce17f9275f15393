//! Action model for the remote computer
//!
//! Pure data and validation, no I/O. Every payload that reaches the channel
//! passes through [`validate`] first; anything naming a tool outside the fixed
//! union is returned as an [`ExtensionCall`] for the side channel instead.

pub mod types;
pub mod validate;

pub use types::{
    Action, BashParams, ComputerAction, Coordinate, EditorCommand, ExtensionCall,
    ValidatedAction, BASH_TOOL, COMPUTER_TOOL, EDITOR_TOOL, FIXED_TOOLS,
};
pub use validate::{validate, validate_call, ValidationError};
