pub mod definition;
pub mod installer;

pub use definition::{load_tool_definitions, FileCopy, Platform, StepKind, ToolDefinition};
pub use installer::{detect_platform, install_tools};
