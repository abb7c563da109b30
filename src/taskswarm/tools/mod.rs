//! Sandbox tools that stand in for provider-native capabilities.

pub mod browser;
pub mod code_interpreter;

pub use browser::{register_sandbox_browser, SandboxBrowser, SANDBOX_BROWSER_TOOL};
pub use code_interpreter::{
    register_sandbox_code_interpreter, SandboxCodeInterpreter, SANDBOX_CODE_INTERPRETER_TOOL,
};
