//! Tool capabilities callable by the assistant.
//!
//! Each tool declares whether it must wait for a human decision before it
//! runs. The per-turn [`ToolSet`] merges tools from several sources.

mod error;
mod http_post;
mod time;
mod toolset;
mod traits;

pub use error::{Result, ToolError};
pub use http_post::HttpPostTool;
pub use time::CurrentTimeTool;
pub use toolset::{StaticToolSource, ToolSet, ToolSource};
pub use traits::{Tool, ToolSpec, optional_string, require_string, to_llm_tool_def};
