//! 工具层：Tool trait、注册表 / 只读目录、调用器与内置工具（echo、shell）

pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod shell;

pub use echo::EchoTool;
pub use executor::{RegistryInvoker, ToolInvoker};
pub use registry::{Tool, ToolCatalog, ToolOutput, ToolRegistry, ToolSpec};
pub use schema::proposal_schema_json;
pub use shell::ShellTool;
